pub mod config;
pub mod ebay;
pub mod mercari;

use crate::error::SyncError;
use crate::models::{Comparable, Listing, Platform};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Listing payload handed to adapters. Built from the canonical record once
/// per pass so every platform sees the same snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSpec {
    pub sku: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub currency: String,
    pub condition: Option<String>,
    pub photos: Vec<String>,
}

impl ListingSpec {
    pub fn from_listing(listing: &Listing) -> Self {
        Self {
            sku: listing.id.to_string(),
            title: listing.title.clone(),
            description: listing.description.clone(),
            price: listing.price,
            currency: listing.currency.clone(),
            condition: listing.condition.clone(),
            photos: listing.photos.clone(),
        }
    }

    /// Caller-data checks that must pass before anything reaches a platform.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.title.trim().is_empty() {
            return Err(SyncError::ValidationFailed {
                detail: "listing title is empty".into(),
            });
        }
        if self.photos.iter().all(|p| p.trim().is_empty()) || self.photos.is_empty() {
            return Err(SyncError::ValidationFailed {
                detail: "listing has no photos".into(),
            });
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(SyncError::ValidationFailed {
                detail: format!("listing price {} is not positive", self.price),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub condition: Option<String>,
}

/// Adapter-level failure, already stripped of platform-native wording.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("rejected by platform: {0}")]
    Rejected(String),
    #[error("credentials not accepted")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("remote listing not found: {0}")]
    NotFound(String),
}

impl PlatformError {
    /// Fold into the shared taxonomy. Rejections are caller-data problems;
    /// everything else is a bounded-retryable platform failure.
    pub fn into_sync_error(self, platform: Platform) -> SyncError {
        match self {
            PlatformError::Rejected(detail) => SyncError::ValidationFailed {
                detail: format!("{platform}: {detail}"),
            },
            other => SyncError::PlatformRequestFailed {
                platform,
                detail: other.to_string(),
            },
        }
    }
}

/// Uniform capability set every marketplace module implements. The
/// orchestrator and resolver only ever talk through this trait.
#[async_trait]
pub trait Marketplace: Send + Sync {
    fn platform(&self) -> Platform;

    async fn create_listing(
        &self,
        access_token: &str,
        spec: &ListingSpec,
    ) -> Result<String, PlatformError>;

    async fn update_listing(
        &self,
        access_token: &str,
        external_id: &str,
        spec: &ListingSpec,
    ) -> Result<(), PlatformError>;

    async fn end_listing(
        &self,
        access_token: &str,
        external_id: &str,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn search_comparables(
        &self,
        access_token: &str,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Comparable>, PlatformError>;
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn Marketplace>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry wired with the real adapters.
    pub fn production() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ebay::EbayAdapter::new()));
        registry.register(Arc::new(mercari::MercariAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn Marketplace>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn Marketplace>, SyncError> {
        self.adapters
            .get(&platform)
            .cloned()
            .ok_or(SyncError::PlatformRequestFailed {
                platform,
                detail: "no adapter registered".into(),
            })
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}
