//! Shared fakes for unit tests. Compiled only for `cargo test`.

use crate::marketplaces::{ListingSpec, Marketplace, PlatformError, SearchFilters};
use crate::models::{Comparable, Listing, ListingStatus, MarketplaceAccount, Platform};
use crate::tokens::{RefreshError, RefreshedToken, TokenRefresher};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Refresher that always hands back the same fresh pair.
pub struct StaticRefresher;

#[async_trait]
impl TokenRefresher for StaticRefresher {
    async fn refresh(
        &self,
        _platform: Platform,
        _refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshError> {
        Ok(RefreshedToken {
            access_token: "test-access".into(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::hours(4),
        })
    }
}

pub fn account(user_id: Uuid, platform: Platform) -> MarketplaceAccount {
    MarketplaceAccount {
        id: Uuid::new_v4(),
        user_id,
        platform,
        access_token: format!("{}-token", platform.code().to_lowercase()),
        refresh_token: Some("refresh".into()),
        expires_at: Utc::now() + chrono::Duration::hours(2),
        connected: true,
        active: true,
        auto_list: true,
        updated_at: Utc::now(),
    }
}

pub fn listing(user_id: Uuid) -> Listing {
    let now = Utc::now();
    Listing {
        id: Uuid::new_v4(),
        user_id,
        title: "DeWalt DCD791 20V drill driver".into(),
        description: "Lightly used, with battery".into(),
        price: 79.99,
        currency: "USD".into(),
        condition: Some("used_good".into()),
        photos: vec!["https://img.example.com/drill.jpg".into()],
        status: ListingStatus::Active,
        sold_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn comparable(external_id: &str, price: f64) -> Comparable {
    Comparable {
        external_id: external_id.to_string(),
        platform: Platform::Ebay,
        title: Some("comparable".into()),
        price,
        currency: "USD".into(),
        condition: None,
        category_id: None,
        observed_at: Utc::now(),
    }
}

/// Scripted in-memory marketplace. Records every call and answers from
/// whatever the test loaded into it.
pub struct FakeMarketplace {
    platform: Platform,
    pub next_external_id: Mutex<u64>,
    pub created: Mutex<Vec<ListingSpec>>,
    pub updated: Mutex<Vec<(String, ListingSpec)>>,
    pub ended: Mutex<Vec<(String, String)>>,
    pub search_queries: Mutex<Vec<String>>,
    pub search_results: Mutex<HashMap<String, Vec<Comparable>>>,
    pub failing_queries: Mutex<Vec<String>>,
    pub fail_writes_with: Mutex<Option<PlatformError>>,
    pub fail_end_with: Mutex<Option<PlatformError>>,
    pub write_delay: Mutex<Option<Duration>>,
}

impl FakeMarketplace {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            next_external_id: Mutex::new(1),
            created: Mutex::new(Vec::new()),
            updated: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            search_queries: Mutex::new(Vec::new()),
            search_results: Mutex::new(HashMap::new()),
            failing_queries: Mutex::new(Vec::new()),
            fail_writes_with: Mutex::new(None),
            fail_end_with: Mutex::new(None),
            write_delay: Mutex::new(None),
        }
    }

    pub fn stub_search(&self, query: &str, results: Vec<Comparable>) {
        self.search_results
            .lock()
            .expect("search_results lock")
            .insert(query.to_string(), results);
    }

    pub fn fail_query(&self, query: &str) {
        self.failing_queries
            .lock()
            .expect("failing_queries lock")
            .push(query.to_string());
    }

    pub fn fail_writes(&self, error: PlatformError) {
        *self.fail_writes_with.lock().expect("fail_writes lock") = Some(error);
    }

    pub fn fail_end(&self, error: PlatformError) {
        *self.fail_end_with.lock().expect("fail_end lock") = Some(error);
    }

    pub fn slow_writes(&self, delay: Duration) {
        *self.write_delay.lock().expect("write_delay lock") = Some(delay);
    }

    pub fn ended_ids(&self) -> Vec<String> {
        self.ended
            .lock()
            .expect("ended lock")
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn write_failure(&self) -> Option<PlatformError> {
        self.fail_writes_with
            .lock()
            .expect("fail_writes lock")
            .as_ref()
            .map(clone_error)
    }

    async fn maybe_delay(&self) {
        let delay = *self.write_delay.lock().expect("write_delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn clone_error(error: &PlatformError) -> PlatformError {
    match error {
        PlatformError::Request(detail) => PlatformError::Request(detail.clone()),
        PlatformError::Rejected(detail) => PlatformError::Rejected(detail.clone()),
        PlatformError::Unauthorized => PlatformError::Unauthorized,
        PlatformError::RateLimited => PlatformError::RateLimited,
        PlatformError::NotFound(detail) => PlatformError::NotFound(detail.clone()),
    }
}

#[async_trait]
impl Marketplace for FakeMarketplace {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn create_listing(
        &self,
        _access_token: &str,
        spec: &ListingSpec,
    ) -> Result<String, PlatformError> {
        self.maybe_delay().await;
        if let Some(error) = self.write_failure() {
            return Err(error);
        }
        self.created.lock().expect("created lock").push(spec.clone());
        let mut next = self.next_external_id.lock().expect("next_external_id lock");
        let id = format!("{}-{}", self.platform.code().to_lowercase(), *next);
        *next += 1;
        Ok(id)
    }

    async fn update_listing(
        &self,
        _access_token: &str,
        external_id: &str,
        spec: &ListingSpec,
    ) -> Result<(), PlatformError> {
        self.maybe_delay().await;
        if let Some(error) = self.write_failure() {
            return Err(error);
        }
        self.updated
            .lock()
            .expect("updated lock")
            .push((external_id.to_string(), spec.clone()));
        Ok(())
    }

    async fn end_listing(
        &self,
        _access_token: &str,
        external_id: &str,
        reason: &str,
    ) -> Result<(), PlatformError> {
        if let Some(error) = self
            .fail_end_with
            .lock()
            .expect("fail_end lock")
            .as_ref()
            .map(clone_error)
        {
            return Err(error);
        }
        self.ended
            .lock()
            .expect("ended lock")
            .push((external_id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn search_comparables(
        &self,
        _access_token: &str,
        query: &str,
        _filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Comparable>, PlatformError> {
        self.search_queries
            .lock()
            .expect("search_queries lock")
            .push(query.to_string());
        if self
            .failing_queries
            .lock()
            .expect("failing_queries lock")
            .iter()
            .any(|failing| failing == query)
        {
            return Err(PlatformError::Request("scripted failure".into()));
        }
        let mut results = self
            .search_results
            .lock()
            .expect("search_results lock")
            .get(query)
            .cloned()
            .unwrap_or_default();
        results.truncate(limit);
        Ok(results)
    }
}
