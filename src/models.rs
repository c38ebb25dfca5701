use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// External selling channel. Adding a marketplace means adding a variant here
/// plus one adapter implementation; nothing else branches on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Ebay,
    Mercari,
}

impl Platform {
    pub fn code(&self) -> &'static str {
        match self {
            Platform::Ebay => "EBAY",
            Platform::Mercari => "MERCARI",
        }
    }

    pub fn from_code(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "EBAY" => Some(Platform::Ebay),
            "MERCARI" => Some(Platform::Mercari),
            _ => None,
        }
    }

    pub fn all() -> &'static [Platform] {
        &[Platform::Ebay, Platform::Mercari]
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Draft,
    Active,
    Sold,
    Ended,
}

/// Per-platform synchronization state machine:
/// `pending -> {synced, error}`, `{synced, error} -> conflict`,
/// `conflict -> {synced, cancelled}`. `error` re-enters `pending` for the
/// next pass, or `conflict` when its row sold anyway and the sale is
/// contested; everything else goes through `pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Error,
    Conflict,
    Cancelled,
}

impl SyncStatus {
    pub fn can_transition(self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Synced)
                | (Pending, Error)
                | (Synced, Pending)
                | (Synced, Conflict)
                | (Error, Pending)
                | (Error, Conflict)
                | (Conflict, Synced)
                | (Conflict, Cancelled)
        )
    }
}

/// Canonical internal record for one physical item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub currency: String,
    pub condition: Option<String>,
    pub photos: Vec<String>,
    pub status: ListingStatus,
    pub sold_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One listing's presence on one platform. At most one row per listing may
/// ever hold terminal `status = sold`; the conflict resolver enforces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformListing {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub platform: Platform,
    pub external_id: Option<String>,
    pub status: ListingStatus,
    pub sync_status: SyncStatus,
    pub sold_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PlatformListing {
    pub fn new(listing_id: Uuid, platform: Platform) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            listing_id,
            platform,
            external_id: None,
            status: ListingStatus::Draft,
            sync_status: SyncStatus::Pending,
            sold_at: None,
            last_synced_at: None,
            error: None,
            created_at: now,
        }
    }

    /// Sale instant used by conflict resolution: the platform-reported time
    /// when present, otherwise the row's creation time.
    pub fn effective_sale_time(&self) -> DateTime<Utc> {
        self.sold_at.unwrap_or(self.created_at)
    }
}

/// Per-seller, per-platform OAuth credential. Mutated only by the token
/// lifecycle manager; deactivated, never deleted, when refresh is impossible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub platform: Platform,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub connected: bool,
    pub active: bool,
    pub auto_list: bool,
    pub updated_at: DateTime<Utc>,
}

/// What one orchestration pass did on one platform.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformOutcome {
    pub platform: Platform,
    pub action: SyncAction,
    pub sync_status: SyncStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Skipped,
}

/// Result of one orchestration pass over a whole listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub listing_id: Uuid,
    pub outcomes: Vec<PlatformOutcome>,
    pub conflicts: Vec<Platform>,
}

/// One comparable sale/offer observed on a marketplace, used as pricing
/// evidence within a single research pass.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparable {
    pub external_id: String,
    pub platform: Platform,
    pub title: Option<String>,
    pub price: f64,
    pub currency: String,
    pub condition: Option<String>,
    pub category_id: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceRange {
    pub low: f64,
    pub high: f64,
}

/// Aggregated pricing suggestion. `median`, `mean` and `price_range` ride
/// along with the blended price so callers can audit the suggestion.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedPrice {
    pub price: f64,
    pub currency: String,
    pub confidence: Confidence,
    pub sample_size: usize,
    pub median: Option<f64>,
    pub mean: Option<f64>,
    pub price_range: Option<PriceRange>,
    pub discount_applied: Option<f64>,
    pub dominant_category_id: Option<String>,
    pub reason: Option<String>,
}

/// Uniform HTTP error body: a stable machine code plus optional human detail.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
