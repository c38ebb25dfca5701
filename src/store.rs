use crate::events::{EventBus, SyncEvent};
use crate::models::{
    Listing, ListingStatus, MarketplaceAccount, Platform, PlatformListing, SyncStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing {0} not found")]
    ListingNotFound(Uuid),
    #[error("no {platform} row for listing {listing_id}")]
    RowNotFound { listing_id: Uuid, platform: Platform },
    #[error("no {platform} account for user {user_id}")]
    AccountNotFound { user_id: Uuid, platform: Platform },
    #[error("refused sync status transition {from:?} -> {to:?}")]
    TransitionRefused { from: SyncStatus, to: SyncStatus },
}

/// Process-local state store. Listings, per-platform rows and marketplace
/// accounts live behind one async lock; every sync-status write goes through
/// the state machine and lands on the event bus.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    events: EventBus,
}

#[derive(Default)]
struct Inner {
    listings: HashMap<Uuid, Listing>,
    rows: HashMap<(Uuid, Platform), PlatformListing>,
    accounts: HashMap<(Uuid, Platform), MarketplaceAccount>,
}

impl Store {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn put_listing(&self, listing: Listing) {
        let mut inner = self.inner.write().await;
        inner.listings.insert(listing.id, listing);
    }

    pub async fn listing(&self, id: Uuid) -> Result<Listing, StoreError> {
        let inner = self.inner.read().await;
        inner
            .listings
            .get(&id)
            .cloned()
            .ok_or(StoreError::ListingNotFound(id))
    }

    pub async fn mark_listing_sold(
        &self,
        id: Uuid,
        sold_at: DateTime<Utc>,
    ) -> Result<Listing, StoreError> {
        let mut inner = self.inner.write().await;
        let listing = inner
            .listings
            .get_mut(&id)
            .ok_or(StoreError::ListingNotFound(id))?;
        listing.status = ListingStatus::Sold;
        listing.sold_at = Some(sold_at);
        listing.updated_at = Utc::now();
        Ok(listing.clone())
    }

    /// All platform rows for a listing, ordered by platform so every pass
    /// observes them in the same order.
    pub async fn rows_for_listing(&self, listing_id: Uuid) -> Vec<PlatformListing> {
        let inner = self.inner.read().await;
        let mut rows: Vec<PlatformListing> = inner
            .rows
            .values()
            .filter(|row| row.listing_id == listing_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.platform);
        rows
    }

    pub async fn row(&self, listing_id: Uuid, platform: Platform) -> Option<PlatformListing> {
        let inner = self.inner.read().await;
        inner.rows.get(&(listing_id, platform)).cloned()
    }

    /// Returns the existing row or creates a pending one the first time a
    /// platform is targeted.
    pub async fn ensure_row(&self, listing_id: Uuid, platform: Platform) -> PlatformListing {
        let mut inner = self.inner.write().await;
        inner
            .rows
            .entry((listing_id, platform))
            .or_insert_with(|| PlatformListing::new(listing_id, platform))
            .clone()
    }

    pub async fn transition_sync(
        &self,
        listing_id: Uuid,
        platform: Platform,
        to: SyncStatus,
    ) -> Result<PlatformListing, StoreError> {
        let (row, event) = {
            let mut inner = self.inner.write().await;
            let row = inner
                .rows
                .get_mut(&(listing_id, platform))
                .ok_or(StoreError::RowNotFound {
                    listing_id,
                    platform,
                })?;
            let from = row.sync_status;
            if !from.can_transition(to) {
                return Err(StoreError::TransitionRefused { from, to });
            }
            row.sync_status = to;
            let event = (from != to).then(|| SyncEvent {
                listing_id,
                platform,
                from,
                to,
                at: Utc::now(),
            });
            (row.clone(), event)
        };
        if let Some(event) = event {
            self.events.publish(event);
        }
        Ok(row)
    }

    /// Success path for one outbound call: store the external id when the
    /// platform handed one back, stamp the sync time, clear stale error text,
    /// and move a draft row to active.
    pub async fn record_synced(
        &self,
        listing_id: Uuid,
        platform: Platform,
        external_id: Option<String>,
    ) -> Result<PlatformListing, StoreError> {
        {
            let mut inner = self.inner.write().await;
            let row = inner
                .rows
                .get_mut(&(listing_id, platform))
                .ok_or(StoreError::RowNotFound {
                    listing_id,
                    platform,
                })?;
            if let Some(id) = external_id {
                row.external_id = Some(id);
            }
            if row.status == ListingStatus::Draft {
                row.status = ListingStatus::Active;
            }
            row.last_synced_at = Some(Utc::now());
            row.error = None;
        }
        self.transition_sync(listing_id, platform, SyncStatus::Synced)
            .await
    }

    pub async fn record_error(
        &self,
        listing_id: Uuid,
        platform: Platform,
        detail: &str,
    ) -> Result<PlatformListing, StoreError> {
        {
            let mut inner = self.inner.write().await;
            let row = inner
                .rows
                .get_mut(&(listing_id, platform))
                .ok_or(StoreError::RowNotFound {
                    listing_id,
                    platform,
                })?;
            row.error = Some(detail.to_string());
        }
        self.transition_sync(listing_id, platform, SyncStatus::Error)
            .await
    }

    /// Order-import path: a marketplace reported this row's item as sold.
    /// Re-reports keep the earliest sale time so the conflict winner never
    /// drifts later.
    pub async fn record_sale(
        &self,
        listing_id: Uuid,
        platform: Platform,
        sold_at: DateTime<Utc>,
    ) -> Result<PlatformListing, StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner
            .rows
            .get_mut(&(listing_id, platform))
            .ok_or(StoreError::RowNotFound {
                listing_id,
                platform,
            })?;
        row.status = ListingStatus::Sold;
        row.sold_at = Some(match row.sold_at {
            Some(existing) => existing.min(sold_at),
            None => sold_at,
        });
        Ok(row.clone())
    }

    pub async fn mark_row_ended(
        &self,
        listing_id: Uuid,
        platform: Platform,
        error: Option<String>,
    ) -> Result<PlatformListing, StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner
            .rows
            .get_mut(&(listing_id, platform))
            .ok_or(StoreError::RowNotFound {
                listing_id,
                platform,
            })?;
        row.status = ListingStatus::Ended;
        if error.is_some() {
            row.error = error;
        }
        Ok(row.clone())
    }

    pub async fn put_account(&self, account: MarketplaceAccount) {
        let mut inner = self.inner.write().await;
        inner
            .accounts
            .insert((account.user_id, account.platform), account);
    }

    pub async fn account(
        &self,
        user_id: Uuid,
        platform: Platform,
    ) -> Result<MarketplaceAccount, StoreError> {
        let inner = self.inner.read().await;
        inner
            .accounts
            .get(&(user_id, platform))
            .cloned()
            .ok_or(StoreError::AccountNotFound { user_id, platform })
    }

    pub async fn accounts_for_user(&self, user_id: Uuid) -> Vec<MarketplaceAccount> {
        let inner = self.inner.read().await;
        let mut accounts: Vec<MarketplaceAccount> = inner
            .accounts
            .values()
            .filter(|account| account.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|account| account.platform);
        accounts
    }

    /// Persist a refreshed token pair. Platforms that rotate refresh tokens
    /// return a new one; those that do not leave the stored one in place.
    pub async fn save_token_pair(
        &self,
        user_id: Uuid,
        platform: Platform,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<MarketplaceAccount, StoreError> {
        let mut inner = self.inner.write().await;
        let account = inner
            .accounts
            .get_mut(&(user_id, platform))
            .ok_or(StoreError::AccountNotFound { user_id, platform })?;
        account.access_token = access_token;
        if refresh_token.is_some() {
            account.refresh_token = refresh_token;
        }
        account.expires_at = expires_at;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    /// Refresh became impossible; the account stays on record but stops
    /// being a sync target until the user reconnects.
    pub async fn deactivate_account(
        &self,
        user_id: Uuid,
        platform: Platform,
    ) -> Result<MarketplaceAccount, StoreError> {
        let mut inner = self.inner.write().await;
        let account = inner
            .accounts
            .get_mut(&(user_id, platform))
            .ok_or(StoreError::AccountNotFound { user_id, platform })?;
        account.active = false;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn listing(user_id: Uuid) -> Listing {
        let now = Utc::now();
        Listing {
            id: Uuid::new_v4(),
            user_id,
            title: "DeWalt DCD791 drill".into(),
            description: "Lightly used".into(),
            price: 75.0,
            currency: "USD".into(),
            condition: Some("used_good".into()),
            photos: vec!["https://img.example.com/1.jpg".into()],
            status: ListingStatus::Active,
            sold_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn ensure_row_creates_pending_once() {
        let store = Store::new(EventBus::default());
        let listing_id = Uuid::new_v4();
        let first = store.ensure_row(listing_id, Platform::Ebay).await;
        let second = store.ensure_row(listing_id, Platform::Ebay).await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.sync_status, SyncStatus::Pending);
        assert_eq!(store.rows_for_listing(listing_id).await.len(), 1);
    }

    #[tokio::test]
    async fn transition_publishes_event_and_enforces_machine() {
        let store = Store::new(EventBus::default());
        let mut rx = store.events().subscribe();
        let listing_id = Uuid::new_v4();
        store.ensure_row(listing_id, Platform::Ebay).await;

        store
            .transition_sync(listing_id, Platform::Ebay, SyncStatus::Synced)
            .await
            .expect("pending -> synced");
        let event = rx.recv().await.expect("event");
        assert_eq!(event.to, SyncStatus::Synced);

        let refused = store
            .transition_sync(listing_id, Platform::Ebay, SyncStatus::Cancelled)
            .await;
        assert!(matches!(
            refused,
            Err(StoreError::TransitionRefused {
                from: SyncStatus::Synced,
                to: SyncStatus::Cancelled,
            })
        ));
    }

    #[tokio::test]
    async fn identity_transition_publishes_nothing() {
        let store = Store::new(EventBus::default());
        let mut rx = store.events().subscribe();
        let listing_id = Uuid::new_v4();
        store.ensure_row(listing_id, Platform::Ebay).await;
        store
            .transition_sync(listing_id, Platform::Ebay, SyncStatus::Pending)
            .await
            .expect("identity");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn record_synced_activates_draft_row_and_clears_error() {
        let store = Store::new(EventBus::default());
        let listing_id = Uuid::new_v4();
        store.ensure_row(listing_id, Platform::Mercari).await;
        store
            .record_error(listing_id, Platform::Mercari, "HTTP 503")
            .await
            .expect("error recorded");
        store
            .transition_sync(listing_id, Platform::Mercari, SyncStatus::Pending)
            .await
            .expect("error -> pending");

        let row = store
            .record_synced(listing_id, Platform::Mercari, Some("m-123".into()))
            .await
            .expect("synced");
        assert_eq!(row.status, ListingStatus::Active);
        assert_eq!(row.sync_status, SyncStatus::Synced);
        assert_eq!(row.external_id.as_deref(), Some("m-123"));
        assert!(row.error.is_none());
        assert!(row.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn record_sale_keeps_earliest_time() {
        let store = Store::new(EventBus::default());
        let listing_id = Uuid::new_v4();
        store.ensure_row(listing_id, Platform::Ebay).await;
        let early = Utc::now() - Duration::minutes(10);
        let late = Utc::now();

        store
            .record_sale(listing_id, Platform::Ebay, late)
            .await
            .expect("first report");
        let row = store
            .record_sale(listing_id, Platform::Ebay, early)
            .await
            .expect("second report");
        assert_eq!(row.status, ListingStatus::Sold);
        assert_eq!(row.sold_at, Some(early));

        let still_early = store
            .record_sale(listing_id, Platform::Ebay, late)
            .await
            .expect("third report");
        assert_eq!(still_early.sold_at, Some(early));
    }

    #[tokio::test]
    async fn save_token_pair_keeps_old_refresh_token_when_absent() {
        let store = Store::new(EventBus::default());
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .put_account(MarketplaceAccount {
                id: Uuid::new_v4(),
                user_id,
                platform: Platform::Ebay,
                access_token: "old-access".into(),
                refresh_token: Some("keep-me".into()),
                expires_at: now,
                connected: true,
                active: true,
                auto_list: true,
                updated_at: now,
            })
            .await;

        let saved = store
            .save_token_pair(
                user_id,
                Platform::Ebay,
                "new-access".into(),
                None,
                now + Duration::hours(2),
            )
            .await
            .expect("saved");
        assert_eq!(saved.access_token, "new-access");
        assert_eq!(saved.refresh_token.as_deref(), Some("keep-me"));
    }

    #[tokio::test]
    async fn deactivate_keeps_the_record() {
        let store = Store::new(EventBus::default());
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .put_account(MarketplaceAccount {
                id: Uuid::new_v4(),
                user_id,
                platform: Platform::Mercari,
                access_token: "a".into(),
                refresh_token: None,
                expires_at: now,
                connected: true,
                active: true,
                auto_list: false,
                updated_at: now,
            })
            .await;
        let account = store
            .deactivate_account(user_id, Platform::Mercari)
            .await
            .expect("deactivated");
        assert!(!account.active);
        assert!(account.connected);
        assert!(store.account(user_id, Platform::Mercari).await.is_ok());
    }

    #[tokio::test]
    async fn listing_round_trip_and_sold_marking() {
        let store = Store::new(EventBus::default());
        let user_id = Uuid::new_v4();
        let listing = listing(user_id);
        let id = listing.id;
        store.put_listing(listing).await;

        let sold_at = Utc::now() - Duration::minutes(3);
        let updated = store.mark_listing_sold(id, sold_at).await.expect("sold");
        assert_eq!(updated.status, ListingStatus::Sold);
        assert_eq!(updated.sold_at, Some(sold_at));

        let missing = store.listing(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(StoreError::ListingNotFound(_))));
    }
}
