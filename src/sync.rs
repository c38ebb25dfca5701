use crate::conflict::ConflictResolver;
use crate::error::SyncError;
use crate::marketplaces::{AdapterRegistry, ListingSpec};
use crate::models::{
    ListingStatus, Platform, PlatformOutcome, SyncAction, SyncReport, SyncStatus,
};
use crate::store::{Store, StoreError};
use crate::tokens::TokenManager;
use futures_util::future::join_all;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

static PLATFORM_CALL_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    env::var("PLATFORM_CALL_TIMEOUT_SECS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(20)
});

/// Upper bound on any single outbound marketplace call, so a hung platform
/// can never hold a listing's sync lock indefinitely.
pub(crate) fn platform_call_timeout() -> Duration {
    Duration::from_secs(*PLATFORM_CALL_TIMEOUT_SECS)
}

/// In-process per-listing mutual exclusion. A second pass for the same
/// listing is rejected, not queued; callers re-trigger later.
#[derive(Clone, Default)]
pub struct SyncGate {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl SyncGate {
    pub fn acquire(&self, listing_id: Uuid) -> Result<SyncPermit, SyncError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| SyncError::SyncInProgress { listing_id })?;
        if !held.insert(listing_id) {
            return Err(SyncError::SyncInProgress { listing_id });
        }
        Ok(SyncPermit {
            held: self.held.clone(),
            listing_id,
        })
    }
}

/// Releases the listing's slot on drop, on every exit path.
pub struct SyncPermit {
    held: Arc<Mutex<HashSet<Uuid>>>,
    listing_id: Uuid,
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.listing_id);
        }
    }
}

/// Orchestrates one listing's outward sync: per-platform create/update fanned
/// out concurrently, per-platform outcomes recorded on the rows, then a
/// post-pass scan for simultaneous sales.
pub struct SyncEngine {
    store: Store,
    adapters: AdapterRegistry,
    tokens: Arc<TokenManager>,
    resolver: ConflictResolver,
    gate: SyncGate,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        adapters: AdapterRegistry,
        tokens: Arc<TokenManager>,
        resolver: ConflictResolver,
    ) -> Self {
        Self {
            store,
            adapters,
            tokens,
            resolver,
            gate: SyncGate::default(),
        }
    }

    pub async fn sync_listing(&self, listing_id: Uuid) -> Result<SyncReport, SyncError> {
        let _permit = self.gate.acquire(listing_id)?;
        let started = std::time::Instant::now();

        let listing = match self.store.listing(listing_id).await {
            Ok(listing) => listing,
            Err(StoreError::ListingNotFound(id)) => {
                return Err(SyncError::ValidationFailed {
                    detail: format!("listing {id} not found"),
                });
            }
            Err(err) => {
                return Err(SyncError::ValidationFailed {
                    detail: err.to_string(),
                });
            }
        };
        if listing.status == ListingStatus::Draft {
            return Err(SyncError::ValidationFailed {
                detail: "listing is a draft; activate it before syncing".into(),
            });
        }

        let mut outcomes = Vec::new();
        if listing.status == ListingStatus::Active {
            let spec = ListingSpec::from_listing(&listing);
            spec.validate()?;

            let targets: Vec<Platform> = self
                .store
                .accounts_for_user(listing.user_id)
                .await
                .into_iter()
                .filter(|account| account.connected && account.active && account.auto_list)
                .map(|account| account.platform)
                .collect();
            info!(
                target = "syndic.sync",
                listing_id = %listing_id,
                targets = ?targets,
                "sync pass started"
            );

            let passes = targets
                .iter()
                .map(|platform| self.sync_one(listing_id, listing.user_id, &spec, *platform));
            outcomes = join_all(passes).await;
        }

        let conflicts = self.detect_and_resolve(listing_id, listing.status).await?;
        crate::metrics::stage_elapsed("sync_pass", started.elapsed().as_millis());
        Ok(SyncReport {
            listing_id,
            outcomes,
            conflicts,
        })
    }

    /// One platform's slice of the pass. Failures land on the row and in the
    /// outcome; they never abort the other platforms.
    async fn sync_one(
        &self,
        listing_id: Uuid,
        user_id: Uuid,
        spec: &ListingSpec,
        platform: Platform,
    ) -> PlatformOutcome {
        let row = self.store.ensure_row(listing_id, platform).await;
        match row.status {
            ListingStatus::Sold | ListingStatus::Ended => {
                return skipped(platform, row.sync_status);
            }
            ListingStatus::Draft | ListingStatus::Active => {}
        }
        match row.sync_status {
            SyncStatus::Conflict | SyncStatus::Cancelled => {
                return skipped(platform, row.sync_status);
            }
            SyncStatus::Synced | SyncStatus::Error => {
                if let Err(err) = self
                    .store
                    .transition_sync(listing_id, platform, SyncStatus::Pending)
                    .await
                {
                    warn!(
                        target = "syndic.sync",
                        listing_id = %listing_id,
                        platform = %platform,
                        error = %err,
                        "could not re-enter pending"
                    );
                    return skipped(platform, row.sync_status);
                }
            }
            SyncStatus::Pending => {}
        }

        let token = match self.tokens.ensure_valid_token(user_id, platform).await {
            Ok(token) => token,
            Err(err) => return self.record_failure(listing_id, platform, SyncAction::Skipped, err).await,
        };
        let adapter = match self.adapters.get(platform) {
            Ok(adapter) => adapter,
            Err(err) => return self.record_failure(listing_id, platform, SyncAction::Skipped, err).await,
        };

        match &row.external_id {
            Some(external_id) => {
                let call = adapter.update_listing(&token, external_id, spec);
                match timeout(platform_call_timeout(), call).await {
                    Ok(Ok(())) => self.record_success(listing_id, platform, SyncAction::Updated, None).await,
                    Ok(Err(err)) => {
                        self.record_failure(
                            listing_id,
                            platform,
                            SyncAction::Updated,
                            err.into_sync_error(platform),
                        )
                        .await
                    }
                    Err(_) => self.record_timeout(listing_id, platform, SyncAction::Updated).await,
                }
            }
            None => {
                let call = adapter.create_listing(&token, spec);
                match timeout(platform_call_timeout(), call).await {
                    Ok(Ok(external_id)) => {
                        self.record_success(listing_id, platform, SyncAction::Created, Some(external_id))
                            .await
                    }
                    Ok(Err(err)) => {
                        self.record_failure(
                            listing_id,
                            platform,
                            SyncAction::Created,
                            err.into_sync_error(platform),
                        )
                        .await
                    }
                    Err(_) => self.record_timeout(listing_id, platform, SyncAction::Created).await,
                }
            }
        }
    }

    /// Post-pass scan: two or more sold rows is a conflict for the resolver;
    /// exactly one is the normal sale teardown.
    async fn detect_and_resolve(
        &self,
        listing_id: Uuid,
        listing_status: ListingStatus,
    ) -> Result<Vec<Platform>, SyncError> {
        let rows = self.store.rows_for_listing(listing_id).await;
        let sold: Vec<Platform> = rows
            .iter()
            .filter(|row| row.status == ListingStatus::Sold)
            .map(|row| row.platform)
            .collect();

        if sold.len() >= 2 {
            warn!(
                target = "syndic.sync",
                listing_id = %listing_id,
                platforms = ?sold,
                "simultaneous sale detected"
            );
            self.resolver.resolve(listing_id, &sold).await?;
            return Ok(sold);
        }
        if sold.len() == 1 && listing_status != ListingStatus::Sold {
            self.resolver.settle_single_sale(listing_id, sold[0]).await?;
        }
        Ok(Vec::new())
    }

    async fn record_success(
        &self,
        listing_id: Uuid,
        platform: Platform,
        action: SyncAction,
        external_id: Option<String>,
    ) -> PlatformOutcome {
        if let Err(err) = self.store.record_synced(listing_id, platform, external_id).await {
            warn!(
                target = "syndic.sync",
                listing_id = %listing_id,
                platform = %platform,
                error = %err,
                "could not record successful sync"
            );
        }
        PlatformOutcome {
            platform,
            action,
            sync_status: SyncStatus::Synced,
            error_kind: None,
            error: None,
            remediation: None,
        }
    }

    async fn record_failure(
        &self,
        listing_id: Uuid,
        platform: Platform,
        action: SyncAction,
        err: SyncError,
    ) -> PlatformOutcome {
        warn!(
            target = "syndic.sync",
            listing_id = %listing_id,
            platform = %platform,
            kind = ?err.kind(),
            error = %err,
            "platform sync failed"
        );
        if let Err(store_err) = self
            .store
            .record_error(listing_id, platform, &err.to_string())
            .await
        {
            warn!(
                target = "syndic.sync",
                listing_id = %listing_id,
                platform = %platform,
                error = %store_err,
                "could not record sync failure"
            );
        }
        PlatformOutcome {
            platform,
            action,
            sync_status: SyncStatus::Error,
            error_kind: Some(err.kind()),
            error: Some(err.to_string()),
            remediation: Some(err.remediation().to_string()),
        }
    }

    async fn record_timeout(
        &self,
        listing_id: Uuid,
        platform: Platform,
        action: SyncAction,
    ) -> PlatformOutcome {
        let err = SyncError::PlatformRequestFailed {
            platform,
            detail: format!("timed out after {}s", *PLATFORM_CALL_TIMEOUT_SECS),
        };
        self.record_failure(listing_id, platform, action, err).await
    }
}

fn skipped(platform: Platform, sync_status: SyncStatus) -> PlatformOutcome {
    PlatformOutcome {
        platform,
        action: SyncAction::Skipped,
        sync_status,
        error_kind: None,
        error: None,
        remediation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::EventBus;
    use crate::marketplaces::PlatformError;
    use crate::testutil::{self, FakeMarketplace, StaticRefresher};
    use chrono::{TimeZone, Utc};

    struct Harness {
        store: Store,
        engine: Arc<SyncEngine>,
        ebay: Arc<FakeMarketplace>,
        mercari: Arc<FakeMarketplace>,
        user_id: Uuid,
    }

    async fn harness() -> Harness {
        let store = Store::new(EventBus::default());
        let user_id = Uuid::new_v4();
        store
            .put_account(testutil::account(user_id, Platform::Ebay))
            .await;
        store
            .put_account(testutil::account(user_id, Platform::Mercari))
            .await;

        let ebay = Arc::new(FakeMarketplace::new(Platform::Ebay));
        let mercari = Arc::new(FakeMarketplace::new(Platform::Mercari));
        let mut adapters = AdapterRegistry::new();
        adapters.register(ebay.clone());
        adapters.register(mercari.clone());

        let tokens = Arc::new(TokenManager::new(store.clone(), Arc::new(StaticRefresher)));
        let resolver = ConflictResolver::new(store.clone(), adapters.clone(), tokens.clone());
        let engine = Arc::new(SyncEngine::new(store.clone(), adapters, tokens, resolver));
        Harness {
            store,
            engine,
            ebay,
            mercari,
            user_id,
        }
    }

    async fn active_listing(h: &Harness) -> Uuid {
        let listing = testutil::listing(h.user_id);
        let id = listing.id;
        h.store.put_listing(listing).await;
        id
    }

    #[tokio::test]
    async fn first_pass_creates_and_second_updates() {
        let h = harness().await;
        let listing_id = active_listing(&h).await;

        let report = h.engine.sync_listing(listing_id).await.expect("first pass");
        assert_eq!(report.outcomes.len(), 2);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.action == SyncAction::Created && o.sync_status == SyncStatus::Synced));
        assert!(report.conflicts.is_empty());

        let rows = h.store.rows_for_listing(listing_id).await;
        assert!(rows.iter().all(|row| row.external_id.is_some()
            && row.sync_status == SyncStatus::Synced
            && row.last_synced_at.is_some()));

        let report = h.engine.sync_listing(listing_id).await.expect("second pass");
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.action == SyncAction::Updated && o.sync_status == SyncStatus::Synced));
        assert_eq!(h.ebay.created.lock().expect("lock").len(), 1);
        assert_eq!(h.ebay.updated.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn one_platform_failing_does_not_abort_the_other() {
        let h = harness().await;
        let listing_id = active_listing(&h).await;
        h.ebay.fail_writes(PlatformError::Request("HTTP 503".into()));

        let report = h.engine.sync_listing(listing_id).await.expect("pass");
        let ebay = report
            .outcomes
            .iter()
            .find(|o| o.platform == Platform::Ebay)
            .expect("ebay outcome");
        let mercari = report
            .outcomes
            .iter()
            .find(|o| o.platform == Platform::Mercari)
            .expect("mercari outcome");

        assert_eq!(ebay.sync_status, SyncStatus::Error);
        assert_eq!(ebay.error_kind, Some(ErrorKind::PlatformRequestFailed));
        assert_eq!(ebay.remediation.as_deref(), Some("retry later"));
        assert_eq!(mercari.sync_status, SyncStatus::Synced);

        let row = h
            .store
            .row(listing_id, Platform::Ebay)
            .await
            .expect("ebay row");
        assert_eq!(row.sync_status, SyncStatus::Error);
        assert!(row.error.as_deref().expect("detail").contains("HTTP 503"));
    }

    #[tokio::test]
    async fn failed_platform_recovers_on_next_pass() {
        let h = harness().await;
        let listing_id = active_listing(&h).await;
        h.ebay.fail_writes(PlatformError::Request("HTTP 503".into()));
        h.engine.sync_listing(listing_id).await.expect("failing pass");

        *h.ebay.fail_writes_with.lock().expect("lock") = None;
        let report = h.engine.sync_listing(listing_id).await.expect("recovery");
        let ebay = report
            .outcomes
            .iter()
            .find(|o| o.platform == Platform::Ebay)
            .expect("ebay outcome");
        assert_eq!(ebay.sync_status, SyncStatus::Synced);
        assert_eq!(ebay.action, SyncAction::Created);

        let row = h.store.row(listing_id, Platform::Ebay).await.expect("row");
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn rejected_listing_surfaces_validation_kind_on_that_platform() {
        let h = harness().await;
        let listing_id = active_listing(&h).await;
        h.mercari
            .fail_writes(PlatformError::Rejected("photo too small".into()));

        let report = h.engine.sync_listing(listing_id).await.expect("pass");
        let mercari = report
            .outcomes
            .iter()
            .find(|o| o.platform == Platform::Mercari)
            .expect("mercari outcome");
        assert_eq!(mercari.error_kind, Some(ErrorKind::ValidationFailed));
        assert_eq!(
            mercari.remediation.as_deref(),
            Some("fix the listing data and sync again")
        );
    }

    #[tokio::test]
    async fn invalid_listing_is_rejected_before_any_platform_call() {
        let h = harness().await;
        let mut listing = testutil::listing(h.user_id);
        listing.photos.clear();
        let listing_id = listing.id;
        h.store.put_listing(listing).await;

        let err = h
            .engine
            .sync_listing(listing_id)
            .await
            .expect_err("validation");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(h.store.rows_for_listing(listing_id).await.is_empty());
        assert!(h.ebay.created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn draft_listing_is_rejected() {
        let h = harness().await;
        let mut listing = testutil::listing(h.user_id);
        listing.status = ListingStatus::Draft;
        let listing_id = listing.id;
        h.store.put_listing(listing).await;

        let err = h.engine.sync_listing(listing_id).await.expect_err("draft");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn unknown_listing_is_rejected() {
        let h = harness().await;
        let err = h
            .engine
            .sync_listing(Uuid::new_v4())
            .await
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn seller_with_no_auto_list_accounts_gets_empty_report() {
        let h = harness().await;
        let mut ebay = testutil::account(h.user_id, Platform::Ebay);
        ebay.auto_list = false;
        let mut mercari = testutil::account(h.user_id, Platform::Mercari);
        mercari.active = false;
        h.store.put_account(ebay).await;
        h.store.put_account(mercari).await;
        let listing_id = active_listing(&h).await;

        let report = h.engine.sync_listing(listing_id).await.expect("pass");
        assert!(report.outcomes.is_empty());
        assert!(h.store.rows_for_listing(listing_id).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_pass_is_rejected_without_mutation() {
        let h = harness().await;
        let listing_id = active_listing(&h).await;
        h.ebay.slow_writes(Duration::from_millis(200));
        h.mercari.slow_writes(Duration::from_millis(200));

        let first = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.sync_listing(listing_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = h.engine.sync_listing(listing_id).await;
        let err = second.expect_err("second pass must be rejected");
        assert_eq!(err.kind(), ErrorKind::SyncInProgress);
        assert!(err.is_retryable());

        let report = first.await.expect("join").expect("first pass");
        assert_eq!(report.outcomes.len(), 2);
        // Exactly one create per platform proves the rejected pass touched
        // nothing.
        assert_eq!(h.ebay.created.lock().expect("lock").len(), 1);
        assert_eq!(h.mercari.created.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn lock_is_released_after_a_failing_pass() {
        let h = harness().await;
        let mut listing = testutil::listing(h.user_id);
        listing.photos.clear();
        let listing_id = listing.id;
        h.store.put_listing(listing).await;

        assert!(h.engine.sync_listing(listing_id).await.is_err());
        // A second call must not see SyncInProgress.
        let err = h.engine.sync_listing(listing_id).await.expect_err("still invalid");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn simultaneous_sales_are_detected_and_resolved_in_the_pass() {
        let h = harness().await;
        let listing_id = active_listing(&h).await;
        h.engine.sync_listing(listing_id).await.expect("initial pass");

        let sold_first = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("time");
        let sold_second = Utc.with_ymd_and_hms(2026, 3, 1, 10, 3, 0).single().expect("time");
        h.store
            .record_sale(listing_id, Platform::Ebay, sold_first)
            .await
            .expect("ebay sale");
        h.store
            .record_sale(listing_id, Platform::Mercari, sold_second)
            .await
            .expect("mercari sale");

        let report = h.engine.sync_listing(listing_id).await.expect("conflict pass");
        assert_eq!(report.conflicts, vec![Platform::Ebay, Platform::Mercari]);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.action == SyncAction::Skipped));

        let listing = h.store.listing(listing_id).await.expect("listing");
        assert_eq!(listing.status, ListingStatus::Sold);
        assert_eq!(listing.sold_at, Some(sold_first));

        let ebay_row = h.store.row(listing_id, Platform::Ebay).await.expect("row");
        assert_eq!(ebay_row.status, ListingStatus::Sold);
        let mercari_row = h
            .store
            .row(listing_id, Platform::Mercari)
            .await
            .expect("row");
        assert_eq!(mercari_row.status, ListingStatus::Ended);
        assert_eq!(mercari_row.sync_status, SyncStatus::Cancelled);
        assert_eq!(h.mercari.ended_ids().len(), 1);
    }

    #[tokio::test]
    async fn single_sale_triggers_teardown_of_other_platforms() {
        let h = harness().await;
        let listing_id = active_listing(&h).await;
        h.engine.sync_listing(listing_id).await.expect("initial pass");

        let sold_at = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).single().expect("time");
        h.store
            .record_sale(listing_id, Platform::Mercari, sold_at)
            .await
            .expect("sale");

        let report = h.engine.sync_listing(listing_id).await.expect("teardown pass");
        assert!(report.conflicts.is_empty());

        let listing = h.store.listing(listing_id).await.expect("listing");
        assert_eq!(listing.status, ListingStatus::Sold);
        assert_eq!(listing.sold_at, Some(sold_at));
        let ebay_row = h.store.row(listing_id, Platform::Ebay).await.expect("row");
        assert_eq!(ebay_row.status, ListingStatus::Ended);
        assert_eq!(h.ebay.ended_ids().len(), 1);

        // The teardown pass updated eBay once before the scan ended it; a
        // later pass on the sold listing is a pure no-op.
        let updates_after_teardown = h.ebay.updated.lock().expect("lock").len();
        let report = h.engine.sync_listing(listing_id).await.expect("noop pass");
        assert!(report.outcomes.is_empty());
        assert_eq!(
            h.ebay.updated.lock().expect("lock").len(),
            updates_after_teardown
        );
    }
}
