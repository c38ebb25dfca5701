use crate::error::SyncError;
use crate::marketplaces::AdapterRegistry;
use crate::models::{ListingStatus, Platform, PlatformListing, SyncStatus};
use crate::store::Store;
use crate::sync::platform_call_timeout;
use crate::tokens::TokenManager;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const CONFLICT_REASON: &str = "conflict: sold elsewhere";
const SOLD_ELSEWHERE_REASON: &str = "sold on another marketplace";

/// Outcome of one resolution: the platform whose sale stands, everyone who
/// lost the race, and the sale instant written back to the listing.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub winner: Platform,
    pub losers: Vec<Platform>,
    pub sold_at: DateTime<Utc>,
}

/// Settles the race where one physical item sold on more than one platform.
/// The earliest reported sale wins; local state is always committed even when
/// remote cancellation fails, because local state drives every later pass.
pub struct ConflictResolver {
    store: Store,
    adapters: AdapterRegistry,
    tokens: Arc<TokenManager>,
}

impl ConflictResolver {
    pub fn new(store: Store, adapters: AdapterRegistry, tokens: Arc<TokenManager>) -> Self {
        Self {
            store,
            adapters,
            tokens,
        }
    }

    /// Resolves a simultaneous sale across `platforms`. Deterministic and
    /// order-independent: the winner is the row with the earliest effective
    /// sale time, ties broken by platform code, so resolving twice with the
    /// same inputs picks the same winner.
    pub async fn resolve(
        &self,
        listing_id: Uuid,
        platforms: &[Platform],
    ) -> Result<Resolution, SyncError> {
        let listing = self
            .store
            .listing(listing_id)
            .await
            .map_err(|err| SyncError::ValidationFailed {
                detail: err.to_string(),
            })?;

        let mut rows: Vec<PlatformListing> = Vec::with_capacity(platforms.len());
        for platform in platforms {
            match self.store.row(listing_id, *platform).await {
                Some(row) => rows.push(row),
                None => warn!(
                    target = "syndic.conflict",
                    listing_id = %listing_id,
                    platform = %platform,
                    "conflict set names a platform with no row"
                ),
            }
        }
        if rows.is_empty() {
            return Err(SyncError::ValidationFailed {
                detail: format!("no platform rows to resolve for listing {listing_id}"),
            });
        }
        rows.sort_by_key(|row| (row.effective_sale_time(), row.platform));

        for row in &rows {
            self.try_transition(listing_id, row.platform, SyncStatus::Conflict)
                .await;
        }

        let winner = &rows[0];
        let sold_at = winner.effective_sale_time();
        self.try_transition(listing_id, winner.platform, SyncStatus::Synced)
            .await;

        let mut losers = Vec::with_capacity(rows.len() - 1);
        for loser in &rows[1..] {
            let cancel_error = self
                .end_remote(listing.user_id, loser, CONFLICT_REASON)
                .await;
            if let Err(err) = self
                .store
                .mark_row_ended(listing_id, loser.platform, cancel_error)
                .await
            {
                warn!(
                    target = "syndic.conflict",
                    listing_id = %listing_id,
                    platform = %loser.platform,
                    error = %err,
                    "failed to mark losing row ended"
                );
            }
            self.try_transition(listing_id, loser.platform, SyncStatus::Cancelled)
                .await;
            losers.push(loser.platform);
        }

        self.store
            .mark_listing_sold(listing_id, sold_at)
            .await
            .map_err(|err| SyncError::ValidationFailed {
                detail: err.to_string(),
            })?;

        info!(
            target = "syndic.conflict",
            listing_id = %listing_id,
            winner = %winner.platform,
            losers = ?losers,
            sold_at = %sold_at,
            "simultaneous sale resolved"
        );
        crate::metrics::inc_conflicts(winner.platform.code());
        Ok(Resolution {
            winner: winner.platform,
            losers,
            sold_at,
        })
    }

    /// Normal single-sale teardown: one platform sold the item, so the
    /// listing is marked sold and every other live row is ended.
    pub async fn settle_single_sale(
        &self,
        listing_id: Uuid,
        sold_platform: Platform,
    ) -> Result<Vec<Platform>, SyncError> {
        let listing = self
            .store
            .listing(listing_id)
            .await
            .map_err(|err| SyncError::ValidationFailed {
                detail: err.to_string(),
            })?;
        let rows = self.store.rows_for_listing(listing_id).await;
        let sold_at = rows
            .iter()
            .find(|row| row.platform == sold_platform)
            .map(|row| row.effective_sale_time())
            .unwrap_or_else(Utc::now);

        self.store
            .mark_listing_sold(listing_id, sold_at)
            .await
            .map_err(|err| SyncError::ValidationFailed {
                detail: err.to_string(),
            })?;

        let mut ended = Vec::new();
        for row in rows
            .iter()
            .filter(|row| row.platform != sold_platform)
            .filter(|row| matches!(row.status, ListingStatus::Draft | ListingStatus::Active))
        {
            let cancel_error = self
                .end_remote(listing.user_id, row, SOLD_ELSEWHERE_REASON)
                .await;
            if let Err(err) = self
                .store
                .mark_row_ended(listing_id, row.platform, cancel_error)
                .await
            {
                warn!(
                    target = "syndic.conflict",
                    listing_id = %listing_id,
                    platform = %row.platform,
                    error = %err,
                    "failed to mark row ended after sale"
                );
            }
            ended.push(row.platform);
        }
        if !ended.is_empty() {
            info!(
                target = "syndic.conflict",
                listing_id = %listing_id,
                sold_on = %sold_platform,
                ended = ?ended,
                "remaining platform listings ended after sale"
            );
        }
        Ok(ended)
    }

    /// Best-effort remote cancellation. Returns the failure detail for the
    /// row's audit trail; never blocks committing local state.
    async fn end_remote(
        &self,
        user_id: Uuid,
        row: &PlatformListing,
        reason: &str,
    ) -> Option<String> {
        let Some(external_id) = row.external_id.as_deref() else {
            return None;
        };
        let platform = row.platform;
        let attempt: Result<(), String> = async {
            let token = self
                .tokens
                .ensure_valid_token(user_id, platform)
                .await
                .map_err(|err| err.to_string())?;
            let adapter = self.adapters.get(platform).map_err(|err| err.to_string())?;
            match tokio::time::timeout(
                platform_call_timeout(),
                adapter.end_listing(&token, external_id, reason),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("timed out".into()),
            }
        }
        .await;

        match attempt {
            Ok(()) => None,
            Err(detail) => {
                let unresolved = SyncError::ConflictUnresolved {
                    platform,
                    detail: detail.clone(),
                };
                warn!(
                    target = "syndic.conflict",
                    listing_id = %row.listing_id,
                    platform = %platform,
                    error = %unresolved,
                    "remote cancellation failed; local state committed anyway"
                );
                Some(unresolved.to_string())
            }
        }
    }

    async fn try_transition(&self, listing_id: Uuid, platform: Platform, to: SyncStatus) {
        if let Err(err) = self.store.transition_sync(listing_id, platform, to).await {
            warn!(
                target = "syndic.conflict",
                listing_id = %listing_id,
                platform = %platform,
                error = %err,
                "sync status transition refused during resolution"
            );
        }
    }
}
