use crate::models::{Platform, SyncStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Emitted whenever a per-platform sync status changes. Consumers that lag
/// behind miss events rather than blocking the writer.
#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub listing_id: Uuid,
    pub platform: Platform,
    pub from: SyncStatus,
    pub to: SyncStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        debug!(
            target = "syndic.events",
            listing_id = %event.listing_id,
            platform = %event.platform,
            from = ?event.from,
            to = ?event.to,
            "sync status changed"
        );
        // Err here just means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
