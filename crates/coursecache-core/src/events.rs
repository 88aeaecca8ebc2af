//! Events published by the core for observers (UI, logging, tests).

use tokio::sync::broadcast;

use crate::sync::{SyncKind, SyncState};

/// Buffer size for the event channel.
/// Slow observers that fall further behind than this see `Lagged` and skip ahead.
const EVENT_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// Cached responses under `key` were dropped.
    CacheInvalidated { site_id: String, key: String },
    /// A write call was accepted by the server.
    WriteSucceeded { site_id: String, method: String },
    /// A write was stored for later sync instead of being sent.
    ActionQueued {
        site_id: String,
        component: String,
        entity_id: String,
    },
    /// A sync pass finished.
    SyncFinished {
        site_id: String,
        kind: SyncKind,
        state: SyncState,
        synced: usize,
        remaining: usize,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    /// Publish to current subscribers; having none is fine.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
