//! Online/offline write policy.
//!
//! A write goes to the server only when the device is online and nothing is
//! pending for the same entity. Otherwise it joins the queue behind the
//! pending actions so the server sees writes in the order they were made.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use super::{OfflineQueue, PendingAction};
use crate::api::WsError;
use crate::events::{CoreEvent, EventBus};
use crate::network::NetworkMonitor;

/// What happened to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Accepted by the server.
    Sent(Value),
    /// Stored for the next sync.
    Queued(PendingAction),
}

impl SendOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SendOutcome::Queued(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMode {
    Append,
    Replace,
}

/// Applies the send-or-queue policy for one site.
/// Clone is cheap - the queue is shared.
#[derive(Clone)]
pub struct OfflineWriter {
    queue: Arc<OfflineQueue>,
    network: NetworkMonitor,
    events: EventBus,
}

impl OfflineWriter {
    pub fn new(queue: Arc<OfflineQueue>, network: NetworkMonitor, events: EventBus) -> Self {
        Self { queue, network, events }
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Send `payload` through `send`, or queue it behind earlier writes.
    ///
    /// Server rejections are returned and nothing is queued. Network failures,
    /// timeouts and overload queue the write.
    pub async fn send_or_queue<F, Fut>(
        &self,
        component: &str,
        entity_id: &str,
        payload: Value,
        send: F,
    ) -> Result<SendOutcome, WsError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, WsError>>,
    {
        self.write(component, entity_id, payload, send, QueueMode::Append).await
    }

    /// Like `send_or_queue`, but a queued write supersedes whatever is pending
    /// for the entity. For state-replacing writes such as a submission draft.
    pub async fn send_or_replace<F, Fut>(
        &self,
        component: &str,
        entity_id: &str,
        payload: Value,
        send: F,
    ) -> Result<SendOutcome, WsError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, WsError>>,
    {
        self.write(component, entity_id, payload, send, QueueMode::Replace).await
    }

    async fn write<F, Fut>(
        &self,
        component: &str,
        entity_id: &str,
        payload: Value,
        send: F,
        mode: QueueMode,
    ) -> Result<SendOutcome, WsError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, WsError>>,
    {
        // Held until the write is sent or queued, so a concurrent sync of the
        // same entity cannot interleave.
        let lock = self.queue.entity_lock(component, entity_id);
        let guard = lock.lock().await;
        let outcome = self.write_locked(component, entity_id, payload, send, mode).await;
        drop(guard);
        drop(lock);
        self.queue.release_entity_lock(component, entity_id);
        outcome
    }

    async fn write_locked<F, Fut>(
        &self,
        component: &str,
        entity_id: &str,
        payload: Value,
        send: F,
        mode: QueueMode,
    ) -> Result<SendOutcome, WsError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, WsError>>,
    {
        // An unreadable queue may hide pending actions; never send past them.
        let pending = self.queue.has_pending(component, entity_id).unwrap_or_else(|e| {
            warn!(component, entity_id, error = %e, "Cannot check pending actions, queueing");
            true
        });
        if self.network.is_online() && !pending {
            match send(payload.clone()).await {
                Ok(data) => return Ok(SendOutcome::Sent(data)),
                Err(e) if e.is_transient() => {
                    warn!(component, entity_id, error = %e, "Send failed, queueing for sync");
                }
                Err(e) => return Err(e),
            }
        } else {
            info!(component, entity_id, pending, online = self.network.is_online(), "Queueing write");
        }

        let action = match mode {
            QueueMode::Append => self.queue.enqueue(component, entity_id, payload)?,
            QueueMode::Replace => self.queue.replace(component, entity_id, payload)?,
        };
        self.events.publish(CoreEvent::ActionQueued {
            site_id: self.queue.site_id().to_string(),
            component: component.to_string(),
            entity_id: entity_id.to_string(),
        });
        Ok(SendOutcome::Queued(action))
    }
}
