//! Collapsing of concurrent identical calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::debug;

use super::WsError;

type SharedCall = Shared<BoxFuture<'static, Result<Value, WsError>>>;

/// Calls currently on the wire, keyed by `request::call_key`.
///
/// The call itself runs in a spawned task, so a caller that stops waiting does
/// not abort the request; its result is simply discarded. The task clears its
/// own entry when the call completes, whether or not anyone is still waiting.
#[derive(Default)]
pub struct InFlightCalls {
    calls: Arc<Mutex<HashMap<String, (u64, SharedCall)>>>,
    next_generation: AtomicU64,
}

impl InFlightCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct calls in flight.
    pub fn len(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join the in-flight call for `key`, or start one with `start`.
    pub async fn run<F, Fut>(&self, key: String, start: F) -> Result<Value, WsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, WsError>> + Send + 'static,
    {
        let shared = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| WsError::Network("In-flight call registry poisoned".to_string()))?;

            if let Some((_, existing)) = calls.get(&key) {
                debug!(key = %key, "Joining in-flight call");
                existing.clone()
            } else {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let registry = Arc::clone(&self.calls);
                let task_key = key.clone();
                let call = start();
                // The registry lock is held until the entry is inserted, so the
                // task cannot clear it before it exists.
                let handle = tokio::spawn(async move {
                    let result = call.await;
                    forget(&registry, &task_key, generation);
                    result
                });
                let shared = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(WsError::Network(format!("Call task failed: {}", e))))
                }
                .boxed()
                .shared();
                calls.insert(key, (generation, shared.clone()));
                shared
            }
        };

        shared.await
    }
}

/// Remove the entry for `key` if it still belongs to call `generation`.
fn forget(registry: &Mutex<HashMap<String, (u64, SharedCall)>>, key: &str, generation: u64) {
    if let Ok(mut calls) = registry.lock() {
        if calls.get(key).is_some_and(|(g, _)| *g == generation) {
            calls.remove(key);
        }
    }
}
