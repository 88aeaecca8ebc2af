//! Persistent per-site queue of writes waiting to reach the server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::api::WsError;
use crate::storage::{load_json, save_json};

/// Identifies the thing a write applies to, e.g. a conversation or an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct EntityKey {
    pub component: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(component: &str, entity_id: impl ToString) -> Self {
        Self {
            component: component.to_string(),
            entity_id: entity_id.to_string(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.component, self.entity_id)
    }
}

/// A write stored while it could not be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct PendingAction {
    pub id: String,
    pub site_id: String,
    pub component: String,
    pub entity_id: String,
    #[cfg_attr(feature = "ts", ts(type = "unknown"))]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Per-site monotonic counter; replay order within an entity.
    pub ordering_key: u64,
}

impl PendingAction {
    pub fn entity(&self) -> EntityKey {
        EntityKey::new(&self.component, &self.entity_id)
    }

    fn belongs_to(&self, component: &str, entity_id: &str) -> bool {
        self.component == component && self.entity_id == entity_id
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueFile {
    next_ordering_key: u64,
    actions: Vec<PendingAction>,
}

/// Offline action queue for one site.
///
/// Mutations are written through to disk before they become visible; a failed
/// write is returned as `WsError::Storage` and leaves the queue unchanged.
pub struct OfflineQueue {
    site_id: String,
    path: Option<PathBuf>,
    state: Mutex<QueueFile>,
    entity_locks: Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl OfflineQueue {
    pub fn open(site_id: &str, path: PathBuf) -> Result<Self, WsError> {
        let file: QueueFile = load_json(&path)
            .map_err(|e| WsError::Storage(format!("{:#}", e)))?
            .unwrap_or_default();
        if !file.actions.is_empty() {
            info!(site_id, pending = file.actions.len(), "Loaded offline queue");
        }
        Ok(Self {
            site_id: site_id.to_string(),
            path: Some(path),
            state: Mutex::new(file),
            entity_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn in_memory(site_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            path: None,
            state: Mutex::new(QueueFile::default()),
            entity_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Store a new action behind any already pending for the same entity.
    pub fn enqueue(&self, component: &str, entity_id: &str, payload: Value) -> Result<PendingAction, WsError> {
        self.modify(|file| {
            let action = self.new_action(file, component, entity_id, payload);
            file.actions.push(action.clone());
            action
        })
        .inspect(|action| {
            debug!(component, entity_id, ordering_key = action.ordering_key, "Queued offline action");
        })
    }

    /// Store an action that supersedes everything pending for the entity.
    pub fn replace(&self, component: &str, entity_id: &str, payload: Value) -> Result<PendingAction, WsError> {
        self.modify(|file| {
            file.actions.retain(|a| !a.belongs_to(component, entity_id));
            let action = self.new_action(file, component, entity_id, payload);
            file.actions.push(action.clone());
            action
        })
    }

    pub fn has_pending(&self, component: &str, entity_id: &str) -> Result<bool, WsError> {
        self.read(|file| file.actions.iter().any(|a| a.belongs_to(component, entity_id)))
    }

    /// Pending actions for one entity in creation order. Actions stay queued
    /// until `remove` confirms them.
    pub fn drain(&self, component: &str, entity_id: &str) -> Vec<PendingAction> {
        let mut actions = self
            .read(|file| {
                file.actions
                    .iter()
                    .filter(|a| a.belongs_to(component, entity_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        actions.sort_by_key(|a| a.ordering_key);
        actions
    }

    /// Every pending action of a component in creation order.
    pub fn pending(&self, component: &str) -> Vec<PendingAction> {
        let mut actions = self
            .read(|file| {
                file.actions
                    .iter()
                    .filter(|a| a.component == component)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        actions.sort_by_key(|a| a.ordering_key);
        actions
    }

    /// Entities with pending actions, ordered by their oldest action.
    pub fn entities_with_pending(&self, component: &str) -> Vec<EntityKey> {
        let mut entities: Vec<EntityKey> = Vec::new();
        for action in self.pending(component) {
            let key = action.entity();
            if !entities.contains(&key) {
                entities.push(key);
            }
        }
        entities
    }

    /// Delete confirmed actions. Unknown ids are ignored.
    pub fn remove(&self, ids: &[String]) -> Result<usize, WsError> {
        self.modify(|file| {
            let before = file.actions.len();
            file.actions.retain(|a| !ids.contains(&a.id));
            before - file.actions.len()
        })
    }

    /// Drop everything pending for an entity.
    pub fn discard(&self, component: &str, entity_id: &str) -> Result<usize, WsError> {
        let removed = self.modify(|file| {
            let before = file.actions.len();
            file.actions.retain(|a| !a.belongs_to(component, entity_id));
            before - file.actions.len()
        })?;
        if removed > 0 {
            info!(component, entity_id, removed, "Discarded pending actions");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.read(|file| file.actions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Async lock serializing sends and replays for one entity.
    pub fn entity_lock(&self, component: &str, entity_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = EntityKey::new(component, entity_id);
        match self.entity_locks.lock() {
            Ok(mut locks) => locks.entry(key).or_default().clone(),
            // Poisoned: hand out an unshared lock rather than fail the write.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Forget the entity's lock once nobody holds or awaits it.
    ///
    /// Call after dropping the handle from `entity_lock`.
    pub fn release_entity_lock(&self, component: &str, entity_id: &str) {
        if let Ok(mut locks) = self.entity_locks.lock() {
            let key = EntityKey::new(component, entity_id);
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }

    /// Entities with a live lock entry.
    pub fn locked_entities(&self) -> usize {
        self.entity_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    fn new_action(&self, file: &mut QueueFile, component: &str, entity_id: &str, payload: Value) -> PendingAction {
        let ordering_key = file.next_ordering_key;
        file.next_ordering_key += 1;
        PendingAction {
            id: format!("{}-{}", component, ordering_key),
            site_id: self.site_id.clone(),
            component: component.to_string(),
            entity_id: entity_id.to_string(),
            payload,
            created_at: Utc::now(),
            ordering_key,
        }
    }

    /// Poison the state lock, as a panic while holding it would.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        std::thread::scope(|s| {
            let _ = s
                .spawn(|| {
                    let _state = self.state.lock();
                    panic!("panicked while holding the offline queue");
                })
                .join();
        });
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueFile>, WsError> {
        self.state
            .lock()
            .map_err(|_| WsError::Storage("Offline queue lock poisoned".to_string()))
    }

    fn read<T>(&self, f: impl FnOnce(&QueueFile) -> T) -> Result<T, WsError> {
        Ok(f(&*self.lock()?))
    }

    fn modify<T>(&self, f: impl FnOnce(&mut QueueFile) -> T) -> Result<T, WsError> {
        let mut state = self.lock()?;
        let mut updated = state.clone();
        let result = f(&mut updated);
        if let Some(ref path) = self.path {
            save_json(path, &updated).map_err(|e| WsError::Storage(format!("{:#}", e)))?;
        }
        *state = updated;
        Ok(result)
    }
}
