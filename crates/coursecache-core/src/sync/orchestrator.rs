//! Drains the offline queue against the live API.
//!
//! One sync runs per kind at a time. Each entity's actions replay in creation
//! order; a network failure parks the rest of that entity until the next run,
//! a rejection drops the action with a warning, and other entities carry on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{SyncHandler, SyncKind};
use crate::api::WsError;
use crate::events::CoreEvent;
use crate::offline::EntityKey;
use crate::site::SiteSession;

/// Where a kind stands. After a finished run the kind rests in the run's
/// outcome until the next run starts; any state but `Syncing` accepts a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Success,
    PartialFailure,
}

/// What started a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    UserRefresh,
    AppResume,
    Scheduled,
    Reconnect,
    /// A push notification about one entity; only that entity is synced.
    Push { entity_id: String },
}

impl SyncTrigger {
    fn only_entity(&self) -> Option<&str> {
        match self {
            SyncTrigger::Push { entity_id } => Some(entity_id),
            _ => None,
        }
    }
}

/// An action the server rejected; it was removed from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncWarning {
    pub entity: EntityKey,
    pub action_id: String,
    pub error: WsError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub kind: SyncKind,
    pub state: SyncState,
    /// Actions the server accepted.
    pub synced: usize,
    /// Actions still queued after the run.
    pub remaining: usize,
    pub warnings: Vec<SyncWarning>,
    /// Entities stopped by a transient failure.
    pub blocked: Vec<EntityKey>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Default)]
struct KindStatus {
    state: SyncState,
    last_report: Option<SyncReport>,
}

/// Per-session sync driver with a fixed handler registry.
pub struct SyncOrchestrator {
    handlers: HashMap<SyncKind, Arc<dyn SyncHandler>>,
    status: Arc<Mutex<HashMap<SyncKind, KindStatus>>>,
}

/// Marks a kind as syncing. On drop the kind takes the recorded outcome, or
/// returns to idle when the run was cancelled before finishing.
struct SyncingGuard {
    status: Arc<Mutex<HashMap<SyncKind, KindStatus>>>,
    kind: SyncKind,
    outcome: Option<SyncState>,
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        if let Ok(mut status) = self.status.lock() {
            status.entry(self.kind).or_default().state = self.outcome.unwrap_or(SyncState::Idle);
        }
    }
}

impl SyncOrchestrator {
    pub fn new(handlers: Vec<Arc<dyn SyncHandler>>) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.kind(), h)).collect();
        Self {
            handlers,
            status: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state(&self, kind: SyncKind) -> SyncState {
        self.status
            .lock()
            .ok()
            .and_then(|s| s.get(&kind).map(|k| k.state))
            .unwrap_or_default()
    }

    /// Report of the most recent finished run for `kind`.
    pub fn last_report(&self, kind: SyncKind) -> Option<SyncReport> {
        self.status
            .lock()
            .ok()
            .and_then(|s| s.get(&kind).and_then(|k| k.last_report.clone()))
    }

    pub fn last_outcome(&self, kind: SyncKind) -> Option<SyncState> {
        self.last_report(kind).map(|r| r.state)
    }

    /// Sync one kind. Returns `Ok(None)` when a sync of that kind is already
    /// running; the trigger is folded into it.
    pub async fn run(
        &self,
        site: &SiteSession,
        kind: SyncKind,
        trigger: SyncTrigger,
    ) -> Result<Option<SyncReport>, WsError> {
        let handler = self
            .handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| WsError::InvalidResponse(format!("No sync handler for {}", kind)))?;

        if !site.network().is_online() {
            debug!(%kind, ?trigger, "Offline, skipping sync");
            return Err(WsError::offline());
        }

        let mut guard = match self.begin(kind) {
            Some(guard) => guard,
            None => {
                debug!(%kind, ?trigger, "Sync already running, trigger coalesced");
                return Ok(None);
            }
        };

        let component = kind.component();
        let entities = match trigger.only_entity() {
            Some(entity_id) => vec![EntityKey::new(component, entity_id)],
            None => site.offline().entities_with_pending(component),
        };
        info!(%kind, ?trigger, entities = entities.len(), "Sync started");

        let mut synced = 0;
        let mut warnings = Vec::new();
        let mut blocked = Vec::new();

        for entity in entities {
            let (done, changed, stopped) = self
                .sync_entity(site, handler.as_ref(), &entity, &mut warnings)
                .await;
            site.offline()
                .release_entity_lock(&entity.component, &entity.entity_id);
            synced += done;

            if changed {
                for key in handler.invalidated_keys(&entity) {
                    if let Err(e) = site.cache().invalidate(&key) {
                        warn!(key = %key, error = %e, "Failed to invalidate after sync");
                    }
                }
            }
            if stopped {
                blocked.push(entity);
            }
        }

        let remaining = site.offline().pending(component).len();
        let state = if warnings.is_empty() && blocked.is_empty() {
            SyncState::Success
        } else {
            SyncState::PartialFailure
        };
        let report = SyncReport {
            kind,
            state,
            synced,
            remaining,
            warnings,
            blocked,
            finished_at: Utc::now(),
        };

        info!(%kind, ?state, synced, remaining, "Sync finished");
        if let Ok(mut status) = self.status.lock() {
            status.entry(kind).or_default().last_report = Some(report.clone());
        }
        guard.outcome = Some(state);
        drop(guard);
        site.events().publish(CoreEvent::SyncFinished {
            site_id: site.site_id().to_string(),
            kind,
            state,
            synced,
            remaining,
        });
        Ok(Some(report))
    }

    /// Sync every registered kind, in a fixed order. Per-kind errors are logged.
    pub async fn run_all(&self, site: &SiteSession, trigger: SyncTrigger) -> Vec<SyncReport> {
        let mut reports = Vec::new();
        for kind in SyncKind::ALL {
            if !self.handlers.contains_key(&kind) {
                continue;
            }
            match self.run(site, kind, trigger.clone()).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => warn!(%kind, error = %e, "Sync failed"),
            }
        }
        reports
    }

    /// Replay one entity's actions. Returns (synced, anything removed, stopped early).
    async fn sync_entity(
        &self,
        site: &SiteSession,
        handler: &dyn SyncHandler,
        entity: &EntityKey,
        warnings: &mut Vec<SyncWarning>,
    ) -> (usize, bool, bool) {
        let queue = site.offline();
        let lock = queue.entity_lock(&entity.component, &entity.entity_id);
        let _held = lock.lock().await;

        let mut synced = 0;
        let mut changed = false;
        for action in queue.drain(&entity.component, &entity.entity_id) {
            match handler.replay(site, &action).await {
                Ok(_) => synced += 1,
                Err(e) if e.is_transient() => {
                    warn!(entity = %entity, action = %action.id, error = %e, "Sync interrupted, keeping remaining actions");
                    return (synced, changed, true);
                }
                Err(e) => {
                    warn!(entity = %entity, action = %action.id, error = %e, "Action rejected, discarding");
                    warnings.push(SyncWarning {
                        entity: entity.clone(),
                        action_id: action.id.clone(),
                        error: e,
                    });
                }
            }

            if let Err(e) = queue.remove(std::slice::from_ref(&action.id)) {
                warn!(entity = %entity, action = %action.id, error = %e, "Failed to remove synced action");
                return (synced, true, true);
            }
            changed = true;
        }
        (synced, changed, false)
    }

    fn begin(&self, kind: SyncKind) -> Option<SyncingGuard> {
        let mut status = self.status.lock().ok()?;
        let entry = status.entry(kind).or_default();
        if entry.state == SyncState::Syncing {
            return None;
        }
        entry.state = SyncState::Syncing;
        Some(SyncingGuard {
            status: self.status.clone(),
            kind,
            outcome: None,
        })
    }
}
