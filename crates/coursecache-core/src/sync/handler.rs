use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::WsError;
use crate::offline::{EntityKey, PendingAction};
use crate::site::SiteSession;

/// Kinds of offline data the sync layer knows how to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum SyncKind {
    Messages,
    AssignSubmissions,
}

impl SyncKind {
    pub const ALL: [SyncKind; 2] = [SyncKind::Messages, SyncKind::AssignSubmissions];

    /// Offline queue component holding this kind's actions.
    pub fn component(&self) -> &'static str {
        match self {
            SyncKind::Messages => crate::modules::messages::COMPONENT,
            SyncKind::AssignSubmissions => crate::modules::assign::COMPONENT,
        }
    }

    pub fn from_component(component: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.component() == component)
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncKind::Messages => write!(f, "messages"),
            SyncKind::AssignSubmissions => write!(f, "assign submissions"),
        }
    }
}

/// Replays one kind of pending action against the live API.
pub trait SyncHandler: Send + Sync {
    fn kind(&self) -> SyncKind;

    /// Send one pending action. Transient errors keep the action queued;
    /// any other error drops it with a warning.
    fn replay<'a>(
        &'a self,
        site: &'a SiteSession,
        action: &'a PendingAction,
    ) -> BoxFuture<'a, Result<Value, WsError>>;

    /// Cache keys made stale once actions for `entity` reach the server.
    fn invalidated_keys(&self, entity: &EntityKey) -> Vec<String>;
}
