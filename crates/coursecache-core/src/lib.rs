//! Offline-capable client core for Moodle-style learning sites.
//!
//! The crate calls a site's web services, caches responses per site, queues
//! writes made while offline and replays them in order once connectivity
//! returns.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod events;
pub mod modules;
pub mod network;
pub mod offline;
pub mod push;
pub mod site;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

pub use api::{WsClient, WsError, WsPresets};
pub use cache::{ReadOptions, UpdateFrequency};
pub use config::Config;
pub use events::{CoreEvent, EventBus};
pub use network::{ConnectionType, NetworkMonitor, NetworkState};
pub use offline::{EntityKey, PendingAction, SendOutcome};
pub use site::{SiteSession, SitesManager};
pub use sync::{SyncKind, SyncReport, SyncState, SyncTrigger};
