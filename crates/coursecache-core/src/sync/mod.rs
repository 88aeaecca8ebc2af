//! Synchronization of offline actions.
//!
//! This module provides:
//! - `SyncHandler`: replays one kind of pending action against the server
//! - `SyncOrchestrator`: runs handlers per kind, coalescing overlapping triggers
//! - `spawn_cron` / `spawn_reconnect_sync`: background triggers for a session

pub mod handler;
pub mod orchestrator;

pub use handler::{SyncHandler, SyncKind};
pub use orchestrator::{SyncOrchestrator, SyncReport, SyncState, SyncTrigger, SyncWarning};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::site::SiteSession;

/// Sync every kind on a fixed interval. The first tick fires after `every`.
///
/// Ticks while offline are skipped. The task holds the session weakly and
/// ends at the first tick after the session is dropped.
pub fn spawn_cron(site: Arc<SiteSession>, every: Duration) -> JoinHandle<()> {
    let site = Arc::downgrade(&site);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(site) = site.upgrade() else {
                debug!("Session dropped, stopping scheduled sync");
                break;
            };
            if !site.network().is_online() {
                debug!(site_id = site.site_id(), "Offline, skipping scheduled sync");
                continue;
            }
            site.sync_all(SyncTrigger::Scheduled).await;
        }
    })
}

/// Sync every kind each time the device comes back online.
///
/// The task holds the session weakly. It ends at the first connectivity
/// change after the session is dropped, or when every network monitor
/// handle is gone.
pub fn spawn_reconnect_sync(site: Arc<SiteSession>) -> JoinHandle<()> {
    let mut rx = site.network().subscribe();
    let site = Arc::downgrade(&site);
    tokio::spawn(async move {
        let mut was_online = rx.borrow_and_update().online;
        while rx.changed().await.is_ok() {
            let online = rx.borrow_and_update().online;
            let Some(site) = site.upgrade() else {
                debug!("Session dropped, stopping reconnect sync");
                break;
            };
            if online && !was_online {
                info!(site_id = site.site_id(), "Back online, syncing");
                site.sync_all(SyncTrigger::Reconnect).await;
            }
            was_online = online;
        }
    })
}
