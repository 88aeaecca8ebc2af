//! Device connectivity signal.
//!
//! `NetworkMonitor` holds the current online state and connection type. The
//! platform layer pushes updates into it; the web service client reads it to
//! gate calls and pick timeouts, and the sync layer watches it for reconnects.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Request timeout on metered or limited connections.
const WS_TIMEOUT: Duration = Duration::from_secs(30);

/// Request timeout on wifi and wired connections.
const WS_TIMEOUT_WIFI: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum ConnectionType {
    Wifi,
    Ethernet,
    Cellular,
    Unknown,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub online: bool,
    pub connection: ConnectionType,
}

impl NetworkState {
    pub fn online(connection: ConnectionType) -> Self {
        Self {
            online: true,
            connection,
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            connection: ConnectionType::None,
        }
    }

    /// Metered connections get shorter timeouts and stricter download limits.
    pub fn is_limited(&self) -> bool {
        matches!(self.connection, ConnectionType::Cellular)
    }

    pub fn is_wifi(&self) -> bool {
        self.online && matches!(self.connection, ConnectionType::Wifi | ConnectionType::Ethernet)
    }

    pub fn request_timeout(&self) -> Duration {
        if self.is_limited() {
            WS_TIMEOUT
        } else {
            WS_TIMEOUT_WIFI
        }
    }
}

/// Shared, cheaply cloneable connectivity handle.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkState>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> NetworkState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    pub fn request_timeout(&self) -> Duration {
        self.state().request_timeout()
    }

    pub fn set(&self, state: NetworkState) {
        let previous = self.tx.send_replace(state);
        if previous.online != state.online {
            info!(online = state.online, connection = ?state.connection, "Connectivity changed");
        }
    }

    pub fn set_online(&self, connection: ConnectionType) {
        self.set(NetworkState::online(connection));
    }

    pub fn set_offline(&self) {
        self.set(NetworkState::offline());
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkState::online(ConnectionType::Unknown))
    }
}
