//! Application configuration management.
//!
//! Holds the known site accounts, the current one, and sync preferences.
//!
//! Configuration is stored at `~/.config/coursecache/config.json`; per-site
//! data (session, response cache, offline queue) lives under the cache dir.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::storage::{load_json, save_json};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "coursecache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Per-site data directory under the cache dir
const SITES_DIR: &str = "sites";

/// Default scheduled sync interval (minutes).
const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 10;

/// A site account known to the app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteEntry {
    pub site_id: String,
    pub site_url: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sites: Vec<SiteEntry>,
    pub current_site: Option<String>,
    pub last_username: Option<String>,
    pub sync_interval_minutes: u64,
    /// Treat the device as offline regardless of connectivity.
    pub offline_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            current_site: None,
            last_username: None,
            sync_interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
            offline_mode: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(load_json(&Self::config_path()?)?.unwrap_or_default())
    }

    pub fn save(&self) -> Result<()> {
        save_json(&Self::config_path()?, self)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Root of the per-site directories (session, response cache, offline queue).
    pub fn sites_dir() -> Result<PathBuf> {
        Ok(Self::cache_dir()?.join(SITES_DIR))
    }

    /// Interval between scheduled syncs. Never shorter than a minute.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes.max(1) * 60)
    }

    /// Record a site account and make it current.
    pub fn remember_site(&mut self, entry: SiteEntry) {
        self.last_username = Some(entry.username.clone());
        self.current_site = Some(entry.site_id.clone());
        self.sites.retain(|s| s.site_id != entry.site_id);
        self.sites.push(entry);
    }

    pub fn forget_site(&mut self, site_id: &str) {
        self.sites.retain(|s| s.site_id != site_id);
        if self.current_site.as_deref() == Some(site_id) {
            self.current_site = None;
        }
    }

    pub fn current(&self) -> Option<&SiteEntry> {
        let id = self.current_site.as_deref()?;
        self.sites.iter().find(|s| s.site_id == id)
    }
}
