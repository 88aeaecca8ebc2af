use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::request::hash_text;
use crate::storage::{atomic_write, load_json};

/// Session file name in the site directory
const SESSION_FILE: &str = "session.json";

/// Length of the hex site id derived from site URL and username.
const SITE_ID_LEN: usize = 16;

/// Identity of a logged-in site account.
///
/// The token is kept in the OS keychain and never written to the session file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct SessionData {
    pub site_id: String,
    pub site_url: String,
    pub username: String,
    #[serde(skip)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub token: String,
    pub user_id: Option<i64>,
    pub site_name: Option<String>,
    pub full_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionData {
    pub fn new(site_url: &str, username: &str, token: &str) -> Self {
        let site_url = site_url.trim_end_matches('/').to_string();
        Self {
            site_id: site_id_for(&site_url, username),
            site_url,
            username: username.to_string(),
            token: token.to_string(),
            user_id: None,
            site_name: None,
            full_name: None,
            created_at: Utc::now(),
        }
    }
}

/// Stable id for an account on a site.
pub fn site_id_for(site_url: &str, username: &str) -> String {
    let digest = hash_text(&format!("{}|{}", site_url.trim_end_matches('/'), username));
    digest[..SITE_ID_LEN].to_string()
}

pub struct Session {
    site_dir: PathBuf,
    pub data: Option<SessionData>,
}

impl Session {
    pub fn new(site_dir: PathBuf) -> Self {
        Self {
            site_dir,
            data: None,
        }
    }

    /// Load session from disk. The token is left empty for the caller to fill.
    pub fn load(&mut self) -> Result<bool> {
        let path = self.session_path();
        match load_json::<SessionData>(&path).context("Failed to load session file")? {
            Some(data) => {
                self.data = Some(data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        if let Some(ref data) = self.data {
            let contents = serde_json::to_string_pretty(data)?;
            atomic_write(self.session_path(), contents).context("Failed to write session file")?;
        }
        Ok(())
    }

    /// Clear session data
    pub fn clear(&mut self) -> Result<()> {
        self.data = None;
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn update(&mut self, data: SessionData) {
        self.data = Some(data);
    }

    pub fn user_id(&self) -> Option<i64> {
        self.data.as_ref().and_then(|d| d.user_id)
    }

    fn session_path(&self) -> PathBuf {
        self.site_dir.join(SESSION_FILE)
    }
}
