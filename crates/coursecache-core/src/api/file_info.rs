//! Remote file size and mimetype lookups.
//!
//! Sizes and mimetypes are learned from web service responses that list files
//! and, failing that, from HEAD requests. Both are cached per URL for the
//! life of the site session.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::network::NetworkState;

/// Downloads above this size need confirmation on metered connections (2 MB).
const DOWNLOAD_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Downloads above this size always need confirmation (100 MB).
const WIFI_DOWNLOAD_THRESHOLD: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFileInfo {
    pub size: Option<u64>,
    pub mimetype: Option<String>,
}

/// Whether a download may start without asking the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadDecision {
    Allowed,
    NeedsConfirmation { size: u64 },
    /// Size unknown on a metered connection.
    SizeUnknown,
}

#[derive(Default)]
pub struct FileInfoCache {
    entries: Mutex<HashMap<String, RemoteFileInfo>>,
}

impl FileInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<RemoteFileInfo> {
        self.entries.lock().ok()?.get(url).cloned()
    }

    /// Merge known fields into the entry for `url`.
    pub fn record(&self, url: &str, info: RemoteFileInfo) {
        if let Ok(mut entries) = self.entries.lock() {
            let entry = entries.entry(url.to_string()).or_default();
            if info.size.is_some() {
                entry.size = info.size;
            }
            if info.mimetype.is_some() {
                entry.mimetype = info.mimetype;
            }
        }
    }

    /// Walk a response and record every file object it describes.
    ///
    /// File objects carry `fileurl` plus `filesize` and/or `mimetype`.
    pub fn record_from_response(&self, data: &Value) -> usize {
        let mut recorded = 0;
        self.walk(data, &mut recorded);
        recorded
    }

    fn walk(&self, data: &Value, recorded: &mut usize) {
        match data {
            Value::Array(items) => items.iter().for_each(|item| self.walk(item, recorded)),
            Value::Object(map) => {
                if let Some(url) = map.get("fileurl").and_then(Value::as_str) {
                    let info = RemoteFileInfo {
                        size: map.get("filesize").and_then(Value::as_u64),
                        mimetype: map
                            .get("mimetype")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    };
                    if info.size.is_some() || info.mimetype.is_some() {
                        self.record(url, info);
                        *recorded += 1;
                    }
                }
                map.values().for_each(|v| self.walk(v, recorded));
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decide whether a file of `size` bytes may download on `network` without asking.
pub fn download_decision(size: Option<u64>, network: &NetworkState) -> DownloadDecision {
    match size {
        None if network.is_wifi() => DownloadDecision::Allowed,
        None => DownloadDecision::SizeUnknown,
        Some(size) if size >= WIFI_DOWNLOAD_THRESHOLD => DownloadDecision::NeedsConfirmation { size },
        Some(size) if !network.is_wifi() && size >= DOWNLOAD_THRESHOLD => {
            DownloadDecision::NeedsConfirmation { size }
        }
        Some(_) => DownloadDecision::Allowed,
    }
}
