//! Persistent storage behind the response cache.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use tracing::debug;

use super::CachedEntry;
use crate::storage::{load_json, save_json};

/// Key-value storage for cached responses, scoped to one site.
///
/// Entries are addressed by their id (`key|variant`); prefix removal is what
/// makes hierarchical key invalidation possible.
pub trait CacheStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<CachedEntry>>;

    fn put(&self, entry: CachedEntry) -> Result<()>;

    /// Remove every entry whose id starts with `prefix`. Returns how many went.
    fn remove_prefix(&self, prefix: &str) -> Result<usize>;

    fn entries(&self) -> Result<Vec<CachedEntry>>;

    fn clear(&self) -> Result<()>;
}

/// Cache store kept in memory and, when given a path, mirrored to one JSON file.
pub struct JsonCacheStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, CachedEntry>>,
}

impl JsonCacheStore {
    /// Open (or create) the cache file at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = load_json(&path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, CachedEntry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("Cache store lock poisoned"))
    }

    /// Apply `f` to a copy, persist it, then swap it in; a failed write leaves memory untouched.
    fn modify<T>(&self, f: impl FnOnce(&mut BTreeMap<String, CachedEntry>) -> T) -> Result<T> {
        let mut entries = self.lock()?;
        let mut updated = entries.clone();
        let result = f(&mut updated);
        if let Some(ref path) = self.path {
            save_json(path, &updated)?;
        }
        *entries = updated;
        Ok(result)
    }
}

impl CacheStore for JsonCacheStore {
    fn get(&self, id: &str) -> Result<Option<CachedEntry>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn put(&self, entry: CachedEntry) -> Result<()> {
        self.modify(|entries| {
            entries.insert(entry.id(), entry);
        })
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let matching: Vec<String> = self
            .lock()?
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .map(|(id, _)| id.clone())
            .collect();

        // Nothing to drop: skip the file write.
        if matching.is_empty() {
            return Ok(0);
        }

        debug!(prefix, count = matching.len(), "Removing cache entries");
        self.modify(|entries| {
            for id in &matching {
                entries.remove(id);
            }
            matching.len()
        })
    }

    fn entries(&self) -> Result<Vec<CachedEntry>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.modify(|entries| entries.clear())
    }
}
