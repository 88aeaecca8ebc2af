use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::CacheStore;
use crate::api::{WriteObserver, WsError};
use crate::events::{CoreEvent, EventBus};
use crate::network::NetworkState;

/// Separator between the hierarchical key and the variant in an entry id.
pub const ID_SEPARATOR: char = '|';

/// How often the underlying data is expected to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum UpdateFrequency {
    #[default]
    Usually,
    Often,
    Sometimes,
    Rarely,
}

impl UpdateFrequency {
    /// Time an entry stays fresh. Doubled on metered connections.
    pub fn expiration(&self, limited_network: bool) -> Duration {
        let base = match self {
            UpdateFrequency::Usually => Duration::minutes(7),
            UpdateFrequency::Often => Duration::minutes(20),
            UpdateFrequency::Sometimes => Duration::hours(1),
            UpdateFrequency::Rarely => Duration::hours(12),
        };
        if limited_network {
            base * 2
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct CachedEntry {
    /// Hierarchical key (`root:subresource:id`) used for invalidation.
    pub key: String,
    /// Distinguishes entries under one key, e.g. a hash of the call params.
    pub variant: String,
    #[cfg_attr(feature = "ts", ts(type = "unknown"))]
    pub data: Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedEntry {
    pub fn new(key: &str, variant: &str, data: Value, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            variant: variant.to_string(),
            data,
            cached_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn id(&self) -> String {
        entry_id(&self.key, &self.variant)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

pub fn entry_id(key: &str, variant: &str) -> String {
    format!("{}{}{}", key, ID_SEPARATOR, variant)
}

/// Options for a cached read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOptions {
    /// Serve a fresh cached entry instead of calling the server.
    pub get_from_cache: bool,
    /// Store a successful live result.
    pub save_to_cache: bool,
    /// Serve any cached entry, however old, when the live call fails for network reasons.
    pub emergency_cache: bool,
    pub update_frequency: UpdateFrequency,
    /// Hierarchical key to file the response under; defaults to the function name.
    pub cache_key: Option<String>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            get_from_cache: true,
            save_to_cache: true,
            emergency_cache: true,
            update_frequency: UpdateFrequency::Usually,
            cache_key: None,
        }
    }
}

impl ReadOptions {
    /// Skip cached entries and go to the server (pull-to-refresh).
    pub fn refresh() -> Self {
        Self {
            get_from_cache: false,
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_frequency(mut self, frequency: UpdateFrequency) -> Self {
        self.update_frequency = frequency;
        self
    }

    pub fn without_emergency_cache(mut self) -> Self {
        self.emergency_cache = false;
        self
    }
}

/// Response cache for one site.
pub struct ResponseCache {
    site_id: String,
    store: Arc<dyn CacheStore>,
    events: EventBus,
    /// key -> keys whose cached data is derived from it
    dependents: Mutex<HashMap<String, Vec<String>>>,
    /// write function -> keys it makes stale
    write_invalidations: Mutex<HashMap<String, Vec<String>>>,
    /// Bumped on every invalidation; reads started before a bump do not save.
    generation: AtomicU64,
}

impl ResponseCache {
    pub fn new(site_id: &str, store: Arc<dyn CacheStore>, events: EventBus) -> Self {
        Self {
            site_id: site_id.to_string(),
            store,
            events,
            dependents: Mutex::new(HashMap::new()),
            write_invalidations: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Invalidating `key` also invalidates `dependent`.
    pub fn add_dependency(&self, key: &str, dependent: &str) {
        if let Ok(mut deps) = self.dependents.lock() {
            let list = deps.entry(key.to_string()).or_default();
            if !list.iter().any(|d| d == dependent) {
                list.push(dependent.to_string());
            }
        }
    }

    /// A successful call to write function `method` invalidates `key`.
    pub fn invalidate_on_write(&self, method: &str, key: &str) {
        if let Ok(mut rules) = self.write_invalidations.lock() {
            rules.entry(method.to_string()).or_default().push(key.to_string());
        }
    }

    /// Look up an entry; storage failures read as a miss.
    pub fn lookup(&self, key: &str, variant: &str) -> Option<CachedEntry> {
        match self.store.get(&entry_id(key, variant)) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Failed to read cache entry");
                None
            }
        }
    }

    /// Store a response. Failures are logged and otherwise ignored.
    pub fn save(&self, key: &str, variant: &str, data: Value, ttl: Duration) {
        if let Err(e) = self.store.put(CachedEntry::new(key, variant, data, ttl)) {
            warn!(key, error = %e, "Failed to write cache entry, continuing without caching");
        }
    }

    /// Read through the cache.
    ///
    /// Fresh entries are served when `get_from_cache` is set. Offline, any
    /// cached entry is served. A live call that fails for network reasons falls
    /// back to any cached entry when `emergency_cache` is set.
    ///
    /// `fetch` receives the cache generation the fetch starts under; a live
    /// call must not share its response with calls from another generation.
    pub async fn read<F, Fut>(
        &self,
        key: &str,
        variant: &str,
        options: &ReadOptions,
        network: &NetworkState,
        fetch: F,
    ) -> Result<Value, WsError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<Value, WsError>>,
    {
        if options.get_from_cache {
            if let Some(entry) = self.lookup(key, variant) {
                if !entry.is_expired() || !network.online {
                    debug!(key, age = %entry.age_display(), "Cache hit");
                    return Ok(entry.data);
                }
            }
        }

        if !network.online {
            if options.emergency_cache {
                if let Some(entry) = self.lookup(key, variant) {
                    debug!(key, "Offline, serving cached entry");
                    return Ok(entry.data);
                }
            }
            return Err(WsError::offline());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        match fetch(generation).await {
            Ok(data) => {
                if options.save_to_cache {
                    if self.generation.load(Ordering::SeqCst) == generation {
                        let ttl = options.update_frequency.expiration(network.is_limited());
                        self.save(key, variant, data.clone(), ttl);
                    } else {
                        debug!(key, "Cache invalidated during fetch, not saving");
                    }
                }
                Ok(data)
            }
            Err(e) if e.is_transient() && options.emergency_cache => match self.lookup(key, variant) {
                Some(entry) => {
                    warn!(key, error = %e, age = %entry.age_display(), "Live call failed, serving cached entry");
                    Ok(entry.data)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Drop every entry under `key` and under the keys that depend on it.
    ///
    /// Invalidating a key with no entries is a no-op.
    pub fn invalidate(&self, key: &str) -> Result<usize, WsError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut removed = 0;
        for k in self.with_dependents(vec![key.to_string()]) {
            removed += self.remove(&format!("{}{}", k, ID_SEPARATOR), &k)?;
        }
        Ok(removed)
    }

    /// Drop every entry whose key starts with `prefix`, plus dependents of matching keys.
    pub fn invalidate_prefix(&self, prefix: &str) -> Result<usize, WsError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut removed = self.remove(prefix, prefix)?;

        let matching: Vec<String> = self
            .dependents
            .lock()
            .map(|deps| deps.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default();
        for k in self.with_dependents(matching) {
            if !k.starts_with(prefix) {
                removed += self.remove(&format!("{}{}", k, ID_SEPARATOR), &k)?;
            }
        }
        Ok(removed)
    }

    /// Drop the whole site cache.
    pub fn purge(&self) -> Result<(), WsError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.store
            .clear()
            .map_err(|e| WsError::Storage(e.to_string()))
    }

    /// Age of the newest entry per key.
    pub fn ages(&self) -> BTreeMap<String, String> {
        let entries = match self.store.entries() {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "Failed to list cache entries");
                return BTreeMap::new();
            }
        };

        let mut newest: BTreeMap<String, CachedEntry> = BTreeMap::new();
        for entry in entries {
            match newest.get(&entry.key) {
                Some(current) if current.cached_at >= entry.cached_at => {}
                _ => {
                    newest.insert(entry.key.clone(), entry);
                }
            }
        }
        newest
            .into_iter()
            .map(|(key, entry)| (key, entry.age_display()))
            .collect()
    }

    fn remove(&self, prefix: &str, key: &str) -> Result<usize, WsError> {
        let removed = self
            .store
            .remove_prefix(prefix)
            .map_err(|e| WsError::Storage(e.to_string()))?;
        if removed > 0 {
            debug!(key, removed, "Cache invalidated");
        }
        self.events.publish(CoreEvent::CacheInvalidated {
            site_id: self.site_id.clone(),
            key: key.to_string(),
        });
        Ok(removed)
    }

    /// Breadth-first closure over the dependency map. Cycles are cut by the visited set.
    fn with_dependents(&self, roots: Vec<String>) -> Vec<String> {
        let deps = match self.dependents.lock() {
            Ok(deps) => deps.clone(),
            Err(_) => return roots,
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<String> = roots.into();
        while let Some(key) = queue.pop_front() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(children) = deps.get(&key) {
                queue.extend(children.iter().cloned());
            }
            order.push(key);
        }
        order
    }
}

impl WriteObserver for ResponseCache {
    fn write_succeeded(&self, method: &str) {
        let keys = self
            .write_invalidations
            .lock()
            .ok()
            .and_then(|rules| rules.get(method).cloned())
            .unwrap_or_default();

        for key in keys {
            if let Err(e) = self.invalidate(&key) {
                warn!(method, key = %key, error = %e, "Failed to invalidate after write");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::JsonCacheStore;
    use crate::network::ConnectionType;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> ResponseCache {
        ResponseCache::new("site1", Arc::new(JsonCacheStore::in_memory()), EventBus::new())
    }

    fn online() -> NetworkState {
        NetworkState::online(ConnectionType::Wifi)
    }

    struct BrokenStore;

    impl CacheStore for BrokenStore {
        fn get(&self, _id: &str) -> anyhow::Result<Option<CachedEntry>> {
            Ok(None)
        }
        fn put(&self, _entry: CachedEntry) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }
        fn remove_prefix(&self, _prefix: &str) -> anyhow::Result<usize> {
            Ok(0)
        }
        fn entries(&self) -> anyhow::Result<Vec<CachedEntry>> {
            Ok(vec![])
        }
        fn clear(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cached_entry_age_display_just_now() {
        let entry = CachedEntry::new("k", "", json!(1), Duration::minutes(7));
        assert_eq!(entry.age_display(), "just now");
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_cached_entry_age_display_hours() {
        let mut entry = CachedEntry::new("k", "", json!(1), Duration::minutes(7));
        entry.cached_at = Utc::now() - Duration::minutes(95);
        assert_eq!(entry.age_display(), "2h ago");
    }

    #[test]
    fn test_update_frequency_doubles_on_limited_network() {
        assert_eq!(UpdateFrequency::Usually.expiration(false), Duration::minutes(7));
        assert_eq!(UpdateFrequency::Rarely.expiration(true), Duration::hours(24));
    }

    #[tokio::test]
    async fn test_read_serves_fresh_entry_without_fetching() {
        let cache = cache();
        let fetches = AtomicUsize::new(0);
        let fetch = |_: u64| async {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"v": 1}))
        };

        let opts = ReadOptions::default();
        assert_eq!(cache.read("courses", "a", &opts, &online(), fetch).await.unwrap(), json!({"v": 1}));
        let fetch = |_: u64| async {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"v": 2}))
        };
        assert_eq!(cache.read("courses", "a", &opts, &online(), fetch).await.unwrap(), json!({"v": 1}));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let cache = cache();
        cache.save("courses", "a", json!(1), Duration::minutes(7));
        let value = cache
            .read("courses", "a", &ReadOptions::refresh(), &online(), |_| async { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(cache.lookup("courses", "a").unwrap().data, json!(2));
    }

    #[tokio::test]
    async fn test_invalidate_then_read_fetches_live() {
        let cache = cache();
        cache.save("course:5:contents", "", json!("old"), Duration::hours(1));

        cache.invalidate("course:5:contents").unwrap();
        let value = cache
            .read("course:5:contents", "", &ReadOptions::default(), &online(), |_| async {
                Ok(json!("new"))
            })
            .await
            .unwrap();
        assert_eq!(value, json!("new"));
    }

    #[tokio::test]
    async fn test_invalidated_entry_is_not_an_emergency_fallback() {
        let cache = cache();
        cache.save("grades", "", json!("old"), Duration::hours(1));
        cache.invalidate("grades").unwrap();

        let result = cache
            .read("grades", "", &ReadOptions::default(), &online(), |_| async {
                Err(WsError::Network("reset".into()))
            })
            .await;
        assert!(matches!(result, Err(WsError::Network(_))));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let cache = cache();
        cache.save("contacts", "", json!([1]), Duration::hours(1));
        cache.save("courses", "", json!([2]), Duration::hours(1));

        assert_eq!(cache.invalidate("contacts").unwrap(), 1);
        let after_once = cache.store.entries().unwrap();
        assert_eq!(cache.invalidate("contacts").unwrap(), 0);
        assert_eq!(cache.store.entries().unwrap(), after_once);
    }

    #[tokio::test]
    async fn test_invalidating_discussions_invalidates_contacts() {
        let cache = cache();
        cache.add_dependency("discussions", "contacts");
        cache.save("discussions", "", json!(["stale"]), Duration::hours(1));
        cache.save("contacts", "", json!(["stale"]), Duration::hours(1));

        cache.invalidate("discussions").unwrap();

        let fetched = AtomicUsize::new(0);
        let value = cache
            .read("contacts", "", &ReadOptions::default(), &online(), |_| async {
                fetched.fetch_add(1, Ordering::SeqCst);
                Ok(json!(["fresh"]))
            })
            .await
            .unwrap();
        assert_eq!(value, json!(["fresh"]));
        assert_eq!(fetched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dependency_cycles_terminate() {
        let cache = cache();
        cache.add_dependency("a", "b");
        cache.add_dependency("b", "a");
        cache.save("a", "", json!(1), Duration::hours(1));
        cache.save("b", "", json!(1), Duration::hours(1));
        assert_eq!(cache.invalidate("a").unwrap(), 2);
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = cache();
        cache.add_dependency("mod_assign:submission", "mod_assign:grades");
        cache.add_dependency("mod_assign:submission", "course:contents");
        cache.save("mod_assign:submission", "1", json!(1), Duration::hours(1));
        cache.save("mod_assign:submission", "2", json!(1), Duration::hours(1));
        cache.save("course:contents", "", json!(1), Duration::hours(1));
        cache.save("forum", "", json!(1), Duration::hours(1));

        assert_eq!(cache.invalidate_prefix("mod_assign:").unwrap(), 3);
        assert!(cache.lookup("forum", "").is_some());
    }

    #[tokio::test]
    async fn test_emergency_cache_on_network_failure() {
        let cache = cache();
        let mut entry = CachedEntry::new("courses", "", json!("stale"), Duration::minutes(7));
        entry.expires_at = Utc::now() - Duration::minutes(1);
        cache.store.put(entry).unwrap();

        let value = cache
            .read("courses", "", &ReadOptions::default(), &online(), |_| async { Err(WsError::Timeout) })
            .await
            .unwrap();
        assert_eq!(value, json!("stale"));

        let result = cache
            .read(
                "courses",
                "",
                &ReadOptions::default().without_emergency_cache(),
                &online(),
                |_| async { Err(WsError::Timeout) },
            )
            .await;
        assert_eq!(result, Err(WsError::Timeout));
    }

    #[tokio::test]
    async fn test_service_error_never_falls_back_to_cache() {
        let cache = cache();
        let mut entry = CachedEntry::new("courses", "", json!("stale"), Duration::minutes(7));
        entry.expires_at = Utc::now() - Duration::minutes(1);
        cache.store.put(entry).unwrap();

        let result = cache
            .read("courses", "", &ReadOptions::default(), &online(), |_| async {
                Err(WsError::Service {
                    errorcode: "nopermissions".into(),
                    message: "No".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(WsError::Service { .. })));
    }

    #[tokio::test]
    async fn test_offline_serves_expired_entry_or_fails() {
        let cache = cache();
        let mut entry = CachedEntry::new("courses", "", json!("old"), Duration::minutes(7));
        entry.expires_at = Utc::now() - Duration::hours(3);
        cache.store.put(entry).unwrap();

        let offline = NetworkState::offline();
        let value = cache
            .read("courses", "", &ReadOptions::default(), &offline, |_| async {
                Err(WsError::InvalidResponse("fetched while offline".into()))
            })
            .await
            .unwrap();
        assert_eq!(value, json!("old"));

        let result = cache
            .read("missing", "", &ReadOptions::default(), &offline, |_| async { Ok(json!(0)) })
            .await;
        assert!(matches!(result, Err(WsError::Network(_))));
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_not_fatal() {
        let cache = ResponseCache::new("site1", Arc::new(BrokenStore), EventBus::new());
        let value = cache
            .read("courses", "", &ReadOptions::default(), &online(), |_| async { Ok(json!([1])) })
            .await
            .unwrap();
        assert_eq!(value, json!([1]));
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_skips_save() {
        let cache = cache();
        let value = cache
            .read("courses", "", &ReadOptions::default(), &online(), |_| async {
                cache.invalidate("courses").unwrap();
                Ok(json!("fetched before invalidation"))
            })
            .await
            .unwrap();
        assert_eq!(value, json!("fetched before invalidation"));
        assert!(cache.lookup("courses", "").is_none());
    }

    #[test]
    fn test_write_observer_invalidates_registered_keys() {
        let cache = cache();
        cache.invalidate_on_write("core_message_send_instant_messages", "discussions");
        cache.add_dependency("discussions", "contacts");
        cache.save("discussions", "", json!(1), Duration::hours(1));
        cache.save("contacts", "", json!(1), Duration::hours(1));
        cache.save("courses", "", json!(1), Duration::hours(1));

        cache.write_succeeded("core_message_send_instant_messages");
        assert!(cache.lookup("discussions", "").is_none());
        assert!(cache.lookup("contacts", "").is_none());
        assert!(cache.lookup("courses", "").is_some());
    }

    #[test]
    fn test_ages_reports_newest_entry_per_key() {
        let cache = cache();
        cache.save("courses", "a", json!(1), Duration::hours(1));
        let ages = cache.ages();
        assert_eq!(ages.get("courses").map(String::as_str), Some("just now"));
    }
}
