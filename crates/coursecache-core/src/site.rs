//! Per-site state and the manager that creates and drops it.
//!
//! A `SiteSession` bundles everything tied to one logged-in account: the web
//! service client, the response cache, the offline queue and the sync
//! registry. It is created on login (or restore) and dropped on logout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::api::request::hash_text;
use crate::api::{Transport, TypeExpected, WsClient, WsError, WsPresets};
use crate::auth::{Session, SessionData, TokenStore};
use crate::cache::{CacheStore, JsonCacheStore, ReadOptions, ResponseCache, UpdateFrequency};
use crate::events::EventBus;
use crate::modules::{assign, messages};
use crate::network::NetworkMonitor;
use crate::offline::{OfflineQueue, OfflineWriter};
use crate::push::{decide_click, ClickAction, PushNotification};
use crate::sync::{SyncHandler, SyncKind, SyncOrchestrator, SyncReport, SyncTrigger};

/// Cache file name in the site directory
const CACHE_FILE: &str = "cache.json";

/// Offline queue file name in the site directory
const QUEUE_FILE: &str = "offline.json";

const SITE_INFO_FUNCTION: &str = "core_webservice_get_site_info";
const SITE_INFO_KEY: &str = "site_info";

/// Subset of `core_webservice_get_site_info` the core relies on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct SiteInfo {
    pub userid: i64,
    pub sitename: String,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub release: Option<String>,
}

pub struct SiteSession {
    data: SessionData,
    network: NetworkMonitor,
    events: EventBus,
    ws: WsClient,
    cache: Arc<ResponseCache>,
    writer: OfflineWriter,
    sync: SyncOrchestrator,
}

impl SiteSession {
    pub fn new(
        data: SessionData,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
        store: Arc<dyn CacheStore>,
        queue: OfflineQueue,
    ) -> Self {
        let ws = WsClient::new(&data.site_id, transport, network.clone(), events.clone());

        let cache = Arc::new(ResponseCache::new(&data.site_id, store, events.clone()));
        messages::register_cache_rules(&cache);
        ws.set_write_observer(cache.clone());

        let writer = OfflineWriter::new(Arc::new(queue), network.clone(), events.clone());
        let handlers: Vec<Arc<dyn SyncHandler>> =
            vec![Arc::new(messages::MessagesSync), Arc::new(assign::AssignSync)];
        let sync = SyncOrchestrator::new(handlers);

        Self {
            data,
            network,
            events,
            ws,
            cache,
            writer,
            sync,
        }
    }

    /// Session with its cache and offline queue persisted under `dir`.
    pub fn open(
        data: SessionData,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
        dir: &Path,
    ) -> Result<Self, WsError> {
        let store = JsonCacheStore::open(dir.join(CACHE_FILE))
            .map_err(|e| WsError::Storage(format!("{:#}", e)))?;
        let queue = OfflineQueue::open(&data.site_id, dir.join(QUEUE_FILE))?;
        Ok(Self::new(data, transport, network, events, Arc::new(store), queue))
    }

    /// Session whose cache and queue live only in memory.
    pub fn in_memory(
        data: SessionData,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
    ) -> Self {
        let queue = OfflineQueue::in_memory(&data.site_id);
        Self::new(
            data,
            transport,
            network,
            events,
            Arc::new(JsonCacheStore::in_memory()),
            queue,
        )
    }

    pub fn site_id(&self) -> &str {
        &self.data.site_id
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn user_id(&self) -> Option<i64> {
        self.data.user_id
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ws(&self) -> &WsClient {
        &self.ws
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn offline(&self) -> &Arc<OfflineQueue> {
        self.writer.queue()
    }

    pub fn writer(&self) -> &OfflineWriter {
        &self.writer
    }

    pub fn sync_orchestrator(&self) -> &SyncOrchestrator {
        &self.sync
    }

    pub fn presets(&self) -> WsPresets {
        WsPresets::new(&self.data.site_url, &self.data.token)
    }

    /// Cached read of a web service function expecting an object.
    pub async fn read(&self, method: &str, params: Value, options: &ReadOptions) -> Result<Value, WsError> {
        self.read_with(method, params, options, self.presets()).await
    }

    /// Cached read with explicit presets.
    ///
    /// Responses are filed under `options.cache_key` (or the function name),
    /// one variant per distinct parameter set. A read issued after an
    /// invalidation never joins a call started before it.
    pub async fn read_with(
        &self,
        method: &str,
        params: Value,
        options: &ReadOptions,
        presets: WsPresets,
    ) -> Result<Value, WsError> {
        let key = options.cache_key.as_deref().unwrap_or(method);
        let variant = hash_text(&format!("{}{}", method, params));
        let state = self.network.state();
        self.cache
            .read(key, &variant, options, &state, |generation| async move {
                self.ws
                    .call(method, params, &presets.in_generation(generation))
                    .await
            })
            .await
    }

    /// Uncached call to a function that changes server state.
    pub async fn write(&self, method: &str, params: Value, presets: WsPresets) -> Result<Value, WsError> {
        self.ws.call(method, params, &presets.as_write()).await
    }

    pub async fn site_info(&self, options: &ReadOptions) -> Result<SiteInfo, WsError> {
        let options = options
            .clone()
            .with_key(SITE_INFO_KEY)
            .with_frequency(UpdateFrequency::Rarely);
        let data = self.read(SITE_INFO_FUNCTION, json!({}), &options).await?;
        serde_json::from_value(data).map_err(WsError::from)
    }

    /// Fetch site info and copy the account fields into the session.
    pub async fn refresh_site_info(&mut self) -> Result<SiteInfo, WsError> {
        let info = self.site_info(&ReadOptions::refresh()).await?;
        self.data.user_id = Some(info.userid);
        self.data.site_name = Some(info.sitename.clone());
        self.data.full_name = Some(info.fullname.clone());
        Ok(info)
    }

    pub async fn sync(&self, kind: SyncKind, trigger: SyncTrigger) -> Result<Option<SyncReport>, WsError> {
        self.sync.run(self, kind, trigger).await
    }

    pub async fn sync_all(&self, trigger: SyncTrigger) -> Vec<SyncReport> {
        self.sync.run_all(self, trigger).await
    }

    /// Presets for a call expecting `expected`.
    pub fn presets_expecting(&self, expected: TypeExpected) -> WsPresets {
        self.presets().expecting(expected)
    }
}

/// Creates, restores and drops site sessions.
pub struct SitesManager {
    transport: Arc<dyn Transport>,
    network: NetworkMonitor,
    events: EventBus,
    tokens: Arc<dyn TokenStore>,
    /// Root for per-site directories; `None` keeps everything in memory.
    base_dir: Option<PathBuf>,
    sessions: Mutex<HashMap<String, Arc<SiteSession>>>,
    current: Mutex<Option<String>>,
}

impl SitesManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
        tokens: Arc<dyn TokenStore>,
        base_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            transport,
            network,
            events,
            tokens,
            base_dir,
            sessions: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Exchange credentials for a token, load site info and open the session.
    pub async fn login(&self, site_url: &str, username: &str, password: &str) -> Result<Arc<SiteSession>, WsError> {
        let probe = WsClient::new("", self.transport.clone(), self.network.clone(), self.events.clone());
        let token = probe.request_token(site_url, username, password).await?;

        let data = SessionData::new(site_url, username, &token);
        let mut session = self.open_session(data)?;
        let info = session.refresh_site_info().await?;

        self.tokens
            .store_token(session.site_id(), &token)
            .map_err(|e| WsError::Storage(format!("{:#}", e)))?;
        if let Some(dir) = self.site_dir(session.site_id()) {
            let mut file = Session::new(dir);
            file.update(session.data().clone());
            file.save().map_err(|e| WsError::Storage(format!("{:#}", e)))?;
        }

        info!(site_id = session.site_id(), site = %info.sitename, user_id = info.userid, "Logged in");
        Ok(self.activate(session))
    }

    /// Reopen a session saved by an earlier login.
    pub fn restore(&self, site_id: &str) -> Result<Arc<SiteSession>, WsError> {
        if let Some(session) = self.get(site_id) {
            return Ok(session);
        }

        let dir = self
            .site_dir(site_id)
            .ok_or_else(|| WsError::Storage("No site directory configured".to_string()))?;
        let mut file = Session::new(dir);
        let found = file.load().map_err(|e| WsError::Storage(format!("{:#}", e)))?;
        let mut data = match (found, file.data) {
            (true, Some(data)) => data,
            _ => return Err(WsError::Unauthorized(format!("No saved session for site {}", site_id))),
        };
        data.token = self
            .tokens
            .get_token(site_id)
            .map_err(|e| WsError::Unauthorized(format!("{:#}", e)))?;

        let session = self.open_session(data)?;
        debug!(site_id, "Session restored");
        Ok(self.activate(session))
    }

    /// Drop the session and its stored credentials. Cached data and pending
    /// actions stay on disk for the next login.
    pub fn logout(&self, site_id: &str) -> Result<(), WsError> {
        let dropped = self
            .sessions
            .lock()
            .ok()
            .and_then(|mut sessions| sessions.remove(site_id));
        if let Ok(mut current) = self.current.lock() {
            if current.as_deref() == Some(site_id) {
                *current = None;
            }
        }

        self.tokens
            .delete(site_id)
            .map_err(|e| WsError::Storage(format!("{:#}", e)))?;
        if let Some(dir) = self.site_dir(site_id) {
            Session::new(dir)
                .clear()
                .map_err(|e| WsError::Storage(format!("{:#}", e)))?;
        }

        match dropped {
            Some(session) if !session.offline().is_empty() => {
                warn!(site_id, pending = session.offline().len(), "Logged out with unsynced actions");
            }
            _ => info!(site_id, "Logged out"),
        }
        Ok(())
    }

    pub fn get(&self, site_id: &str) -> Option<Arc<SiteSession>> {
        self.sessions.lock().ok()?.get(site_id).cloned()
    }

    pub fn current(&self) -> Option<Arc<SiteSession>> {
        let id = self.current.lock().ok()?.clone()?;
        self.get(&id)
    }

    /// Decide what a notification click does and sync the entity it names.
    pub async fn handle_push_click(&self, notification: &PushNotification) -> ClickAction {
        let action = decide_click(notification);
        if let Some((kind, trigger)) = &action.sync {
            let kind = *kind;
            match self.get(&action.site_id) {
                Some(site) => {
                    if let Err(e) = site.sync(kind, trigger.clone()).await {
                        warn!(site_id = %action.site_id, %kind, error = %e, "Push sync failed");
                    }
                }
                None => debug!(site_id = %action.site_id, "Push for a site without a session"),
            }
        }
        action
    }

    fn site_dir(&self, site_id: &str) -> Option<PathBuf> {
        self.base_dir.as_ref().map(|base| base.join(site_id))
    }

    fn open_session(&self, data: SessionData) -> Result<SiteSession, WsError> {
        match self.site_dir(&data.site_id) {
            Some(dir) => SiteSession::open(data, self.transport.clone(), self.network.clone(), self.events.clone(), &dir),
            None => Ok(SiteSession::in_memory(
                data,
                self.transport.clone(),
                self.network.clone(),
                self.events.clone(),
            )),
        }
    }

    fn activate(&self, session: SiteSession) -> Arc<SiteSession> {
        let session = Arc::new(session);
        let site_id = session.site_id().to_string();
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(site_id.clone(), session.clone());
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some(site_id);
        }
        session
    }
}
