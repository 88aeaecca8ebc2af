//! Web service client for a single site.
//!
//! `WsClient` builds REST/AJAX requests, collapses identical concurrent calls,
//! diverts calls into the overload queue when the server answers 429, and
//! validates responses against the caller's presets.

use std::sync::{Arc, RwLock};

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::file_info::{download_decision, DownloadDecision, FileInfoCache, RemoteFileInfo};
use super::request::{ajax_url, build_form, call_key, check_response, rest_url, token_url, WsPresets};
use super::retry_queue::{NextRetry, OverloadQueue, RetryCall, REPLAY_DELAY};
use super::transport::{RawResponse, Transport};
use super::{InFlightCalls, WsError};
use crate::events::{CoreEvent, EventBus};
use crate::network::NetworkMonitor;

/// Service name requested when exchanging credentials for a token.
pub const MOBILE_SERVICE: &str = "moodle_mobile_app";

/// Receives notice of accepted writes so dependent cached reads can be dropped.
pub trait WriteObserver: Send + Sync {
    fn write_succeeded(&self, method: &str);
}

/// Web service client.
/// Clone is cheap - all state lives behind one Arc and is shared by clones.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<Inner>,
}

struct Inner {
    site_id: String,
    transport: Arc<dyn Transport>,
    network: NetworkMonitor,
    events: EventBus,
    inflight: InFlightCalls,
    overload: OverloadQueue,
    files: FileInfoCache,
    write_observer: RwLock<Option<Arc<dyn WriteObserver>>>,
}

impl WsClient {
    pub fn new(
        site_id: &str,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                site_id: site_id.to_string(),
                transport,
                network,
                events,
                inflight: InFlightCalls::new(),
                overload: OverloadQueue::new(),
                files: FileInfoCache::new(),
                write_observer: RwLock::new(None),
            }),
        }
    }

    pub fn set_write_observer(&self, observer: Arc<dyn WriteObserver>) {
        if let Ok(mut slot) = self.inner.write_observer.write() {
            *slot = Some(observer);
        }
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn files(&self) -> &FileInfoCache {
        &self.inner.files
    }

    /// Distinct calls currently on the wire.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Calls waiting for the overload cooldown.
    pub fn queued_for_retry(&self) -> usize {
        self.inner.overload.len()
    }

    /// Call a web service function through the REST endpoint.
    pub async fn call(&self, method: &str, params: Value, presets: &WsPresets) -> Result<Value, WsError> {
        if !self.inner.network.is_online() {
            return Err(WsError::offline());
        }

        let url = rest_url(&presets.site_url, method);
        let key = call_key(method, &url, &params, presets);
        let form = build_form(method, &params, presets);

        let inner = self.inner.clone();
        let method = method.to_string();
        let presets = presets.clone();
        self.inner
            .inflight
            .run(key, move || inner.perform(method, url, form, presets))
            .await
    }

    /// Call a function through the AJAX endpoint.
    ///
    /// Unauthenticated calls go to `service-nologin.php`. Identical concurrent
    /// AJAX calls share one request, but they do not join the overload queue;
    /// a 429 is returned to the caller.
    pub async fn call_ajax(
        &self,
        method: &str,
        args: Value,
        presets: &WsPresets,
        authenticated: bool,
    ) -> Result<Value, WsError> {
        if !self.inner.network.is_online() {
            return Err(WsError::offline());
        }

        let url = ajax_url(&presets.site_url, method, authenticated);
        let key = call_key(method, &url, &args, presets);
        let body = json!([{ "index": 0, "methodname": method, "args": args }]);
        debug!(method, authenticated, "Calling AJAX service");

        let inner = self.inner.clone();
        let method = method.to_string();
        let presets = presets.clone();
        self.inner
            .inflight
            .run(key, move || inner.perform_ajax(method, url, body, presets))
            .await
    }

    /// Exchange credentials for a web service token.
    pub async fn request_token(
        &self,
        site_url: &str,
        username: &str,
        password: &str,
    ) -> Result<String, WsError> {
        if !self.inner.network.is_online() {
            return Err(WsError::offline());
        }

        let form = vec![
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
            ("service".to_string(), MOBILE_SERVICE.to_string()),
        ];
        let raw = self
            .inner
            .transport
            .post_form(&token_url(site_url), &form, self.inner.network.request_timeout())
            .await?;
        let data = Inner::decode(raw)?;

        if let Some(token) = data.get("token").and_then(Value::as_str) {
            info!(site = site_url, "Token obtained");
            return Ok(token.to_string());
        }

        match data.get("error").and_then(Value::as_str) {
            Some(message) => Err(WsError::Service {
                errorcode: data
                    .get("errorcode")
                    .and_then(Value::as_str)
                    .unwrap_or("invalidlogin")
                    .to_string(),
                message: message.to_string(),
            }),
            None => Err(WsError::InvalidResponse("Token response without token".to_string())),
        }
    }

    /// Size and mimetype of a remote file, from the lookup cache or a HEAD request.
    pub async fn remote_file_info(&self, url: &str, presets: &WsPresets) -> Result<RemoteFileInfo, WsError> {
        if let Some(info) = self.inner.files.get(url) {
            if info.size.is_some() && info.mimetype.is_some() {
                return Ok(info);
            }
        }
        if !self.inner.network.is_online() {
            return Err(WsError::offline());
        }

        let head_url = tokenized_file_url(url, &presets.token);
        let head = self
            .inner
            .transport
            .head(&head_url, self.inner.network.request_timeout())
            .await?;
        self.inner.files.record(
            url,
            RemoteFileInfo {
                size: head.content_length,
                mimetype: head.content_type,
            },
        );
        Ok(self.inner.files.get(url).unwrap_or_default())
    }

    /// Whether `url` may be downloaded on the current connection without asking.
    pub async fn download_eligibility(&self, url: &str, presets: &WsPresets) -> Result<DownloadDecision, WsError> {
        let info = self.remote_file_info(url, presets).await?;
        Ok(download_decision(info.size, &self.inner.network.state()))
    }
}

impl Inner {
    async fn perform_ajax(
        self: Arc<Self>,
        method: String,
        url: String,
        body: Value,
        presets: WsPresets,
    ) -> Result<Value, WsError> {
        let raw = self
            .transport
            .post_json(&url, &body, self.network.request_timeout())
            .await?;
        let data = Self::decode(raw)?;

        if let Some(err) = WsError::from_payload(&data) {
            return Err(err);
        }

        let first = data
            .get(0)
            .ok_or_else(|| WsError::InvalidResponse("Empty AJAX response".to_string()))?;
        if first.get("error").and_then(Value::as_bool).unwrap_or(false) {
            let exception = first.get("exception").cloned().unwrap_or(Value::Null);
            return Err(WsError::from_payload(&exception).unwrap_or_else(|| WsError::Service {
                errorcode: "unknown".to_string(),
                message: "AJAX call failed".to_string(),
            }));
        }

        let result = check_response(first.get("data").cloned().unwrap_or(Value::Null), &presets)?;
        self.after_success(&method, &result, &presets);
        Ok(result)
    }

    async fn perform(
        self: Arc<Self>,
        method: String,
        url: String,
        form: Vec<(String, String)>,
        presets: WsPresets,
    ) -> Result<Value, WsError> {
        if self.overload.is_active() {
            debug!(method = %method, "Server overloaded, joining retry queue");
            return self.enqueue_retry(method, url, form, presets).await;
        }

        match self.send_once(&method, &url, &form, &presets).await {
            Err(WsError::ServerOverload { retry_after }) => {
                warn!(
                    method = %method,
                    retry_after_secs = retry_after.as_secs(),
                    "Server overloaded, queueing call"
                );
                self.overload.arm(retry_after);
                self.enqueue_retry(method, url, form, presets).await
            }
            result => result,
        }
    }

    async fn enqueue_retry(
        self: &Arc<Self>,
        method: String,
        url: String,
        form: Vec<(String, String)>,
        presets: WsPresets,
    ) -> Result<Value, WsError> {
        let (reply, rx) = oneshot::channel();
        let start_replay = self.overload.push_back(RetryCall {
            method,
            url,
            form,
            presets,
            reply,
        })?;
        if start_replay {
            tokio::spawn(self.clone().replay_overloaded());
        }

        rx.await
            .unwrap_or_else(|_| Err(WsError::Network("Queued call was dropped".to_string())))
    }

    /// Drain the overload queue once its cooldown passes, one call at a time.
    async fn replay_overloaded(self: Arc<Self>) {
        loop {
            match self.overload.next() {
                NextRetry::Wait(until) => tokio::time::sleep_until(until).await,
                NextRetry::Finished => break,
                NextRetry::Replay(call) => {
                    debug!(method = %call.method, remaining = self.overload.len(), "Replaying queued call");
                    let result = self
                        .send_once(&call.method, &call.url, &call.form, &call.presets)
                        .await;

                    if let Err(WsError::ServerOverload { retry_after }) = result {
                        warn!(method = %call.method, "Still overloaded, cooling down again");
                        if self.overload.push_front(call, retry_after).is_err() {
                            break;
                        }
                        continue;
                    }

                    // The caller may have stopped waiting; the result is then discarded.
                    let _ = call.reply.send(result);
                    tokio::time::sleep(REPLAY_DELAY).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: &str,
        url: &str,
        form: &[(String, String)],
        presets: &WsPresets,
    ) -> Result<Value, WsError> {
        let timeout = self.network.request_timeout();
        debug!(method, timeout_secs = timeout.as_secs(), "Calling web service");

        let raw = self.transport.post_form(url, form, timeout).await?;
        let data = check_response(Self::decode(raw)?, presets)?;
        self.after_success(method, &data, presets);
        Ok(data)
    }

    fn decode(raw: RawResponse) -> Result<Value, WsError> {
        if !raw.is_success() {
            let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return Err(WsError::from_status(status, &raw.body, raw.retry_after));
        }
        if raw.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&raw.body)
            .map_err(|e| WsError::InvalidResponse(format!("Malformed JSON: {}", e)))
    }

    fn after_success(&self, method: &str, data: &Value, presets: &WsPresets) {
        let recorded = self.files.record_from_response(data);
        if recorded > 0 {
            debug!(method, recorded, "Recorded file metadata");
        }

        if presets.write {
            let observer = self.write_observer.read().ok().and_then(|o| o.clone());
            if let Some(observer) = observer {
                observer.write_succeeded(method);
            }
            self.events.publish(CoreEvent::WriteSucceeded {
                site_id: self.site_id.clone(),
                method: method.to_string(),
            });
        }
    }
}

/// Route pluginfile URLs through the token-authenticated endpoint.
fn tokenized_file_url(url: &str, token: &str) -> String {
    if !url.contains("/pluginfile.php") || url.contains("token=") {
        return url.to_string();
    }
    let url = if url.contains("/webservice/pluginfile.php") {
        url.to_string()
    } else {
        url.replacen("/pluginfile.php", "/webservice/pluginfile.php", 1)
    };
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}token={}", url, separator, token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HeadInfo, TypeExpected};
    use crate::network::{ConnectionType, NetworkState};
    use crate::testing::FakeTransport;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    const SITE: &str = "https://school.example";

    fn presets() -> WsPresets {
        WsPresets::new(SITE, "tok")
    }

    fn client(transport: Arc<FakeTransport>) -> WsClient {
        WsClient::new("site1", transport, NetworkMonitor::default(), EventBus::new())
    }

    #[derive(Default)]
    struct RecordingObserver(Mutex<Vec<String>>);

    impl WriteObserver for RecordingObserver {
        fn write_succeeded(&self, method: &str) {
            self.0.lock().unwrap().push(method.to_string());
        }
    }

    #[tokio::test]
    async fn test_concurrent_identical_calls_hit_network_once() {
        let transport = FakeTransport::new();
        transport.set_delay(Duration::from_millis(50));
        transport.respond("core_course_get_courses", json!({"courses": [1, 2]}));
        let ws = client(transport.clone());

        let params = json!({"options": {"ids": [1, 2]}});
        let presets = presets();
        let (a, b) = tokio::join!(
            ws.call("core_course_get_courses", params.clone(), &presets),
            ws.call("core_course_get_courses", params.clone(), &presets),
        );

        assert_eq!(a.unwrap(), json!({"courses": [1, 2]}));
        assert_eq!(b.unwrap(), json!({"courses": [1, 2]}));
        assert_eq!(transport.count("core_course_get_courses"), 1);
        assert_eq!(ws.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_params_are_not_collapsed() {
        let transport = FakeTransport::new();
        transport.set_delay(Duration::from_millis(10));
        transport.respond("m", json!({}));
        let ws = client(transport.clone());

        let presets = presets();
        let (a, b) = tokio::join!(
            ws.call("m", json!({"id": 1}), &presets),
            ws.call("m", json!({"id": 2}), &presets),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(transport.count("m"), 2);
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_answer_later_calls() {
        let transport = FakeTransport::new();
        transport.set_delay(Duration::from_millis(50));
        transport.respond("m", json!({"v": "old"}));
        transport.respond("m", json!({"v": "new"}));
        let ws = client(transport.clone());
        let presets = presets();

        let abandoned = tokio::time::timeout(Duration::from_millis(10), ws.call("m", json!({}), &presets)).await;
        assert!(abandoned.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ws.in_flight(), 0);

        let later = ws.call("m", json!({}), &presets).await.unwrap();
        assert_eq!(later, json!({"v": "new"}));
        assert_eq!(transport.count("m"), 2);
    }

    #[tokio::test]
    async fn test_calls_from_different_cache_generations_are_not_collapsed() {
        let transport = FakeTransport::new();
        transport.set_delay(Duration::from_millis(20));
        transport.respond("m", json!({"v": 1}));
        transport.respond("m", json!({"v": 2}));
        let ws = client(transport.clone());
        let before = presets().in_generation(0);
        let after = presets().in_generation(1);

        let (a, b) = tokio::join!(
            ws.call("m", json!({}), &before),
            ws.call("m", json!({}), &after),
        );
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(transport.count("m"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_identical_ajax_calls_hit_network_once() {
        let transport = FakeTransport::new();
        transport.set_delay(Duration::from_millis(20));
        transport.respond(
            "tool_mobile_get_public_config",
            json!([{"error": false, "data": {"sitename": "School"}}]),
        );
        let ws = client(transport.clone());
        let presets = presets();

        let (a, b) = tokio::join!(
            ws.call_ajax("tool_mobile_get_public_config", json!({}), &presets, false),
            ws.call_ajax("tool_mobile_get_public_config", json!({}), &presets, false),
        );
        assert_eq!(a.unwrap()["sitename"], "School");
        assert_eq!(b.unwrap()["sitename"], "School");
        assert_eq!(transport.count("tool_mobile_get_public_config"), 1);
        assert_eq!(ws.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_offline_fails_without_request() {
        let transport = FakeTransport::new();
        let ws = client(transport.clone());
        ws.network().set_offline();

        let result = ws.call("m", json!({}), &presets()).await;
        assert!(matches!(result, Err(WsError::Network(_))));
        assert_eq!(transport.count("m"), 0);
    }

    #[tokio::test]
    async fn test_form_carries_function_token_and_flattened_args() {
        let transport = FakeTransport::new();
        transport.respond("core_message_send_instant_messages", json!([{"msgid": 9}]));
        let ws = client(transport.clone());

        ws.call(
            "core_message_send_instant_messages",
            json!({"messages": [{"touserid": 4, "text": "hi"}]}),
            &presets().expecting(TypeExpected::Array),
        )
        .await
        .unwrap();

        let request = &transport.requests("core_message_send_instant_messages")[0];
        assert_eq!(request.field("wstoken"), Some("tok"));
        assert_eq!(request.field("messages[0][touserid]"), Some("4"));
        assert!(request.url.starts_with("https://school.example/webservice/rest/server.php?moodlewsrestformat=json"));
    }

    #[tokio::test]
    async fn test_timeout_follows_network_quality() {
        let transport = FakeTransport::new();
        transport.respond("m", json!({}));
        let ws = client(transport.clone());

        ws.network().set(NetworkState::online(ConnectionType::Cellular));
        ws.call("m", json!({"a": 1}), &presets()).await.unwrap();
        ws.network().set(NetworkState::online(ConnectionType::Wifi));
        ws.call("m", json!({"a": 2}), &presets()).await.unwrap();

        let requests = transport.requests("m");
        assert_eq!(requests[0].timeout, Duration::from_secs(30));
        assert_eq!(requests[1].timeout, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let transport = FakeTransport::new();
        transport.fail("m", WsError::Timeout);
        let ws = client(transport.clone());

        assert_eq!(ws.call("m", json!({}), &presets()).await, Err(WsError::Timeout));
        assert_eq!(transport.count("m"), 1);
        assert_eq!(ws.queued_for_retry(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overload_replays_all_calls_in_arrival_order_after_cooldown() {
        let transport = FakeTransport::new();
        transport.overload("mod_forum_get_forum_discussions", 3);
        transport.respond("mod_forum_get_forum_discussions", json!({"discussions": []}));
        let ws = client(transport.clone());

        let start = Instant::now();
        let mut handles = Vec::new();
        for n in 0..4 {
            let ws = ws.clone();
            handles.push(tokio::spawn(async move {
                ws.call("mod_forum_get_forum_discussions", json!({"forumid": n}), &presets())
                    .await
                    .map(|_| Instant::now())
            }));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        for handle in handles {
            let resolved_at = handle.await.unwrap().unwrap();
            assert!(resolved_at - start >= Duration::from_secs(3));
        }

        let requests = transport.requests("mod_forum_get_forum_discussions");
        let order: Vec<&str> = requests.iter().filter_map(|r| r.field("forumid")).collect();
        assert_eq!(order, vec!["0", "0", "1", "2", "3"]);
        assert!(requests[1].at - start >= Duration::from_secs(3));
        for pair in requests[1..].windows(2) {
            assert!(pair[1].at - pair[0].at >= REPLAY_DELAY);
        }
        assert_eq!(ws.queued_for_retry(), 0);
    }

    #[tokio::test]
    async fn test_service_error_surfaces_and_skips_write_observer() {
        let transport = FakeTransport::new();
        transport.respond(
            "mod_assign_save_submission",
            json!({"exception": "invalid_parameter_exception", "errorcode": "invalidparameter", "message": "Bad"}),
        );
        let ws = client(transport.clone());
        let observer = Arc::new(RecordingObserver::default());
        ws.set_write_observer(observer.clone());

        let result = ws
            .call("mod_assign_save_submission", json!({"assignmentid": 1}), &presets().as_write())
            .await;
        assert!(matches!(result, Err(WsError::Service { .. })));
        assert!(observer.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_write_notifies_observer_and_publishes_event() {
        let transport = FakeTransport::new();
        transport.respond("core_message_send_instant_messages", json!([{"msgid": 3}]));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let ws = WsClient::new("site1", transport.clone(), NetworkMonitor::default(), events);
        let observer = Arc::new(RecordingObserver::default());
        ws.set_write_observer(observer.clone());

        ws.call(
            "core_message_send_instant_messages",
            json!({}),
            &presets().expecting(TypeExpected::Array).as_write(),
        )
        .await
        .unwrap();

        assert_eq!(*observer.0.lock().unwrap(), vec!["core_message_send_instant_messages"]);
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::WriteSucceeded {
                site_id: "site1".to_string(),
                method: "core_message_send_instant_messages".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_response_files_feed_download_eligibility() {
        let transport = FakeTransport::new();
        transport.respond(
            "mod_resource_get_resources_by_courses",
            json!({"resources": [{"contentfiles": [{"fileurl": "https://school.example/pluginfile.php/9/a.mp4", "filesize": 5242880, "mimetype": "video/mp4"}]}]}),
        );
        let ws = client(transport.clone());
        ws.network().set(NetworkState::online(ConnectionType::Cellular));

        ws.call("mod_resource_get_resources_by_courses", json!({}), &presets())
            .await
            .unwrap();

        let decision = ws
            .download_eligibility("https://school.example/pluginfile.php/9/a.mp4", &presets())
            .await
            .unwrap();
        assert_eq!(decision, DownloadDecision::NeedsConfirmation { size: 5242880 });
        assert_eq!(transport.count("HEAD"), 0);
    }

    #[tokio::test]
    async fn test_remote_file_info_uses_tokenized_head() {
        let transport = FakeTransport::new();
        transport.set_head(
            "https://school.example/webservice/pluginfile.php/3/b.pdf?token=tok",
            HeadInfo {
                content_length: Some(10),
                content_type: Some("application/pdf".to_string()),
            },
        );
        let ws = client(transport.clone());

        let info = ws
            .remote_file_info("https://school.example/pluginfile.php/3/b.pdf", &presets())
            .await
            .unwrap();
        assert_eq!(info.size, Some(10));

        // Second lookup is served from the cache.
        ws.remote_file_info("https://school.example/pluginfile.php/3/b.pdf", &presets())
            .await
            .unwrap();
        assert_eq!(transport.count("HEAD"), 1);
    }

    #[tokio::test]
    async fn test_request_token() {
        let transport = FakeTransport::new();
        transport.respond("token.php", json!({"token": "abc", "privatetoken": null}));
        transport.respond("token.php", json!({"error": "Invalid login", "errorcode": "invalidlogin"}));
        let ws = client(transport.clone());

        assert_eq!(ws.request_token(SITE, "ana", "pw").await.unwrap(), "abc");
        let err = ws.request_token(SITE, "ana", "bad").await.unwrap_err();
        assert_eq!(err.errorcode(), Some("invalidlogin"));

        let request = &transport.requests("token.php")[0];
        assert_eq!(request.field("service"), Some(MOBILE_SERVICE));
    }

    #[tokio::test]
    async fn test_call_ajax_unwraps_envelope() {
        let transport = FakeTransport::new();
        transport.respond(
            "tool_mobile_get_public_config",
            json!([{"error": false, "data": {"sitename": "School"}}]),
        );
        transport.respond(
            "tool_mobile_get_public_config",
            json!([{"error": true, "exception": {"errorcode": "servicenotavailable", "message": "Off"}}]),
        );
        let ws = client(transport.clone());

        let data = ws
            .call_ajax("tool_mobile_get_public_config", json!({}), &presets(), false)
            .await
            .unwrap();
        assert_eq!(data["sitename"], "School");

        let err = ws
            .call_ajax("tool_mobile_get_public_config", json!({}), &presets(), false)
            .await
            .unwrap_err();
        assert_eq!(err.errorcode(), Some("servicenotavailable"));

        let request = &transport.requests("tool_mobile_get_public_config")[0];
        assert!(request.url.contains("/lib/ajax/service-nologin.php"));
    }

    #[test]
    fn test_tokenized_file_url() {
        assert_eq!(
            tokenized_file_url("https://s/pluginfile.php/1/a.pdf", "t"),
            "https://s/webservice/pluginfile.php/1/a.pdf?token=t"
        );
        assert_eq!(
            tokenized_file_url("https://s/webservice/pluginfile.php/1/a.pdf?forcedownload=1", "t"),
            "https://s/webservice/pluginfile.php/1/a.pdf?forcedownload=1&token=t"
        );
        assert_eq!(tokenized_file_url("https://cdn/x.png", "t"), "https://cdn/x.png");
    }
}
