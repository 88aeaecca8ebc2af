//! Scripted transport shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;

use crate::api::{HeadInfo, RawResponse, Transport, WsError};

/// One request seen by the fake.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub form: Vec<(String, String)>,
    pub json: Option<Value>,
    pub timeout: Duration,
    pub at: Instant,
}

impl Recorded {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

type Scripted = Result<RawResponse, WsError>;

/// Transport answering from per-function scripts. The last scripted answer repeats.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    heads: Mutex<HashMap<String, HeadInfo>>,
    requests: Mutex<Vec<Recorded>>,
    delay: Mutex<Duration>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn push(&self, method: &str, answer: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(answer);
    }

    pub fn respond(&self, method: &str, body: Value) {
        self.push(method, Ok(RawResponse::ok(body.to_string())));
    }

    pub fn fail(&self, method: &str, err: WsError) {
        self.push(method, Err(err));
    }

    pub fn overload(&self, method: &str, retry_after_secs: u64) {
        self.push(
            method,
            Ok(RawResponse {
                status: 429,
                retry_after: Some(Duration::from_secs(retry_after_secs)),
                body: String::new(),
            }),
        );
    }

    pub fn set_head(&self, url: &str, info: HeadInfo) {
        self.heads.lock().unwrap().insert(url.to_string(), info);
    }

    pub fn requests(&self, method: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests(method).len()
    }

    fn answer(&self, method: &str) -> Scripted {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(method) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Err(WsError::InvalidResponse(format!("no scripted answer for {}", method))),
        }
    }

    fn record(&self, recorded: Recorded) {
        self.requests.lock().unwrap().push(recorded);
    }

    async fn respond_after_delay(&self, method: String) -> Scripted {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.answer(&method)
    }
}

impl Transport for FakeTransport {
    fn post_form<'a>(
        &'a self,
        url: &'a str,
        form: &'a [(String, String)],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, WsError>> {
        let method = form
            .iter()
            .find(|(k, _)| k == "wsfunction")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| {
                // login/token.php carries no wsfunction
                url.rsplit('/').next().unwrap_or_default().to_string()
            });
        self.record(Recorded {
            method: method.clone(),
            url: url.to_string(),
            form: form.to_vec(),
            json: None,
            timeout,
            at: Instant::now(),
        });
        self.respond_after_delay(method).boxed()
    }

    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, WsError>> {
        let method = body[0]["methodname"].as_str().unwrap_or_default().to_string();
        self.record(Recorded {
            method: method.clone(),
            url: url.to_string(),
            form: Vec::new(),
            json: Some(body.clone()),
            timeout,
            at: Instant::now(),
        });
        self.respond_after_delay(method).boxed()
    }

    fn head<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, Result<HeadInfo, WsError>> {
        self.record(Recorded {
            method: "HEAD".to_string(),
            url: url.to_string(),
            form: Vec::new(),
            json: None,
            timeout,
            at: Instant::now(),
        });
        let info = self.heads.lock().unwrap().get(url).cloned();
        async move { info.ok_or_else(|| WsError::Network("not found".to_string())) }.boxed()
    }
}

/// Fresh scratch directory under the system temp dir.
pub fn temp_dir(name: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let dir = std::env::temp_dir().join(format!(
        "coursecache_test_{}_{}_{}",
        name,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Logged-in in-memory session for `site1` (user 42) over `transport`.
pub fn test_site(transport: Arc<FakeTransport>) -> crate::site::SiteSession {
    let mut data = crate::auth::SessionData::new("https://school.example", "ana", "tok");
    data.site_id = "site1".to_string();
    data.user_id = Some(42);
    crate::site::SiteSession::in_memory(
        data,
        transport,
        crate::network::NetworkMonitor::default(),
        crate::events::EventBus::new(),
    )
}

/// Token store kept in memory.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl crate::auth::TokenStore for MemoryTokenStore {
    fn store_token(&self, site_id: &str, token: &str) -> anyhow::Result<()> {
        self.tokens
            .lock()
            .unwrap()
            .insert(site_id.to_string(), token.to_string());
        Ok(())
    }

    fn get_token(&self, site_id: &str) -> anyhow::Result<String> {
        self.tokens
            .lock()
            .unwrap()
            .get(site_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No token for {}", site_id))
    }

    fn delete(&self, site_id: &str) -> anyhow::Result<()> {
        self.tokens.lock().unwrap().remove(site_id);
        Ok(())
    }
}
