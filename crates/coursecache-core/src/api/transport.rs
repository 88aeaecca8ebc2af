//! HTTP transport used by the web service client.
//!
//! The client talks to the network through the `Transport` trait so the
//! dedup/retry/cache logic above it can be exercised without a server.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::debug;

use super::WsError;

/// Undecoded HTTP answer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, in seconds.
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Metadata from a HEAD request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadInfo {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

pub trait Transport: Send + Sync {
    /// POST an urlencoded form.
    fn post_form<'a>(
        &'a self,
        url: &'a str,
        form: &'a [(String, String)],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, WsError>>;

    /// POST a JSON body.
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, WsError>>;

    /// HEAD a file URL.
    fn head<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, Result<HeadInfo, WsError>>;
}

/// reqwest-backed transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("coursecache/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
        headers
            .get(header::RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }

    async fn read(response: reqwest::Response) -> Result<RawResponse, WsError> {
        let status = response.status().as_u16();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.map_err(WsError::from_reqwest)?;
        debug!(status, bytes = body.len(), "Response received");
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn post_form<'a>(
        &'a self,
        url: &'a str,
        form: &'a [(String, String)],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, WsError>> {
        async move {
            let response = self
                .client
                .post(url)
                .timeout(timeout)
                .form(form)
                .send()
                .await
                .map_err(WsError::from_reqwest)?;
            Self::read(response).await
        }
        .boxed()
    }

    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, WsError>> {
        async move {
            let response = self
                .client
                .post(url)
                .timeout(timeout)
                .json(body)
                .send()
                .await
                .map_err(WsError::from_reqwest)?;
            Self::read(response).await
        }
        .boxed()
    }

    fn head<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, Result<HeadInfo, WsError>> {
        async move {
            let response = self
                .client
                .head(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(WsError::from_reqwest)?;

            let status = response.status();
            if !status.is_success() {
                return Err(WsError::from_status(status, "", None));
            }

            let headers = response.headers();
            let content_length = headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

            Ok(HeadInfo {
                content_length,
                content_type,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_post_form_reads_retry_after() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/webservice/rest/server.php")
            .match_query(Matcher::Any)
            .match_body(Matcher::UrlEncoded("wsfunction".into(), "core_fetch".into()))
            .with_status(429)
            .with_header("Retry-After", "3")
            .with_body("")
            .create_async()
            .await;

        let transport = HttpTransport::new().unwrap();
        let url = format!("{}/webservice/rest/server.php?moodlewsrestformat=json", server.url());
        let form = vec![("wsfunction".to_string(), "core_fetch".to_string())];
        let response = transport
            .post_form(&url, &form, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(response.status, 429);
        assert_eq!(response.retry_after, Some(Duration::from_secs(3)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_head_strips_content_type_parameters() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("HEAD", "/pluginfile.php/1/essay.pdf")
            .with_status(200)
            .with_header("Content-Type", "application/pdf; charset=binary")
            .create_async()
            .await;

        let transport = HttpTransport::new().unwrap();
        let info = transport
            .head(&format!("{}/pluginfile.php/1/essay.pdf", server.url()), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(info.content_type.as_deref(), Some("application/pdf"));
    }
}
