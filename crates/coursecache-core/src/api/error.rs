use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Cooldown applied when the server signals overload without a usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Error codes the server uses when the token is no longer accepted.
const TOKEN_ERROR_CODES: &[&str] = &["invalidtoken", "accessexception"];

/// Errors produced by the web service layer.
///
/// Variants are `Clone` so one result can be handed to every caller sharing a
/// deduplicated in-flight call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WsError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server overloaded - retry after {}s", retry_after.as_secs())]
    ServerOverload { retry_after: Duration },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{message} ({errorcode})")]
    Service { errorcode: String, message: String },

    #[error("Unauthorized - token may be invalid: {0}")]
    Unauthorized(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl WsError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let cut: String = body.chars().take(MAX_ERROR_BODY_LENGTH).collect();
            format!("{}... (truncated, {} total bytes)", cut, body.len())
        }
    }

    pub fn offline() -> Self {
        WsError::Network("No connection available".to_string())
    }

    /// Translate a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: &str, retry_after: Option<Duration>) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 | 403 => WsError::Unauthorized(truncated),
            429 => WsError::ServerOverload {
                retry_after: retry_after
                    .unwrap_or(Duration::from_secs(DEFAULT_RETRY_AFTER_SECS)),
            },
            // The site is unreachable or misbehaving; the write may succeed later.
            408 | 500..=599 => {
                WsError::Network(format!("Cannot connect to site (status {}): {}", status, truncated))
            }
            _ => WsError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Translate a transport failure.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WsError::Timeout
        } else {
            WsError::Network(err.to_string())
        }
    }

    /// Detect the error marker the web service embeds in an otherwise successful response.
    pub fn from_payload(data: &Value) -> Option<Self> {
        let obj = data.as_object()?;
        if !obj.contains_key("exception") && !obj.contains_key("errorcode") {
            return None;
        }

        let errorcode = obj
            .get("errorcode")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let message = obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();

        if TOKEN_ERROR_CODES.contains(&errorcode.as_str()) {
            return Some(WsError::Unauthorized(message));
        }
        Some(WsError::Service { errorcode, message })
    }

    /// Failures that say nothing about the request itself and may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WsError::Network(_) | WsError::Timeout | WsError::ServerOverload { .. }
        )
    }

    /// The server looked at the request and rejected it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            WsError::Service { .. } | WsError::InvalidResponse(_) | WsError::Unauthorized(_)
        )
    }

    pub fn errorcode(&self) -> Option<&str> {
        match self {
            WsError::Service { errorcode, .. } => Some(errorcode),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        WsError::InvalidResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use serde_json::json;

    #[test]
    fn test_from_status_overload_uses_header_or_default() {
        let err = WsError::from_status(StatusCode::TOO_MANY_REQUESTS, "", Some(Duration::from_secs(3)));
        assert_eq!(err, WsError::ServerOverload { retry_after: Duration::from_secs(3) });

        let err = WsError::from_status(StatusCode::TOO_MANY_REQUESTS, "", None);
        assert_eq!(err, WsError::ServerOverload { retry_after: Duration::from_secs(5) });
    }

    #[test]
    fn test_from_status_server_errors_are_transient() {
        assert!(WsError::from_status(StatusCode::BAD_GATEWAY, "down", None).is_transient());
        assert!(WsError::from_status(StatusCode::UNAUTHORIZED, "", None).is_rejection());
        assert!(!WsError::from_status(StatusCode::NOT_FOUND, "", None).is_transient());
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(600);
        let err = WsError::from_status(StatusCode::NOT_FOUND, &long, None);
        assert!(err.to_string().contains("truncated, 600 total bytes"));
    }

    #[test]
    fn test_from_payload() {
        assert_eq!(WsError::from_payload(&json!({"id": 3})), None);
        assert_eq!(WsError::from_payload(&json!([1, 2])), None);

        let err = WsError::from_payload(&json!({
            "exception": "invalid_parameter_exception",
            "errorcode": "invalidparameter",
            "message": "Invalid parameter value detected"
        }))
        .unwrap();
        assert_eq!(err.errorcode(), Some("invalidparameter"));
        assert!(err.is_rejection());

        let err = WsError::from_payload(&json!({"errorcode": "invalidtoken", "message": "Invalid token"}))
            .unwrap();
        assert!(matches!(err, WsError::Unauthorized(_)));
    }
}
