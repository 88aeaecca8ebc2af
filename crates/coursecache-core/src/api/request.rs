//! Outgoing request building and response validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use super::WsError;

/// Path of the REST server, relative to the site URL.
const REST_PATH: &str = "/webservice/rest/server.php";

/// Response shape a caller expects from a web service function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeExpected {
    #[default]
    Object,
    Array,
    Number,
    Boolean,
    String,
    Any,
}

impl fmt::Display for TypeExpected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeExpected::Object => "object",
            TypeExpected::Array => "array",
            TypeExpected::Number => "number",
            TypeExpected::Boolean => "boolean",
            TypeExpected::String => "string",
            TypeExpected::Any => "any",
        };
        f.write_str(name)
    }
}

/// Per-call settings: where to send it, with which token, and what to accept back.
#[derive(Debug, Clone, PartialEq)]
pub struct WsPresets {
    pub site_url: String,
    pub token: String,
    pub type_expected: TypeExpected,
    /// When false, an empty or null body is a valid answer.
    pub response_expected: bool,
    /// Marks calls that change server state; successful writes invalidate cached reads.
    pub write: bool,
    /// Cache generation a read was issued under. Calls from different
    /// generations never share an in-flight response.
    pub cache_generation: Option<u64>,
}

impl WsPresets {
    pub fn new(site_url: &str, token: &str) -> Self {
        Self {
            site_url: site_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            type_expected: TypeExpected::Object,
            response_expected: true,
            write: false,
            cache_generation: None,
        }
    }

    pub fn expecting(mut self, type_expected: TypeExpected) -> Self {
        self.type_expected = type_expected;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        self.response_expected = false;
        self
    }

    pub fn as_write(mut self) -> Self {
        self.write = true;
        self
    }

    pub fn in_generation(mut self, generation: u64) -> Self {
        self.cache_generation = Some(generation);
        self
    }
}

/// REST endpoint URL for a web service function.
pub fn rest_url(site_url: &str, method: &str) -> String {
    format!(
        "{}{}?moodlewsrestformat=json&wsfunction={}",
        site_url.trim_end_matches('/'),
        REST_PATH,
        method
    )
}

/// AJAX endpoint URL, authenticated or not.
pub fn ajax_url(site_url: &str, method: &str, authenticated: bool) -> String {
    let script = if authenticated { "service.php" } else { "service-nologin.php" };
    format!("{}/lib/ajax/{}?info={}", site_url.trim_end_matches('/'), script, method)
}

/// Token endpoint URL used to log in.
pub fn token_url(site_url: &str) -> String {
    format!("{}/login/token.php", site_url.trim_end_matches('/'))
}

/// Flatten JSON arguments into the bracketed form fields the REST server reads.
///
/// `{"messages": [{"touserid": 5}]}` becomes `messages[0][touserid]=5`.
/// Booleans are sent as `1`/`0`; nulls are dropped.
pub fn flatten_params(params: &Value) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    if let Value::Object(map) = params {
        for (name, value) in map {
            flatten_into(name.clone(), value, &mut fields);
        }
    }
    fields
}

fn flatten_into(prefix: String, value: &Value, fields: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::Bool(b) => fields.push((prefix, if *b { "1" } else { "0" }.to_string())),
        Value::Number(n) => fields.push((prefix, n.to_string())),
        Value::String(s) => fields.push((prefix, s.clone())),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_into(format!("{}[{}]", prefix, i), item, fields);
            }
        }
        Value::Object(map) => {
            for (name, item) in map {
                flatten_into(format!("{}[{}]", prefix, name), item, fields);
            }
        }
    }
}

/// Build the full form body for a REST call.
pub fn build_form(method: &str, params: &Value, presets: &WsPresets) -> Vec<(String, String)> {
    let mut form = vec![
        ("wsfunction".to_string(), method.to_string()),
        ("wstoken".to_string(), presets.token.clone()),
        ("moodlewsrestformat".to_string(), "json".to_string()),
    ];
    form.extend(flatten_params(params));
    form
}

/// Hex SHA-256 of arbitrary text.
pub fn hash_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Identity of a call for deduplication: method + hash(url + serialized params).
pub fn call_key(method: &str, url: &str, params: &Value, presets: &WsPresets) -> String {
    // serde_json maps are ordered, so equal params serialize identically.
    let key = format!("{}#{}", method, hash_text(&format!("{}{}", url, params)));
    match presets.cache_generation {
        Some(generation) => format!("{}@{}", key, generation),
        None => key,
    }
}

/// Validate a decoded response against the presets.
pub fn check_response(data: Value, presets: &WsPresets) -> Result<Value, WsError> {
    let empty = data.is_null() || data.as_str().is_some_and(str::is_empty);
    if empty {
        return if presets.response_expected {
            Err(WsError::InvalidResponse("Empty response".to_string()))
        } else {
            Ok(Value::Null)
        };
    }

    if let Some(err) = WsError::from_payload(&data) {
        return Err(err);
    }

    coerce(data, presets.type_expected)
}

fn coerce(data: Value, expected: TypeExpected) -> Result<Value, WsError> {
    let mismatch = |data: &Value| {
        WsError::InvalidResponse(format!("Expected {}, got {}", expected, json_kind(data)))
    };

    match expected {
        TypeExpected::Any => Ok(data),
        TypeExpected::Object if data.is_object() => Ok(data),
        TypeExpected::Array if data.is_array() => Ok(data),
        TypeExpected::String if data.is_string() => Ok(data),
        TypeExpected::Number => match &data {
            Value::Number(_) => Ok(data),
            Value::String(s) => parse_number(s.trim()).ok_or_else(|| mismatch(&data)),
            _ => Err(mismatch(&data)),
        },
        TypeExpected::Boolean => match &data {
            Value::Bool(_) => Ok(data),
            Value::String(s) => match s.trim() {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&data)),
            },
            Value::Number(n) => match n.as_i64() {
                Some(1) => Ok(Value::Bool(true)),
                Some(0) => Ok(Value::Bool(false)),
                _ => Err(mismatch(&data)),
            },
            _ => Err(mismatch(&data)),
        },
        _ => Err(mismatch(&data)),
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn json_kind(data: &Value) -> &'static str {
    match data {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
