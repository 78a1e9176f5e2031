use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicU64, Ordering};

pub const JSONRPC_VERSION: &str = "2.0";

/// Longest raw payload carried in a failure reason
pub const MAX_RAW_BYTES: usize = 512;

/// An outgoing request carrying a correlation id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestEnvelope {
    pub correlation_id: u64,
    pub method: String,
    pub params: Value,
}

impl RequestEnvelope {
    pub fn new(correlation_id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            correlation_id,
            method: method.into(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": self.correlation_id,
            "method": self.method,
            "params": self.params,
        })
    }
}

/// An outgoing message that expects no response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        object.insert("method".into(), self.method.clone().into());
        if !self.params.is_null() {
            object.insert("params".into(), self.params.clone());
        }
        Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Value),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub correlation_id: u64,
    pub outcome: Outcome,
}

impl ResponseEnvelope {
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Ok(value) => Some(value),
            Outcome::Error { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Ok(_))
    }

    /// Short human description of an error outcome
    pub fn error_summary(&self) -> Option<String> {
        match &self.outcome {
            Outcome::Error { code, message } => Some(format!("error {code}: {message}")),
            Outcome::Ok(_) => None,
        }
    }
}

/// Result of decoding one inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Empty or whitespace-only input
    NoData,
    Response(ResponseEnvelope),
    /// A server-initiated notification or request
    ServerMessage { method: String },
    Malformed { raw: String, reason: String },
}

/// Newline-terminated JSON text
pub fn encode_line(request: &RequestEnvelope) -> String {
    let mut line = request.to_value().to_string();
    line.push('\n');
    line
}

/// A single JSON document
pub fn encode_body(request: &RequestEnvelope) -> String {
    request.to_value().to_string()
}

pub fn encode_notification_line(notification: &Notification) -> String {
    let mut line = notification.to_value().to_string();
    line.push('\n');
    line
}

pub fn encode_notification_body(notification: &Notification) -> String {
    notification.to_value().to_string()
}

/// Decode one inbound payload. Never fails: anything unusable is `Malformed`.
pub fn decode(text: &str) -> Decoded {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Decoded::NoData;
    }

    let malformed = |reason: String| Decoded::Malformed {
        raw: truncate_raw(trimmed, MAX_RAW_BYTES),
        reason,
    };

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) => return malformed(format!("invalid JSON: {e}")),
    };
    let Value::Object(object) = value else {
        return malformed("expected a JSON object".to_string());
    };

    if let Some(version) = object.get("jsonrpc") {
        if version.as_str() != Some(JSONRPC_VERSION) {
            return malformed(format!("unsupported jsonrpc version {version}"));
        }
    }

    if let Some(method) = object.get("method") {
        return match method.as_str() {
            Some(method) => Decoded::ServerMessage {
                method: method.to_string(),
            },
            None => malformed("method is not a string".to_string()),
        };
    }

    let Some(correlation_id) = object.get("id").and_then(Value::as_u64) else {
        return malformed("missing or non-integer id".to_string());
    };

    let outcome = match (object.get("result"), object.get("error")) {
        (Some(_), Some(_)) => return malformed("both result and error present".to_string()),
        (None, None) => return malformed("neither result nor error present".to_string()),
        (Some(result), None) => Outcome::Ok(result.clone()),
        (None, Some(error)) => {
            let Some(code) = error.get("code").and_then(Value::as_i64) else {
                return malformed("error without integer code".to_string());
            };
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Outcome::Error { code, message }
        }
    };

    Decoded::Response(ResponseEnvelope {
        correlation_id,
        outcome,
    })
}

/// Cut `raw` to at most `max` bytes on a character boundary
pub fn truncate_raw(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        return raw.to_string();
    }
    let mut end = max;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &raw[..end])
}

/// Run-wide monotonic correlation id source
#[derive(Debug)]
pub struct CorrelationIds(AtomicU64);

impl CorrelationIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn request(&self, method: impl Into<String>, params: Value) -> RequestEnvelope {
        RequestEnvelope::new(self.next(), method, params)
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}
