//! Message classification for the broker wire protocol.
//!
//! Implements tolerant reader pattern: messages keep their raw JSON so the
//! broker can forward them verbatim, and unknown fields are ignored.

use serde_json::{Value, json};

/// How a message participates in the request/response protocol.
///
/// Classification precedence: a `method` plus a correlation `id` makes a
/// request; otherwise a `result` or `error` field makes a response;
/// everything else is a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message must be a JSON object: {0}")]
    NotAnObject(String),
}

/// A single wire message: classified once, raw JSON retained.
#[derive(Debug, Clone)]
pub struct WireMessage {
    kind: MessageKind,
    raw: Value,
}

impl WireMessage {
    /// Parse one text frame from the transport.
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let raw: Value = serde_json::from_str(text)?;
        Self::from_value(raw)
    }

    /// Wrap an already-deserialized JSON value.
    pub fn from_value(raw: Value) -> Result<Self, WireError> {
        if !raw.is_object() {
            return Err(WireError::NotAnObject(raw.to_string()));
        }
        let kind = classify(&raw);
        Ok(Self { kind, raw })
    }

    /// Build an outbound request carrying a correlation id.
    pub fn request(id: &str, method: &str, params: Value) -> Self {
        Self {
            kind: MessageKind::Request,
            raw: json!({ "id": id, "method": method, "params": params }),
        }
    }

    /// Build a successful response to a received request.
    pub fn response(id: &str, result: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            raw: json!({ "id": id, "result": result }),
        }
    }

    /// Build an error response with a stable string code.
    pub fn error_response(id: &str, code: &str, message: &str) -> Self {
        Self {
            kind: MessageKind::Response,
            raw: json!({ "id": id, "error": { "code": code, "message": message } }),
        }
    }

    /// Build a notification (no correlation id, no reply expected).
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            kind: MessageKind::Notification,
            raw: json!({ "method": method, "params": params }),
        }
    }

    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Correlation id, normalized to a string. Accepts string and integer
    /// ids; a `null` id does not count as one.
    pub fn id(&self) -> Option<String> {
        match self.raw.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.raw.get("method").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Value> {
        self.raw.get("params")
    }

    pub fn result(&self) -> Option<&Value> {
        self.raw.get("result")
    }

    pub fn error(&self) -> Option<&Value> {
        self.raw.get("error")
    }

    pub const fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    /// Serialize back to a single-line JSON string for the transport.
    pub fn to_text(&self) -> String {
        self.raw.to_string()
    }
}

fn classify(raw: &Value) -> MessageKind {
    let has_method = raw.get("method").and_then(Value::as_str).is_some();
    let has_id = raw.get("id").is_some_and(|v| !v.is_null());
    if has_method && has_id {
        MessageKind::Request
    } else if raw.get("result").is_some() || raw.get("error").is_some() {
        MessageKind::Response
    } else {
        MessageKind::Notification
    }
}
