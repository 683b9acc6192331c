// src/reply.rs

//! Wire-level reply shapes.
//!
//! Every service reply is a [`ReplyEnvelope`]: `{ "error": ..., "payload": ... }`
//! with exactly one side populated (both may be `null` for a handler that
//! returned nothing). Errors cross the wire as [`ErrorObject`] — the error's
//! name, message and any custom fields, so the caller can reconstruct it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured error carried inside a [`ReplyEnvelope`].
///
/// Custom fields ride in `fields` and are flattened on the wire, so a handler
/// failure `{ name, message, foo: 42 }` round-trips with `foo` intact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ErrorObject {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            fields: Map::new(),
        }
    }

    /// Attach a custom field. Keys matching the internal bookkeeping pattern
    /// `*__old<N>` are dropped instead of serialized.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !is_shadowed_key(&key) {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub(crate) fn retry_limit_exceeded() -> Self {
        Self::new("RetryLimitExceededError", "Retry limit exceeded")
    }

    pub(crate) fn handler_not_found(action: &str, message_id: Option<&str>) -> Self {
        Self::new("HandlerNotFoundError", "Handler for action not found")
            .with_field("action", action)
            .with_field("messageId", message_id.unwrap_or_default())
    }

    pub(crate) fn handler_construction(action: &str, original: ErrorObject) -> Self {
        let original = serde_json::to_value(&original).unwrap_or(Value::Null);
        Self::new("HandlerConstructionError", "Error on construct handler")
            .with_field("action", action)
            .with_field("originalError", original)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorObject {}

impl From<crate::RpcError> for ErrorObject {
    /// Lifecycle-internal failures (sealing misuse, transport errors while
    /// replying, retry exhaustion) become wire errors like any business error.
    fn from(err: crate::RpcError) -> Self {
        let name = match &err {
            crate::RpcError::RetryLimitExceeded => "RetryLimitExceededError",
            crate::RpcError::AlreadySealed => "AlreadySealedError",
            crate::RpcError::Timeout => "TimeoutError",
            crate::RpcError::Serialization(_) => "SerializationError",
            _ => "RpcError",
        };
        Self::new(name, err.to_string())
    }
}

/// Reply body shape: `{ "error": ErrorObject|null, "payload": any|null }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub error: Option<ErrorObject>,
    pub payload: Value,
}

impl ReplyEnvelope {
    pub fn success(payload: Option<Value>) -> Self {
        Self {
            error: None,
            payload: payload.unwrap_or(Value::Null),
        }
    }

    pub fn failure(error: ErrorObject) -> Self {
        Self {
            error: Some(error),
            payload: Value::Null,
        }
    }
}

/// Internal bookkeeping keys (`*__old<N>`) never cross the wire.
fn is_shadowed_key(key: &str) -> bool {
    match key.rfind("__old") {
        Some(idx) => {
            let suffix = &key[idx + "__old".len()..];
            !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}
