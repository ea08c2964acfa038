use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::remote::RemoteError;

/// Per-connection request identifier.
pub type RequestId = u32;

/// Largest request id handed out before the counter wraps back to 1.
pub const MAX_REQUEST_ID: RequestId = (1 << 31) - 1;

/// Frame status.
///
/// A request is a single `data` frame. A response is zero or more `data`
/// frames followed by exactly one `end` or `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Data,
    End,
    Error,
}

/// Method metadata carried by every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodMeta {
    /// RPC method name (e.g. `getObject`)
    pub name: String,
    /// Sender timestamp in microseconds since the Unix epoch
    #[serde(default)]
    pub uts: u64,
}

/// Frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub m: MethodMeta,
    /// Request arguments, response payloads, or the serialized remote error
    #[serde(default)]
    pub d: Value,
}

/// A single frame on the wire.
///
/// # Example
///
/// ```
/// use moray_common::{Message, MessageStatus};
/// use serde_json::json;
///
/// let frame = Message::data(7, "findObjects", vec![json!({"key": "a"})]);
/// assert_eq!(frame.id, 7);
/// assert_eq!(frame.into_payloads(), vec![json!({"key": "a"})]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: RequestId,
    pub status: MessageStatus,
    pub data: MessageData,
}

impl Message {
    fn new(id: RequestId, status: MessageStatus, method: impl Into<String>, d: Value) -> Self {
        Self {
            id,
            status,
            data: MessageData {
                m: MethodMeta {
                    name: method.into(),
                    uts: now_micros(),
                },
                d,
            },
        }
    }

    /// Creates a request frame whose body is the positional argument list.
    pub fn request(id: RequestId, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(id, MessageStatus::Data, method, Value::Array(args))
    }

    /// Creates a response data frame carrying one or more payloads.
    pub fn data(id: RequestId, method: impl Into<String>, payloads: Vec<Value>) -> Self {
        Self::new(id, MessageStatus::Data, method, Value::Array(payloads))
    }

    /// Creates the terminal success frame of a response.
    pub fn end(id: RequestId, method: impl Into<String>) -> Self {
        Self::new(id, MessageStatus::End, method, Value::Array(Vec::new()))
    }

    /// Creates the terminal error frame of a response.
    pub fn error(id: RequestId, method: impl Into<String>, error: &RemoteError) -> Self {
        let body = serde_json::to_value(error).unwrap_or_else(|_| Value::String(error.to_string()));
        Self::new(id, MessageStatus::Error, method, body)
    }

    /// Returns the method name carried by the frame.
    pub fn method(&self) -> &str {
        &self.data.m.name
    }

    /// Returns true for `end` and `error` frames.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, MessageStatus::Data)
    }

    /// Splits the body of a data frame into individual payloads.
    ///
    /// An array body yields its elements, `null` yields nothing and any
    /// other value is treated as a single payload.
    pub fn into_payloads(self) -> Vec<Value> {
        match self.data.d {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
