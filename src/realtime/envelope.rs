//! Frames exchanged with live connections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::posts::Post;

/// Opaque message received from a client.
pub const INBOUND: i32 = 1;
/// A post reached the recipient's feed; `data` is the post.
pub const FEED_UPDATED: i32 = 2;
/// Server notice such as a superseded session; `data` is `{reason}`.
pub const NOTICE: i32 = 3;

/// `{type, data}` frame carried over a live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: i32, data: Value) -> Self {
        Self { kind, data }
    }

    pub fn feed_updated(post: &Post) -> Result<Self, serde_json::Error> {
        Ok(Self::new(FEED_UPDATED, serde_json::to_value(post)?))
    }

    pub fn notice(reason: &str) -> Self {
        Self::new(NOTICE, serde_json::json!({ "reason": reason }))
    }

    /// Wrap a text frame from a client. Non-JSON text is carried as a string.
    pub fn inbound(text: &str) -> Self {
        let data = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        Self::new(INBOUND, data)
    }
}
