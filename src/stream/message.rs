//! Typed message envelopes delivered over streaming connections
//!
//! Every server-initiated frame is one of these envelopes, discriminated by
//! `type`. The terminal `done` frame is always observed after all preceding
//! `token` frames on the same connection (FIFO per connection).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope discriminated by `type` on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Incremental chat completion delta
    Token { content: String },
    /// Terminal frame for a chat completion stream
    Done,
    /// Dashboard refresh signal; subscribers re-fetch current state
    Refresh { ts: DateTime<Utc> },
    /// Keepalive
    Ping { ts: DateTime<Utc> },
    /// Terminal error frame, followed by connection close
    Error { message: String },
}

impl StreamMessage {
    pub fn token(content: impl Into<String>) -> Self {
        StreamMessage::Token {
            content: content.into(),
        }
    }

    pub fn refresh() -> Self {
        StreamMessage::Refresh { ts: Utc::now() }
    }

    pub fn ping() -> Self {
        StreamMessage::Ping { ts: Utc::now() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamMessage::Error {
            message: message.into(),
        }
    }

    /// Serialized JSON for the SSE `data:` field
    pub fn to_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
