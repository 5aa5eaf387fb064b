use serde::{Deserialize, Serialize};

/// Message reported when an `error` event carries no message of its own.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// An event decoded from one `data:` frame of a chat stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// The stream opened.
    Start,

    /// One incremental text fragment.
    Token {
        /// The fragment to append.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// The stream finished.
    End {
        /// Canonical final text; wins over the concatenated tokens when non-empty.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        full_response: Option<String>,
    },

    /// The server gave up on the stream.
    Error {
        /// Human-readable reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl StreamEvent {
    /// Create a token event.
    pub fn token(content: impl Into<String>) -> Self {
        StreamEvent::Token {
            content: Some(content.into()),
        }
    }

    /// Create an end event.
    pub fn end(full_response: impl Into<String>) -> Self {
        StreamEvent::End {
            full_response: Some(full_response.into()),
        }
    }

    /// Create an error event.
    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: Some(message.into()),
        }
    }

    /// True for `end` and `error`: nothing after them is processed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Error { .. })
    }

    /// The wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start => "start",
            StreamEvent::Token { .. } => "token",
            StreamEvent::End { .. } => "end",
            StreamEvent::Error { .. } => "error",
        }
    }
}
