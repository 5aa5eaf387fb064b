use serde::{Deserialize, Serialize};

use crate::types::{Message, MessageRole};

/// One prior turn as sent to the chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Who wrote the turn.
    pub role: MessageRole,

    /// The text of the turn.
    pub content: String,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Body of `POST /api/chat/stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The new user message.
    pub message: String,

    /// Earlier turns, oldest first, not including `message`.
    #[serde(default)]
    pub chat_history: Vec<HistoryEntry>,
}

impl ChatRequest {
    /// Create a request with no history.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            chat_history: Vec::new(),
        }
    }

    /// Create a request whose history is projected from transcript entries.
    pub fn with_history<'a>(
        message: impl Into<String>,
        history: impl IntoIterator<Item = &'a Message>,
    ) -> Self {
        Self {
            message: message.into(),
            chat_history: history.into_iter().map(HistoryEntry::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageId;
    use serde_json::{json, to_value};

    #[test]
    fn request_serialization() {
        let transcript = vec![
            Message::user(MessageId::new(1), "Hello"),
            Message {
                content: "Hi!".to_string(),
                ..Message::assistant_placeholder(MessageId::new(2))
            },
        ];
        let request = ChatRequest::with_history("How are you?", &transcript);

        assert_eq!(
            to_value(&request).unwrap(),
            json!({
                "message": "How are you?",
                "chat_history": [
                    {"role": "user", "content": "Hello"},
                    {"role": "assistant", "content": "Hi!"}
                ]
            })
        );
    }

    #[test]
    fn missing_history_defaults_to_empty() {
        let request: ChatRequest = serde_json::from_value(json!({"message": "hey"})).unwrap();
        assert_eq!(request, ChatRequest::new("hey"));
    }
}
