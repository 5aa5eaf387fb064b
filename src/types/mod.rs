// Public modules
pub mod chat_request;
pub mod health;
pub mod message;
pub mod stream_event;

// Re-exports
pub use chat_request::{ChatRequest, HistoryEntry};
pub use health::HealthStatus;
pub use message::{Message, MessageId, MessageRole};
pub use stream_event::{StreamEvent, UNKNOWN_ERROR};
