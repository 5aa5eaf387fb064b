//! Client and session for a streaming chat service.
//!
//! [`ChatClient`] posts a message to the service and streams the reply back as
//! server-sent events, reporting progress through a [`StreamHandler`].
//! [`chat::ChatSession`] keeps the conversation and edits the assistant's reply in place as
//! tokens arrive.

// Public modules
pub mod chat;
pub mod client;
pub mod error;
pub mod observability;
pub mod sse;
pub mod stream;
pub mod types;
pub mod utils;

// Re-exports
pub use client::{ByteStream, ChatClient};
pub use error::{Error, Result};
pub use observability::register_biometrics;
pub use stream::{StreamHandle, StreamHandler, callbacks, spawn_stream};
pub use types::*;
