//! Chat session and interactive front end.
//!
//! This module holds the conversation state that sits on top of
//! [`ChatClient`](crate::ChatClient). It supports:
//!
//! - One streaming reply at a time, edited in place as tokens arrive
//! - Cancelling or clearing the conversation mid-stream
//! - ANSI-styled output for the REPL
//! - Slash commands for session control
//!
//! # Architecture
//!
//! The module is organized into several components:
//!
//! - [`config`]: CLI argument parsing and configuration
//! - [`session`]: Transcript management and stream callbacks
//! - [`commands`]: Slash command parsing and handling
//! - [`render`]: Terminal output

mod commands;
mod config;
mod render;
mod session;

pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{ChatArgs, ChatConfig};
pub use render::{PlainTextRenderer, Renderer};
pub use session::{ChatSession, SessionStats, error_annotation};
