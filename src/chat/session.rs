//! Core chat session management.
//!
//! This module provides the `ChatSession` struct which owns the transcript, allows one
//! streaming reply at a time, and turns stream callbacks into transcript edits.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::chat::render::Renderer;
use crate::client::ChatClient;
use crate::observability::{SESSION_SENDS, SESSION_SENDS_REJECTED};
use crate::stream::{StreamHandle, StreamHandler};
use crate::types::{ChatRequest, Message, MessageId};

/// Text appended to an assistant message when its stream fails.
pub fn error_annotation(message: &str) -> String {
    format!("\n[Error: {message}]")
}

/// A chat session that manages conversation state and streaming replies.
///
/// Callbacks locate the message they edit by id.  Callbacks for a message that is no longer
/// the active reply (because the session was cancelled or cleared) change nothing.
pub struct ChatSession {
    client: ChatClient,
    shared: Arc<Shared>,
}

/// Aggregated stats for a chat session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    /// The endpoint the session talks to.
    pub base_url: Url,
    /// The number of messages in the transcript.
    pub message_count: usize,
    /// Whether a reply is streaming.
    pub is_loading: bool,
    /// Replies that completed.
    pub completed_streams: u64,
    /// Replies that ended in an error.
    pub failed_streams: u64,
    /// Replies cancelled by the caller.
    pub cancelled_streams: u64,
}

struct Shared {
    state: Mutex<SessionState>,
    loading: watch::Sender<bool>,
}

struct SessionState {
    transcript: Vec<Message>,
    active: Option<MessageId>,
    cancel_handle: Option<StreamHandle>,
    next_id: u64,
    renderer: Option<Box<dyn Renderer>>,
    completed_streams: u64,
    failed_streams: u64,
    cancelled_streams: u64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Runs `edit` on the message `id` if it is still the active reply.
    fn edit_active(&self, id: MessageId, edit: impl FnOnce(&mut SessionState, usize)) {
        let mut state = self.lock();
        if state.active != Some(id) {
            debug!(%id, "ignoring callback for inactive message");
            return;
        }
        if let Some(index) = state.transcript.iter().position(|m| m.id == id) {
            edit(&mut *state, index);
        }
    }

    fn finish(&self, state: &mut SessionState) -> Option<StreamHandle> {
        state.active = None;
        self.loading.send_replace(false);
        state.cancel_handle.take()
    }
}

impl SessionState {
    fn allocate_id(&mut self) -> MessageId {
        self.next_id += 1;
        MessageId::new(self.next_id)
    }

    fn render(&mut self, f: impl FnOnce(&mut dyn Renderer)) {
        if let Some(renderer) = self.renderer.as_deref_mut() {
            f(renderer);
        }
    }
}

impl ChatSession {
    /// Creates a new chat session with the given client.
    pub fn new(client: ChatClient) -> Self {
        Self::build(client, None)
    }

    /// Creates a new chat session that draws streamed replies with `renderer`.
    pub fn with_renderer(client: ChatClient, renderer: impl Renderer + 'static) -> Self {
        Self::build(client, Some(Box::new(renderer)))
    }

    fn build(client: ChatClient, renderer: Option<Box<dyn Renderer>>) -> Self {
        let (loading, _) = watch::channel(false);
        let state = SessionState {
            transcript: Vec::new(),
            active: None,
            cancel_handle: None,
            next_id: 0,
            renderer,
            completed_streams: 0,
            failed_streams: 0,
            cancelled_streams: 0,
        };
        Self {
            client,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                loading,
            }),
        }
    }

    /// Sends a user message and starts streaming the reply.
    ///
    /// Returns immediately; progress shows up in the transcript.  Does nothing and returns
    /// false when `text` is blank or a reply is already streaming.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn send_message(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        // The lock is held until the handle is stored, so a stream that ends at once cannot
        // leave a stale handle behind.
        let mut state = self.shared.lock();
        if state.active.is_some() {
            SESSION_SENDS_REJECTED.click();
            debug!("rejecting send while a reply is streaming");
            return false;
        }
        SESSION_SENDS.click();

        let (request, assistant_id) = self.begin_turn(&mut state, text);
        let handler = SessionHandler {
            shared: Arc::clone(&self.shared),
            message_id: assistant_id,
        };
        state.cancel_handle = Some(self.client.stream(request, handler));
        true
    }

    // Appends the user message and the reply placeholder and marks the session loading.
    fn begin_turn(&self, state: &mut SessionState, text: &str) -> (ChatRequest, MessageId) {
        let request = ChatRequest::with_history(text, &state.transcript);
        let user_id = state.allocate_id();
        state.transcript.push(Message::user(user_id, text));
        let assistant_id = state.allocate_id();
        state
            .transcript
            .push(Message::assistant_placeholder(assistant_id));
        state.active = Some(assistant_id);
        self.shared.loading.send_replace(true);
        (request, assistant_id)
    }

    /// Stops the streaming reply, if any.
    ///
    /// The reply keeps whatever text it had received and stops streaming.  The session is idle
    /// when this returns and no callback of the cancelled stream will touch the transcript.
    pub fn cancel(&self) {
        let handle = {
            let mut state = self.shared.lock();
            if let Some(id) = state.active {
                if let Some(message) = state.transcript.iter_mut().find(|m| m.id == id) {
                    message.streaming = false;
                }
                state.cancelled_streams += 1;
                state.render(|r| r.print_interrupted());
            }
            self.shared.finish(&mut state)
        };
        // Cancelling takes the stream's callback lock; never do it while holding the state.
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Cancels any streaming reply and empties the transcript.
    pub fn clear_history(&self) {
        self.cancel();
        self.shared.lock().transcript.clear();
    }

    /// A snapshot of the transcript.
    pub fn transcript(&self) -> Vec<Message> {
        self.shared.lock().transcript.clone()
    }

    /// Returns the number of messages in the conversation.
    pub fn message_count(&self) -> usize {
        self.shared.lock().transcript.len()
    }

    /// True while a reply is streaming.
    pub fn is_loading(&self) -> bool {
        *self.shared.loading.borrow()
    }

    /// The id of the reply being streamed, if any.
    pub fn active_message_id(&self) -> Option<MessageId> {
        self.shared.lock().active
    }

    /// Watch the loading flag.
    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.shared.loading.subscribe()
    }

    /// Waits until no reply is streaming.
    pub async fn wait_until_idle(&self) {
        let mut loading = self.subscribe_loading();
        // The sender lives as long as the session, so this cannot fail while we wait.
        let _ = loading.wait_for(|loading| !*loading).await;
    }

    /// The client the session streams through.
    pub fn client(&self) -> &ChatClient {
        &self.client
    }

    /// Returns the current session statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        let state = self.shared.lock();
        SessionStats {
            base_url: self.client.base_url().clone(),
            message_count: state.transcript.len(),
            is_loading: state.active.is_some(),
            completed_streams: state.completed_streams,
            failed_streams: state.failed_streams,
            cancelled_streams: state.cancelled_streams,
        }
    }
}

struct SessionHandler {
    shared: Arc<Shared>,
    message_id: MessageId,
}

impl StreamHandler for SessionHandler {
    fn on_token(&mut self, token: &str) {
        self.shared.edit_active(self.message_id, |state, index| {
            state.transcript[index].content.push_str(token);
            state.render(|r| r.print_text(token));
        });
    }

    fn on_complete(&mut self, full_response: &str) {
        let shared = &self.shared;
        shared.edit_active(self.message_id, |state, index| {
            let message = &mut state.transcript[index];
            if !full_response.is_empty() && message.content != full_response {
                message.content = full_response.to_string();
            }
            message.streaming = false;
            state.completed_streams += 1;
            state.render(|r| r.finish_response(full_response));
            // The handle belongs to this stream, which is already finished.
            drop(shared.finish(state));
        });
    }

    fn on_error(&mut self, message: &str) {
        let shared = &self.shared;
        shared.edit_active(self.message_id, |state, index| {
            let reply = &mut state.transcript[index];
            reply.content.push_str(&error_annotation(message));
            reply.streaming = false;
            state.failed_streams += 1;
            state.render(|r| r.print_error(message));
            drop(shared.finish(state));
        });
    }
}
