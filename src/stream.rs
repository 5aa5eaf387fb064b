//! Callback dispatch for one chat stream.
//!
//! A stream runs on its own tokio task.  The task turns decoded [`StreamEvent`]s into calls
//! on a [`StreamHandler`]: zero or more `on_token` calls followed by at most one terminal
//! `on_complete` or `on_error`.  The [`StreamHandle`] returned to the caller cancels it.
//!
//! Every callback runs while holding the stream's liveness lock, and [`StreamHandle::cancel`]
//! takes the same lock.  Once `cancel` returns, no further callback can start, even for frames
//! that were already buffered.  A handler must therefore never cancel its own stream from
//! inside a callback.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::observability::{
    STREAM_CANCELLATIONS, STREAM_DURATION, STREAM_ERRORS, STREAM_EVENTS, STREAM_TTFB,
};
use crate::sse::process_sse;
use crate::types::UNKNOWN_ERROR;
use crate::{Error, Result, StreamEvent};

/// Error reported when the body ends without an `end` or `error` frame.
pub const INCOMPLETE_STREAM: &str = "stream ended before completion";

/// Receives the callbacks of one stream.
pub trait StreamHandler: Send + 'static {
    /// Called once per non-empty `token` frame, in arrival order.
    fn on_token(&mut self, token: &str);

    /// Called once when the stream ends normally.
    ///
    /// `full_response` is the server's canonical text when it sent a non-empty one, otherwise
    /// the concatenation of every token delivered.
    fn on_complete(&mut self, full_response: &str);

    /// Called once when the stream fails, either at the transport or by an `error` frame.
    fn on_error(&mut self, message: &str);
}

/// A [`StreamHandler`] built from three closures.
pub struct FnHandler<T, C, E> {
    on_token: T,
    on_complete: C,
    on_error: E,
}

/// Build a [`StreamHandler`] from token, completion, and error closures.
pub fn callbacks<T, C, E>(on_token: T, on_complete: C, on_error: E) -> FnHandler<T, C, E>
where
    T: FnMut(&str) + Send + 'static,
    C: FnMut(&str) + Send + 'static,
    E: FnMut(&str) + Send + 'static,
{
    FnHandler {
        on_token,
        on_complete,
        on_error,
    }
}

impl<T, C, E> StreamHandler for FnHandler<T, C, E>
where
    T: FnMut(&str) + Send + 'static,
    C: FnMut(&str) + Send + 'static,
    E: FnMut(&str) + Send + 'static,
{
    fn on_token(&mut self, token: &str) {
        (self.on_token)(token)
    }

    fn on_complete(&mut self, full_response: &str) {
        (self.on_complete)(full_response)
    }

    fn on_error(&mut self, message: &str) {
        (self.on_error)(message)
    }
}

struct StreamControl {
    cancel: CancellationToken,
    done: CancellationToken,
    // False once a terminal callback fired or the stream was cancelled.
    live: Mutex<bool>,
}

impl StreamControl {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running stream.
///
/// Dropping the handle does not cancel the stream.
pub struct StreamHandle {
    control: Arc<StreamControl>,
}

impl StreamHandle {
    /// Abort the stream.
    ///
    /// No callback fires after this returns.  Cancelling a stream that already finished, or
    /// cancelling twice, does nothing.
    pub fn cancel(&self) {
        let mut live = self.control.lock();
        if *live {
            *live = false;
            STREAM_CANCELLATIONS.click();
            debug!("stream cancelled");
        }
        self.control.cancel.cancel();
    }

    /// True once the stream's task has exited.
    pub fn is_finished(&self) -> bool {
        self.control.done.is_cancelled()
    }

    /// Wait for the stream's task to exit, after its terminal callback or cancellation.
    pub async fn finished(&self) {
        self.control.done.cancelled().await
    }
}

/// Spawn a stream on the current tokio runtime.
///
/// `source` opens the connection and resolves to the response body.  If it fails, the error is
/// reported through `on_error`.  If the stream is cancelled first, nothing is reported.
///
/// # Panics
///
/// Panics when called outside a tokio runtime.
pub fn spawn_stream<H, F, S>(source: F, handler: H) -> StreamHandle
where
    H: StreamHandler,
    F: Future<Output = Result<S>> + Send + 'static,
    S: Stream<Item = Result<Bytes>> + Unpin + Send + 'static,
{
    let control = Arc::new(StreamControl {
        cancel: CancellationToken::new(),
        done: CancellationToken::new(),
        live: Mutex::new(true),
    });
    let dispatcher = Dispatcher::new(handler, Arc::clone(&control));
    tokio::spawn(async move {
        if let Err(err) = dispatcher.run(source).await {
            debug!(error = %err, "stream stopped");
        }
    });
    StreamHandle { control }
}

fn cancelled() -> Error {
    Error::abort("stream cancelled by caller")
}

struct Dispatcher<H> {
    handler: H,
    control: Arc<StreamControl>,
    accumulated: String,
    started: Instant,
    first_event: bool,
}

impl<H: StreamHandler> Dispatcher<H> {
    fn new(handler: H, control: Arc<StreamControl>) -> Self {
        Self {
            handler,
            control,
            accumulated: String::new(),
            started: Instant::now(),
            first_event: true,
        }
    }

    // Failures are reported through the handler; only cancellation comes back as an error.
    async fn run<F, S>(mut self, source: F) -> Result<()>
    where
        F: Future<Output = Result<S>>,
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let _done = self.control.done.clone().drop_guard();
        let cancel = self.control.cancel.clone();

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            body = source => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                self.fail(&err.to_string());
                return Ok(());
            }
        };

        let events = process_sse(body);
        futures::pin_mut!(events);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if !self.dispatch(event) {
                        return Ok(());
                    }
                }
                Some(Err(err)) => {
                    self.fail(&err.to_string());
                    return Ok(());
                }
                None => {
                    self.fail(INCOMPLETE_STREAM);
                    return Ok(());
                }
            }
        }
    }

    // Returns false once the stream should stop reading.
    fn dispatch(&mut self, event: StreamEvent) -> bool {
        STREAM_EVENTS.click();
        if self.first_event {
            self.first_event = false;
            STREAM_TTFB.add(self.started.elapsed().as_secs_f64());
        }
        match event {
            StreamEvent::Start => {
                debug!("stream started");
                true
            }
            StreamEvent::Token { content } => match content {
                Some(content) if !content.is_empty() => {
                    self.accumulated.push_str(&content);
                    self.deliver(false, |handler| handler.on_token(&content))
                }
                _ => true,
            },
            StreamEvent::End { full_response } => {
                let full_response = match full_response {
                    Some(text) if !text.is_empty() => text,
                    _ => std::mem::take(&mut self.accumulated),
                };
                STREAM_DURATION.add(self.started.elapsed().as_secs_f64());
                debug!(len = full_response.len(), "stream completed");
                self.deliver(true, |handler| handler.on_complete(&full_response));
                false
            }
            StreamEvent::Error { message } => {
                let message = message.unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                self.fail(&message);
                false
            }
        }
    }

    fn fail(&mut self, message: &str) {
        STREAM_ERRORS.click();
        debug!(error = message, "stream failed");
        self.deliver(true, |handler| handler.on_error(message));
    }

    // Runs `callback` unless the stream is no longer live.  Returns whether it is still live.
    fn deliver(&mut self, terminal: bool, callback: impl FnOnce(&mut H)) -> bool {
        let mut live = self.control.lock();
        if !*live {
            return false;
        }
        if terminal {
            *live = false;
        }
        callback(&mut self.handler);
        *live
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::channel::mpsc;
    use futures::future;

    use super::*;
    use crate::Error;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Token(String),
        Complete(String),
        Error(String),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StreamHandler for Recorder {
        fn on_token(&mut self, token: &str) {
            self.calls.lock().unwrap().push(Call::Token(token.to_string()));
        }

        fn on_complete(&mut self, full_response: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Complete(full_response.to_string()));
        }

        fn on_error(&mut self, message: &str) {
            self.calls.lock().unwrap().push(Call::Error(message.to_string()));
        }
    }

    fn body(frames: &[&str]) -> futures::stream::Iter<std::vec::IntoIter<Result<Bytes>>> {
        let chunks: Vec<Result<Bytes>> = frames
            .iter()
            .map(|frame| Ok(Bytes::from(frame.to_string())))
            .collect();
        futures::stream::iter(chunks)
    }

    async fn run_to_end(frames: &[&str]) -> Vec<Call> {
        let recorder = Recorder::default();
        let body = body(frames);
        let handle = spawn_stream(async move { Ok(body) }, recorder.clone());
        tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .expect("stream should finish");
        recorder.calls()
    }

    async fn wait_for_calls(recorder: &Recorder, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.calls().len() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("callbacks should arrive");
    }

    #[tokio::test]
    async fn tokens_then_complete() {
        let calls = run_to_end(&[
            "data: {\"type\":\"start\"}\n\n",
            "data: {\"type\":\"token\",\"content\":\"Hi\"}\n\n",
            "data: {\"type\":\"token\",\"content\":\" there\"}\n\n",
            "data: {\"type\":\"end\",\"full_response\":\"Hi there\"}\n\n",
        ])
        .await;
        assert_eq!(
            calls,
            vec![
                Call::Token("Hi".to_string()),
                Call::Token(" there".to_string()),
                Call::Complete("Hi there".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_tokens_are_not_delivered() {
        let calls = run_to_end(&[
            "data: {\"type\":\"token\",\"content\":\"\"}\n\n",
            "data: {\"type\":\"token\"}\n\n",
            "data: {\"type\":\"token\",\"content\":\"x\"}\n\n",
            "data: {\"type\":\"end\",\"full_response\":\"x\"}\n\n",
        ])
        .await;
        assert_eq!(
            calls,
            vec![Call::Token("x".to_string()), Call::Complete("x".to_string())]
        );
    }

    #[tokio::test]
    async fn end_without_full_response_uses_tokens() {
        let calls = run_to_end(&[
            "data: {\"type\":\"token\",\"content\":\"a\"}\n\n",
            "data: {\"type\":\"token\",\"content\":\"b\"}\n\n",
            "data: {\"type\":\"end\",\"full_response\":\"\"}\n\n",
        ])
        .await;
        assert_eq!(calls.last(), Some(&Call::Complete("ab".to_string())));

        let calls = run_to_end(&["data: {\"type\":\"end\"}\n\n"]).await;
        assert_eq!(calls, vec![Call::Complete(String::new())]);
    }

    #[tokio::test]
    async fn error_event_is_terminal() {
        let calls = run_to_end(&[
            "data: {\"type\":\"token\",\"content\":\"a\"}\n\n",
            "data: {\"type\":\"error\",\"message\":\"model overloaded\"}\n\n",
            "data: {\"type\":\"token\",\"content\":\"b\"}\n\n",
        ])
        .await;
        assert_eq!(
            calls,
            vec![
                Call::Token("a".to_string()),
                Call::Error("model overloaded".to_string()),
            ]
        );

        let calls = run_to_end(&["data: {\"type\":\"error\"}\n\n"]).await;
        assert_eq!(calls, vec![Call::Error(UNKNOWN_ERROR.to_string())]);
    }

    #[tokio::test]
    async fn nothing_after_end() {
        let calls = run_to_end(&[
            "data: {\"type\":\"end\",\"full_response\":\"done\"}\n\ndata: {\"type\":\"token\",\"content\":\"late\"}\n\n",
            "data: {\"type\":\"error\",\"message\":\"late\"}\n\n",
        ])
        .await;
        assert_eq!(calls, vec![Call::Complete("done".to_string())]);
    }

    #[tokio::test]
    async fn malformed_frame_does_not_fail_stream() {
        let calls = run_to_end(&[
            "data: {\"type\":\"token\",\"content\":\"a\"}\n\n",
            "data: {oops}\n\n",
            "data: {\"type\":\"token\",\"content\":\"b\"}\n\n",
            "data: {\"type\":\"end\",\"full_response\":\"ab\"}\n\n",
        ])
        .await;
        assert_eq!(
            calls,
            vec![
                Call::Token("a".to_string()),
                Call::Token("b".to_string()),
                Call::Complete("ab".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn eof_without_terminal_is_an_error() {
        let calls = run_to_end(&["data: {\"type\":\"token\",\"content\":\"Par\"}\n\n"]).await;
        assert_eq!(
            calls,
            vec![
                Call::Token("Par".to_string()),
                Call::Error(INCOMPLETE_STREAM.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn transport_error_reported_once() {
        let recorder = Recorder::default();
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"token\",\"content\":\"Par\"}\n\n")),
            Err(Error::streaming("connection reset", None)),
        ];
        let handle = spawn_stream(
            async move { Ok(futures::stream::iter(chunks)) },
            recorder.clone(),
        );
        handle.finished().await;

        assert_eq!(
            recorder.calls(),
            vec![
                Call::Token("Par".to_string()),
                Call::Error("Streaming error: connection reset".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn source_failure_reported() {
        let recorder = Recorder::default();
        let handle = spawn_stream(
            async {
                Err::<futures::stream::Empty<Result<Bytes>>, _>(Error::api(500, "boom"))
            },
            recorder.clone(),
        );
        handle.finished().await;
        assert_eq!(
            recorder.calls(),
            vec![Call::Error("API error (status 500): boom".to_string())]
        );
    }

    #[tokio::test]
    async fn cancel_before_connect_is_silent() {
        let recorder = Recorder::default();
        let handle = spawn_stream(
            future::pending::<Result<futures::stream::Empty<Result<Bytes>>>>(),
            recorder.clone(),
        );
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .expect("cancelled stream should finish");
        assert!(handle.is_finished());
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_suppresses_buffered_frames() {
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::unbounded::<Result<Bytes>>();
        let handle = spawn_stream(async move { Ok(rx) }, recorder.clone());

        tx.unbounded_send(Ok(Bytes::from_static(
            b"data: {\"type\":\"token\",\"content\":\"Hel\"}\n\ndata: {\"type\":\"tok",
        )))
        .unwrap();
        wait_for_calls(&recorder, 1).await;

        handle.cancel();
        let _ = tx.unbounded_send(Ok(Bytes::from_static(
            b"en\",\"content\":\"lo\"}\n\ndata: {\"type\":\"end\",\"full_response\":\"Hello\"}\n\n",
        )));
        handle.finished().await;

        assert_eq!(recorder.calls(), vec![Call::Token("Hel".to_string())]);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_noop() {
        let recorder = Recorder::default();
        let body = body(&["data: {\"type\":\"end\",\"full_response\":\"ok\"}\n\n"]);
        let handle = spawn_stream(async move { Ok(body) }, recorder.clone());
        handle.finished().await;

        handle.cancel();
        handle.cancel();
        assert_eq!(recorder.calls(), vec![Call::Complete("ok".to_string())]);
    }

    #[tokio::test]
    async fn closures_as_handler() {
        let tokens = Arc::new(Mutex::new(String::new()));
        let done = Arc::new(Mutex::new(None));
        let handler = {
            let tokens = Arc::clone(&tokens);
            let done = Arc::clone(&done);
            callbacks(
                move |token| tokens.lock().unwrap().push_str(token),
                move |full| *done.lock().unwrap() = Some(full.to_string()),
                |message| panic!("unexpected error: {message}"),
            )
        };
        let body = body(&[
            "data: {\"type\":\"token\",\"content\":\"a\"}\n\n",
            "data: {\"type\":\"end\",\"full_response\":\"A\"}\n\n",
        ]);
        let handle = spawn_stream(async move { Ok(body) }, handler);
        handle.finished().await;

        assert_eq!(*tokens.lock().unwrap(), "a");
        assert_eq!(done.lock().unwrap().as_deref(), Some("A"));
    }
}
