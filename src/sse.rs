//! Server-Sent Events (SSE) processing for streaming chat responses.
//!
//! The response body is a sequence of frames separated by a blank line.  A frame that starts
//! with `data: ` carries one JSON-encoded [`StreamEvent`] on the rest of its first line.
//! Framing is done on raw bytes with a [`tokio_util::codec::Decoder`], so the result does not
//! depend on where the transport happened to split the body, even inside a multi-byte
//! UTF-8 sequence.

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::observability::{STREAM_BYTES, STREAM_MALFORMED_FRAMES};
use crate::{Error, Result, StreamEvent};

/// Prefix that marks a frame as carrying an event payload.
pub const DATA_PREFIX: &[u8] = b"data: ";

/// Separator between frames.
pub const FRAME_DELIMITER: &[u8] = b"\n\n";

/// Splits a byte buffer into blank-line delimited frames.
///
/// The returned frame excludes the delimiter.  Bytes after the last delimiter stay in the
/// buffer until more data arrives or the stream ends.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    // Bytes at the front of the buffer already known to hold no delimiter.
    scanned: usize,
}

impl FrameDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        // A delimiter may straddle the previous scan boundary.
        let start = self
            .scanned
            .saturating_sub(FRAME_DELIMITER.len() - 1)
            .min(src.len());
        let found = src[start..]
            .windows(FRAME_DELIMITER.len())
            .position(|window| window == FRAME_DELIMITER);
        match found {
            Some(offset) => {
                let frame = src.split_to(start + offset).freeze();
                src.advance(FRAME_DELIMITER.len());
                self.scanned = 0;
                Ok(Some(frame))
            }
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.scanned = 0;
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(src.split().freeze()))
        }
    }
}

/// Parse one frame.
///
/// Returns `None` for frames that carry no `data: ` payload, and an error when the payload is
/// not a valid [`StreamEvent`].
pub fn parse_frame(frame: &[u8]) -> Option<Result<StreamEvent>> {
    let payload = frame.strip_prefix(DATA_PREFIX)?;
    let line = match payload.iter().position(|b| *b == b'\n') {
        Some(end) => &payload[..end],
        None => payload,
    };
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some(serde_json::from_slice::<StreamEvent>(line).map_err(Error::from))
}

/// Process a stream of bytes into a stream of chat events.
///
/// Malformed frames are logged and skipped.  A transport error is yielded once and ends the
/// stream.  At end of input, a trailing frame without its delimiter is still parsed.
pub fn process_sse<S>(byte_stream: S) -> impl Stream<Item = Result<StreamEvent>>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    stream::unfold(SseState::new(byte_stream), |mut state| async move {
        let item = state.next_event().await?;
        Some((item, state))
    })
}

struct SseState<S> {
    stream: S,
    buffer: BytesMut,
    decoder: FrameDecoder,
    eof: bool,
}

impl<S> SseState<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            decoder: FrameDecoder::new(),
            eof: false,
        }
    }

    async fn next_event(&mut self) -> Option<Result<StreamEvent>> {
        loop {
            let frame = if self.eof {
                match self.decoder.decode_eof(&mut self.buffer) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return None,
                    Err(err) => return Some(Err(err)),
                }
            } else {
                match self.decoder.decode(&mut self.buffer) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        match self.stream.next().await {
                            Some(Ok(bytes)) => {
                                STREAM_BYTES.count(bytes.len() as u64);
                                self.buffer.extend_from_slice(&bytes);
                            }
                            Some(Err(err)) => {
                                self.eof = true;
                                self.buffer.clear();
                                self.decoder = FrameDecoder::new();
                                return Some(Err(err));
                            }
                            None => self.eof = true,
                        }
                        continue;
                    }
                    Err(err) => return Some(Err(err)),
                }
            };

            match parse_frame(&frame) {
                Some(Ok(event)) => return Some(Ok(event)),
                Some(Err(err)) => {
                    STREAM_MALFORMED_FRAMES.click();
                    warn!(
                        frame = %String::from_utf8_lossy(&frame),
                        error = %err,
                        "skipping malformed stream frame"
                    );
                }
                None => {
                    if !frame.is_empty() {
                        debug!(len = frame.len(), "ignoring frame without data prefix");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = concat!(
        "data: {\"type\":\"start\"}\n\n",
        "data: {\"type\":\"token\",\"content\":\"你好\"}\n\n",
        "data: {\"type\":\"token\",\"content\":\" there\"}\n\n",
        "data: {\"type\":\"end\",\"full_response\":\"你好 there\"}\n\n",
    );

    fn chunks(parts: Vec<&[u8]>) -> impl Stream<Item = Result<Bytes>> + Unpin {
        let parts: Vec<Result<Bytes>> = parts
            .into_iter()
            .map(|part| Ok(Bytes::copy_from_slice(part)))
            .collect();
        stream::iter(parts)
    }

    async fn collect(parts: Vec<&[u8]>) -> Vec<Result<StreamEvent>> {
        process_sse(chunks(parts)).collect().await
    }

    fn expected() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start,
            StreamEvent::token("你好"),
            StreamEvent::token(" there"),
            StreamEvent::end("你好 there"),
        ]
    }

    #[test]
    fn decoder_splits_on_blank_line() {
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::from(&b"data: a\n\ndata: b\n\ndata: c"[..]);

        assert_eq!(
            decoder.decode(&mut buffer).unwrap(),
            Some(Bytes::from_static(b"data: a"))
        );
        assert_eq!(
            decoder.decode(&mut buffer).unwrap(),
            Some(Bytes::from_static(b"data: b"))
        );
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);
        assert_eq!(&buffer[..], b"data: c");
        assert_eq!(
            decoder.decode_eof(&mut buffer).unwrap(),
            Some(Bytes::from_static(b"data: c"))
        );
        assert_eq!(decoder.decode_eof(&mut buffer).unwrap(), None);
    }

    #[test]
    fn decoder_finds_delimiter_across_pushes() {
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::from(&b"data: a\n"[..]);
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"\nrest");
        assert_eq!(
            decoder.decode(&mut buffer).unwrap(),
            Some(Bytes::from_static(b"data: a"))
        );
        assert_eq!(&buffer[..], b"rest");
    }

    #[test]
    fn parse_frame_variants() {
        assert!(parse_frame(b"event: ping").is_none());
        assert!(parse_frame(b"").is_none());
        assert!(parse_frame(b"data:{\"type\":\"start\"}").is_none());
        assert_eq!(
            parse_frame(b"data: {\"type\":\"start\"}").unwrap().unwrap(),
            StreamEvent::Start
        );
        assert_eq!(
            parse_frame(b"data: {\"type\":\"token\",\"content\":\"x\"}\r")
                .unwrap()
                .unwrap(),
            StreamEvent::token("x")
        );
        assert!(parse_frame(b"data: {not json").unwrap().is_err());
        assert!(parse_frame(b"data: \xff\xfe").unwrap().is_err());
    }

    #[tokio::test]
    async fn parse_single_chunk() {
        let events = collect(vec![SCENARIO.as_bytes()]).await;
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(events, expected());
    }

    #[tokio::test]
    async fn output_is_independent_of_chunk_boundaries() {
        let bytes = SCENARIO.as_bytes();
        for split in 1..bytes.len() {
            let events = collect(vec![&bytes[..split], &bytes[split..]]).await;
            let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
            assert_eq!(events, expected(), "split at byte {split}");
        }
        for size in [1, 2, 3, 5, 7, 11] {
            let events = collect(bytes.chunks(size).collect()).await;
            let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
            assert_eq!(events, expected(), "chunks of {size} bytes");
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let body = concat!(
            "data: {\"type\":\"token\",\"content\":\"a\"}\n\n",
            "data: {\"type\":\"token\",\"content\":\n\n",
            "data: {\"type\":\"token\",\"content\":\"b\"}\n\n",
        );
        let events: Vec<StreamEvent> = collect(vec![body.as_bytes()])
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(
            events,
            vec![StreamEvent::token("a"), StreamEvent::token("b")]
        );
    }

    #[tokio::test]
    async fn comment_and_event_lines_are_ignored() {
        let body = ": keep-alive\n\nevent: ping\n\ndata: {\"type\":\"start\"}\n\n\n\n";
        let events: Vec<StreamEvent> = collect(vec![body.as_bytes()])
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(events, vec![StreamEvent::Start]);
    }

    #[tokio::test]
    async fn trailing_frame_without_delimiter() {
        let body = "data: {\"type\":\"token\",\"content\":\"a\"}\n\ndata: {\"type\":\"end\"}";
        let events: Vec<StreamEvent> = collect(vec![body.as_bytes()])
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::token("a"),
                StreamEvent::End {
                    full_response: None
                }
            ]
        );
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let parts: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"token\",\"content\":\"Par\"}\n\ndata: {")),
            Err(Error::streaming("connection reset", None)),
            Ok(Bytes::from_static(b"\"type\":\"start\"}\n\n")),
        ];
        let events: Vec<Result<StreamEvent>> = process_sse(stream::iter(parts)).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap(), &StreamEvent::token("Par"));
        assert!(matches!(events[1], Err(Error::Streaming { .. })));
    }

    #[test]
    fn decoder_survives_cleared_buffer() {
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::from(&b"data: {"[..]);
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);

        buffer.clear();
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);
        assert_eq!(decoder.decode_eof(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"data: a\n\n");
        assert_eq!(
            decoder.decode(&mut buffer).unwrap(),
            Some(Bytes::from_static(b"data: a"))
        );
    }
}
