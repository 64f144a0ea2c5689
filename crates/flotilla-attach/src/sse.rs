//! Log output transcoding: raw passthrough or server-sent events.
//!
//! In event-stream mode every decoded frame becomes exactly one event
//! block, and a clean end of input adds a final `eof` event. A malformed
//! frame ends the stream with an error and no `eof` event.

use std::borrow::Cow;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::error::FrameError;
use crate::frame::{LogFrame, StreamKind, decode_frames};

pub const EVENT_STREAM: &str = "text/event-stream";

const EOF_EVENT: &[u8] = b"event: eof\ndata: {}\n\n";

/// How log output is rendered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Bytes exactly as the host produced them.
    Raw,
    /// One `data:` event per frame, then `event: eof`.
    EventStream,
}

impl LogFormat {
    /// Pick a format from an `Accept` header value.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let wants_events = accept.is_some_and(|accept| {
            accept
                .split(',')
                .any(|media| media.split(';').next().is_some_and(|m| m.trim() == EVENT_STREAM))
        });
        if wants_events {
            Self::EventStream
        } else {
            Self::Raw
        }
    }
}

#[derive(Serialize)]
struct FrameEvent<'a> {
    stream: StreamKind,
    data: Cow<'a, str>,
}

/// Render one frame as an event block.
pub fn encode_event(frame: &LogFrame) -> Result<Bytes, FrameError> {
    let event = FrameEvent {
        stream: frame.stream,
        data: String::from_utf8_lossy(&frame.payload),
    };
    let json = serde_json::to_string(&event)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

pub fn eof_event() -> Bytes {
    Bytes::from_static(EOF_EVENT)
}

/// Transcode a multiplexed reader into event blocks.
pub fn event_stream<R>(reader: R) -> BoxStream<'static, Result<Bytes, FrameError>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    stream::unfold(Some(decode_frames(reader)), |state| async move {
        let mut frames = state?;
        match frames.next().await {
            Some(Ok(frame)) => match encode_event(&frame) {
                Ok(event) => Some((Ok(event), Some(frames))),
                Err(e) => Some((Err(e), None)),
            },
            Some(Err(e)) => Some((Err(e), None)),
            None => Some((Ok(eof_event()), None)),
        }
    })
    .boxed()
}

/// Pass a reader's bytes through unchanged.
pub fn raw_stream<R>(reader: R) -> BoxStream<'static, Result<Bytes, FrameError>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    ReaderStream::new(reader).map_err(FrameError::from).boxed()
}

/// Render `reader` in the given format.
pub fn transcode<R>(reader: R, format: LogFormat) -> BoxStream<'static, Result<Bytes, FrameError>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    match format {
        LogFormat::Raw => raw_stream(reader),
        LogFormat::EventStream => event_stream(reader),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"\x01\x00\x00\x00\x00\x00\x00\x13Listening on 55007\n\
\x01\x00\x00\x00\x00\x00\x00\x0dhello stdout\n\
\x02\x00\x00\x00\x00\x00\x00\x0dhello stderr\n";

    async fn collect(
        stream: BoxStream<'static, Result<Bytes, FrameError>>,
    ) -> (Vec<u8>, Option<FrameError>) {
        let mut out = Vec::new();
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => return (out, Some(e)),
            }
        }
        (out, None)
    }

    #[tokio::test]
    async fn event_stream_literal() {
        let (out, err) = collect(event_stream(SAMPLE)).await;
        assert!(err.is_none());
        let expected = "data: {\"stream\":\"stdout\",\"data\":\"Listening on 55007\\n\"}\n\n\
data: {\"stream\":\"stdout\",\"data\":\"hello stdout\\n\"}\n\n\
data: {\"stream\":\"stderr\",\"data\":\"hello stderr\\n\"}\n\n\
event: eof\ndata: {}\n\n";
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[tokio::test]
    async fn empty_input_is_just_eof() {
        let (out, err) = collect(event_stream(&b""[..])).await;
        assert!(err.is_none());
        assert_eq!(out, EOF_EVENT);
    }

    #[tokio::test]
    async fn malformed_frame_aborts_without_eof() {
        let mut input = SAMPLE[..27].to_vec();
        input.extend_from_slice(b"\x07\x00\x00\x00\x00\x00\x00\x01x");
        let (out, err) = collect(event_stream(std::io::Cursor::new(input))).await;
        assert!(matches!(err, Some(FrameError::InvalidStream(7))));
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches("data: ").count(), 1);
        assert!(!out.contains("event: eof"));
    }

    #[tokio::test]
    async fn truncated_input_aborts() {
        let (_, err) = collect(event_stream(&SAMPLE[..SAMPLE.len() - 3])).await;
        assert!(matches!(err, Some(FrameError::Truncated { .. })));
    }

    #[tokio::test]
    async fn oversized_frame_aborts_without_eof() {
        let mut input = SAMPLE[..27].to_vec();
        input.extend_from_slice(b"\x01\x00\x00\x00\xff\xff\xff\xff");
        let (out, err) = collect(event_stream(std::io::Cursor::new(input))).await;
        assert!(matches!(err, Some(FrameError::TooLarge { .. })));
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches("data: ").count(), 1);
        assert!(!out.contains("event: eof"));
    }

    #[tokio::test]
    async fn raw_passthrough() {
        let (out, err) = collect(transcode(&b"foo"[..], LogFormat::Raw)).await;
        assert!(err.is_none());
        assert_eq!(out, b"foo");
    }

    #[test]
    fn negotiate_accept_header() {
        assert_eq!(LogFormat::negotiate(None), LogFormat::Raw);
        assert_eq!(LogFormat::negotiate(Some("*/*")), LogFormat::Raw);
        assert_eq!(
            LogFormat::negotiate(Some("text/event-stream")),
            LogFormat::EventStream
        );
        assert_eq!(
            LogFormat::negotiate(Some("application/json, text/event-stream; q=0.9")),
            LogFormat::EventStream
        );
    }

    #[test]
    fn non_utf8_payload_is_replaced() {
        let frame = LogFrame::new(StreamKind::Stdout, &b"\xffok"[..]);
        let event = encode_event(&frame).unwrap();
        assert_eq!(&event[..], "data: {\"stream\":\"stdout\",\"data\":\"\u{fffd}ok\"}\n\n".as_bytes());
    }
}
