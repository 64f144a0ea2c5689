//! Server-sent event decoding.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

/// One dispatched event. `event` is `"message"` when the server sent no
/// `event:` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Decodes a `text/event-stream` body into [`SseEvent`]s.
///
/// Comment lines (keep-alives) are skipped. An event is dispatched on the
/// blank line that ends it; a partial event at end of input is dropped.
#[derive(Debug, Default)]
pub struct SseCodec {
    lines: LinesCodec,
    event: Option<String>,
    data: Option<String>,
}

impl SseCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn feed(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let data = self.data.take();
            let event = self.event.take();
            return data.map(|data| SseEvent {
                event: event.unwrap_or_else(|| "message".to_string()),
                data,
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            _ => {}
        }
        None
    }
}

impl Decoder for SseCodec {
    type Item = SseEvent;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseEvent>, LinesCodecError> {
        while let Some(line) = self.lines.decode(src)? {
            if let Some(event) = self.feed(line.trim_end_matches('\r')) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SseEvent>, LinesCodecError> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        while let Some(line) = self.lines.decode_eof(src)? {
            if let Some(event) = self.feed(line.trim_end_matches('\r')) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    async fn decode_all(input: &'static [u8]) -> Vec<SseEvent> {
        FramedRead::new(input, SseCodec::new())
            .map(Result::unwrap)
            .collect()
            .await
    }

    #[tokio::test]
    async fn named_events() {
        let events = decode_all(b"event: formation\ndata: {\"a\":1}\n\nevent: ready\ndata: {}\n\n").await;
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "formation".into(),
                    data: "{\"a\":1}".into(),
                },
                SseEvent {
                    event: "ready".into(),
                    data: "{}".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn keep_alive_comments_are_skipped() {
        let events = decode_all(b":\n\ndata: x\n\n").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "x");
    }

    #[tokio::test]
    async fn multi_line_data_joins() {
        let events = decode_all(b"data: one\r\ndata: two\r\n\r\n").await;
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[tokio::test]
    async fn partial_event_at_eof_is_dropped() {
        let events = decode_all(b"data: done\n\nevent: formation\ndata: {}").await;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn split_input_waits_for_blank_line() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from(&b"event: ready\nda"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"ta: {}\n\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().event, "ready");
    }
}
