//! Multiplexed log frame codec.
//!
//! A host interleaves a job's stdout and stderr on one byte stream. Each
//! frame is an 8-byte header followed by the payload:
//!
//! ```text
//! +-----+---------+---------+---------+------------------------+
//! | tag |  0x00   |  0x00   |  0x00   |  length (u32, big end) |
//! +-----+---------+---------+---------+------------------------+
//! ```
//!
//! Tag 1 is stdout, tag 2 is stderr. Any other tag is rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::error::FrameError;

pub const HEADER_LEN: usize = 8;

/// Largest payload accepted in one frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on buffer growth while waiting for a partial frame.
const RESERVE_CHUNK: usize = 64 * 1024;

/// Which output stream a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub stream: StreamKind,
    pub payload: Bytes,
}

impl LogFrame {
    pub fn new(stream: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogFrameCodec;

impl Decoder for LogFrameCodec {
    type Item = LogFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogFrame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = src[0];
        let stream = StreamKind::from_tag(tag).ok_or(FrameError::InvalidStream(tag))?;
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve((total - src.len()).min(RESERVE_CHUNK));
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(LogFrame { stream, payload }))
    }

    /// A clean end of stream falls on a frame boundary; leftover bytes
    /// mean the last frame was cut short.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<LogFrame>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let expected = if buf.len() < HEADER_LEN {
            HEADER_LEN
        } else {
            HEADER_LEN + u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize
        };
        Err(FrameError::Truncated {
            expected,
            available: buf.len(),
        })
    }
}

impl Encoder<LogFrame> for LogFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: LogFrame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = u32::try_from(frame.payload.len()).map_err(|_| {
            FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "frame payload exceeds u32::MAX",
            ))
        })?;
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.stream.tag());
        dst.put_bytes(0, 3);
        dst.put_u32(len);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Lazily decode frames from a multiplexed reader.
pub fn decode_frames<R: AsyncRead>(reader: R) -> FramedRead<R, LogFrameCodec> {
    FramedRead::new(reader, LogFrameCodec)
}
