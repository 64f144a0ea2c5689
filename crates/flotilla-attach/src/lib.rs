//! flotilla-attach: live I/O to running jobs.
//!
//! - [`frame`]: the multiplexed stdout/stderr frame codec hosts emit.
//! - [`sse`]: raw or server-sent-event rendering of that stream.
//! - [`session`]: the attach session state machine and duplex forwarding.

pub mod error;
pub mod frame;
pub mod session;
pub mod sse;

pub use error::{AttachError, AttachResult, FrameError, FrameResult};
pub use frame::{LogFrame, LogFrameCodec, MAX_FRAME_LEN, StreamKind, decode_frames};
pub use session::{AttachSession, AttachState, AttachStats};
pub use sse::{EVENT_STREAM, LogFormat, transcode};
