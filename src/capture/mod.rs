//! Capture side
//!
//! Frames come from a window on an X server. The core sees it through
//! [`CaptureSide`]: a one-event-at-a-time event source plus an asynchronous
//! "give me the current image" request identified by a [`CaptureToken`].

pub mod x11;

use std::fmt;
use std::os::fd::AsFd;

use crate::error::{BridgeError, ConnStatus, FlushOutcome};

/// Identifies one outstanding image request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaptureToken(pub u64);

impl fmt::Display for CaptureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of an image request when the bridge asks for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameReply {
    /// Not back yet; keep showing what we have
    Pending,
    /// Raw pixel rows, possibly longer than a slot
    Ready(Vec<u8>),
    /// The server refused this one; the next cycle asks again
    Failed,
}

/// Capture-side notifications, handled one at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// The reply for this request has arrived and can be taken without waiting
    FrameReady(CaptureToken),
    /// A request failed on the server. Not fatal, but the frame bridge sits
    /// out the rest of the iteration.
    RequestFailed { error: String, sequence: u16 },
    /// Anything else; logged and dropped
    Other(String),
}

pub trait CaptureSide: AsFd {
    /// Fetch one pending event without blocking.
    ///
    /// `Err` is connection-fatal. A clean disconnect returns `Ok(None)` and is
    /// reported through [`CaptureSide::status`].
    fn next_event(&mut self) -> Result<Option<CaptureEvent>, BridgeError>;

    /// Ask for the current contents of the capture target
    fn request_frame(&mut self) -> Result<CaptureToken, BridgeError>;

    /// Take the reply for `token` if it is available. Never blocks.
    fn take_frame(&mut self, token: CaptureToken) -> FrameReply;

    fn flush(&mut self) -> FlushOutcome;

    fn status(&self) -> ConnStatus;
}
