//! Capture/Present Frame Bridge
//!
//! Copies the latest captured image into the idle buffer slot each time the
//! compositor is ready for a frame, and keeps one capture request in flight
//! ahead of consumption.

use tracing::{debug, trace, warn};

use crate::capture::{CaptureSide, CaptureToken, FrameReply};
use crate::error::BridgeError;
use crate::pool::FramePool;
use crate::present::PresentationSide;

/// Latest unconsumed serial per message kind. Older serials are overwritten;
/// only the most recent one is actionable.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingMessages {
    pub ping: Option<u32>,
    pub configure: Option<u32>,
    pub frame: Option<u32>,
}

impl PendingMessages {
    pub fn record_ping(&mut self, serial: u32) {
        self.ping = Some(serial);
    }

    pub fn record_configure(&mut self, serial: u32) {
        self.configure = Some(serial);
    }

    pub fn record_frame(&mut self, serial: u32) {
        self.frame = Some(serial);
    }
}

/// Redraw state carried across loop iterations
#[derive(Debug, Default)]
pub struct FrameBridge {
    messages: PendingMessages,
    last_configure: Option<u32>,
    last_frame: Option<u32>,
    /// A consumed configure or frame serial asked for a redraw that has not
    /// happened yet
    redraw_wanted: bool,
    /// The frame-callback loop is running; later configures only get acked
    started: bool,
    pending_capture: Option<CaptureToken>,
    presented: u64,
}

impl FrameBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_mut(&mut self) -> &mut PendingMessages {
        &mut self.messages
    }

    #[cfg(test)]
    pub fn pending_capture(&self) -> Option<CaptureToken> {
        self.pending_capture
    }

    /// A consumed serial still owes a redraw. No further peer message will
    /// arrive for it, so the loop must not sleep while this holds.
    pub fn redraw_wanted(&self) -> bool {
        self.redraw_wanted
    }

    /// Number of frames committed so far
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Answer keep-alives, acknowledge configures and redraw if asked to.
    ///
    /// `poisoned` is set when the capture side reported a request error this
    /// iteration; the redraw then waits for the next one. Returns the slot that
    /// was presented, if any.
    pub fn react<C, P>(
        &mut self,
        capture: &mut C,
        present: &mut P,
        frames: Option<&mut FramePool>,
        surface_ready: bool,
        poisoned: bool,
    ) -> Result<Option<usize>, BridgeError>
    where
        C: CaptureSide + ?Sized,
        P: PresentationSide + ?Sized,
    {
        if let Some(serial) = self.messages.ping.take() {
            trace!("Pong {}", serial);
            present.pong(serial);
        }

        if let Some(serial) = self.messages.configure.take() {
            if self.last_configure != Some(serial) {
                present.ack_configure(serial);
                self.last_configure = Some(serial);
                debug!("Acknowledged configure {}", serial);
                if !self.started {
                    self.redraw_wanted = true;
                }
            }
        }

        if let Some(serial) = self.messages.frame.take() {
            if self.last_frame != Some(serial) {
                self.last_frame = Some(serial);
                self.redraw_wanted = true;
            }
        }

        if !self.redraw_wanted {
            return Ok(None);
        }
        if poisoned {
            debug!("Capture side reported an error, redraw deferred");
            return Ok(None);
        }
        let Some(frames) = frames else {
            return Ok(None);
        };
        if !surface_ready {
            return Ok(None);
        }

        let slot = self.redraw(capture, present, frames);
        self.redraw_wanted = false;
        self.started = true;
        Ok(Some(slot))
    }

    fn redraw<C, P>(&mut self, capture: &mut C, present: &mut P, frames: &mut FramePool) -> usize
    where
        C: CaptureSide + ?Sized,
        P: PresentationSide + ?Sized,
    {
        let slot = frames.next_slot();

        if let Some(token) = self.pending_capture {
            match capture.take_frame(token) {
                FrameReply::Pending => {
                    trace!("Capture {} still in flight, slot {} keeps its frame", token, slot);
                }
                FrameReply::Ready(pixels) => {
                    self.pending_capture = None;
                    let copied = frames.fill(slot, &pixels);
                    trace!("Copied capture {} ({} bytes) into slot {}", token, copied, slot);
                }
                FrameReply::Failed => {
                    self.pending_capture = None;
                    debug!("Capture {} failed, slot {} keeps its frame", token, slot);
                }
            }
        }

        present.attach_slot(slot);

        if self.pending_capture.is_none() {
            match capture.request_frame() {
                Ok(token) => self.pending_capture = Some(token),
                // Left to the status check; the next redraw asks again
                Err(e) => warn!("Failed to request capture: {}", e),
            }
        }

        // The frame callback is surface state, so it must precede the commit
        // it belongs to
        present.request_redraw();
        present.commit();

        frames.mark_presented(slot);
        self.presented += 1;
        slot
    }
}
