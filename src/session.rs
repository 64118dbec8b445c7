//! Error/Teardown Coordinator
//!
//! A [`Session`] borrows both display connections for the life of the event
//! loop and owns everything built on top of them: the binder, the frame bridge
//! and the frame pool. It runs the non-blocking half of each loop iteration,
//! samples both connections for errors, and on drop releases presentation
//! objects before the pool they reference.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};

use tracing::{debug, info, trace, warn};

use crate::binder::CapabilityBinder;
use crate::bridge::FrameBridge;
use crate::capture::{CaptureEvent, CaptureSide};
use crate::error::{BridgeError, ConnStatus, FlushOutcome, Side};
use crate::pool::FramePool;
use crate::present::{PresentEvent, PresentationSide};

/// Why the event loop stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The peer on this side disconnected
    SessionClosed(Side),
    /// The compositor asked the top-level to close
    CloseRequested,
    /// A signal asked us to stop
    ShutdownRequested(&'static str),
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::SessionClosed(side) => write!(f, "{} session closed", side),
            LoopExit::CloseRequested => f.write_str("compositor requested close"),
            LoopExit::ShutdownRequested(reason) => write!(f, "shutdown requested ({})", reason),
        }
    }
}

pub struct Session<'a, C: CaptureSide + ?Sized, P: PresentationSide + ?Sized> {
    capture: &'a mut C,
    present: &'a mut P,
    binder: CapabilityBinder,
    bridge: FrameBridge,
    frames: Option<FramePool>,
    close_requested: bool,
}

impl<'a, C, P> Session<'a, C, P>
where
    C: CaptureSide + ?Sized,
    P: PresentationSide + ?Sized,
{
    pub fn new(capture: &'a mut C, present: &'a mut P, binder: CapabilityBinder) -> Self {
        Self {
            capture,
            present,
            binder,
            bridge: FrameBridge::new(),
            frames: None,
            close_requested: false,
        }
    }

    #[cfg(test)]
    pub fn binder(&self) -> &CapabilityBinder {
        &self.binder
    }

    pub fn bridge(&self) -> &FrameBridge {
        &self.bridge
    }

    /// A redraw is owed and can run right now. Holds after a turn whose
    /// redraw was deferred by a capture request error.
    pub fn redraw_pending(&self) -> bool {
        self.bridge.redraw_wanted() && self.binder.frames_ready()
    }

    pub fn fd(&self, side: Side) -> BorrowedFd<'_> {
        match side {
            Side::Capture => self.capture.as_fd(),
            Side::Presentation => self.present.as_fd(),
        }
    }

    /// Drain both connections and run the reactions. Never blocks.
    pub fn turn(&mut self) -> Result<(), BridgeError> {
        let poisoned = self.drain_capture()?;
        self.drain_presentation()?;

        self.binder.react(&mut *self.present, &mut self.frames)?;
        if let Some(slot) = self.bridge.react(
            &mut *self.capture,
            &mut *self.present,
            self.frames.as_mut(),
            self.binder.bound().surface,
            poisoned,
        )? {
            trace!("Presented slot {} (frame {})", slot, self.bridge.presented());
        }
        Ok(())
    }

    /// Returns true when a request failed on the capture server this turn
    fn drain_capture(&mut self) -> Result<bool, BridgeError> {
        let mut poisoned = false;
        while let Some(event) = self.capture.next_event()? {
            match event {
                CaptureEvent::FrameReady(token) => trace!("Capture {} ready", token),
                CaptureEvent::RequestFailed { error, sequence } => {
                    warn!("X request {} failed: {}", sequence, error);
                    poisoned = true;
                }
                CaptureEvent::Other(what) => trace!("Unhandled X event: {}", what),
            }
        }
        Ok(poisoned)
    }

    fn drain_presentation(&mut self) -> Result<(), BridgeError> {
        for event in self.present.read_events()? {
            match event {
                PresentEvent::GlobalAnnounced { kind, global } => {
                    self.binder.on_global_announced(kind, global);
                }
                PresentEvent::GlobalRemoved { name } => self.binder.on_global_removed(name),
                PresentEvent::Ping(serial) => self.bridge.messages_mut().record_ping(serial),
                PresentEvent::Configure(serial) => {
                    self.bridge.messages_mut().record_configure(serial);
                }
                PresentEvent::FrameDone(serial) => self.bridge.messages_mut().record_frame(serial),
                PresentEvent::BufferReleased(slot) => trace!("Compositor released slot {}", slot),
                PresentEvent::CloseRequested => {
                    info!("Compositor asked the top-level to close");
                    self.close_requested = true;
                }
            }
        }
        Ok(())
    }

    pub fn flush(&mut self, side: Side) -> FlushOutcome {
        match side {
            Side::Capture => self.capture.flush(),
            Side::Presentation => self.present.flush(),
        }
    }

    /// Sample both connections. A failure on either side wins over a close.
    pub fn check_status(&self) -> Result<Option<LoopExit>, BridgeError> {
        let statuses = [
            (Side::Capture, self.capture.status()),
            (Side::Presentation, self.present.status()),
        ];

        for (side, status) in &statuses {
            if let ConnStatus::Failed(reason) = status {
                return Err(BridgeError::ConnectionFatal {
                    side: *side,
                    reason: reason.clone(),
                });
            }
        }
        for (side, status) in &statuses {
            if *status == ConnStatus::Closed {
                return Ok(Some(LoopExit::SessionClosed(*side)));
            }
        }
        if self.close_requested {
            return Ok(Some(LoopExit::CloseRequested));
        }
        Ok(None)
    }
}

impl<C, P> Drop for Session<'_, C, P>
where
    C: CaptureSide + ?Sized,
    P: PresentationSide + ?Sized,
{
    fn drop(&mut self) {
        // Buffers reference the pool, so they go first
        self.present.release();
        if self.present.flush() == FlushOutcome::WouldBlock {
            debug!("Presentation teardown left requests unflushed");
        }
        if self.frames.take().is_some() {
            debug!("Unmapped frame pool");
        }
    }
}
