//! X11 capture backend
//!
//! Creates a screen-sized window for the screensaver to draw into and reads it
//! back with `GetImage`. x11rb has no non-blocking way to ask whether a reply
//! has arrived, so every image request is followed by a property change on the
//! same window: the resulting `PropertyNotify` carries a later sequence number,
//! and seeing it (or any event at or past the image request) proves the reply
//! is already buffered.

use std::os::fd::{AsFd, BorrowedFd};

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};
use x11rb::connection::{Connection, SequenceNumber};
use x11rb::cookie::Cookie;
use x11rb::errors::{ConnectionError, ReplyError};
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ConnectionExt as _, CreateWindowAux, EventMask, GetImageReply, ImageFormat,
    PropMode, Screen, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use super::{CaptureEvent, CaptureSide, CaptureToken, FrameReply};
use crate::error::{is_disconnect, BridgeError, ConnStatus, FlushOutcome};
use crate::pool::FrameGeometry;

/// Property rewritten after each image request to produce a fence event
const FENCE_ATOM: &[u8] = b"_SAVERBRIDGE_FENCE";

/// Plane mask selecting every bit plane
const ALL_PLANES: u32 = !0;

/// Owned connection to the capture-side X server
pub struct CaptureConnection {
    conn: RustConnection,
    screen_num: usize,
}

impl CaptureConnection {
    /// Connect to `display`, or `$DISPLAY` when `None`
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let (conn, screen_num) =
            x11rb::connect(display).context("Failed to connect to X server")?;

        for (i, screen) in conn.setup().roots.iter().enumerate() {
            debug!(
                "Screen {}: root {} {}x{} depth {}",
                i, screen.root, screen.width_in_pixels, screen.height_in_pixels, screen.root_depth
            );
        }
        info!("Connected to X server, preferred screen {}", screen_num);

        Ok(Self { conn, screen_num })
    }

    /// Screens the server offers as capture targets
    pub fn screens(&self) -> &[Screen] {
        &self.conn.setup().roots
    }

    /// The screen named by the display string, falling back to the first one
    pub fn preferred_screen(&self) -> Result<&Screen> {
        let screens = self.screens();
        screens
            .get(self.screen_num)
            .or_else(|| screens.first())
            .context("X server reported no screens")
    }

    /// Create and map a screen-sized window to capture
    pub fn create_target(&self) -> Result<CaptureTarget<'_>> {
        let conn = &self.conn;
        let screen = self.preferred_screen()?;
        let geometry = FrameGeometry::new(
            u32::from(screen.width_in_pixels),
            u32::from(screen.height_in_pixels),
        );

        let window = conn.generate_id().context("Failed to allocate window id")?;
        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            screen.root,
            0,
            0,
            screen.width_in_pixels,
            screen.height_in_pixels,
            0,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &CreateWindowAux::new()
                .background_pixel(screen.black_pixel)
                .event_mask(EventMask::PROPERTY_CHANGE),
        )
        .context("Failed to create capture window")?;
        conn.map_window(window)
            .context("Failed to map capture window")?;

        let fence_atom = conn
            .intern_atom(false, FENCE_ATOM)
            .context("Failed to intern fence atom")?
            .reply()
            .context("Failed to intern fence atom")?
            .atom;

        conn.flush().context("Failed to flush X connection")?;

        info!(
            "Capture window 0x{:08x} ({}x{})",
            window, geometry.width, geometry.height
        );

        Ok(CaptureTarget {
            conn,
            window,
            geometry,
            fence_atom,
            pending: None,
            next_token: 1,
            status: ConnStatus::Healthy,
        })
    }
}

/// An image request still owned by the connection
struct PendingImage<'c> {
    token: CaptureToken,
    cookie: Cookie<'c, RustConnection, GetImageReply>,
    sequence: SequenceNumber,
    arrived: bool,
}

/// The captured window plus its single outstanding image request
pub struct CaptureTarget<'c> {
    conn: &'c RustConnection,
    window: Window,
    geometry: FrameGeometry,
    fence_atom: Atom,
    pending: Option<PendingImage<'c>>,
    next_token: u64,
    status: ConnStatus,
}

/// How a connection error leaves the session: a peer hang-up closes it,
/// anything else is a failure
fn classify(err: &ConnectionError) -> ConnStatus {
    match err {
        ConnectionError::IoError(e) if is_disconnect(e.kind()) => ConnStatus::Closed,
        other => ConnStatus::Failed(other.to_string()),
    }
}

impl<'c> CaptureTarget<'c> {
    pub fn window(&self) -> Window {
        self.window
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Remember a connection error and turn it into a fatal error value
    fn record(&mut self, err: ConnectionError) -> BridgeError {
        self.status = classify(&err);
        BridgeError::capture(err)
    }

    fn translate(&mut self, event: Event, sequence: SequenceNumber) -> CaptureEvent {
        let mut ready = None;
        if let Some(pending) = self.pending.as_mut() {
            if !pending.arrived && sequence >= pending.sequence {
                pending.arrived = true;
                ready = Some(pending.token);
            }
        }

        if let Event::Error(e) = &event {
            return CaptureEvent::RequestFailed {
                error: format!("{:?}", e.error_kind),
                sequence: e.sequence,
            };
        }
        if let Some(token) = ready {
            return CaptureEvent::FrameReady(token);
        }

        match event {
            Event::PropertyNotify(ev) if ev.atom == self.fence_atom => {
                CaptureEvent::Other(format!("late fence on 0x{:08x}", ev.window))
            }
            other => CaptureEvent::Other(format!("{:?}", other)),
        }
    }
}

impl CaptureSide for CaptureTarget<'_> {
    fn next_event(&mut self) -> Result<Option<CaptureEvent>, BridgeError> {
        if self.status != ConnStatus::Healthy {
            return Ok(None);
        }

        match self.conn.poll_for_event_with_sequence() {
            Ok(Some((event, sequence))) => Ok(Some(self.translate(event, sequence))),
            Ok(None) => Ok(None),
            Err(e) if classify(&e) == ConnStatus::Closed => {
                info!("X server closed the connection: {}", e);
                self.status = ConnStatus::Closed;
                Ok(None)
            }
            Err(e) => Err(self.record(e)),
        }
    }

    fn request_frame(&mut self) -> Result<CaptureToken, BridgeError> {
        if let Some(pending) = &self.pending {
            return Ok(pending.token);
        }

        let conn = self.conn;
        let token = CaptureToken(self.next_token);
        self.next_token += 1;

        let cookie = conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.window,
                0,
                0,
                self.geometry.width as u16,
                self.geometry.height as u16,
                ALL_PLANES,
            )
            .map_err(|e| self.record(e))?;
        let sequence = cookie.sequence_number();

        conn.change_property32(
            PropMode::REPLACE,
            self.window,
            self.fence_atom,
            AtomEnum::CARDINAL,
            &[token.0 as u32],
        )
        .map_err(|e| self.record(e))?;

        trace!("Requested capture {} (sequence {})", token, sequence);
        self.pending = Some(PendingImage {
            token,
            cookie,
            sequence,
            arrived: false,
        });
        Ok(token)
    }

    fn take_frame(&mut self, token: CaptureToken) -> FrameReply {
        let Some(pending) = self.pending.take() else {
            debug!("No capture outstanding for {}", token);
            return FrameReply::Failed;
        };

        if pending.token != token {
            debug!("Asked for capture {} but {} is outstanding", token, pending.token);
            self.pending = Some(pending);
            return FrameReply::Failed;
        }

        if !pending.arrived {
            self.pending = Some(pending);
            return FrameReply::Pending;
        }

        match pending.cookie.reply() {
            Ok(reply) => FrameReply::Ready(reply.data),
            Err(ReplyError::X11Error(e)) => {
                warn!("Capture {} refused: {:?}", token, e.error_kind);
                FrameReply::Failed
            }
            Err(ReplyError::ConnectionError(e)) => {
                let err = self.record(e);
                warn!("Capture {} lost: {}", token, err);
                FrameReply::Failed
            }
        }
    }

    fn flush(&mut self) -> FlushOutcome {
        match self.conn.flush() {
            Ok(()) => FlushOutcome::Done,
            Err(e) => {
                let err = self.record(e);
                debug!("X flush stopped: {}", err);
                FlushOutcome::BrokenPipe
            }
        }
    }

    fn status(&self) -> ConnStatus {
        self.status.clone()
    }
}

impl AsFd for CaptureTarget<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.conn.stream().as_fd()
    }
}

impl Drop for CaptureTarget<'_> {
    fn drop(&mut self) {
        // Dropping the cookie discards a reply that may still be in flight
        self.pending = None;
        if self.status == ConnStatus::Healthy {
            if let Err(e) = self.conn.destroy_window(self.window) {
                debug!("Failed to destroy capture window: {}", e);
            } else if let Err(e) = self.conn.flush() {
                debug!("Failed to flush capture teardown: {}", e);
            }
        }
        debug!("Released capture window 0x{:08x}", self.window);
    }
}
