//! Presentation side
//!
//! The core never touches Wayland proxies directly. It sees the compositor
//! through [`PresentationSide`] and receives its notifications as
//! [`PresentEvent`] values, translated once at the protocol boundary.

pub mod wayland;

use std::os::fd::AsFd;

use crate::binder::{GlobalId, GlobalKind};
use crate::error::{BridgeError, ConnStatus, FlushOutcome};
use crate::pool::FramePool;

/// Everything the core reacts to on the presentation connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentEvent {
    /// A global of a kind we care about was advertised
    GlobalAnnounced { kind: GlobalKind, global: GlobalId },
    /// A global (any kind) was withdrawn
    GlobalRemoved { name: u32 },
    /// Keep-alive that must be answered with the same serial
    Ping(u32),
    /// Surface configure that must be acknowledged
    Configure(u32),
    /// Frame callback fired; the serial is the sequence we assigned
    FrameDone(u32),
    /// Compositor is done reading a buffer slot
    BufferReleased(usize),
    /// The compositor asked the top-level to close
    CloseRequested,
}

/// Requests the core issues on the presentation connection.
///
/// Construction calls report failures; per-frame calls are fire-and-forget,
/// their errors show up in [`PresentationSide::status`].
pub trait PresentationSide: AsFd {
    /// Read whatever is available and dispatch it, returning events in
    /// arrival order. Must not block.
    fn read_events(&mut self) -> Result<Vec<PresentEvent>, BridgeError>;

    /// Bind an announced global of the given kind
    fn bind(&mut self, kind: GlobalKind, global: GlobalId) -> Result<(), BridgeError>;

    /// Create the drawable surface from the bound compositor
    fn create_surface(&mut self) -> Result<(), BridgeError>;

    /// Create the buffer slots over the shared pool
    fn create_buffers(&mut self, pool: &FramePool) -> Result<(), BridgeError>;

    /// Create the shell surface and top-level for the surface
    fn create_toplevel(&mut self, app_id: &str) -> Result<(), BridgeError>;

    fn commit(&mut self);

    fn ack_configure(&mut self, serial: u32);

    fn pong(&mut self, serial: u32);

    /// Attach a slot and damage the whole surface
    fn attach_slot(&mut self, slot: usize);

    /// Ask to be notified before the next redraw
    fn request_redraw(&mut self);

    fn flush(&mut self) -> FlushOutcome;

    fn status(&self) -> ConnStatus;

    /// Destroy every created object in reverse creation order. Idempotent.
    fn release(&mut self);
}
