//! Wayland presentation backend
//!
//! Owns the client connection, its event queue and every protocol object the
//! bridge creates. Protocol callbacks only append [`PresentEvent`] values to
//! [`PresentState`]; all decisions are made by the core after dispatch.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};
use wayland_client::backend::WaylandError;
use wayland_client::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_output, wl_registry, wl_shm, wl_shm_pool, wl_surface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols::ext::session_lock::v1::client::ext_session_lock_manager_v1::ExtSessionLockManagerV1;
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use super::{PresentEvent, PresentationSide};
use crate::binder::{GlobalId, GlobalKind};
use crate::error::{is_disconnect, BridgeError, ConnStatus, FlushOutcome};
use crate::pool::{FramePool, SLOT_COUNT};

/// First `wl_surface` version with `damage_buffer`
const DAMAGE_BUFFER_SINCE: u32 = 4;

/// Dispatch target. Collects translated events until the core takes them.
#[derive(Debug, Default)]
pub struct PresentState {
    events: Vec<PresentEvent>,
}

/// A created protocol object, kept so teardown can run in reverse order
enum Created {
    Compositor,
    Output(wl_output::WlOutput),
    Shm,
    ShellBase(xdg_wm_base::XdgWmBase),
    SessionLock(ExtSessionLockManagerV1),
    Surface(wl_surface::WlSurface),
    ShmPool(wl_shm_pool::WlShmPool),
    Buffer(wl_buffer::WlBuffer),
    ShellSurface(xdg_surface::XdgSurface),
    Toplevel(xdg_toplevel::XdgToplevel),
}

impl Created {
    /// Send the destructor request, if the bound version has one
    fn destroy(self) -> &'static str {
        match self {
            // Neither global has a destructor; the live handle drops with Handles
            Created::Compositor => "wl_compositor",
            Created::Output(output) => {
                if output.version() >= 3 {
                    output.release();
                }
                "wl_output"
            }
            Created::Shm => "wl_shm",
            Created::ShellBase(wm_base) => {
                wm_base.destroy();
                "xdg_wm_base"
            }
            Created::SessionLock(manager) => {
                manager.destroy();
                "ext_session_lock_manager_v1"
            }
            Created::Surface(surface) => {
                surface.destroy();
                "wl_surface"
            }
            Created::ShmPool(pool) => {
                pool.destroy();
                "wl_shm_pool"
            }
            Created::Buffer(buffer) => {
                buffer.destroy();
                "wl_buffer"
            }
            Created::ShellSurface(shell_surface) => {
                shell_surface.destroy();
                "xdg_surface"
            }
            Created::Toplevel(toplevel) => {
                toplevel.destroy();
                "xdg_toplevel"
            }
        }
    }
}

/// Live handles the per-frame requests go through
#[derive(Default)]
struct Handles {
    compositor: Option<wl_compositor::WlCompositor>,
    shm: Option<wl_shm::WlShm>,
    wm_base: Option<xdg_wm_base::XdgWmBase>,
    surface: Option<wl_surface::WlSurface>,
    buffers: Vec<wl_buffer::WlBuffer>,
    shell_surface: Option<xdg_surface::XdgSurface>,
}

pub struct WaylandPresenter {
    conn: Connection,
    queue: EventQueue<PresentState>,
    qh: QueueHandle<PresentState>,
    state: PresentState,
    registry: wl_registry::WlRegistry,
    handles: Handles,
    /// Every created object, in creation order
    created: Vec<Created>,
    fullscreen: bool,
    /// Sequence handed to the next frame callback
    frame_seq: u32,
    status: ConnStatus,
}

impl WaylandPresenter {
    /// Connect using `$WAYLAND_DISPLAY` and start listening to the registry.
    /// Globals arrive as events on the first read.
    pub fn connect(fullscreen: bool) -> Result<Self> {
        let conn = Connection::connect_to_env().context("Failed to connect to Wayland compositor")?;
        let queue = conn.new_event_queue();
        let qh = queue.handle();
        let registry = conn.display().get_registry(&qh, ());
        info!("Connected to Wayland compositor");

        Ok(Self {
            conn,
            queue,
            qh,
            state: PresentState::default(),
            registry,
            handles: Handles::default(),
            created: Vec::new(),
            fullscreen,
            frame_seq: 0,
            status: ConnStatus::Healthy,
        })
    }

    /// Classify a backend error, remember it, and produce the fatal error value
    fn record(&mut self, err: WaylandError) -> BridgeError {
        match &err {
            WaylandError::Io(e) if is_disconnect(e.kind()) => self.status = ConnStatus::Closed,
            _ => self.status = ConnStatus::Failed(err.to_string()),
        }
        BridgeError::presentation(err)
    }

    fn bind_global<I>(&self, global: GlobalId, version: u32) -> I
    where
        I: Proxy + 'static,
        PresentState: Dispatch<I, ()>,
    {
        self.registry.bind::<I, _, _>(global.name, version, &self.qh, ())
    }
}

impl PresentationSide for WaylandPresenter {
    fn read_events(&mut self) -> Result<Vec<PresentEvent>, BridgeError> {
        if self.status != ConnStatus::Healthy {
            return Ok(Vec::new());
        }

        // `None` means events are already queued; dispatch those first
        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(n) => trace!("Read {} Wayland events", n),
                Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(WaylandError::Io(e)) if is_disconnect(e.kind()) => {
                    info!("Wayland compositor closed the connection: {}", e);
                    self.status = ConnStatus::Closed;
                }
                Err(e) => return Err(self.record(e)),
            }
        }

        if let Err(e) = self.queue.dispatch_pending(&mut self.state) {
            self.status = ConnStatus::Failed(e.to_string());
            return Err(BridgeError::presentation(e));
        }

        Ok(std::mem::take(&mut self.state.events))
    }

    fn bind(&mut self, kind: GlobalKind, global: GlobalId) -> Result<(), BridgeError> {
        let version = global.bind_version(kind);
        if version == 0 {
            return Err(BridgeError::Bind {
                kind,
                reason: "version 0".into(),
            });
        }

        match kind {
            GlobalKind::Compositor => {
                let compositor: wl_compositor::WlCompositor = self.bind_global(global, version);
                self.handles.compositor = Some(compositor);
                self.created.push(Created::Compositor);
            }
            GlobalKind::Output => {
                let output: wl_output::WlOutput = self.bind_global(global, version);
                self.created.push(Created::Output(output));
            }
            GlobalKind::Shm => {
                let shm: wl_shm::WlShm = self.bind_global(global, version);
                self.handles.shm = Some(shm);
                self.created.push(Created::Shm);
            }
            GlobalKind::ShellBase => {
                let wm_base: xdg_wm_base::XdgWmBase = self.bind_global(global, version);
                self.handles.wm_base = Some(wm_base.clone());
                self.created.push(Created::ShellBase(wm_base));
            }
            GlobalKind::SessionLockManager => {
                let manager: ExtSessionLockManagerV1 = self.bind_global(global, version);
                self.created.push(Created::SessionLock(manager));
            }
        }
        debug!("Bound {} name {} v{}", kind, global.name, version);
        Ok(())
    }

    fn create_surface(&mut self) -> Result<(), BridgeError> {
        let compositor = self.handles.compositor.as_ref().ok_or_else(|| BridgeError::Bind {
            kind: GlobalKind::Compositor,
            reason: "surface requested before the compositor was bound".into(),
        })?;
        let surface = compositor.create_surface(&self.qh, ());
        self.handles.surface = Some(surface.clone());
        self.created.push(Created::Surface(surface));
        Ok(())
    }

    fn create_buffers(&mut self, pool: &FramePool) -> Result<(), BridgeError> {
        let shm = self.handles.shm.as_ref().ok_or_else(|| BridgeError::Bind {
            kind: GlobalKind::Shm,
            reason: "buffers requested before wl_shm was bound".into(),
        })?;
        let geometry = pool.geometry();
        let size = i32::try_from(pool.len()).map_err(|_| {
            BridgeError::resource(
                "shared memory pool",
                io::Error::new(io::ErrorKind::InvalidInput, "pool larger than i32::MAX"),
            )
        })?;

        let shm_pool = shm.create_pool(pool.as_fd(), size, &self.qh, ());
        let mut buffers = Vec::with_capacity(SLOT_COUNT);
        for slot in 0..SLOT_COUNT {
            buffers.push(shm_pool.create_buffer(
                pool.slot_offset(slot) as i32,
                geometry.width as i32,
                geometry.height as i32,
                geometry.stride as i32,
                wl_shm::Format::Xrgb8888,
                &self.qh,
                slot,
            ));
        }

        self.created.push(Created::ShmPool(shm_pool));
        self.created
            .extend(buffers.iter().cloned().map(Created::Buffer));
        self.handles.buffers = buffers;
        Ok(())
    }

    fn create_toplevel(&mut self, app_id: &str) -> Result<(), BridgeError> {
        let (Some(wm_base), Some(surface)) = (&self.handles.wm_base, &self.handles.surface) else {
            return Err(BridgeError::Bind {
                kind: GlobalKind::ShellBase,
                reason: "top-level requested before the shell and surface exist".into(),
            });
        };

        let shell_surface = wm_base.get_xdg_surface(surface, &self.qh, ());
        let toplevel = shell_surface.get_toplevel(&self.qh, ());
        toplevel.set_app_id(app_id.to_string());
        toplevel.set_title(app_id.to_string());
        if self.fullscreen {
            toplevel.set_fullscreen(None);
        }

        self.handles.shell_surface = Some(shell_surface.clone());
        self.created.push(Created::ShellSurface(shell_surface));
        self.created.push(Created::Toplevel(toplevel));
        Ok(())
    }

    fn commit(&mut self) {
        if let Some(surface) = &self.handles.surface {
            surface.commit();
        }
    }

    fn ack_configure(&mut self, serial: u32) {
        if let Some(shell_surface) = &self.handles.shell_surface {
            shell_surface.ack_configure(serial);
        }
    }

    fn pong(&mut self, serial: u32) {
        if let Some(wm_base) = &self.handles.wm_base {
            wm_base.pong(serial);
        }
    }

    fn attach_slot(&mut self, slot: usize) {
        let (Some(surface), Some(buffer)) = (&self.handles.surface, self.handles.buffers.get(slot))
        else {
            warn!("Cannot attach slot {}: surface or buffer missing", slot);
            return;
        };

        surface.attach(Some(buffer), 0, 0);
        if surface.version() >= DAMAGE_BUFFER_SINCE {
            surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        } else {
            surface.damage(0, 0, i32::MAX, i32::MAX);
        }
    }

    fn request_redraw(&mut self) {
        if let Some(surface) = &self.handles.surface {
            self.frame_seq = self.frame_seq.wrapping_add(1);
            surface.frame(&self.qh, self.frame_seq);
        }
    }

    fn flush(&mut self) -> FlushOutcome {
        match self.conn.flush() {
            Ok(()) => FlushOutcome::Done,
            Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                FlushOutcome::WouldBlock
            }
            Err(e) => {
                let err = self.record(e);
                debug!("Wayland flush stopped: {}", err);
                FlushOutcome::BrokenPipe
            }
        }
    }

    fn status(&self) -> ConnStatus {
        if let Some(err) = self.conn.protocol_error() {
            return ConnStatus::Failed(format!(
                "protocol error {} on {}@{}: {}",
                err.code, err.object_interface, err.object_id, err.message
            ));
        }
        self.status.clone()
    }

    fn release(&mut self) {
        if self.created.is_empty() {
            return;
        }
        self.handles = Handles::default();
        while let Some(object) = self.created.pop() {
            let name = object.destroy();
            trace!("Destroyed {}", name);
        }
        debug!("Released presentation objects");
    }
}

impl AsFd for WaylandPresenter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.conn.as_fd()
    }
}

impl Drop for WaylandPresenter {
    fn drop(&mut self) {
        self.release();
        if self.status == ConnStatus::Healthy {
            if let Err(e) = self.conn.flush() {
                debug!("Failed to flush presentation teardown: {}", e);
            }
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for PresentState {
    fn event(
        state: &mut Self,
        _registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match GlobalKind::from_interface(&interface) {
                Some(kind) => state.events.push(PresentEvent::GlobalAnnounced {
                    kind,
                    global: GlobalId { name, version },
                }),
                None => trace!("Skipping global {} ({} v{})", name, interface, version),
            },
            wl_registry::Event::GlobalRemove { name } => {
                state.events.push(PresentEvent::GlobalRemoved { name });
            }
            _ => {}
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for PresentState {
    fn event(
        state: &mut Self,
        _wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            state.events.push(PresentEvent::Ping(serial));
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for PresentState {
    fn event(
        state: &mut Self,
        _shell_surface: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            state.events.push(PresentEvent::Configure(serial));
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for PresentState {
    fn event(
        state: &mut Self,
        _toplevel: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                // Buffers keep the capture geometry; the compositor scales or crops
                debug!("Top-level configured at {}x{}", width, height);
            }
            xdg_toplevel::Event::Close => state.events.push(PresentEvent::CloseRequested),
            _ => {}
        }
    }
}

impl Dispatch<wl_callback::WlCallback, u32> for PresentState {
    fn event(
        state: &mut Self,
        _callback: &wl_callback::WlCallback,
        event: wl_callback::Event,
        seq: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            state.events.push(PresentEvent::FrameDone(*seq));
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, usize> for PresentState {
    fn event(
        state: &mut Self,
        _buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        slot: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            state.events.push(PresentEvent::BufferReleased(*slot));
        }
    }
}

impl Dispatch<wl_output::WlOutput, ()> for PresentState {
    fn event(
        _state: &mut Self,
        output: &wl_output::WlOutput,
        event: wl_output::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_output::Event::Mode {
                flags: WEnum::Value(flags),
                width,
                height,
                refresh,
            } if flags.contains(wl_output::Mode::Current) => {
                info!(
                    "Output {} mode {}x{} @ {}.{:03} Hz",
                    output.id(),
                    width,
                    height,
                    refresh / 1000,
                    refresh % 1000
                );
            }
            wl_output::Event::Geometry { make, model, .. } => {
                debug!("Output {}: {} {}", output.id(), make, model);
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_shm::WlShm, ()> for PresentState {
    fn event(
        _state: &mut Self,
        _shm: &wl_shm::WlShm,
        event: wl_shm::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format { format } = event {
            trace!("SHM format available: {:?}", format);
        }
    }
}

delegate_noop!(PresentState: wl_compositor::WlCompositor);
delegate_noop!(PresentState: wl_shm_pool::WlShmPool);
delegate_noop!(PresentState: ignore wl_surface::WlSurface);
delegate_noop!(PresentState: ExtSessionLockManagerV1);
