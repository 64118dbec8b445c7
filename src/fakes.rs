//! Scriptable stand-ins for both display connections and for process control

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use crate::binder::{GlobalId, GlobalKind};
use crate::capture::{CaptureEvent, CaptureSide, CaptureToken, FrameReply};
use crate::error::{BridgeError, ConnStatus, FlushOutcome};
use crate::pool::FramePool;
use crate::present::{PresentEvent, PresentationSide};
use crate::supervisor::{ExitKind, LaunchSpec, ProcessControl};

/// Descriptor pair that never becomes readable unless written to
fn quiet_socket() -> (UnixStream, UnixStream) {
    UnixStream::pair().unwrap()
}

/// Flush outcomes played back in order, `Done` once the script runs out.
/// A `BrokenPipe` moves the connection to `on_broken_pipe`, the way the real
/// backends record a write failure.
pub struct ScriptedFlush {
    pub outcomes: VecDeque<FlushOutcome>,
    pub on_broken_pipe: ConnStatus,
    pub attempts: usize,
}

impl Default for ScriptedFlush {
    fn default() -> Self {
        Self {
            outcomes: VecDeque::new(),
            on_broken_pipe: ConnStatus::Closed,
            attempts: 0,
        }
    }
}

impl ScriptedFlush {
    fn next(&mut self, status: &mut ConnStatus) -> FlushOutcome {
        self.attempts += 1;
        let outcome = self.outcomes.pop_front().unwrap_or(FlushOutcome::Done);
        if outcome == FlushOutcome::BrokenPipe {
            *status = self.on_broken_pipe.clone();
        }
        outcome
    }
}

pub struct FakeCapture {
    pub events: VecDeque<Result<Option<CaptureEvent>, BridgeError>>,
    pub replies: VecDeque<FrameReply>,
    pub requests: usize,
    pub status: ConnStatus,
    pub flushes: ScriptedFlush,
    socket: (UnixStream, UnixStream),
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            replies: VecDeque::new(),
            requests: 0,
            status: ConnStatus::Healthy,
            flushes: ScriptedFlush::default(),
            socket: quiet_socket(),
        }
    }
}

impl CaptureSide for FakeCapture {
    fn next_event(&mut self) -> Result<Option<CaptureEvent>, BridgeError> {
        self.events.pop_front().unwrap_or(Ok(None))
    }

    fn request_frame(&mut self) -> Result<CaptureToken, BridgeError> {
        self.requests += 1;
        Ok(CaptureToken(self.requests as u64))
    }

    fn take_frame(&mut self, _token: CaptureToken) -> FrameReply {
        self.replies.pop_front().unwrap_or(FrameReply::Pending)
    }

    fn flush(&mut self) -> FlushOutcome {
        self.flushes.next(&mut self.status)
    }

    fn status(&self) -> ConnStatus {
        self.status.clone()
    }
}

impl AsFd for FakeCapture {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.0.as_fd()
    }
}

/// Everything the core asked the presentation side to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Bind(GlobalKind, u32),
    CreateSurface,
    CreateBuffers,
    CreateToplevel(String),
    Commit,
    AckConfigure(u32),
    Pong(u32),
    Attach(usize),
    RequestRedraw,
    Release,
}

pub struct FakePresenter {
    pub calls: Vec<Call>,
    /// One batch per `read_events` call
    pub batches: VecDeque<Vec<PresentEvent>>,
    pub status: ConnStatus,
    pub fail_bind: Option<GlobalKind>,
    /// Objects still alive, in creation order
    pub live: Vec<&'static str>,
    /// Objects destroyed by `release`, in destruction order
    pub released: Vec<&'static str>,
    pub flushes: ScriptedFlush,
    socket: (UnixStream, UnixStream),
}

impl FakePresenter {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            batches: VecDeque::new(),
            status: ConnStatus::Healthy,
            fail_bind: None,
            live: Vec::new(),
            released: Vec::new(),
            flushes: ScriptedFlush::default(),
            socket: quiet_socket(),
        }
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls.iter().position(|c| c == call)
    }

    pub fn binds_of(&self, kind: GlobalKind) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Bind(k, _) if *k == kind))
            .count()
    }
}

impl PresentationSide for FakePresenter {
    fn read_events(&mut self) -> Result<Vec<PresentEvent>, BridgeError> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }

    fn bind(&mut self, kind: GlobalKind, global: GlobalId) -> Result<(), BridgeError> {
        if self.fail_bind == Some(kind) {
            return Err(BridgeError::Bind {
                kind,
                reason: "refused by test".into(),
            });
        }
        self.calls.push(Call::Bind(kind, global.name));
        self.live.push(match kind {
            GlobalKind::Compositor => "compositor",
            GlobalKind::Output => "output",
            GlobalKind::Shm => "shm",
            GlobalKind::ShellBase => "shell_base",
            GlobalKind::SessionLockManager => "session_lock",
        });
        Ok(())
    }

    fn create_surface(&mut self) -> Result<(), BridgeError> {
        self.calls.push(Call::CreateSurface);
        self.live.push("surface");
        Ok(())
    }

    fn create_buffers(&mut self, _pool: &FramePool) -> Result<(), BridgeError> {
        self.calls.push(Call::CreateBuffers);
        self.live.extend(["shm_pool", "buffer0", "buffer1"]);
        Ok(())
    }

    fn create_toplevel(&mut self, app_id: &str) -> Result<(), BridgeError> {
        self.calls.push(Call::CreateToplevel(app_id.to_string()));
        self.live.extend(["shell_surface", "toplevel"]);
        Ok(())
    }

    fn commit(&mut self) {
        self.calls.push(Call::Commit);
    }

    fn ack_configure(&mut self, serial: u32) {
        self.calls.push(Call::AckConfigure(serial));
    }

    fn pong(&mut self, serial: u32) {
        self.calls.push(Call::Pong(serial));
    }

    fn attach_slot(&mut self, slot: usize) {
        self.calls.push(Call::Attach(slot));
    }

    fn request_redraw(&mut self) {
        self.calls.push(Call::RequestRedraw);
    }

    fn flush(&mut self) -> FlushOutcome {
        self.flushes.next(&mut self.status)
    }

    fn status(&self) -> ConnStatus {
        self.status.clone()
    }

    fn release(&mut self) {
        self.calls.push(Call::Release);
        while let Some(object) = self.live.pop() {
            self.released.push(object);
        }
    }
}

impl AsFd for FakePresenter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.0.as_fd()
    }
}

/// Process control that records instead of forking
pub struct FakeProcesses {
    pub spawn_pid: i32,
    pub spawned: Vec<LaunchSpec>,
    pub signalled: Vec<i32>,
    /// What `wait` reports: reaped pid and how it ended
    pub reap: (i32, ExitKind),
}

impl FakeProcesses {
    pub fn new(pid: i32) -> Self {
        Self {
            spawn_pid: pid,
            spawned: Vec::new(),
            signalled: Vec::new(),
            reap: (pid, ExitKind::Exited(0)),
        }
    }
}

impl ProcessControl for FakeProcesses {
    fn spawn(&mut self, spec: &LaunchSpec) -> std::io::Result<i32> {
        self.spawned.push(spec.clone());
        Ok(self.spawn_pid)
    }

    fn signal(&mut self, pid: i32) -> nix::Result<()> {
        self.signalled.push(pid);
        Ok(())
    }

    fn wait(&mut self, _pid: i32) -> nix::Result<(i32, ExitKind)> {
        Ok(self.reap)
    }
}
