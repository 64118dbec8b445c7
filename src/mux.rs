//! Connection Multiplexer
//!
//! Single-threaded loop over both display connections. Each iteration drains
//! and reacts without blocking, flushes, checks for a reason to stop, then
//! sleeps in `poll` until either descriptor is readable or the timeout expires.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM};
use tracing::{debug, info, trace, warn};

use crate::capture::CaptureSide;
use crate::error::{BridgeError, FlushOutcome, Side};
use crate::present::PresentationSide;
use crate::session::{LoopExit, Session};

/// Flags set from signal handlers. Handlers only store; the loop reads them
/// after every iteration.
#[derive(Debug, Clone, Default)]
pub struct ShutdownRequest {
    terminate: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
}

impl ShutdownRequest {
    /// Route SIGINT, SIGTERM and SIGCHLD into the flags
    pub fn register() -> io::Result<Self> {
        let request = Self::default();
        signal_hook::flag::register(SIGINT, Arc::clone(&request.terminate))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&request.terminate))?;
        signal_hook::flag::register(SIGCHLD, Arc::clone(&request.child_exited))?;
        Ok(request)
    }

    #[cfg(test)]
    pub fn request(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    /// Reason to stop, if any
    pub fn pending(&self) -> Option<&'static str> {
        if self.terminate.load(Ordering::Relaxed) {
            Some("signal")
        } else if self.child_exited.load(Ordering::Relaxed) {
            Some("screensaver exited")
        } else {
            None
        }
    }
}

pub struct Multiplexer {
    timeout: PollTimeout,
    shutdown: ShutdownRequest,
    iterations: u64,
}

impl Multiplexer {
    pub fn new(timeout_ms: u16, shutdown: ShutdownRequest) -> Self {
        Self {
            timeout: PollTimeout::from(timeout_ms),
            shutdown,
            iterations: 0,
        }
    }

    /// Run until a connection fails, a session closes or shutdown is requested
    pub fn run<C, P>(&mut self, session: &mut Session<'_, C, P>) -> Result<LoopExit, BridgeError>
    where
        C: CaptureSide + ?Sized,
        P: PresentationSide + ?Sized,
    {
        info!("Entering event loop");
        loop {
            self.iterations += 1;

            session.turn()?;

            self.flush(session, Side::Capture)?;
            self.flush(session, Side::Presentation)?;

            if let Some(exit) = session.check_status()? {
                info!(
                    "Leaving event loop after {} iterations, {} frames: {}",
                    self.iterations,
                    session.bridge().presented(),
                    exit
                );
                return Ok(exit);
            }

            if let Some(reason) = self.shutdown.pending() {
                info!("Leaving event loop after {} iterations: {}", self.iterations, reason);
                return Ok(LoopExit::ShutdownRequested(reason));
            }

            if session.redraw_pending() {
                trace!("Redraw still owed, not waiting");
                continue;
            }
            self.wait_readable(session)?;
        }
    }

    /// Flush one side. A full socket is retried only once it polls writable;
    /// a broken pipe is left for the status check.
    fn flush<C, P>(&self, session: &mut Session<'_, C, P>, side: Side) -> Result<(), BridgeError>
    where
        C: CaptureSide + ?Sized,
        P: PresentationSide + ?Sized,
    {
        loop {
            match session.flush(side) {
                FlushOutcome::Done => return Ok(()),
                FlushOutcome::BrokenPipe => {
                    debug!("{} side hung up during flush", side);
                    return Ok(());
                }
                FlushOutcome::WouldBlock => {
                    let mut fds = [PollFd::new(session.fd(side), PollFlags::POLLOUT)];
                    match poll(&mut fds, self.timeout) {
                        Ok(0) => {
                            warn!("{} side stayed unwritable, flush postponed", side);
                            return Ok(());
                        }
                        Ok(_) => trace!("{} side writable again", side),
                        // A signal landed; let the shutdown check see it
                        Err(Errno::EINTR) => return Ok(()),
                        Err(e) => return Err(BridgeError::resource("poll", e)),
                    }
                }
            }
        }
    }

    fn wait_readable<C, P>(&self, session: &Session<'_, C, P>) -> Result<(), BridgeError>
    where
        C: CaptureSide + ?Sized,
        P: PresentationSide + ?Sized,
    {
        let mut fds = [
            PollFd::new(session.fd(Side::Capture), PollFlags::POLLIN),
            PollFd::new(session.fd(Side::Presentation), PollFlags::POLLIN),
        ];
        match poll(&mut fds, self.timeout) {
            Ok(0) => trace!("Poll timed out"),
            Ok(_) => trace!(
                "Readable: capture {:?}, presentation {:?}",
                fds[0].revents(),
                fds[1].revents()
            ),
            Err(Errno::EINTR) => debug!("Poll interrupted by signal"),
            Err(e) => return Err(BridgeError::resource("poll", e)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::binder::{CapabilityBinder, GlobalId, GlobalKind};
    use crate::capture::CaptureEvent;
    use crate::error::ConnStatus;
    use crate::fakes::{Call, FakeCapture, FakePresenter};
    use crate::pool::FrameGeometry;
    use crate::present::PresentEvent;

    fn binder() -> CapabilityBinder {
        CapabilityBinder::new(FrameGeometry::new(4, 2), "saverbridge")
    }

    fn announce(kind: GlobalKind, name: u32) -> PresentEvent {
        PresentEvent::GlobalAnnounced {
            kind,
            global: GlobalId { name, version: 1 },
        }
    }

    #[test]
    fn test_capture_fatal_error_fails_loop_and_releases() {
        let mut capture = FakeCapture::new();
        let mut present = FakePresenter::new();
        // First iteration drains cleanly, the second one hits the error
        capture.events.push_back(Ok(None));
        capture.events.push_back(Err(BridgeError::capture("connection reset by test")));
        present.batches.push_back(vec![
            announce(GlobalKind::Compositor, 1),
            announce(GlobalKind::Shm, 2),
            announce(GlobalKind::ShellBase, 3),
        ]);

        {
            let mut session = Session::new(&mut capture, &mut present, binder());
            let mut mux = Multiplexer::new(1, ShutdownRequest::default());
            let result = mux.run(&mut session);
            assert!(matches!(
                result,
                Err(BridgeError::ConnectionFatal {
                    side: Side::Capture,
                    ..
                })
            ));
        }

        for object in ["surface", "buffer0", "buffer1"] {
            assert!(present.released.contains(&object), "{} not released", object);
        }
        assert!(present.live.is_empty());
    }

    #[test]
    fn test_presentation_close_before_binds() {
        let mut capture = FakeCapture::new();
        let mut present = FakePresenter::new();
        present.status = ConnStatus::Closed;

        {
            let mut session = Session::new(&mut capture, &mut present, binder());
            let mut mux = Multiplexer::new(1, ShutdownRequest::default());
            assert_eq!(
                mux.run(&mut session).unwrap(),
                LoopExit::SessionClosed(Side::Presentation)
            );
        }
        assert_eq!(capture.requests, 0);
        assert_eq!(present.calls, vec![Call::Release]);
    }

    #[test]
    fn test_shutdown_request_ends_loop() {
        let mut capture = FakeCapture::new();
        let mut present = FakePresenter::new();
        let shutdown = ShutdownRequest::default();
        shutdown.request();

        let mut session = Session::new(&mut capture, &mut present, binder());
        let mut mux = Multiplexer::new(1, shutdown);
        assert_eq!(
            mux.run(&mut session).unwrap(),
            LoopExit::ShutdownRequested("signal")
        );
    }

    #[test]
    fn test_loop_keeps_running_through_timeouts() {
        let mut capture = FakeCapture::new();
        let mut present = FakePresenter::new();
        // Three quiet iterations, then the compositor goes away
        present.batches.extend([vec![], vec![], vec![PresentEvent::CloseRequested]]);

        let mut session = Session::new(&mut capture, &mut present, binder());
        let mut mux = Multiplexer::new(1, ShutdownRequest::default());
        assert_eq!(mux.run(&mut session).unwrap(), LoopExit::CloseRequested);
        assert_eq!(mux.iterations, 3);
    }

    #[test]
    fn test_deferred_redraw_does_not_wait_for_timeout() {
        let mut capture = FakeCapture::new();
        let mut present = FakePresenter::new();
        capture.events.push_back(Ok(Some(CaptureEvent::RequestFailed {
            error: "Match".into(),
            sequence: 1,
        })));
        present.batches.push_back(vec![
            announce(GlobalKind::Compositor, 1),
            announce(GlobalKind::Shm, 2),
            announce(GlobalKind::ShellBase, 3),
            PresentEvent::Configure(7),
        ]);
        present.batches.push_back(vec![PresentEvent::CloseRequested]);

        let mut session = Session::new(&mut capture, &mut present, binder());
        let mut mux = Multiplexer::new(3000, ShutdownRequest::default());
        let started = Instant::now();
        assert_eq!(mux.run(&mut session).unwrap(), LoopExit::CloseRequested);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.bridge().presented(), 1);
        assert_eq!(mux.iterations, 2);
    }

    #[test]
    fn test_full_socket_flush_retries_once_writable() {
        let mut capture = FakeCapture::new();
        let mut present = FakePresenter::new();
        present
            .flushes
            .outcomes
            .extend([FlushOutcome::WouldBlock, FlushOutcome::Done]);
        present.batches.push_back(vec![PresentEvent::CloseRequested]);

        {
            let mut session = Session::new(&mut capture, &mut present, binder());
            let mut mux = Multiplexer::new(1000, ShutdownRequest::default());
            let started = Instant::now();
            assert_eq!(mux.run(&mut session).unwrap(), LoopExit::CloseRequested);
            // The socket polls writable straight away
            assert!(started.elapsed() < Duration::from_millis(500));
        }
        assert!(present.flushes.outcomes.is_empty());
        // Two in the loop, one at teardown
        assert_eq!(present.flushes.attempts, 3);
    }

    #[test]
    fn test_broken_pipe_on_flush_left_to_status_check() {
        let mut capture = FakeCapture::new();
        let mut present = FakePresenter::new();
        capture.flushes.outcomes.push_back(FlushOutcome::BrokenPipe);

        {
            let mut session = Session::new(&mut capture, &mut present, binder());
            let mut mux = Multiplexer::new(1, ShutdownRequest::default());
            assert_eq!(
                mux.run(&mut session).unwrap(),
                LoopExit::SessionClosed(Side::Capture)
            );
        }
        // The presentation side was still flushed after the capture hang-up
        assert_eq!(present.flushes.attempts, 2);
    }

    #[test]
    fn test_failed_write_on_flush_fails_loop() {
        let mut capture = FakeCapture::new();
        let mut present = FakePresenter::new();
        capture.flushes.outcomes.push_back(FlushOutcome::BrokenPipe);
        capture.flushes.on_broken_pipe = ConnStatus::Failed("write failed".into());

        let mut session = Session::new(&mut capture, &mut present, binder());
        let mut mux = Multiplexer::new(1, ShutdownRequest::default());
        assert!(matches!(
            mux.run(&mut session),
            Err(BridgeError::ConnectionFatal {
                side: Side::Capture,
                ..
            })
        ));
    }

    #[test]
    fn test_signal_takes_precedence_over_child_exit() {
        let shutdown = ShutdownRequest::default();
        shutdown.child_exited.store(true, Ordering::Relaxed);
        assert_eq!(shutdown.pending(), Some("screensaver exited"));
        shutdown.request();
        assert_eq!(shutdown.pending(), Some("signal"));
    }
}
