//! Subprocess Supervisor
//!
//! Starts the screensaver pointed at the capture window and takes it down
//! again exactly once.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::ScreensaverConfig;
use crate::error::BridgeError;

/// How a reaped child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exited normally: {}", code),
            ExitKind::Signaled(signo) => {
                let name = Signal::try_from(*signo)
                    .map(|s| s.as_str())
                    .unwrap_or("unknown signal");
                write!(f, "exited by an uncaught signal: {} {}", signo, name)
            }
        }
    }
}

/// Everything needed to start the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Variables added on top of the inherited environment
    pub env: Vec<(OsString, OsString)>,
}

/// Process operations, separated so supervision can be tested without forking
pub trait ProcessControl {
    fn spawn(&mut self, spec: &LaunchSpec) -> std::io::Result<i32>;

    /// Ask the process to terminate
    fn signal(&mut self, pid: i32) -> nix::Result<()>;

    /// Block until a child matching `pid` is reaped
    fn wait(&mut self, pid: i32) -> nix::Result<(i32, ExitKind)>;
}

/// Real processes via fork/exec, SIGTERM and waitpid
#[derive(Debug, Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn spawn(&mut self, spec: &LaunchSpec) -> std::io::Result<i32> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .spawn()?;
        // Reaping is done through waitpid, not the Child handle
        Ok(child.id() as i32)
    }

    fn signal(&mut self, pid: i32) -> nix::Result<()> {
        // A zombie still counts as existing, so ESRCH means it is truly gone
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
    }

    fn wait(&mut self, pid: i32) -> nix::Result<(i32, ExitKind)> {
        loop {
            match wait::waitpid(Pid::from_raw(pid), None) {
                Ok(WaitStatus::Exited(reaped, code)) => {
                    return Ok((reaped.as_raw(), ExitKind::Exited(code)));
                }
                Ok(WaitStatus::Signaled(reaped, sig, _)) => {
                    return Ok((reaped.as_raw(), ExitKind::Signaled(sig as i32)));
                }
                Ok(other) => debug!("Ignoring wait status {:?}", other),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Lifecycle of the supervised child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    Reaped,
}

/// The screensaver child. Terminated on drop if still running.
pub struct ScreensaverProcess<S: ProcessControl = SystemProcesses> {
    control: S,
    pid: i32,
    state: Lifecycle,
}

/// Hex token the screensaver reads its target window from: `0x` plus two
/// digits per byte of the id
pub fn window_token(window: u32) -> String {
    format!("0x{:0width$x}", window, width = std::mem::size_of::<u32>() * 2)
}

impl<S: ProcessControl> ScreensaverProcess<S> {
    /// A supervisor with nothing started yet
    pub fn new(control: S) -> Self {
        Self {
            control,
            pid: 0,
            state: Lifecycle::NotStarted,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> Lifecycle {
        self.state
    }

    #[cfg(test)]
    pub fn control(&self) -> &S {
        &self.control
    }

    /// Spawn `path` drawing into `window`
    pub fn launch(
        &mut self,
        path: &Path,
        window: u32,
        config: &ScreensaverConfig,
    ) -> Result<i32, BridgeError> {
        let spec = LaunchSpec {
            program: path.to_path_buf(),
            args: vec![OsString::from(&config.root_flag)],
            env: vec![(
                OsString::from(&config.window_env),
                OsString::from(window_token(window)),
            )],
        };

        let pid = self.control.spawn(&spec).map_err(|source| BridgeError::Spawn {
            path: path.display().to_string(),
            source,
        })?;
        if pid <= 0 {
            return Err(BridgeError::Spawn {
                path: path.display().to_string(),
                source: std::io::Error::other(format!("spawn returned pid {}", pid)),
            });
        }

        self.pid = pid;
        self.state = Lifecycle::Running;
        info!(
            "Launched {} (pid {}, {}={})",
            path.display(),
            pid,
            config.window_env,
            window_token(window)
        );
        Ok(pid)
    }

    /// Signal and reap the child. Only the first call on a running child does
    /// anything; later calls and never-started children return `Ok(None)`.
    pub fn terminate(&mut self) -> Result<Option<ExitKind>, BridgeError> {
        if self.pid <= 0 || self.state != Lifecycle::Running {
            return Ok(None);
        }
        // Whatever happens below, never signal this pid again
        self.state = Lifecycle::Reaped;

        if let Err(e) = self.control.signal(self.pid) {
            warn!("Failed to signal screensaver {}: {}", self.pid, e);
            return Ok(None);
        }

        let (reaped, exit) = match self.control.wait(self.pid) {
            Ok(result) => result,
            Err(e) => {
                warn!("Failed to wait for screensaver {}: {}", self.pid, e);
                return Ok(None);
            }
        };
        if reaped != self.pid {
            return Err(BridgeError::SupervisionIntegrity {
                expected: self.pid,
                reaped,
            });
        }

        info!("Screensaver {}", exit);
        Ok(Some(exit))
    }
}

impl<S: ProcessControl> Drop for ScreensaverProcess<S> {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            error!("{}", e);
        }
    }
}
