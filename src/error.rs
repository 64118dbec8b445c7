//! Error taxonomy for the bridge
//!
//! Connection-fatal and resource errors end the process with failure.
//! Session closes are not errors at all: they surface as [`ConnStatus::Closed`]
//! and end the loop successfully. Transient request failures never reach this
//! type; they are absorbed where they happen.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::binder::GlobalKind;

/// Which of the two display connections something happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Capture,
    Presentation,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Capture => f.write_str("capture"),
            Side::Presentation => f.write_str("presentation"),
        }
    }
}

/// Error state of a display connection, sampled once per loop iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnStatus {
    Healthy,
    /// Peer-initiated disconnect. Ends the session without failure.
    Closed,
    /// Unrecoverable protocol or transport error.
    Failed(String),
}

/// Result of one attempt to push buffered requests to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Done,
    /// Socket is full; retry once it polls writable.
    WouldBlock,
    /// Peer is gone. Stop trying; the status check reports it.
    BrokenPipe,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{side} connection failed: {reason}")]
    ConnectionFatal { side: Side, reason: String },

    #[error("failed to bind {kind}: {reason}")]
    Bind { kind: GlobalKind, reason: String },

    #[error("failed to acquire {resource}: {source}")]
    Resource {
        resource: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("waited for child {expected} but reaped {reaped}")]
    SupervisionIntegrity { expected: i32, reaped: i32 },
}

impl BridgeError {
    pub fn capture(reason: impl fmt::Display) -> Self {
        BridgeError::ConnectionFatal {
            side: Side::Capture,
            reason: reason.to_string(),
        }
    }

    pub fn presentation(reason: impl fmt::Display) -> Self {
        BridgeError::ConnectionFatal {
            side: Side::Presentation,
            reason: reason.to_string(),
        }
    }

    pub fn resource(resource: &'static str, source: impl Into<io::Error>) -> Self {
        BridgeError::Resource {
            resource,
            source: source.into(),
        }
    }
}

/// True for I/O errors that mean the peer hung up rather than misbehaved
pub fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
