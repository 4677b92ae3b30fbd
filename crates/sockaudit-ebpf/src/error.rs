//! Error types for the state engine.
//!
//! [`FlowError`] covers per-event conditions that are logged and skipped;
//! [`SensorError`] ends a run and is returned to the caller.

use sockaudit_common::error::SockauditError;
use sockaudit_common::types::SocketId;
use thiserror::Error;

/// A kernel event that could not be applied to the state.
///
/// None of these stop processing; the dispatcher counts them and logs them
/// under the detail target.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    /// Traffic without a remote endpoint on a socket that never learned one.
    #[error("socket {sock}: no remote endpoint known for traffic event")]
    MissingEndpoint {
        /// Socket the event referenced.
        sock: SocketId,
    },

    /// Traffic on a socket whose transport was never observed.
    #[error("socket {sock}: transport unknown")]
    MissingTransport {
        /// Socket the event referenced.
        sock: SocketId,
    },

    /// New traffic on a socket that is already closing.
    #[error("socket {sock} is closing; ignoring traffic for a new flow")]
    SocketClosing {
        /// Socket the event referenced.
        sock: SocketId,
    },

    /// A second close for the same socket.
    #[error("socket {sock} already closed")]
    AlreadyClosed {
        /// Socket the event referenced.
        sock: SocketId,
    },

    /// A process event without a pid.
    #[error("process event without a pid")]
    MissingPid,

    /// A genuine `uname(2)` call, not a calibration sample.
    #[error("uname call without clock sync marker")]
    NotClockSync,

    /// The kernel timestamp cannot be expressed as wall-clock time.
    #[error("kernel timestamp {timestamp} cannot be translated to wall-clock time")]
    Untranslatable {
        /// Kernel trace clock value in nanoseconds.
        timestamp: u64,
    },
}

/// A failure that terminates a sensor run.
#[derive(Debug, Error)]
pub enum SensorError {
    /// The capture source reported a fatal error.
    #[error("capture source failed: {source}")]
    Capture {
        /// Error delivered on the error channel.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The sensor configuration was rejected.
    #[error(transparent)]
    Config(#[from] SockauditError),
}
