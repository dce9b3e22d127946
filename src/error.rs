//! Error types for the capture pipeline.
//!
//! Setup failures (`NotFound`, `Config`, `Allocation`) are returned synchronously from
//! [`Stream::create`](crate::Stream::create). Runtime faults (hardware errors and watchdog
//! timeouts) never cross the producer/consumer boundary: they stop the stream and are kept as a
//! [`StreamFault`] that the caller inspects. Consumer misuse of the acquire/release protocol is
//! reported as a [`ConsumerProtocolError`] and leaves the stream running.

use std::time::Duration;

use thiserror::Error;

use crate::capture::backend::{BackendError, HardwareError};
use crate::stream::StreamState;

/// Convenience alias for results using the stream error type.
pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("no camera found at index {0}")]
    NotFound(u32),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("no frames received for {} ms", .0.as_millis())]
    WatchdogTimeout(Duration),

    #[error(transparent)]
    ConsumerProtocol(#[from] ConsumerProtocolError),

    #[error("{0} buffer(s) still held by the consumer at teardown")]
    ResourceLeak(usize),

    #[error("operation not allowed in state {0:?}")]
    InvalidState(StreamState),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<BackendError> for StreamError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(index) => Self::NotFound(index),
            BackendError::Unsupported(msg) => Self::Config(msg),
            BackendError::Allocation(msg) => Self::Allocation(msg),
            BackendError::Hardware(hw) => Self::Hardware(hw),
            BackendError::Io(err) => Self::Hardware(HardwareError::from(err)),
        }
    }
}

/// Misuse of the claim/release protocol. Not fatal: the stream keeps running.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerProtocolError {
    /// A frame was requested while the previous one is still claimed.
    #[error("previous frame has not been released")]
    AlreadyClaimed,
    /// Release was called with no frame claimed.
    #[error("no frame is currently claimed")]
    NothingClaimed,
}

/// Why a frame could not be acquired.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The previous frame is still claimed (the "Busy" result).
    #[error(transparent)]
    Protocol(#[from] ConsumerProtocolError),
    /// Poll mode and no frame has completed since the last claim.
    #[error("no frame available yet")]
    Empty,
    /// Bounded wait elapsed without a frame.
    #[error("timed out waiting for a frame")]
    TimedOut,
    /// The stream is not running (not started, stopped, faulted or destroyed).
    #[error("stream is not running")]
    Unavailable,
}

impl AcquireError {
    /// True for the `Busy` outcome of a claim.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Protocol(ConsumerProtocolError::AlreadyClaimed))
    }
}

/// Runtime fault that stopped a stream. Stored as the stream's error flag.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    #[error("hardware error: {0}")]
    Hardware(HardwareError),

    #[error("watchdog timeout after {} ms without frames", .0.as_millis())]
    WatchdogTimeout(Duration),
}

impl From<StreamFault> for StreamError {
    fn from(fault: StreamFault) -> Self {
        match fault {
            StreamFault::Hardware(hw) => Self::Hardware(hw),
            StreamFault::WatchdogTimeout(timeout) => Self::WatchdogTimeout(timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_onto_the_taxonomy() {
        assert!(matches!(
            StreamError::from(BackendError::NotFound(2)),
            StreamError::NotFound(2)
        ));
        assert!(matches!(
            StreamError::from(BackendError::Unsupported("BGR4".into())),
            StreamError::Config(_)
        ));
        assert!(matches!(
            StreamError::from(BackendError::Allocation("oom".into())),
            StreamError::Allocation(_)
        ));
    }

    #[test]
    fn busy_is_a_protocol_error() {
        let err = AcquireError::from(ConsumerProtocolError::AlreadyClaimed);
        assert!(err.is_busy());
        assert!(!AcquireError::Empty.is_busy());
        assert_eq!(err.to_string(), "previous frame has not been released");
    }

    #[test]
    fn watchdog_fault_reports_timeout() {
        let err = StreamError::from(StreamFault::WatchdogTimeout(Duration::from_millis(4000)));
        assert_eq!(err.to_string(), "no frames received for 4000 ms");
    }
}
