//! Camera collaborator interface.
//!
//! The capture core does not talk to any vendor API directly. A [`CameraProvider`] opens
//! cameras, a [`CameraDevice`] configures one and moves buffers to and from the hardware, and
//! the capture session registers itself as the device's [`CaptureSink`] to receive completed
//! buffers and hardware errors.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;

use crate::capture::frame::StreamFormat;
use crate::capture::pool::FrameBuffer;

/// Longest overlay text the camera firmware accepts, in bytes.
pub const MAX_ANNOTATION_LEN: usize = 256;

/// Fault reported by the camera hardware or its driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct HardwareError {
    pub code: i32,
    pub message: String,
}

impl HardwareError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for HardwareError {
    fn from(err: std::io::Error) -> Self {
        Self {
            code: err.raw_os_error().unwrap_or(-1),
            message: err.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("no camera at index {0}")]
    NotFound(u32),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A buffer the hardware finished writing.
pub struct Completion {
    pub buffer: FrameBuffer,
    /// Hardware frame counter.
    pub sequence: u64,
    /// Capture time as reported by the device.
    pub timestamp: Duration,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("buffer", &self.buffer.id())
            .field("len", &self.buffer.len())
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Receives completions and errors from a camera. Called on the device's own thread.
pub trait CaptureSink: Send + Sync {
    fn on_complete(&self, completion: Completion);

    fn on_error(&self, error: HardwareError);
}

/// Opens cameras by index.
pub trait CameraProvider: Send + Sync {
    fn open_camera(&self, index: u32) -> Result<Arc<dyn CameraDevice>, BackendError>;
}

/// One acquired camera.
///
/// Every method takes `&self`: `submit` runs from the completion callback and `stop` from the
/// watchdog thread, so implementations keep their own interior state.
pub trait CameraDevice: Send + Sync {
    /// Human readable device name for logs.
    fn name(&self) -> String;

    /// Validate and apply a format. The device may return a different, supported format.
    fn configure(&self, requested: &StreamFormat) -> Result<StreamFormat, BackendError>;

    /// Reserve `count` hardware-writable regions of at least `size` bytes each.
    fn allocate_buffers(&self, count: u32, size: usize) -> Result<Vec<BytesMut>, BackendError>;

    /// Give back everything reserved by `allocate_buffers`.
    fn free_buffers(&self);

    /// Register the receiver of completions and errors.
    fn register_sink(&self, sink: Weak<dyn CaptureSink>);

    fn start(&self) -> Result<(), BackendError>;

    /// Queue an empty buffer as a capture request. On failure the buffer is handed back.
    fn submit(&self, buffer: FrameBuffer) -> Result<(), (FrameBuffer, BackendError)>;

    /// Disable completions and cancel outstanding requests, returning their buffers.
    fn stop(&self) -> Vec<FrameBuffer>;

    /// Draw text on the camera's overlay.
    fn annotate(&self, _text: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn max_annotation_len(&self) -> usize {
        MAX_ANNOTATION_LEN
    }
}

/// Truncate `text` to at most `max` bytes without splitting a character.
pub(crate) fn truncate_annotation(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
