pub mod backend;
pub mod frame;
pub mod mock;
pub mod pool;
pub mod session;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use backend::{CameraDevice, CameraProvider, CaptureSink, Completion, HardwareError};
pub use frame::{CameraParams, FrameHandle, PixelFormat, Resolution, StreamFormat};
pub use pool::{BufferId, BufferState, PoolCounts};
pub use session::CaptureSession;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Provider;
