//! Public stream controller: lifecycle and frame acquisition.
//!
//! ```no_run
//! use camstream::capture::mock::MockProvider;
//! use camstream::{CameraParams, Stream, Wait};
//! use std::time::Duration;
//!
//! let (provider, _camera) = MockProvider::single();
//! let stream = Stream::create(CameraParams::default(), &provider)?;
//! stream.start()?;
//! if let Ok(frame) = stream.acquire_frame(Wait::Timeout(Duration::from_millis(100))) {
//!     println!("{} bytes", frame.len());
//!     stream.recycle_frame(frame)?;
//! }
//! stream.destroy()?;
//! # Ok::<(), camstream::StreamError>(())
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::capture::backend::CameraProvider;
use crate::capture::frame::{CameraParams, FrameHandle, StreamFormat};
use crate::capture::pool::PoolCounts;
use crate::capture::session::CaptureSession;
use crate::error::{AcquireError, ConsumerProtocolError, Result, StreamFault};
use crate::pipeline::stats::StreamStats;
use crate::pipeline::watchdog::{
    Clock, SystemClock, WatchdogState, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

/// How [`Stream::acquire_frame`] behaves when no frame is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return [`AcquireError::Empty`] immediately.
    Poll,
    /// Block until a frame completes or the stream stops.
    Forever,
    /// Block for at most the given duration.
    Timeout(Duration),
}

/// Runtime knobs that are not camera parameters.
#[derive(Clone)]
pub struct StreamOptions {
    pub watchdog_timeout: Duration,
    pub poll_interval: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            watchdog_timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("watchdog_timeout", &self.watchdog_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// A running (or runnable) capture stream from one camera.
///
/// Exactly one consumer thread is expected to call [`acquire_frame`](Self::acquire_frame) and
/// [`release_frame`](Self::release_frame). `stop` may be called from any thread and wakes a
/// blocked consumer. Dropping the stream tears it down; use [`destroy`](Self::destroy) to see
/// teardown errors.
pub struct Stream {
    session: Arc<CaptureSession>,
}

impl Stream {
    /// Open camera `params.camera_index` with default options.
    pub fn create(params: CameraParams, provider: &dyn CameraProvider) -> Result<Self> {
        Self::create_with(params, provider, StreamOptions::default())
    }

    pub fn create_with(
        params: CameraParams,
        provider: &dyn CameraProvider,
        options: StreamOptions,
    ) -> Result<Self> {
        let session = CaptureSession::open(provider, params, &options)?;
        Ok(Self { session })
    }

    /// Begin capturing. Idempotent while started; a stopped stream cannot be restarted.
    pub fn start(&self) -> Result<()> {
        self.session.start()
    }

    /// Stop capturing and wake a blocked consumer. Idempotent.
    pub fn stop(&self) {
        self.session.stop();
    }

    /// Stop and release every hardware resource.
    ///
    /// Returns [`StreamError::ResourceLeak`](crate::StreamError::ResourceLeak) if a claimed
    /// frame was never released or a frame handle is still alive, but the teardown always
    /// completes.
    pub fn destroy(self) -> Result<()> {
        self.session.teardown()
    }

    /// True iff a completed frame is waiting to be claimed.
    pub fn has_frame(&self) -> bool {
        self.session.has_frame()
    }

    /// Claim the most recent frame. Must be followed by exactly one
    /// [`release_frame`](Self::release_frame) before the next claim.
    pub fn acquire_frame(&self, wait: Wait) -> std::result::Result<FrameHandle, AcquireError> {
        self.session.acquire(wait)
    }

    pub fn release_frame(&self) -> std::result::Result<(), ConsumerProtocolError> {
        self.session.release()
    }

    /// Drop `frame` and release it, so its buffer goes straight back to the hardware.
    pub fn recycle_frame(&self, frame: FrameHandle) -> std::result::Result<(), ConsumerProtocolError> {
        drop(frame);
        self.release_frame()
    }

    /// Overlay text on the camera output. Long text is silently truncated.
    pub fn annotate_text(&self, text: &str) -> Result<()> {
        self.session.annotate(text)
    }

    pub fn state(&self) -> StreamState {
        self.session.state()
    }

    /// Why the stream stopped on its own, if it did.
    pub fn fault(&self) -> Option<StreamFault> {
        self.session.fault()
    }

    pub fn is_error(&self) -> bool {
        self.fault().is_some()
    }

    /// The format the camera actually produces.
    pub fn format(&self) -> StreamFormat {
        *self.session.format()
    }

    pub fn params(&self) -> CameraParams {
        *self.session.params()
    }

    pub fn stats(&self) -> StreamStats {
        self.session.stats()
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.session.pool_counts()
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.session.watchdog_state()
    }

    /// Evaluate the watchdog now instead of waiting for its thread. Returns true if it fired.
    pub fn check_watchdog(&self) -> bool {
        self.session.check_watchdog()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.session.state() == StreamState::Destroyed {
            return;
        }
        debug!("Stream dropped without destroy, tearing down");
        if let Err(err) = self.session.teardown() {
            error!("Teardown on drop failed: {}", err);
        }
    }
}
