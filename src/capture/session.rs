//! Capture session: one opened camera, its buffer pool and the frame slot.
//!
//! The session is the camera's [`CaptureSink`]. Completions arrive on the device thread, the
//! consumer claims and releases from its own thread, and the watchdog stops the stream from
//! the timer thread. All three meet at one mutex guarding the lifecycle state, the slot and
//! the pool. Device calls (`submit`, `stop`) are made after that mutex is released: buffers
//! are collected under the lock and handed to the device outside it.

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::backend::{
    truncate_annotation, CameraDevice, CameraProvider, CaptureSink, Completion, HardwareError,
};
use crate::capture::frame::{CameraParams, FrameHandle, StreamFormat};
use crate::capture::pool::{BufferPool, FrameBuffer, PoolCounts};
use crate::error::{AcquireError, ConsumerProtocolError, Result, StreamError, StreamFault};
use crate::pipeline::slot::{Claim, FrameSlot};
use crate::pipeline::stats::{Counters, StreamStats};
use crate::pipeline::watchdog::{Watchdog, WatchdogState};
use crate::stream::{StreamOptions, StreamState, Wait};

struct Core {
    state: StreamState,
    fault: Option<StreamFault>,
    slot: FrameSlot,
    /// Taken at teardown.
    pool: Option<BufferPool>,
}

pub struct CaptureSession {
    device: Arc<dyn CameraDevice>,
    params: CameraParams,
    format: StreamFormat,
    core: Mutex<Core>,
    frame_ready: Condvar,
    counters: Counters,
    watchdog: Watchdog,
}

impl CaptureSession {
    /// Open and configure the camera, allocate the pool and register for completions.
    #[instrument(skip(provider, options), fields(camera = params.camera_index))]
    pub fn open(
        provider: &dyn CameraProvider,
        params: CameraParams,
        options: &StreamOptions,
    ) -> Result<Arc<Self>> {
        params.validate()?;
        let requested = params.requested_format()?;

        let device = provider.open_camera(params.camera_index)?;
        info!("Opened camera {}: {}", params.camera_index, device.name());

        let format = device.configure(&requested)?;
        if format != requested {
            warn!("Camera adjusted format: requested {}, got {}", requested, format);
        }

        let pool = BufferPool::allocate(device.as_ref(), params.buffer_count, format.frame_size)?;

        let session = Arc::new(Self {
            device: Arc::clone(&device),
            params,
            format,
            core: Mutex::new(Core {
                state: StreamState::Created,
                fault: None,
                slot: FrameSlot::new(format),
                pool: Some(pool),
            }),
            frame_ready: Condvar::new(),
            counters: Counters::default(),
            watchdog: Watchdog::new(
                options.watchdog_timeout,
                options.poll_interval,
                Arc::clone(&options.clock),
            ),
        });

        let sink: Weak<CaptureSession> = Arc::downgrade(&session);
        device.register_sink(sink);

        let weak = Arc::downgrade(&session);
        let timeout = options.watchdog_timeout;
        let spawned = session.watchdog.spawn(move || {
            if let Some(session) = weak.upgrade() {
                session.fail(StreamFault::WatchdogTimeout(timeout));
            }
        });
        if let Err(err) = spawned {
            let _ = session.teardown();
            return Err(StreamError::Spawn(err));
        }

        info!("Capture session ready: {} x{}", format, params.buffer_count);
        Ok(session)
    }

    pub fn params(&self) -> &CameraParams {
        &self.params
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn state(&self) -> StreamState {
        self.core.lock().state
    }

    pub fn fault(&self) -> Option<StreamFault> {
        self.core.lock().fault.clone()
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog.state()
    }

    /// Run the watchdog deadline check on the calling thread.
    pub fn check_watchdog(&self) -> bool {
        self.watchdog.check()
    }

    pub fn stats(&self) -> StreamStats {
        let recycled = self
            .core
            .lock()
            .pool
            .as_ref()
            .map_or(0, BufferPool::recycled);
        self.counters.snapshot(recycled)
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.core
            .lock()
            .pool
            .as_ref()
            .map(BufferPool::counts)
            .unwrap_or_default()
    }

    /// Start the camera and queue every pool buffer.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        {
            let mut core = self.core.lock();
            match core.state {
                StreamState::Created => core.state = StreamState::Started,
                StreamState::Started => return Ok(()),
                other => return Err(StreamError::InvalidState(other)),
            }
        }

        self.watchdog.arm();
        if let Err(err) = self.device.start() {
            self.watchdog.disarm();
            let mut core = self.core.lock();
            if core.state == StreamState::Started {
                core.state = StreamState::Created;
            }
            error!("Failed to start camera: {}", err);
            return Err(err.into());
        }

        // a stop that landed while the device was starting found nothing to stop
        let state = self.state();
        if state != StreamState::Started {
            warn!("Stream left Started while the camera was starting, stopping camera");
            self.watchdog.disarm();
            let cancelled = self.device.stop();
            self.recycle_all(cancelled);
            return Err(StreamError::InvalidState(state));
        }

        let queued = self.submit_free();
        info!("Stream started, {} requests queued", queued);
        Ok(())
    }

    /// Explicit stop. No effect unless started.
    pub fn stop(&self) {
        self.shutdown(None);
    }

    /// Stop with the error flag set.
    pub(crate) fn fail(&self, fault: StreamFault) {
        self.shutdown(Some(fault));
    }

    fn shutdown(&self, fault: Option<StreamFault>) {
        self.watchdog.disarm();
        {
            let mut core = self.core.lock();
            if core.state != StreamState::Started {
                debug!("Stop ignored in state {:?}", core.state);
                return;
            }
            core.state = StreamState::Stopped;
            core.fault = fault.clone();

            let Core { slot, pool, .. } = &mut *core;
            if let Some(displaced) = slot.clear_current() {
                if let Some(pool) = pool.as_mut() {
                    pool.recycle(displaced.buffer);
                }
            }
        }
        self.frame_ready.notify_all();

        let cancelled = self.device.stop();
        let count = cancelled.len();
        self.recycle_all(cancelled);

        match fault {
            Some(fault) => error!("Stream stopped: {}", fault),
            None => info!("Stream stopped, {} requests cancelled", count),
        }
    }

    /// Claim the most recent frame.
    pub fn acquire(&self, wait: Wait) -> std::result::Result<FrameHandle, AcquireError> {
        // a timeout too large to represent waits forever
        let deadline = match wait {
            Wait::Timeout(timeout) => Instant::now().checked_add(timeout),
            _ => None,
        };

        let mut core = self.core.lock();
        loop {
            if core.state != StreamState::Started {
                return Err(AcquireError::Unavailable);
            }

            let Core { slot, pool, .. } = &mut *core;
            match slot.claim() {
                Claim::Frame(frame) => {
                    if let Some(pool) = pool.as_mut() {
                        pool.mark_in_use(frame.id());
                    }
                    self.counters.delivered();
                    trace!("Claimed frame {} (seq {})", frame.id(), frame.sequence());
                    return Ok(frame);
                }
                Claim::Busy => return Err(ConsumerProtocolError::AlreadyClaimed.into()),
                Claim::Empty => {}
            }

            match (wait, deadline) {
                (Wait::Poll, _) => return Err(AcquireError::Empty),
                (_, Some(deadline)) => {
                    if self.frame_ready.wait_until(&mut core, deadline).timed_out()
                        && core.state == StreamState::Started
                        && !core.slot.has_frame()
                    {
                        return Err(AcquireError::TimedOut);
                    }
                }
                (_, None) => self.frame_ready.wait(&mut core),
            }
        }
    }

    /// Hand the claimed frame back for recycling.
    pub fn release(&self) -> std::result::Result<(), ConsumerProtocolError> {
        {
            let mut core = self.core.lock();
            let (id, data) = core.slot.release()?;
            if let Some(pool) = core.pool.as_mut() {
                pool.check_in(id, data);
            }
            trace!("Released frame {}", id);
        }
        self.submit_free();
        Ok(())
    }

    pub fn has_frame(&self) -> bool {
        self.core.lock().slot.has_frame()
    }

    /// Draw `text` on the camera overlay, truncated to what the hardware accepts.
    pub fn annotate(&self, text: &str) -> Result<()> {
        let max = self.device.max_annotation_len();
        let clipped = truncate_annotation(text, max);
        if clipped.len() < text.len() {
            debug!("Annotation truncated from {} to {} bytes", text.len(), clipped.len());
        }
        self.device.annotate(clipped).map_err(Into::into)
    }

    /// Stop, then release every buffer back to the device. Runs once.
    ///
    /// A frame claimed and never released counts as leaked, whether or not its handle is still
    /// alive.
    pub fn teardown(&self) -> Result<()> {
        self.stop();
        self.watchdog.shutdown();

        let pool = {
            let mut core = self.core.lock();
            if core.state == StreamState::Destroyed {
                return Ok(());
            }
            core.state = StreamState::Destroyed;

            let Core { slot, pool, .. } = &mut *core;
            let (current, processing) = slot.clear();
            let mut pool = pool.take();
            if let Some(pool) = pool.as_mut() {
                if let Some(current) = current {
                    pool.recycle(current.buffer);
                }
            }
            if let Some((id, _)) = processing {
                warn!("Frame {} claimed but never released", id);
            }
            pool
        };
        self.frame_ready.notify_all();

        // the device may still be running if a start raced a stop
        let cancelled = self.device.stop();
        let result = match pool {
            Some(mut pool) => {
                for buffer in cancelled {
                    pool.recycle(buffer);
                }
                pool.release(self.device.as_ref())
            }
            None => Ok(()),
        };
        info!("Capture session destroyed");
        result
    }

    /// Queue every free buffer with the device while the stream runs. Returns how many were
    /// accepted.
    fn submit_free(&self) -> usize {
        let buffers = {
            let mut core = self.core.lock();
            if core.state != StreamState::Started {
                return 0;
            }
            match core.pool.as_mut() {
                Some(pool) => {
                    pool.reclaim_lent();
                    pool.take_free()
                }
                None => return 0,
            }
        };

        let mut accepted = 0;
        for buffer in buffers {
            match self.device.submit(buffer) {
                Ok(()) => accepted += 1,
                Err((buffer, err)) => {
                    warn!("Camera refused buffer {}: {}", buffer.id(), err);
                    if let Some(pool) = self.core.lock().pool.as_mut() {
                        pool.restore(buffer);
                    }
                }
            }
        }
        accepted
    }

    fn recycle_all(&self, buffers: Vec<FrameBuffer>) {
        if buffers.is_empty() {
            return;
        }
        let mut core = self.core.lock();
        if let Some(pool) = core.pool.as_mut() {
            for buffer in buffers {
                pool.recycle(buffer);
            }
        }
    }

    fn reject(&self, buffer: FrameBuffer) {
        self.counters.rejected();
        self.recycle_all(vec![buffer]);
        self.submit_free();
    }
}

impl CaptureSink for CaptureSession {
    fn on_complete(&self, completion: Completion) {
        let id = completion.buffer.id();
        if !completion.buffer.is_mapped() {
            error!("Buffer {} completed without memory, recycling", id);
            self.reject(completion.buffer);
            return;
        }
        if completion.buffer.is_empty() {
            trace!("Buffer {} completed empty (end of stream)", id);
            self.reject(completion.buffer);
            return;
        }

        {
            let mut core = self.core.lock();
            let Core {
                state, slot, pool, ..
            } = &mut *core;
            let Some(pool) = pool.as_mut() else {
                return;
            };
            if *state != StreamState::Started {
                trace!("Buffer {} completed after stop", id);
                pool.recycle(completion.buffer);
                return;
            }

            pool.mark_filled(id);
            trace!("Frame {} seq {} ({} bytes)", id, completion.sequence, completion.buffer.len());
            if let Some(displaced) = slot.install(completion) {
                trace!("Dropped unclaimed frame {}", displaced.buffer.id());
                pool.recycle(displaced.buffer);
                self.counters.dropped();
            }
            pool.reclaim_lent();
            self.counters.completed();
        }

        self.watchdog.rearm();
        self.frame_ready.notify_all();
        self.submit_free();
    }

    fn on_error(&self, error: HardwareError) {
        error!("Camera error: {}", error);
        self.fail(StreamFault::Hardware(error));
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::capture::frame::{PixelFormat, Resolution};
    use crate::capture::mock::{MockCamera, MockProvider};
    use crate::capture::pool::BufferState;

    fn params() -> CameraParams {
        CameraParams {
            camera_index: 0,
            resolution: Resolution::new(32, 16),
            pixel_format: PixelFormat::Yuv420,
            buffer_count: 3,
        }
    }

    fn open(camera: &Arc<MockCamera>) -> Arc<CaptureSession> {
        let provider = MockProvider::new().with_camera(Arc::clone(camera));
        CaptureSession::open(&provider, params(), &StreamOptions::default()).unwrap()
    }

    #[test]
    #[traced_test]
    fn format_adjustment_is_logged() {
        let camera = MockCamera::new();
        camera.set_supported_formats(vec![PixelFormat::Nv12]);
        let session = open(&camera);

        assert_eq!(session.format().pixel_format, PixelFormat::Nv12);
        assert!(logs_contain("Camera adjusted format"));
        session.teardown().unwrap();
    }

    #[test]
    fn completion_after_stop_is_not_resubmitted() {
        let camera = MockCamera::new();
        let session = open(&camera);
        session.start().unwrap();

        // the device has not seen the stop yet
        session.core.lock().state = StreamState::Stopped;
        let id = camera.complete_next(b"late").unwrap();

        let core = session.core.lock();
        assert!(!core.slot.has_frame());
        assert_eq!(core.pool.as_ref().unwrap().state(id), Some(BufferState::Free));
        drop(core);
        assert_eq!(camera.queued_len(), 2);
        assert_eq!(session.stats().frames_completed, 0);
    }

    #[test]
    fn sink_does_not_keep_session_alive() {
        let camera = MockCamera::new();
        let session = open(&camera);
        let weak = Arc::downgrade(&session);
        session.teardown().unwrap();
        drop(session);

        assert!(weak.upgrade().is_none());
        // completions after the session is gone are simply not delivered
        camera.raise_error(-1, "gone");
    }

    #[test]
    fn start_failure_after_teardown_is_invalid_state() {
        let camera = MockCamera::new();
        let session = open(&camera);
        session.teardown().unwrap();
        assert!(matches!(
            session.start(),
            Err(StreamError::InvalidState(StreamState::Destroyed))
        ));
        assert_eq!(session.pool_counts().total(), 0);
    }
}
