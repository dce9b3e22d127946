//! In-process camera for tests and hardware-free runs.
//!
//! Completions are delivered on the calling thread (`complete_next` and friends), which stands
//! in for the hardware callback thread. With a frame rate set, a generator thread produces a
//! moving test pattern instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capture::backend::{
    BackendError, CameraDevice, CameraProvider, CaptureSink, Completion, HardwareError,
};
use crate::capture::frame::{PixelFormat, Resolution, StreamFormat};
use crate::capture::pool::{BufferId, FrameBuffer};

/// Hands out a fixed list of mock cameras by index.
#[derive(Default)]
pub struct MockProvider {
    cameras: Vec<Arc<MockCamera>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with one default camera at index 0.
    pub fn single() -> (Self, Arc<MockCamera>) {
        let camera = MockCamera::new();
        (Self::new().with_camera(Arc::clone(&camera)), camera)
    }

    pub fn with_camera(mut self, camera: Arc<MockCamera>) -> Self {
        self.cameras.push(camera);
        self
    }
}

impl CameraProvider for MockProvider {
    fn open_camera(&self, index: u32) -> Result<Arc<dyn CameraDevice>, BackendError> {
        let camera = self
            .cameras
            .get(index as usize)
            .ok_or(BackendError::NotFound(index))?;
        Ok(Arc::clone(camera) as Arc<dyn CameraDevice>)
    }
}

struct MockState {
    supported: Vec<PixelFormat>,
    max_resolution: Resolution,
    frame_rate: Option<u32>,
    format: Option<StreamFormat>,
    fail_allocation: bool,
    allocation_limit: Option<u32>,
    allocated: usize,
    started: bool,
    queued: VecDeque<FrameBuffer>,
    submitted: u64,
    sequence: u64,
    annotations: Vec<String>,
}

pub struct MockCamera {
    name: String,
    self_ref: Weak<MockCamera>,
    state: Mutex<MockState>,
    sink: Mutex<Option<Weak<dyn CaptureSink>>>,
    generator_running: Arc<AtomicBool>,
    generator: Mutex<Option<JoinHandle<()>>>,
    epoch: Instant,
}

impl MockCamera {
    /// Camera supporting every pixel format up to 4096x4096.
    pub fn new() -> Arc<Self> {
        Self::named("mock0")
    }

    pub fn named(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.to_owned(),
            self_ref: self_ref.clone(),
            state: Mutex::new(MockState {
                supported: vec![
                    PixelFormat::Yuv420,
                    PixelFormat::Nv12,
                    PixelFormat::Yuyv,
                    PixelFormat::Rgb24,
                    PixelFormat::Mjpeg,
                ],
                max_resolution: Resolution::new(4096, 4096),
                frame_rate: None,
                format: None,
                fail_allocation: false,
                allocation_limit: None,
                allocated: 0,
                started: false,
                queued: VecDeque::new(),
                submitted: 0,
                sequence: 0,
                annotations: Vec::new(),
            }),
            sink: Mutex::new(None),
            generator_running: Arc::new(AtomicBool::new(false)),
            generator: Mutex::new(None),
            epoch: Instant::now(),
        })
    }

    /// Formats the camera accepts; anything else is downgraded to the first entry.
    pub fn set_supported_formats(&self, formats: Vec<PixelFormat>) {
        self.state.lock().supported = formats;
    }

    /// Requests above this are clamped.
    pub fn set_max_resolution(&self, resolution: Resolution) {
        self.state.lock().max_resolution = resolution;
    }

    /// Produce frames on a generator thread once started.
    pub fn set_frame_rate(&self, fps: Option<u32>) {
        self.state.lock().frame_rate = fps.filter(|fps| *fps > 0);
    }

    pub fn fail_allocation(&self, fail: bool) {
        self.state.lock().fail_allocation = fail;
    }

    /// Hand out at most `limit` buffers regardless of the request.
    pub fn limit_allocation(&self, limit: u32) {
        self.state.lock().allocation_limit = Some(limit);
    }

    pub fn allocated_buffers(&self) -> usize {
        self.state.lock().allocated
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Buffers currently waiting for a frame.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Total capture requests received.
    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    pub fn annotations(&self) -> Vec<String> {
        self.state.lock().annotations.clone()
    }

    /// Fill the oldest queued buffer with `payload` and complete it.
    pub fn complete_next(&self, payload: &[u8]) -> Option<BufferId> {
        self.complete_with(|buffer| {
            buffer.write(payload);
        })
    }

    /// Complete the oldest queued buffer with zero bytes (end of stream).
    pub fn complete_empty(&self) -> Option<BufferId> {
        self.complete_with(|buffer| {
            buffer.write(&[]);
        })
    }

    /// Complete the oldest queued buffer with no memory behind it.
    pub fn complete_null(&self) -> Option<BufferId> {
        self.complete_with(FrameBuffer::unmap)
    }

    /// Report a hardware fault to the registered sink.
    pub fn raise_error(&self, code: i32, message: &str) {
        if let Some(sink) = self.sink() {
            sink.on_error(HardwareError::new(code, message));
        }
    }

    fn complete_with(&self, fill: impl FnOnce(&mut FrameBuffer)) -> Option<BufferId> {
        let (mut buffer, sequence) = {
            let mut state = self.state.lock();
            if !state.started {
                return None;
            }
            let buffer = state.queued.pop_front()?;
            state.sequence += 1;
            (buffer, state.sequence)
        };
        fill(&mut buffer);
        let id = buffer.id();

        match self.sink() {
            Some(sink) => sink.on_complete(Completion {
                buffer,
                sequence,
                timestamp: self.epoch.elapsed(),
            }),
            None => {
                warn!("{}: completion without a registered sink", self.name);
                self.state.lock().queued.push_back(buffer);
            }
        }
        Some(id)
    }

    fn sink(&self) -> Option<Arc<dyn CaptureSink>> {
        self.sink.lock().as_ref().and_then(Weak::upgrade)
    }

    fn spawn_generator(&self, fps: u32) {
        let Some(camera) = self.self_ref.upgrade() else {
            return;
        };
        let camera = Arc::downgrade(&camera);
        let running = Arc::clone(&self.generator_running);
        running.store(true, Ordering::Release);
        let interval = Duration::from_secs(1) / fps;

        let spawned = thread::Builder::new()
            .name("camstream-mock".into())
            .spawn(move || {
                let mut next = Instant::now();
                let mut phase = 0u8;
                while running.load(Ordering::Acquire) {
                    let Some(camera) = camera.upgrade() else {
                        break;
                    };
                    camera.generate_frame(phase);
                    drop(camera);
                    phase = phase.wrapping_add(1);

                    next += interval;
                    thread::sleep(next.saturating_duration_since(Instant::now()));
                }
            });

        match spawned {
            Ok(handle) => *self.generator.lock() = Some(handle),
            Err(err) => warn!("{}: failed to spawn frame generator: {}", self.name, err),
        }
    }

    fn generate_frame(&self, phase: u8) {
        let Some(format) = self.state.lock().format else {
            return;
        };
        let completed = self.complete_with(|buffer| {
            buffer.fill_with(format.frame_size, |bytes| test_pattern(bytes, &format, phase));
        });
        if completed.is_none() {
            debug!("{}: no queued buffer, frame dropped", self.name);
        }
    }

    fn stop_generator(&self) {
        self.generator_running.store(false, Ordering::Release);
        if let Some(handle) = self.generator.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Diagonal luma ramp with neutral chroma, shifted by `phase`.
fn test_pattern(bytes: &mut [u8], format: &StreamFormat, phase: u8) {
    let width = format.resolution.width as usize;
    let height = format.resolution.height as usize;
    match format.pixel_format {
        PixelFormat::Yuv420 | PixelFormat::Nv12 => {
            let stride = format.stride as usize;
            let (luma, chroma) = bytes.split_at_mut((stride * height).min(bytes.len()));
            for (y, row) in luma.chunks_mut(stride.max(1)).enumerate() {
                for (x, px) in row.iter_mut().take(width).enumerate() {
                    *px = (x + y) as u8 ^ phase;
                }
            }
            chroma.fill(128);
        }
        _ => {
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (i as u8).wrapping_add(phase);
            }
        }
    }
}

impl CameraDevice for MockCamera {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn configure(&self, requested: &StreamFormat) -> Result<StreamFormat, BackendError> {
        let mut state = self.state.lock();

        let pixel_format = if state.supported.contains(&requested.pixel_format) {
            requested.pixel_format
        } else {
            *state.supported.first().ok_or_else(|| {
                BackendError::Unsupported(format!(
                    "{} supports no pixel formats",
                    self.name
                ))
            })?
        };
        let resolution = Resolution::new(
            requested.resolution.width.min(state.max_resolution.width),
            requested.resolution.height.min(state.max_resolution.height),
        );

        let format = if pixel_format == requested.pixel_format && resolution == requested.resolution
        {
            *requested
        } else {
            StreamFormat::new(resolution, pixel_format)
                .map_err(|err| BackendError::Unsupported(err.to_string()))?
        };
        state.format = Some(format);
        Ok(format)
    }

    fn allocate_buffers(&self, count: u32, size: usize) -> Result<Vec<BytesMut>, BackendError> {
        let mut state = self.state.lock();
        if state.fail_allocation {
            return Err(BackendError::Allocation(format!(
                "{}: cannot reserve {count} x {size} bytes",
                self.name
            )));
        }
        let count = state.allocation_limit.map_or(count, |limit| limit.min(count));
        let buffers: Vec<BytesMut> = (0..count).map(|_| BytesMut::with_capacity(size)).collect();
        state.allocated = buffers.len();
        Ok(buffers)
    }

    fn free_buffers(&self) {
        self.state.lock().allocated = 0;
    }

    fn register_sink(&self, sink: Weak<dyn CaptureSink>) {
        *self.sink.lock() = Some(sink);
    }

    fn start(&self) -> Result<(), BackendError> {
        let fps = {
            let mut state = self.state.lock();
            state.started = true;
            state.frame_rate
        };
        info!("{}: started", self.name);
        if let Some(fps) = fps {
            self.spawn_generator(fps);
        }
        Ok(())
    }

    fn submit(&self, buffer: FrameBuffer) -> Result<(), (FrameBuffer, BackendError)> {
        let mut state = self.state.lock();
        if !state.started {
            return Err((
                buffer,
                BackendError::Hardware(HardwareError::new(-1, "camera not started")),
            ));
        }
        state.submitted += 1;
        state.queued.push_back(buffer);
        Ok(())
    }

    fn stop(&self) -> Vec<FrameBuffer> {
        self.stop_generator();
        let mut state = self.state.lock();
        state.started = false;
        state.queued.drain(..).collect()
    }

    fn annotate(&self, text: &str) -> Result<(), BackendError> {
        self.state.lock().annotations.push(text.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_index_is_not_found() {
        let (provider, _camera) = MockProvider::single();
        assert!(provider.open_camera(0).is_ok());
        assert!(matches!(
            provider.open_camera(1).err(),
            Some(BackendError::NotFound(1))
        ));
    }

    #[test]
    fn unsupported_format_is_downgraded() {
        let camera = MockCamera::new();
        camera.set_supported_formats(vec![PixelFormat::Yuyv]);
        let requested = StreamFormat::new(Resolution::new(640, 480), PixelFormat::Yuv420).unwrap();
        let actual = camera.configure(&requested).unwrap();
        assert_eq!(actual.pixel_format, PixelFormat::Yuyv);
        assert_eq!(actual.resolution, requested.resolution);
    }

    #[test]
    fn no_supported_formats_is_an_error() {
        let camera = MockCamera::new();
        camera.set_supported_formats(Vec::new());
        let requested = StreamFormat::new(Resolution::new(640, 480), PixelFormat::Yuv420).unwrap();
        assert!(matches!(
            camera.configure(&requested),
            Err(BackendError::Unsupported(_))
        ));
    }

    #[test]
    fn submit_requires_start() {
        let camera = MockCamera::new();
        let buffer = FrameBuffer::new(BufferId(0), BytesMut::with_capacity(8));
        let (buffer, _) = camera.submit(buffer).unwrap_err();

        camera.start().unwrap();
        assert!(camera.submit(buffer).is_ok());
        assert_eq!(camera.queued_len(), 1);
        assert_eq!(camera.stop().len(), 1);
        assert_eq!(camera.queued_len(), 0);
    }

    #[test]
    fn test_pattern_fills_chroma_neutral() {
        let format = StreamFormat::new(Resolution::new(4, 2), PixelFormat::Yuv420).unwrap();
        let mut bytes = vec![0u8; format.frame_size];
        test_pattern(&mut bytes, &format, 0);
        assert_eq!(&bytes[..4], &[0, 1, 2, 3]);
        assert!(bytes[8..].iter().all(|b| *b == 128));
    }
}
