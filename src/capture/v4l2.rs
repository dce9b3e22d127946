//! V4L2 camera backend
//!
//! The driver fills its own mmap'd buffers; a capture thread dequeues each one and copies it
//! into the oldest pool buffer submitted by the session, then reports the completion. A driver
//! frame that arrives while no pool buffer is queued is dropped at the source.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam::channel;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::backend::{
    BackendError, CameraDevice, CameraProvider, CaptureSink, Completion, HardwareError,
};
use crate::capture::frame::{PixelFormat, Resolution, StreamFormat};
use crate::capture::pool::FrameBuffer;

/// Driver-side buffers, independent of the pool size.
const DRIVER_BUFFERS: u32 = 4;
/// How long one dequeue may block before the thread re-checks for stop.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);
/// Highest `/dev/videoN` index probed.
const PROBE_LIMIT: u32 = 10;

/// A capture-capable device found by [`probe_devices`].
#[derive(Debug, Clone)]
pub struct ProbedDevice {
    pub index: u32,
    pub path: String,
    pub card: String,
    pub formats: Vec<PixelFormat>,
}

/// List capture-capable `/dev/video*` nodes and the formats they offer.
pub fn probe_devices() -> Vec<ProbedDevice> {
    info!("Probing V4L2 capture devices...");

    let mut found = Vec::new();
    for index in 0..PROBE_LIMIT {
        let path = format!("/dev/video{}", index);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(device) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = device.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }

        let formats: Vec<PixelFormat> = device
            .enum_formats()
            .map(|descs| {
                descs
                    .iter()
                    .filter_map(|desc| PixelFormat::from_fourcc(desc.fourcc.repr))
                    .collect()
            })
            .unwrap_or_default();
        info!("Found {} - {} {:?}", path, caps.card, formats);
        found.push(ProbedDevice {
            index,
            path,
            card: caps.card,
            formats,
        });
    }
    found
}

/// Opens `/dev/video{index}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Provider;

impl CameraProvider for V4l2Provider {
    #[instrument(skip(self))]
    fn open_camera(&self, index: u32) -> Result<Arc<dyn CameraDevice>, BackendError> {
        let path = format!("/dev/video{}", index);
        if !Path::new(&path).exists() {
            return Err(BackendError::NotFound(index));
        }

        let device = Device::with_path(&path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(BackendError::Unsupported(format!(
                "{} does not support video capture",
                path
            )));
        }

        Ok(Arc::new(V4l2Camera {
            path,
            card: caps.card,
            device: Arc::new(device),
            shared: Arc::new(Shared::default()),
            allocated: AtomicUsize::new(0),
            worker: Mutex::new(None),
            annotation: Mutex::new(String::new()),
        }))
    }
}

#[derive(Default)]
struct Shared {
    queued: Mutex<VecDeque<FrameBuffer>>,
    running: AtomicBool,
    sink: Mutex<Option<Weak<dyn CaptureSink>>>,
}

impl Shared {
    fn sink(&self) -> Option<Arc<dyn CaptureSink>> {
        self.sink.lock().as_ref().and_then(Weak::upgrade)
    }
}

pub struct V4l2Camera {
    path: String,
    card: String,
    device: Arc<Device>,
    shared: Arc<Shared>,
    allocated: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
    annotation: Mutex<String>,
}

impl V4l2Camera {
    /// Last text passed to [`CameraDevice::annotate`]. V4L2 has no overlay, so it is only kept.
    pub fn annotation(&self) -> String {
        self.annotation.lock().clone()
    }
}

impl CameraDevice for V4l2Camera {
    fn name(&self) -> String {
        format!("{} ({})", self.card, self.path)
    }

    fn configure(&self, requested: &StreamFormat) -> Result<StreamFormat, BackendError> {
        let mut fmt = self.device.format()?;
        fmt.width = requested.resolution.width;
        fmt.height = requested.resolution.height;
        fmt.fourcc = FourCC::new(&requested.pixel_format.fourcc());

        let actual = self.device.set_format(&fmt)?;
        let pixel_format = PixelFormat::from_fourcc(actual.fourcc.repr).ok_or_else(|| {
            BackendError::Unsupported(format!("driver chose unsupported format {}", actual.fourcc))
        })?;

        let mut format = StreamFormat::with_stride(
            Resolution::new(actual.width, actual.height),
            pixel_format,
            actual.stride,
        )
        .map_err(|err| BackendError::Unsupported(err.to_string()))?;
        format.frame_size = format.frame_size.max(actual.size as usize);

        debug!("Driver format: {}", format);
        Ok(format)
    }

    fn allocate_buffers(&self, count: u32, size: usize) -> Result<Vec<BytesMut>, BackendError> {
        let buffers: Vec<BytesMut> = (0..count).map(|_| BytesMut::with_capacity(size)).collect();
        self.allocated.store(buffers.len(), Ordering::Release);
        Ok(buffers)
    }

    fn free_buffers(&self) {
        let freed = self.allocated.swap(0, Ordering::AcqRel);
        debug!("Freed {} capture buffers", freed);
    }

    fn register_sink(&self, sink: Weak<dyn CaptureSink>) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn start(&self) -> Result<(), BackendError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = channel::bounded::<io::Result<()>>(1);
        let device = Arc::clone(&self.device);
        let shared = Arc::clone(&self.shared);
        shared.running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("camstream-v4l2".into())
            .spawn(move || {
                let mut stream = match MmapStream::with_buffers(
                    &device,
                    Type::VideoCapture,
                    DRIVER_BUFFERS,
                ) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                stream.set_timeout(DEQUEUE_TIMEOUT);
                let _ = ready_tx.send(Ok(()));
                capture_loop(&mut stream, &shared);
            })
            .map_err(|err| {
                self.shared.running.store(false, Ordering::Release);
                BackendError::Io(err)
            })?;

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(io::Error::other("capture thread exited during startup")));
        if let Err(err) = started {
            self.shared.running.store(false, Ordering::Release);
            let _ = handle.join();
            return Err(BackendError::Io(err));
        }

        info!("Capture stream started with {} driver buffers", DRIVER_BUFFERS);
        *worker = Some(handle);
        Ok(())
    }

    fn submit(&self, buffer: FrameBuffer) -> Result<(), (FrameBuffer, BackendError)> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err((
                buffer,
                BackendError::Hardware(HardwareError::new(-1, "capture not running")),
            ));
        }
        self.shared.queued.lock().push_back(buffer);
        Ok(())
    }

    fn stop(&self) -> Vec<FrameBuffer> {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            // a fault reported from the capture thread stops the stream on that thread
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("V4L2 capture thread panicked");
            }
        }
        let cancelled: Vec<FrameBuffer> = self.shared.queued.lock().drain(..).collect();
        debug!("Capture stopped, {} buffers returned", cancelled.len());
        cancelled
    }

    fn annotate(&self, text: &str) -> Result<(), BackendError> {
        trace!("No overlay on {}, keeping annotation", self.path);
        *self.annotation.lock() = text.to_owned();
        Ok(())
    }
}

fn capture_loop(stream: &mut MmapStream<'_>, shared: &Shared) {
    while shared.running.load(Ordering::Acquire) {
        let (data, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                continue
            }
            Err(err) => {
                if shared.running.load(Ordering::Acquire) {
                    error!("Failed to dequeue frame: {}", err);
                    if let Some(sink) = shared.sink() {
                        sink.on_error(HardwareError::from(err));
                    }
                }
                break;
            }
        };

        let Some(mut buffer) = shared.queued.lock().pop_front() else {
            trace!("No queued buffer, driver frame {} dropped", meta.sequence);
            continue;
        };

        let used = match meta.bytesused as usize {
            0 => data.len(),
            n => n.min(data.len()),
        };
        if buffer.write(&data[..used]) < used {
            warn!("Frame of {} bytes truncated to buffer {}", used, buffer.id());
        }

        let timestamp = Duration::from_secs(meta.timestamp.sec.max(0) as u64)
            + Duration::from_micros(meta.timestamp.usec.max(0) as u64);
        let completion = Completion {
            buffer,
            sequence: u64::from(meta.sequence),
            timestamp,
        };

        match shared.sink() {
            Some(sink) => sink.on_complete(completion),
            None => shared.queued.lock().push_front(completion.buffer),
        }
    }
    debug!("V4L2 capture thread exiting");
}
