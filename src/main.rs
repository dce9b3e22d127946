//! camstream: stream the latest camera frame and report the frame rate

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camstream::capture::mock::{MockCamera, MockProvider};
use camstream::capture::CameraProvider;
use camstream::{AcquireError, Backend, Config, Stream, Wait};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, trace, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camstream=info")),
        )
        .with_timer(uptime())
        .init();

    info!("camstream launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = Config::load(path.as_deref())?;
    let provider = open_provider(&mut config)?;

    let stream = Arc::new(Stream::create_with(
        config.camera_params(),
        provider.as_ref(),
        config.stream_options(),
    )?);
    info!("Streaming {}", stream.format());
    stream.start()?;

    // Stop on Ctrl-C; the consumer sees the stream go unavailable and returns
    let stopper = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping stream");
                stream.stop();
            }
        })
    };

    let consumer = {
        let stream = Arc::clone(&stream);
        let timeout = config.acquire_timeout();
        let annotate_every = Duration::from_millis(config.stream.annotate_interval_ms);
        tokio::task::spawn_blocking(move || consume(&stream, timeout, annotate_every))
    };
    let frames = consumer.await??;

    stopper.abort();
    let _ = stopper.await;

    let fault = stream.fault();
    let stats = stream.stats();
    info!(
        "Consumed {} frames: {} completed, {} dropped, {} rejected",
        frames, stats.frames_completed, stats.frames_dropped, stats.completions_rejected
    );

    let stream = Arc::try_unwrap(stream).map_err(|_| eyre!("stream still shared at shutdown"))?;
    stream.destroy()?;

    match fault {
        Some(fault) => Err(eyre!("stream aborted: {}", fault)),
        None => Ok(()),
    }
}

fn open_provider(config: &mut Config) -> Result<Box<dyn CameraProvider>> {
    match config.stream.backend {
        Backend::Mock => {
            let camera = MockCamera::new();
            camera.set_frame_rate(Some(config.capture.mock_fps));
            info!("Using mock camera at {} fps", config.capture.mock_fps);
            Ok(Box::new(MockProvider::new().with_camera(camera)))
        }
        #[cfg(feature = "v4l2")]
        Backend::V4l2 => {
            if config.capture.auto_detect {
                let found = camstream::capture::v4l2::probe_devices()
                    .into_iter()
                    .find(|device| device.formats.contains(&config.capture.format))
                    .ok_or_else(|| eyre!("No capture device offers {}", config.capture.format))?;
                info!("Using capture device: {} ({})", found.path, found.card);
                config.capture.camera_index = found.index;
            }
            Ok(Box::new(camstream::capture::V4l2Provider))
        }
        #[cfg(not(feature = "v4l2"))]
        Backend::V4l2 => Err(eyre!("built without the v4l2 backend")),
    }
}

/// Claim and release frames until the stream stops. Returns the number of frames seen.
fn consume(stream: &Stream, timeout: Duration, annotate_every: Duration) -> Result<u64> {
    let mut frames = 0u64;
    let mut window = 0u32;
    let mut window_start = Instant::now();

    loop {
        match stream.acquire_frame(Wait::Timeout(timeout)) {
            Ok(frame) => {
                frames += 1;
                window += 1;
                trace!("Frame {} seq {} ({} bytes)", frame.id(), frame.sequence(), frame.len());
                stream.recycle_frame(frame)?;
            }
            Err(AcquireError::TimedOut) => {
                warn!("No frame within {} ms", timeout.as_millis());
            }
            Err(AcquireError::Unavailable) => break,
            Err(err) => return Err(err.into()),
        }

        let elapsed = window_start.elapsed();
        if !annotate_every.is_zero() && elapsed >= annotate_every {
            let fps = f64::from(window) / elapsed.as_secs_f64();
            info!("{:.1} fps", fps);
            stream.annotate_text(&format!("camstream {:.1} fps", fps))?;
            window = 0;
            window_start = Instant::now();
        }
    }

    Ok(frames)
}
