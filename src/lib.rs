//! Low-latency camera capture with a single "latest frame" slot and a stall watchdog.

pub mod capture;
pub mod error;
pub mod pipeline;
pub mod stream;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::frame::{CameraParams, FrameHandle, PixelFormat, Resolution, StreamFormat};
pub use error::{AcquireError, ConsumerProtocolError, Result, StreamError, StreamFault};
pub use pipeline::stats::StreamStats;
pub use stream::{Stream, StreamOptions, StreamState, Wait};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "camstream.toml";
/// Prefix of environment overrides, e.g. `CAMSTREAM__CAPTURE__WIDTH=640`.
pub const ENV_PREFIX: &str = "CAMSTREAM";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Pick the first probed device offering `format` instead of `camera_index`.
    pub auto_detect: bool,
    /// Frame rate of the mock backend's generator.
    pub mock_fps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    V4l2,
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub backend: Backend,
    pub watchdog_timeout_ms: u64,
    pub watchdog_poll_ms: u64,
    /// Bounded wait used by the consumer loop.
    pub acquire_timeout_ms: u64,
    /// How often the frame rate is written to the overlay. 0 disables it.
    pub annotate_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let params = CameraParams::default();
        Self {
            camera_index: params.camera_index,
            width: params.resolution.width,
            height: params.resolution.height,
            format: params.pixel_format,
            buffer_count: params.buffer_count,
            auto_detect: false,
            mock_fps: 30,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "v4l2") {
                Backend::V4l2
            } else {
                Backend::Mock
            },
            watchdog_timeout_ms: pipeline::watchdog::DEFAULT_TIMEOUT.as_millis() as u64,
            watchdog_poll_ms: pipeline::watchdog::DEFAULT_POLL_INTERVAL.as_millis() as u64,
            acquire_timeout_ms: 500,
            annotate_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` (or an optional `camstream.toml`), then
    /// `CAMSTREAM__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Config::default()).map_err(config_error)?;

        let file = match path {
            Some(path) => ::config::File::from(path).required(true),
            None => ::config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        ::config::Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(config_error)
    }

    pub fn camera_params(&self) -> CameraParams {
        CameraParams {
            camera_index: self.capture.camera_index,
            resolution: Resolution::new(self.capture.width, self.capture.height),
            pixel_format: self.capture.format,
            buffer_count: self.capture.buffer_count,
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            watchdog_timeout: Duration::from_millis(self.stream.watchdog_timeout_ms),
            poll_interval: Duration::from_millis(self.stream.watchdog_poll_ms),
            ..StreamOptions::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.acquire_timeout_ms)
    }
}

fn config_error(err: ::config::ConfigError) -> StreamError {
    StreamError::Config(err.to_string())
}
