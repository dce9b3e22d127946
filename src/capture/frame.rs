use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::pool::BufferId;
use crate::error::StreamError;

/// Fewest buffers the pipeline works with: one being filled, one current, one processing.
pub const MIN_BUFFERS: u32 = 3;
/// More buffers than this are never used by the hardware.
pub const MAX_BUFFERS: u32 = 4;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar 4:2:0, Y plane followed by U and V planes (I420).
    Yuv420,
    /// Semi-planar 4:2:0, Y plane followed by interleaved UV.
    Nv12,
    /// Packed 4:2:2.
    Yuyv,
    Rgb24,
    Mjpeg,
}

impl PixelFormat {
    pub const fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Yuv420 => *b"YU12",
            Self::Nv12 => *b"NV12",
            Self::Yuyv => *b"YUYV",
            Self::Rgb24 => *b"RGB3",
            Self::Mjpeg => *b"MJPG",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        match &code {
            b"YU12" => Some(Self::Yuv420),
            b"NV12" => Some(Self::Nv12),
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb24),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }

    /// Bytes per line of the first plane. Zero for compressed formats.
    pub fn min_stride(self, width: u32) -> Option<u32> {
        match self {
            Self::Yuv420 | Self::Nv12 => Some(width),
            Self::Yuyv => width.checked_mul(2),
            Self::Rgb24 => width.checked_mul(3),
            Self::Mjpeg => Some(0),
        }
    }

    /// Size of one frame in bytes, or `None` on overflow.
    ///
    /// MJPEG frames are sized for the worst case (uncompressed 4:2:2).
    pub fn frame_size(self, stride: u32, resolution: Resolution) -> Option<usize> {
        let height = u64::from(resolution.height);
        let stride = u64::from(stride);
        let bytes = match self {
            Self::Yuv420 | Self::Nv12 => stride.checked_mul(height)?.checked_mul(3)? / 2,
            Self::Yuyv | Self::Rgb24 => stride.checked_mul(height)?,
            Self::Mjpeg => u64::from(resolution.width)
                .checked_mul(height)?
                .checked_mul(2)?,
        };
        usize::try_from(bytes).ok()
    }

    /// Whether the first plane holds only luma samples.
    pub const fn is_planar_yuv(self) -> bool {
        matches!(self, Self::Yuv420 | Self::Nv12)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Camera parameters requested by the caller. Immutable once the session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraParams {
    pub camera_index: u32,
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    pub buffer_count: u32,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            camera_index: 0,
            resolution: Resolution::new(1920, 1080),
            pixel_format: PixelFormat::Yuv420,
            buffer_count: MAX_BUFFERS,
        }
    }
}

impl CameraParams {
    /// Fail fast on values no camera could satisfy.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(StreamError::Config(format!(
                "resolution must be non-zero, got {}",
                self.resolution
            )));
        }
        if !(MIN_BUFFERS..=MAX_BUFFERS).contains(&self.buffer_count) {
            return Err(StreamError::Config(format!(
                "buffer count must be in [{MIN_BUFFERS}, {MAX_BUFFERS}], got {}",
                self.buffer_count
            )));
        }
        self.requested_format().map(|_| ())
    }

    /// The format to ask the hardware for.
    pub fn requested_format(&self) -> Result<StreamFormat, StreamError> {
        StreamFormat::new(self.resolution, self.pixel_format)
    }
}

/// Format actually configured on the hardware. May differ from the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    /// Bytes per line of the first plane.
    pub stride: u32,
    /// Bytes per frame.
    pub frame_size: usize,
}

impl StreamFormat {
    /// Tightly packed format for the given resolution.
    pub fn new(resolution: Resolution, pixel_format: PixelFormat) -> Result<Self, StreamError> {
        let stride = pixel_format
            .min_stride(resolution.width)
            .ok_or_else(|| StreamError::Config(format!("resolution {resolution} too large")))?;
        Self::with_stride(resolution, pixel_format, stride)
    }

    pub fn with_stride(
        resolution: Resolution,
        pixel_format: PixelFormat,
        stride: u32,
    ) -> Result<Self, StreamError> {
        let frame_size = pixel_format
            .frame_size(stride, resolution)
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                StreamError::Config(format!(
                    "no valid frame size for {pixel_format} {resolution} (stride {stride})"
                ))
            })?;
        Ok(Self {
            resolution,
            pixel_format,
            stride,
            frame_size,
        })
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} stride {} ({} bytes)",
            self.pixel_format, self.resolution, self.stride, self.frame_size
        )
    }
}

/// The frame currently claimed by the consumer.
///
/// The pixel data is a read-only view into the hardware buffer; nothing is copied. The buffer
/// cannot be handed back to the hardware while a handle still references it, so reading
/// through a handle after `release_frame` never observes a frame being overwritten.
pub struct FrameHandle {
    pub(crate) id: BufferId,
    pub(crate) sequence: u64,
    pub(crate) timestamp: Duration,
    pub(crate) format: StreamFormat,
    pub(crate) data: Bytes,
}

impl FrameHandle {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Hardware sequence number, increasing in completion order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture timestamp reported by the camera.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    /// Pixel data of the frame.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Start of the pixel data, for handing to external consumers (GPU upload, encoders).
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Luma plane for planar YUV formats.
    pub fn luma(&self) -> Option<&[u8]> {
        if !self.format.pixel_format.is_planar_yuv() {
            return None;
        }
        let plane = self.format.stride as usize * self.format.resolution.height as usize;
        self.data.get(..plane)
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420_frame_size() {
        let format = StreamFormat::new(Resolution::new(1920, 1080), PixelFormat::Yuv420).unwrap();
        assert_eq!(format.stride, 1920);
        assert_eq!(format.frame_size, 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn padded_stride_grows_frame() {
        let format =
            StreamFormat::with_stride(Resolution::new(1920, 1080), PixelFormat::Yuv420, 1984)
                .unwrap();
        assert_eq!(format.frame_size, 1984 * 1080 * 3 / 2);
    }

    #[test]
    fn packed_formats_use_bytes_per_pixel() {
        let yuyv = StreamFormat::new(Resolution::new(640, 480), PixelFormat::Yuyv).unwrap();
        assert_eq!(yuyv.stride, 1280);
        assert_eq!(yuyv.frame_size, 1280 * 480);

        let rgb = StreamFormat::new(Resolution::new(640, 480), PixelFormat::Rgb24).unwrap();
        assert_eq!(rgb.frame_size, 640 * 480 * 3);
    }

    #[test]
    fn fourcc_round_trip() {
        for format in [
            PixelFormat::Yuv420,
            PixelFormat::Nv12,
            PixelFormat::Yuyv,
            PixelFormat::Rgb24,
            PixelFormat::Mjpeg,
        ] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(*b"BGR4"), None);
    }

    #[test]
    fn buffer_count_outside_range_is_rejected() {
        for buffer_count in [0, 2, 5, 16] {
            let params = CameraParams {
                buffer_count,
                ..CameraParams::default()
            };
            assert!(matches!(params.validate(), Err(StreamError::Config(_))));
        }
        for buffer_count in [3, 4] {
            let params = CameraParams {
                buffer_count,
                ..CameraParams::default()
            };
            assert!(params.validate().is_ok());
        }
    }

    #[test]
    fn zero_resolution_is_rejected() {
        let params = CameraParams {
            resolution: Resolution::new(0, 1080),
            ..CameraParams::default()
        };
        assert!(matches!(params.validate(), Err(StreamError::Config(_))));
    }

    #[test]
    fn luma_plane_only_for_planar_yuv() {
        let format = StreamFormat::new(Resolution::new(4, 2), PixelFormat::Yuv420).unwrap();
        let handle = FrameHandle {
            id: BufferId(0),
            sequence: 1,
            timestamp: Duration::ZERO,
            format,
            data: Bytes::from(vec![7u8; format.frame_size]),
        };
        assert_eq!(handle.luma().map(<[u8]>::len), Some(8));
        assert_eq!(handle.len(), 12);

        let rgb = FrameHandle {
            format: StreamFormat::new(Resolution::new(4, 2), PixelFormat::Rgb24).unwrap(),
            ..handle
        };
        assert!(rgb.luma().is_none());
    }
}
