use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
///
/// A frame is immutable once built. Ownership moves from the delivery path
/// into the mailbox and from there to exactly one reader.
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Host timestamp taken when the frame entered the bridge
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn byte_length(&self) -> usize {
        self.data.len()
    }

    pub fn is_keyframe(&self) -> bool {
        self.meta.format.is_compressed()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Yvyu,
    Yuv420,
    Nv12,
    Rgb24,
    Bgr24,
    Rgb565,
    Grey,
    Mjpeg,
    Jpeg,
}

impl PixelFormat {
    /// Formats ordered by how cheaply the downstream encoder handles them.
    pub const BY_PREFERENCE: [PixelFormat; 11] = [
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Yvyu,
        PixelFormat::Nv12,
        PixelFormat::Yuv420,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgb565,
        PixelFormat::Grey,
        PixelFormat::Mjpeg,
        PixelFormat::Jpeg,
    ];

    /// V4L2 fourcc code (little-endian packed ASCII).
    pub const fn fourcc(self) -> u32 {
        let code = match self {
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Uyvy => b"UYVY",
            PixelFormat::Yvyu => b"YVYU",
            PixelFormat::Yuv420 => b"YU12",
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Rgb24 => b"RGB3",
            PixelFormat::Bgr24 => b"BGR3",
            PixelFormat::Rgb565 => b"RGBP",
            PixelFormat::Grey => b"GREY",
            PixelFormat::Mjpeg => b"MJPG",
            PixelFormat::Jpeg => b"JPEG",
        };
        u32::from_le_bytes(*code)
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::BY_PREFERENCE
            .into_iter()
            .find(|format| format.fourcc() == code)
    }

    pub const fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::Jpeg)
    }

    /// Position in [`Self::BY_PREFERENCE`], lower is cheaper.
    pub fn preference_rank(self) -> u32 {
        Self::BY_PREFERENCE
            .iter()
            .position(|format| *format == self)
            .map_or(u32::MAX, |rank| rank as u32)
    }

    /// Bytes per pixel of the first plane, `None` for compressed formats.
    const fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Yuyv
            | PixelFormat::Uyvy
            | PixelFormat::Yvyu
            | PixelFormat::Rgb565 => Some(2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuv420 | PixelFormat::Nv12 | PixelFormat::Grey => Some(1),
            PixelFormat::Mjpeg | PixelFormat::Jpeg => None,
        }
    }

    /// Unpadded bytes per line of the first plane. `None` for compressed
    /// formats and for widths whose line length overflows `u32`.
    pub fn packed_stride(self, width: u32) -> Option<u32> {
        width.checked_mul(self.bytes_per_pixel()?)
    }

    /// Bytes per line of the first plane, `0` for compressed formats.
    pub fn stride(self, width: u32) -> u32 {
        self.packed_stride(width).unwrap_or(0)
    }

    /// Exact payload size for uncompressed formats with unpadded lines.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        self.frame_len_with_stride(self.packed_stride(width)?, height)
    }

    /// Payload size when the first plane has `stride` bytes per line.
    pub fn frame_len_with_stride(self, stride: u32, height: u32) -> Option<usize> {
        let plane = (stride as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Yuv420 | PixelFormat::Nv12 => plane.checked_mul(3).map(|len| len / 2),
            PixelFormat::Mjpeg | PixelFormat::Jpeg => None,
            _ => Some(plane),
        }
    }

    /// Checks a payload length against the format's unpadded layout.
    pub fn accepts_len(self, width: u32, height: u32, len: usize) -> bool {
        self.accepts_strided_len(width, height, None, len)
    }

    /// Checks a payload length against the layout for `stride` bytes per
    /// line; `None` means unpadded. A stride shorter than a line is rejected.
    pub fn accepts_strided_len(
        self,
        width: u32,
        height: u32,
        stride: Option<u32>,
        len: usize,
    ) -> bool {
        if self.is_compressed() {
            return len > 0;
        }
        let Some(packed) = self.packed_stride(width) else {
            return false;
        };
        let stride = stride.unwrap_or(packed);
        stride >= packed && self.frame_len_with_stride(stride, height) == Some(len)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc().to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}
