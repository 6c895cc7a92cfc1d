//! V4L2-shaped adapter over a capture session
//!
//! Lets code written against the kernel capture ioctls drive a session:
//! each method corresponds to one `VIDIOC_*` request and errors map to the
//! errno that request would fail with.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::negotiate::VideoMode;
use crate::capture::session::CaptureSession;
use crate::{BridgeError, Result};

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_TIMEPERFRAME: u32 = 0x0000_1000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_FIELD_NONE: u32 = 1;
pub const V4L2_COLORSPACE_SRGB: u32 = 8;
pub const V4L2_COLORSPACE_JPEG: u32 = 7;

pub const V4L2_BUF_FLAG_MAPPED: u32 = 0x0000_0001;
pub const V4L2_BUF_FLAG_QUEUED: u32 = 0x0000_0002;
pub const V4L2_BUF_FLAG_DONE: u32 = 0x0000_0004;
pub const V4L2_BUF_FLAG_KEYFRAME: u32 = 0x0000_0008;

pub const V4L2_FMT_FLAG_COMPRESSED: u32 = 0x0001;

/// `VIDEO_MAX_FRAME`
pub const MAX_BUFFERS: u32 = 32;

/// `VIDIOC_QUERYCAP` result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capabilities: u32,
}

/// `VIDIOC_ENUM_FMT` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmtDesc {
    pub index: u32,
    pub flags: u32,
    pub description: String,
    pub pixelformat: u32,
}

/// `struct v4l2_pix_format` subset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
}

impl PixFormat {
    fn from_mode(mode: &VideoMode) -> Self {
        let sizeimage = mode
            .format
            .frame_len(mode.width, mode.height)
            // Worst case for compressed payloads
            .unwrap_or(mode.width as usize * mode.height as usize * 2);
        Self {
            width: mode.width,
            height: mode.height,
            pixelformat: mode.format.fourcc(),
            field: V4L2_FIELD_NONE,
            bytesperline: mode.format.stride(mode.width),
            sizeimage: u32::try_from(sizeimage).unwrap_or(u32::MAX),
            colorspace: if mode.format.is_compressed() {
                V4L2_COLORSPACE_JPEG
            } else {
                V4L2_COLORSPACE_SRGB
            },
        }
    }
}

/// `timeperframe` of `VIDIOC_G_PARM`/`VIDIOC_S_PARM`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParm {
    pub capability: u32,
    pub numerator: u32,
    pub denominator: u32,
}

/// `struct v4l2_buffer` subset returned by `VIDIOC_DQBUF`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub buf_type: u32,
    pub bytesused: u32,
    /// Buffer capacity, `sizeimage` of the current format
    pub length: u32,
    pub flags: u32,
    pub field: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Buffers granted by `VIDIOC_REQBUFS`, in the order the caller queued them
#[derive(Debug, Default)]
struct BufferQueue {
    count: u32,
    queued: VecDeque<u32>,
}

impl BufferQueue {
    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.count {
            return Err(BridgeError::InvalidBuffer(format!(
                "index {} out of {} buffers",
                index, self.count
            )));
        }
        Ok(())
    }
}

/// Capture-device facade over one [`CaptureSession`]
pub struct CompatDevice {
    session: Arc<CaptureSession>,
    buffers: Mutex<BufferQueue>,
}

impl CompatDevice {
    pub fn new(session: Arc<CaptureSession>) -> Self {
        Self {
            session,
            buffers: Mutex::new(BufferQueue::default()),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, BufferQueue> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> &Arc<CaptureSession> {
        &self.session
    }

    /// `VIDIOC_QUERYCAP`
    pub fn query_cap(&self) -> Capability {
        Capability {
            driver: "hermes".into(),
            card: self.session.name().unwrap_or_default(),
            bus_info: self
                .session
                .device_id()
                .map(|id| format!("platform:{}", id))
                .unwrap_or_default(),
            capabilities: V4L2_CAP_VIDEO_CAPTURE | V4L2_CAP_STREAMING | V4L2_CAP_TIMEPERFRAME,
        }
    }

    /// `VIDIOC_ENUM_FMT`: formats offered by the device, cheapest first.
    pub fn enum_fmt(&self, index: u32, supported: &[VideoMode]) -> Option<FmtDesc> {
        let mut formats: Vec<PixelFormat> = supported.iter().map(|mode| mode.format).collect();
        formats.sort_by_key(|format| format.preference_rank());
        formats.dedup();

        let format = *formats.get(index as usize)?;
        Some(FmtDesc {
            index,
            flags: if format.is_compressed() {
                V4L2_FMT_FLAG_COMPRESSED
            } else {
                0
            },
            description: format.to_string(),
            pixelformat: format.fourcc(),
        })
    }

    /// `VIDIOC_G_FMT`
    pub fn g_fmt(&self) -> PixFormat {
        PixFormat::from_mode(&self.session.current_mode())
    }

    /// `VIDIOC_S_FMT`: negotiates and reports the accepted format.
    pub fn s_fmt(&self, requested: &PixFormat) -> Result<PixFormat> {
        let format = PixelFormat::from_fourcc(requested.pixelformat)
            .unwrap_or_else(|| self.session.pixel_format());
        let mode = VideoMode {
            width: requested.width,
            height: requested.height,
            format,
            fps: self.session.fps(),
        };
        let accepted = self.session.negotiate(mode)?;
        debug!("S_FMT {} -> {}", mode, accepted);
        Ok(PixFormat::from_mode(&accepted))
    }

    /// `VIDIOC_G_PARM`
    pub fn g_parm(&self) -> StreamParm {
        StreamParm {
            capability: V4L2_CAP_TIMEPERFRAME,
            numerator: 1,
            denominator: self.session.fps(),
        }
    }

    /// `VIDIOC_S_PARM`: `timeperframe` is a frame interval, not a rate.
    pub fn s_parm(&self, parm: &StreamParm) -> Result<StreamParm> {
        if parm.numerator == 0 || parm.denominator == 0 {
            return Err(BridgeError::UnsupportedFormat {
                id: self.session.device_id().unwrap_or_default(),
            });
        }
        let fps = (parm.denominator / parm.numerator).max(1);
        let accepted = self.session.set_fps(fps)?;
        Ok(StreamParm {
            capability: V4L2_CAP_TIMEPERFRAME,
            numerator: 1,
            denominator: accepted.fps,
        })
    }

    /// `VIDIOC_REQBUFS`: grant up to [`MAX_BUFFERS`] buffers, all owned by
    /// the caller. A count of zero releases them. Fails with `EBUSY` while
    /// streaming.
    pub fn reqbufs(&self, count: u32) -> Result<u32> {
        if self.session.is_running() {
            return Err(BridgeError::DeviceBusy {
                id: self.session.device_id().unwrap_or_default(),
            });
        }

        let mut buffers = self.buffers();
        buffers.count = count.min(MAX_BUFFERS);
        buffers.queued.clear();
        debug!("REQBUFS {} -> {}", count, buffers.count);
        Ok(buffers.count)
    }

    /// `VIDIOC_QUERYBUF`
    pub fn querybuf(&self, index: u32) -> Result<BufferInfo> {
        let buffers = self.buffers();
        buffers.check_index(index)?;

        let mut flags = V4L2_BUF_FLAG_MAPPED;
        if buffers.queued.contains(&index) {
            flags |= V4L2_BUF_FLAG_QUEUED;
        }
        Ok(BufferInfo {
            index,
            buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            bytesused: 0,
            length: self.g_fmt().sizeimage,
            flags,
            field: V4L2_FIELD_NONE,
            sequence: 0,
            timestamp: Duration::ZERO,
        })
    }

    /// `VIDIOC_QBUF`: hand a buffer back to be filled.
    pub fn qbuf(&self, index: u32) -> Result<()> {
        let mut buffers = self.buffers();
        buffers.check_index(index)?;
        if buffers.queued.contains(&index) {
            return Err(BridgeError::InvalidBuffer(format!(
                "buffer {} is already queued",
                index
            )));
        }
        buffers.queued.push_back(index);
        Ok(())
    }

    /// `VIDIOC_STREAMON`: needs buffers from `reqbufs`.
    pub fn stream_on(&self) -> Result<()> {
        if self.buffers().count == 0 {
            return Err(BridgeError::InvalidBuffer("no buffers requested".into()));
        }
        self.session.start()
    }

    /// `VIDIOC_STREAMOFF`: every queued buffer returns to the caller.
    pub fn stream_off(&self) -> Result<()> {
        self.buffers().queued.clear();
        self.session.stop()
    }

    /// Non-blocking `VIDIOC_DQBUF` into the oldest queued buffer.
    ///
    /// Fails with `EINVAL` when no buffer is queued and with `EAGAIN` when
    /// no frame is pending; the buffer stays queued in that case.
    pub fn dqbuf(&self) -> Result<(BufferInfo, Frame)> {
        let mut buffers = self.buffers();
        let Some(&index) = buffers.queued.front() else {
            return Err(BridgeError::InvalidBuffer("no buffer queued".into()));
        };
        let frame = self.session.grab_frame()?;
        buffers.queued.pop_front();
        drop(buffers);

        let mut flags = V4L2_BUF_FLAG_MAPPED | V4L2_BUF_FLAG_DONE;
        if frame.is_keyframe() {
            flags |= V4L2_BUF_FLAG_KEYFRAME;
        }
        let bytesused = u32::try_from(frame.byte_length()).unwrap_or(u32::MAX);
        let info = BufferInfo {
            index,
            buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            bytesused,
            length: self.g_fmt().sizeimage.max(bytesused),
            flags,
            field: V4L2_FIELD_NONE,
            // v4l2_buffer carries a 32-bit sequence
            sequence: frame.sequence() as u32,
            timestamp: frame.meta.device_timestamp.unwrap_or_default(),
        };
        Ok((info, frame))
    }

    /// `poll()` for readability. Negative or NaN timeouts poll once.
    pub fn poll(&self, timeout_sec: f64) -> Result<bool> {
        let timeout = Duration::try_from_secs_f64(timeout_sec).unwrap_or(if timeout_sec > 0.0 {
            Duration::MAX
        } else {
            Duration::ZERO
        });
        match self.session.wait_frame(timeout) {
            Ok(()) => Ok(true),
            Err(BridgeError::Timeout) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
