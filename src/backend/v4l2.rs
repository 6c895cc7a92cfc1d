//! Native V4L2 backend with memory-mapped streaming

use std::io;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::backend::{CameraBackend, FrameSink, NativeStream, RawFrame};
use crate::capture::device::DeviceDescriptor;
use crate::capture::frame::PixelFormat;
use crate::capture::negotiate::VideoMode;
use crate::{BridgeError, Result};

const MAX_NODES: usize = 64;
const BUFFER_COUNT: u32 = 4;
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Camera backend over `/dev/video*` nodes
#[derive(Debug, Default)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }
}

fn open_device(path: &str) -> Result<Device> {
    Device::with_path(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => BridgeError::DeviceNotFound {
            id: path.to_owned(),
        },
        _ if err.raw_os_error() == Some(libc::EBUSY) => BridgeError::DeviceBusy {
            id: path.to_owned(),
        },
        _ => BridgeError::Io(err),
    })
}

fn to_fourcc(format: PixelFormat) -> FourCC {
    FourCC::new(&format.fourcc().to_le_bytes())
}

fn from_fourcc(fourcc: FourCC) -> Option<PixelFormat> {
    PixelFormat::from_fourcc(u32::from_le_bytes(fourcc.repr))
}

fn frame_rates(device: &Device, fourcc: FourCC, width: u32, height: u32) -> Vec<u32> {
    let intervals = match device.enum_frameintervals(fourcc, width, height) {
        Ok(intervals) => intervals,
        Err(err) => {
            debug!("No frame intervals for {}x{} {}: {}", width, height, fourcc, err);
            return Vec::new();
        }
    };

    intervals
        .into_iter()
        .filter_map(|interval| {
            let fraction = match interval.interval {
                FrameIntervalEnum::Discrete(fraction) => fraction,
                FrameIntervalEnum::Stepwise(stepwise) => stepwise.min,
            };
            (fraction.numerator > 0).then(|| fraction.denominator / fraction.numerator)
        })
        .filter(|fps| *fps > 0)
        .collect()
}

impl CameraBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        if !Path::new("/dev").exists() {
            return Err(BridgeError::DeviceEnumeration("/dev is not available".into()));
        }

        let mut devices = Vec::new();
        for i in 0..MAX_NODES {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let device = match Device::with_path(&path) {
                Ok(device) => device,
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(BridgeError::DeviceEnumeration(format!("{}: {}", path, err)));
                }
                Err(err) => {
                    debug!("Skipping {}: {}", path, err);
                    continue;
                }
            };

            // Metadata nodes share the driver but cannot capture
            match device.query_caps() {
                Ok(caps) if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) => {
                    info!("Found capture device: {} - {}", path, caps.card);
                    devices.push(DeviceDescriptor::new(path, caps.card));
                }
                Ok(_) => {}
                Err(err) => debug!("Skipping {}: {}", path, err),
            }
        }
        Ok(devices)
    }

    fn capabilities(&self, device_id: &str) -> Result<Vec<VideoMode>> {
        let device = open_device(device_id)?;
        let mut modes = Vec::new();

        for description in device.enum_formats()? {
            let Some(format) = from_fourcc(description.fourcc) else {
                debug!("Ignoring unsupported fourcc {}", description.fourcc);
                continue;
            };

            for size in device.enum_framesizes(description.fourcc)? {
                let sizes = match size.size {
                    FrameSizeEnum::Discrete(discrete) => vec![(discrete.width, discrete.height)],
                    FrameSizeEnum::Stepwise(stepwise) => vec![
                        (stepwise.min_width, stepwise.min_height),
                        (stepwise.max_width, stepwise.max_height),
                    ],
                };

                for (width, height) in sizes {
                    for fps in frame_rates(&device, description.fourcc, width, height) {
                        modes.push(VideoMode::new(width, height, fps, format));
                    }
                }
            }
        }

        modes.dedup();
        Ok(modes)
    }

    fn open_stream(
        &self,
        device_id: &str,
        mode: &VideoMode,
        sink: FrameSink,
    ) -> Result<Box<dyn NativeStream>> {
        let (ready_tx, ready_rx) = flume::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let path = device_id.to_owned();
        let mode = *mode;

        let thread = thread::Builder::new()
            .name("hermes-v4l2".into())
            .spawn(move || run_capture(path, mode, sink, ready_tx, stop_rx))
            .map_err(|err| BridgeError::NativeStart(err.to_string()))?;

        let mut stream = V4l2Stream {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(stream)),
            Ok(Err(err)) => {
                stream.stop();
                Err(err)
            }
            Err(_) => {
                stream.stop();
                Err(BridgeError::NativeStart("capture thread exited".into()))
            }
        }
    }
}

/// Open, configure and stream on the capture thread. The device never leaves
/// this thread.
fn run_capture(
    path: String,
    mode: VideoMode,
    sink: FrameSink,
    ready_tx: Sender<Result<()>>,
    stop_rx: Receiver<()>,
) {
    let (device, stride) = match configure(&path, &mode) {
        Ok(configured) => configured,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(BridgeError::NativeStart(err.to_string())));
            return;
        }
    };
    stream.set_timeout(DEQUEUE_TIMEOUT);
    let _ = ready_tx.send(Ok(()));
    info!(
        "Capture stream started with {} buffers, {} bytes per line",
        BUFFER_COUNT, stride
    );
    let frame_len = mode.format.frame_len_with_stride(stride, mode.height);

    loop {
        match stop_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => break,
        }

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
            Err(err) => {
                warn!("Dequeue failed on {}: {}", path, err);
                break;
            }
        };

        // Drivers may report sizeimage with trailing alignment
        let used = (meta.bytesused as usize).min(buf.len());
        let used = frame_len.map_or(used, |len| len.min(used));
        let device_timestamp = Duration::from_secs(meta.timestamp.sec.max(0) as u64)
            + Duration::from_micros(meta.timestamp.usec.max(0) as u64);
        sink.deliver(RawFrame {
            data: Bytes::copy_from_slice(&buf[..used]),
            width: mode.width,
            height: mode.height,
            format: mode.format,
            stride: (!mode.format.is_compressed()).then_some(stride),
            device_timestamp: Some(device_timestamp),
        });
    }
}

/// Apply `mode` and return the device with the driver's bytes per line.
fn configure(path: &str, mode: &VideoMode) -> Result<(Device, u32)> {
    let device = open_device(path)?;

    let mut fmt = device.format()?;
    fmt.width = mode.width;
    fmt.height = mode.height;
    fmt.fourcc = to_fourcc(mode.format);
    let fmt = device.set_format(&fmt).map_err(|err| {
        if err.raw_os_error() == Some(libc::EBUSY) {
            BridgeError::DeviceBusy {
                id: path.to_owned(),
            }
        } else {
            BridgeError::NativeStart(err.to_string())
        }
    })?;

    if fmt.width != mode.width || fmt.height != mode.height || fmt.fourcc != to_fourcc(mode.format)
    {
        return Err(BridgeError::NativeStart(format!(
            "driver adjusted {} to {}x{} {}",
            mode, fmt.width, fmt.height, fmt.fourcc
        )));
    }

    let stride = check_stride(mode, fmt.stride)?;

    if let Err(err) = device.set_params(&Parameters::with_fps(mode.fps)) {
        warn!("Could not set {} fps on {}: {}", mode.fps, path, err);
    }
    Ok((device, stride))
}

/// Driver `bytesperline` must hold a full line; `0` means unpadded.
fn check_stride(mode: &VideoMode, reported: u32) -> Result<u32> {
    if mode.format.is_compressed() {
        return Ok(0);
    }
    let packed = mode.format.packed_stride(mode.width).ok_or_else(|| {
        BridgeError::NativeStart(format!("{} is too wide", mode))
    })?;
    match reported {
        0 => Ok(packed),
        stride if stride >= packed => Ok(stride),
        stride => Err(BridgeError::NativeStart(format!(
            "driver reports {} bytes per line for {}",
            stride, mode
        ))),
    }
}

/// Handle for the capture thread
pub struct V4l2Stream {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl NativeStream for V4l2Stream {
    fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for V4l2Stream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_conversion_round_trips() {
        for format in PixelFormat::BY_PREFERENCE {
            assert_eq!(from_fourcc(to_fourcc(format)), Some(format));
        }
        assert_eq!(to_fourcc(PixelFormat::Mjpeg), FourCC::new(b"MJPG"));
    }

    #[test]
    fn padded_driver_stride_is_kept() {
        let mode = VideoMode::new(640, 480, 30, PixelFormat::Yuyv);
        assert_eq!(check_stride(&mode, 1344).expect("padded"), 1344);
        assert_eq!(check_stride(&mode, 0).expect("unreported"), 1280);
        assert!(check_stride(&mode, 640).is_err());

        let mjpeg = VideoMode::new(640, 480, 30, PixelFormat::Mjpeg);
        assert_eq!(check_stride(&mjpeg, 0).expect("compressed"), 0);
    }

    #[test]
    fn missing_node_is_not_found() {
        assert!(matches!(
            open_device("/dev/video-does-not-exist"),
            Err(BridgeError::DeviceNotFound { .. })
        ));
    }
}
