//! Test-pattern camera backend
//!
//! Each stream runs on its own dispatch thread that paces frames at the
//! accepted fps and pushes them through the session's sink, the same way a
//! native camera framework delivers from its own runtime.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{CameraBackend, FrameSink, NativeStream, RawFrame};
use crate::capture::device::DeviceDescriptor;
use crate::capture::frame::PixelFormat;
use crate::capture::negotiate::VideoMode;
use crate::{BridgeError, Result};

/// A fake camera and the modes it advertises
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticDevice {
    pub id: String,
    pub name: String,
    pub modes: Vec<VideoMode>,
}

impl SyntheticDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, modes: Vec<VideoMode>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            modes,
        }
    }

    /// Typical USB webcam: raw YUYV up to 720p, MJPEG up to 1080p.
    pub fn webcam(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            id,
            name,
            vec![
                VideoMode::new(640, 480, 30, PixelFormat::Yuyv),
                VideoMode::new(640, 480, 15, PixelFormat::Yuyv),
                VideoMode::new(1280, 720, 10, PixelFormat::Yuyv),
                VideoMode::new(640, 480, 30, PixelFormat::Mjpeg),
                VideoMode::new(1280, 720, 30, PixelFormat::Mjpeg),
                VideoMode::new(1920, 1080, 30, PixelFormat::Mjpeg),
            ],
        )
    }
}

/// Native framework producing generated frames
pub struct SyntheticBackend {
    devices: Vec<SyntheticDevice>,
    streaming: Arc<Mutex<HashSet<String>>>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(vec![SyntheticDevice::webcam("synthetic:0", "Synthetic Camera")])
    }
}

impl SyntheticBackend {
    pub fn new(devices: Vec<SyntheticDevice>) -> Self {
        Self {
            devices,
            streaming: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn device(&self, id: &str) -> Result<&SyntheticDevice> {
        self.devices
            .iter()
            .find(|device| device.id == id)
            .ok_or_else(|| BridgeError::DeviceNotFound { id: id.to_owned() })
    }
}

impl CameraBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .devices
            .iter()
            .map(|device| DeviceDescriptor::new(device.id.clone(), device.name.clone()))
            .collect())
    }

    fn capabilities(&self, device_id: &str) -> Result<Vec<VideoMode>> {
        Ok(self.device(device_id)?.modes.clone())
    }

    fn open_stream(
        &self,
        device_id: &str,
        mode: &VideoMode,
        sink: FrameSink,
    ) -> Result<Box<dyn NativeStream>> {
        let device = self.device(device_id)?;
        if !device.modes.contains(mode) {
            return Err(BridgeError::NativeStart(format!(
                "{} cannot stream {}",
                device_id, mode
            )));
        }

        let claimed = self
            .streaming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_owned());
        if !claimed {
            return Err(BridgeError::DeviceBusy {
                id: device_id.to_owned(),
            });
        }

        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let mode = *mode;
        let spawned = thread::Builder::new()
            .name(format!("hermes-synth-{}", device_id))
            .spawn(move || run_dispatch(mode, sink, stop_rx));

        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                self.streaming
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(device_id);
                return Err(BridgeError::NativeStart(err.to_string()));
            }
        };

        info!("Synthetic stream started: {} {}", device_id, mode);
        Ok(Box::new(SyntheticStream {
            device_id: device_id.to_owned(),
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            streaming: Arc::clone(&self.streaming),
        }))
    }
}

/// Handle for one dispatch thread
pub struct SyntheticStream {
    device_id: String,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    streaming: Arc<Mutex<HashSet<String>>>,
}

impl NativeStream for SyntheticStream {
    fn stop(&mut self) {
        // Disconnecting the channel ends the dispatch loop.
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            self.streaming
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.device_id);
            debug!("Synthetic stream stopped: {}", self.device_id);
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_dispatch(mode: VideoMode, sink: FrameSink, stop_rx: flume::Receiver<()>) {
    let interval = Duration::from_secs_f64(1.0 / f64::from(mode.fps.max(1)));
    let started = Instant::now();
    let mut next = started + interval;
    let mut index = 0u64;

    loop {
        match stop_rx.recv_deadline(next) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        sink.deliver(RawFrame {
            data: render(&mode, index),
            width: mode.width,
            height: mode.height,
            format: mode.format,
            stride: None,
            device_timestamp: Some(started.elapsed()),
        });
        index += 1;
        next += interval;
    }
}

/// SMPTE colour bars as (Y, U, V)
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128), // White
    (210, 16, 146),  // Yellow
    (170, 166, 16),  // Cyan
    (145, 54, 34),   // Green
    (106, 202, 222), // Magenta
    (81, 90, 240),   // Red
    (41, 240, 110),  // Blue
    (16, 128, 128),  // Black
];

/// Generate one frame of test pattern for `mode`.
pub fn render(mode: &VideoMode, index: u64) -> Bytes {
    match mode.format {
        PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Yvyu => {
            let len = mode.format.frame_len(mode.width, mode.height).unwrap_or_default();
            Bytes::from(color_bars(len, mode.width, mode.format))
        }
        PixelFormat::Mjpeg | PixelFormat::Jpeg => Bytes::from(jpeg_markers(index)),
        format => {
            let len = format.frame_len(mode.width, mode.height).unwrap_or_default();
            Bytes::from(gradient(len, mode.width.max(1) as usize, index))
        }
    }
}

fn color_bars(len: usize, width: u32, format: PixelFormat) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let width = width.max(1) as usize;
    let bar_width = (width / 8).max(1);

    for (i, pair) in data.chunks_exact_mut(4).enumerate() {
        let x = (i * 2) % width;
        let (y, u, v) = BARS[(x / bar_width).min(7)];
        let packed = match format {
            PixelFormat::Uyvy => [u, y, v, y],
            PixelFormat::Yvyu => [y, v, y, u],
            _ => [y, u, y, v],
        };
        pair.copy_from_slice(&packed);
    }
    data
}

fn gradient(len: usize, row: usize, index: u64) -> Vec<u8> {
    let shift = index as usize;
    (0..len)
        .map(|i| ((i % row + shift) & 0xff) as u8)
        .collect()
}

/// Smallest payload that still looks like a JPEG to a pass-through consumer.
fn jpeg_markers(index: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&[0xff, 0xd8]);
    data.extend_from_slice(&index.to_le_bytes());
    data.extend_from_slice(&[0xff, 0xd9]);
    data
}
