//! Native camera framework seam
//!
//! A backend enumerates devices, reports their modes and runs streams that
//! push frames through a [`FrameSink`]. The sink is the only path from the
//! native delivery context into a capture session.

pub mod synthetic;

#[cfg(feature = "v4l2")]
pub mod v4l2;

#[cfg(test)]
pub mod mock;

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::capture::device::DeviceDescriptor;
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::negotiate::VideoMode;
use crate::pipeline::FrameBridge;
use crate::Result;

pub use synthetic::{SyntheticBackend, SyntheticDevice};

/// Host camera framework.
pub trait CameraBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Currently attached devices.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Every (resolution, fps, format) the device can stream.
    fn capabilities(&self, device_id: &str) -> Result<Vec<VideoMode>>;

    /// Start streaming `mode` from the device into `sink`.
    ///
    /// The returned handle owns the native stream. Frames may be delivered
    /// from any thread until [`NativeStream::stop`] returns.
    fn open_stream(
        &self,
        device_id: &str,
        mode: &VideoMode,
        sink: FrameSink,
    ) -> Result<Box<dyn NativeStream>>;
}

/// An active native stream.
pub trait NativeStream: Send {
    /// Tear down the native stream and release its resources. Idempotent.
    fn stop(&mut self);
}

/// Payload handed over by the native delivery callback.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per line when the native framework pads lines; `None` when
    /// lines are packed.
    pub stride: Option<u32>,
    pub device_timestamp: Option<Duration>,
}

/// Delivery callback handle given to a backend for one stream.
///
/// Holds a weak reference to the session's gate: once the session is gone,
/// stopped, or restarted under a new epoch, deliveries are discarded.
#[derive(Clone)]
pub struct FrameSink {
    gate: Weak<DeliveryGate>,
    epoch: u64,
}

impl FrameSink {
    /// Publish a frame into the session's mailbox.
    ///
    /// Returns `false` when the frame was discarded.
    pub fn deliver(&self, raw: RawFrame) -> bool {
        match self.gate.upgrade() {
            Some(gate) => gate.deliver(self.epoch, raw),
            None => false,
        }
    }

    /// Whether the owning session still accepts frames from this sink.
    pub fn is_open(&self) -> bool {
        self.gate
            .upgrade()
            .is_some_and(|gate| gate.is_open(self.epoch))
    }
}

#[derive(Default)]
struct GateState {
    open_epoch: Option<u64>,
    next_epoch: u64,
    sequence: u64,
}

/// Serializes deliveries against revocation.
///
/// Every delivery holds the gate lock while it publishes, so `close`
/// returns only after any in-flight delivery has finished.
pub(crate) struct DeliveryGate {
    state: Mutex<GateState>,
    bridge: Arc<FrameBridge>,
}

impl DeliveryGate {
    pub(crate) fn new(bridge: Arc<FrameBridge>) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            bridge,
        }
    }

    /// Hand out a sink for a new epoch. Its frames are discarded until the
    /// epoch is activated.
    pub(crate) fn issue(self: &Arc<Self>) -> FrameSink {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_epoch += 1;
        FrameSink {
            gate: Arc::downgrade(self),
            epoch: state.next_epoch,
        }
    }

    /// Accept frames from `sink`, numbering them from 1.
    pub(crate) fn activate(&self, sink: &FrameSink) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open_epoch = Some(sink.epoch);
        state.sequence = 0;
    }

    #[cfg(test)]
    pub(crate) fn open(self: &Arc<Self>) -> FrameSink {
        let sink = self.issue();
        self.activate(&sink);
        sink
    }

    /// Revoke the current epoch, waiting out any in-flight delivery.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open_epoch = None;
    }

    fn is_open(&self, epoch: u64) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open_epoch
            == Some(epoch)
    }

    fn deliver(&self, epoch: u64, raw: RawFrame) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.open_epoch != Some(epoch) {
            return false;
        }

        if !raw
            .format
            .accepts_strided_len(raw.width, raw.height, raw.stride, raw.data.len())
        {
            warn!(
                "Discarding {} frame {}x{} (stride {:?}) with {} bytes",
                raw.format,
                raw.width,
                raw.height,
                raw.stride,
                raw.data.len()
            );
            return false;
        }

        state.sequence += 1;
        let meta = FrameMetadata {
            sequence: state.sequence,
            width: raw.width,
            height: raw.height,
            stride: raw.stride.unwrap_or_else(|| raw.format.stride(raw.width)),
            format: raw.format,
            device_timestamp: raw.device_timestamp,
        };
        self.bridge.publish(Frame::new(raw.data, meta));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grey(width: u32, height: u32) -> RawFrame {
        RawFrame {
            data: Bytes::from(vec![0u8; (width * height) as usize]),
            width,
            height,
            format: PixelFormat::Grey,
            stride: None,
            device_timestamp: None,
        }
    }

    #[test]
    fn closed_gate_discards_frames() {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(Arc::clone(&bridge)));
        let sink = gate.open();

        assert!(sink.deliver(grey(4, 4)));
        gate.close();
        assert!(!sink.deliver(grey(4, 4)));
        assert!(!sink.is_open());
        assert_eq!(bridge.stats().total_frames, 1);
    }

    #[test]
    fn stale_epoch_is_rejected_after_reopen() {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(Arc::clone(&bridge)));
        let old = gate.open();
        gate.close();
        let new = gate.open();

        assert!(!old.deliver(grey(2, 2)));
        assert!(new.deliver(grey(2, 2)));
    }

    #[test]
    fn dropped_gate_discards_frames() {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(bridge));
        let sink = gate.open();
        drop(gate);

        assert!(!sink.deliver(grey(2, 2)));
    }

    #[test]
    fn issued_sink_waits_for_activation() {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(Arc::clone(&bridge)));
        let sink = gate.issue();

        assert!(!sink.is_open());
        assert!(!sink.deliver(grey(2, 2)));
        gate.activate(&sink);
        assert!(sink.deliver(grey(2, 2)));
        assert_eq!(bridge.take().map(|f| f.sequence()), Some(1));
    }

    #[test]
    fn padded_lines_keep_driver_stride() {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(Arc::clone(&bridge)));
        let sink = gate.open();

        let padded = RawFrame {
            data: Bytes::from(vec![0u8; 64 * 2]),
            width: 16,
            height: 2,
            format: PixelFormat::Yuyv,
            stride: Some(64),
            device_timestamp: None,
        };
        assert!(sink.deliver(padded.clone()));
        assert_eq!(bridge.take().map(|f| f.meta.stride), Some(64));

        let short = RawFrame {
            stride: Some(16),
            data: Bytes::from(vec![0u8; 16 * 2]),
            ..padded
        };
        assert!(!sink.deliver(short));
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(Arc::clone(&bridge)));
        let sink = gate.open();

        let mut frame = grey(2, 2);
        frame.width = u32::MAX;
        frame.format = PixelFormat::Rgb24;
        assert!(!sink.deliver(frame));
        assert_eq!(bridge.stats().total_frames, 0);
    }

    #[test]
    fn malformed_payload_is_not_counted() {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(Arc::clone(&bridge)));
        let sink = gate.open();

        let mut frame = grey(4, 4);
        frame.data = Bytes::from_static(&[0, 1, 2]);
        assert!(!sink.deliver(frame));
        assert_eq!(bridge.stats().total_frames, 0);
    }

    #[test]
    fn sequence_numbers_increase_per_accepted_frame() {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(Arc::clone(&bridge)));
        let sink = gate.open();

        sink.deliver(grey(2, 2));
        sink.deliver(grey(2, 2));
        let frame = bridge.take().expect("frame published");
        assert_eq!(frame.sequence(), 2);
        assert_eq!(frame.meta.stride, 2);
    }
}
