//! Mock backend for testing without hardware.
//!
//! Streams never produce frames on their own: tests grab the registered
//! [`FrameSink`] and deliver frames from whatever thread they like.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::backend::{CameraBackend, FrameSink, NativeStream, RawFrame};
use crate::capture::device::DeviceDescriptor;
use crate::capture::frame::PixelFormat;
use crate::capture::negotiate::VideoMode;
use crate::{BridgeError, Result};

/// How the next `open_stream` should fail.
#[derive(Debug, Clone, Copy)]
pub enum StartFailure {
    Busy,
    Native,
}

/// Manually driven native framework.
pub struct MockBackend {
    devices: Mutex<Vec<DeviceDescriptor>>,
    modes: HashMap<String, Vec<VideoMode>>,
    fail_enumeration: bool,
    next_failure: Mutex<Option<StartFailure>>,
    registrations: AtomicUsize,
    active: Arc<AtomicUsize>,
    sinks: Mutex<Vec<FrameSink>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            modes: HashMap::new(),
            fail_enumeration: false,
            next_failure: Mutex::new(None),
            registrations: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            sinks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_device(self, id: &str, name: &str) -> Self {
        self.attach(DeviceDescriptor::new(id, name));
        self
    }

    /// Override the modes reported for `id` (default: VGA grey and 720p YUYV).
    #[must_use]
    pub fn with_modes(mut self, id: &str, modes: Vec<VideoMode>) -> Self {
        self.modes.insert(id.to_owned(), modes);
        self
    }

    #[must_use]
    pub fn failing_enumeration(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    pub fn attach(&self, device: DeviceDescriptor) {
        self.devices.lock().unwrap().push(device);
    }

    pub fn fail_next_start(&self, failure: StartFailure) {
        *self.next_failure.lock().unwrap() = Some(failure);
    }

    /// Successful `open_stream` calls so far.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn last_sink(&self) -> Option<FrameSink> {
        self.sinks.lock().unwrap().last().cloned()
    }
}

impl CameraBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        if self.fail_enumeration {
            return Err(BridgeError::DeviceEnumeration("permission denied".into()));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    fn capabilities(&self, device_id: &str) -> Result<Vec<VideoMode>> {
        if !self.devices.lock().unwrap().iter().any(|d| d.id == device_id) {
            return Err(BridgeError::DeviceNotFound {
                id: device_id.to_owned(),
            });
        }
        Ok(self.modes.get(device_id).cloned().unwrap_or_else(|| {
            vec![
                VideoMode::new(640, 480, 30, PixelFormat::Grey),
                VideoMode::new(1280, 720, 30, PixelFormat::Yuyv),
            ]
        }))
    }

    fn open_stream(
        &self,
        device_id: &str,
        _mode: &VideoMode,
        sink: FrameSink,
    ) -> Result<Box<dyn NativeStream>> {
        match self.next_failure.lock().unwrap().take() {
            Some(StartFailure::Busy) => {
                return Err(BridgeError::DeviceBusy {
                    id: device_id.to_owned(),
                })
            }
            Some(StartFailure::Native) => {
                return Err(BridgeError::NativeStart("mock refused".into()))
            }
            None => {}
        }

        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().push(sink);
        Ok(Box::new(MockStream {
            active: Arc::clone(&self.active),
            stopped: false,
        }))
    }
}

/// Mock native stream; only tracks whether it is still registered.
pub struct MockStream {
    active: Arc<AtomicUsize>,
    stopped: bool,
}

impl NativeStream for MockStream {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Grey frame with a correctly sized payload.
pub fn grey_frame(width: u32, height: u32) -> RawFrame {
    RawFrame {
        data: Bytes::from(vec![0x80; width as usize * height as usize]),
        width,
        height,
        format: PixelFormat::Grey,
        stride: None,
        device_timestamp: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_backend_reports_default_modes() {
        let backend = MockBackend::new().with_device("cam0", "Mock Camera");
        let modes = backend.capabilities("cam0").expect("capabilities");
        assert_eq!(modes.len(), 2);
        assert!(backend.capabilities("missing").is_err());
    }

    #[test]
    fn test_mock_stream_stop_is_idempotent() {
        let backend = MockBackend::new().with_device("cam0", "Mock Camera");
        let bridge = Arc::new(crate::pipeline::FrameBridge::new());
        let gate = Arc::new(crate::backend::DeliveryGate::new(bridge));
        let mut stream = backend
            .open_stream("cam0", &VideoMode::default(), gate.open())
            .expect("open");

        assert_eq!(backend.active_streams(), 1);
        stream.stop();
        stream.stop();
        assert_eq!(backend.active_streams(), 0);
        assert_eq!(backend.registrations(), 1);
    }
}
