//! Capture session: binds a negotiated mode to a native stream
//!
//! The native framework pushes frames from its own dispatch context through a
//! [`FrameSink`](crate::backend::FrameSink); consumers poll or wait on the
//! session's mailbox. The session owns the native stream and controls
//! teardown so that no delivery lands after `stop()` returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::backend::{CameraBackend, DeliveryGate, NativeStream};
use crate::capture::device::DeviceDescriptor;
use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::negotiate::{negotiate, VideoMode};
use crate::pipeline::{FrameBridge, FrameStats};
use crate::{BridgeError, Result};

/// Lifecycle of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device bound yet
    Unconfigured,
    /// Device bound, format possibly negotiated, not streaming
    Configured,
    Running,
    /// Stream torn down; the mailbox keeps its last state
    Stopped,
}

struct Control {
    state: SessionState,
    device: Option<DeviceDescriptor>,
    requested: VideoMode,
    accepted: Option<VideoMode>,
    stream: Option<Box<dyn NativeStream>>,
}

/// One device stream and its frame mailbox
///
/// All operations take `&self`; share the session behind an `Arc` to let
/// several consumer threads poll it while another thread controls it.
pub struct CaptureSession {
    backend: Arc<dyn CameraBackend>,
    control: Mutex<Control>,
    bridge: Arc<FrameBridge>,
    gate: Arc<DeliveryGate>,
}

impl CaptureSession {
    /// Unbound session; `default_mode` is requested if `start` runs before
    /// any explicit negotiation.
    pub fn new(backend: Arc<dyn CameraBackend>, default_mode: VideoMode) -> Self {
        let bridge = Arc::new(FrameBridge::new());
        let gate = Arc::new(DeliveryGate::new(Arc::clone(&bridge)));
        Self {
            backend,
            control: Mutex::new(Control {
                state: SessionState::Unconfigured,
                device: None,
                requested: default_mode,
                accepted: None,
                stream: None,
            }),
            bridge,
            gate,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind (or rebind) a device. Drops any negotiated format.
    pub fn bind_device(&self, device: DeviceDescriptor) -> Result<()> {
        let mut control = self.lock();
        if control.state == SessionState::Running {
            return Err(BridgeError::InvalidState {
                op: "bind device",
                state: control.state,
            });
        }
        control.device = Some(device);
        control.accepted = None;
        control.state = SessionState::Configured;
        Ok(())
    }

    /// Negotiate `requested` against the device's capabilities and lock in
    /// the accepted mode. Does not start streaming.
    #[instrument(skip(self))]
    pub fn negotiate(&self, requested: VideoMode) -> Result<VideoMode> {
        let mut control = self.lock();
        self.negotiate_locked(&mut control, requested)
    }

    fn negotiate_locked(&self, control: &mut Control, requested: VideoMode) -> Result<VideoMode> {
        let device = match (&control.device, control.state) {
            (_, SessionState::Running) | (None, _) => {
                return Err(BridgeError::InvalidState {
                    op: "negotiate",
                    state: control.state,
                })
            }
            (Some(device), _) => device,
        };

        let supported = self.backend.capabilities(&device.id)?;
        let accepted =
            negotiate(&supported, &requested).ok_or_else(|| BridgeError::UnsupportedFormat {
                id: device.id.clone(),
            })?;

        if accepted != requested {
            info!("Requested {} not supported, using {}", requested, accepted);
        }
        control.requested = requested;
        control.accepted = Some(accepted);
        control.state = SessionState::Configured;
        Ok(accepted)
    }

    pub fn set_resolution(&self, width: u32, height: u32) -> Result<VideoMode> {
        let mut control = self.lock();
        let requested = VideoMode {
            width,
            height,
            ..control.requested
        };
        self.negotiate_locked(&mut control, requested)
    }

    pub fn set_fps(&self, fps: u32) -> Result<VideoMode> {
        let mut control = self.lock();
        let requested = VideoMode {
            fps,
            ..control.requested
        };
        self.negotiate_locked(&mut control, requested)
    }

    pub fn set_pixel_format(&self, format: PixelFormat) -> Result<VideoMode> {
        let mut control = self.lock();
        let requested = VideoMode {
            format,
            ..control.requested
        };
        self.negotiate_locked(&mut control, requested)
    }

    /// Start streaming. A second call while running is a successful no-op.
    ///
    /// Starting again after `stop` clears the mailbox and counters once the
    /// native stream is up; a failed start leaves them untouched.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let mut control = self.lock();
        match control.state {
            SessionState::Running => {
                debug!("Session already running");
                return Ok(());
            }
            SessionState::Unconfigured => {
                return Err(BridgeError::InvalidState {
                    op: "start",
                    state: control.state,
                })
            }
            SessionState::Configured | SessionState::Stopped => {}
        }

        let mode = match control.accepted {
            Some(mode) => mode,
            None => {
                let requested = control.requested;
                self.negotiate_locked(&mut control, requested)?
            }
        };
        let device_id = match &control.device {
            Some(device) => device.id.clone(),
            None => {
                return Err(BridgeError::InvalidState {
                    op: "start",
                    state: control.state,
                })
            }
        };

        // The mailbox keeps its last state until the native stream is up.
        let sink = self.gate.issue();
        match self.backend.open_stream(&device_id, &mode, sink.clone()) {
            Ok(stream) => {
                self.bridge.reset();
                self.bridge.open();
                self.gate.activate(&sink);
                control.stream = Some(stream);
                control.state = SessionState::Running;
                info!("Capture started on {} at {}", device_id, mode);
                Ok(())
            }
            Err(err) => {
                warn!("Failed to start {}: {}", device_id, err);
                Err(err)
            }
        }
    }

    /// Stop streaming.
    ///
    /// Once this returns no delivery can reach the mailbox and every thread
    /// blocked in [`wait_frame`](Self::wait_frame) has been woken. Stopping a
    /// session that is not running is a no-op.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        let mut control = self.lock();
        if control.state != SessionState::Running {
            return Ok(());
        }

        // Blocks until an in-flight delivery has published.
        self.gate.close();
        if let Some(mut stream) = control.stream.take() {
            stream.stop();
        }
        self.bridge.close();
        control.state = SessionState::Stopped;

        let stats = self.bridge.stats();
        info!(
            "Capture stopped: {} frames, {} dropped",
            stats.total_frames, stats.dropped_frames
        );
        Ok(())
    }

    /// Take the pending frame without blocking
    pub fn grab_frame(&self) -> Result<Frame> {
        self.bridge.take().ok_or(BridgeError::NoFrameAvailable)
    }

    pub fn has_frame(&self) -> bool {
        self.bridge.has_frame()
    }

    /// Block until a frame is pending, the timeout elapses, or the session
    /// stops.
    pub fn wait_frame(&self, timeout: Duration) -> Result<()> {
        self.bridge.wait(timeout)
    }

    /// Wait for a frame and take it. A frame taken by another consumer first
    /// keeps this call waiting until the deadline.
    pub fn next_frame(&self, timeout: Duration) -> Result<Frame> {
        self.bridge.wait_take(timeout)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.lock().device.clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.lock().device.as_ref().map(|device| device.id.clone())
    }

    pub fn name(&self) -> Option<String> {
        self.lock()
            .device
            .as_ref()
            .map(|device| device.display_name.clone())
    }

    /// Accepted mode, if negotiated
    pub fn mode(&self) -> Option<VideoMode> {
        self.lock().accepted
    }

    /// Accepted mode, or the pending request before negotiation
    pub fn current_mode(&self) -> VideoMode {
        let control = self.lock();
        control.accepted.unwrap_or(control.requested)
    }

    pub fn width(&self) -> u32 {
        self.current_mode().width
    }

    pub fn height(&self) -> u32 {
        self.current_mode().height
    }

    pub fn fps(&self) -> u32 {
        self.current_mode().fps
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.current_mode().format
    }

    pub fn stats(&self) -> FrameStats {
        self.bridge.stats()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.bridge.dropped_frames()
    }

    pub fn total_frames(&self) -> u64 {
        self.bridge.total_frames()
    }

    pub fn drop_rate(&self) -> f64 {
        self.bridge.stats().drop_rate()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
