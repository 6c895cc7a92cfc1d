use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::CameraBackend;
use crate::capture::negotiate::VideoMode;
use crate::capture::session::CaptureSession;
use crate::{BridgeError, Result};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Opaque id, stable for the lifetime of the device
    pub id: String,
    pub display_name: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Enumerates native devices and hands out capture sessions
pub struct DeviceRegistry {
    backend: Arc<dyn CameraBackend>,
    snapshot: Mutex<Vec<DeviceDescriptor>>,
    default_mode: VideoMode,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            snapshot: Mutex::new(Vec::new()),
            default_mode: VideoMode::default(),
        }
    }

    /// Mode requested by sessions that start without explicit negotiation.
    pub fn with_default_mode(mut self, mode: VideoMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CameraBackend> {
        &self.backend
    }

    /// Query the native framework again and replace the snapshot.
    ///
    /// Ids are unique in the result; order follows the backend and may
    /// change between calls.
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut seen = HashSet::new();
        let devices: Vec<_> = self
            .backend
            .enumerate()?
            .into_iter()
            .filter(|device| {
                let fresh = seen.insert(device.id.clone());
                if !fresh {
                    warn!("Ignoring duplicate device id {}", device.id);
                }
                fresh
            })
            .collect();

        info!(
            "Enumerated {} device(s) via {}",
            devices.len(),
            self.backend.name()
        );
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = devices.clone();
        Ok(devices)
    }

    /// Look up a device in the last snapshot without re-enumerating.
    pub fn find(&self, id: &str) -> Option<DeviceDescriptor> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|device| device.id == id)
            .cloned()
    }

    /// Bind a fresh session to a currently attached device.
    pub fn select_device(&self, id: &str) -> Result<CaptureSession> {
        let device = self
            .list_devices()?
            .into_iter()
            .find(|device| device.id == id)
            .ok_or_else(|| BridgeError::DeviceNotFound { id: id.to_owned() })?;

        info!("Selected device: {} ({})", device.display_name, device.id);
        let session = CaptureSession::new(Arc::clone(&self.backend), self.default_mode);
        session.bind_device(device)?;
        Ok(session)
    }

    /// Select whatever device enumerates first.
    pub fn select_first(&self) -> Result<CaptureSession> {
        let first = self
            .list_devices()?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::DeviceNotFound { id: String::new() })?;
        self.select_device(&first.id)
    }
}
