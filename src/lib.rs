//! Hermes: camera capture bridge
//!
//! Turns a callback-driven camera framework into a poll/wait capture device:
//! enumerate devices, negotiate a mode, start a stream, then grab or wait for
//! the newest frame while drops are counted.

pub mod backend;
pub mod capture;
pub mod compat;
pub mod error;
pub mod pipeline;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{CameraBackend, SyntheticBackend, SyntheticDevice};

pub use capture::{
    CaptureSession, DeviceDescriptor, DeviceRegistry, Frame, FrameMetadata, PixelFormat,
    SessionState, VideoMode,
};
pub use error::{BridgeError, Result};
pub use pipeline::{FrameBridge, FrameStats};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub backend: BackendKind,
    pub synthetic: SyntheticConfig,
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device id to open; first enumerated device when unset
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub devices: Vec<SyntheticDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub wait_timeout_ms: u64,
    pub stats_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuyv,
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            devices: vec![SyntheticDevice::webcam("synthetic:0", "Synthetic Camera")],
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 1000,
            stats_interval_ms: 2000,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `HERMES__SECTION__KEY`
    /// environment overrides. Missing keys keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("hermes").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("HERMES")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Mode sessions request unless negotiated otherwise
    pub fn requested_mode(&self) -> VideoMode {
        VideoMode::new(
            self.capture.width,
            self.capture.height,
            self.capture.fps,
            self.capture.format,
        )
    }

    pub fn build_backend(&self) -> Result<Arc<dyn CameraBackend>> {
        match self.backend {
            BackendKind::Synthetic => Ok(Arc::new(SyntheticBackend::new(
                self.synthetic.devices.clone(),
            ))),
            #[cfg(feature = "v4l2")]
            BackendKind::V4l2 => Ok(Arc::new(backend::v4l2::V4l2Backend::new())),
            #[cfg(not(feature = "v4l2"))]
            BackendKind::V4l2 => Err(BridgeError::DeviceEnumeration(
                "built without the v4l2 feature".into(),
            )),
        }
    }

    pub fn registry(&self) -> Result<DeviceRegistry> {
        Ok(DeviceRegistry::new(self.build_backend()?).with_default_mode(self.requested_mode()))
    }
}
