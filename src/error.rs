//! Error taxonomy for the capture bridge

use thiserror::Error;

use crate::capture::session::SessionState;

/// Errors surfaced by the capture bridge.
///
/// Enumeration, configuration and start errors are kept distinct so a caller
/// can decide between picking another device, picking another format, or
/// giving up on the hardware.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The native camera subsystem could not be queried.
    #[error("device enumeration failed: {0}")]
    DeviceEnumeration(String),

    /// The id does not match a currently enumerated device.
    #[error("device '{id}' not found")]
    DeviceNotFound { id: String },

    /// The device offers no mode that can satisfy the request.
    #[error("device '{id}' reports no usable format")]
    UnsupportedFormat { id: String },

    /// The device is already streaming to someone else.
    #[error("device '{id}' is busy")]
    DeviceBusy { id: String },

    /// The native framework refused to start streaming.
    #[error("native start failed: {0}")]
    NativeStart(String),

    /// Non-blocking grab found an empty mailbox.
    #[error("no frame available")]
    NoFrameAvailable,

    /// No frame arrived before the deadline.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// The stream was stopped (or never started) while waiting.
    #[error("capture session is not running")]
    Stopped,

    /// Buffer index out of range, or no buffer to fill.
    #[error("invalid buffer request: {0}")]
    InvalidBuffer(String),

    #[error("cannot {op} while session is {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the same call may succeed later without the caller changing
    /// anything. Retrying is always up to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeviceBusy { .. } | Self::NativeStart(_) | Self::NoFrameAvailable | Self::Timeout
        )
    }

    /// Errno a V4L2 caller would see for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            Self::DeviceEnumeration(_) => libc::ENODEV,
            Self::DeviceNotFound { .. } => libc::ENOENT,
            Self::UnsupportedFormat { .. }
            | Self::InvalidBuffer(_)
            | Self::InvalidState { .. }
            | Self::Config(_) => libc::EINVAL,
            Self::DeviceBusy { .. } => libc::EBUSY,
            Self::NativeStart(_) => libc::EIO,
            Self::NoFrameAvailable => libc::EAGAIN,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Stopped => libc::EPIPE,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_are_transient_ones() {
        assert!(BridgeError::DeviceBusy { id: "cam".into() }.is_retryable());
        assert!(BridgeError::Timeout.is_retryable());
        assert!(!BridgeError::DeviceNotFound { id: "cam".into() }.is_retryable());
        assert!(!BridgeError::UnsupportedFormat { id: "cam".into() }.is_retryable());
    }

    #[test]
    fn errno_mapping_matches_v4l2_expectations() {
        assert_eq!(BridgeError::NoFrameAvailable.errno(), libc::EAGAIN);
        assert_eq!(BridgeError::DeviceBusy { id: "x".into() }.errno(), libc::EBUSY);
        assert_eq!(BridgeError::DeviceNotFound { id: "x".into() }.errno(), libc::ENOENT);
        let io = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(BridgeError::Io(io).errno(), libc::EACCES);
    }
}
