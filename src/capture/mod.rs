pub mod device;
pub mod frame;
pub mod negotiate;
pub mod session;

pub use device::{DeviceDescriptor, DeviceRegistry};
pub use frame::Frame;
pub use frame::FrameMetadata;
pub use frame::PixelFormat;
pub use negotiate::{negotiate, VideoMode};
pub use session::{CaptureSession, SessionState};
