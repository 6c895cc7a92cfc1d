pub mod mailbox;
pub mod stats;

pub use mailbox::FrameBridge;
pub use stats::FrameStats;
