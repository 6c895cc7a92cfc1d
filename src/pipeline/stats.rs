//! Frame statistics derived from mailbox counters

use std::time::Instant;

/// Point-in-time counters for one capture session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub total_frames: u64,
    pub dropped_frames: u64,
    /// Publish rate between the first and the last accepted frame.
    pub observed_fps: f64,
    /// A frame is waiting in the mailbox.
    pub pending: bool,
}

impl FrameStats {
    pub fn new(
        total_frames: u64,
        dropped_frames: u64,
        publish_window: Option<(Instant, Instant)>,
        pending: bool,
    ) -> Self {
        let observed_fps = match publish_window {
            Some((first, last)) if total_frames > 1 => {
                let span = last.saturating_duration_since(first).as_secs_f64();
                if span > 0.0 {
                    (total_frames - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        Self {
            total_frames,
            dropped_frames,
            observed_fps,
            pending,
        }
    }

    /// Fraction of delivered frames nobody read, in `[0, 1]`.
    pub fn drop_rate(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        (self.dropped_frames as f64 / self.total_frames as f64).clamp(0.0, 1.0)
    }

    /// Frames that reached a consumer.
    pub fn consumed_frames(&self) -> u64 {
        self.total_frames
            .saturating_sub(self.dropped_frames)
            .saturating_sub(u64::from(self.pending))
    }

    /// Export as gauges labelled by device id
    pub fn publish_metrics(&self, device: &str) {
        let device = device.to_owned();
        metrics::gauge!("hermes_frames_total", "device" => device.clone())
            .set(self.total_frames as f64);
        metrics::gauge!("hermes_frames_dropped", "device" => device.clone())
            .set(self.dropped_frames as f64);
        metrics::gauge!("hermes_drop_rate", "device" => device.clone()).set(self.drop_rate());
        metrics::gauge!("hermes_observed_fps", "device" => device).set(self.observed_fps);
    }
}
