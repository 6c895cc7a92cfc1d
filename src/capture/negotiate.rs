//! Map a requested capture mode onto the closest one a device supports

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::frame::PixelFormat;

/// Resolution, frame rate and pixel format of a stream.
///
/// Used for requests, for accepted configurations, and for the capability
/// tuples a backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

impl VideoMode {
    pub const fn new(width: u32, height: u32, fps: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            fps,
            format,
        }
    }

    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl Default for VideoMode {
    fn default() -> Self {
        Self::new(640, 480, 30, PixelFormat::Yuyv)
    }
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{} {}",
            self.width, self.height, self.fps, self.format
        )
    }
}

const FORMAT_MISMATCH_COST: f64 = 0.1;
const FORMAT_RANK_COST: f64 = 0.05;

/// Relative distance on one axis; a zero request means "any".
fn relative_gap(candidate: u64, requested: u64) -> f64 {
    if requested == 0 {
        return 0.0;
    }
    candidate.abs_diff(requested) as f64 / requested as f64
}

fn cost(candidate: &VideoMode, requested: &VideoMode) -> f64 {
    let format = if candidate.format == requested.format {
        0.0
    } else {
        FORMAT_MISMATCH_COST + FORMAT_RANK_COST * f64::from(candidate.format.preference_rank())
    };
    relative_gap(candidate.area(), requested.area())
        + relative_gap(u64::from(candidate.fps), u64::from(requested.fps))
        + format
}

/// Pick the supported mode closest to `requested`.
///
/// An exact match always wins. Otherwise the weighted distance over area,
/// frame rate and format preference decides; ties go to the larger area,
/// then the higher fps, then the cheaper format, then capability order.
/// Returns `None` when `supported` is empty.
pub fn negotiate(supported: &[VideoMode], requested: &VideoMode) -> Option<VideoMode> {
    if supported.contains(requested) {
        debug!("Exact mode match: {}", requested);
        return Some(*requested);
    }

    let best = supported
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| {
            cost(a, requested)
                .partial_cmp(&cost(b, requested))
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.area().cmp(&a.area()))
                .then_with(|| b.fps.cmp(&a.fps))
                .then_with(|| a.format.preference_rank().cmp(&b.format.preference_rank()))
                .then_with(|| ia.cmp(ib))
        })
        .map(|(_, mode)| *mode)?;

    debug!("Requested {} -> accepted {}", requested, best);
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_only_supported_mode() {
        let supported = [VideoMode::new(1280, 720, 30, PixelFormat::Yuyv)];
        let requested = VideoMode::new(1920, 1080, 30, PixelFormat::Mjpeg);
        assert_eq!(negotiate(&supported, &requested), Some(supported[0]));
    }

    #[test]
    fn exact_match_is_returned_unchanged() {
        let supported = [
            VideoMode::new(1280, 720, 30, PixelFormat::Mjpeg),
            VideoMode::new(640, 480, 30, PixelFormat::Yuyv),
            VideoMode::new(640, 480, 15, PixelFormat::Yuyv),
        ];
        let requested = VideoMode::new(640, 480, 30, PixelFormat::Yuyv);
        assert_eq!(negotiate(&supported, &requested), Some(requested));
    }

    #[test]
    fn empty_capability_list_yields_nothing() {
        assert_eq!(negotiate(&[], &VideoMode::default()), None);
    }

    #[test]
    fn resolution_outweighs_format() {
        let supported = [
            VideoMode::new(1920, 1080, 30, PixelFormat::Yuyv),
            VideoMode::new(640, 480, 30, PixelFormat::Mjpeg),
        ];
        let requested = VideoMode::new(640, 480, 30, PixelFormat::Yuyv);
        assert_eq!(negotiate(&supported, &requested), Some(supported[1]));
    }

    #[test]
    fn uncompressed_preferred_when_format_is_unavailable() {
        let supported = [
            VideoMode::new(640, 480, 30, PixelFormat::Mjpeg),
            VideoMode::new(640, 480, 30, PixelFormat::Uyvy),
        ];
        let requested = VideoMode::new(640, 480, 30, PixelFormat::Rgb24);
        assert_eq!(negotiate(&supported, &requested), Some(supported[1]));
    }

    #[test]
    fn requested_format_wins_over_cheaper_one() {
        let supported = [
            VideoMode::new(1280, 720, 30, PixelFormat::Yuyv),
            VideoMode::new(1280, 720, 30, PixelFormat::Mjpeg),
        ];
        let requested = VideoMode::new(1920, 1080, 30, PixelFormat::Mjpeg);
        assert_eq!(negotiate(&supported, &requested), Some(supported[1]));
    }

    #[test]
    fn closest_fps_is_chosen() {
        let supported = [
            VideoMode::new(640, 480, 5, PixelFormat::Yuyv),
            VideoMode::new(640, 480, 25, PixelFormat::Yuyv),
            VideoMode::new(640, 480, 60, PixelFormat::Yuyv),
        ];
        let requested = VideoMode::new(640, 480, 30, PixelFormat::Yuyv);
        assert_eq!(negotiate(&supported, &requested), Some(supported[1]));
    }

    #[test]
    fn equal_cost_prefers_larger_area() {
        // both candidates are 50% off the requested area
        let supported = [
            VideoMode::new(400, 400, 30, PixelFormat::Yuyv),
            VideoMode::new(800, 600, 30, PixelFormat::Yuyv),
        ];
        let requested = VideoMode::new(800, 400, 30, PixelFormat::Yuyv);
        assert_eq!(negotiate(&supported, &requested), Some(supported[1]));
    }

    #[test]
    fn zero_fields_mean_any() {
        let supported = [
            VideoMode::new(320, 240, 15, PixelFormat::Grey),
            VideoMode::new(320, 240, 15, PixelFormat::Yuyv),
        ];
        let requested = VideoMode::new(0, 0, 0, PixelFormat::Yuyv);
        assert_eq!(negotiate(&supported, &requested), Some(supported[1]));
    }
}
