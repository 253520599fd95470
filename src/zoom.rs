// src/zoom.rs
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

/// Zoom bounds reported by the camera once it is bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomRange {
    pub min_ratio: f32,
    pub max_ratio: f32,
}

impl ZoomRange {
    pub fn clamp(&self, ratio: f32) -> f32 {
        ratio.clamp(self.min_ratio, self.max_ratio)
    }
}

/// Maps slider progress in `0..=slider_max` linearly onto the zoom range.
pub fn ratio_for_progress(progress: u32, slider_max: u32, range: ZoomRange) -> f32 {
    if slider_max == 0 || progress == 0 {
        return range.min_ratio;
    }
    if progress >= slider_max {
        return range.max_ratio;
    }
    let t = progress as f32 / slider_max as f32;
    range.min_ratio + t * (range.max_ratio - range.min_ratio)
}

#[derive(Debug, Clone)]
pub struct ZoomSlider {
    max: u32,
    progress: u32,
}

impl ZoomSlider {
    pub fn new(max: u32) -> Self {
        Self { max, progress: 0 }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn reset(&mut self) {
        self.progress = 0;
    }

    pub fn set_progress(&mut self, progress: u32) {
        self.progress = progress.min(self.max);
    }

    pub fn ratio(&self, range: ZoomRange) -> f32 {
        ratio_for_progress(self.progress, self.max, range)
    }
}

/// Current zoom ratio shared between the UI and the capture thread.
#[derive(Debug, Clone)]
pub struct ZoomHandle {
    bits: Arc<AtomicU32>,
    range: ZoomRange,
}

impl ZoomHandle {
    pub fn new(range: ZoomRange) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(range.min_ratio.to_bits())),
            range,
        }
    }

    pub fn range(&self) -> ZoomRange {
        self.range
    }

    pub fn set_ratio(&self, ratio: f32) {
        let ratio = self.range.clamp(ratio);
        self.bits.store(ratio.to_bits(), Ordering::Relaxed);
    }

    pub fn ratio(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: ZoomRange = ZoomRange {
        min_ratio: 1.3,
        max_ratio: 7.9,
    };

    #[test]
    fn endpoints_map_exactly() {
        assert_eq!(ratio_for_progress(0, 100, RANGE), 1.3);
        assert_eq!(ratio_for_progress(100, 100, RANGE), 7.9);
    }

    #[test]
    fn midpoint_is_linear() {
        let mid = ratio_for_progress(50, 100, RANGE);
        assert!((mid - 4.6).abs() < 1e-5, "got {}", mid);
        let quarter = ratio_for_progress(25, 100, RANGE);
        assert!((quarter - 2.95).abs() < 1e-5, "got {}", quarter);
    }

    #[test]
    fn slider_clamps_progress() {
        let mut slider = ZoomSlider::new(10);
        slider.set_progress(25);
        assert_eq!(slider.progress(), 10);
        assert_eq!(slider.ratio(RANGE), 7.9);
        slider.reset();
        assert_eq!(slider.ratio(RANGE), 1.3);
    }

    #[test]
    fn handle_clamps_and_shares() {
        let handle = ZoomHandle::new(ZoomRange {
            min_ratio: 1.0,
            max_ratio: 4.0,
        });
        let other = handle.clone();
        assert_eq!(other.ratio(), 1.0);
        handle.set_ratio(9.0);
        assert_eq!(other.ratio(), 4.0);
        handle.set_ratio(2.5);
        assert_eq!(other.ratio(), 2.5);
    }
}
