// src/sink.rs
use std::sync::Arc;

use image::RgbaImage;
use log::{debug, error};

use crate::segmentation::{SegmentationEvent, Timings};

pub const NO_DETECTIONS_MSG: &str = "No objects detected for segmentation";

/// The three timing labels, in whole milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingLabels {
    pub preprocess: String,
    pub inference: String,
    pub postprocess: String,
}

impl From<Timings> for TimingLabels {
    fn from(t: Timings) -> Self {
        Self {
            preprocess: t.preprocess.as_millis().to_string(),
            inference: t.inference.as_millis().to_string(),
            postprocess: t.postprocess.as_millis().to_string(),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SinkOutcome {
    pub overlay_changed: bool,
    pub notice: Option<String>,
}

/// UI-side owner of the latest raw frame, overlay and timing labels.
#[derive(Debug, Default)]
pub struct ResultSink {
    last_frame: Option<Arc<RgbaImage>>,
    overlay: Option<Arc<RgbaImage>>,
    timings: TimingLabels,
    instances: usize,
}

impl ResultSink {
    pub fn apply(&mut self, event: SegmentationEvent) -> SinkOutcome {
        match event {
            SegmentationEvent::Detected {
                frame,
                overlay,
                instances,
                timings,
            } => {
                debug!("Segmentation successful, {} instances.", instances);
                self.last_frame = Some(frame);
                self.overlay = Some(overlay);
                self.timings = timings.into();
                self.instances = instances;
                SinkOutcome {
                    overlay_changed: true,
                    notice: None,
                }
            }
            SegmentationEvent::Empty { frame } => {
                self.last_frame = Some(frame);
                self.instances = 0;
                let had_overlay = self.overlay.take().is_some();
                SinkOutcome {
                    overlay_changed: had_overlay,
                    notice: Some(NO_DETECTIONS_MSG.to_string()),
                }
            }
            SegmentationEvent::Error(message) => {
                error!("Segmentation error: {}", message);
                SinkOutcome {
                    overlay_changed: false,
                    notice: Some(message),
                }
            }
        }
    }

    pub fn last_frame(&self) -> Option<&RgbaImage> {
        self.last_frame.as_deref()
    }

    pub fn overlay(&self) -> Option<&RgbaImage> {
        self.overlay.as_deref()
    }

    pub fn timings(&self) -> &TimingLabels {
        &self.timings
    }

    pub fn instances(&self) -> usize {
        self.instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::time::Duration;

    fn detected(pre: u64, infer: u64, post: u64) -> SegmentationEvent {
        SegmentationEvent::Detected {
            frame: Arc::new(RgbaImage::new(4, 4)),
            overlay: Arc::new(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 4]))),
            instances: 2,
            timings: Timings {
                preprocess: Duration::from_millis(pre),
                inference: Duration::from_millis(infer),
                postprocess: Duration::from_millis(post),
            },
        }
    }

    #[test]
    fn detection_sets_overlay_and_exact_timings() {
        let mut sink = ResultSink::default();
        let outcome = sink.apply(detected(12, 87, 5));
        assert!(outcome.overlay_changed);
        assert_eq!(outcome.notice, None);
        assert!(sink.overlay().is_some());
        assert!(sink.last_frame().is_some());
        assert_eq!(
            sink.timings(),
            &TimingLabels {
                preprocess: "12".into(),
                inference: "87".into(),
                postprocess: "5".into(),
            }
        );
        assert_eq!(sink.instances(), 2);
    }

    #[test]
    fn empty_clears_overlay_and_notifies() {
        let mut sink = ResultSink::default();
        sink.apply(detected(1, 2, 3));
        let outcome = sink.apply(SegmentationEvent::Empty {
            frame: Arc::new(RgbaImage::new(4, 4)),
        });
        assert!(outcome.overlay_changed);
        assert_eq!(outcome.notice.as_deref(), Some(NO_DETECTIONS_MSG));
        assert!(sink.overlay().is_none());
        assert!(sink.last_frame().is_some());
    }

    #[test]
    fn repeated_empty_keeps_overlay_absent() {
        let mut sink = ResultSink::default();
        for _ in 0..3 {
            let outcome = sink.apply(SegmentationEvent::Empty {
                frame: Arc::new(RgbaImage::new(2, 2)),
            });
            assert!(!outcome.overlay_changed);
            assert!(sink.overlay().is_none());
        }
    }

    #[test]
    fn error_is_surfaced_without_touching_state() {
        let mut sink = ResultSink::default();
        sink.apply(detected(1, 2, 3));
        let outcome = sink.apply(SegmentationEvent::Error("model crashed".into()));
        assert_eq!(outcome.notice.as_deref(), Some("model crashed"));
        assert!(!outcome.overlay_changed);
        assert!(sink.overlay().is_some());
    }
}
