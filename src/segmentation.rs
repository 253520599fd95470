// src/segmentation.rs
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use image::{GrayImage, RgbaImage};
use log::{debug, error, info, warn};

const FRAME_WAIT: Duration = Duration::from_millis(50);

/// Axis-aligned box in upright frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        }
        .area();
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detected instance. `mask` has the frame's dimensions, non-zero inside.
#[derive(Debug, Clone)]
pub struct SegmentationResult {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub mask: GrayImage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    pub preprocess: Duration,
    pub inference: Duration,
    pub postprocess: Duration,
}

#[derive(Debug, Clone)]
pub struct Segmentation {
    pub results: Vec<SegmentationResult>,
    pub timings: Timings,
}

/// Runs a segmentation model on one upright frame.
pub trait InstanceSegmenter: Send {
    fn segment(&mut self, frame: &RgbaImage) -> anyhow::Result<Segmentation>;
}

/// Draws results onto a transparent canvas of the given size.
pub trait OverlayRenderer: Send {
    fn render(&mut self, results: &[SegmentationResult], width: u32, height: u32) -> RgbaImage;
}

/// What the worker reports to the UI for every analyzed frame.
#[derive(Debug)]
pub enum SegmentationEvent {
    Detected {
        frame: Arc<RgbaImage>,
        overlay: Arc<RgbaImage>,
        instances: usize,
        timings: Timings,
    },
    Empty {
        frame: Arc<RgbaImage>,
    },
    Error(String),
}

pub fn analyze_frame<S, R>(segmenter: &mut S, renderer: &mut R, frame: Arc<RgbaImage>) -> SegmentationEvent
where
    S: InstanceSegmenter + ?Sized,
    R: OverlayRenderer + ?Sized,
{
    match segmenter.segment(&frame) {
        Ok(segmentation) if segmentation.results.is_empty() => {
            debug!("No instances detected.");
            SegmentationEvent::Empty { frame }
        }
        Ok(segmentation) => {
            if let Some(top) = segmentation
                .results
                .iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            {
                debug!(
                    "{} instances, top: {} ({:.2})",
                    segmentation.results.len(),
                    top.class_name,
                    top.confidence
                );
            }
            let (width, height) = frame.dimensions();
            let overlay = renderer.render(&segmentation.results, width, height);
            SegmentationEvent::Detected {
                frame,
                overlay: Arc::new(overlay),
                instances: segmentation.results.len(),
                timings: segmentation.timings,
            }
        }
        Err(e) => {
            warn!("Segmentation failed: {:#}", e);
            SegmentationEvent::Error(format!("Segmentation failed: {}", e))
        }
    }
}

pub type SegmenterFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn InstanceSegmenter>> + Send>;

pub fn start_segmentation_thread(
    ui_sender: Sender<SegmentationEvent>,
    frame_receiver: Receiver<Arc<RgbaImage>>,
    stop_signal: Arc<AtomicBool>,
    ctx: egui::Context,
    load_segmenter: SegmenterFactory,
    renderer: Box<dyn OverlayRenderer>,
) -> JoinHandle<()> {
    info!("Spawning segmentation thread");
    thread::spawn(move || {
        segmentation_loop(ui_sender, frame_receiver, stop_signal, ctx, load_segmenter, renderer);
    })
}

fn segmentation_loop(
    ui_sender: Sender<SegmentationEvent>,
    frame_receiver: Receiver<Arc<RgbaImage>>,
    stop_signal: Arc<AtomicBool>,
    ctx: egui::Context,
    load_segmenter: SegmenterFactory,
    mut renderer: Box<dyn OverlayRenderer>,
) {
    info!("Segmentation loop started.");

    let mut segmenter = match load_segmenter() {
        Ok(s) => {
            info!("Segmentation model loaded successfully.");
            s
        }
        Err(e) => {
            let error_msg = format!("Failed to load model: {:#}", e);
            error!("{}", error_msg);
            let _ = ui_sender.send(SegmentationEvent::Error(error_msg));
            ctx.request_repaint();
            return;
        }
    };

    while !stop_signal.load(Ordering::Relaxed) {
        let frame = match frame_receiver.recv_timeout(FRAME_WAIT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("Frame source disconnected. Stopping segmentation loop.");
                break;
            }
        };

        let loop_start_time = Instant::now();
        let event = analyze_frame(segmenter.as_mut(), renderer.as_mut(), frame);
        match ui_sender.try_send(event) {
            Ok(_) => ctx.request_repaint(),
            Err(TrySendError::Full(_)) => {
                warn!("UI channel full. Dropping segmentation result.");
            }
            Err(TrySendError::Disconnected(_)) => {
                info!("UI receiver disconnected. Stopping segmentation loop.");
                break;
            }
        }
        debug!("Segmentation processed frame in {:?}", loop_start_time.elapsed());
    }

    info!("Segmentation loop finishing (stop signal received or channel disconnected).");
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    struct ScriptedSegmenter {
        outcome: Option<anyhow::Result<Segmentation>>,
    }

    impl InstanceSegmenter for ScriptedSegmenter {
        fn segment(&mut self, _frame: &RgbaImage) -> anyhow::Result<Segmentation> {
            self.outcome.take().expect("segmenter called more than once")
        }
    }

    #[derive(Default)]
    struct CountingRenderer {
        calls: usize,
    }

    impl OverlayRenderer for CountingRenderer {
        fn render(&mut self, _results: &[SegmentationResult], width: u32, height: u32) -> RgbaImage {
            self.calls += 1;
            RgbaImage::from_pixel(width, height, Rgba([0, 255, 0, 128]))
        }
    }

    fn result_for(width: u32, height: u32) -> SegmentationResult {
        SegmentationResult {
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: width as f32,
                y2: height as f32,
            },
            class_id: 0,
            class_name: "person".into(),
            confidence: 0.9,
            mask: GrayImage::from_pixel(width, height, image::Luma([255])),
        }
    }

    fn timings() -> Timings {
        Timings {
            preprocess: Duration::from_millis(3),
            inference: Duration::from_millis(41),
            postprocess: Duration::from_millis(7),
        }
    }

    #[test]
    fn empty_result_skips_rendering() {
        let mut segmenter = ScriptedSegmenter {
            outcome: Some(Ok(Segmentation {
                results: Vec::new(),
                timings: timings(),
            })),
        };
        let mut renderer = CountingRenderer::default();
        let frame = Arc::new(RgbaImage::new(4, 4));
        let event = analyze_frame(&mut segmenter, &mut renderer, frame.clone());
        assert_eq!(renderer.calls, 0);
        match event {
            SegmentationEvent::Empty { frame: f } => assert!(Arc::ptr_eq(&f, &frame)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn detection_renders_once_and_passes_timings() {
        let mut segmenter = ScriptedSegmenter {
            outcome: Some(Ok(Segmentation {
                results: vec![result_for(4, 3), result_for(4, 3)],
                timings: timings(),
            })),
        };
        let mut renderer = CountingRenderer::default();
        let event = analyze_frame(&mut segmenter, &mut renderer, Arc::new(RgbaImage::new(4, 3)));
        assert_eq!(renderer.calls, 1);
        match event {
            SegmentationEvent::Detected {
                overlay,
                instances,
                timings: t,
                ..
            } => {
                assert_eq!(overlay.dimensions(), (4, 3));
                assert_eq!(instances, 2);
                assert_eq!(t, timings());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn model_error_becomes_error_event() {
        let mut segmenter = ScriptedSegmenter {
            outcome: Some(Err(anyhow::anyhow!("tensor shape mismatch"))),
        };
        let mut renderer = CountingRenderer::default();
        let event = analyze_frame(&mut segmenter, &mut renderer, Arc::new(RgbaImage::new(2, 2)));
        assert_eq!(renderer.calls, 0);
        match event {
            SegmentationEvent::Error(msg) => assert!(msg.contains("tensor shape mismatch")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn iou_of_overlapping_boxes() {
        let a = BoundingBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 };
        let b = BoundingBox { x1: 5.0, y1: 0.0, x2: 15.0, y2: 10.0 };
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        let far = BoundingBox { x1: 20.0, y1: 20.0, x2: 30.0, y2: 30.0 };
        assert_eq!(a.iou(&far), 0.0);
    }
}
