// src/model.rs
//! YOLO-seg ONNX backend for [`InstanceSegmenter`].
//!
//! Expects the standard export layout: `output0` is `[1, 4 + nc + nm, anchors]`
//! (box centre/size in letterboxed input pixels, class scores, mask
//! coefficients) and `output1` is `[1, nm, mh, mw]` mask prototypes.

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops, GrayImage, Luma, RgbaImage};
use log::{debug, info};
use ndarray::{Array1, Array4, ArrayView2, ArrayView3, Axis, Ix3, Ix4};
use ort::session::{builder::GraphOptimizationLevel, Session};

use crate::{
    config::ModelConfig,
    segmentation::{BoundingBox, InstanceSegmenter, Segmentation, SegmentationResult, Timings},
};

const LETTERBOX_FILL: f32 = 114.0 / 255.0;
const MAX_DETECTIONS: usize = 300;

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Square model input with the frame scaled to fit and centred.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Letterbox {
    pub size: u32,
    pub scale: f32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            size,
            scale,
            scaled_width,
            scaled_height,
            pad_x: (size - scaled_width) / 2,
            pad_y: (size - scaled_height) / 2,
        }
    }

    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }

    pub fn to_input(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale + self.pad_x as f32,
            y * self.scale + self.pad_y as f32,
        )
    }

    /// NCHW RGB tensor in `[0, 1]`, padded with the usual grey.
    pub fn tensor(&self, frame: &RgbaImage) -> Array4<f32> {
        let size = self.size as usize;
        let resized = imageops::resize(
            frame,
            self.scaled_width,
            self.scaled_height,
            imageops::FilterType::Triangle,
        );
        let mut input = Array4::<f32>::from_elem((1, 3, size, size), LETTERBOX_FILL);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let ix = (x + self.pad_x) as usize;
            let iy = (y + self.pad_y) as usize;
            for c in 0..3 {
                input[[0, c, iy, ix]] = pixel[c] as f32 / 255.0;
            }
        }
        input
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub confidence: f32,
    pub coeffs: Vec<f32>,
}

/// Reads `[4 + nc + nm, anchors]` predictions into frame-space candidates.
pub(crate) fn decode_candidates(
    preds: ArrayView2<'_, f32>,
    num_masks: usize,
    letterbox: &Letterbox,
    frame_width: u32,
    frame_height: u32,
    confidence: f32,
) -> Result<Vec<Candidate>> {
    let rows = preds.shape()[0];
    if rows <= 4 + num_masks {
        bail!(
            "prediction tensor has {} rows, need more than {} (4 box + {} mask coefficients)",
            rows,
            4 + num_masks,
            num_masks
        );
    }
    let num_classes = rows - 4 - num_masks;
    let (fw, fh) = (frame_width as f32, frame_height as f32);

    let mut candidates = Vec::new();
    for (anchor, column) in preds.axis_iter(Axis(1)).enumerate() {
        let (class_id, score) = (0..num_classes)
            .map(|c| (c, column[4 + c]))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < confidence {
            continue;
        }
        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        let (x1, y1) = letterbox.to_frame(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_frame(cx + w / 2.0, cy + h / 2.0);
        let bbox = BoundingBox {
            x1: x1.clamp(0.0, fw),
            y1: y1.clamp(0.0, fh),
            x2: x2.clamp(0.0, fw),
            y2: y2.clamp(0.0, fh),
        };
        if bbox.area() <= 0.0 {
            debug!("Anchor {} collapsed after clipping; skipped.", anchor);
            continue;
        }
        let coeffs = (0..num_masks)
            .map(|k| column[4 + num_classes + k])
            .collect();
        candidates.push(Candidate {
            bbox,
            class_id,
            confidence: score,
            coeffs,
        });
    }
    Ok(candidates)
}

/// Class-aware greedy NMS, highest confidence first.
pub(crate) fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
            if kept.len() == MAX_DETECTIONS {
                break;
            }
        }
    }
    kept
}

/// Frame-sized binary mask: `sigmoid(coeffs · protos)` sampled inside the box.
pub(crate) fn build_mask(
    coeffs: &[f32],
    protos: ArrayView3<'_, f32>,
    bbox: &BoundingBox,
    letterbox: &Letterbox,
    frame_width: u32,
    frame_height: u32,
    threshold: f32,
) -> Result<GrayImage> {
    let (num_masks, mh, mw) = protos.dim();
    if coeffs.len() != num_masks {
        bail!(
            "{} mask coefficients for {} prototypes",
            coeffs.len(),
            num_masks
        );
    }
    if mh == 0 || mw == 0 {
        bail!("empty mask prototypes ({}x{})", mw, mh);
    }
    let flat = protos
        .to_shape((num_masks, mh * mw))
        .context("flattening mask prototypes")?;
    let logits = Array1::from(coeffs.to_vec()).dot(&flat);

    let proto_scale_x = mw as f32 / letterbox.size as f32;
    let proto_scale_y = mh as f32 / letterbox.size as f32;
    let mut mask = GrayImage::new(frame_width, frame_height);
    let x0 = bbox.x1.floor().max(0.0) as u32;
    let y0 = bbox.y1.floor().max(0.0) as u32;
    let x1 = (bbox.x2.ceil() as u32).min(frame_width);
    let y1 = (bbox.y2.ceil() as u32).min(frame_height);
    for y in y0..y1 {
        for x in x0..x1 {
            let (ix, iy) = letterbox.to_input(x as f32 + 0.5, y as f32 + 0.5);
            let mx = ((ix * proto_scale_x) as usize).min(mw - 1);
            let my = ((iy * proto_scale_y) as usize).min(mh - 1);
            let logit = logits[my * mw + mx];
            if sigmoid(logit) > threshold {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
    Ok(mask)
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub struct OnnxSegmenter {
    session: Session,
    input_name: String,
    pred_output: String,
    proto_output: String,
    input_size: u32,
    confidence: f32,
    iou: f32,
    mask_threshold: f32,
    class_names: Vec<String>,
}

impl OnnxSegmenter {
    pub fn load(config: &ModelConfig) -> Result<Self> {
        info!("Loading segmentation model from {}", config.path.display());
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(&config.path)
            .with_context(|| format!("Failed to load ONNX model {}", config.path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| anyhow!("model has no inputs"))?;
        if session.outputs.len() < 2 {
            bail!(
                "expected a segmentation model with 2 outputs, found {}",
                session.outputs.len()
            );
        }
        let pred_output = session.outputs[0].name.clone();
        let proto_output = session.outputs[1].name.clone();
        info!(
            "Model input '{}', outputs '{}' / '{}'",
            input_name, pred_output, proto_output
        );

        let class_names = if config.class_names.is_empty() {
            COCO_CLASSES.iter().map(|s| s.to_string()).collect()
        } else {
            config.class_names.clone()
        };

        Ok(Self {
            session,
            input_name,
            pred_output,
            proto_output,
            input_size: config.input_size,
            confidence: config.confidence,
            iou: config.iou,
            mask_threshold: config.mask_threshold,
            class_names,
        })
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class {}", class_id))
    }
}

impl InstanceSegmenter for OnnxSegmenter {
    fn segment(&mut self, frame: &RgbaImage) -> Result<Segmentation> {
        let (width, height) = frame.dimensions();

        let stage = Instant::now();
        let letterbox = Letterbox::fit(width, height, self.input_size);
        let input = letterbox.tensor(frame);
        let preprocess = stage.elapsed();

        let stage = Instant::now();
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input.view()]?)?;
        let inference = stage.elapsed();

        let stage = Instant::now();
        let preds = outputs[self.pred_output.as_str()]
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix3>()?;
        let protos = outputs[self.proto_output.as_str()]
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix4>()?;
        let protos = protos.index_axis(Axis(0), 0);
        let num_masks = protos.dim().0;

        let candidates = decode_candidates(
            preds.index_axis(Axis(0), 0),
            num_masks,
            &letterbox,
            width,
            height,
            self.confidence,
        )?;
        let kept = non_max_suppression(candidates, self.iou);
        let results = kept
            .into_iter()
            .map(|c| {
                let mask = build_mask(
                    &c.coeffs,
                    protos.view(),
                    &c.bbox,
                    &letterbox,
                    width,
                    height,
                    self.mask_threshold,
                )?;
                Ok(SegmentationResult {
                    bbox: c.bbox,
                    class_id: c.class_id,
                    class_name: self.class_name(c.class_id),
                    confidence: c.confidence,
                    mask,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let postprocess = stage.elapsed();

        debug!(
            "{} instances (pre {:?}, infer {:?}, post {:?})",
            results.len(),
            preprocess,
            inference,
            postprocess
        );
        Ok(Segmentation {
            results,
            timings: Timings {
                preprocess,
                inference,
                postprocess,
            },
        })
    }
}
