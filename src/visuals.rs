// src/visuals.rs
use fnv::FnvHashMap;
use image::{Rgba, RgbaImage};
use imageproc::{drawing, rect::Rect};
use log::warn;
use palette::{FromColor, Hsv, Srgb};

use crate::segmentation::{OverlayRenderer, SegmentationResult};

// --- Constants ---
const GOLDEN_ANGLE_DEG: f32 = 137.507_77;
const DEFAULT_FILL_ALPHA: u8 = 110;
const OUTLINE_THICKNESS: i32 = 2;

// --- Helper: distinct colour per class id ---
fn class_color(class_id: usize) -> Rgba<u8> {
    let hue = (class_id as f32 * GOLDEN_ANGLE_DEG) % 360.0;
    let hsv: Hsv = Hsv::new(hue, 0.75, 0.95);
    let rgb: Srgb = Srgb::from_color(hsv);
    let rgb: Srgb<u8> = rgb.into_format();
    Rgba([rgb.red, rgb.green, rgb.blue, 255])
}

/// Paints translucent instance masks with an opaque box outline per instance.
pub struct MaskPainter {
    palette: FnvHashMap<usize, Rgba<u8>>,
    fill_alpha: u8,
}

impl Default for MaskPainter {
    fn default() -> Self {
        Self::new(DEFAULT_FILL_ALPHA)
    }
}

impl MaskPainter {
    pub fn new(fill_alpha: u8) -> Self {
        Self {
            palette: FnvHashMap::default(),
            fill_alpha,
        }
    }

    fn color_for(&mut self, class_id: usize) -> Rgba<u8> {
        *self
            .palette
            .entry(class_id)
            .or_insert_with(|| class_color(class_id))
    }

    fn fill_mask(&self, overlay: &mut RgbaImage, result: &SegmentationResult, color: Rgba<u8>) {
        let (width, height) = overlay.dimensions();
        let x0 = result.bbox.x1.floor().max(0.0) as u32;
        let y0 = result.bbox.y1.floor().max(0.0) as u32;
        let x1 = (result.bbox.x2.ceil().max(0.0) as u32).min(width);
        let y1 = (result.bbox.y2.ceil().max(0.0) as u32).min(height);
        let fill = Rgba([color[0], color[1], color[2], self.fill_alpha]);
        for y in y0..y1 {
            for x in x0..x1 {
                if result.mask.get_pixel(x, y)[0] > 0 {
                    overlay.put_pixel(x, y, fill);
                }
            }
        }
    }
}

fn draw_outline(overlay: &mut RgbaImage, result: &SegmentationResult, color: Rgba<u8>) {
    let bbox = result.bbox;
    for inset in 0..OUTLINE_THICKNESS {
        let w = bbox.width().round() as i32 - 2 * inset;
        let h = bbox.height().round() as i32 - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(bbox.x1.round() as i32 + inset, bbox.y1.round() as i32 + inset)
            .of_size(w as u32, h as u32);
        drawing::draw_hollow_rect_mut(overlay, rect, color);
    }
}

impl OverlayRenderer for MaskPainter {
    fn render(&mut self, results: &[SegmentationResult], width: u32, height: u32) -> RgbaImage {
        let mut overlay = RgbaImage::new(width, height);
        for result in results {
            let color = self.color_for(result.class_id);
            if result.mask.dimensions() == (width, height) {
                self.fill_mask(&mut overlay, result, color);
            } else {
                warn!(
                    "Mask for {} is {:?}, expected {}x{}; drawing outline only.",
                    result.class_name,
                    result.mask.dimensions(),
                    width,
                    height
                );
            }
            draw_outline(&mut overlay, result, color);
        }
        overlay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::BoundingBox;
    use image::{GrayImage, Luma};

    fn square(class_id: usize, x: u32, y: u32, side: u32, canvas: u32) -> SegmentationResult {
        let mut mask = GrayImage::new(canvas, canvas);
        for yy in y..y + side {
            for xx in x..x + side {
                mask.put_pixel(xx, yy, Luma([255]));
            }
        }
        SegmentationResult {
            bbox: BoundingBox {
                x1: x as f32,
                y1: y as f32,
                x2: (x + side) as f32,
                y2: (y + side) as f32,
            },
            class_id,
            class_name: format!("class {}", class_id),
            confidence: 0.8,
            mask,
        }
    }

    #[test]
    fn background_stays_transparent() {
        let mut painter = MaskPainter::default();
        let overlay = painter.render(&[square(0, 4, 4, 8, 20)], 20, 20);
        assert_eq!(overlay.get_pixel(0, 0)[3], 0);
        assert_eq!(overlay.get_pixel(19, 19)[3], 0);
    }

    #[test]
    fn mask_interior_is_translucent_and_outline_opaque() {
        let mut painter = MaskPainter::new(100);
        let overlay = painter.render(&[square(3, 4, 4, 10, 20)], 20, 20);
        assert_eq!(overlay.get_pixel(9, 9)[3], 100);
        assert_eq!(overlay.get_pixel(4, 4)[3], 255);
        assert_eq!(overlay.get_pixel(5, 9)[3], 255);
        assert_eq!(overlay.get_pixel(4, 4).0[..3], class_color(3).0[..3]);
    }

    #[test]
    fn classes_get_distinct_stable_colours() {
        let mut painter = MaskPainter::default();
        let a = painter.color_for(0);
        let b = painter.color_for(1);
        assert_ne!(a, b);
        assert_eq!(painter.color_for(0), a);
    }

    #[test]
    fn mismatched_mask_draws_outline_only() {
        let mut painter = MaskPainter::default();
        let mut result = square(0, 2, 2, 6, 10);
        result.mask = GrayImage::from_pixel(3, 3, Luma([255]));
        let overlay = painter.render(&[result], 10, 10);
        assert_eq!(overlay.get_pixel(5, 5)[3], 0);
        assert_eq!(overlay.get_pixel(2, 2)[3], 255);
    }
}
