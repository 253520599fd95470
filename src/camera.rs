// src/camera.rs
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use crossbeam_channel::Sender;
use image::{imageops, DynamicImage, RgbaImage};
use log::{debug, error, info, warn};
use nokhwa::{
    pixel_format::{RgbFormat, YuyvFormat},
    utils::{
        ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
        Resolution,
    },
    Camera, NokhwaError,
};

use crate::{
    config::CameraConfig,
    slot::LatestSender,
    zoom::{ZoomHandle, ZoomRange},
};

/// Status messages from the capture thread. Frames travel through the slots.
#[derive(Debug)]
pub enum CameraEvent {
    Bound { width: u32, height: u32, zoom: ZoomRange },
    Error(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FrameError {
    #[error("pixel buffer holds {actual} bytes, expected {expected} for {width}x{height} RGBA")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Quarter-turn rotation that makes a sensor frame upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Normalizes any angle to the nearest quarter turn.
    pub fn from_degrees(degrees: i32) -> Self {
        let quarter = ((degrees.rem_euclid(360) as f32) / 90.0).round() as i32 % 4;
        match quarter {
            1 => Rotation::Cw90,
            2 => Rotation::Cw180,
            3 => Rotation::Cw270,
            _ => Rotation::None,
        }
    }
}

/// One raw sensor frame: RGBA bytes plus the rotation reported with it.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
}

impl CapturedFrame {
    pub fn into_upright(self) -> Result<RgbaImage, FrameError> {
        let expected = self.width as usize * self.height as usize * 4;
        let actual = self.pixels.len();
        let size_error = FrameError::BufferSize {
            width: self.width,
            height: self.height,
            expected,
            actual,
        };
        // `from_raw` alone accepts oversized buffers.
        if actual != expected {
            return Err(size_error);
        }
        let image = RgbaImage::from_raw(self.width, self.height, self.pixels).ok_or(size_error)?;
        Ok(match self.rotation {
            Rotation::None => image,
            Rotation::Cw90 => imageops::rotate90(&image),
            Rotation::Cw180 => imageops::rotate180(&image),
            Rotation::Cw270 => imageops::rotate270(&image),
        })
    }
}

/// Centre crop by `1 / ratio`, scaled back to the original size.
pub fn digital_zoom(image: RgbaImage, ratio: f32) -> RgbaImage {
    if ratio <= 1.0 + f32::EPSILON || !ratio.is_finite() {
        return image;
    }
    let (width, height) = image.dimensions();
    let crop_w = ((width as f32 / ratio).round() as u32).clamp(1, width);
    let crop_h = ((height as f32 / ratio).round() as u32).clamp(1, height);
    let x = (width - crop_w) / 2;
    let y = (height - crop_h) / 2;
    let cropped = imageops::crop_imm(&image, x, y, crop_w, crop_h).to_image();
    imageops::resize(&cropped, width, height, imageops::FilterType::Triangle)
}

pub struct FrameOutputs {
    pub preview: LatestSender<Arc<RgbaImage>>,
    pub analysis: LatestSender<Arc<RgbaImage>>,
}

pub fn start_camera_thread(
    settings: CameraConfig,
    outputs: FrameOutputs,
    events: Sender<CameraEvent>,
    zoom: ZoomHandle,
    stop_signal: Arc<AtomicBool>,
    ctx: egui::Context,
) -> JoinHandle<()> {
    info!("Spawning camera capture thread.");
    thread::spawn(move || {
        camera_capture_loop(settings, outputs, events, zoom, stop_signal, ctx);
    })
}

fn camera_capture_loop(
    settings: CameraConfig,
    outputs: FrameOutputs,
    events: Sender<CameraEvent>,
    zoom: ZoomHandle,
    stop_signal: Arc<AtomicBool>,
    ctx: egui::Context,
) {
    info!("Camera capture loop started. Requesting YUYV format.");
    let index = CameraIndex::Index(settings.index);
    let requested_resolution = Resolution::new(settings.width, settings.height);
    let requested_cam_format =
        CameraFormat::new(requested_resolution, FrameFormat::YUYV, settings.fps);
    let requested_format =
        RequestedFormat::new::<YuyvFormat>(RequestedFormatType::Closest(requested_cam_format));
    info!("Requested camera format: {:?}", requested_format);

    let camera_result = Camera::new(index.clone(), requested_format).or_else(|err| {
        warn!(
            "Default backend failed: {}. Trying AVFoundation explicitly...",
            err
        );
        Camera::with_backend(index, requested_format, ApiBackend::AVFoundation)
    });

    let mut camera = match camera_result {
        Ok(cam) => {
            info!("Camera initialized successfully.");
            cam
        }
        Err(err) => {
            report_error(&events, &ctx, format!("Camera binding failed: {}", err));
            return;
        }
    };

    let camera_format = camera.camera_format();
    info!("Actual camera format received: {:?}", camera_format);
    if let Err(err) = camera.open_stream() {
        report_error(&events, &ctx, format!("Failed to open stream: {}", err));
        return;
    }
    info!("Camera stream opened successfully.");

    let rotation = Rotation::from_degrees(settings.rotation_degrees);
    let resolution = camera_format.resolution();
    let (width, height) = match rotation {
        Rotation::Cw90 | Rotation::Cw270 => (resolution.height(), resolution.width()),
        Rotation::None | Rotation::Cw180 => (resolution.width(), resolution.height()),
    };
    zoom.set_ratio(zoom.range().min_ratio);
    let _ = events.send(CameraEvent::Bound {
        width,
        height,
        zoom: zoom.range(),
    });
    ctx.request_repaint();

    let mut dropped_frames: u64 = 0;
    while !stop_signal.load(Ordering::Relaxed) {
        match camera.frame() {
            Ok(frame) => match frame.decode_image::<RgbFormat>() {
                Ok(decoded_rgb_image) => {
                    let (w, h) = decoded_rgb_image.dimensions();
                    let captured = CapturedFrame {
                        pixels: DynamicImage::ImageRgb8(decoded_rgb_image)
                            .into_rgba8()
                            .into_raw(),
                        width: w,
                        height: h,
                        rotation,
                    };
                    let upright = match captured.into_upright() {
                        Ok(image) => image,
                        Err(err) => {
                            warn!("Dropping malformed frame: {}", err);
                            continue;
                        }
                    };
                    let frame_arc = Arc::new(digital_zoom(upright, zoom.ratio()));
                    outputs.preview.publish(frame_arc.clone());
                    if outputs.analysis.publish(frame_arc) {
                        dropped_frames += 1;
                        debug!("Analyzer busy; replaced pending frame ({} so far).", dropped_frames);
                    }
                    ctx.request_repaint();
                }
                Err(err) => {
                    warn!("Failed to decode frame to RGB: {}", err);
                    thread::sleep(std::time::Duration::from_millis(50));
                }
            },
            Err(err) => match err {
                NokhwaError::ReadFrameError(msg) if msg.contains("Timeout") => {
                    warn!("Camera frame read timeout.");
                    thread::sleep(std::time::Duration::from_millis(100));
                }
                _ => {
                    report_error(&events, &ctx, format!("Failed to capture frame: {}", err));
                    thread::sleep(std::time::Duration::from_secs(1));
                }
            },
        }
    }
    info!("Camera capture loop stopping signal received.");
    if let Err(e) = camera.stop_stream() {
        error!("Failed to stop camera stream cleanly: {}", e);
    }
    info!("Camera capture loop finished ({} frames replaced before analysis).", dropped_frames);
}

fn report_error(events: &Sender<CameraEvent>, ctx: &egui::Context, error_msg: String) {
    error!("{}", error_msg);
    let _ = events.send(CameraEvent::Error(error_msg));
    ctx.request_repaint();
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn marked_frame(rotation: Rotation) -> CapturedFrame {
        // 3x2, red pixel at the top-left corner, everything else black.
        let mut image = RgbaImage::from_pixel(3, 2, Rgba([0, 0, 0, 255]));
        image.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        CapturedFrame {
            pixels: image.into_raw(),
            width: 3,
            height: 2,
            rotation,
        }
    }

    #[test]
    fn rotation_normalizes_degrees() {
        assert_eq!(Rotation::from_degrees(0), Rotation::None);
        assert_eq!(Rotation::from_degrees(90), Rotation::Cw90);
        assert_eq!(Rotation::from_degrees(-90), Rotation::Cw270);
        assert_eq!(Rotation::from_degrees(450), Rotation::Cw90);
        assert_eq!(Rotation::from_degrees(175), Rotation::Cw180);
        assert_eq!(Rotation::from_degrees(359), Rotation::None);
    }

    #[test]
    fn upright_without_rotation_is_identity() {
        let image = marked_frame(Rotation::None).into_upright().unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn quarter_turn_swaps_dimensions() {
        let image = marked_frame(Rotation::Cw90).into_upright().unwrap();
        assert_eq!(image.dimensions(), (2, 3));
        // Top-left moves to top-right on a clockwise quarter turn.
        assert_eq!(image.get_pixel(1, 0)[0], 255);
        assert_eq!(image.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn half_turn_moves_corner() {
        let image = marked_frame(Rotation::Cw180).into_upright().unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1)[0], 255);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let frame = CapturedFrame {
            pixels: vec![0; 10],
            width: 2,
            height: 2,
            rotation: Rotation::None,
        };
        assert_eq!(
            frame.into_upright().unwrap_err(),
            FrameError::BufferSize {
                width: 2,
                height: 2,
                expected: 16,
                actual: 10
            }
        );
    }

    #[test]
    fn oversized_buffer_is_rejected() {
        let frame = CapturedFrame {
            pixels: vec![0; 20],
            width: 2,
            height: 2,
            rotation: Rotation::None,
        };
        assert_eq!(
            frame.into_upright().unwrap_err(),
            FrameError::BufferSize {
                width: 2,
                height: 2,
                expected: 16,
                actual: 20
            }
        );
    }

    #[test]
    fn digital_zoom_keeps_size_and_magnifies_centre() {
        let mut image = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]));
        for y in 2..6 {
            for x in 2..6 {
                image.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        let zoomed = digital_zoom(image, 2.0);
        assert_eq!(zoomed.dimensions(), (8, 8));
        assert_eq!(zoomed.get_pixel(0, 0)[0], 255);
        assert_eq!(zoomed.get_pixel(7, 7)[0], 255);
    }

    #[test]
    fn unit_zoom_is_passthrough() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255]));
        let zoomed = digital_zoom(image.clone(), 1.0);
        assert_eq!(zoomed, image);
    }
}
