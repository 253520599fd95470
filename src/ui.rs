// src/ui.rs
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, unbounded, Receiver, TryRecvError};
use egui::{Align, Align2, Color32, ColorImage, Layout, TextureHandle, TextureOptions, Vec2};
use image::RgbaImage;
use log::{debug, error, info};

use crate::{
    camera::{self, CameraEvent, FrameOutputs},
    config::AppConfig,
    model::OnnxSegmenter,
    permission::{GateAction, GateState, PermissionGate, PermissionMode},
    segmentation::{self, InstanceSegmenter, SegmentationEvent},
    sink::ResultSink,
    slot::latest_slot,
    snapshot::{DirectoryLocation, JsonlCatalog, SnapshotComposer},
    visuals::MaskPainter,
    zoom::{ZoomHandle, ZoomRange, ZoomSlider},
};

const FPS_UPDATE_INTERVAL: Duration = Duration::from_millis(500);
const NOTICE_SHORT: Duration = Duration::from_secs(2);
const NOTICE_LONG: Duration = Duration::from_millis(3500);
const MAX_NOTICES: usize = 3;
const UI_CHANNEL_CAPACITY: usize = 4;
const PERMISSION_DENIED_MSG: &str = "Permission required";
const SEG_DISCONNECTED_MSG: &str = "Segmentation thread disconnected unexpectedly.";

struct Notice {
    text: String,
    expires_at: Instant,
}

/// UI end of the segmentation channel. Polling stops once the worker is gone.
struct SegmentationFeed {
    rx: Receiver<SegmentationEvent>,
    disconnected: bool,
}

/// Events drained in one pass; `disconnected` is set only on the pass that first sees it.
#[derive(Debug, Default)]
struct FeedBatch {
    events: Vec<SegmentationEvent>,
    disconnected: bool,
}

impl SegmentationFeed {
    fn new(rx: Receiver<SegmentationEvent>) -> Self {
        Self {
            rx,
            disconnected: false,
        }
    }

    fn drain(&mut self) -> FeedBatch {
        let mut batch = FeedBatch::default();
        if self.disconnected {
            return batch;
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => batch.events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    batch.disconnected = true;
                    break;
                }
            }
        }
        batch
    }
}

/// Status line after a batch: the latest event decides, and a disconnect
/// only fills an empty slot so the cause reported before it stays visible.
fn segmentation_status(current: Option<String>, batch: &FeedBatch) -> Option<String> {
    let mut status = current;
    for event in &batch.events {
        status = match event {
            SegmentationEvent::Error(msg) => Some(msg.clone()),
            SegmentationEvent::Detected { .. } | SegmentationEvent::Empty { .. } => None,
        };
    }
    if batch.disconnected && status.is_none() {
        status = Some(SEG_DISCONNECTED_MSG.to_string());
    }
    status
}

/// Capture and segmentation threads plus the UI ends of their channels.
struct Pipeline {
    cam_thread_handle: Option<JoinHandle<()>>,
    cam_stop_signal: Arc<AtomicBool>,
    seg_thread_handle: Option<JoinHandle<()>>,
    seg_stop_signal: Arc<AtomicBool>,

    preview_rx: Receiver<Arc<RgbaImage>>,
    camera_rx: Receiver<CameraEvent>,
    seg_feed: SegmentationFeed,

    zoom: ZoomHandle,
}

impl Pipeline {
    fn start(config: &AppConfig, ctx: &egui::Context) -> Self {
        info!("Starting capture pipeline.");
        // --- Channels ---
        // Camera -> UI preview and Camera -> Segmentation, latest frame only
        let (preview_tx, preview_rx) = latest_slot();
        let (analysis_tx, analysis_rx) = latest_slot();
        let (camera_tx, camera_rx) = unbounded();
        // Segmentation -> UI
        let (seg_to_ui_tx, seg_to_ui_rx) = bounded(UI_CHANNEL_CAPACITY);

        let zoom = ZoomHandle::new(ZoomRange {
            min_ratio: 1.0,
            max_ratio: config.camera.max_zoom,
        });

        // --- Stop Signals ---
        let cam_stop_signal = Arc::new(AtomicBool::new(false));
        let seg_stop_signal = Arc::new(AtomicBool::new(false));

        let cam_thread_handle = Some(camera::start_camera_thread(
            config.camera.clone(),
            FrameOutputs {
                preview: preview_tx,
                analysis: analysis_tx,
            },
            camera_tx,
            zoom.clone(),
            cam_stop_signal.clone(),
            ctx.clone(),
        ));

        let model_config = config.model.clone();
        let seg_thread_handle = Some(segmentation::start_segmentation_thread(
            seg_to_ui_tx,
            analysis_rx,
            seg_stop_signal.clone(),
            ctx.clone(),
            Box::new(move || {
                let segmenter: Box<dyn InstanceSegmenter> =
                    Box::new(OnnxSegmenter::load(&model_config)?);
                Ok(segmenter)
            }),
            Box::new(MaskPainter::default()),
        ));

        Self {
            cam_thread_handle,
            cam_stop_signal,
            seg_thread_handle,
            seg_stop_signal,
            preview_rx,
            camera_rx,
            seg_feed: SegmentationFeed::new(seg_to_ui_rx),
            zoom,
        }
    }

    fn stop(&mut self) {
        // Signal BOTH threads to stop
        self.cam_stop_signal.store(true, Ordering::Relaxed);
        self.seg_stop_signal.store(true, Ordering::Relaxed);

        if let Some(handle) = self.cam_thread_handle.take() {
            if let Err(e) = handle.join() {
                error!("Error joining camera thread: {:?}", e);
            } else {
                info!("Camera thread joined successfully.");
            }
        }
        if let Some(handle) = self.seg_thread_handle.take() {
            if let Err(e) = handle.join() {
                error!("Error joining segmentation thread: {:?}", e);
            } else {
                info!("Segmentation thread joined successfully.");
            }
        }
    }
}

fn color_image(image: &RgbaImage) -> ColorImage {
    ColorImage::from_rgba_unmultiplied(
        [image.width() as usize, image.height() as usize],
        image.as_raw(),
    )
}

fn upload(ctx: &egui::Context, slot: &mut Option<TextureHandle>, name: &str, image: ColorImage) {
    match slot {
        Some(texture) => texture.set(image, TextureOptions::LINEAR),
        None => {
            info!("Creating texture '{}' with size: {:?}", name, image.size);
            *slot = Some(ctx.load_texture(name, image, TextureOptions::LINEAR));
        }
    }
}

pub struct SegCamApp {
    config: AppConfig,
    permission: PermissionMode,
    gate: PermissionGate,
    show_permission_prompt: bool,
    pipeline: Option<Pipeline>,

    sink: ResultSink,
    composer: SnapshotComposer,
    slider: ZoomSlider,
    zoom_range: Option<ZoomRange>,

    preview_texture: Option<TextureHandle>,
    overlay_texture: Option<TextureHandle>,
    texture_size: Option<Vec2>,
    camera_resolution: Option<(u32, u32)>,
    camera_error: Option<String>,
    seg_error: Option<String>,
    notices: Vec<Notice>,

    // --- FPS Fields ---
    last_fps_update_time: Instant,
    frames_since_last_update: u32,
    last_calculated_fps: f32,
}

impl SegCamApp {
    pub fn new(cc: &eframe::CreationContext<'_>, config: AppConfig) -> Self {
        info!("Initializing SegCamApp");
        let composer = SnapshotComposer::new(
            Box::new(DirectoryLocation::new(config.snapshot.directory.clone())),
            Box::new(JsonlCatalog::new(config.snapshot.catalog_file.clone())),
        );
        let mut app = Self {
            permission: config.camera.permission,
            gate: PermissionGate::default(),
            show_permission_prompt: false,
            pipeline: None,
            sink: ResultSink::default(),
            composer,
            slider: ZoomSlider::new(config.camera.zoom_slider_max),
            zoom_range: None,
            preview_texture: None,
            overlay_texture: None,
            texture_size: None,
            camera_resolution: None,
            camera_error: None,
            seg_error: None,
            notices: Vec::new(),
            last_fps_update_time: Instant::now(),
            frames_since_last_update: 0,
            last_calculated_fps: 0.0,
            config,
        };
        let action = app.gate.start(&mut app.permission);
        app.handle_gate_action(action, &cc.egui_ctx);
        app
    }

    fn handle_gate_action(&mut self, action: Option<GateAction>, ctx: &egui::Context) {
        match action {
            Some(GateAction::StartCapture) => {
                self.pipeline = Some(Pipeline::start(&self.config, ctx));
            }
            Some(GateAction::ShowPrompt) => self.show_permission_prompt = true,
            Some(GateAction::NotifyDenied) => self.notify(PERMISSION_DENIED_MSG, NOTICE_LONG),
            None => {}
        }
    }

    fn notify(&mut self, text: impl Into<String>, duration: Duration) {
        let text = text.into();
        let expires_at = Instant::now() + duration;
        if let Some(existing) = self.notices.iter_mut().find(|n| n.text == text) {
            existing.expires_at = expires_at;
            return;
        }
        self.notices.push(Notice { text, expires_at });
        if self.notices.len() > MAX_NOTICES {
            self.notices.remove(0);
        }
    }

    fn update_fps_counter(&mut self) {
        self.frames_since_last_update += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update_time);

        if elapsed >= FPS_UPDATE_INTERVAL {
            let elapsed_secs = elapsed.as_secs_f32();
            self.last_calculated_fps = if elapsed_secs > 0.0 {
                self.frames_since_last_update as f32 / elapsed_secs
            } else {
                f32::INFINITY
            };
            self.frames_since_last_update = 0;
            self.last_fps_update_time = now;
        }
    }

    fn on_camera_bound(&mut self, width: u32, height: u32, range: ZoomRange) {
        info!("Camera bound at {}x{}, zoom {:?}", width, height, range);
        self.camera_resolution = Some((width, height));
        self.camera_error = None;
        self.zoom_range = Some(range);
        self.slider.reset();
        if let Some(pipeline) = &self.pipeline {
            let ratio = self.slider.ratio(range);
            pipeline.zoom.set_ratio(ratio);
            debug!("Initialized zoom ratio: {}", ratio);
        }
    }

    fn on_zoom_progress(&mut self, progress: u32) {
        self.slider.set_progress(progress);
        let (Some(range), Some(pipeline)) = (self.zoom_range, &self.pipeline) else {
            return;
        };
        let ratio = self.slider.ratio(range);
        pipeline.zoom.set_ratio(ratio);
        debug!("Updated zoom ratio: {}", ratio);
    }

    fn save_snapshot(&mut self) {
        match self.composer.save(self.sink.last_frame(), self.sink.overlay()) {
            Ok(path) => {
                self.notify(format!("Combined Image Saved: {}", path.display()), NOTICE_SHORT);
            }
            Err(e) if e.is_precondition() => {
                error!("{}", e);
                self.notify(e.to_string(), NOTICE_SHORT);
            }
            Err(e) => {
                error!("Error saving combined image: {}", e);
                self.notify(format!("Failed to save image: {}", e), NOTICE_SHORT);
            }
        }
    }

    fn drain_pipeline(&mut self, ctx: &egui::Context) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };

        let camera_events: Vec<CameraEvent> = pipeline.camera_rx.try_iter().collect();
        let latest_preview = pipeline.preview_rx.try_iter().last();

        let batch = pipeline.seg_feed.drain();
        self.seg_error = segmentation_status(self.seg_error.take(), &batch);
        if batch.disconnected {
            error!("Segmentation thread disconnected!");
            if let Some(handle) = pipeline.seg_thread_handle.take() {
                if let Err(e) = handle.join() {
                    error!("Segmentation thread panicked: {:?}", e);
                    self.seg_error = Some(format!("Segmentation thread panicked: {:?}", e));
                }
            }
        }

        for event in camera_events {
            match event {
                CameraEvent::Bound {
                    width,
                    height,
                    zoom,
                } => self.on_camera_bound(width, height, zoom),
                CameraEvent::Error(err) => self.camera_error = Some(err),
            }
        }

        if let Some(frame) = latest_preview {
            let frame_size_vec = Vec2::new(frame.width() as f32, frame.height() as f32);
            if self.texture_size.map_or(true, |s| s != frame_size_vec) {
                debug!("Texture size changed to: {:?}", frame_size_vec);
                self.texture_size = Some(frame_size_vec);
            }
            upload(ctx, &mut self.preview_texture, "camera_preview", color_image(&frame));
        }

        for event in batch.events {
            let outcome = self.sink.apply(event);
            if outcome.overlay_changed {
                match self.sink.overlay() {
                    Some(overlay) => {
                        upload(ctx, &mut self.overlay_texture, "segmentation_overlay", color_image(overlay));
                    }
                    None => self.overlay_texture = None,
                }
            }
            if let Some(notice) = outcome.notice {
                self.notify(notice, NOTICE_SHORT);
            }
        }
    }

    fn permission_prompt(&mut self, ctx: &egui::Context) {
        if !self.show_permission_prompt {
            return;
        }
        let mut answer = None;
        egui::Window::new("Camera permission")
            .collapsible(false)
            .resizable(false)
            .anchor(Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label("Live segmentation needs access to the camera.");
                ui.add_space(8.0);
                ui.horizontal(|ui| {
                    if ui.button("Allow").clicked() {
                        answer = Some(true);
                    }
                    if ui.button("Deny").clicked() {
                        answer = Some(false);
                    }
                });
            });
        if let Some(granted) = answer {
            self.show_permission_prompt = false;
            let action = self.gate.on_request_result(granted);
            self.handle_gate_action(action, ctx);
        }
    }

    fn show_notices(&mut self, ctx: &egui::Context) {
        let now = Instant::now();
        self.notices.retain(|n| n.expires_at > now);
        let Some(next_expiry) = self.notices.iter().map(|n| n.expires_at).min() else {
            return;
        };
        ctx.request_repaint_after(next_expiry - now);
        egui::Area::new(egui::Id::new("notices"))
            .anchor(Align2::CENTER_BOTTOM, [0.0, -72.0])
            .show(ctx, |ui| {
                for notice in &self.notices {
                    egui::Frame::popup(ui.style()).show(ui, |ui| {
                        ui.label(notice.text.as_str());
                    });
                }
            });
    }
}

impl eframe::App for SegCamApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.update_fps_counter();
        self.drain_pipeline(ctx);

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            egui::menu::bar(ui, |ui| {
                ui.menu_button("File", |ui| {
                    if ui.button("Quit").clicked() {
                        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                    }
                });
                ui.add_space(16.0);
                egui::widgets::global_theme_preference_buttons(ui);
            });
        });

        let mut shutter_clicked = false;
        let mut zoom_progress = None;
        egui::TopBottomPanel::bottom("bottom_panel")
            .resizable(false)
            .show(ctx, |ui| {
                ui.horizontal(|ui| {
                    let timings = self.sink.timings();
                    ui.label(format!("Pre-process: {} ms", timings.preprocess));
                    ui.separator();
                    ui.label(format!("Inference: {} ms", timings.inference));
                    ui.separator();
                    ui.label(format!("Post-process: {} ms", timings.postprocess));
                    ui.separator();
                    ui.label(format!("Instances: {}", self.sink.instances()));
                });
                ui.horizontal(|ui| {
                    let mut progress = self.slider.progress();
                    let slider = egui::Slider::new(&mut progress, 0..=self.slider.max())
                        .show_value(false)
                        .text("Zoom");
                    if ui.add_enabled(self.zoom_range.is_some(), slider).changed() {
                        zoom_progress = Some(progress);
                    }
                    if ui
                        .add_enabled(self.pipeline.is_some(), egui::Button::new("📷 Snapshot"))
                        .clicked()
                    {
                        shutter_clicked = true;
                    }
                    ui.with_layout(Layout::right_to_left(Align::Center), |ui| {
                        ui.label(format!("UI FPS: {:.1}", self.last_calculated_fps));
                        ui.add_space(10.0);
                        if let Some((w, h)) = self.camera_resolution {
                            ui.label(format!("Cam Res: {}x{}", w, h));
                        } else if self.camera_error.is_none() {
                            ui.label("Cam Res: ...");
                        }
                    });
                });
            });
        if let Some(progress) = zoom_progress {
            self.on_zoom_progress(progress);
        }
        if shutter_clicked {
            self.save_snapshot();
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("SEG_CAM_SNAP");
            ui.separator();

            if let Some(err) = &self.camera_error {
                ui.colored_label(Color32::YELLOW, format!("Camera Status: {}", err));
            }
            if let Some(err) = &self.seg_error {
                ui.colored_label(Color32::RED, format!("Segmentation Status: {}", err));
            }

            match (&self.preview_texture, self.texture_size) {
                (Some(texture), Some(tex_size)) => {
                    let aspect_ratio = if tex_size.y > 0.0 { tex_size.x / tex_size.y } else { 1.0 };
                    let available_width = ui.available_width();
                    let available_height = ui.available_height();
                    let mut image_width = available_width;
                    let mut image_height = available_width / aspect_ratio;
                    if image_height > available_height {
                        image_height = available_height;
                        image_width = available_height * aspect_ratio;
                    }
                    ui.with_layout(Layout::top_down(Align::Center), |ui| {
                        let response = ui.add(
                            egui::Image::new(texture)
                                .max_width(image_width)
                                .max_height(image_height)
                                .maintain_aspect_ratio(true),
                        );
                        if let Some(overlay) = &self.overlay_texture {
                            ui.painter().image(
                                overlay.id(),
                                response.rect,
                                egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                                Color32::WHITE,
                            );
                        }
                    });
                }
                _ => {
                    ui.with_layout(Layout::top_down(Align::Center), |ui| {
                        ui.add_space(ui.available_height() / 3.0);
                        match self.gate.state() {
                            GateState::Denied => {
                                ui.label("Camera permission denied.");
                            }
                            GateState::Prompting | GateState::AwaitingPermission => {
                                ui.label("Waiting for camera permission...");
                            }
                            GateState::Capturing if self.camera_error.is_none() => {
                                ui.spinner();
                                ui.label("Initializing stream...");
                            }
                            GateState::Capturing => {} // Error shown above
                        }
                    });
                }
            }
        });

        self.permission_prompt(ctx);
        self.show_notices(ctx);
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        info!("Exit requested. Stopping threads...");
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
    }
}
