// src/main.rs
#![warn(clippy::all, rust_2018_idioms)]
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod camera;
mod config;
mod model;
mod permission;
mod segmentation;
mod sink;
mod slot;
mod snapshot;
mod ui;
mod visuals;
mod zoom;

use std::path::PathBuf;

fn main() -> eframe::Result {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::AppConfig::resolve(config_path.as_deref());

    let level = config
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(2);
        }
    };
    log::info!("Starting SEG_CAM_SNAP (model: {})", config.model.path.display());

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([800.0, 700.0])
            .with_min_inner_size([320.0, 240.0]),
        ..Default::default()
    };

    eframe::run_native(
        "SEG_CAM_SNAP",
        native_options,
        Box::new(move |cc| Ok(Box::new(ui::SegCamApp::new(cc, config)))),
    )
}
