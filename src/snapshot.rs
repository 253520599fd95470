// src/snapshot.rs
use std::{
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use image::{codecs::jpeg::JpegEncoder, imageops, DynamicImage, RgbaImage};
use log::{debug, error, info};
use serde::Serialize;

pub const SNAPSHOT_PREFIX: &str = "combined_image_";
pub const JPEG_MIME: &str = "image/jpeg";
const JPEG_QUALITY: u8 = 100;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("No original frame to save.")]
    NoFrame,
    #[error("No segmentation result to save.")]
    NoOverlay,
    #[error("failed to resolve snapshot directory: {0}")]
    Location(#[source] io::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl SnapshotError {
    /// Missing inputs are expected user-facing conditions, not failures.
    pub fn is_precondition(&self) -> bool {
        matches!(self, SnapshotError::NoFrame | SnapshotError::NoOverlay)
    }
}

/// Where snapshots go; resolved by the platform layer.
pub trait StorageLocation {
    fn snapshot_dir(&self) -> io::Result<PathBuf>;
}

/// A fixed directory, or the user's downloads folder when none is configured.
#[derive(Debug, Clone)]
pub struct DirectoryLocation {
    dir: Option<PathBuf>,
}

impl DirectoryLocation {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }
}

impl StorageLocation for DirectoryLocation {
    fn snapshot_dir(&self) -> io::Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        platform_download_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no downloads directory"))
    }
}

fn platform_download_dir() -> Option<PathBuf> {
    dirs::download_dir().or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaEntry {
    pub display_name: String,
    pub mime_type: String,
    pub path: PathBuf,
}

impl MediaEntry {
    pub fn jpeg(path: &Path) -> Self {
        Self {
            display_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mime_type: JPEG_MIME.to_string(),
            path: path.to_path_buf(),
        }
    }
}

/// Shared media index the saved file is registered in.
pub trait MediaCatalog {
    fn register(&mut self, entry: &MediaEntry) -> anyhow::Result<()>;
}

/// Appends one JSON object per line to an index file next to the media.
#[derive(Debug, Clone)]
pub struct JsonlCatalog {
    file_name: String,
}

impl JsonlCatalog {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

impl MediaCatalog for JsonlCatalog {
    fn register(&mut self, entry: &MediaEntry) -> anyhow::Result<()> {
        let dir = entry
            .path
            .parent()
            .context("media path has no parent directory")?;
        let index_path = dir.join(&self.file_name);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)
            .with_context(|| format!("opening media index {}", index_path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to media index {}", index_path.display()))?;
        Ok(())
    }
}

pub fn snapshot_file_name(timestamp_ms: i64) -> String {
    format!("{}{}.jpg", SNAPSHOT_PREFIX, timestamp_ms)
}

/// Raw frame first, overlay alpha-blended on top at the origin.
pub fn compose(frame: &RgbaImage, overlay: &RgbaImage) -> RgbaImage {
    let (width, height) = frame.dimensions();
    let mut canvas = RgbaImage::new(width, height);
    imageops::replace(&mut canvas, frame, 0, 0);
    imageops::overlay(&mut canvas, overlay, 0, 0);
    canvas
}

pub struct SnapshotComposer {
    location: Box<dyn StorageLocation>,
    catalog: Box<dyn MediaCatalog>,
}

impl SnapshotComposer {
    pub fn new(location: Box<dyn StorageLocation>, catalog: Box<dyn MediaCatalog>) -> Self {
        Self { location, catalog }
    }

    pub fn save(
        &mut self,
        frame: Option<&RgbaImage>,
        overlay: Option<&RgbaImage>,
    ) -> Result<PathBuf, SnapshotError> {
        self.save_at(frame, overlay, chrono::Utc::now().timestamp_millis())
    }

    pub fn save_at(
        &mut self,
        frame: Option<&RgbaImage>,
        overlay: Option<&RgbaImage>,
        timestamp_ms: i64,
    ) -> Result<PathBuf, SnapshotError> {
        let frame = frame.ok_or(SnapshotError::NoFrame)?;
        let overlay = overlay.ok_or(SnapshotError::NoOverlay)?;

        let dir = self.location.snapshot_dir().map_err(SnapshotError::Location)?;
        fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(snapshot_file_name(timestamp_ms));

        let combined = DynamicImage::ImageRgba8(compose(frame, overlay)).to_rgb8();
        write_jpeg(&path, &combined)?;
        info!("Combined image saved to {}", path.display());

        let entry = MediaEntry::jpeg(&path);
        match self.catalog.register(&entry) {
            Ok(()) => debug!("Image added to media catalog: {}", path.display()),
            Err(e) => error!("Error adding image to media catalog: {:#}", e),
        }
        Ok(path)
    }
}

/// Never replaces an existing file; a partial write is removed.
fn write_jpeg(path: &Path, image: &image::RgbImage) -> Result<(), SnapshotError> {
    let io_err = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    let encoded = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|source| SnapshotError::Encode {
            path: path.to_path_buf(),
            source,
        });
    let written = encoded.and_then(|()| writer.flush().map_err(io_err));
    if written.is_err() {
        drop(writer);
        let _ = fs::remove_file(path);
    }
    written
}
