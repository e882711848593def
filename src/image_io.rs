//! Decoding collaborator
//!
//! The engine never decodes files itself; it asks an [`ImageLoader`] for
//! 8-bit RGB pixels. [`DiskLoader`] decodes anything the `image` crate
//! understands, [`MemoryLoader`] serves images that are already in memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use crate::collapse::OutputImage;
use crate::raster::Raster;

/// One decoded input image. Its identity within a run is its index in the
/// input list; the path is kept for reporting.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub path: PathBuf,
    pub pixels: RgbImage,
}

impl SourceImage {
    pub fn new(path: impl Into<PathBuf>, pixels: RgbImage) -> Self {
        Self {
            path: path.into(),
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn to_raster(&self) -> Raster {
        Raster::from_rgb(&self.pixels)
    }
}

pub trait ImageLoader: Send + Sync {
    /// Dimensions without decoding the pixel data.
    fn probe(&self, path: &Path) -> Result<(u32, u32)>;

    fn load(&self, path: &Path) -> Result<SourceImage>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskLoader;

impl ImageLoader for DiskLoader {
    fn probe(&self, path: &Path) -> Result<(u32, u32)> {
        image::image_dimensions(path).with_context(|| format!("failed to read header of {}", path.display()))
    }

    /// Load an image from disk with timing and logging
    fn load(&self, path: &Path) -> Result<SourceImage> {
        let start = std::time::Instant::now();
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        log::debug!("Loading image: {}", path.display());

        let pixels = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .into_rgb8();

        log::info!(
            "Loaded {} in {:?} - Size: {}x{}",
            filename,
            start.elapsed(),
            pixels.width(),
            pixels.height()
        );

        Ok(SourceImage::new(path, pixels))
    }
}

/// Serves pre-decoded images keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    images: HashMap<PathBuf, RgbImage>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, pixels: RgbImage) {
        self.images.insert(path.into(), pixels);
    }

    pub fn with(mut self, path: impl Into<PathBuf>, pixels: RgbImage) -> Self {
        self.insert(path, pixels);
        self
    }
}

impl ImageLoader for MemoryLoader {
    fn probe(&self, path: &Path) -> Result<(u32, u32)> {
        self.images
            .get(path)
            .map(|img| img.dimensions())
            .ok_or_else(|| anyhow!("no image registered for {}", path.display()))
    }

    fn load(&self, path: &Path) -> Result<SourceImage> {
        self.images
            .get(path)
            .map(|img| SourceImage::new(path, img.clone()))
            .ok_or_else(|| anyhow!("no image registered for {}", path.display()))
    }
}

/// Write the fused result; the format follows the file extension.
pub fn save_output(output: &OutputImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    output
        .pixels()
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    log::info!("Saved result to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_disk_loader_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("frame.png");
        let img = RgbImage::from_fn(12, 7, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 99]));
        img.save(&path)?;

        let loader = DiskLoader;
        assert_eq!(loader.probe(&path)?, (12, 7));
        let loaded = loader.load(&path)?;
        assert_eq!(loaded.pixels, img);
        assert_eq!(loaded.path, path);
        Ok(())
    }

    #[test]
    fn test_disk_loader_reports_missing_file() {
        let loader = DiskLoader;
        assert!(loader.probe(Path::new("/definitely/not/here.png")).is_err());
        assert!(loader.load(Path::new("/definitely/not/here.png")).is_err());
    }

    #[test]
    fn test_memory_loader() -> Result<()> {
        let loader = MemoryLoader::new().with("a.png", RgbImage::new(3, 2));
        assert_eq!(loader.probe(Path::new("a.png"))?, (3, 2));
        assert!(loader.load(Path::new("b.png")).is_err());
        Ok(())
    }
}
