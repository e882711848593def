use image::RgbImage;

use crate::error::StackError;
use crate::fusion::FusedPyramid;
use crate::pyramid::expand;
use crate::raster::Raster;

/// The fused result of a run, same size as the reference image.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputImage {
    pixels: RgbImage,
}

impl OutputImage {
    pub fn new(pixels: RgbImage) -> Self {
        Self { pixels }
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

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn into_inner(self) -> RgbImage {
        self.pixels
    }
}

/// Rebuild the full-resolution image from a fused pyramid.
pub fn collapse(fused: FusedPyramid) -> OutputImage {
    match collapse_with(fused, |_| Ok(())) {
        Ok(output) => output,
        // The no-op callback never fails.
        Err(_) => OutputImage::new(RgbImage::new(0, 0)),
    }
}

/// Like [`collapse`], calling `on_level` with the level just reconstructed
/// (coarsest detail level first, 0 last). An error from the callback stops
/// the collapse.
pub fn collapse_with(
    fused: FusedPyramid,
    mut on_level: impl FnMut(usize) -> Result<(), StackError>,
) -> Result<OutputImage, StackError> {
    let FusedPyramid { details, base } = fused;
    let mut current: Raster = base;

    for (level, detail) in details.into_iter().enumerate().rev() {
        let mut up = expand(&current, detail.width(), detail.height());
        up.data_mut()
            .iter_mut()
            .zip(detail.data())
            .for_each(|(u, d)| *u += d);
        // Detail from different images can overshoot the valid range.
        up.clamp_in_place(0.0, 255.0);
        current = up;
        on_level(level)?;
    }

    if current.channels() != 3 {
        log::warn!("Collapsed image has {} channels, converting to RGB", current.channels());
    }
    Ok(OutputImage::new(current.to_rgb()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::AlignedImage;
    use crate::config::FusionConfig;
    use crate::fusion::FocusFuser;
    use crate::pyramid::PyramidBuilder;
    use crate::store::PyramidStore;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 11 % 256) as u8, ((x * y) % 256) as u8])
        })
    }

    #[test]
    fn test_single_image_round_trip() {
        let img = gradient(37, 23);
        let store = PyramidStore::in_memory(1000);
        PyramidBuilder::new(&store, 4)
            .build(0, AlignedImage::unwarped(Raster::from_rgb(&img)))
            .unwrap();
        let fused = FocusFuser::new(&store, &[0], &FusionConfig::default()).fuse(4).unwrap();
        let out = collapse(fused);
        assert_eq!(out.dimensions(), (37, 23));
        for (a, b) in out.pixels().pixels().zip(img.pixels()) {
            for c in 0..3 {
                assert!((a[c] as i32 - b[c] as i32).abs() <= 1);
            }
        }
    }

    #[test]
    fn test_levels_reported_coarse_to_fine() {
        let fused = FusedPyramid {
            details: vec![Raster::new(8, 8, 3), Raster::new(4, 4, 3)],
            base: Raster::filled(2, 2, 3, 300.0),
        };
        let mut seen = Vec::new();
        let out = collapse_with(fused, |level| {
            seen.push(level);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 0]);
        assert!(out.pixels().pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn test_callback_error_stops_collapse() {
        let fused = FusedPyramid {
            details: vec![Raster::new(4, 4, 3)],
            base: Raster::new(2, 2, 3),
        };
        let err = collapse_with(fused, |_| Err(StackError::Cancelled)).unwrap_err();
        assert!(err.is_cancelled());
    }
}
