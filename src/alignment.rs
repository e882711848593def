use std::fmt;
use std::path::PathBuf;

use rayon::prelude::*;

use crate::config::{AlignmentConfig, MotionModel};
use crate::error::StackError;
use crate::features::{self, FeatureSet};
use crate::image_io::SourceImage;
use crate::ransac::{self, AffineEstimator, HomographyEstimator, PointPair, RansacOptions};
use crate::raster::Raster;
use crate::transform::Transform;

/// An image that could not be registered against the reference. It is left
/// out of fusion; the run still succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentWarning {
    pub index: usize,
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for AlignmentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image {} ({}) not aligned: {}", self.index, self.path.display(), self.reason)
    }
}

/// Pixels in the reference frame plus a one-channel validity mask: 1.0 where
/// the warp had source data, 0.0 where it did not.
#[derive(Debug, Clone)]
pub struct AlignedImage {
    pub pixels: Raster,
    pub mask: Raster,
}

impl AlignedImage {
    /// Wrap an image that is already in the reference frame.
    pub fn unwarped(pixels: Raster) -> Self {
        let mask = Raster::filled(pixels.width(), pixels.height(), 1, 1.0);
        Self { pixels, mask }
    }
}

/// Estimates transforms against one reference image. The reference features
/// are extracted once and shared by every worker.
pub struct Aligner {
    reference: FeatureSet,
    reference_index: usize,
    width: usize,
    height: usize,
    config: AlignmentConfig,
}

impl Aligner {
    /// Fails with [`StackError::ReferenceFailure`] when the reference has
    /// too few features for any image to reach `min_matches` against it.
    pub fn new(reference: &Raster, reference_index: usize, config: &AlignmentConfig) -> Result<Self, StackError> {
        let start = std::time::Instant::now();
        let features = features::extract(reference, config);
        log::info!(
            "Reference image {}: {} features in {:?}",
            reference_index,
            features.len(),
            start.elapsed()
        );
        if features.len() < config.min_matches {
            log::error!(
                "Reference image {} has only {} features, {} matches are required",
                reference_index,
                features.len(),
                config.min_matches
            );
            return Err(StackError::ReferenceFailure {
                index: reference_index,
                reason: format!(
                    "only {} features found, need at least {}",
                    features.len(),
                    config.min_matches
                ),
            });
        }
        Ok(Self {
            reference: features,
            reference_index,
            width: reference.width(),
            height: reference.height(),
            config: config.clone(),
        })
    }

    pub fn reference_index(&self) -> usize {
        self.reference_index
    }

    /// Transform mapping `image` into the reference frame. An `Err` carries the
    /// reason the image counts as unaligned.
    pub fn estimate(&self, image: &Raster) -> Result<Transform, String> {
        if image.dimensions() != (self.width, self.height) {
            return Err(format!(
                "size {}x{} differs from reference {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            ));
        }

        let moving = features::extract(image, &self.config);
        let matches = features::match_features(&moving, &self.reference, self.config.match_ratio);
        if matches.len() < self.config.min_matches {
            return Err(format!(
                "only {} feature matches (need {})",
                matches.len(),
                self.config.min_matches
            ));
        }

        let pairs: Vec<PointPair> = matches
            .iter()
            .map(|m| {
                let src = moving.keypoints[m.query];
                let dst = self.reference.keypoints[m.train];
                PointPair {
                    src: (src.x as f64, src.y as f64),
                    dst: (dst.x as f64, dst.y as f64),
                }
            })
            .collect();

        let opts = RansacOptions {
            max_iters: self.config.ransac_iterations,
            thresh: self.config.ransac_threshold,
            min_inliers: self.config.min_matches,
            confidence: self.config.ransac_confidence,
            seed: self.config.ransac_seed,
        };
        let result = match self.config.motion_model {
            MotionModel::Homography => ransac::ransac::<HomographyEstimator>(&pairs, &opts),
            MotionModel::Affine => ransac::ransac::<AffineEstimator>(&pairs, &opts),
        };
        let Some(model) = result.model else {
            return Err(format!(
                "no consistent {} model among {} matches",
                self.config.motion_model,
                pairs.len()
            ));
        };

        let transform = model
            .rescaled(moving.scale)
            .ok_or_else(|| "degenerate transform".to_string())?;
        if !transform.is_plausible(self.width as f64, self.height as f64) {
            return Err("implausible transform (extreme scale or perspective)".to_string());
        }

        log::debug!(
            "{} inliers of {} matches, rms {:.3}px after {} iterations",
            result.inliers.len(),
            pairs.len(),
            result.inlier_rms,
            result.iters
        );
        Ok(transform)
    }
}

/// Per-image transforms for an in-memory image set. `None` marks an unaligned
/// image, explained by the matching warning. The reference always gets the
/// identity.
pub fn align(
    images: &[SourceImage],
    reference_index: usize,
    config: &AlignmentConfig,
) -> Result<(Vec<Option<Transform>>, Vec<AlignmentWarning>), StackError> {
    if images.is_empty() {
        return Err(StackError::EmptyInput);
    }
    let reference = images.get(reference_index).ok_or(StackError::InvalidReference {
        index: reference_index,
        count: images.len(),
    })?;
    let aligner = Aligner::new(&reference.to_raster(), reference_index, config)?;

    let results: Vec<Result<Transform, String>> = images
        .par_iter()
        .enumerate()
        .map(|(i, img)| {
            if i == reference_index {
                Ok(Transform::identity())
            } else {
                aligner.estimate(&img.to_raster())
            }
        })
        .collect();

    let mut transforms = Vec::with_capacity(images.len());
    let mut warnings = Vec::new();
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(t) => transforms.push(Some(t)),
            Err(reason) => {
                let warning = AlignmentWarning {
                    index: i,
                    path: images[i].path.clone(),
                    reason,
                };
                log::warn!("{}", warning);
                warnings.push(warning);
                transforms.push(None);
            }
        }
    }
    Ok((transforms, warnings))
}

/// Catmull-Rom weight for distance `t` from a tap.
fn cubic_weight(t: f64) -> f64 {
    const A: f64 = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        (A + 2.0) * t * t * t - (A + 3.0) * t * t + 1.0
    } else if t < 2.0 {
        A * t * t * t - 5.0 * A * t * t + 8.0 * A * t - 4.0 * A
    } else {
        0.0
    }
}

/// Slack on the source bounds so round-off from a near-identity transform
/// does not invalidate the border.
const EDGE_EPS: f64 = 1e-6;

/// Resample `src` into the reference frame of size `width`x`height`.
/// `transform` maps source coordinates to reference coordinates.
pub fn warp(src: &Raster, transform: &Transform, width: usize, height: usize) -> AlignedImage {
    if transform.is_identity(1e-12) && src.dimensions() == (width, height) {
        return AlignedImage::unwarped(src.clone());
    }

    let c = src.channels();
    let mut pixels = Raster::new(width, height, c);
    let mut mask = Raster::new(width, height, 1);
    if pixels.is_empty() || src.is_empty() {
        return AlignedImage { pixels, mask };
    }
    let Some(inverse) = transform.inverse() else {
        log::warn!("Transform is not invertible; image has no valid pixels");
        return AlignedImage { pixels, mask };
    };

    let (sw, sh) = (src.width() as f64, src.height() as f64);
    let max_x = src.width() as isize - 1;
    let max_y = src.height() as isize - 1;

    pixels
        .data_mut()
        .par_chunks_mut(width * c)
        .zip(mask.data_mut().par_chunks_mut(width))
        .enumerate()
        .for_each(|(y, (row, mask_row))| {
            let mut acc = vec![0f64; c];
            for x in 0..width {
                let Some((sx, sy)) = inverse.apply(x as f64, y as f64) else {
                    continue;
                };
                if !(sx >= -EDGE_EPS && sy >= -EDGE_EPS && sx <= sw - 1.0 + EDGE_EPS && sy <= sh - 1.0 + EDGE_EPS) {
                    continue;
                }
                let (fx, fy) = (sx.floor(), sy.floor());
                let (ix, iy) = (fx as isize, fy as isize);
                let wx: [f64; 4] = std::array::from_fn(|k| cubic_weight(sx - (fx + k as f64 - 1.0)));
                let wy: [f64; 4] = std::array::from_fn(|k| cubic_weight(sy - (fy + k as f64 - 1.0)));

                acc.iter_mut().for_each(|a| *a = 0.0);
                for (ky, wyk) in wy.iter().enumerate() {
                    if *wyk == 0.0 {
                        continue;
                    }
                    let ty = (iy + ky as isize - 1).clamp(0, max_y) as usize;
                    let src_row = src.row(ty);
                    for (kx, wxk) in wx.iter().enumerate() {
                        let weight = wxk * wyk;
                        if weight == 0.0 {
                            continue;
                        }
                        let tx = (ix + kx as isize - 1).clamp(0, max_x) as usize;
                        for (a, s) in acc.iter_mut().zip(&src_row[tx * c..tx * c + c]) {
                            *a += weight * *s as f64;
                        }
                    }
                }
                for (dst, a) in row[x * c..x * c + c].iter_mut().zip(&acc) {
                    *dst = a.clamp(0.0, 255.0) as f32;
                }
                mask_row[x] = 1.0;
            }
        });

    AlignedImage { pixels, mask }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn texture(w: u32, h: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise: Vec<u8> = (0..w * h).map(|_| rng.gen()).collect();
        // Soften the noise so corners survive small resampling differences.
        let blurred = Raster::from_vec(w as usize, h as usize, 1, noise.iter().map(|&v| v as f32).collect())
            .unwrap()
            .box_blurred(1);
        RgbImage::from_fn(w, h, |x, y| {
            let v = blurred.get(x as usize, y as usize, 0) as u8;
            Rgb([v, v.wrapping_add(40), 255 - v])
        })
    }

    fn shift(img: &RgbImage, dx: u32, dy: u32) -> RgbImage {
        RgbImage::from_fn(img.width(), img.height(), |x, y| {
            if x >= dx && y >= dy {
                *img.get_pixel(x - dx, y - dy)
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn test_cubic_weights_interpolate() {
        assert_eq!(cubic_weight(0.0), 1.0);
        assert_eq!(cubic_weight(1.0), 0.0);
        assert_eq!(cubic_weight(2.0), 0.0);
        let sum: f64 = (-1..=2).map(|k| cubic_weight(0.3 - k as f64)).sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_warp_translation_marks_uncovered_border() {
        let src = Raster::from_rgb(&texture(40, 30, 1));
        let out = warp(&src, &Transform::translation(3.0, 2.0), 40, 30);
        assert_eq!(out.mask.get(2, 10, 0), 0.0);
        assert_eq!(out.mask.get(10, 1, 0), 0.0);
        assert_eq!(out.mask.get(3, 2, 0), 1.0);
        for c in 0..3 {
            assert!((out.pixels.get(13, 12, c) - src.get(10, 10, c)).abs() < 1e-3);
        }
    }

    #[test]
    fn test_identity_warp_is_a_copy() {
        let src = Raster::from_rgb(&texture(20, 10, 2));
        let out = warp(&src, &Transform::identity(), 20, 10);
        assert_eq!(out.pixels, src);
        assert!(out.mask.data().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_estimate_recovers_shift() {
        let reference = texture(240, 180, 9);
        let moved = shift(&reference, 5, 3);
        let aligner = Aligner::new(&Raster::from_rgb(&reference), 0, &AlignmentConfig::default()).unwrap();
        let t = aligner.estimate(&Raster::from_rgb(&moved)).unwrap();
        let (x, y) = t.apply(100.0, 100.0).unwrap();
        assert!((x - 95.0).abs() < 0.5, "x = {x}");
        assert!((y - 97.0).abs() < 0.5, "y = {y}");
    }

    #[test]
    fn test_align_flags_featureless_image() {
        let reference = texture(120, 90, 4);
        let images = vec![
            SourceImage::new("ref.png", reference.clone()),
            SourceImage::new("flat.png", RgbImage::from_pixel(120, 90, Rgb([128, 128, 128]))),
            SourceImage::new("same.png", reference),
        ];
        let (transforms, warnings) = align(&images, 0, &AlignmentConfig::default()).unwrap();
        assert_eq!(transforms.len(), 3);
        assert!(transforms[0].unwrap().is_identity(0.0));
        assert!(transforms[1].is_none());
        assert!(transforms[2].unwrap().is_identity(1e-3));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].index, 1);
    }

    #[test]
    fn test_featureless_reference_is_fatal() {
        let flat = RgbImage::from_pixel(96, 80, Rgb([90, 90, 90]));
        assert!(matches!(
            Aligner::new(&Raster::from_rgb(&flat), 2, &AlignmentConfig::default()),
            Err(StackError::ReferenceFailure { index: 2, .. })
        ));

        let images = vec![
            SourceImage::new("flat.png", flat),
            SourceImage::new("a.png", texture(96, 80, 11)),
            SourceImage::new("b.png", texture(96, 80, 12)),
        ];
        let err = align(&images, 0, &AlignmentConfig::default()).unwrap_err();
        assert!(matches!(err, StackError::ReferenceFailure { index: 0, .. }));
    }

    #[test]
    fn test_align_rejects_bad_reference() {
        let images = vec![SourceImage::new("a.png", RgbImage::new(8, 8))];
        let err = align(&images, 3, &AlignmentConfig::default()).unwrap_err();
        assert!(matches!(err, StackError::InvalidReference { index: 3, count: 1 }));
    }
}
