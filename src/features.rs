//! Sparse features for alignment
//!
//! Harris corners on a reduced luminance copy, described by normalised
//! intensity patches and matched by brute force with a ratio test and a
//! mutual cross-check. Focus brackets differ mostly by blur, so plain patch
//! correlation is more stable here than binary descriptors.

use rayon::prelude::*;

use crate::config::AlignmentConfig;
use crate::pyramid;
use crate::raster::Raster;

/// Corners weaker than this never count, whatever the relative threshold says.
const MIN_RESPONSE: f32 = 1e4;
const GRID: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub response: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    /// Squared distance between the two unit descriptors, in `[0, 4]`.
    pub distance: f32,
}

/// Keypoints and descriptors of one image, in detection-image coordinates.
/// Multiply by `scale` to get full-resolution pixels.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    descriptors: Vec<f32>,
    descriptor_len: usize,
    pub scale: f64,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn descriptor(&self, i: usize) -> &[f32] {
        &self.descriptors[i * self.descriptor_len..(i + 1) * self.descriptor_len]
    }
}

/// Luminance reduced by powers of two until the longest side fits
/// `max_dimension`. Returns the image and the factor back to full size.
pub fn detection_image(img: &Raster, max_dimension: usize) -> (Raster, f64) {
    let mut gray = img.luminance();
    let mut scale = 1.0;
    while gray.width().max(gray.height()) > max_dimension.max(1) && gray.width().min(gray.height()) > 1 {
        gray = pyramid::reduce(&gray);
        scale *= 2.0;
    }
    (gray, scale)
}

fn sobel(gray: &Raster) -> (Raster, Raster) {
    let (w, h) = gray.dimensions();
    let mut gx = Raster::new(w, h, 1);
    let mut gy = Raster::new(w, h, 1);
    if w < 3 || h < 3 {
        return (gx, gy);
    }
    gx.data_mut()
        .par_chunks_mut(w)
        .zip(gy.data_mut().par_chunks_mut(w))
        .enumerate()
        .filter(|(y, _)| *y > 0 && *y < h - 1)
        .for_each(|(y, (rx, ry))| {
            let (up, mid, down) = (gray.row(y - 1), gray.row(y), gray.row(y + 1));
            for x in 1..w - 1 {
                rx[x] = (up[x + 1] + 2.0 * mid[x + 1] + down[x + 1]) - (up[x - 1] + 2.0 * mid[x - 1] + down[x - 1]);
                ry[x] = (down[x - 1] + 2.0 * down[x] + down[x + 1]) - (up[x - 1] + 2.0 * up[x] + up[x + 1]);
            }
        });
    (gx, gy)
}

/// Harris corner response `det(M) - k * trace(M)²` over a 3x3 window.
pub fn harris_response(gray: &Raster, k: f32) -> Raster {
    let (w, h) = gray.dimensions();
    let (gx, gy) = sobel(gray);
    let tensor: Vec<f32> = gx
        .data()
        .par_iter()
        .zip(gy.data().par_iter())
        .flat_map_iter(|(&x, &y)| [x * x, y * y, x * y])
        .collect();
    let tensor = match Raster::from_vec(w, h, 3, tensor) {
        Some(t) => t.box_blurred(1),
        None => return Raster::new(w, h, 1),
    };
    let data = tensor
        .data()
        .par_chunks(3)
        .map(|m| {
            let det = m[0] * m[1] - m[2] * m[2];
            let trace = m[0] + m[1];
            det - k * trace * trace
        })
        .collect();
    Raster::from_vec(w, h, 1, data).unwrap_or_else(|| Raster::new(w, h, 1))
}

/// Local maxima of the Harris response, spread over a coarse grid so one
/// busy region cannot take every slot.
pub fn detect_corners(gray: &Raster, config: &AlignmentConfig) -> Vec<Keypoint> {
    let (w, h) = gray.dimensions();
    let border = config.descriptor_radius + 1;
    if w <= 2 * border || h <= 2 * border {
        return Vec::new();
    }
    let response = harris_response(gray, config.harris_k);
    let peak = response.data().iter().cloned().fold(0.0f32, f32::max);
    let threshold = (peak * config.harris_threshold).max(MIN_RESPONSE);

    let candidates: Vec<Keypoint> = (border..h - border)
        .into_par_iter()
        .flat_map_iter(|y| {
            let response = &response;
            (border..w - border).filter_map(move |x| {
                let r = response.get(x, y, 0);
                if r < threshold {
                    return None;
                }
                for dy in 0..3 {
                    for dx in 0..3 {
                        if (dx, dy) == (1, 1) {
                            continue;
                        }
                        let n = response.get(x + dx - 1, y + dy - 1, 0);
                        // Plateaus keep only their first sample in scan order.
                        if n > r || (n == r && (dy, dx) < (1, 1)) {
                            return None;
                        }
                    }
                }
                Some(Keypoint {
                    x: x as f32,
                    y: y as f32,
                    response: r,
                })
            })
        })
        .collect();

    let per_cell = config.max_keypoints.div_ceil(GRID * GRID).max(1);
    let mut cells: Vec<Vec<Keypoint>> = vec![Vec::new(); GRID * GRID];
    for kp in candidates {
        let cx = (kp.x as usize * GRID / w).min(GRID - 1);
        let cy = (kp.y as usize * GRID / h).min(GRID - 1);
        cells[cy * GRID + cx].push(kp);
    }

    let mut keypoints: Vec<Keypoint> = cells
        .into_iter()
        .flat_map(|mut cell| {
            cell.sort_by(|a, b| b.response.total_cmp(&a.response));
            cell.truncate(per_cell);
            cell
        })
        .collect();
    keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
    keypoints.truncate(config.max_keypoints);
    keypoints
}

/// Zero-mean, unit-norm patch sampled every second pixel within `radius`.
/// `None` for flat patches or patches that leave the image.
fn describe(smooth: &Raster, kp: &Keypoint, radius: usize) -> Option<Vec<f32>> {
    let (x, y) = (kp.x as usize, kp.y as usize);
    if x < radius || y < radius || x + radius >= smooth.width() || y + radius >= smooth.height() {
        return None;
    }
    let mut patch = Vec::with_capacity((radius + 1) * (radius + 1));
    for py in (y - radius..=y + radius).step_by(2) {
        for px in (x - radius..=x + radius).step_by(2) {
            patch.push(smooth.get(px, py, 0));
        }
    }
    let mean = patch.iter().sum::<f32>() / patch.len() as f32;
    patch.iter_mut().for_each(|v| *v -= mean);
    let norm = patch.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < 1e-3 {
        return None;
    }
    patch.iter_mut().for_each(|v| *v /= norm);
    Some(patch)
}

pub fn extract(img: &Raster, config: &AlignmentConfig) -> FeatureSet {
    let (gray, scale) = detection_image(img, config.detect_max_dimension);
    let corners = detect_corners(&gray, config);
    let smooth = gray.box_blurred(1);

    let described: Vec<(Keypoint, Vec<f32>)> = corners
        .par_iter()
        .filter_map(|kp| describe(&smooth, kp, config.descriptor_radius).map(|d| (*kp, d)))
        .collect();

    let descriptor_len = described.first().map(|(_, d)| d.len()).unwrap_or(0);
    let mut keypoints = Vec::with_capacity(described.len());
    let mut descriptors = Vec::with_capacity(described.len() * descriptor_len);
    for (kp, d) in described {
        keypoints.push(kp);
        descriptors.extend(d);
    }

    log::debug!(
        "Extracted {} features on {}x{} detection image (scale {})",
        keypoints.len(),
        gray.width(),
        gray.height(),
        scale
    );

    FeatureSet {
        keypoints,
        descriptors,
        descriptor_len,
        scale,
    }
}

fn ssd(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Best and second-best distance from `d` into `set`.
fn two_nearest(d: &[f32], set: &FeatureSet) -> Option<(usize, f32, f32)> {
    let mut best = (usize::MAX, f32::INFINITY);
    let mut second = f32::INFINITY;
    for j in 0..set.len() {
        let dist = ssd(d, set.descriptor(j));
        if dist < best.1 {
            second = best.1;
            best = (j, dist);
        } else if dist < second {
            second = dist;
        }
    }
    (best.0 != usize::MAX).then_some((best.0, best.1, second))
}

/// Brute-force matching with Lowe's ratio test (on distances, not squared
/// distances) and a mutual nearest-neighbour check.
pub fn match_features(query: &FeatureSet, train: &FeatureSet, ratio: f32) -> Vec<FeatureMatch> {
    if query.is_empty() || train.is_empty() || query.descriptor_len != train.descriptor_len {
        return Vec::new();
    }
    let ratio_sq = ratio * ratio;

    let reverse: Vec<Option<usize>> = (0..train.len())
        .into_par_iter()
        .map(|j| two_nearest(train.descriptor(j), query).map(|(i, _, _)| i))
        .collect();

    (0..query.len())
        .into_par_iter()
        .filter_map(|i| {
            let (j, best, second) = two_nearest(query.descriptor(i), train)?;
            if second.is_finite() && best >= ratio_sq * second {
                return None;
            }
            if reverse[j] != Some(i) {
                return None;
            }
            Some(FeatureMatch {
                query: i,
                train: j,
                distance: best,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn texture(w: usize, h: usize, seed: u64) -> Raster {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..w * h).map(|_| rng.gen_range(0.0..255.0)).collect();
        Raster::from_vec(w, h, 1, data).unwrap().box_blurred(1)
    }

    fn shifted(src: &Raster, dx: usize, dy: usize) -> Raster {
        let mut out = Raster::new(src.width(), src.height(), 1);
        for y in dy..src.height() {
            for x in dx..src.width() {
                out.set(x, y, 0, src.get(x - dx, y - dy, 0));
            }
        }
        out
    }

    #[test]
    fn test_flat_image_has_no_corners() {
        let flat = Raster::filled(64, 64, 1, 90.0);
        let features = extract(&flat, &AlignmentConfig::default());
        assert!(features.is_empty());
    }

    #[test]
    fn test_detection_image_scale() {
        let img = Raster::filled(300, 100, 3, 1.0);
        let (gray, scale) = detection_image(&img, 80);
        assert_eq!(gray.dimensions(), (75, 25));
        assert_eq!(scale, 4.0);
        assert_eq!(gray.channels(), 1);
    }

    #[test]
    fn test_corners_respect_budget_and_border() {
        let config = AlignmentConfig {
            max_keypoints: 50,
            ..AlignmentConfig::default()
        };
        let img = texture(128, 96, 3);
        let corners = detect_corners(&img, &config);
        assert!(!corners.is_empty());
        assert!(corners.len() <= 50);
        let r = config.descriptor_radius as f32;
        assert!(corners.iter().all(|k| k.x > r && k.y > r && k.x < 128.0 - r && k.y < 96.0 - r));
    }

    #[test]
    fn test_matches_follow_a_shift() {
        let config = AlignmentConfig::default();
        let reference = texture(160, 120, 17);
        let moved = shifted(&reference, 6, 4);
        let a = extract(&moved, &config);
        let b = extract(&reference, &config);
        let matches = match_features(&a, &b, config.match_ratio);
        assert!(matches.len() > 30);

        let consistent = matches
            .iter()
            .filter(|m| {
                let (p, q) = (a.keypoints[m.query], b.keypoints[m.train]);
                (p.x - q.x - 6.0).abs() < 0.5 && (p.y - q.y - 4.0).abs() < 0.5
            })
            .count();
        assert!(consistent * 10 >= matches.len() * 9);
    }
}
