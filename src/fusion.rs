//! Sharpness-driven fusion of the stored pyramids
//!
//! Detail levels: every image scores each pixel with [`focus_map`], the
//! sharpest valid image wins, and the win map of each image is box-blurred
//! into a soft weight before the detail coefficients are averaged. The
//! blurred selection is what keeps region boundaries free of seams.
//!
//! Base level: mask-weighted mean of the coarsest Gaussian levels.

use rayon::prelude::*;

use crate::config::FusionConfig;
use crate::error::StoreError;
use crate::raster::Raster;
use crate::sharpness::focus_map;
use crate::store::{LevelKey, PyramidStore};

const NO_WINNER: u32 = u32::MAX;

/// One bit per pixel: does the image have data there at this level.
struct Validity {
    bits: Vec<u64>,
}

impl Validity {
    fn from_mask(mask: &Raster, threshold: f32) -> Self {
        let bits = mask
            .data()
            .par_chunks(64)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v >= threshold)
                    .fold(0u64, |word, (bit, _)| word | (1 << bit))
            })
            .collect();
        Self { bits }
    }

    fn get(&self, pixel: usize) -> bool {
        (self.bits[pixel / 64] >> (pixel % 64)) & 1 == 1
    }
}

/// One fused Laplacian level per detail index plus the fused base.
#[derive(Debug, Clone)]
pub struct FusedPyramid {
    pub details: Vec<Raster>,
    pub base: Raster,
}

impl FusedPyramid {
    pub fn depth(&self) -> usize {
        self.details.len()
    }
}

pub struct FocusFuser<'a> {
    store: &'a PyramidStore,
    images: Vec<usize>,
    config: FusionConfig,
}

impl<'a> FocusFuser<'a> {
    /// `images` are the indices taking part; order does not matter, ties are
    /// always resolved towards the lowest index.
    pub fn new(store: &'a PyramidStore, images: &[usize], config: &FusionConfig) -> Self {
        let mut images = images.to_vec();
        images.sort_unstable();
        images.dedup();
        Self {
            store,
            images,
            config: config.clone(),
        }
    }

    pub fn images(&self) -> &[usize] {
        &self.images
    }

    fn first_image(&self, key: LevelKey) -> Result<usize, StoreError> {
        self.images.first().copied().ok_or(StoreError::Missing(key))
    }

    fn validity(&self, image: usize, level: usize) -> Result<Validity, StoreError> {
        let threshold = self.config.validity_threshold;
        self.store
            .get(LevelKey::mask(image, level), |m| Validity::from_mask(m, threshold))
    }

    /// Fuse Laplacian level `level` across all participating images.
    pub fn fuse_detail_level(&self, level: usize) -> Result<Raster, StoreError> {
        let first = self.first_image(LevelKey::laplacian(0, level))?;
        let (w, h, c) = self
            .store
            .get(LevelKey::laplacian(first, level), |l| (l.width(), l.height(), l.channels()))?;
        let n = w * h;

        // Pass 1: winner-take-all on the focus measure. Validity is kept for
        // pass 2 so masks are read from the store once per level.
        let mut best = vec![f32::NEG_INFINITY; n];
        let mut winner = vec![NO_WINNER; n];
        let mut validity = Vec::with_capacity(self.images.len());
        for &i in &self.images {
            let energy = self
                .store
                .get(LevelKey::laplacian(i, level), |l| focus_map(l, self.config.sharpness_window))?;
            let valid = self.validity(i, level)?;
            best.par_iter_mut()
                .zip(winner.par_iter_mut())
                .zip(energy.data().par_iter())
                .enumerate()
                .for_each(|(p, ((b, win), e))| {
                    // Strict comparison: images come in ascending order, so
                    // the lowest index keeps ties.
                    if valid.get(p) && *e > *b {
                        *b = *e;
                        *win = i as u32;
                    }
                });
            validity.push(valid);
        }
        drop(best);

        // Pass 2: soften each image's selection and blend.
        let mut fused = Raster::new(w, h, c);
        let mut weight_sum = vec![0f32; n];
        for (&i, valid) in self.images.iter().zip(&validity) {
            if !winner.par_iter().any(|win| *win == i as u32) {
                continue;
            }
            let indicator: Vec<f32> = winner
                .par_iter()
                .map(|win| if *win == i as u32 { 1.0 } else { 0.0 })
                .collect();
            let mut weight = match Raster::from_vec(w, h, 1, indicator) {
                Some(r) => r.box_blurred(self.config.blend_radius),
                None => continue,
            };
            weight
                .data_mut()
                .par_iter_mut()
                .enumerate()
                .for_each(|(p, wt)| {
                    if !valid.get(p) {
                        *wt = 0.0;
                    }
                });

            self.store.get(LevelKey::laplacian(i, level), |l| {
                fused
                    .data_mut()
                    .par_chunks_mut(c)
                    .zip(l.data().par_chunks(c))
                    .zip(weight.data().par_iter().zip(weight_sum.par_iter_mut()))
                    .for_each(|((dst, src), (wt, sum))| {
                        if *wt > 0.0 {
                            for (d, s) in dst.iter_mut().zip(src) {
                                *d += wt * s;
                            }
                            *sum += wt;
                        }
                    });
            })?;
        }

        // Nothing valid anywhere leaves a zero coefficient; the base carries
        // those pixels.
        fused
            .data_mut()
            .par_chunks_mut(c)
            .zip(weight_sum.par_iter())
            .for_each(|(px, sum)| {
                if *sum > 0.0 {
                    px.iter_mut().for_each(|v| *v /= sum);
                } else {
                    px.iter_mut().for_each(|v| *v = 0.0);
                }
            });
        Ok(fused)
    }

    /// Mask-weighted average of the coarsest Gaussian level. Pixels where no
    /// image is valid fall back to the plain mean of all images.
    pub fn fuse_base(&self, level: usize) -> Result<Raster, StoreError> {
        let first = self.first_image(LevelKey::gaussian(0, level))?;
        let (w, h, c) = self
            .store
            .get(LevelKey::gaussian(first, level), |g| (g.width(), g.height(), g.channels()))?;
        let threshold = self.config.validity_threshold;

        let mut weighted = Raster::new(w, h, c);
        let mut plain = Raster::new(w, h, c);
        let mut weight_sum = vec![0f32; w * h];
        for &i in &self.images {
            let weight: Vec<f32> = self.store.get(LevelKey::mask(i, level), |m| {
                m.data()
                    .par_iter()
                    .map(|v| if *v >= threshold { *v } else { 0.0 })
                    .collect()
            })?;
            self.store.get(LevelKey::gaussian(i, level), |g| {
                weighted
                    .data_mut()
                    .par_chunks_mut(c)
                    .zip(plain.data_mut().par_chunks_mut(c))
                    .zip(g.data().par_chunks(c))
                    .zip(weight.par_iter().zip(weight_sum.par_iter_mut()))
                    .for_each(|(((dst, mean), src), (wt, sum))| {
                        for ((d, m), s) in dst.iter_mut().zip(mean.iter_mut()).zip(src) {
                            *d += wt * s;
                            *m += s;
                        }
                        *sum += wt;
                    });
            })?;
        }

        let count = self.images.len() as f32;
        weighted
            .data_mut()
            .par_chunks_mut(c)
            .zip(plain.data().par_chunks(c))
            .zip(weight_sum.par_iter())
            .for_each(|((px, mean), sum)| {
                if *sum > 0.0 {
                    px.iter_mut().for_each(|v| *v /= sum);
                } else {
                    px.iter_mut().zip(mean).for_each(|(v, m)| *v = m / count);
                }
            });
        Ok(weighted)
    }

    /// Fuse every level of a `depth`-level pyramid.
    pub fn fuse(&self, depth: usize) -> Result<FusedPyramid, StoreError> {
        let details = (0..depth)
            .map(|level| self.fuse_detail_level(level))
            .collect::<Result<Vec<_>, _>>()?;
        let base = self.fuse_base(depth)?;
        Ok(FusedPyramid { details, base })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_image(store: &PyramidStore, index: usize, detail: Raster, base: Raster, mask: Raster) {
        let base_mask = Raster::filled(base.width(), base.height(), 1, 1.0);
        store.put(LevelKey::laplacian(index, 0), detail).unwrap();
        store.put(LevelKey::mask(index, 0), mask).unwrap();
        store.put(LevelKey::gaussian(index, 1), base).unwrap();
        store.put(LevelKey::mask(index, 1), base_mask).unwrap();
    }

    fn stripes(w: usize, h: usize, amplitude: f32) -> Raster {
        let mut r = Raster::new(w, h, 3);
        for y in 0..h {
            for x in 0..w {
                let v = if x % 2 == 0 { amplitude } else { -amplitude };
                for c in 0..3 {
                    r.set(x, y, c, v);
                }
            }
        }
        r
    }

    #[test]
    fn test_identical_inputs_tie_to_lowest_index() {
        let store = PyramidStore::in_memory(100);
        for i in 0..3 {
            put_image(
                &store,
                i,
                stripes(16, 8, 5.0),
                Raster::filled(8, 4, 3, 60.0),
                Raster::filled(16, 8, 1, 1.0),
            );
        }
        let fuser = FocusFuser::new(&store, &[2, 0, 1], &FusionConfig::default());
        let fused = fuser.fuse(1).unwrap();
        assert_eq!(fused.details[0], stripes(16, 8, 5.0));
        assert!(fused.base.data().iter().all(|v| (v - 60.0).abs() < 1e-4));
    }

    #[test]
    fn test_sharper_image_wins_away_from_boundary() {
        let store = PyramidStore::in_memory(100);
        let (w, h) = (40, 8);
        halves(&store, w, h);

        let fuser = FocusFuser::new(&store, &[0, 1], &FusionConfig::default());
        let detail = fuser.fuse_detail_level(0).unwrap();
        assert!((detail.get(2, 4, 0) - 10.0).abs() < 1e-4);
        assert!((detail.get(w - 3, 4, 0).abs() - 10.0).abs() < 1e-4);
        // Blended, but bounded, near the boundary.
        let mid = detail.get(w / 2, 4, 0).abs();
        assert!(mid >= 1.0 && mid <= 10.0);

        let base = fuser.fuse_base(1).unwrap();
        assert!(base.data().iter().all(|v| (v - 20.0).abs() < 1e-4));
    }

    /// Image 0 carries strong detail on the left half, image 1 on the right.
    fn halves(store: &PyramidStore, w: usize, h: usize) {
        let strong = stripes(w, h, 10.0);
        let weak = stripes(w, h, 1.0);
        let mut left = Raster::new(w, h, 3);
        let mut right = Raster::new(w, h, 3);
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    let (l, r) = if x < w / 2 {
                        (strong.get(x, y, c), weak.get(x, y, c))
                    } else {
                        (weak.get(x, y, c), strong.get(x, y, c))
                    };
                    left.set(x, y, c, l);
                    right.set(x, y, c, r);
                }
            }
        }
        let ones = Raster::filled(w, h, 1, 1.0);
        put_image(store, 0, left, Raster::filled(w / 2, h / 2, 3, 10.0), ones.clone());
        put_image(store, 1, right, Raster::filled(w / 2, h / 2, 3, 30.0), ones);
    }

    #[test]
    fn test_masks_are_read_once_per_level() {
        let roomy = PyramidStore::in_memory(100);
        halves(&roomy, 40, 8);
        let expected = FocusFuser::new(&roomy, &[0, 1], &FusionConfig::default())
            .fuse_detail_level(0)
            .unwrap();

        // With one resident level every access to another key is a reload:
        // the size lookup, then per image its Laplacian and mask in the
        // selection pass and its Laplacian again in the blending pass.
        let tight = PyramidStore::in_memory(1);
        halves(&tight, 40, 8);
        let before = tight.reload_count();
        let detail = FocusFuser::new(&tight, &[0, 1], &FusionConfig::default())
            .fuse_detail_level(0)
            .unwrap();
        assert!(tight.reload_count() - before <= 6, "{} reloads", tight.reload_count() - before);
        assert_eq!(detail, expected);
    }

    #[test]
    fn test_validity_bits_follow_the_threshold() {
        let mut mask = Raster::filled(70, 1, 1, 1.0);
        mask.set(3, 0, 0, 0.5);
        mask.set(65, 0, 0, 0.94);
        let valid = Validity::from_mask(&mask, 0.95);
        assert!(valid.get(0) && valid.get(64) && valid.get(69));
        assert!(!valid.get(3) && !valid.get(65));
    }

    #[test]
    fn test_invalid_pixels_are_excluded_and_fall_back() {
        let store = PyramidStore::in_memory(100);
        let mut mask0 = Raster::filled(8, 8, 1, 1.0);
        mask0.set(3, 3, 0, 0.0);
        mask0.set(6, 6, 0, 0.0);
        let mut mask1 = Raster::filled(8, 8, 1, 1.0);
        mask1.set(6, 6, 0, 0.5);

        // Image 0 has more detail, but is invalid at (3, 3).
        put_image(&store, 0, stripes(8, 8, 9.0), Raster::filled(4, 4, 3, 100.0), mask0);
        put_image(&store, 1, stripes(8, 8, 2.0), Raster::filled(4, 4, 3, 50.0), mask1);

        let fuser = FocusFuser::new(&store, &[0, 1], &FusionConfig::default());
        let detail = fuser.fuse_detail_level(0).unwrap();
        assert!((detail.get(3, 3, 0).abs() - 2.0).abs() < 1e-4);
        assert_eq!(detail.get(6, 6, 0), 0.0);

        // Base masks: image 1 invalid everywhere at the base, image 0 valid
        // nowhere at one pixel.
        store.put(LevelKey::mask(1, 1), Raster::filled(4, 4, 1, 0.0)).unwrap();
        let mut base_mask0 = Raster::filled(4, 4, 1, 1.0);
        base_mask0.set(1, 1, 0, 0.0);
        store.put(LevelKey::mask(0, 1), base_mask0).unwrap();

        let base = fuser.fuse_base(1).unwrap();
        assert!((base.get(0, 0, 0) - 100.0).abs() < 1e-4);
        assert!((base.get(1, 1, 0) - 75.0).abs() < 1e-4);
    }

    #[test]
    fn test_no_images_is_an_error() {
        let store = PyramidStore::in_memory(10);
        let fuser = FocusFuser::new(&store, &[], &FusionConfig::default());
        assert!(fuser.fuse(2).is_err());
    }
}
