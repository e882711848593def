//! Gaussian / Laplacian pyramids
//!
//! `reduce` and `expand` are the classic Burt–Adelson operators with the
//! separable 5-tap binomial kernel and reflect-101 borders. Level sizes are
//! rounded up, so a level of width `n` reduces to `(n + 1) / 2`.

use rayon::prelude::*;

use crate::alignment::AlignedImage;
use crate::error::StoreError;
use crate::raster::{reflect_index, Raster};
use crate::store::{LevelKey, PyramidStore};

const KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// Size of the level below one of `n` samples.
pub fn reduced_len(n: usize) -> usize {
    n.div_ceil(2)
}

/// Dimensions of levels `0..=depth` for a `width`x`height` image.
pub fn level_dims(width: usize, height: usize, depth: usize) -> Vec<(usize, usize)> {
    let mut dims = Vec::with_capacity(depth + 1);
    let (mut w, mut h) = (width, height);
    for _ in 0..=depth {
        dims.push((w, h));
        w = reduced_len(w);
        h = reduced_len(h);
    }
    dims
}

/// Blur with the binomial kernel and keep every second sample in both axes.
pub fn reduce(src: &Raster) -> Raster {
    let (w, h, c) = (src.width(), src.height(), src.channels());
    if src.is_empty() {
        return src.clone();
    }
    let (ow, oh) = (reduced_len(w), reduced_len(h));

    let mut horizontal = Raster::new(ow, h, c);
    horizontal
        .data_mut()
        .par_chunks_mut(ow * c)
        .enumerate()
        .for_each(|(y, out)| {
            let row = src.row(y);
            for x in 0..ow {
                for (k, weight) in KERNEL.iter().enumerate() {
                    let sx = reflect_index(2 * x as isize + k as isize - 2, w);
                    for ch in 0..c {
                        out[x * c + ch] += weight * row[sx * c + ch];
                    }
                }
            }
        });

    let mut out = Raster::new(ow, oh, c);
    out.data_mut()
        .par_chunks_mut(ow * c)
        .enumerate()
        .for_each(|(y, dst)| {
            for (k, weight) in KERNEL.iter().enumerate() {
                let sy = reflect_index(2 * y as isize + k as isize - 2, h);
                for (d, s) in dst.iter_mut().zip(horizontal.row(sy)) {
                    *d += weight * s;
                }
            }
        });
    out
}

/// Taps of the upsampling filter for output index `x`: pairs of
/// `(source index, weight)`. Zero-insertion followed by the kernel scaled by
/// two, so every output sample's weights sum to one.
fn expand_taps(x: usize, src_len: usize) -> impl Iterator<Item = (usize, f32)> {
    let x = x as isize;
    (-2..=2isize).filter_map(move |k| {
        let pos = x + k;
        if pos.rem_euclid(2) != 0 {
            return None;
        }
        let j = reflect_index(pos.div_euclid(2), src_len);
        Some((j, 2.0 * KERNEL[(2 - k) as usize]))
    })
}

/// Upsample `src` to exactly `width`x`height` (the size of the finer level).
pub fn expand(src: &Raster, width: usize, height: usize) -> Raster {
    let (sw, sh, c) = (src.width(), src.height(), src.channels());
    if src.is_empty() {
        return Raster::new(width, height, c);
    }

    let mut horizontal = Raster::new(width, sh, c);
    horizontal
        .data_mut()
        .par_chunks_mut(width * c)
        .enumerate()
        .for_each(|(y, out)| {
            let row = src.row(y);
            for x in 0..width {
                for (j, weight) in expand_taps(x, sw) {
                    for ch in 0..c {
                        out[x * c + ch] += weight * row[j * c + ch];
                    }
                }
            }
        });

    let mut out = Raster::new(width, height, c);
    out.data_mut()
        .par_chunks_mut(width * c)
        .enumerate()
        .for_each(|(y, dst)| {
            for (j, weight) in expand_taps(y, sh) {
                for (d, s) in dst.iter_mut().zip(horizontal.row(j)) {
                    *d += weight * s;
                }
            }
        });
    out
}

/// `a - b`, element-wise. Both must have the same shape.
fn subtract(a: &Raster, b: &Raster) -> Raster {
    let mut out = a.clone();
    out.data_mut()
        .par_iter_mut()
        .zip(b.data().par_iter())
        .for_each(|(o, s)| *o -= s);
    out
}

/// Decomposes aligned images into pyramids and hands every level to the
/// store.
///
/// For each image this writes Gaussian levels `0..=depth`, Laplacian levels
/// `0..depth` and mask levels `0..=depth`.
pub struct PyramidBuilder<'a> {
    store: &'a PyramidStore,
    depth: usize,
}

impl<'a> PyramidBuilder<'a> {
    pub fn new(store: &'a PyramidStore, depth: usize) -> Self {
        Self { store, depth }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn build(&self, index: usize, image: AlignedImage) -> Result<(), StoreError> {
        let start = std::time::Instant::now();
        let AlignedImage { pixels, mask } = image;

        let mut current = pixels;
        for level in 0..self.depth {
            let next = reduce(&current);
            let up = expand(&next, current.width(), current.height());
            let detail = subtract(&current, &up);
            self.store.put(LevelKey::laplacian(index, level), detail)?;
            self.store.put(LevelKey::gaussian(index, level), current)?;
            current = next;
        }
        self.store.put(LevelKey::gaussian(index, self.depth), current)?;

        let mut mask = mask;
        for level in 0..self.depth {
            let next = reduce(&mask);
            self.store.put(LevelKey::mask(index, level), mask)?;
            mask = next;
        }
        self.store.put(LevelKey::mask(index, self.depth), mask)?;

        log::debug!("Built {}-level pyramid for image {} in {:?}", self.depth, index, start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise(w: usize, h: usize, c: usize, seed: u64) -> Raster {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..w * h * c).map(|_| rng.gen_range(0.0..255.0)).collect();
        Raster::from_vec(w, h, c, data).unwrap()
    }

    #[test]
    fn test_level_dims_round_up() {
        assert_eq!(level_dims(7, 4, 3), vec![(7, 4), (4, 2), (2, 1), (1, 1)]);
    }

    #[test]
    fn test_constant_survives_reduce_and_expand() {
        let flat = Raster::filled(13, 9, 3, 42.0);
        let small = reduce(&flat);
        assert_eq!(small.dimensions(), (7, 5));
        assert!(small.data().iter().all(|v| (v - 42.0).abs() < 1e-4));
        let big = expand(&small, 13, 9);
        assert!(big.data().iter().all(|v| (v - 42.0).abs() < 1e-4));
    }

    #[test]
    fn test_reduce_single_pixel() {
        let one = Raster::filled(1, 1, 1, 5.0);
        let r = reduce(&one);
        assert_eq!(r.dimensions(), (1, 1));
        assert!((r.get(0, 0, 0) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_builder_writes_every_level() {
        let store = PyramidStore::in_memory(1000);
        let builder = PyramidBuilder::new(&store, 3);
        let image = AlignedImage {
            pixels: noise(21, 10, 3, 5),
            mask: Raster::filled(21, 10, 1, 1.0),
        };
        builder.build(2, image).unwrap();

        assert_eq!(store.len(), 3 * 3 + 2);
        let dims = level_dims(21, 10, 3);
        for (level, &(w, h)) in dims.iter().enumerate() {
            let g = store.get(LevelKey::gaussian(2, level), |r| r.dimensions()).unwrap();
            assert_eq!(g, (w, h));
            let m = store.get(LevelKey::mask(2, level), |r| (r.dimensions(), r.channels())).unwrap();
            assert_eq!(m, ((w, h), 1));
        }
        assert!(!store.contains(LevelKey::laplacian(2, 3)));
    }

    #[test]
    fn test_laplacian_plus_expanded_gaussian_is_exact() {
        let store = PyramidStore::in_memory(1000);
        let img = noise(17, 12, 3, 11);
        PyramidBuilder::new(&store, 1)
            .build(
                0,
                AlignedImage {
                    pixels: img.clone(),
                    mask: Raster::filled(17, 12, 1, 1.0),
                },
            )
            .unwrap();
        let base = store.get_cloned(LevelKey::gaussian(0, 1)).unwrap();
        let detail = store.get_cloned(LevelKey::laplacian(0, 0)).unwrap();
        let up = expand(&base, 17, 12);
        for ((u, d), o) in up.data().iter().zip(detail.data()).zip(img.data()) {
            assert!((u + d - o).abs() < 1e-3);
        }
    }
}
