//! Floating point pixel arrays
//!
//! Every stage of the engine works on `Raster`s: interleaved `f32` samples
//! with an arbitrary channel count. Colour levels use three channels, masks
//! and focus maps use one. Keeping the intermediate data in `f32` avoids the
//! banding that repeated blur/subtract/add would cause at 8-bit depth.

use image::{Rgb, RgbImage};
use rayon::prelude::*;

/// A 2-D array of interleaved `f32` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl Raster {
    /// Zero-filled raster.
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self::filled(width, height, channels, 0.0)
    }

    pub fn filled(width: usize, height: usize, channels: usize, value: f32) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![value; width * height * channels],
        }
    }

    /// Wrap an existing sample buffer. Returns `None` when the length does not
    /// match `width * height * channels`.
    pub fn from_vec(width: usize, height: usize, channels: usize, data: Vec<f32>) -> Option<Self> {
        if data.len() != width * height * channels {
            return None;
        }
        Some(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn from_rgb(img: &RgbImage) -> Self {
        let data = img.as_raw().iter().map(|&v| v as f32).collect();
        Self {
            width: img.width() as usize,
            height: img.height() as usize,
            channels: 3,
            data,
        }
    }

    /// Convert to 8-bit RGB, rounding and clamping to `[0, 255]`.
    /// Single-channel rasters are replicated into grey.
    pub fn to_rgb(&self) -> RgbImage {
        let mut out = RgbImage::new(self.width as u32, self.height as u32);
        for (i, px) in out.pixels_mut().enumerate() {
            let base = i * self.channels;
            let sample = |c: usize| {
                let v = self.data[base + c.min(self.channels - 1)];
                v.round().clamp(0.0, 255.0) as u8
            };
            *px = Rgb([sample(0), sample(1), sample(2)]);
        }
        out
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn same_shape(&self, other: &Raster) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Samples of row `y`, all channels interleaved.
    pub fn row(&self, y: usize) -> &[f32] {
        let stride = self.width * self.channels;
        &self.data[y * stride..(y + 1) * stride]
    }

    pub fn get(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    pub fn set(&mut self, x: usize, y: usize, c: usize, value: f32) {
        self.data[(y * self.width + x) * self.channels + c] = value;
    }

    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }

    /// Rec. 601 luma for three-channel rasters, a copy otherwise.
    pub fn luminance(&self) -> Raster {
        if self.channels != 3 {
            return self.clone();
        }
        let data = self
            .data
            .par_chunks(3)
            .map(|p| 0.299 * p[0] + 0.587 * p[1] + 0.114 * p[2])
            .collect();
        Raster {
            width: self.width,
            height: self.height,
            channels: 1,
            data,
        }
    }

    /// Mean over a `(2r+1)²` window, computed separably. Windows are clipped at
    /// the borders and normalised by the number of samples they cover.
    pub fn box_blurred(&self, radius: usize) -> Raster {
        if radius == 0 || self.is_empty() {
            return self.clone();
        }
        let (w, h, c) = (self.width, self.height, self.channels);
        let stride = w * c;

        let mut horizontal = Raster::new(w, h, c);
        horizontal
            .data
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, out)| {
                let row = self.row(y);
                let mut prefix = vec![0f64; w + 1];
                for ch in 0..c {
                    for x in 0..w {
                        prefix[x + 1] = prefix[x] + row[x * c + ch] as f64;
                    }
                    for x in 0..w {
                        let lo = x.saturating_sub(radius);
                        let hi = (x + radius + 1).min(w);
                        out[x * c + ch] = ((prefix[hi] - prefix[lo]) / (hi - lo) as f64) as f32;
                    }
                }
            });

        let mut out = Raster::new(w, h, c);
        out.data
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, dst)| {
                let lo = y.saturating_sub(radius);
                let hi = (y + radius + 1).min(h);
                for yy in lo..hi {
                    for (d, s) in dst.iter_mut().zip(horizontal.row(yy)) {
                        *d += *s;
                    }
                }
                let n = (hi - lo) as f32;
                for d in dst.iter_mut() {
                    *d /= n;
                }
            });
        out
    }

    /// Clamp every sample into `[lo, hi]`.
    pub fn clamp_in_place(&mut self, lo: f32, hi: f32) {
        self.data.par_iter_mut().for_each(|v| *v = v.clamp(lo, hi));
    }
}

/// Reflect an out-of-range index back into `0..n` without repeating the edge
/// sample (`dcb|abcd|cba`).
pub fn reflect_index(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_round_trip() {
        let mut img = RgbImage::new(4, 3);
        img.put_pixel(1, 2, Rgb([10, 200, 255]));
        let raster = Raster::from_rgb(&img);
        assert_eq!(raster.dimensions(), (4, 3));
        assert_eq!(raster.pixel(1, 2), &[10.0, 200.0, 255.0]);
        assert_eq!(raster.to_rgb(), img);
    }

    #[test]
    fn test_to_rgb_clamps() {
        let raster = Raster::from_vec(1, 1, 3, vec![-12.0, 127.6, 300.0]).unwrap();
        assert_eq!(raster.to_rgb().get_pixel(0, 0), &Rgb([0, 128, 255]));
    }

    #[test]
    fn test_from_vec_rejects_bad_length() {
        assert!(Raster::from_vec(2, 2, 3, vec![0.0; 11]).is_none());
    }

    #[test]
    fn test_box_blur_preserves_constant() {
        let raster = Raster::filled(7, 5, 2, 3.5);
        let blurred = raster.box_blurred(2);
        assert!(blurred.data().iter().all(|v| (v - 3.5).abs() < 1e-5));
    }

    #[test]
    fn test_box_blur_spreads_impulse() {
        let mut raster = Raster::new(5, 5, 1);
        raster.set(2, 2, 0, 9.0);
        let blurred = raster.box_blurred(1);
        assert!((blurred.get(2, 2, 0) - 1.0).abs() < 1e-6);
        assert!((blurred.get(1, 1, 0) - 1.0).abs() < 1e-6);
        assert_eq!(blurred.get(0, 0, 0), 0.0);
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 5), 1);
        assert_eq!(reflect_index(-2, 5), 2);
        assert_eq!(reflect_index(5, 5), 3);
        assert_eq!(reflect_index(6, 5), 2);
        assert_eq!(reflect_index(3, 1), 0);
        assert_eq!(reflect_index(-1, 2), 1);
    }
}
