use rayon::prelude::*;

use crate::raster::Raster;

/// Squared detail coefficients summed over channels: a one-channel map of
/// high-frequency energy. Raw coefficients oscillate in sign, their square
/// does not.
pub fn detail_energy(level: &Raster) -> Raster {
    let c = level.channels();
    let data: Vec<f32> = level
        .data()
        .par_chunks(c.max(1))
        .map(|p| p.iter().map(|v| v * v).sum())
        .collect();
    Raster::from_vec(level.width(), level.height(), 1, data)
        .unwrap_or_else(|| Raster::new(level.width(), level.height(), 1))
}

/// Focus measure for one Laplacian level: local detail energy averaged over a
/// `(2 * window + 1)²` neighbourhood.
pub fn focus_map(level: &Raster, window: usize) -> Raster {
    detail_energy(level).box_blurred(window)
}

/// Variance of the 3x3 Laplacian response of the image luminance.
///
/// Returns 0.0 for images too small to have an interior.
pub fn laplacian_variance(img: &Raster) -> f64 {
    laplacian_variance_region(img, 0, 0, img.width(), img.height())
}

/// [`laplacian_variance`] restricted to the rectangle at `(x0, y0)` of size
/// `w`x`h`, clipped to the image.
pub fn laplacian_variance_region(img: &Raster, x0: usize, y0: usize, w: usize, h: usize) -> f64 {
    let gray = img.luminance();
    let x1 = (x0 + w).min(gray.width());
    let y1 = (y0 + h).min(gray.height());
    // Interior only, so every tap is in bounds.
    let xs = x0.max(1)..x1.min(gray.width().saturating_sub(1));
    let ys = y0.max(1)..y1.min(gray.height().saturating_sub(1));
    if xs.is_empty() || ys.is_empty() {
        return 0.0;
    }

    let (sum, sum_sq, n) = ys
        .into_par_iter()
        .map(|y| {
            let mut acc = (0f64, 0f64, 0usize);
            for x in xs.clone() {
                let centre = gray.get(x, y, 0);
                let lap = gray.get(x - 1, y, 0) + gray.get(x + 1, y, 0) + gray.get(x, y - 1, 0)
                    + gray.get(x, y + 1, 0)
                    - 4.0 * centre;
                let lap = lap as f64;
                acc.0 += lap;
                acc.1 += lap * lap;
                acc.2 += 1;
            }
            acc
        })
        .reduce(|| (0.0, 0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2));

    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean).max(0.0)
}

/// Split the image into a `grid_size`x`grid_size` grid and score each cell.
///
/// Returns `(max_regional, global, sharp_region_count)`, where a region is
/// "sharp" when it scores at least 70% of the best one. Images too small
/// for regions of 16 pixels fall back to the global score.
pub fn regional_sharpness(img: &Raster, grid_size: usize) -> (f64, f64, usize) {
    let global = laplacian_variance(img);
    let grid = grid_size.max(2);
    let region_w = img.width() / grid;
    let region_h = img.height() / grid;
    if region_w < 16 || region_h < 16 {
        return (global, global, 1);
    }

    let scores: Vec<f64> = (0..grid * grid)
        .map(|cell| {
            let (row, col) = (cell / grid, cell % grid);
            laplacian_variance_region(img, col * region_w, row * region_h, region_w, region_h)
        })
        .collect();

    let max = scores.iter().cloned().fold(0.0, f64::max);
    let sharp = scores.iter().filter(|&&s| s >= max * 0.7).count();

    log::debug!(
        "Regional analysis: max={:.2}, global={:.2}, sharp_regions={}/{}, grid={}x{}",
        max,
        global,
        sharp,
        scores.len(),
        grid,
        grid
    );

    (max, global, sharp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(size: usize, cell: usize) -> Raster {
        let mut r = Raster::new(size, size, 3);
        for y in 0..size {
            for x in 0..size {
                let v = if (x / cell + y / cell) % 2 == 0 { 200.0 } else { 50.0 };
                for c in 0..3 {
                    r.set(x, y, c, v);
                }
            }
        }
        r
    }

    #[test]
    fn test_flat_image_has_zero_sharpness() {
        let flat = Raster::filled(32, 32, 3, 128.0);
        assert_eq!(laplacian_variance(&flat), 0.0);
    }

    #[test]
    fn test_blur_lowers_sharpness() {
        let sharp = checkerboard(64, 2);
        let blurred = sharp.box_blurred(2);
        assert!(laplacian_variance(&sharp) > 10.0 * laplacian_variance(&blurred));
    }

    #[test]
    fn test_focus_map_is_non_negative_and_local() {
        let mut level = Raster::new(20, 20, 3);
        level.set(10, 10, 0, 3.0);
        level.set(10, 10, 1, -4.0);
        let map = focus_map(&level, 1);
        assert_eq!(map.channels(), 1);
        assert!((map.get(10, 10, 0) - 25.0 / 9.0).abs() < 1e-5);
        assert!(map.get(11, 11, 0) > 0.0);
        assert_eq!(map.get(0, 0, 0), 0.0);
        assert!(map.data().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_regional_finds_sharp_corner() {
        let mut img = Raster::filled(128, 128, 3, 100.0);
        let board = checkerboard(32, 2);
        for y in 0..32 {
            for x in 0..32 {
                for c in 0..3 {
                    img.set(x, y, c, board.get(x, y, c));
                }
            }
        }
        let (max, global, count) = regional_sharpness(&img, 4);
        assert!(max > global);
        assert_eq!(count, 1);
    }
}
