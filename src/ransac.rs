//! Robust model fitting
//!
//! A small, model-agnostic RANSAC loop plus the two motion estimators the
//! aligner needs. Models are fitted in whatever coordinates the point pairs
//! are given in; the aligner works in detection-image pixels.

use nalgebra::{DMatrix, DVector, Matrix3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::transform::Transform;

#[derive(Debug, Clone)]
pub struct RansacOptions {
    pub max_iters: usize,
    /// Inlier residual threshold, in the same units as [`Estimator::residual`].
    pub thresh: f64,
    pub min_inliers: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            thresh: 2.0,
            min_inliers: 12,
            confidence: 0.99,
            seed: 1_234_567,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub model: Option<M>,
    pub inliers: Vec<usize>,
    pub inlier_rms: f64,
    pub iters: usize,
}

impl<M> Default for RansacResult<M> {
    fn default() -> Self {
        Self {
            model: None,
            inliers: Vec::new(),
            inlier_rms: f64::INFINITY,
            iters: 0,
        }
    }
}

impl<M> RansacResult<M> {
    pub fn success(&self) -> bool {
        self.model.is_some()
    }
}

pub trait Estimator {
    type Datum;
    type Model;

    const MIN_SAMPLES: usize;

    /// `None` if the sample is degenerate.
    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative error of one datum under the model.
    fn residual(model: &Self::Model, datum: &Self::Datum) -> f64;

    /// Re-estimate from all inliers. Defaults to a plain fit.
    fn refit(data: &[Self::Datum], inliers: &[usize]) -> Option<Self::Model> {
        Self::fit(data, inliers)
    }
}

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Iterations needed to draw one all-inlier sample with the given confidence.
fn required_iterations(confidence: f64, inlier_ratio: f64, min_samples: usize, max_iters: usize) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }
    let n = ((1.0 - confidence.min(0.999_999)).ln() / denom).ceil();
    if n.is_finite() {
        (n as usize).min(max_iters)
    } else {
        max_iters
    }
}

fn score<E: Estimator>(model: &E::Model, data: &[E::Datum], thresh: f64) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut residuals = Vec::new();
    for (i, datum) in data.iter().enumerate() {
        let r = E::residual(model, datum);
        if r <= thresh {
            inliers.push(i);
            residuals.push(r);
        }
    }
    let err = rms(&residuals);
    (inliers, err)
}

/// Seeded RANSAC. The same data and options always give the same model.
pub fn ransac<E: Estimator>(data: &[E::Datum], opts: &RansacOptions) -> RansacResult<E::Model> {
    let mut best = RansacResult::default();
    if data.len() < E::MIN_SAMPLES {
        return best;
    }

    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut max_iters = opts.max_iters;
    let mut iters = 0;

    while iters < max_iters {
        iters += 1;
        let sample = rand::seq::index::sample(&mut rng, data.len(), E::MIN_SAMPLES).into_vec();

        let Some(model) = E::fit(data, &sample) else {
            continue;
        };
        let (inliers, err) = score::<E>(&model, data, opts.thresh);

        let better = inliers.len() > best.inliers.len()
            || (inliers.len() == best.inliers.len() && err < best.inlier_rms);
        if inliers.len() >= E::MIN_SAMPLES && better {
            let ratio = inliers.len() as f64 / data.len() as f64;
            max_iters = required_iterations(opts.confidence, ratio, E::MIN_SAMPLES, opts.max_iters).max(iters);
            best.model = Some(model);
            best.inliers = inliers;
            best.inlier_rms = err;
        }
    }
    best.iters = iters;

    if best.inliers.len() < opts.min_inliers.max(E::MIN_SAMPLES) {
        return RansacResult {
            iters,
            ..RansacResult::default()
        };
    }

    // Refit on the consensus set; keep the refined model only if it does not
    // lose support.
    if let Some(refined) = E::refit(data, &best.inliers) {
        let (inliers, err) = score::<E>(&refined, data, opts.thresh);
        if inliers.len() >= best.inliers.len() {
            best.model = Some(refined);
            best.inliers = inliers;
            best.inlier_rms = err;
        }
    }
    best
}

/// A correspondence: `src` in the moving image, `dst` in the reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointPair {
    pub src: (f64, f64),
    pub dst: (f64, f64),
}

fn reprojection_error(model: &Transform, pair: &PointPair) -> f64 {
    match model.apply(pair.src.0, pair.src.1) {
        Some((x, y)) => ((x - pair.dst.0).powi(2) + (y - pair.dst.1).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Hartley normalisation: zero mean, average distance sqrt(2).
fn normalize_points(points: &[(f64, f64)]) -> Option<(Vec<(f64, f64)>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let (cx, cy) = points.iter().fold((0.0, 0.0), |a, p| (a.0 + p.0, a.1 + p.1));
    let (cx, cy) = (cx / n, cy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-9 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = points.iter().map(|p| (s * (p.0 - cx), s * (p.1 - cy))).collect();
    Some((normalized, t))
}

/// Normalised DLT homography.
pub struct HomographyEstimator;

impl HomographyEstimator {
    pub fn dlt(pairs: &[PointPair], indices: &[usize]) -> Option<Transform> {
        if indices.len() < 4 {
            return None;
        }
        let src: Vec<(f64, f64)> = indices.iter().map(|&i| pairs[i].src).collect();
        let dst: Vec<(f64, f64)> = indices.iter().map(|&i| pairs[i].dst).collect();
        let (src_n, t_src) = normalize_points(&src)?;
        let (dst_n, t_dst) = normalize_points(&dst)?;

        let n = indices.len();
        let rows = (2 * n).max(9);
        let mut a = DMatrix::<f64>::zeros(rows, 9);
        for (i, (&(x, y), &(u, v))) in src_n.iter().zip(dst_n.iter()).enumerate() {
            let r0 = 2 * i;
            let r1 = r0 + 1;
            a[(r0, 0)] = -x;
            a[(r0, 1)] = -y;
            a[(r0, 2)] = -1.0;
            a[(r0, 6)] = u * x;
            a[(r0, 7)] = u * y;
            a[(r0, 8)] = u;

            a[(r1, 3)] = -x;
            a[(r1, 4)] = -y;
            a[(r1, 5)] = -1.0;
            a[(r1, 6)] = v * x;
            a[(r1, 7)] = v * y;
            a[(r1, 8)] = v;
        }

        // Null vector of A: right singular vector of the smallest singular value.
        let svd = a.svd(false, true);
        let v_t = svd.v_t?;
        let (min_idx, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))?;
        let h = v_t.row(min_idx);

        let mut m = Matrix3::zeros();
        for r in 0..3 {
            for c in 0..3 {
                m[(r, c)] = h[3 * r + c];
            }
        }
        let m = t_dst.try_inverse()? * m * t_src;
        Transform::from_matrix(m)
    }
}

impl Estimator for HomographyEstimator {
    type Datum = PointPair;
    type Model = Transform;

    const MIN_SAMPLES: usize = 4;

    fn fit(data: &[PointPair], sample: &[usize]) -> Option<Transform> {
        Self::dlt(data, sample)
    }

    fn residual(model: &Transform, datum: &PointPair) -> f64 {
        reprojection_error(model, datum)
    }
}

/// Six-parameter affine model by linear least squares.
pub struct AffineEstimator;

impl AffineEstimator {
    pub fn least_squares(pairs: &[PointPair], indices: &[usize]) -> Option<Transform> {
        if indices.len() < 3 {
            return None;
        }
        let n = indices.len();
        let mut a = DMatrix::<f64>::zeros(2 * n, 6);
        let mut b = DVector::<f64>::zeros(2 * n);
        for (row, &i) in indices.iter().enumerate() {
            let PointPair { src: (x, y), dst: (u, v) } = pairs[i];
            a[(2 * row, 0)] = x;
            a[(2 * row, 1)] = y;
            a[(2 * row, 2)] = 1.0;
            a[(2 * row + 1, 3)] = x;
            a[(2 * row + 1, 4)] = y;
            a[(2 * row + 1, 5)] = 1.0;
            b[2 * row] = u;
            b[2 * row + 1] = v;
        }

        let svd = a.svd(true, true);
        if svd.rank(1e-9) < 6 {
            return None;
        }
        let p = svd.solve(&b, 1e-12).ok()?;
        Transform::from_matrix(Matrix3::new(p[0], p[1], p[2], p[3], p[4], p[5], 0.0, 0.0, 1.0))
    }
}

impl Estimator for AffineEstimator {
    type Datum = PointPair;
    type Model = Transform;

    const MIN_SAMPLES: usize = 3;

    fn fit(data: &[PointPair], sample: &[usize]) -> Option<Transform> {
        Self::least_squares(data, sample)
    }

    fn residual(model: &Transform, datum: &PointPair) -> f64 {
        reprojection_error(model, datum)
    }
}
