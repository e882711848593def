use nalgebra::{Matrix3, Vector3};

/// Projective mapping from an image's pixel coordinates into the reference
/// frame. The reference image itself always carries the identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    matrix: Matrix3<f64>,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            matrix: Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0),
        }
    }

    /// Accepts finite, invertible matrices; the result is scaled so that the
    /// bottom-right entry is 1 when possible.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Option<Self> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let mut matrix = matrix;
        let scale = matrix[(2, 2)];
        if scale.abs() > f64::EPSILON {
            matrix /= scale;
        }
        if matrix.determinant().abs() < 1e-12 {
            return None;
        }
        Some(Self { matrix })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Map a point. `None` when it lands on the line at infinity.
    pub fn apply(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let p = self.matrix * Vector3::new(x, y, 1.0);
        if p.z.abs() < 1e-12 {
            return None;
        }
        Some((p.x / p.z, p.y / p.z))
    }

    pub fn inverse(&self) -> Option<Transform> {
        self.matrix.try_inverse().and_then(Transform::from_matrix)
    }

    /// `self` applied after `other`.
    pub fn compose(&self, other: &Transform) -> Option<Transform> {
        Transform::from_matrix(self.matrix * other.matrix)
    }

    /// The same mapping expressed for coordinates multiplied by `factor`
    /// (e.g. a transform estimated on a downscaled copy, lifted to full size).
    pub fn rescaled(&self, factor: f64) -> Option<Transform> {
        let s = Matrix3::new(factor, 0.0, 0.0, 0.0, factor, 0.0, 0.0, 0.0, 1.0);
        let s_inv = Matrix3::new(1.0 / factor, 0.0, 0.0, 0.0, 1.0 / factor, 0.0, 0.0, 0.0, 1.0);
        Transform::from_matrix(s * self.matrix * s_inv)
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        (self.matrix - Matrix3::identity()).iter().all(|v| v.abs() <= tolerance)
    }

    /// Whether the mapping keeps the image roughly in place: bounded scale
    /// change and perspective. Used to reject wild RANSAC results.
    pub fn is_plausible(&self, width: f64, height: f64) -> bool {
        let corners = [(0.0, 0.0), (width, 0.0), (width, height), (0.0, height)];
        let mapped: Option<Vec<(f64, f64)>> = corners.iter().map(|&(x, y)| self.apply(x, y)).collect();
        let Some(mapped) = mapped else {
            return false;
        };
        let area = |pts: &[(f64, f64)]| {
            let mut a = 0.0;
            for i in 0..pts.len() {
                let (x0, y0) = pts[i];
                let (x1, y1) = pts[(i + 1) % pts.len()];
                a += x0 * y1 - x1 * y0;
            }
            a / 2.0
        };
        let ratio = area(&mapped) / area(&corners);
        (0.5..=2.0).contains(&ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_and_inverse() {
        let t = Transform::translation(5.0, -2.0);
        assert_eq!(t.apply(1.0, 1.0), Some((6.0, -1.0)));
        let inv = t.inverse().unwrap();
        let (x, y) = inv.apply(6.0, -1.0).unwrap();
        assert!((x - 1.0).abs() < 1e-12 && (y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rescaled_translation() {
        let t = Transform::translation(2.0, 3.0).rescaled(4.0).unwrap();
        let (x, y) = t.apply(0.0, 0.0).unwrap();
        assert!((x - 8.0).abs() < 1e-12 && (y - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_singular_and_non_finite() {
        assert!(Transform::from_matrix(Matrix3::zeros()).is_none());
        let mut m = Matrix3::identity();
        m[(0, 2)] = f64::NAN;
        assert!(Transform::from_matrix(m).is_none());
    }

    #[test]
    fn test_plausibility() {
        assert!(Transform::identity().is_plausible(100.0, 50.0));
        let squash = Transform::from_matrix(Matrix3::new(0.1, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0)).unwrap();
        assert!(!squash.is_plausible(100.0, 50.0));
        // Mirrored images have negative area.
        let mirror = Transform::from_matrix(Matrix3::new(-1.0, 0.0, 100.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0)).unwrap();
        assert!(!mirror.is_plausible(100.0, 50.0));
    }

    #[test]
    fn test_identity_default() {
        assert!(Transform::default().is_identity(0.0));
        assert!(!Transform::translation(0.1, 0.0).is_identity(0.01));
    }
}
