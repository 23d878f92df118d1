//! Elliptical bi-normal flux profile and polynomial backgrounds.
//!
//! The point-spread function is modelled as two concentric elliptical
//! Gaussians (a narrow core and a wide tail) sharing centroid,
//! ellipticity and tilt. The tail width is `stddev * stddev_ratio` and
//! the core-to-tail weight is set by `amplitude_ratio`; the weights are
//! normalized so that `amplitude` scales the whole blend.

use serde::{Deserialize, Serialize};

/// Parameters of the bi-normal profile, fully specified.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileParams {
    pub xcentroid: f64,
    pub ycentroid: f64,
    /// Core standard deviation, spaxel units.
    pub stddev: f64,
    /// Tail-to-core width ratio (`>= 1`).
    pub stddev_ratio: f64,
    /// Core-to-tail weight ratio (`> 0`).
    pub amplitude_ratio: f64,
    /// Tilt of the ellipse, radians.
    pub theta: f64,
    /// Ellipticity (`0` is circular).
    pub ell: f64,
    /// Overall flux scale.
    pub amplitude: f64,
}

/// Elliptical distance of `(x, y)` from a tilted ellipse centre.
///
/// Coordinates are rotated by `-theta` and the rotated ordinate is
/// stretched by `1 / (1 - ell)`, so iso-distance contours are ellipses of
/// ellipticity `ell` tilted by `theta`.
#[inline]
pub fn elliptical_distance(
    x: f64,
    y: f64,
    xcentroid: f64,
    ycentroid: f64,
    ell: f64,
    theta: f64,
) -> f64 {
    let dx = x - xcentroid;
    let dy = y - ycentroid;
    let (sin_t, cos_t) = theta.sin_cos();
    let rx = dx * cos_t + dy * sin_t;
    let ry = -dx * sin_t + dy * cos_t;
    (rx * rx + (ry / (1.0 - ell)).powi(2)).sqrt()
}

/// Normal probability density at `r` for a zero-centred Gaussian.
#[inline]
fn normal_pdf(r: f64, stddev: f64) -> f64 {
    let z = r / stddev;
    (-0.5 * z * z).exp() / (stddev * (2.0 * std::f64::consts::PI).sqrt())
}

/// Bi-normal profile flux at `(x, y)`.
///
/// ```text
/// amplitude * [ c1 * N(r; stddev) + c2 * N(r; stddev * stddev_ratio) ]
/// ```
///
/// with `c1 = a / (1 + a)`, `c2 = 1 / (1 + a)`, `a = amplitude_ratio`,
/// and `r` the elliptical distance from the centroid.
pub fn binormal_profile(x: f64, y: f64, p: &ProfileParams) -> f64 {
    let r = elliptical_distance(x, y, p.xcentroid, p.ycentroid, p.ell, p.theta);
    let core = normal_pdf(r, p.stddev);
    let tail = normal_pdf(r, p.stddev * p.stddev_ratio);
    let c1 = p.amplitude_ratio / (1.0 + p.amplitude_ratio);
    let c2 = 1.0 / (1.0 + p.amplitude_ratio);
    p.amplitude * (c1 * core + c2 * tail)
}

/// Tilted-plane background: `b0 + b1 * x + b2 * y`.
#[inline]
pub fn tilted_plane(x: f64, y: f64, coeffs: &[f64]) -> f64 {
    coeffs[0] + coeffs[1] * x + coeffs[2] * y
}

/// Curved quadric background:
/// `b0 + b1 x + b2 y + b3 x y + b4 x^2 + b5 y^2`.
#[inline]
pub fn curved_plane(x: f64, y: f64, coeffs: &[f64]) -> f64 {
    coeffs[0]
        + coeffs[1] * x
        + coeffs[2] * y
        + coeffs[3] * x * y
        + coeffs[4] * x * x
        + coeffs[5] * y * y
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> ProfileParams {
        ProfileParams {
            xcentroid: 0.3,
            ycentroid: -0.7,
            stddev: 1.3,
            stddev_ratio: 2.0,
            amplitude_ratio: 3.0,
            theta: 1.5,
            ell: 0.05,
            amplitude: 100.0,
        }
    }

    #[test]
    fn test_profile_is_positive() {
        let p = params();
        for i in -10..=10 {
            for j in -10..=10 {
                let f = binormal_profile(i as f64 * 0.7, j as f64 * 0.7, &p);
                assert!(f >= 0.0, "negative flux at ({i}, {j}): {f}");
            }
        }
    }

    #[test]
    fn test_profile_peaks_at_centroid() {
        let p = params();
        let peak = binormal_profile(p.xcentroid, p.ycentroid, &p);
        for &(dx, dy) in &[(0.5, 0.0), (0.0, 0.5), (-0.4, 0.3)] {
            assert!(binormal_profile(p.xcentroid + dx, p.ycentroid + dy, &p) < peak);
        }
    }

    #[test]
    fn test_rotation_symmetry() {
        // Rotating the offset by theta around the centroid must leave the
        // elliptical distance, hence the flux, invariant along the same
        // iso-contour parametrization.
        let p = params();
        let (sin_t, cos_t) = p.theta.sin_cos();
        // A point expressed in the ellipse frame...
        let (rx, ry) = (0.8, 0.0);
        // ...mapped back to sky coordinates.
        let x = p.xcentroid + rx * cos_t - ry * sin_t;
        let y = p.ycentroid + rx * sin_t + ry * cos_t;
        let d = elliptical_distance(x, y, p.xcentroid, p.ycentroid, p.ell, p.theta);
        assert_relative_eq!(d, 0.8, epsilon = 1e-12);

        // Same for a point along the stretched axis.
        let (rx, ry) = (0.0, 0.6);
        let x = p.xcentroid + rx * cos_t - ry * sin_t;
        let y = p.ycentroid + rx * sin_t + ry * cos_t;
        let d = elliptical_distance(x, y, p.xcentroid, p.ycentroid, p.ell, p.theta);
        assert_relative_eq!(d, 0.6 / (1.0 - p.ell), epsilon = 1e-12);
    }

    #[test]
    fn test_amplitude_scales_linearly() {
        let p = params();
        let mut p2 = p;
        p2.amplitude = 200.0;
        let f1 = binormal_profile(1.0, 1.0, &p);
        let f2 = binormal_profile(1.0, 1.0, &p2);
        assert_relative_eq!(f2, 2.0 * f1, epsilon = 1e-12);
    }

    #[test]
    fn test_backgrounds() {
        assert_relative_eq!(tilted_plane(2.0, 3.0, &[1.0, 0.5, -1.0]), -1.0);
        assert_relative_eq!(
            curved_plane(2.0, 3.0, &[1.0, 0.0, 0.0, 1.0, 0.5, 0.5]),
            1.0 + 6.0 + 2.0 + 4.5
        );
    }
}
