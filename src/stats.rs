//! # Robust statistics helpers
//!
//! Small numerical utilities shared by the slice fitter and the shape
//! calibration: NaN-tolerant means and percentiles, iterative sigma
//! clipping, and the intrinsic-scatter solve used by the error-inflation
//! retry of the chi-square fitters.

use roots::{find_root_brent, SimpleConvergency};

use crate::spextract_errors::SpextractError;

/// Mean of the finite entries of `values`.
///
/// Returns `NaN` when no finite entry exists.
pub fn nanmean(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for &v in values {
        if v.is_finite() {
            sum += v;
            n += 1;
        }
    }
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// Maximum of the finite entries of `values` (`NaN` when none).
pub fn nanmax(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NAN, f64::max)
}

/// Linear-interpolation percentile of the finite entries of `values`.
///
/// `q` is expressed in percent, clamped to `[0, 100]`. Returns `NaN` for an
/// empty (or all-NaN) input.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.sort_unstable_by(|a, b| a.partial_cmp(b).expect("finite values compare"));
    let n = finite.len();
    if n == 1 {
        return finite[0];
    }
    let pos = (q.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        finite[lo]
    } else {
        let frac = pos - lo as f64;
        finite[lo] * (1.0 - frac) + finite[hi] * frac
    }
}

/// Median of the finite entries of `values`.
#[inline]
pub fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}

/// Iteratively sigma-clipped mean.
///
/// Each iteration recomputes the mean and standard deviation of the points
/// kept so far and discards the points lying more than `sigma` standard
/// deviations away from the mean. Non-finite entries are dropped up front.
///
/// Arguments
/// -----------------
/// * `values`: Sample to average.
/// * `sigma`: Clipping threshold in units of the sample standard deviation.
/// * `iters`: Number of clipping iterations.
///
/// Return
/// ----------
/// * The mean of the surviving points, or `NaN` when nothing survives.
pub fn sigma_clipped_mean(values: &[f64], sigma: f64, iters: usize) -> f64 {
    let mut kept: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if kept.is_empty() {
        return f64::NAN;
    }

    for _ in 0..iters {
        let n = kept.len() as f64;
        let mean = kept.iter().sum::<f64>() / n;
        let std = (kept.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std == 0.0 {
            break;
        }
        let next: Vec<f64> = kept
            .iter()
            .copied()
            .filter(|v| (v - mean).abs() <= sigma * std)
            .collect();
        if next.len() == kept.len() || next.is_empty() {
            break;
        }
        kept = next;
    }

    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Intrinsic per-point scatter bringing the reduced chi-square to one.
///
/// Solves for `t >= 0` such that
///
/// ```text
/// sum_i  r_i^2 / (sigma_i^2 + t^2)  =  dof
/// ```
///
/// where `r_i` are the fit residuals and `sigma_i` the quoted per-point
/// uncertainties. This is the scatter that, added in quadrature to the
/// quoted errors, would make the error model consistent with the observed
/// dispersion. The left-hand side is strictly decreasing in `t`, so the
/// root is bracketed by `t = 0` and the RMS residual and found with Brent's
/// method.
///
/// Arguments
/// -----------------
/// * `residuals`: Per-point fit residuals (data minus model).
/// * `errors`: Per-point 1-sigma uncertainties, same length.
/// * `dof`: Degrees of freedom of the fit.
///
/// Return
/// ----------
/// * `Ok(0.0)` when the fit is already consistent (`chi2 <= dof`).
/// * `Ok(t)` with the positive root otherwise.
/// * `Err(SpextractError::RootFindingError)` if Brent's method fails.
pub fn fit_intrinsic(residuals: &[f64], errors: &[f64], dof: usize) -> Result<f64, SpextractError> {
    let dof = dof as f64;
    let chi2 = |t: f64| -> f64 {
        residuals
            .iter()
            .zip(errors)
            .map(|(r, e)| r * r / (e * e + t * t))
            .sum::<f64>()
    };

    if chi2(0.0) <= dof {
        return Ok(0.0);
    }

    // At t = rms the sum is strictly below dof, so the bracket holds.
    let rms = (residuals.iter().map(|r| r * r).sum::<f64>() / dof).sqrt();
    let f = |t: f64| chi2(t) - dof;
    let mut convergency = SimpleConvergency {
        eps: 1e-10_f64,
        max_iter: 100,
    };
    Ok(find_root_brent(0.0, rms, &f, &mut convergency)?)
}
