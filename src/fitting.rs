//! # Bounded chi-square minimization
//!
//! A derivative-free bounded minimizer shared by every fitter in the crate:
//! the per-slice profile fits, the refraction-trajectory fit, the
//! width-trend fit and the forced-photometry fits.
//!
//! ## Overview
//!
//! The search is a Nelder–Mead simplex running in an unconstrained
//! *internal* parameter space; box constraints are enforced through the
//! classic sine/offset transforms, so bounded parameters can never escape
//! their interval and fixed parameters are simply excluded from the
//! simplex. After convergence a finite-difference curvature matrix of the
//! objective is assembled in the *external* (physical) space and inverted
//! with `nalgebra` to produce 1-sigma uncertainties (the covariance of a
//! chi-square objective is twice the inverse curvature).
//!
//! ## Error semantics
//!
//! Non-convergence is **not** an error: it is reported through
//! [`FitOutcome::converged`] so that batch callers can isolate bad fits
//! without aborting. A singular curvature matrix degrades to `NaN`
//! uncertainties plus a warning.

use log::warn;
use nalgebra::DMatrix;

use crate::spextract_errors::SpextractError;

/// One fitted quantity: value and 1-sigma uncertainty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fitted {
    pub value: f64,
    pub sigma: f64,
}

impl Fitted {
    pub fn new(value: f64, sigma: f64) -> Self {
        Self { value, sigma }
    }
}

/// Description of one parameter entering a fit.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: &'static str,
    pub guess: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub fixed: bool,
}

impl Param {
    /// Free, unbounded parameter.
    pub fn free(name: &'static str, guess: f64) -> Self {
        Self {
            name,
            guess,
            lower: None,
            upper: None,
            fixed: false,
        }
    }

    /// Free parameter constrained to `[lower, upper]`.
    pub fn bounded(name: &'static str, guess: f64, lower: f64, upper: f64) -> Self {
        Self {
            name,
            guess,
            lower: Some(lower),
            upper: Some(upper),
            fixed: false,
        }
    }

    /// Parameter held at its guess value.
    pub fn fixed(name: &'static str, value: f64) -> Self {
        Self {
            name,
            guess: value,
            lower: None,
            upper: None,
            fixed: true,
        }
    }

}

/// Tuning of the simplex search.
#[derive(Debug, Clone)]
pub struct MinimizeOptions {
    /// Maximum number of simplex iterations; `0` selects `500 * n_free`.
    pub max_iter: usize,
    /// Relative spread of objective values across the simplex at which the
    /// search is declared converged.
    pub ftol: f64,
    /// Internal-space simplex diameter at which the search is declared
    /// converged.
    pub xtol: f64,
    /// Number of shrink-and-restart passes after the first convergence.
    pub restarts: usize,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self {
            max_iter: 0,
            ftol: 1e-10,
            xtol: 1e-9,
            restarts: 2,
        }
    }
}

/// Result of a bounded minimization.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    /// Best parameter values, in the order the parameters were supplied
    /// (fixed parameters keep their guess value).
    pub values: Vec<f64>,
    /// 1-sigma uncertainties; `NaN` for fixed parameters and when the
    /// curvature matrix could not be inverted.
    pub errors: Vec<f64>,
    /// Objective value at the minimum.
    pub chi2: f64,
    /// Whether the simplex met the convergence criteria.
    pub converged: bool,
    /// Number of objective evaluations.
    pub n_eval: usize,
}

// -------------------------------------------------------------------------------------------------
// Bound transforms
// -------------------------------------------------------------------------------------------------

/// Box constraint of one parameter, in transform-friendly form.
#[derive(Debug, Clone, Copy)]
enum Bound {
    Free,
    Lower(f64),
    Upper(f64),
    Both(f64, f64),
}

impl Bound {
    fn of(p: &Param) -> Self {
        match (p.lower, p.upper) {
            (None, None) => Bound::Free,
            (Some(lo), None) => Bound::Lower(lo),
            (None, Some(hi)) => Bound::Upper(hi),
            (Some(lo), Some(hi)) => Bound::Both(lo, hi),
        }
    }

    /// Map an unconstrained internal coordinate to the external interval.
    fn to_external(self, u: f64) -> f64 {
        match self {
            Bound::Free => u,
            Bound::Lower(lo) => lo - 1.0 + (u * u + 1.0).sqrt(),
            Bound::Upper(hi) => hi + 1.0 - (u * u + 1.0).sqrt(),
            Bound::Both(lo, hi) => lo + (hi - lo) * (u.sin() + 1.0) / 2.0,
        }
    }

    /// Inverse of [`Bound::to_external`]; the external value is clamped
    /// strictly inside the interval first.
    fn to_internal(self, x: f64) -> f64 {
        match self {
            Bound::Free => x,
            Bound::Lower(lo) => {
                let d = (x - lo).max(0.0) + 1.0;
                (d * d - 1.0).sqrt()
            }
            Bound::Upper(hi) => {
                let d = (hi - x).max(0.0) + 1.0;
                (d * d - 1.0).sqrt()
            }
            Bound::Both(lo, hi) => {
                let frac = ((x - lo) / (hi - lo)).clamp(1e-8, 1.0 - 1e-8);
                (2.0 * frac - 1.0).asin()
            }
        }
    }

    fn clamp(self, x: f64) -> f64 {
        match self {
            Bound::Free => x,
            Bound::Lower(lo) => x.max(lo),
            Bound::Upper(hi) => x.min(hi),
            Bound::Both(lo, hi) => x.clamp(lo, hi),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Minimizer
// -------------------------------------------------------------------------------------------------

/// Minimize a chi-square objective over bounded parameters.
///
/// Arguments
/// -----------------
/// * `objective`: Function of the full external parameter vector (fixed
///   parameters included, in the order of `params`).
/// * `params`: Parameter descriptions: guess, bounds, fixed flag.
/// * `options`: Simplex tuning; [`MinimizeOptions::default`] is adequate
///   for every fit in this crate.
///
/// Return
/// ----------
/// * A [`FitOutcome`] carrying best values, uncertainties, the objective
///   minimum and a convergence flag.
///
/// Notes
/// ----------
/// * With every parameter fixed the objective is evaluated once and
///   returned as a trivially converged outcome.
/// * Guesses lying outside their bounds are clamped inside before the
///   search starts.
pub fn minimize<F>(
    objective: F,
    params: &[Param],
    options: &MinimizeOptions,
) -> Result<FitOutcome, SpextractError>
where
    F: Fn(&[f64]) -> f64,
{
    let n = params.len();
    if n == 0 {
        return Err(SpextractError::InsufficientData { needed: 1, got: 0 });
    }

    let bounds: Vec<Bound> = params.iter().map(Bound::of).collect();
    let free: Vec<usize> = params
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.fixed)
        .map(|(i, _)| i)
        .collect();
    let m = free.len();

    let mut external: Vec<f64> = params
        .iter()
        .zip(&bounds)
        .map(|(p, b)| b.clamp(p.guess))
        .collect();

    let mut n_eval = 0usize;
    let eval_external = |ext: &[f64], n_eval: &mut usize| -> f64 {
        *n_eval += 1;
        objective(ext)
    };

    if m == 0 {
        let chi2 = eval_external(&external, &mut n_eval);
        return Ok(FitOutcome {
            values: external,
            errors: vec![f64::NAN; n],
            chi2,
            converged: true,
            n_eval,
        });
    }

    // Internal coordinates of the free parameters.
    let mut best_u: Vec<f64> = free
        .iter()
        .map(|&i| bounds[i].to_internal(external[i]))
        .collect();

    let eval_internal = |u: &[f64], scratch: &mut Vec<f64>, n_eval: &mut usize, obj: &F| -> f64 {
        scratch.clear();
        scratch.extend_from_slice(&external_template(params, &bounds));
        for (k, &i) in free.iter().enumerate() {
            scratch[i] = bounds[i].to_external(u[k]);
        }
        *n_eval += 1;
        obj(scratch)
    };

    let max_iter = if options.max_iter == 0 {
        500 * m
    } else {
        options.max_iter
    };

    let mut scratch = Vec::with_capacity(n);
    let mut step = 0.1;
    let mut converged = false;
    let mut best_f = eval_internal(&best_u, &mut scratch, &mut n_eval, &objective);

    for _restart in 0..=options.restarts {
        let (u, f, ok, used) = nelder_mead(
            |u, n_eval| eval_internal(u, &mut scratch, n_eval, &objective),
            &best_u,
            step,
            max_iter,
            options.ftol,
            options.xtol,
        );
        n_eval += used;
        if f <= best_f {
            best_f = f;
            best_u = u;
        }
        converged = ok;
        if !ok {
            break;
        }
        // Restart from the best point with a tighter initial simplex.
        step *= 0.1;
    }

    for (k, &i) in free.iter().enumerate() {
        external[i] = bounds[i].to_external(best_u[k]);
    }
    let chi2 = best_f;

    // 1-sigma uncertainties from the curvature of the chi-square surface.
    let errors = curvature_errors(&objective, &external, params, &bounds, &free, &mut n_eval);

    Ok(FitOutcome {
        values: external,
        errors,
        chi2,
        converged,
        n_eval,
    })
}

fn external_template(params: &[Param], bounds: &[Bound]) -> Vec<f64> {
    params
        .iter()
        .zip(bounds)
        .map(|(p, b)| b.clamp(p.guess))
        .collect()
}

/// Standard Nelder–Mead on an unconstrained space.
///
/// Returns `(best_point, best_value, converged, n_eval)`.
fn nelder_mead<F>(
    mut f: F,
    start: &[f64],
    step: f64,
    max_iter: usize,
    ftol: f64,
    xtol: f64,
) -> (Vec<f64>, f64, bool, usize)
where
    F: FnMut(&[f64], &mut usize) -> f64,
{
    const ALPHA: f64 = 1.0; // reflection
    const GAMMA: f64 = 2.0; // expansion
    const RHO: f64 = 0.5; // contraction
    const SIGMA: f64 = 0.5; // shrink

    let m = start.len();
    let mut n_eval = 0usize;

    // Initial simplex: start point plus one displaced vertex per dimension.
    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(m + 1);
    simplex.push(start.to_vec());
    for k in 0..m {
        let mut v = start.to_vec();
        let h = step * if v[k].abs() > 1.0 { v[k].abs() } else { 1.0 };
        v[k] += h;
        simplex.push(v);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| f(v, &mut n_eval)).collect();

    // NaN objective values (degenerate model evaluations) order as worst.
    let cmp = |a: &f64, b: &f64| match (a.is_nan(), b.is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => a.partial_cmp(b).expect("comparable"),
    };

    let mut converged = false;
    for _ in 0..max_iter {
        // Order the simplex by objective value.
        let mut order: Vec<usize> = (0..=m).collect();
        order.sort_by(|&a, &b| cmp(&values[a], &values[b]));
        let best = order[0];
        let worst = order[m];
        let second_worst = order[m - 1];

        let f_best = values[best];
        let f_worst = values[worst];

        // Convergence: spread of objective values or simplex diameter.
        let f_spread = (f_worst - f_best).abs();
        let x_spread = simplex
            .iter()
            .map(|v| {
                v.iter()
                    .zip(&simplex[best])
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0, f64::max)
            })
            .fold(0.0, f64::max);
        if f_spread <= ftol * (1.0 + f_best.abs()) || x_spread <= xtol {
            converged = true;
            break;
        }

        // Centroid of all vertices but the worst.
        let mut centroid = vec![0.0; m];
        for (i, v) in simplex.iter().enumerate() {
            if i == worst {
                continue;
            }
            for (c, x) in centroid.iter_mut().zip(v) {
                *c += x / m as f64;
            }
        }

        let reflect: Vec<f64> = centroid
            .iter()
            .zip(&simplex[worst])
            .map(|(c, w)| c + ALPHA * (c - w))
            .collect();
        let f_reflect = f(&reflect, &mut n_eval);

        if f_reflect < f_best {
            // Try to expand further along the same direction.
            let expand: Vec<f64> = centroid
                .iter()
                .zip(&simplex[worst])
                .map(|(c, w)| c + GAMMA * ALPHA * (c - w))
                .collect();
            let f_expand = f(&expand, &mut n_eval);
            if f_expand < f_reflect {
                simplex[worst] = expand;
                values[worst] = f_expand;
            } else {
                simplex[worst] = reflect;
                values[worst] = f_reflect;
            }
        } else if f_reflect < values[second_worst] {
            simplex[worst] = reflect;
            values[worst] = f_reflect;
        } else {
            // Contract toward the centroid.
            let contract: Vec<f64> = centroid
                .iter()
                .zip(&simplex[worst])
                .map(|(c, w)| c + RHO * (w - c))
                .collect();
            let f_contract = f(&contract, &mut n_eval);
            if f_contract < f_worst {
                simplex[worst] = contract;
                values[worst] = f_contract;
            } else {
                // Shrink the whole simplex toward the best vertex.
                let best_vertex = simplex[best].clone();
                for (i, v) in simplex.iter_mut().enumerate() {
                    if i == best {
                        continue;
                    }
                    for (x, b) in v.iter_mut().zip(&best_vertex) {
                        *x = b + SIGMA * (*x - b);
                    }
                    values[i] = f(v, &mut n_eval);
                }
            }
        }
    }

    let (best_idx, _) = values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| cmp(a, b))
        .expect("non-empty simplex");
    (
        simplex[best_idx].clone(),
        values[best_idx],
        converged,
        n_eval,
    )
}

/// Uncertainties from the finite-difference curvature of the objective.
///
/// The covariance of a chi-square objective is `2 H^-1` with `H` the
/// Hessian at the minimum; steps are shrunk where a bound is closer than
/// the nominal step so every evaluation stays inside the box.
fn curvature_errors<F>(
    objective: &F,
    best: &[f64],
    params: &[Param],
    bounds: &[Bound],
    free: &[usize],
    n_eval: &mut usize,
) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let n = params.len();
    let m = free.len();
    let mut errors = vec![f64::NAN; n];
    if m == 0 {
        return errors;
    }

    let mut eval = |ext: &[f64]| -> f64 {
        *n_eval += 1;
        objective(ext)
    };

    // Per-parameter steps, shrunk near the bounds.
    let steps: Vec<f64> = free
        .iter()
        .map(|&i| {
            let p = best[i];
            let mut h = (p.abs() * 1e-3).max(1e-6);
            if let Some(hi) = params[i].upper {
                h = h.min(((hi - p) / 2.0).abs().max(1e-9));
            }
            if let Some(lo) = params[i].lower {
                h = h.min(((p - lo) / 2.0).abs().max(1e-9));
            }
            h
        })
        .collect();

    let f0 = eval(best);
    let mut hessian = DMatrix::<f64>::zeros(m, m);
    let mut work = best.to_vec();

    for a in 0..m {
        let ia = free[a];
        let ha = steps[a];

        work.copy_from_slice(best);
        work[ia] = bounds[ia].clamp(best[ia] + ha);
        let f_plus = eval(&work);
        work[ia] = bounds[ia].clamp(best[ia] - ha);
        let f_minus = eval(&work);
        hessian[(a, a)] = (f_plus - 2.0 * f0 + f_minus) / (ha * ha);

        for b in (a + 1)..m {
            let ib = free[b];
            let hb = steps[b];

            work.copy_from_slice(best);
            work[ia] = bounds[ia].clamp(best[ia] + ha);
            work[ib] = bounds[ib].clamp(best[ib] + hb);
            let fpp = eval(&work);
            work[ib] = bounds[ib].clamp(best[ib] - hb);
            let fpm = eval(&work);
            work[ia] = bounds[ia].clamp(best[ia] - ha);
            let fmm = eval(&work);
            work[ib] = bounds[ib].clamp(best[ib] + hb);
            let fmp = eval(&work);

            let h_ab = (fpp - fpm - fmp + fmm) / (4.0 * ha * hb);
            hessian[(a, b)] = h_ab;
            hessian[(b, a)] = h_ab;
        }
    }

    match hessian.try_inverse() {
        Some(inv) => {
            for (k, &i) in free.iter().enumerate() {
                let var = 2.0 * inv[(k, k)];
                errors[i] = if var > 0.0 { var.sqrt() } else { f64::NAN };
            }
        }
        None => {
            warn!("singular curvature matrix: parameter uncertainties set to NaN");
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quadratic_bowl_unbounded() {
        // chi2 = (a-2)^2/0.5^2 + (b+1)^2/0.2^2: minimum (2, -1),
        // uncertainties 0.5 and 0.2.
        let chi2 = |p: &[f64]| ((p[0] - 2.0) / 0.5).powi(2) + ((p[1] + 1.0) / 0.2).powi(2);
        let params = [Param::free("a", 0.0), Param::free("b", 0.0)];
        let out = minimize(chi2, &params, &MinimizeOptions::default()).unwrap();

        assert!(out.converged);
        assert_relative_eq!(out.values[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(out.values[1], -1.0, epsilon = 1e-4);
        assert_relative_eq!(out.errors[0], 0.5, max_relative = 1e-2);
        assert_relative_eq!(out.errors[1], 0.2, max_relative = 1e-2);
    }

    #[test]
    fn test_bounds_are_respected() {
        // Unconstrained minimum at 5, but the parameter is capped at 2.
        let chi2 = |p: &[f64]| (p[0] - 5.0).powi(2);
        let params = [Param::bounded("a", 1.0, 0.0, 2.0)];
        let out = minimize(chi2, &params, &MinimizeOptions::default()).unwrap();

        assert!(out.values[0] <= 2.0 + 1e-9);
        assert_relative_eq!(out.values[0], 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_fixed_parameter_kept() {
        let chi2 = |p: &[f64]| (p[0] - 5.0).powi(2) + (p[1] - 1.0).powi(2);
        let params = [Param::fixed("a", 3.0), Param::free("b", 0.0)];
        let out = minimize(chi2, &params, &MinimizeOptions::default()).unwrap();

        assert_relative_eq!(out.values[0], 3.0);
        assert!(out.errors[0].is_nan());
        assert_relative_eq!(out.values[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_all_fixed_is_single_evaluation() {
        let chi2 = |p: &[f64]| p[0] * p[0];
        let params = [Param::fixed("a", 2.0)];
        let out = minimize(chi2, &params, &MinimizeOptions::default()).unwrap();

        assert!(out.converged);
        assert_relative_eq!(out.chi2, 4.0);
        assert_eq!(out.n_eval, 1);
    }

    #[test]
    fn test_rosenbrock_bounded() {
        // Harder curved valley, minimum at (1, 1) inside the box.
        let rosen =
            |p: &[f64]| 100.0 * (p[1] - p[0] * p[0]).powi(2) + (1.0 - p[0]).powi(2);
        let params = [
            Param::bounded("x", -1.5, -2.0, 2.0),
            Param::bounded("y", 0.0, -1.0, 3.0),
        ];
        let out = minimize(rosen, &params, &MinimizeOptions::default()).unwrap();

        assert!(out.converged);
        assert_relative_eq!(out.values[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(out.values[1], 1.0, epsilon = 1e-3);
    }
}
