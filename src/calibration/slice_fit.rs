//! # Per-slice PSF fitting
//!
//! Fit the bi-normal profile plus background to one wavelength slice by
//! bounded chi-square minimization, with heuristic initial guesses and a
//! single error-inflation retry when the error model under-states the
//! observed dispersion.
//!
//! ## Error-inflation retry
//!
//! Quoted variances only account for photon and read noise; residual
//! systematics (flat-fielding, resampling) leave the reduced chi-square
//! well above one on bright slices. When `chi2 / dof` exceeds the
//! configured threshold after a converged first fit, the intrinsic
//! per-point scatter bringing the reduced chi-square to one is solved
//! numerically, added (scaled by `1/sqrt(2)` to avoid double counting
//! between the two passes) to every per-point error, and the fit is run
//! once more. The retry is a single explicit pass, never a recursion.

use log::warn;

use crate::cube::Slice;
use crate::fitting::{minimize, Fitted, MinimizeOptions, Param};
use crate::psf::ProfileModel;
use crate::spextract_errors::SpextractError;
use crate::stats::{fit_intrinsic, median};

/// Optional override of one fitted parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamTuning {
    pub guess: Option<f64>,
    pub boundaries: Option<(f64, f64)>,
    pub fixed: Option<bool>,
}

impl ParamTuning {
    fn apply(&self, param: &mut Param) {
        if let Some(g) = self.guess {
            param.guess = g;
        }
        if let Some((lo, hi)) = self.boundaries {
            param.lower = Some(lo);
            param.upper = Some(hi);
        }
        if let Some(f) = self.fixed {
            param.fixed = f;
        }
    }
}

/// Per-parameter overrides of the slice-fit guesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceFitTuning {
    pub xcentroid: ParamTuning,
    pub ycentroid: ParamTuning,
    pub stddev: ParamTuning,
    pub stddev_ratio: ParamTuning,
    pub amplitude_ratio: ParamTuning,
    pub theta: ParamTuning,
    pub ell: ParamTuning,
    pub amplitude: ParamTuning,
}

impl SliceFitTuning {
    fn apply(&self, params: &mut [Param]) {
        // Profile parameters share the fixed layout of PROFILE_PARAM_NAMES.
        self.xcentroid.apply(&mut params[0]);
        self.ycentroid.apply(&mut params[1]);
        self.stddev.apply(&mut params[2]);
        self.stddev_ratio.apply(&mut params[3]);
        self.amplitude_ratio.apply(&mut params[4]);
        self.theta.apply(&mut params[5]);
        self.ell.apply(&mut params[6]);
        self.amplitude.apply(&mut params[7]);
    }
}

/// Configuration of one slice fit.
#[derive(Debug, Clone, Default)]
pub struct SliceFitConfig {
    /// Profile model variant.
    pub model: Option<ProfileModel>,
    /// Externally supplied centroid guess.
    pub centroid: Option<(f64, f64)>,
    /// Half-width of the centroid boundaries (spaxel units).
    pub centroid_err: Option<(f64, f64)>,
    /// Per-parameter overrides.
    pub tuning: SliceFitTuning,
    /// Restrict the fit to these spaxel indexes.
    pub fitted_indexes: Option<Vec<usize>>,
    /// Disable the error-inflation retry.
    pub no_error_adjustment: bool,
    /// Reduced chi-square above which the retry triggers (default 2).
    pub chi2_threshold: Option<f64>,
}

impl SliceFitConfig {
    fn model(&self) -> ProfileModel {
        self.model.unwrap_or(ProfileModel::BiNormalTilted)
    }

    fn centroid_err(&self) -> (f64, f64) {
        self.centroid_err.unwrap_or((2.0, 2.0))
    }

    fn chi2_threshold(&self) -> f64 {
        self.chi2_threshold.unwrap_or(2.0)
    }
}

/// Fitted profile parameters of one slice.
#[derive(Debug, Clone, Copy)]
pub struct ProfileFit {
    pub xcentroid: Fitted,
    pub ycentroid: Fitted,
    pub stddev: Fitted,
    pub stddev_ratio: Fitted,
    pub amplitude_ratio: Fitted,
    pub theta: Fitted,
    pub ell: Fitted,
    pub amplitude: Fitted,
}

/// Fitted background coefficients, by variant.
#[derive(Debug, Clone)]
pub enum BackgroundFit {
    Flat {
        bkgd: Fitted,
    },
    Tilted {
        bkgd: Fitted,
        bkgdx: Fitted,
        bkgdy: Fitted,
    },
    Curved {
        bkgd: Fitted,
        bkgdx: Fitted,
        bkgdy: Fitted,
        bkgdxy: Fitted,
        bkgdxx: Fitted,
        bkgdyy: Fitted,
    },
}

/// Outcome of one slice fit. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct SliceFitResult {
    /// Representative wavelength of the fitted slice.
    pub lbda: f64,
    pub model: ProfileModel,
    pub profile: ProfileFit,
    pub background: BackgroundFit,
    pub chi2: f64,
    pub dof: usize,
    pub npoints: usize,
    /// Whether the minimizer met its convergence criteria; callers must
    /// check this before trusting the values.
    pub converged: bool,
    /// Intrinsic scatter added to the per-point errors by the retry
    /// (zero when no retry ran).
    pub intrinsic_error: f64,
}

impl SliceFitResult {
    /// Reduced chi-square of the fit.
    pub fn chi2_dof(&self) -> f64 {
        self.chi2 / self.dof as f64
    }
}

/// Fit the PSF profile on one wavelength slice.
///
/// Arguments
/// -----------------
/// * `slice`: The slice to fit; data, variance and coordinates are read
///   only.
/// * `config`: Variant selection, centroid help, per-parameter overrides,
///   spatial restriction and retry control.
///
/// Return
/// ----------
/// * `Ok(SliceFitResult)` – including non-converged fits, reported
///   through [`SliceFitResult::converged`].
/// * `Err(SpextractError::InsufficientData)` – fewer usable spaxels than
///   fitted parameters plus one.
///
/// See also
/// ------------
/// * [`crate::calibration::shape::PsfCalibrator`] – batch driver over
///   wavelength ranges.
pub fn fit_slice(slice: &Slice, config: &SliceFitConfig) -> Result<SliceFitResult, SpextractError> {
    let model = config.model();

    // Participating spaxels: requested subset, then finite values only.
    let candidates: Vec<usize> = match &config.fitted_indexes {
        Some(idx) => idx.clone(),
        None => (0..slice.n_spaxels()).collect(),
    };
    let kept: Vec<usize> = candidates
        .into_iter()
        .filter(|&i| slice.x[i].is_finite() && slice.y[i].is_finite() && slice.data[i].is_finite())
        .collect();

    let nparam = model.n_params();
    if kept.len() <= nparam {
        return Err(SpextractError::InsufficientData {
            needed: nparam + 1,
            got: kept.len(),
        });
    }

    let x: Vec<f64> = kept.iter().map(|&i| slice.x[i]).collect();
    let y: Vec<f64> = kept.iter().map(|&i| slice.y[i]).collect();
    let data: Vec<f64> = kept.iter().map(|&i| slice.data[i]).collect();
    let errors = fitted_errors(slice, &kept);

    let mut params = model.get_guesses(&x, &y, &data, config.centroid, config.centroid_err())?;
    config.tuning.apply(&mut params);

    let npoints = data.len();
    let dof = npoints - nparam;
    let options = MinimizeOptions::default();

    let run = |errs: &[f64]| {
        let objective = |p: &[f64]| -> f64 {
            let mut chi2 = 0.0;
            for i in 0..npoints {
                let m = model.evaluate(x[i], y[i], p);
                let r = (data[i] - m) / errs[i];
                chi2 += r * r;
            }
            chi2
        };
        minimize(objective, &params, &options)
    };

    let mut outcome = run(&errors)?;
    let mut intrinsic_error = 0.0;

    if !config.no_error_adjustment && outcome.chi2 / dof as f64 > config.chi2_threshold() {
        // One explicit inflation pass: estimate the missing scatter and
        // refit with the inflated errors.
        let residuals: Vec<f64> = (0..npoints)
            .map(|i| data[i] - model.evaluate(x[i], y[i], &outcome.values))
            .collect();
        let intrinsic = fit_intrinsic(&residuals, &errors, dof)?;
        if intrinsic > 0.0 {
            intrinsic_error = intrinsic / 2f64.sqrt();
            let inflated: Vec<f64> = errors.iter().map(|e| e + intrinsic_error).collect();
            outcome = run(&inflated)?;
        }
    }

    if !outcome.converged {
        warn!(
            "slice fit at {:.0} A did not converge (chi2/dof = {:.2})",
            slice.lbda,
            outcome.chi2 / dof as f64
        );
    }

    let fitted = |i: usize| Fitted::new(outcome.values[i], outcome.errors[i]);
    let profile = ProfileFit {
        xcentroid: fitted(0),
        ycentroid: fitted(1),
        stddev: fitted(2),
        stddev_ratio: fitted(3),
        amplitude_ratio: fitted(4),
        theta: fitted(5),
        ell: fitted(6),
        amplitude: fitted(7),
    };
    let background = match model {
        ProfileModel::BiNormalFlat => BackgroundFit::Flat { bkgd: fitted(8) },
        ProfileModel::BiNormalTilted => BackgroundFit::Tilted {
            bkgd: fitted(8),
            bkgdx: fitted(9),
            bkgdy: fitted(10),
        },
        ProfileModel::BiNormalCurved => BackgroundFit::Curved {
            bkgd: fitted(8),
            bkgdx: fitted(9),
            bkgdy: fitted(10),
            bkgdxy: fitted(11),
            bkgdxx: fitted(12),
            bkgdyy: fitted(13),
        },
    };

    Ok(SliceFitResult {
        lbda: slice.lbda,
        model,
        profile,
        background,
        chi2: outcome.chi2,
        dof,
        npoints,
        converged: outcome.converged,
        intrinsic_error,
    })
}

/// Per-point 1-sigma errors of the fitted spaxels.
///
/// Missing variances default to unity; non-positive variances are
/// replaced by twice the median variance of the fitted set.
fn fitted_errors(slice: &Slice, kept: &[usize]) -> Vec<f64> {
    match &slice.variance {
        None => vec![1.0; kept.len()],
        Some(var) => {
            let values: Vec<f64> = kept.iter().map(|&i| var[i]).collect();
            if values.iter().any(|&v| v <= 0.0) {
                warn!("negative or zero variance detected: set back to twice the median variance");
                let fallback = 2.0 * median(&values);
                values
                    .iter()
                    .map(|&v| {
                        let v = if v <= 0.0 { fallback } else { v };
                        v.sqrt()
                    })
                    .collect()
            } else {
                values.iter().map(|v| v.sqrt()).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::profile::{binormal_profile, ProfileParams};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    /// Synthetic slice on a regular grid, known profile plus flat
    /// background plus Gaussian noise at the requested SNR.
    fn synthetic_slice(truth: &ProfileParams, background: f64, snr: f64, seed: u64) -> Slice {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut data = Vec::new();
        let mut variance = Vec::new();
        let peak = binormal_profile(truth.xcentroid, truth.ycentroid, truth);
        let sigma = peak / snr;
        let noise = Normal::new(0.0, sigma).unwrap();
        for i in -8..=8 {
            for j in -8..=8 {
                let (xi, yj) = (i as f64, j as f64);
                x.push(xi);
                y.push(yj);
                data.push(binormal_profile(xi, yj, truth) + background + noise.sample(&mut rng));
                variance.push(sigma * sigma);
            }
        }
        Slice {
            lbda: 5000.0,
            x,
            y,
            data,
            variance: Some(variance),
        }
    }

    fn truth() -> ProfileParams {
        ProfileParams {
            xcentroid: 0.4,
            ycentroid: -0.6,
            stddev: 1.3,
            stddev_ratio: 2.0,
            amplitude_ratio: 3.0,
            theta: 1.5,
            ell: 0.05,
            amplitude: 500.0,
        }
    }

    #[test]
    fn test_recovers_injected_parameters() {
        let truth = truth();
        let slice = synthetic_slice(&truth, 5.0, 50.0, 7);
        let result = fit_slice(&slice, &SliceFitConfig::default()).unwrap();

        assert!(result.converged);
        let p = &result.profile;
        assert_relative_eq!(p.xcentroid.value, truth.xcentroid, epsilon = 0.1);
        assert_relative_eq!(p.ycentroid.value, truth.ycentroid, epsilon = 0.1);
        assert_relative_eq!(p.stddev.value, truth.stddev, max_relative = 0.15);
        assert_relative_eq!(p.amplitude.value, truth.amplitude, max_relative = 0.15);
        match &result.background {
            BackgroundFit::Tilted { bkgd, .. } => {
                assert_relative_eq!(bkgd.value, 5.0, epsilon = 1.0)
            }
            other => panic!("unexpected background variant: {other:?}"),
        }
    }

    #[test]
    fn test_centroid_guess_is_honored() {
        let truth = truth();
        let slice = synthetic_slice(&truth, 5.0, 50.0, 11);
        let config = SliceFitConfig {
            centroid: Some((truth.xcentroid, truth.ycentroid)),
            centroid_err: Some((0.5, 0.5)),
            ..Default::default()
        };
        let result = fit_slice(&slice, &config).unwrap();
        // The fitted centroid cannot leave the requested box.
        assert!((result.profile.xcentroid.value - truth.xcentroid).abs() <= 0.5 + 1e-9);
        assert!((result.profile.ycentroid.value - truth.ycentroid).abs() <= 0.5 + 1e-9);
    }

    #[test]
    fn test_fixed_parameter_survives_exactly() {
        let truth = truth();
        let slice = synthetic_slice(&truth, 5.0, 30.0, 3);
        let config = SliceFitConfig {
            tuning: SliceFitTuning {
                theta: ParamTuning {
                    guess: Some(1.2),
                    fixed: Some(true),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let result = fit_slice(&slice, &config).unwrap();
        assert_relative_eq!(result.profile.theta.value, 1.2);
        assert!(result.profile.theta.sigma.is_nan());
    }

    #[test]
    fn test_error_inflation_single_pass() {
        let truth = truth();
        // Understate the variance tenfold so the first fit lands well
        // above the chi-square threshold.
        let mut slice = synthetic_slice(&truth, 5.0, 20.0, 5);
        if let Some(var) = slice.variance.as_mut() {
            for v in var.iter_mut() {
                *v /= 10.0;
            }
        }
        let adjusted = fit_slice(&slice, &SliceFitConfig::default()).unwrap();
        assert!(adjusted.intrinsic_error > 0.0);

        // With the retry disabled the intrinsic error stays zero and the
        // fitted values match a plain single fit.
        let config = SliceFitConfig {
            no_error_adjustment: true,
            ..Default::default()
        };
        let plain = fit_slice(&slice, &config).unwrap();
        assert_relative_eq!(plain.intrinsic_error, 0.0);
        assert!(plain.chi2 >= adjusted.chi2);
    }

    #[test]
    fn test_too_few_spaxels_rejected() {
        let slice = Slice {
            lbda: 5000.0,
            x: vec![0.0; 5],
            y: vec![0.0; 5],
            data: vec![1.0; 5],
            variance: None,
        };
        assert!(matches!(
            fit_slice(&slice, &SliceFitConfig::default()),
            Err(SpextractError::InsufficientData { .. })
        ));
    }
}
