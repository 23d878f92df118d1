//! # Three-stage PSF shape calibration
//!
//! Orchestrates the per-slice fits across wavelength and consolidates
//! them into a finalized, wavelength-parametrized PSF model:
//!
//! 1. fit every wavelength range independently with all profile
//!    parameters free,
//! 2. refit with the wavelength-independent parameters seeded and
//!    tightly bounded around their sigma-clipped aggregates,
//! 3. fit the refraction trajectory through the fitted centroids (with
//!    an outlier-robust resampling retry) and the power-law width trend.
//!
//! Per-slice fits are independent and run in parallel; a failed slice is
//! logged and skipped, never fatal. The aggregation and trajectory/width
//! fits are sequential and wait for all contributing slices.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rand::{rngs::StdRng, SeedableRng};
//! use spextract::calibration::{fit_psf_parameters, CalibrationParams};
//!
//! # fn demo(cube: spextract::cube::Cube) -> Result<(), spextract::spextract_errors::SpextractError> {
//! let ranges: Vec<(f64, f64)> = (0..6)
//!     .map(|i| (3800.0 + 700.0 * i as f64, 4500.0 + 700.0 * i as f64))
//!     .collect();
//! let params = CalibrationParams::default();
//! let mut rng = StdRng::seed_from_u64(42);
//! let psf = fit_psf_parameters(&cube, &ranges, None, &params, &mut rng)?;
//! psf.write_to("psf_descriptor.json")?;
//! # Ok(()) }
//! ```

use std::collections::HashMap;

use ahash::RandomState;
use itertools::Itertools;
use log::warn;
use rand::seq::index::sample;
use rand::Rng;
use rayon::prelude::*;

use crate::adr::Adr;
use crate::constants::{
    DEFAULT_LBDA_REF, DEFAULT_PRESSURE_MBAR, DEFAULT_RELATIVE_HUMIDITY, DEFAULT_TEMPERATURE_C,
    IFU_SCALE_UNIT, MOUNT_PARANGLE_OFFSET, WIDTH_ERROR_FLOOR, WIDTH_ERROR_ZERO_REPLACEMENT,
};
use crate::cube::Cube;
use crate::fitting::{minimize, MinimizeOptions, Param};
use crate::psf::model::{AdrDiagnostics, ConstantShape, PsfModel, WidthTrend};
use crate::spextract_errors::SpextractError;
use crate::stats::{median, sigma_clipped_mean};

use super::adr_fit::{AdrFitResult, AdrFitter, AdrGuesses};
use super::slice_fit::{fit_slice, ParamTuning, SliceFitConfig, SliceFitResult, SliceFitTuning};
use super::CalibrationParams;

/// Per-slice fit results keyed by wavelength-range index.
pub type SliceFits = HashMap<usize, SliceFitResult, RandomState>;

/// Completed stages of the calibration, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CalibrationStage {
    Empty,
    FreeFit,
    ConstrainedFit,
    TrajectoryFit,
    WidthFit,
}

/// Robust central estimates of the wavelength-independent shape
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantShapeParameters {
    pub theta: f64,
    pub stddev_ratio: f64,
    pub ell: f64,
    pub amplitude_ratio: f64,
}

/// Driver of the shape calibration over one cube.
#[derive(Debug)]
pub struct PsfCalibrator<'a> {
    cube: &'a Cube,
    params: CalibrationParams,
    lbda_ranges: Vec<(f64, f64)>,
    slicefits: SliceFits,
    stage: CalibrationStage,
    adr_result: Option<AdrFitResult>,
    adr_trials: u32,
    adr_kept_poor: bool,
    width: Option<WidthTrend>,
}

impl<'a> PsfCalibrator<'a> {
    pub fn new(cube: &'a Cube, params: CalibrationParams) -> Self {
        Self {
            cube,
            params,
            lbda_ranges: Vec::new(),
            slicefits: HashMap::default(),
            stage: CalibrationStage::Empty,
            adr_result: None,
            adr_trials: 0,
            adr_kept_poor: false,
            width: None,
        }
    }

    pub fn stage(&self) -> CalibrationStage {
        self.stage
    }

    /// Fit results of the latest slice pass, keyed by range index.
    pub fn slicefits(&self) -> &SliceFits {
        &self.slicefits
    }

    /// Number of resampling retries consumed by the trajectory fit.
    pub fn adr_trials(&self) -> u32 {
        self.adr_trials
    }

    /// Whether the trajectory fit was kept despite a reduced chi-square
    /// above the acceptance threshold.
    pub fn adr_kept_poor(&self) -> bool {
        self.adr_kept_poor
    }

    pub fn adr_result(&self) -> Option<&AdrFitResult> {
        self.adr_result.as_ref()
    }

    pub fn width_trend(&self) -> Option<&WidthTrend> {
        self.width.as_ref()
    }

    /// Mid-point wavelength of each configured range.
    fn mid_lbdas(&self) -> Vec<f64> {
        self.lbda_ranges
            .iter()
            .map(|(lo, hi)| 0.5 * (lo + hi))
            .collect()
    }

    // --------------- //
    //  Slice fitting  //
    // --------------- //

    /// Fit every wavelength range independently (parallel fan-out).
    ///
    /// Arguments
    /// -----------------
    /// * `lbda_ranges`: Wavelength ranges `[(l_min, l_max), ...]` defining
    ///   the fitted slices.
    /// * `centroid_guesses`: Optional per-range centroid guesses; must
    ///   match `lbda_ranges` in length.
    /// * `tuning`: Per-parameter overrides applied to every range (used
    ///   by the constrained refit).
    ///
    /// Return
    /// ----------
    /// * `Err(SpextractError::CentroidGuessMismatch)` before any work on
    ///   a length mismatch.
    /// * `Err(SpextractError::InsufficientData)` when every single range
    ///   failed to fit.
    ///
    /// Notes
    /// ----------
    /// * A failing range (too few spaxels, empty wavelength selection) is
    ///   logged and skipped: one bad bin does not abort the calibration.
    /// * Calling this again replaces the previous results and resets the
    ///   trajectory and width products.
    pub fn fit_slices(
        &mut self,
        lbda_ranges: &[(f64, f64)],
        centroid_guesses: Option<&[(f64, f64)]>,
        tuning: SliceFitTuning,
    ) -> Result<(), SpextractError> {
        if let Some(guesses) = centroid_guesses {
            if guesses.len() != lbda_ranges.len() {
                return Err(SpextractError::CentroidGuessMismatch {
                    expected: lbda_ranges.len(),
                    got: guesses.len(),
                });
            }
        }

        let centroid_err = (self.params.centroid_errors, self.params.centroid_errors);
        let results: Vec<(usize, Result<SliceFitResult, SpextractError>)> = lbda_ranges
            .par_iter()
            .enumerate()
            .map(|(i, &(lo, hi))| {
                let fit = self.cube.get_slice(lo, hi).and_then(|slice| {
                    let config = SliceFitConfig {
                        model: Some(self.params.profile),
                        centroid: centroid_guesses.map(|g| g[i]),
                        centroid_err: Some(centroid_err),
                        tuning,
                        fitted_indexes: None,
                        no_error_adjustment: !self.params.adjust_errors,
                        chi2_threshold: Some(self.params.slice_chi2_threshold),
                    };
                    fit_slice(&slice, &config)
                });
                (i, fit)
            })
            .collect();

        self.slicefits.clear();
        for (i, res) in results {
            match res {
                Ok(fit) => {
                    self.slicefits.insert(i, fit);
                }
                Err(e) => warn!("slice {i} skipped: {e}"),
            }
        }
        if self.slicefits.is_empty() {
            return Err(SpextractError::InsufficientData {
                needed: 1,
                got: 0,
            });
        }

        self.lbda_ranges = lbda_ranges.to_vec();
        self.stage = if self.stage >= CalibrationStage::FreeFit {
            CalibrationStage::ConstrainedFit
        } else {
            CalibrationStage::FreeFit
        };
        self.adr_result = None;
        self.adr_trials = 0;
        self.adr_kept_poor = false;
        self.width = None;
        Ok(())
    }

    // --------------- //
    //  Aggregation    //
    // --------------- //

    /// Consolidate the wavelength-independent shape parameters.
    ///
    /// Each parameter is averaged across the slice fits with 2-sigma
    /// clipping over 2 iterations; when every per-slice estimate is
    /// bit-identical (the signature of a parameter held fixed) the exact
    /// value is returned instead.
    pub fn const_parameters(&self) -> Result<ConstantShapeParameters, SpextractError> {
        if self.slicefits.is_empty() {
            return Err(SpextractError::CalibrationOrder(
                "const_parameters requires fitted slices",
            ));
        }

        let const_value = |pick: fn(&SliceFitResult) -> f64| -> f64 {
            let values: Vec<f64> = self.slicefits.values().map(pick).collect();
            let identical = values.windows(2).all(|w| w[0] == w[1]);
            if identical {
                values[0]
            } else {
                sigma_clipped_mean(&values, 2.0, 2)
            }
        };

        Ok(ConstantShapeParameters {
            theta: const_value(|f| f.profile.theta.value),
            stddev_ratio: const_value(|f| f.profile.stddev_ratio.value),
            ell: const_value(|f| f.profile.ell.value),
            amplitude_ratio: const_value(|f| f.profile.amplitude_ratio.value),
        })
    }

    // --------------- //
    //  Trajectory     //
    // --------------- //

    /// Fit the refraction trajectory on a subset of the wavelength bins
    /// (all bins when `indexes` is `None`).
    pub fn fit_adr(&mut self, indexes: Option<&[usize]>) -> Result<AdrFitResult, SpextractError> {
        if self.slicefits.is_empty() {
            return Err(SpextractError::CalibrationOrder(
                "fit_adr requires fitted slices",
            ));
        }
        let header = self.cube.header();
        let airmass = header
            .airmass
            .ok_or(SpextractError::MissingHeaderEntry("airmass"))?;
        let parangle_guess = match (header.telescope_pa, header.parallactic_angle) {
            (Some(tel_pa), _) => (tel_pa + MOUNT_PARANGLE_OFFSET).rem_euclid(360.0),
            (None, Some(pa)) => pa.rem_euclid(360.0),
            (None, None) => {
                return Err(SpextractError::MissingHeaderEntry("telescope_pa"));
            }
        };

        let mids = self.mid_lbdas();
        let all: Vec<usize> = (0..self.lbda_ranges.len()).collect();
        let chosen = indexes.unwrap_or(&all);

        let (lbda, x, y, xerr, yerr): (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) = chosen
            .iter()
            .filter_map(|&i| {
                self.slicefits.get(&i).map(|fit| {
                    (
                        mids[i],
                        fit.profile.xcentroid.value,
                        fit.profile.ycentroid.value,
                        fit.profile.xcentroid.sigma,
                        fit.profile.ycentroid.sigma,
                    )
                })
            })
            .multiunzip();

        let base = Adr {
            lbdaref: DEFAULT_LBDA_REF,
            airmass,
            parangle: parangle_guess,
            pressure: header.pressure_mbar.unwrap_or(DEFAULT_PRESSURE_MBAR),
            temperature: header.temperature_c.unwrap_or(DEFAULT_TEMPERATURE_C),
            relathumidity: header
                .relative_humidity
                .unwrap_or(DEFAULT_RELATIVE_HUMIDITY),
        };
        let guesses = AdrGuesses {
            airmass,
            airmass_boundaries: (1.0, airmass * 1.5),
            parangle: parangle_guess,
            parangle_boundaries: (0.0, 360.0),
            xref: crate::stats::nanmean(&x),
            yref: crate::stats::nanmean(&y),
        };

        let fitter = AdrFitter::new(base, IFU_SCALE_UNIT, lbda, x, y, xerr, yerr)?;
        let result = fitter.fit(&guesses)?;
        self.adr_result = Some(result.clone());
        self.stage = self.stage.max(CalibrationStage::TrajectoryFit);
        Ok(result)
    }

    /// Fit the trajectory with the outlier-robust resampling retry.
    ///
    /// While the reduced chi-square stays above the acceptance threshold
    /// a random subset of the wavelength bins (the configured keep
    /// fraction) is redrawn and refitted, up to the configured number of
    /// trials. When trials are disabled, or exhausted, the best available
    /// fit is kept with a warning rather than failing: downstream forced
    /// photometry can still proceed on a suboptimal but fully defined
    /// model.
    ///
    /// Arguments
    /// -----------------
    /// * `rng`: Random source for the subset draws; inject a seeded
    ///   generator for reproducible calibrations.
    pub fn fit_adr_with_trials(
        &mut self,
        rng: &mut impl Rng,
    ) -> Result<AdrFitResult, SpextractError> {
        let nbins = self.lbda_ranges.len();
        let keep = ((nbins as f64) * (1.0 - self.params.adr_drop_fraction)) as usize;
        let keep = keep.clamp(3.min(nbins), nbins);

        self.adr_trials = 0;
        self.adr_kept_poor = false;
        let mut indexes: Option<Vec<usize>> = None;

        loop {
            let result = self.fit_adr(indexes.as_deref())?;
            let chi2_dof = result.chi2_dof();
            if chi2_dof <= self.params.adr_chi2_threshold {
                return Ok(result);
            }
            if !self.params.allow_adr_trials {
                warn!(
                    "trajectory chi2/dof of {chi2_dof:.2} -> no trial allowed, keeping the fit"
                );
                self.adr_kept_poor = true;
                return Ok(result);
            }
            if self.adr_trials >= self.params.max_adr_trials {
                warn!(
                    "trajectory chi2/dof of {chi2_dof:.2} after {} trials, keeping the best available fit",
                    self.adr_trials
                );
                self.adr_kept_poor = true;
                return Ok(result);
            }
            self.adr_trials += 1;
            warn!(
                "trajectory chi2/dof of {chi2_dof:.2} -> refit with {:.0}% of the bins dropped (trial {}/{})",
                self.params.adr_drop_fraction * 100.0,
                self.adr_trials,
                self.params.max_adr_trials
            );
            indexes = Some(sample(rng, nbins, keep).into_vec());
        }
    }

    // --------------- //
    //  Width trend    //
    // --------------- //

    /// Fit the power-law width trend on the per-range widths.
    ///
    /// The objective is the robust absolute deviation
    /// `sum |stddev_i - trend(lbda_i)| / err_i`; zero width errors are
    /// replaced and small ones floored so near-zero-uncertainty outliers
    /// cannot dominate. When the reduced deviation exceeds the configured
    /// threshold the errors are scaled up once by its square root and the
    /// fit repeated.
    pub fn fit_width(&mut self, indexes: Option<&[usize]>) -> Result<WidthTrend, SpextractError> {
        let lbdaref = match &self.adr_result {
            Some(res) => res.adr.lbdaref,
            None => {
                return Err(SpextractError::CalibrationOrder(
                    "fit_width requires a trajectory fit",
                ))
            }
        };

        let mids = self.mid_lbdas();
        let all: Vec<usize> = (0..self.lbda_ranges.len()).collect();
        let chosen = indexes.unwrap_or(&all);

        let mut lbda = Vec::new();
        let mut stddev = Vec::new();
        let mut err = Vec::new();
        for &i in chosen {
            if let Some(fit) = self.slicefits.get(&i) {
                lbda.push(mids[i]);
                stddev.push(fit.profile.stddev.value);
                let e = fit.profile.stddev.sigma;
                let e = if !e.is_finite() || e == 0.0 {
                    WIDTH_ERROR_ZERO_REPLACEMENT
                } else {
                    e.max(WIDTH_ERROR_FLOOR)
                };
                err.push(e);
            }
        }
        if stddev.len() < 3 {
            return Err(SpextractError::InsufficientData {
                needed: 3,
                got: stddev.len(),
            });
        }

        let params = [
            Param::bounded("stddev_ref", median(&stddev), 0.5, 10.0),
            Param::bounded("rho", -0.2, -1.0, 1.0),
        ];
        let run = |errs: &[f64]| {
            let objective = |p: &[f64]| -> f64 {
                itertools::izip!(&lbda, &stddev, errs)
                    .map(|(&l, &s, &e)| {
                        let trend = p[0] * (l / lbdaref).powf(p[1]);
                        (s - trend).abs() / e
                    })
                    .sum()
            };
            minimize(objective, &params, &MinimizeOptions::default())
        };

        let mut outcome = run(&err)?;
        let dof = (stddev.len() - 2) as f64;
        let chi2_dof = outcome.chi2 / dof;
        if chi2_dof > self.params.width_chi2_threshold {
            // Single inflation pass with errors scaled to the observed
            // dispersion.
            let scale = chi2_dof.sqrt();
            let scaled: Vec<f64> = err.iter().map(|e| e * scale).collect();
            outcome = run(&scaled)?;
        }

        let trend = WidthTrend {
            stddev_ref: outcome.values[0],
            rho: outcome.values[1],
        };
        self.width = Some(trend);
        self.stage = self.stage.max(CalibrationStage::WidthFit);
        Ok(trend)
    }

    // --------------- //
    //  Output         //
    // --------------- //

    /// Assemble the finalized PSF model from the completed calibration.
    pub fn psf_model(&self) -> Result<PsfModel, SpextractError> {
        let adr_result = self.adr_result.as_ref().ok_or(
            SpextractError::CalibrationOrder("psf_model requires a trajectory fit"),
        )?;
        let width = self.width.ok_or(SpextractError::CalibrationOrder(
            "psf_model requires a width fit",
        ))?;
        let constants = self.const_parameters()?;

        Ok(PsfModel::new(
            adr_result.adr,
            adr_result.xref.value,
            adr_result.yref.value,
            IFU_SCALE_UNIT,
            ConstantShape {
                stddev_ratio: constants.stddev_ratio,
                amplitude_ratio: constants.amplitude_ratio,
                theta: constants.theta,
                ell: constants.ell,
            },
            width,
            self.params.profile.name(),
            AdrDiagnostics {
                airmass_err: Some(adr_result.airmass.sigma).filter(|s| s.is_finite()),
                parangle_err: Some(adr_result.parangle.sigma).filter(|s| s.is_finite()),
                xref_err: Some(adr_result.xref.sigma).filter(|s| s.is_finite()),
                yref_err: Some(adr_result.yref.sigma).filter(|s| s.is_finite()),
                parangle_ref: self.cube.header().telescope_pa,
            },
        ))
    }
}

/// Extract the PSF shape parameters of a single point-source cube.
///
/// Runs the full calibration: free slice fits, aggregation, constrained
/// refit with the constant parameters seeded and bounded around their
/// aggregates, trajectory fit with resampling retries, width-trend fit.
///
/// Arguments
/// -----------------
/// * `cube`: Wavelength-calibrated cube containing one point source.
/// * `lbda_ranges`: Wavelength ranges defining the fitted meta-slices.
/// * `centroid_guesses`: Optional per-range centroid guesses for the
///   first pass (same length as `lbda_ranges`).
/// * `params`: Calibration configuration.
/// * `rng`: Random source of the trajectory resampling retry.
///
/// Return
/// ----------
/// * The finalized [`PsfModel`], ready for forced photometry or
///   persistence.
///
/// See also
/// ------------
/// * [`PsfCalibrator`] – stage-by-stage driver used internally.
/// * [`crate::force_photometry::fit_force_spectroscopy`] – consumes the
///   returned model.
pub fn fit_psf_parameters(
    cube: &Cube,
    lbda_ranges: &[(f64, f64)],
    centroid_guesses: Option<&[(f64, f64)]>,
    params: &CalibrationParams,
    rng: &mut impl Rng,
) -> Result<PsfModel, SpextractError> {
    let mut calibrator = PsfCalibrator::new(cube, params.clone());

    // Step 1: all profile parameters free.
    calibrator.fit_slices(lbda_ranges, centroid_guesses, SliceFitTuning::default())?;
    let constants = calibrator.const_parameters()?;

    // Step 2: seed and bound the wavelength-independent parameters
    // around their aggregates.
    let mut tuning = SliceFitTuning::default();
    tuning.ell = ParamTuning {
        guess: Some(constants.ell),
        boundaries: Some((constants.ell - 0.05, constants.ell + 0.05)),
        fixed: None,
    };
    tuning.theta = ParamTuning {
        guess: Some(constants.theta),
        boundaries: Some((constants.theta - 0.1, constants.theta + 0.1)),
        fixed: None,
    };
    // The tail/core width ratio turns unstable above 2: clamp the seed.
    let ratio = if constants.stddev_ratio >= 2.0 {
        1.7
    } else {
        constants.stddev_ratio
    };
    tuning.stddev_ratio = if params.stddev_ratio_flexibility > 0.0 {
        ParamTuning {
            guess: Some(ratio),
            boundaries: Some((
                ratio - params.stddev_ratio_flexibility,
                ratio + params.stddev_ratio_flexibility,
            )),
            fixed: None,
        }
    } else {
        ParamTuning {
            guess: Some(ratio),
            boundaries: None,
            fixed: Some(true),
        }
    };
    tuning.amplitude_ratio = ParamTuning {
        guess: Some(constants.amplitude_ratio),
        boundaries: None,
        fixed: None,
    };

    let propagated: Option<Vec<(f64, f64)>> = if params.propagate_centroid {
        // Seed each range with its own stage-1 centroid; ranges skipped
        // in stage 1 fall back to the caller's guess or the data.
        let fitted: SliceFits = calibrator.slicefits().clone();
        Some(
            (0..lbda_ranges.len())
                .map(|i| match fitted.get(&i) {
                    Some(fit) => (
                        fit.profile.xcentroid.value,
                        fit.profile.ycentroid.value,
                    ),
                    None => centroid_guesses
                        .map(|g| g[i])
                        .unwrap_or((f64::NAN, f64::NAN)),
                })
                .collect(),
        )
    } else {
        centroid_guesses.map(|g| g.to_vec())
    };
    // Ranges without any usable centroid guess re-derive it from the
    // brightest spaxels.
    calibrator.fit_slices(
        lbda_ranges,
        propagated
            .as_deref()
            .filter(|g| g.iter().all(|(x, y)| x.is_finite() && y.is_finite())),
        tuning,
    )?;

    // Step 3: trajectory with resampling retries, then the width trend.
    calibrator.fit_adr_with_trials(rng)?;
    calibrator.fit_width(None)?;

    calibrator.psf_model()
}
