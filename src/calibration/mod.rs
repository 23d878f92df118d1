//! # PSF shape calibration parameters
//!
//! This module defines the [`CalibrationParams`] configuration struct and
//! its builder, which control how the shape calibration fits wavelength
//! slices, consolidates the constant shape parameters, fits the
//! refraction trajectory with its outlier-robust retry loop, and fits the
//! width trend.
//!
//! ## Pipeline overview
//!
//! 1. **Free slice fits** – every wavelength range is fitted
//!    independently with all profile parameters free.
//! 2. **Aggregation** – the parameters expected constant across
//!    wavelength (`theta`, `ell`, `stddev_ratio`, `amplitude_ratio`) are
//!    consolidated by sigma-clipped averaging.
//! 3. **Constrained refit** – every range is refitted with the constant
//!    parameters seeded and tightly bounded around their aggregate, and
//!    the per-range centroids optionally propagated from step 1.
//! 4. **Trajectory fit** – fitted centroids against wavelength are fed to
//!    the refraction-trajectory fitter; while the reduced chi-square
//!    stays above `adr_chi2_threshold`, a random subset of bins is
//!    redrawn and refitted, up to `max_adr_trials` times.
//! 5. **Width fit** – the power-law width trend is fitted on the
//!    per-range widths.
//!
//! ## Example
//!
//! ```rust
//! use spextract::calibration::CalibrationParams;
//!
//! let params = CalibrationParams::builder()
//!     .stddev_ratio_flexibility(0.2)
//!     .max_adr_trials(30)
//!     .build()
//!     .unwrap();
//! ```

pub mod adr_fit;
pub mod shape;
pub mod slice_fit;

use crate::psf::ProfileModel;
use crate::spextract_errors::SpextractError;

pub use shape::{fit_psf_parameters, ConstantShapeParameters, PsfCalibrator};
pub use slice_fit::{fit_slice, SliceFitConfig, SliceFitResult};

/// Configuration of the three-stage shape calibration.
///
/// Fields
/// -----------------
/// **Slice fits**
/// * `profile` – profile model variant fitted on every slice.
/// * `centroid_errors` – half-width (spaxel units) of the centroid
///   boundaries around a guess.
/// * `propagate_centroid` – seed the constrained refit with the centroids
///   fitted in the free pass instead of re-deriving them from the data.
/// * `adjust_errors` – enable the one-shot error-inflation retry of the
///   per-slice fits.
/// * `slice_chi2_threshold` – reduced chi-square above which that retry
///   triggers.
///
/// **Aggregation / constrained refit**
/// * `stddev_ratio_flexibility` – half-width of the `stddev_ratio`
///   boundaries in the constrained refit; `0` forces the aggregate value.
///
/// **Trajectory fit**
/// * `allow_adr_trials` – when `false`, a poor trajectory fit is kept
///   with a warning instead of triggering the resampling loop.
/// * `max_adr_trials` – hard cap on resampling retries.
/// * `adr_chi2_threshold` – reduced chi-square above which a retry is
///   attempted.
/// * `adr_drop_fraction` – fraction of wavelength bins discarded (at
///   random) on each retry.
///
/// **Width fit**
/// * `width_chi2_threshold` – reduced chi-square above which the width
///   fit errors are scaled up once.
#[derive(Debug, Clone)]
pub struct CalibrationParams {
    pub profile: ProfileModel,
    pub centroid_errors: f64,
    pub propagate_centroid: bool,
    pub adjust_errors: bool,
    pub slice_chi2_threshold: f64,
    pub stddev_ratio_flexibility: f64,
    pub allow_adr_trials: bool,
    pub max_adr_trials: u32,
    pub adr_chi2_threshold: f64,
    pub adr_drop_fraction: f64,
    pub width_chi2_threshold: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            profile: ProfileModel::BiNormalTilted,
            centroid_errors: 1.0,
            propagate_centroid: true,
            adjust_errors: true,
            slice_chi2_threshold: 2.0,
            stddev_ratio_flexibility: 0.2,
            allow_adr_trials: true,
            max_adr_trials: 30,
            adr_chi2_threshold: 10.0,
            adr_drop_fraction: 0.3,
            width_chi2_threshold: 3.0,
        }
    }
}

impl CalibrationParams {
    /// Construct with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new [`CalibrationParamsBuilder`].
    pub fn builder() -> CalibrationParamsBuilder {
        CalibrationParamsBuilder::new()
    }
}

/// Builder for [`CalibrationParams`], with validation.
#[derive(Debug, Clone)]
pub struct CalibrationParamsBuilder {
    params: CalibrationParams,
}

impl Default for CalibrationParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: CalibrationParams::default(),
        }
    }

    pub fn profile(mut self, v: ProfileModel) -> Self {
        self.params.profile = v;
        self
    }
    pub fn centroid_errors(mut self, v: f64) -> Self {
        self.params.centroid_errors = v;
        self
    }
    pub fn propagate_centroid(mut self, v: bool) -> Self {
        self.params.propagate_centroid = v;
        self
    }
    pub fn adjust_errors(mut self, v: bool) -> Self {
        self.params.adjust_errors = v;
        self
    }
    pub fn slice_chi2_threshold(mut self, v: f64) -> Self {
        self.params.slice_chi2_threshold = v;
        self
    }
    pub fn stddev_ratio_flexibility(mut self, v: f64) -> Self {
        self.params.stddev_ratio_flexibility = v;
        self
    }
    pub fn allow_adr_trials(mut self, v: bool) -> Self {
        self.params.allow_adr_trials = v;
        self
    }
    pub fn max_adr_trials(mut self, v: u32) -> Self {
        self.params.max_adr_trials = v;
        self
    }
    pub fn adr_chi2_threshold(mut self, v: f64) -> Self {
        self.params.adr_chi2_threshold = v;
        self
    }
    pub fn adr_drop_fraction(mut self, v: f64) -> Self {
        self.params.adr_drop_fraction = v;
        self
    }
    pub fn width_chi2_threshold(mut self, v: f64) -> Self {
        self.params.width_chi2_threshold = v;
        self
    }

    /// Finalize the builder, validating the configuration.
    ///
    /// Validation rules
    /// -----------------
    /// * `centroid_errors > 0`,
    /// * `stddev_ratio_flexibility >= 0`,
    /// * `slice_chi2_threshold > 0`, `adr_chi2_threshold > 0`,
    ///   `width_chi2_threshold > 0`,
    /// * `max_adr_trials >= 1`,
    /// * `0 < adr_drop_fraction < 1`.
    ///
    /// Return
    /// ----------
    /// * `Err(SpextractError::InvalidCalibrationParameter)` naming the
    ///   offending rule otherwise.
    pub fn build(self) -> Result<CalibrationParams, SpextractError> {
        let p = &self.params;
        if !(p.centroid_errors > 0.0) {
            return Err(SpextractError::InvalidCalibrationParameter(
                "centroid_errors must be > 0".into(),
            ));
        }
        if !(p.stddev_ratio_flexibility >= 0.0) {
            return Err(SpextractError::InvalidCalibrationParameter(
                "stddev_ratio_flexibility must be >= 0".into(),
            ));
        }
        if !(p.slice_chi2_threshold > 0.0)
            || !(p.adr_chi2_threshold > 0.0)
            || !(p.width_chi2_threshold > 0.0)
        {
            return Err(SpextractError::InvalidCalibrationParameter(
                "chi-square thresholds must be > 0".into(),
            ));
        }
        if p.max_adr_trials == 0 {
            return Err(SpextractError::InvalidCalibrationParameter(
                "max_adr_trials must be >= 1".into(),
            ));
        }
        if !(p.adr_drop_fraction > 0.0 && p.adr_drop_fraction < 1.0) {
            return Err(SpextractError::InvalidCalibrationParameter(
                "adr_drop_fraction must lie in (0, 1)".into(),
            ));
        }
        Ok(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_build_succeeds() {
        let p = CalibrationParams::builder().build().unwrap();
        assert_eq!(p.max_adr_trials, 30);
        assert!(p.allow_adr_trials);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(CalibrationParams::builder()
            .centroid_errors(0.0)
            .build()
            .is_err());
        assert!(CalibrationParams::builder()
            .adr_drop_fraction(1.0)
            .build()
            .is_err());
        assert!(CalibrationParams::builder()
            .max_adr_trials(0)
            .build()
            .is_err());
        assert!(CalibrationParams::builder()
            .stddev_ratio_flexibility(-0.1)
            .build()
            .is_err());
    }
}
