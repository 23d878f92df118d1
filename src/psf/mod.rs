//! # PSF profile models
//!
//! The point-source profile fitted on every wavelength slice: an
//! elliptical bi-normal blend (see [`profile`]) on top of a polynomial
//! background. Three background variants are supported, selected by name:
//!
//! * `BiNormalFlat` – constant background,
//! * `BiNormalTilted` – tilted plane (`bkgd + bkgdx*x + bkgdy*y`),
//! * `BiNormalCurved` – curved quadric (adds `xy`, `x^2`, `y^2` terms).
//!
//! The variants only differ by their background evaluation and parameter
//! list; the profile itself and the guess heuristics are shared.

pub mod model;
pub mod profile;

use crate::fitting::Param;
use crate::spextract_errors::SpextractError;
use crate::stats::{nanmax, nanmean, percentile};

use profile::{curved_plane, tilted_plane, ProfileParams};

/// Ordered names of the profile parameters, matching the layout every
/// fitter in this crate uses for its parameter vector (profile first,
/// then the background coefficients of the chosen variant).
pub const PROFILE_PARAM_NAMES: [&str; 8] = [
    "xcentroid",
    "ycentroid",
    "stddev",
    "stddev_ratio",
    "amplitude_ratio",
    "theta",
    "ell",
    "amplitude",
];

/// Background coefficient names, longest variant first-N used.
pub const BACKGROUND_PARAM_NAMES: [&str; 6] =
    ["bkgd", "bkgdx", "bkgdy", "bkgdxy", "bkgdxx", "bkgdyy"];

/// Profile model variant: bi-normal blend plus a polynomial background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileModel {
    BiNormalFlat,
    BiNormalTilted,
    BiNormalCurved,
}

impl ProfileModel {
    /// Resolve a model from its name.
    ///
    /// Return
    /// ----------
    /// * `Err(SpextractError::UnknownProfileModel)` for anything outside
    ///   the supported set, naming the supported variants.
    pub fn from_name(name: &str) -> Result<Self, SpextractError> {
        match name {
            "BiNormalFlat" => Ok(Self::BiNormalFlat),
            "BiNormalTilted" => Ok(Self::BiNormalTilted),
            "BiNormalCurved" => Ok(Self::BiNormalCurved),
            other => Err(SpextractError::UnknownProfileModel(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BiNormalFlat => "BiNormalFlat",
            Self::BiNormalTilted => "BiNormalTilted",
            Self::BiNormalCurved => "BiNormalCurved",
        }
    }

    /// Number of background coefficients of this variant.
    pub fn n_background(self) -> usize {
        match self {
            Self::BiNormalFlat => 1,
            Self::BiNormalTilted => 3,
            Self::BiNormalCurved => 6,
        }
    }

    /// Total number of fitted parameters (profile + background).
    pub fn n_params(self) -> usize {
        PROFILE_PARAM_NAMES.len() + self.n_background()
    }

    /// Background flux at `(x, y)` for this variant's coefficients.
    pub fn background(self, x: f64, y: f64, coeffs: &[f64]) -> f64 {
        match self {
            Self::BiNormalFlat => coeffs[0],
            Self::BiNormalTilted => tilted_plane(x, y, coeffs),
            Self::BiNormalCurved => curved_plane(x, y, coeffs),
        }
    }

    /// Profile + background flux at `(x, y)` from a full parameter
    /// vector laid out as [`PROFILE_PARAM_NAMES`] then the background
    /// coefficients.
    pub fn evaluate(self, x: f64, y: f64, params: &[f64]) -> f64 {
        let p = Self::profile_params(params);
        profile::binormal_profile(x, y, &p) + self.background(x, y, &params[8..])
    }

    /// View the profile part of a full parameter vector.
    pub fn profile_params(params: &[f64]) -> ProfileParams {
        ProfileParams {
            xcentroid: params[0],
            ycentroid: params[1],
            stddev: params[2],
            stddev_ratio: params[3],
            amplitude_ratio: params[4],
            theta: params[5],
            ell: params[6],
            amplitude: params[7],
        }
    }

    /// Heuristic initial guesses for one slice of data.
    ///
    /// Arguments
    /// -----------------
    /// * `x`, `y`, `data`: Spaxel coordinates and fluxes (non-finite
    ///   entries are ignored).
    /// * `centroid`: Optional externally supplied centroid guess; when
    ///   absent the centroid of the spaxels brighter than the 95th
    ///   percentile is used.
    /// * `centroid_err`: Half-width of the centroid boundaries.
    ///
    /// Return
    /// ----------
    /// * The full ordered parameter list for this variant, ready for the
    ///   bounded minimizer.
    ///
    /// Notes
    /// ----------
    /// * Amplitude: 5x the brightest spaxel, bounded to two decades on
    ///   each side.
    /// * Background: 10th percentile of the data, bounded to the
    ///   [0.1, 99.9] percentile range; higher-order coefficients start
    ///   at zero, unbounded.
    /// * Shape priors reflect typical instrument seeing.
    pub fn get_guesses(
        self,
        x: &[f64],
        y: &[f64],
        data: &[f64],
        centroid: Option<(f64, f64)>,
        centroid_err: (f64, f64),
    ) -> Result<Vec<Param>, SpextractError> {
        let finite: Vec<usize> = (0..data.len())
            .filter(|&i| x[i].is_finite() && y[i].is_finite() && data[i].is_finite())
            .collect();
        if finite.len() < self.n_params() {
            return Err(SpextractError::InsufficientData {
                needed: self.n_params(),
                got: finite.len(),
            });
        }
        let fdata: Vec<f64> = finite.iter().map(|&i| data[i]).collect();

        let ampl = nanmax(&fdata);
        let (xcentroid, ycentroid) = match centroid {
            Some(c) => c,
            None => {
                let p95 = percentile(&fdata, 95.0);
                let bright: Vec<usize> = finite
                    .iter()
                    .copied()
                    .filter(|&i| data[i] > p95)
                    .collect();
                let xs: Vec<f64> = bright.iter().map(|&i| x[i]).collect();
                let ys: Vec<f64> = bright.iter().map(|&i| y[i]).collect();
                (nanmean(&xs), nanmean(&ys))
            }
        };

        let bkgd = percentile(&fdata, 10.0);
        let bkgd_lo = percentile(&fdata, 0.1);
        let bkgd_hi = percentile(&fdata, 99.9);

        let mut params = vec![
            Param::bounded(
                "xcentroid",
                xcentroid,
                xcentroid - centroid_err.0,
                xcentroid + centroid_err.0,
            ),
            Param::bounded(
                "ycentroid",
                ycentroid,
                ycentroid - centroid_err.1,
                ycentroid + centroid_err.1,
            ),
            Param::bounded("stddev", 1.3, 0.5, 5.0),
            Param::bounded("stddev_ratio", 2.0, 1.1, 4.0),
            Param::bounded("amplitude_ratio", 3.0, 1.5, 5.0),
            Param::bounded("theta", 1.5, 0.0, std::f64::consts::PI),
            Param::bounded("ell", 0.05, 0.0, 0.9),
            if ampl > 0.0 {
                Param::bounded("amplitude", ampl * 5.0, ampl / 100.0, ampl * 100.0)
            } else {
                Param::free("amplitude", 1.0)
            },
        ];

        params.push(if bkgd_hi > bkgd_lo {
            Param::bounded("bkgd", bkgd, bkgd_lo, bkgd_hi)
        } else {
            Param::free("bkgd", bkgd)
        });
        for &name in BACKGROUND_PARAM_NAMES.iter().take(self.n_background()).skip(1) {
            params.push(Param::free(name, 0.0));
        }

        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unknown_model_rejected() {
        let err = ProfileModel::from_name("MoffatPlane2");
        assert!(matches!(
            err,
            Err(SpextractError::UnknownProfileModel(_))
        ));
    }

    #[test]
    fn test_variant_parameter_counts() {
        assert_eq!(ProfileModel::BiNormalFlat.n_params(), 9);
        assert_eq!(ProfileModel::BiNormalTilted.n_params(), 11);
        assert_eq!(ProfileModel::BiNormalCurved.n_params(), 14);
    }

    #[test]
    fn test_guesses_pick_brightest_region() {
        // A bright blob around (2, -1) on a flat floor.
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut data = Vec::new();
        for i in -5..=5 {
            for j in -5..=5 {
                let (xi, yj) = (i as f64, j as f64);
                x.push(xi);
                y.push(yj);
                let r2 = (xi - 2.0).powi(2) + (yj + 1.0).powi(2);
                data.push(1.0 + 50.0 * (-0.5 * r2).exp());
            }
        }
        let guesses = ProfileModel::BiNormalTilted
            .get_guesses(&x, &y, &data, None, (2.0, 2.0))
            .unwrap();

        assert_eq!(guesses.len(), 11);
        assert_relative_eq!(guesses[0].guess, 2.0, epsilon = 0.5);
        assert_relative_eq!(guesses[1].guess, -1.0, epsilon = 0.5);
        // Amplitude guess is 5x the peak.
        assert!(guesses[7].guess > 200.0);
    }

    #[test]
    fn test_supplied_centroid_bounds() {
        let x = vec![0.0; 20];
        let y = vec![0.0; 20];
        let data: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let guesses = ProfileModel::BiNormalFlat
            .get_guesses(&x, &y, &data, Some((1.0, -2.0)), (0.5, 0.5))
            .unwrap();

        assert_relative_eq!(guesses[0].guess, 1.0);
        assert_relative_eq!(guesses[0].lower.unwrap(), 0.5);
        assert_relative_eq!(guesses[0].upper.unwrap(), 1.5);
        assert_relative_eq!(guesses[1].guess, -2.0);
    }
}
