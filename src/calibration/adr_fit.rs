//! # Refraction-trajectory fitting
//!
//! Fit the atmospheric-refraction trajectory of a point source through
//! `(wavelength, x, y)` centroid samples: airmass, parallactic angle and
//! the reference position are adjusted so that the predicted drift
//! matches the fitted per-slice centroids.

use crate::adr::Adr;
use crate::fitting::{minimize, Fitted, MinimizeOptions, Param};
use crate::spextract_errors::SpextractError;

/// Trajectory samples plus the frozen site conditions.
#[derive(Debug, Clone)]
pub struct AdrFitter {
    /// Site conditions and reference wavelength; airmass and parallactic
    /// angle act as guesses and are replaced by the fit.
    base: Adr,
    /// Arcseconds per spaxel-position unit.
    unit: f64,
    lbda: Vec<f64>,
    x: Vec<f64>,
    y: Vec<f64>,
    xerr: Vec<f64>,
    yerr: Vec<f64>,
}

/// Fitted trajectory parameters with diagnostics.
#[derive(Debug, Clone)]
pub struct AdrFitResult {
    pub airmass: Fitted,
    pub parangle: Fitted,
    pub xref: Fitted,
    pub yref: Fitted,
    pub chi2: f64,
    pub dof: usize,
    pub converged: bool,
    /// The fitted trajectory model, ready for evaluation.
    pub adr: Adr,
}

impl AdrFitResult {
    pub fn chi2_dof(&self) -> f64 {
        self.chi2 / self.dof as f64
    }
}

/// Guesses and boundaries of the trajectory fit.
#[derive(Debug, Clone)]
pub struct AdrGuesses {
    pub airmass: f64,
    pub airmass_boundaries: (f64, f64),
    pub parangle: f64,
    pub parangle_boundaries: (f64, f64),
    pub xref: f64,
    pub yref: f64,
}

impl AdrFitter {
    /// Build a fitter from trajectory samples.
    ///
    /// Arguments
    /// -----------------
    /// * `base`: Site conditions and reference wavelength of the model.
    /// * `unit`: Arcseconds per spaxel-position unit.
    /// * `lbda`, `x`, `y`: Per-slice wavelength and fitted centroid.
    /// * `xerr`, `yerr`: Centroid uncertainties; non-finite or
    ///   non-positive entries are replaced by unity so one sample cannot
    ///   dominate or be lost.
    ///
    /// Return
    /// ----------
    /// * `Err(SpextractError::InsufficientData)` with fewer than three
    ///   samples (four parameters over two coordinates each).
    pub fn new(
        base: Adr,
        unit: f64,
        lbda: Vec<f64>,
        x: Vec<f64>,
        y: Vec<f64>,
        xerr: Vec<f64>,
        yerr: Vec<f64>,
    ) -> Result<Self, SpextractError> {
        let n = lbda.len();
        if n < 3 {
            return Err(SpextractError::InsufficientData { needed: 3, got: n });
        }
        let sanitize = |errs: Vec<f64>| -> Vec<f64> {
            errs.into_iter()
                .map(|e| if e.is_finite() && e > 0.0 { e } else { 1.0 })
                .collect()
        };
        Ok(Self {
            base,
            unit,
            lbda,
            x,
            y,
            xerr: sanitize(xerr),
            yerr: sanitize(yerr),
        })
    }

    /// Fit airmass, parallactic angle and reference position.
    ///
    /// The objective is the combined position chi-square
    ///
    /// ```text
    /// sum_i (x_model(lbda_i) - x_i)^2 / xerr_i^2
    ///     + (y_model(lbda_i) - y_i)^2 / yerr_i^2
    /// ```
    ///
    /// with `dof = 2 n - 4`. Non-convergence is reported through the
    /// result flag, never as an error.
    pub fn fit(&self, guesses: &AdrGuesses) -> Result<AdrFitResult, SpextractError> {
        let params = [
            Param::bounded(
                "airmass",
                guesses.airmass,
                guesses.airmass_boundaries.0,
                guesses.airmass_boundaries.1,
            ),
            Param::bounded(
                "parangle",
                guesses.parangle,
                guesses.parangle_boundaries.0,
                guesses.parangle_boundaries.1,
            ),
            Param::free("xref", guesses.xref),
            Param::free("yref", guesses.yref),
        ];

        let objective = |p: &[f64]| -> f64 {
            let adr = Adr {
                airmass: p[0],
                parangle: p[1],
                ..self.base
            };
            let mut chi2 = 0.0;
            for i in 0..self.lbda.len() {
                let (xm, ym) = adr.refract(p[2], p[3], self.lbda[i], self.unit);
                chi2 += ((xm - self.x[i]) / self.xerr[i]).powi(2)
                    + ((ym - self.y[i]) / self.yerr[i]).powi(2);
            }
            chi2
        };

        let outcome = minimize(objective, &params, &MinimizeOptions::default())?;
        let fitted = |i: usize| Fitted::new(outcome.values[i], outcome.errors[i]);

        Ok(AdrFitResult {
            airmass: fitted(0),
            parangle: fitted(1),
            xref: fitted(2),
            yref: fitted(3),
            chi2: outcome.chi2,
            dof: 2 * self.lbda.len() - 4,
            converged: outcome.converged,
            adr: Adr {
                airmass: outcome.values[0],
                parangle: outcome.values[1],
                ..self.base
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_recovers_injected_trajectory() {
        let truth = Adr {
            airmass: 1.4,
            parangle: 120.0,
            ..Default::default()
        };
        let unit = 0.558;
        let lbda: Vec<f64> = (0..8).map(|i| 3800.0 + 600.0 * i as f64).collect();
        let (xref, yref) = (2.0, -1.0);
        let (x, y): (Vec<f64>, Vec<f64>) = lbda
            .iter()
            .map(|&l| truth.refract(xref, yref, l, unit))
            .unzip();
        let errs = vec![0.02; lbda.len()];

        let fitter = AdrFitter::new(truth, unit, lbda, x, y, errs.clone(), errs).unwrap();
        let result = fitter
            .fit(&AdrGuesses {
                airmass: 1.2,
                airmass_boundaries: (1.0, 1.8),
                parangle: 100.0,
                parangle_boundaries: (0.0, 360.0),
                xref: 1.5,
                yref: -0.5,
            })
            .unwrap();

        assert!(result.converged);
        assert!(result.chi2_dof() < 1.0);
        assert_relative_eq!(result.airmass.value, 1.4, epsilon = 0.05);
        assert_relative_eq!(result.xref.value, 2.0, epsilon = 0.01);
        assert_relative_eq!(result.yref.value, -1.0, epsilon = 0.01);
    }

    #[test]
    fn test_too_few_samples_rejected() {
        let err = AdrFitter::new(
            Adr::default(),
            1.0,
            vec![4000.0, 5000.0],
            vec![0.0, 0.0],
            vec![0.0, 0.0],
            vec![1.0, 1.0],
            vec![1.0, 1.0],
        );
        assert!(matches!(
            err,
            Err(SpextractError::InsufficientData { .. })
        ));
    }
}
