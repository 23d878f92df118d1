//! One-dimensional spectra: flux and variance against wavelength.

use serde::{Deserialize, Serialize};

use crate::spextract_errors::SpextractError;

/// A spectrum with propagated variance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spectrum {
    /// Wavelengths, Angstrom.
    pub lbda: Vec<f64>,
    /// Flux at each wavelength.
    pub flux: Vec<f64>,
    /// Variance of the flux at each wavelength.
    pub variance: Vec<f64>,
}

impl Spectrum {
    /// Build a spectrum, validating that all arrays share one length.
    pub fn new(lbda: Vec<f64>, flux: Vec<f64>, variance: Vec<f64>) -> Result<Self, SpextractError> {
        if flux.len() != lbda.len() || variance.len() != lbda.len() {
            return Err(SpextractError::InconsistentArrays(format!(
                "spectrum arrays disagree in length ({} wavelengths, {} fluxes, {} variances)",
                lbda.len(),
                flux.len(),
                variance.len()
            )));
        }
        Ok(Self {
            lbda,
            flux,
            variance,
        })
    }

    pub fn len(&self) -> usize {
        self.lbda.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lbda.is_empty()
    }
}
