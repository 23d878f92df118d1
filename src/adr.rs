//! # Atmospheric differential refraction
//!
//! Wavelength-dependent apparent position shift of a source observed
//! through the atmosphere. Blue light refracts more than red light, so a
//! point source drifts along the parallactic direction as wavelength
//! changes; the drift amplitude grows with airmass.
//!
//! ## Model
//!
//! The refractive index of air follows the Filippenko (1982) formulation:
//! the standard-conditions index is corrected for the site pressure and
//! temperature and for the water-vapour partial pressure derived from the
//! relative humidity. The angular shift at wavelength `lbda` relative to
//! the reference wavelength `lbdaref` is
//!
//! ```text
//! dz(lbda) = 206265 * (n(lbda) - n(lbdaref)) * tan(z)      [arcsec]
//! ```
//!
//! with `tan(z) = sqrt(airmass^2 - 1)`. The shift is projected on the
//! spaxel grid along the parallactic angle.
//!
//! An [`Adr`] is a pure function of wavelength once its parameters are
//! set; the calibration freezes one instance inside the final PSF model.

use serde::{Deserialize, Serialize};

use crate::constants::{
    Angstrom, Degree, SpaxelUnit, ARCSEC_PER_RADIAN, DEFAULT_LBDA_REF, DEFAULT_PRESSURE_MBAR,
    DEFAULT_RELATIVE_HUMIDITY, DEFAULT_TEMPERATURE_C,
};

/// Atmospheric differential refraction model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adr {
    /// Reference wavelength (Angstrom); the shift is zero there.
    pub lbdaref: Angstrom,
    /// Airmass of the observation (`>= 1`).
    pub airmass: f64,
    /// Parallactic angle, degrees.
    pub parangle: Degree,
    /// Atmospheric pressure, mbar.
    pub pressure: f64,
    /// Outside temperature, Celsius.
    pub temperature: f64,
    /// Relative humidity, percent.
    pub relathumidity: f64,
}

impl Default for Adr {
    fn default() -> Self {
        Self {
            lbdaref: DEFAULT_LBDA_REF,
            airmass: 1.0,
            parangle: 0.0,
            pressure: DEFAULT_PRESSURE_MBAR,
            temperature: DEFAULT_TEMPERATURE_C,
            relathumidity: DEFAULT_RELATIVE_HUMIDITY,
        }
    }
}

impl Adr {
    /// Refractive index of air at `lbda` for the model's site conditions.
    ///
    /// Filippenko (1982): standard-conditions dispersion corrected for
    /// pressure, temperature and water vapour.
    pub fn refractive_index(&self, lbda: Angstrom) -> f64 {
        // Inverse squared wavelength in inverse squared microns.
        let iml2 = (1.0e4 / lbda).powi(2);

        // (n - 1) * 1e6 at 15 C and 760 mmHg.
        let mut n6 = 64.328 + 29_498.1 / (146.0 - iml2) + 255.4 / (41.0 - iml2);

        // Pressure and temperature correction.
        let p_mmhg = self.pressure * 0.750_061_68;
        let t = self.temperature;
        n6 *= p_mmhg * (1.0 + (1.049 - 0.0157 * t) * 1.0e-6 * p_mmhg)
            / (720.883 * (1.0 + 0.003_661 * t));

        // Water vapour correction; saturation pressure from the Magnus
        // formula, converted to mmHg.
        let psat_mmhg = 6.11 * 10f64.powf(7.5 * t / (237.3 + t)) * 0.750_061_68;
        let f = self.relathumidity / 100.0 * psat_mmhg;
        n6 -= (0.0624 - 0.000_680 * iml2) / (1.0 + 0.003_661 * t) * f;

        1.0 + n6 * 1.0e-6
    }

    /// Angular shift at `lbda` relative to the reference wavelength,
    /// in arcseconds. Positive toward the zenith for `lbda < lbdaref`.
    pub fn refraction_offset(&self, lbda: Angstrom) -> f64 {
        let tan_z = (self.airmass * self.airmass - 1.0).max(0.0).sqrt();
        (self.refractive_index(lbda) - self.refractive_index(self.lbdaref))
            * ARCSEC_PER_RADIAN
            * tan_z
    }

    /// Apparent position at `lbda` of a source located at
    /// `(xref, yref)` at the reference wavelength.
    ///
    /// Arguments
    /// -----------------
    /// * `xref`, `yref`: Position at `lbdaref`, in spaxel units.
    /// * `lbda`: Wavelength of interest (Angstrom).
    /// * `unit`: Arcseconds per spaxel-position unit.
    ///
    /// Return
    /// ----------
    /// * `(x, y)` position at `lbda`, in spaxel units.
    pub fn refract(
        &self,
        xref: SpaxelUnit,
        yref: SpaxelUnit,
        lbda: Angstrom,
        unit: f64,
    ) -> (SpaxelUnit, SpaxelUnit) {
        let shift = self.refraction_offset(lbda) / unit;
        let pa = self.parangle.to_radians();
        (xref + shift * pa.sin(), yref - shift * pa.cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_index_decreases_with_wavelength() {
        let adr = Adr::default();
        let n_blue = adr.refractive_index(4000.0);
        let n_red = adr.refractive_index(8000.0);
        assert!(n_blue > n_red);
        // Both stay close to unity.
        assert!((n_blue - 1.0) < 5e-4);
        assert!((n_red - 1.0) > 0.0);
    }

    #[test]
    fn test_offset_vanishes_at_reference() {
        let adr = Adr {
            airmass: 1.3,
            ..Default::default()
        };
        assert_relative_eq!(adr.refraction_offset(adr.lbdaref), 0.0);
    }

    #[test]
    fn test_offset_grows_with_airmass() {
        let low = Adr {
            airmass: 1.1,
            ..Default::default()
        };
        let high = Adr {
            airmass: 2.0,
            ..Default::default()
        };
        let l = low.refraction_offset(4000.0).abs();
        let h = high.refraction_offset(4000.0).abs();
        assert!(h > l);
    }

    #[test]
    fn test_refract_at_zenith_is_identity() {
        let adr = Adr {
            airmass: 1.0,
            ..Default::default()
        };
        let (x, y) = adr.refract(1.5, -2.0, 4000.0, 1.0);
        assert_relative_eq!(x, 1.5);
        assert_relative_eq!(y, -2.0);
    }

    #[test]
    fn test_refract_moves_along_parallactic_direction() {
        let adr = Adr {
            airmass: 1.5,
            parangle: 90.0,
            ..Default::default()
        };
        // With the parallactic angle at 90 degrees the drift is pure x.
        let (x, y) = adr.refract(0.0, 0.0, 4000.0, 1.0);
        assert!(x.abs() > 1e-3);
        assert_relative_eq!(y, 0.0, epsilon = 1e-12);
    }
}
