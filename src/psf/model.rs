//! # Wavelength-parametrized PSF model
//!
//! The frozen output of a completed shape calibration: the refraction
//! trajectory, the reference position, the width trend and the constant
//! shape parameters, packed into a single read-only object that evaluates
//! the normalized point-spread function at any `(x, y, wavelength)`.
//!
//! The model serializes to a self-contained JSON descriptor with two
//! sections, `adr` (trajectory parameters plus reference position and
//! unit) and `profile` (constant shape parameters plus width trend), and
//! reconstructs from it bit-for-bit.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::adr::Adr;
use crate::constants::Angstrom;
use crate::psf::profile::{binormal_profile, ProfileParams};
use crate::spextract_errors::SpextractError;

/// Shape parameters treated as wavelength independent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstantShape {
    pub stddev_ratio: f64,
    pub amplitude_ratio: f64,
    pub theta: f64,
    pub ell: f64,
}

/// Power-law trend of the profile width against wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WidthTrend {
    /// Width at the reference wavelength, spaxel units.
    pub stddev_ref: f64,
    /// Power-law exponent (negative: narrower toward the red).
    pub rho: f64,
}

impl WidthTrend {
    /// Width at `lbda` for the reference wavelength `lbdaref`.
    #[inline]
    pub fn stddev(&self, lbda: Angstrom, lbdaref: Angstrom) -> f64 {
        self.stddev_ref * (lbda / lbdaref).powf(self.rho)
    }
}

/// Uncertainties and reference angles kept for provenance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdrDiagnostics {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub airmass_err: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parangle_err: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub xref_err: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub yref_err: Option<f64>,
    /// Telescope position angle read from the cube header.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parangle_ref: Option<f64>,
}

/// Complete, immutable PSF descriptor: position and shape of the point
/// source at every wavelength, with the overall amplitude left free for
/// forced photometry.
#[derive(Debug, Clone, PartialEq)]
pub struct PsfModel {
    adr: Adr,
    xref: f64,
    yref: f64,
    unit: f64,
    shape: ConstantShape,
    width: WidthTrend,
    profile_name: String,
    diagnostics: AdrDiagnostics,
}

impl PsfModel {
    /// Assemble a model from calibration products.
    pub fn new(
        adr: Adr,
        xref: f64,
        yref: f64,
        unit: f64,
        shape: ConstantShape,
        width: WidthTrend,
        profile_name: impl Into<String>,
        diagnostics: AdrDiagnostics,
    ) -> Self {
        Self {
            adr,
            xref,
            yref,
            unit,
            shape,
            width,
            profile_name: profile_name.into(),
            diagnostics,
        }
    }

    pub fn adr(&self) -> &Adr {
        &self.adr
    }

    /// Reference position `(x, y)` at the reference wavelength.
    pub fn refposition(&self) -> (f64, f64) {
        (self.xref, self.yref)
    }

    pub fn unit(&self) -> f64 {
        self.unit
    }

    pub fn shape(&self) -> &ConstantShape {
        &self.shape
    }

    pub fn width(&self) -> &WidthTrend {
        &self.width
    }

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Apparent source position at `lbda`.
    pub fn position(&self, lbda: Angstrom) -> (f64, f64) {
        self.adr.refract(self.xref, self.yref, lbda, self.unit)
    }

    /// Profile width at `lbda`.
    pub fn stddev(&self, lbda: Angstrom) -> f64 {
        self.width.stddev(lbda, self.adr.lbdaref)
    }

    /// Full profile parameter set at `lbda`, with unit amplitude.
    pub fn profile_params(&self, lbda: Angstrom) -> ProfileParams {
        let (xcentroid, ycentroid) = self.position(lbda);
        ProfileParams {
            xcentroid,
            ycentroid,
            stddev: self.stddev(lbda),
            stddev_ratio: self.shape.stddev_ratio,
            amplitude_ratio: self.shape.amplitude_ratio,
            theta: self.shape.theta,
            ell: self.shape.ell,
            amplitude: 1.0,
        }
    }

    /// Normalized PSF flux at `(x, y, lbda)`.
    pub fn psf(&self, x: f64, y: f64, lbda: Angstrom) -> f64 {
        binormal_profile(x, y, &self.profile_params(lbda))
    }

    // --------- //
    //  I/O      //
    // --------- //

    /// Convert to the serializable descriptor.
    pub fn to_descriptor(&self) -> PsfDescriptor {
        PsfDescriptor {
            adr: AdrSection {
                lbdaref: self.adr.lbdaref,
                airmass: self.adr.airmass,
                parangle: self.adr.parangle,
                pressure: self.adr.pressure,
                temperature: self.adr.temperature,
                relathumidity: self.adr.relathumidity,
                xref: self.xref,
                yref: self.yref,
                unit: self.unit,
                diagnostics: self.diagnostics,
            },
            profile: ProfileSection {
                name: self.profile_name.clone(),
                stddev_ref: self.width.stddev_ref,
                stddev_rho: self.width.rho,
                stddev_ratio: self.shape.stddev_ratio,
                amplitude_ratio: self.shape.amplitude_ratio,
                theta: self.shape.theta,
                ell: self.shape.ell,
            },
        }
    }

    /// Rebuild a model from a descriptor.
    pub fn from_descriptor(d: &PsfDescriptor) -> Self {
        Self {
            adr: Adr {
                lbdaref: d.adr.lbdaref,
                airmass: d.adr.airmass,
                parangle: d.adr.parangle,
                pressure: d.adr.pressure,
                temperature: d.adr.temperature,
                relathumidity: d.adr.relathumidity,
            },
            xref: d.adr.xref,
            yref: d.adr.yref,
            unit: d.adr.unit,
            shape: ConstantShape {
                stddev_ratio: d.profile.stddev_ratio,
                amplitude_ratio: d.profile.amplitude_ratio,
                theta: d.profile.theta,
                ell: d.profile.ell,
            },
            width: WidthTrend {
                stddev_ref: d.profile.stddev_ref,
                rho: d.profile.stddev_rho,
            },
            profile_name: d.profile.name.clone(),
            diagnostics: d.adr.diagnostics,
        }
    }

    /// Write the descriptor as a JSON document.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), SpextractError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.to_descriptor())?;
        Ok(())
    }

    /// Load a model from a JSON descriptor document.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, SpextractError> {
        let file = File::open(path)?;
        let descriptor: PsfDescriptor = serde_json::from_reader(BufReader::new(file))?;
        Ok(Self::from_descriptor(&descriptor))
    }
}

/// Serialized form of a [`PsfModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfDescriptor {
    pub adr: AdrSection,
    pub profile: ProfileSection,
}

/// Trajectory section of the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdrSection {
    pub lbdaref: f64,
    pub airmass: f64,
    pub parangle: f64,
    pub pressure: f64,
    pub temperature: f64,
    pub relathumidity: f64,
    pub xref: f64,
    pub yref: f64,
    pub unit: f64,
    #[serde(flatten)]
    pub diagnostics: AdrDiagnostics,
}

/// Shape section of the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSection {
    pub name: String,
    pub stddev_ref: f64,
    pub stddev_rho: f64,
    pub stddev_ratio: f64,
    pub amplitude_ratio: f64,
    pub theta: f64,
    pub ell: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> PsfModel {
        PsfModel::new(
            Adr {
                airmass: 1.25,
                parangle: 40.0,
                ..Default::default()
            },
            1.2,
            -0.8,
            crate::constants::IFU_SCALE_UNIT,
            ConstantShape {
                stddev_ratio: 2.0,
                amplitude_ratio: 3.0,
                theta: 1.5,
                ell: 0.05,
            },
            WidthTrend {
                stddev_ref: 1.3,
                rho: -0.2,
            },
            "BiNormalTilted",
            AdrDiagnostics {
                airmass_err: Some(0.01),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_descriptor_round_trip_preserves_evaluation() {
        let psf = model();
        let rebuilt = PsfModel::from_descriptor(&psf.to_descriptor());
        assert_eq!(psf, rebuilt);

        for &(x, y, l) in &[(0.0, 0.0, 4000.0), (1.5, -1.0, 5000.0), (-2.0, 3.0, 7500.0)] {
            assert_relative_eq!(psf.psf(x, y, l), rebuilt.psf(x, y, l));
        }
    }

    #[test]
    fn test_json_round_trip() {
        let psf = model();
        let text = serde_json::to_string(&psf.to_descriptor()).unwrap();
        let descriptor: PsfDescriptor = serde_json::from_str(&text).unwrap();
        let rebuilt = PsfModel::from_descriptor(&descriptor);
        assert_relative_eq!(psf.psf(0.7, 0.3, 6000.0), rebuilt.psf(0.7, 0.3, 6000.0));
    }

    #[test]
    fn test_width_trend_follows_power_law() {
        let psf = model();
        let at_ref = psf.stddev(psf.adr().lbdaref);
        assert_relative_eq!(at_ref, 1.3, epsilon = 1e-12);
        // rho < 0: narrower toward the red.
        assert!(psf.stddev(8000.0) < at_ref);
        assert!(psf.stddev(3500.0) > at_ref);
    }

    #[test]
    fn test_position_drifts_with_wavelength() {
        let psf = model();
        let (x_ref, y_ref) = psf.position(psf.adr().lbdaref);
        assert_relative_eq!(x_ref, 1.2, epsilon = 1e-12);
        assert_relative_eq!(y_ref, -0.8, epsilon = 1e-12);
        let (x_blue, y_blue) = psf.position(3800.0);
        assert!((x_blue - x_ref).abs() + (y_blue - y_ref).abs() > 1e-3);
    }
}
