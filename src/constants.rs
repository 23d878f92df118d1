//! # Constants and type definitions for spextract
//!
//! This module centralizes the **instrument defaults**, **site conditions**, and
//! **common type definitions** used throughout the `spextract` library.
//!
//! ## Overview
//!
//! - Spaxel/arcsecond unit scale of the integral-field unit
//! - Default atmospheric conditions entering the refraction model
//! - Numerical floors protecting the width-trend fit
//! - Core type aliases used across the crate
//!
//! These definitions are used by the profile models, the shape calibration and
//! the forced-photometry engine.

// -------------------------------------------------------------------------------------------------
// Instrument geometry
// -------------------------------------------------------------------------------------------------

/// Angular size, in arcseconds, of one unit of spaxel position.
///
/// Position shifts predicted by the refraction model are expressed in
/// arcseconds and divided by this scale before being compared to fitted
/// spaxel coordinates.
pub const IFU_SCALE_UNIT: f64 = 0.558;

/// Mount-to-sky position-angle offset (degrees).
///
/// Added to the telescope position angle read from the cube header to form
/// the default parallactic-angle guess of the trajectory fit.
pub const MOUNT_PARANGLE_OFFSET: f64 = 263.0;

// -------------------------------------------------------------------------------------------------
// Default site conditions (refraction model)
// -------------------------------------------------------------------------------------------------

/// Reference wavelength of the refraction model, in Angstrom.
pub const DEFAULT_LBDA_REF: f64 = 5000.0;

/// Default atmospheric pressure at the telescope, in mbar.
pub const DEFAULT_PRESSURE_MBAR: f64 = 630.0;

/// Default outside temperature, in Celsius.
pub const DEFAULT_TEMPERATURE_C: f64 = 7.0;

/// Default relative humidity, in percent.
pub const DEFAULT_RELATIVE_HUMIDITY: f64 = 10.0;

// -------------------------------------------------------------------------------------------------
// Numerical guards
// -------------------------------------------------------------------------------------------------

/// Arcseconds per radian (206 264.8...).
pub const ARCSEC_PER_RADIAN: f64 = 648_000.0 / std::f64::consts::PI;

/// Replacement for per-bin width uncertainties reported as exactly zero.
///
/// A zero uncertainty would give one bin infinite weight in the width-trend
/// fit.
pub const WIDTH_ERROR_ZERO_REPLACEMENT: f64 = 0.5;

/// Floor applied to per-bin width uncertainties below this value.
pub const WIDTH_ERROR_FLOOR: f64 = 0.1;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Wavelength in Angstrom
pub type Angstrom = f64;
/// Angle in degrees
pub type Degree = f64;
/// Position expressed in spaxel units
pub type SpaxelUnit = f64;
