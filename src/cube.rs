//! # Cube and slice containers
//!
//! This module defines the in-memory representation of a wavelength
//! calibrated observation cube and of its 2D wavelength slices.
//!
//! ## Overview
//!
//! A [`Cube`] stores one flux (and optionally variance) value per
//! `(wavelength bin, spaxel)` pair, together with the spaxel coordinate
//! lookup and the header metadata consumed by the trajectory fit. A
//! [`Slice`] is the 2D cross-section of a cube over a wavelength
//! sub-range, the unit of work of the per-slice fitters.
//!
//! Neither container is mutated after construction: every fit stage reads
//! them concurrently and produces new result records.

use serde::{Deserialize, Serialize};

use crate::spextract_errors::SpextractError;

/// Header metadata attached to a cube.
///
/// Every entry is optional; stages requiring an entry fail with
/// [`SpextractError::MissingHeaderEntry`] when it is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CubeHeader {
    /// Airmass of the observation.
    pub airmass: Option<f64>,
    /// Parallactic angle, degrees.
    pub parallactic_angle: Option<f64>,
    /// Telescope position angle, degrees.
    pub telescope_pa: Option<f64>,
    /// Atmospheric pressure, mbar.
    pub pressure_mbar: Option<f64>,
    /// Outside temperature, Celsius.
    pub temperature_c: Option<f64>,
    /// Relative humidity, percent.
    pub relative_humidity: Option<f64>,
}

/// A 3D observation cube: two spatial axes resampled on a common spaxel
/// grid plus one wavelength axis.
///
/// Data are stored row-major as `data[bin * n_spaxels + spaxel]`.
#[derive(Debug, Clone)]
pub struct Cube {
    lbda: Vec<f64>,
    x: Vec<f64>,
    y: Vec<f64>,
    data: Vec<f64>,
    variance: Option<Vec<f64>>,
    header: CubeHeader,
}

impl Cube {
    /// Build a cube from its wavelength grid, spaxel coordinates and
    /// row-major data array.
    ///
    /// Arguments
    /// -----------------
    /// * `lbda`: Wavelength of each bin (Angstrom), one entry per bin.
    /// * `x`, `y`: Spaxel coordinates, one entry per spaxel.
    /// * `data`: Flux values, `lbda.len() * x.len()` entries, bin-major.
    /// * `variance`: Optional variance array of identical shape.
    /// * `header`: Observation metadata.
    ///
    /// Return
    /// ----------
    /// * `Err(SpextractError::InconsistentArrays)` on any shape mismatch, with
    ///   no partial cube constructed.
    pub fn new(
        lbda: Vec<f64>,
        x: Vec<f64>,
        y: Vec<f64>,
        data: Vec<f64>,
        variance: Option<Vec<f64>>,
        header: CubeHeader,
    ) -> Result<Self, SpextractError> {
        if x.len() != y.len() {
            return Err(SpextractError::InconsistentArrays(format!(
                "x and y have different lengths ({} vs. {})",
                x.len(),
                y.len()
            )));
        }
        let expected = lbda.len() * x.len();
        if data.len() != expected {
            return Err(SpextractError::InconsistentArrays(format!(
                "data has {} entries, expected {} ({} bins x {} spaxels)",
                data.len(),
                expected,
                lbda.len(),
                x.len()
            )));
        }
        if let Some(var) = &variance {
            if var.len() != expected {
                return Err(SpextractError::InconsistentArrays(format!(
                    "variance has {} entries, expected {}",
                    var.len(),
                    expected
                )));
            }
        }
        Ok(Self {
            lbda,
            x,
            y,
            data,
            variance,
            header,
        })
    }

    pub fn n_bins(&self) -> usize {
        self.lbda.len()
    }

    pub fn n_spaxels(&self) -> usize {
        self.x.len()
    }

    pub fn lbda(&self) -> &[f64] {
        &self.lbda
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn header(&self) -> &CubeHeader {
        &self.header
    }

    /// Flux values of one wavelength bin.
    pub fn bin_data(&self, bin: usize) -> &[f64] {
        let n = self.n_spaxels();
        &self.data[bin * n..(bin + 1) * n]
    }

    /// Variance values of one wavelength bin, when present.
    pub fn bin_variance(&self, bin: usize) -> Option<&[f64]> {
        let n = self.n_spaxels();
        self.variance.as_ref().map(|v| &v[bin * n..(bin + 1) * n])
    }

    /// Average the bins whose wavelength falls in `[lbda_min, lbda_max)`
    /// into a single [`Slice`].
    ///
    /// The slice flux is the per-spaxel mean over the selected bins and the
    /// variance is propagated accordingly (`sum(var) / n^2`). The slice
    /// wavelength is the mid-point of the requested range.
    ///
    /// Return
    /// ----------
    /// * `Err(SpextractError::InsufficientData)` when no bin falls in the
    ///   requested range.
    pub fn get_slice(&self, lbda_min: f64, lbda_max: f64) -> Result<Slice, SpextractError> {
        let bins: Vec<usize> = self
            .lbda
            .iter()
            .enumerate()
            .filter(|(_, l)| **l >= lbda_min && **l < lbda_max)
            .map(|(i, _)| i)
            .collect();
        if bins.is_empty() {
            return Err(SpextractError::InsufficientData { needed: 1, got: 0 });
        }

        let n = self.n_spaxels();
        let nb = bins.len() as f64;
        let mut data = vec![0.0; n];
        for &b in &bins {
            for (d, v) in data.iter_mut().zip(self.bin_data(b)) {
                *d += v / nb;
            }
        }
        let variance = self.variance.as_ref().map(|_| {
            let mut var = vec![0.0; n];
            for &b in &bins {
                let bv = self.bin_variance(b).expect("variance present");
                for (s, v) in var.iter_mut().zip(bv) {
                    *s += v / (nb * nb);
                }
            }
            var
        });

        Ok(Slice {
            lbda: 0.5 * (lbda_min + lbda_max),
            x: self.x.clone(),
            y: self.y.clone(),
            data,
            variance,
        })
    }
}

/// One 2D wavelength slice of a cube.
#[derive(Debug, Clone)]
pub struct Slice {
    /// Representative wavelength of the slice (Angstrom).
    pub lbda: f64,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub data: Vec<f64>,
    pub variance: Option<Vec<f64>>,
}

impl Slice {
    pub fn n_spaxels(&self) -> usize {
        self.data.len()
    }

    /// Spaxel indexes lying inside a polygon given by its vertices.
    ///
    /// Uses even-odd ray casting; the polygon is closed implicitly
    /// (last vertex connects back to the first). Handy to restrict a fit
    /// to the neighbourhood of a source.
    pub fn indexes_within_polygon(&self, vertices: &[(f64, f64)]) -> Vec<usize> {
        (0..self.n_spaxels())
            .filter(|&i| point_in_polygon(self.x[i], self.y[i], vertices))
            .collect()
    }
}

/// Even-odd ray-casting point-in-polygon test.
fn point_in_polygon(px: f64, py: f64, vertices: &[(f64, f64)]) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = vertices[i];
        let (xj, yj) = vertices[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square_cube() -> Cube {
        // 2 bins, 4 spaxels on a unit square.
        Cube::new(
            vec![4000.0, 5000.0],
            vec![0.0, 1.0, 0.0, 1.0],
            vec![0.0, 0.0, 1.0, 1.0],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            Some(vec![1.0; 8]),
            CubeHeader::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let err = Cube::new(
            vec![4000.0],
            vec![0.0, 1.0],
            vec![0.0],
            vec![1.0, 2.0],
            None,
            CubeHeader::default(),
        );
        assert!(err.is_err());

        let err = Cube::new(
            vec![4000.0],
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            vec![1.0],
            None,
            CubeHeader::default(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_get_slice_averages_bins() {
        let cube = square_cube();
        let slice = cube.get_slice(3500.0, 5500.0).unwrap();

        assert_relative_eq!(slice.lbda, 4500.0);
        // Mean of the two bins per spaxel.
        assert_relative_eq!(slice.data[0], 3.0);
        assert_relative_eq!(slice.data[3], 6.0);
        // Variance of a 2-bin mean: (1 + 1) / 4.
        assert_relative_eq!(slice.variance.as_ref().unwrap()[0], 0.5);
    }

    #[test]
    fn test_get_slice_empty_range_fails() {
        let cube = square_cube();
        assert!(cube.get_slice(9000.0, 9100.0).is_err());
    }

    #[test]
    fn test_polygon_selection() {
        let cube = square_cube();
        let slice = cube.get_slice(3500.0, 4500.0).unwrap();
        // Triangle strictly containing only the origin spaxel.
        let inside = slice.indexes_within_polygon(&[(-0.6, -0.6), (0.7, -0.6), (-0.6, 0.7)]);
        assert_eq!(inside, vec![0]);
    }
}
