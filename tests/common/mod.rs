//! Shared synthetic-cube builders for the integration tests.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use spextract::cube::{Cube, CubeHeader};
use spextract::psf::profile::{binormal_profile, ProfileParams};

/// Injected point source: profile shape plus flat background.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticSource {
    pub flux: f64,
    pub background: f64,
    pub stddev: f64,
    pub stddev_ratio: f64,
    pub amplitude_ratio: f64,
    pub theta: f64,
    pub ell: f64,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self {
            flux: 100.0,
            background: 5.0,
            stddev: 1.3,
            stddev_ratio: 2.0,
            amplitude_ratio: 3.0,
            theta: 1.5,
            ell: 0.05,
        }
    }
}

/// Route crate warnings through the test harness.
#[allow(dead_code)]
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Square spaxel grid spanning `[-half, half]` on both axes.
pub fn grid_coords(half: i32) -> (Vec<f64>, Vec<f64>) {
    let mut x = Vec::new();
    let mut y = Vec::new();
    for i in -half..=half {
        for j in -half..=half {
            x.push(i as f64);
            y.push(j as f64);
        }
    }
    (x, y)
}

/// Build a cube with the source injected at a per-bin position and
/// Gaussian noise at the requested peak signal-to-noise ratio.
pub fn make_cube(
    lbdas: &[f64],
    positions: &[(f64, f64)],
    source: &SyntheticSource,
    snr: f64,
    header: CubeHeader,
    seed: u64,
) -> Cube {
    assert_eq!(lbdas.len(), positions.len());
    let mut rng = StdRng::seed_from_u64(seed);
    let (x, y) = grid_coords(8);
    let n = x.len();

    let mut data = Vec::with_capacity(lbdas.len() * n);
    let mut variance = Vec::with_capacity(lbdas.len() * n);
    for (_, &(x0, y0)) in lbdas.iter().zip(positions) {
        let params = ProfileParams {
            xcentroid: x0,
            ycentroid: y0,
            stddev: source.stddev,
            stddev_ratio: source.stddev_ratio,
            amplitude_ratio: source.amplitude_ratio,
            theta: source.theta,
            ell: source.ell,
            amplitude: source.flux,
        };
        let peak = binormal_profile(x0, y0, &params);
        let sigma = peak / snr;
        let noise = Normal::new(0.0, sigma).unwrap();
        for i in 0..n {
            let flux = binormal_profile(x[i], y[i], &params) + source.background;
            data.push(flux + noise.sample(&mut rng));
            variance.push(sigma * sigma);
        }
    }

    Cube::new(lbdas.to_vec(), x, y, data, Some(variance), header).unwrap()
}

/// Header with the entries the trajectory fit needs.
pub fn header_with_pointing(airmass: f64) -> CubeHeader {
    CubeHeader {
        airmass: Some(airmass),
        telescope_pa: Some(20.0),
        ..Default::default()
    }
}

/// Contiguous wavelength ranges, one per native bin of `lbdas`.
pub fn ranges_per_bin(lbdas: &[f64], half_width: f64) -> Vec<(f64, f64)> {
    lbdas
        .iter()
        .map(|&l| (l - half_width, l + half_width))
        .collect()
}
