use thiserror::Error;

/// Errors produced by the spextract library.
///
/// Optimizer non-convergence and degenerate fits are deliberately **not**
/// errors: they are reported through validity flags and warnings so that one
/// bad wavelength bin cannot abort a whole extraction. The variants below
/// cover malformed inputs, configuration mistakes and I/O failures, all of
/// which fail fast before any partial work is done.
#[derive(Error, Debug)]
pub enum SpextractError {
    #[error("Unknown profile model '{0}': supported models are BiNormalFlat, BiNormalTilted and BiNormalCurved")]
    UnknownProfileModel(String),

    #[error("centroid guesses and wavelength ranges do not have the same length ({expected} vs. {got})")]
    CentroidGuessMismatch { expected: usize, got: usize },

    #[error("Not enough data points to fit: needed {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Inconsistent input arrays: {0}")]
    InconsistentArrays(String),

    #[error("Invalid calibration parameter: {0}")]
    InvalidCalibrationParameter(String),

    #[error("Calibration stage used out of order: {0}")]
    CalibrationOrder(&'static str),

    #[error("Missing header entry required for the trajectory fit: {0}")]
    MissingHeaderEntry(&'static str),

    #[error("ROOTS finding error: {0}")]
    RootFindingError(#[from] roots::SearchError),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("PSF descriptor (de)serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}
