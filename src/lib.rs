pub mod adr;
pub mod calibration;
pub mod constants;
pub mod cube;
pub mod fitting;
pub mod force_photometry;
pub mod psf;
pub mod spectrum;
pub mod spextract_errors;
pub mod stats;

pub use adr::Adr;
pub use calibration::{fit_psf_parameters, fit_slice, CalibrationParams, PsfCalibrator};
pub use cube::{Cube, CubeHeader, Slice};
pub use fitting::Fitted;
pub use force_photometry::{
    fit_force_spectroscopy, ForcePsfResult, ForcedFitOptions, ForcedFitRecord,
};
pub use psf::model::{PsfDescriptor, PsfModel, WidthTrend};
pub use psf::ProfileModel;
pub use spectrum::Spectrum;
pub use spextract_errors::SpextractError;
