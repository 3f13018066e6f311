//! dioptas-core: data model for X-ray diffraction image reduction.
//!
//! This crate provides unit conversions, the detector geometry (PONI set),
//! image frames with their orientation log, correction fields, the pixel
//! mask and the 1D pattern model.
//!

pub mod background;
pub mod calibrant;
pub mod calibration;
pub mod corrections;
pub mod cosmic;
pub mod error;
pub mod image;
pub mod mask;
pub mod pattern;
pub mod units;

pub use background::{extract_background, smooth_bruckner, BackgroundParameters};
pub use calibrant::Calibrant;
pub use calibration::{
    Calibration, Fit2dParameters, Geometry, PixelArrays, PoniParameters, RingPoints,
};
pub use corrections::{CbnParameters, Correction, CorrectionManager, OiadacParameters};
pub use cosmic::CosmicParameters;
pub use error::{Error, Result};
pub use image::{FrameId, ImageFrame, Orientation};
pub use mask::{Mask, MaskMode, Roi};
pub use pattern::Pattern;
pub use units::IntegrationUnit;
