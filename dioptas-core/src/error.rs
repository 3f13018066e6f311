//! Error types for dioptas-core.

use thiserror::Error;

/// Result type alias for dioptas operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for dioptas operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// An integration or correction was requested without a valid PONI set.
    #[error("geometry is not calibrated")]
    NotCalibrated,

    /// Array shapes disagree (rows, columns).
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// A unit conversion left its physical domain (arcsin out of range, d <= 0).
    #[error("unit conversion out of domain: {0}")]
    UnitDomain(String),

    /// An unknown unit tag was given.
    #[error("unknown unit: {0} (expected one of 2th_deg, q_A^-1, d_A)")]
    UnknownUnit(String),

    /// Least-squares refinement failed to converge or lacked points.
    #[error("calibration refinement failed: {0}")]
    RefinementFailed(String),

    /// A parameter was outside its admissible range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Every pixel of the image is masked and nothing is cached.
    #[error("the whole image is masked")]
    FullyMasked,

    /// A pattern operation needs at least one point.
    #[error("pattern is empty")]
    EmptyPattern,
}

impl Error {
    /// Convenience constructor for shape mismatches from ndarray dims.
    #[must_use]
    pub fn shape_mismatch(expected: (usize, usize), found: (usize, usize)) -> Self {
        Self::ShapeMismatch { expected, found }
    }
}
