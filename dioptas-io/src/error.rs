//! I/O error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File I/O error with the offending path.
    #[error("{}: {source}", path.display())]
    FileIo {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// No loader handles this container.
    #[error("unsupported file format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Image encoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON settings error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HDF5 error.
    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] dioptas_core::Error),
}

impl Error {
    /// Wraps a `std::io::Error` with the path it concerns.
    pub fn file<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }
}
