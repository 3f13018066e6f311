//! dioptas-io: files and reduction workflows for dioptas.
//!
//! This crate provides the image loaders (TIFF, EDF, HDF5/NeXus and
//! stitched detector modules), the PONI, calibrant, pattern, mask and
//! settings file formats, the [`Configuration`] record with its sweep
//! scope, and the batch and map engines built on top of it.
//!

pub mod batch;
pub mod calibrant;
pub mod config;
mod error;
pub mod files;
#[cfg(feature = "hdf5")]
pub mod hdf5;
pub mod loader;
pub mod map;
pub mod mask_io;
pub mod pattern_io;
pub mod poni;
pub mod settings;

pub use batch::{BatchModel, FramePolicy, ProcessInfo, StoredBatch};
pub use calibrant::read_calibrant;
pub use config::{Configuration, SweepGuard, SweepScope};
pub use error::{Error, Result};
pub use files::{neighbour_file, next_file, previous_file, sibling_folder_files, FileIteration};
#[cfg(feature = "hdf5")]
pub use self::hdf5::{load_batch, read_batch_hdf5, save_batch, write_batch_hdf5};
pub use loader::{detect_format, load_image, FileLoader, FrameSource, ImageFormat, LoadedImage};
pub use map::{dimension_candidates, Colormap, MapModel};
pub use mask_io::{read_mask, write_mask};
pub use pattern_io::{load_pattern, save_pattern};
pub use poni::{read_poni, write_poni};
pub use settings::IntegrationSettings;
