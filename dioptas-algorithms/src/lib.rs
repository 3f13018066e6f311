//! dioptas-algorithms: reduction algorithms for diffraction images.
//!
//! This crate provides:
//! - **Integrator** - azimuthal integration to 1D patterns (CSR or histogram)
//! - **Cake** - polar rebinning into azimuth x 2θ images
//! - **Peaks** - single and automatic peak search for ring points
//! - **Refinement** - Levenberg-Marquardt refinement of the PONI geometry
//!
#![warn(missing_docs)]

mod cake;
mod integrator;
pub mod peaks;
mod refinement;

pub use cake::{Cake, CakeConfig};
pub use integrator::{
    default_num_points, IntegratedPattern, IntegrationConfig, IntegrationMethod, Integrator,
    DEFAULT_POINTS_FACTOR,
};
pub use peaks::{find_peak, find_peaks_automatic, AutoPeakSearch};
pub use refinement::{
    initial_guess, refine, refine_calibration, RefinementConfig, RefinementReport,
    RefinementStart,
};
