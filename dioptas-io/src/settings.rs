//! Integration settings, persisted as JSON.

use crate::{Error, Result};
use dioptas_algorithms::{CakeConfig, IntegrationConfig, IntegrationMethod};
use dioptas_core::units::IntegrationUnit;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// User-facing integration options.
///
/// Missing JSON fields take their default, so older settings files keep
/// loading after new options appear.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    /// Radial unit of 1D patterns.
    pub unit: IntegrationUnit,
    /// Radial bins; derived from the geometry when `None`.
    pub num_points: Option<usize>,
    /// Binning method.
    pub method: IntegrationMethod,
    /// Divide by the relative solid angle.
    pub correct_solid_angle: bool,
    /// Polarisation factor overriding the calibrated one.
    pub polarization_factor: Option<f64>,
    /// Radial bins of the cake; derived from the geometry when `None`.
    pub cake_num_points_rad: Option<usize>,
    /// Azimuthal bins of the cake.
    pub cake_num_points_azi: usize,
    /// Azimuth window of the cake in degrees.
    pub cake_azimuth_range: Option<(f64, f64)>,
    /// Drop empty bins from 1D patterns.
    pub trim_trailing_zeros: bool,
    /// Integrate whenever a new image is loaded.
    pub auto_integrate: bool,
    /// Supersampling factor (1..=4).
    pub supersampling: usize,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            unit: IntegrationUnit::TwoThetaDeg,
            num_points: None,
            method: IntegrationMethod::Csr,
            correct_solid_angle: true,
            polarization_factor: None,
            cake_num_points_rad: None,
            cake_num_points_azi: 360,
            cake_azimuth_range: None,
            trim_trailing_zeros: true,
            auto_integrate: true,
            supersampling: 1,
        }
    }
}

impl IntegrationSettings {
    /// Parses settings from JSON text.
    ///
    /// # Errors
    /// Returns `Json` for malformed input.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialises to pretty-printed JSON.
    ///
    /// # Errors
    /// Returns `Json` if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Loads settings from a JSON file.
    ///
    /// # Errors
    /// `FileIo` if unreadable, `Json` if malformed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
        Self::from_json(&text)
    }

    /// Writes settings to a JSON file.
    ///
    /// # Errors
    /// `FileIo` on write failure.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?).map_err(|e| Error::file(path, e))
    }

    /// The 1D integrator options these settings describe.
    #[must_use]
    pub fn integration_config(&self) -> IntegrationConfig {
        IntegrationConfig {
            unit: self.unit,
            num_points: self.num_points,
            method: self.method,
            correct_solid_angle: self.correct_solid_angle,
            polarization_factor: self.polarization_factor,
            trim_zeros: self.trim_trailing_zeros,
            ..IntegrationConfig::default()
        }
    }

    /// The cake options these settings describe.
    #[must_use]
    pub fn cake_config(&self) -> CakeConfig {
        CakeConfig {
            num_points_rad: self.cake_num_points_rad,
            num_points_azi: self.cake_num_points_azi,
            azimuth_range: self.cake_azimuth_range,
            correct_solid_angle: self.correct_solid_angle,
            ..CakeConfig::default()
        }
    }
}
