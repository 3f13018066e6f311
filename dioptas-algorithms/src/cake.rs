//! Polar rebinning of a detector image into a (azimuth, 2θ) "cake".
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use crate::integrator::{default_num_points, prepare, valid_tth_range, Integrator};
use dioptas_core::calibration::Calibration;
use dioptas_core::error::{Error, Result};
use dioptas_core::units::{convert_axis, IntegrationUnit};
use ndarray::{Array2, ArrayView2, Zip};

/// Options of a cake integration.
#[derive(Clone, Debug, PartialEq)]
pub struct CakeConfig {
    /// Radial bins; derived from the geometry when `None`.
    pub num_points_rad: Option<usize>,
    /// Azimuthal bins.
    pub num_points_azi: usize,
    /// Azimuth window in degrees; may wrap through 180/360. Full circle when `None`.
    pub azimuth_range: Option<(f64, f64)>,
    /// Divide by the relative solid angle.
    pub correct_solid_angle: bool,
    /// Apply the calibrated polarisation correction.
    pub correct_polarization: bool,
}

impl Default for CakeConfig {
    fn default() -> Self {
        Self {
            num_points_rad: None,
            num_points_azi: 360,
            azimuth_range: None,
            correct_solid_angle: true,
            correct_polarization: true,
        }
    }
}

impl CakeConfig {
    /// Sets the radial bin count.
    #[must_use]
    pub fn with_num_points_rad(mut self, n: usize) -> Self {
        self.num_points_rad = Some(n);
        self
    }

    /// Sets the azimuthal bin count.
    #[must_use]
    pub fn with_num_points_azi(mut self, n: usize) -> Self {
        self.num_points_azi = n;
        self
    }

    /// Restricts the azimuth window (degrees).
    #[must_use]
    pub fn with_azimuth_range(mut self, start: f64, end: f64) -> Self {
        self.azimuth_range = Some((start, end));
        self
    }
}

/// A cake image with its axes.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Cake {
    /// Mean intensity, shape (azimuth bins, radial bins). Empty cells are 0.
    pub image: Array2<f64>,
    /// Radial bin centres, degrees 2θ.
    pub tth: Vec<f64>,
    /// Azimuth bin centres, degrees, increasing.
    pub azi: Vec<f64>,
    /// Wavelength the axes were computed with.
    pub wavelength: f64,
}

impl Cake {
    /// Radial axis in another unit.
    ///
    /// # Errors
    /// Returns `UnitDomain` if a bin has no equivalent.
    pub fn radial_axis(&self, unit: IntegrationUnit) -> Result<Vec<f64>> {
        convert_axis(&self.tth, self.wavelength, IntegrationUnit::TwoThetaDeg, unit)
    }
}

/// Resolves the azimuth window to `[start, end)` with `end > start`,
/// wrapping a descending pair through a full turn.
fn azimuth_window(range: Option<(f64, f64)>) -> (f64, f64) {
    match range {
        None => (-180.0, 180.0),
        Some((a, b)) if b > a => (a, b.min(a + 360.0)),
        Some((a, b)) => (a, b + 360.0),
    }
}

/// Maps an azimuth (degrees) into `[start, start + 360)`.
fn unwrap_azimuth(chi_deg: f64, start: f64) -> f64 {
    start + (chi_deg - start).rem_euclid(360.0)
}

impl Integrator {
    /// Rebins `image` into an azimuth x radius cake.
    ///
    /// A fully masked image returns the previous cake unchanged.
    ///
    /// # Errors
    /// `NotCalibrated`, `ShapeMismatch` for inconsistent inputs and
    /// `FullyMasked` when nothing is usable and nothing was cached.
    pub fn integrate_2d(
        &mut self,
        calibration: &mut Calibration,
        image: ArrayView2<'_, f64>,
        mask: Option<ArrayView2<'_, bool>>,
        corrections: Option<&Array2<f64>>,
        config: &CakeConfig,
    ) -> Result<Cake> {
        let geometry = calibration.geometry_mut()?;
        let factor = geometry.supersampling();
        let base_poni = *geometry.poni();
        let native = image.dim();
        let shape = (native.0 * factor, native.1 * factor);
        let polarization = config
            .correct_polarization
            .then_some(base_poni.polarization_factor);
        let arrays = geometry.arrays(shape);
        let prepared = prepare(
            arrays,
            image,
            mask,
            corrections,
            factor,
            config.correct_solid_angle,
            polarization,
        )?;

        if prepared.valid_count == 0 {
            return match &self.last_cake {
                Some(last) => {
                    log::warn!("image fully masked; returning previous cake");
                    Ok(last.clone())
                }
                None => Err(Error::FullyMasked),
            };
        }

        let n_rad = config
            .num_points_rad
            .unwrap_or_else(|| default_num_points(&base_poni, native))
            .max(1);
        let n_azi = config.num_points_azi.max(1);
        let (lo, hi) = valid_tth_range(arrays, &prepared.valid);
        if !lo.is_finite() || !hi.is_finite() || hi <= lo {
            return Err(Error::InvalidParameter("empty radial range".to_string()));
        }
        let (azi_start, azi_end) = azimuth_window(config.azimuth_range);
        let d_rad = (hi - lo) / n_rad as f64;
        let d_azi = (azi_end - azi_start) / n_azi as f64;

        let mut sums = Array2::<f64>::zeros((n_azi, n_rad));
        let mut counts = Array2::<f64>::zeros((n_azi, n_rad));
        Zip::from(&prepared.signal)
            .and(&prepared.valid)
            .and(&arrays.ttha)
            .and(&arrays.chia)
            .for_each(|&s, &ok, &tth, &chi| {
                if !ok {
                    return;
                }
                let azi = unwrap_azimuth(chi.to_degrees(), azi_start);
                if azi >= azi_end {
                    return;
                }
                let i = (((azi - azi_start) / d_azi) as usize).min(n_azi - 1);
                let j = (((tth - lo) / d_rad) as usize).min(n_rad - 1);
                sums[[i, j]] += s;
                counts[[i, j]] += 1.0;
            });
        let image = Zip::from(&sums)
            .and(&counts)
            .map_collect(|&s, &n| if n > 0.0 { s / n } else { 0.0 });

        let cake = Cake {
            image,
            tth: (0..n_rad)
                .map(|j| (lo + (j as f64 + 0.5) * d_rad).to_degrees())
                .collect(),
            azi: (0..n_azi)
                .map(|i| azi_start + (i as f64 + 0.5) * d_azi)
                .collect(),
            wavelength: base_poni.wavelength,
        };
        self.last_cake = Some(cake.clone());
        Ok(cake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dioptas_core::calibration::PoniParameters;

    fn calibration() -> Calibration {
        let poni = PoniParameters {
            dist: 0.1,
            poni1: 32.0 * 100e-6,
            poni2: 32.0 * 100e-6,
            pixel1: 100e-6,
            pixel2: 100e-6,
            ..PoniParameters::default()
        };
        Calibration::from_poni(poni, None).unwrap()
    }

    #[test]
    fn test_azimuth_window_wraps() {
        assert_eq!(azimuth_window(None), (-180.0, 180.0));
        assert_eq!(azimuth_window(Some((170.0, -170.0))), (170.0, 190.0));
        assert_eq!(unwrap_azimuth(-175.0, 170.0), 185.0);
        assert_eq!(unwrap_azimuth(175.0, 170.0), 175.0);
    }

    #[test]
    fn test_cake_shape_and_axes() {
        let mut integrator = Integrator::new();
        let mut cal = calibration();
        let image = Array2::from_elem((64, 64), 1.0);
        let config = CakeConfig::default().with_num_points_rad(50);
        let cake = integrator
            .integrate_2d(&mut cal, image.view(), None, None, &config)
            .unwrap();
        assert_eq!(cake.image.dim(), (360, 50));
        assert_eq!(cake.azi.len(), 360);
        assert!(cake.azi.windows(2).all(|w| w[1] > w[0]));
        assert!(cake.tth.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_wrapped_window_is_monotone() {
        let mut integrator = Integrator::new();
        let mut cal = calibration();
        let image = Array2::from_elem((64, 64), 1.0);
        let config = CakeConfig::default()
            .with_num_points_rad(20)
            .with_num_points_azi(10)
            .with_azimuth_range(150.0, -150.0);
        let cake = integrator
            .integrate_2d(&mut cal, image.view(), None, None, &config)
            .unwrap();
        assert!(cake.azi.windows(2).all(|w| w[1] > w[0]));
        assert!(cake.azi[0] > 150.0 && *cake.azi.last().unwrap() < 210.0);
        assert!(cake.image.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_fully_masked_without_cache() {
        let mut integrator = Integrator::new();
        let mut cal = calibration();
        let image = Array2::from_elem((16, 16), 1.0);
        let mask = Array2::from_elem((16, 16), true);
        let err = integrator
            .integrate_2d(&mut cal, image.view(), Some(mask.view()), None, &CakeConfig::default())
            .unwrap_err();
        assert_eq!(err, Error::FullyMasked);
    }
}
