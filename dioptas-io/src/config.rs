//! The working configuration: one calibration, image, mask, set of
//! corrections and pattern, composed as a plain record.
//!
//! Integration requests pass these pieces explicitly to the
//! [`Integrator`]; nothing holds a reference back into the record.

use crate::loader::{FileLoader, FrameSource};
use crate::settings::IntegrationSettings;
use crate::{mask_io, poni, Result};
use dioptas_algorithms::{Cake, IntegratedPattern, IntegrationConfig, Integrator};
use dioptas_core::calibration::Calibration;
use dioptas_core::corrections::CorrectionManager;
use dioptas_core::image::{FrameId, ImageFrame};
use dioptas_core::mask::Mask;
use dioptas_core::pattern::Pattern;
use ndarray::ArrayView2;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

/// Everything an integration needs.
pub struct Configuration {
    /// Detector geometry and collected ring points.
    pub calibration: Calibration,
    /// File the calibration was read from.
    pub calibration_file: Option<PathBuf>,
    /// The current image.
    pub image: ImageFrame,
    /// Pixel mask, sized like the image.
    pub mask: Mask,
    /// File the mask was read from.
    pub mask_file: Option<PathBuf>,
    /// Correction fields, sized like the supersampled image.
    pub corrections: CorrectionManager,
    /// Integration options.
    pub settings: IntegrationSettings,
    /// Integrator with its lookup-table cache.
    pub integrator: Integrator,
    /// Last 1D pattern of the current image.
    pub pattern: Pattern,
    /// Last cake of the current image.
    pub cake: Option<Cake>,
    loader: Box<dyn FrameSource + Send>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            calibration: Calibration::new(),
            calibration_file: None,
            image: ImageFrame::default(),
            mask: Mask::default(),
            mask_file: None,
            corrections: CorrectionManager::new(),
            settings: IntegrationSettings::default(),
            integrator: Integrator::new(),
            pattern: Pattern::default(),
            cake: None,
            loader: Box::new(FileLoader::new()),
        }
    }
}

impl Configuration {
    /// Creates an empty, uncalibrated configuration reading from disk.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the frame source (in-memory sources, remote stores, ...).
    #[must_use]
    pub fn with_loader(mut self, loader: Box<dyn FrameSource + Send>) -> Self {
        self.loader = loader;
        self
    }

    /// The frame source used by [`Configuration::load_image`].
    pub fn loader_mut(&mut self) -> &mut dyn FrameSource {
        self.loader.as_mut()
    }

    /// Reads a PONI file and makes it the working geometry.
    ///
    /// # Errors
    /// As [`poni::read_poni`]; the previous calibration is kept on failure.
    pub fn load_calibration<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut calibration = poni::read_poni(path)?;
        calibration.set_supersampling(self.settings.supersampling)?;
        calibration.ring_points = std::mem::take(&mut self.calibration.ring_points);
        self.calibration = calibration;
        self.calibration_file = Some(path.to_path_buf());
        self.integrator.reset();
        log::info!("calibration loaded from {}", path.display());
        Ok(())
    }

    /// Writes the working geometry to a PONI file.
    ///
    /// # Errors
    /// As [`poni::write_poni`].
    pub fn save_calibration<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        poni::write_poni(path, &self.calibration)
    }

    /// Loads a mask file into the mask (undoable).
    ///
    /// # Errors
    /// As [`mask_io::load_mask_into`].
    pub fn load_mask<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        mask_io::load_mask_into(&mut self.mask, path.as_ref())?;
        self.mask_file = Some(path.as_ref().to_path_buf());
        Ok(())
    }

    /// Saves the mask as TIFF.
    ///
    /// # Errors
    /// As [`mask_io::write_mask`].
    pub fn save_mask<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        mask_io::write_mask(path, self.mask.field())
    }

    /// Installs new settings and propagates the supersampling factor.
    ///
    /// # Errors
    /// `Core(InvalidParameter)` for a supersampling factor outside 1..=4.
    pub fn apply_settings(&mut self, settings: IntegrationSettings) -> Result<()> {
        if self.calibration.is_calibrated() {
            self.calibration.set_supersampling(settings.supersampling)?;
        }
        self.settings = settings;
        let shape = self.supersampled_shape();
        self.corrections.set_shape(shape);
        Ok(())
    }

    /// Image shape times the supersampling factor.
    #[must_use]
    pub fn supersampled_shape(&self) -> (usize, usize) {
        let factor = self.settings.supersampling.max(1);
        let (rows, cols) = self.image.shape();
        (rows * factor, cols * factor)
    }

    /// Loads frame `frame` (0 when `None`) of `path` as the current image.
    ///
    /// The orientation record of the previous image is replayed onto the
    /// new one. A shape change resets the mask and clears the corrections.
    /// With `auto_integrate` set and a calibration present the image is
    /// integrated right away.
    ///
    /// Returns true when the shape change reset the mask or discarded
    /// corrections.
    ///
    /// # Errors
    /// Loader errors; integration errors when auto-integrating.
    pub fn load_image<P: AsRef<Path>>(&mut self, path: P, frame: Option<usize>) -> Result<bool> {
        let path = path.as_ref();
        let index = frame.unwrap_or(0);
        let loaded = self.loader.load_frame(path, index)?;
        let id = if loaded.series_max > 1 || frame.is_some() {
            FrameId::with_frame(path, index)
        } else {
            FrameId::new(path)
        };
        self.image.replace_raw(loaded.img_data, id);
        self.image.file_info = loaded.file_info;
        self.image.motors_info = loaded.motors_info;
        self.image.series_max = loaded.series_max.max(1);

        let shape = self.image.shape();
        let mask_reset = self.mask.set_dimension(shape);
        if mask_reset {
            log::warn!("image shape changed to {shape:?}; mask reset");
        }
        let supersampled = self.supersampled_shape();
        let corrections_dropped = self.corrections.set_shape(supersampled);

        if self.settings.auto_integrate && self.calibration.is_calibrated() {
            self.integrate_image_1d()?;
        }
        Ok(mask_reset || corrections_dropped)
    }

    fn mask_for(&self, shape: (usize, usize)) -> Option<ndarray::Array2<bool>> {
        if self.mask.shape() == shape {
            Some(self.mask.effective())
        } else {
            log::warn!(
                "mask shape {:?} differs from image shape {shape:?}; integrating unmasked",
                self.mask.shape()
            );
            None
        }
    }

    /// Integrates an arbitrary image with the current calibration, mask,
    /// corrections and the given options. Does not touch `pattern`.
    ///
    /// # Errors
    /// As [`Integrator::integrate_1d`].
    pub fn integrate_array_1d(
        &mut self,
        image: ArrayView2<'_, f64>,
        config: &IntegrationConfig,
    ) -> Result<IntegratedPattern> {
        let mask = self.mask_for(image.dim());
        let composite = self.corrections.composite();
        Ok(self.integrator.integrate_1d(
            &mut self.calibration,
            image,
            mask.as_ref().map(|m| m.view()),
            composite.as_ref(),
            config,
        )?)
    }

    /// Integrates the current image into `pattern`.
    ///
    /// # Errors
    /// As [`Integrator::integrate_1d`].
    pub fn integrate_image_1d(&mut self) -> Result<&Pattern> {
        let data = self.image.img_data();
        let config = self.settings.integration_config();
        let result = self.integrate_array_1d(data.view(), &config)?;
        let name = self
            .image
            .id
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
        self.pattern
            .set_pattern(result.x, result.y, name.as_deref(), Some(result.unit))?;
        Ok(&self.pattern)
    }

    /// Rebins the current image into `cake`.
    ///
    /// # Errors
    /// As [`Integrator::integrate_2d`].
    pub fn integrate_image_2d(&mut self) -> Result<&Cake> {
        let data = self.image.img_data();
        let mask = self.mask_for(data.dim());
        let composite = self.corrections.composite();
        let cake = self.integrator.integrate_2d(
            &mut self.calibration,
            data.view(),
            mask.as_ref().map(|m| m.view()),
            composite.as_ref(),
            &self.settings.cake_config(),
        )?;
        Ok(self.cake.insert(cake))
    }

    /// Opens a sweep scope. While the returned guard lives, automatic
    /// integration is off and, for map sweeps, empty bins are kept so all
    /// patterns share one axis length. Dropping the guard restores both
    /// settings on every exit path.
    pub fn sweep(&mut self, scope: SweepScope) -> SweepGuard<'_> {
        let saved_auto = self.settings.auto_integrate;
        let saved_trim = self.settings.trim_trailing_zeros;
        self.settings.auto_integrate = false;
        if scope == SweepScope::Map {
            self.settings.trim_trailing_zeros = false;
        }
        log::debug!("entering {scope:?} sweep");
        SweepGuard {
            config: self,
            auto_integrate: saved_auto,
            trim_trailing_zeros: saved_trim,
        }
    }
}

/// Kind of sweep, deciding which settings are suspended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepScope {
    /// Batch integration: suspends automatic integration.
    Batch,
    /// Map acquisition: additionally suspends trimming of empty bins.
    Map,
}

/// Restores the settings suspended by [`Configuration::sweep`] on drop.
pub struct SweepGuard<'a> {
    config: &'a mut Configuration,
    auto_integrate: bool,
    trim_trailing_zeros: bool,
}

impl Deref for SweepGuard<'_> {
    type Target = Configuration;

    fn deref(&self) -> &Configuration {
        self.config
    }
}

impl DerefMut for SweepGuard<'_> {
    fn deref_mut(&mut self) -> &mut Configuration {
        self.config
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.config.settings.auto_integrate = self.auto_integrate;
        self.config.settings.trim_trailing_zeros = self.trim_trailing_zeros;
        log::debug!("sweep finished, settings restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadedImage;
    use dioptas_core::calibration::PoniParameters;
    use ndarray::Array2;

    struct Flat;

    impl FrameSource for Flat {
        fn frame_count(&mut self, _path: &Path) -> Result<usize> {
            Ok(3)
        }

        fn load_frame(&mut self, _path: &Path, frame: usize) -> Result<LoadedImage> {
            let mut image = LoadedImage::new(Array2::from_elem((64, 64), 1.0 + frame as f64));
            image.series_max = 3;
            Ok(image)
        }
    }

    fn calibrated() -> Configuration {
        let mut config = Configuration::new().with_loader(Box::new(Flat));
        let poni = PoniParameters {
            dist: 0.1,
            poni1: 32.0 * 100e-6,
            poni2: 32.0 * 100e-6,
            pixel1: 100e-6,
            pixel2: 100e-6,
            ..PoniParameters::default()
        };
        config.calibration = Calibration::from_poni(poni, Some("test".into())).unwrap();
        config
    }

    #[test]
    fn test_load_image_auto_integrates() {
        let mut config = calibrated();
        config.load_image("series.h5", Some(2)).unwrap();
        assert_eq!(config.image.shape(), (64, 64));
        assert_eq!(config.image.id.frame_index, Some(2));
        assert_eq!(config.mask.shape(), (64, 64));
        assert_eq!(config.pattern.name, "series");
        assert!(!config.pattern.is_empty());
    }

    #[test]
    fn test_uncalibrated_load_does_not_integrate() {
        let mut config = Configuration::new().with_loader(Box::new(Flat));
        config.load_image("a.tif", None).unwrap();
        assert!(config.pattern.is_empty());
        assert!(config.integrate_image_1d().is_err());
    }

    #[test]
    fn test_sweep_guard_restores_on_early_exit() {
        let mut config = calibrated();
        config.settings.trim_trailing_zeros = true;
        let result: Result<bool> = (|| {
            let mut guard = config.sweep(SweepScope::Map);
            assert!(!guard.settings.auto_integrate);
            assert!(!guard.settings.trim_trailing_zeros);
            guard.load_image("x.h5", Some(0))?;
            Err(crate::Error::InvalidFormat("abort".into()))
        })();
        assert!(result.is_err());
        assert!(config.settings.auto_integrate);
        assert!(config.settings.trim_trailing_zeros);
    }

    struct Resizing;

    impl FrameSource for Resizing {
        fn frame_count(&mut self, _path: &Path) -> Result<usize> {
            Ok(2)
        }

        fn load_frame(&mut self, _path: &Path, frame: usize) -> Result<LoadedImage> {
            let side = if frame == 0 { 64 } else { 32 };
            Ok(LoadedImage::new(Array2::from_elem((side, side), 1.0)))
        }
    }

    #[test]
    fn test_shape_change_is_reported() {
        let mut config = Configuration::new().with_loader(Box::new(Resizing));
        assert!(config.load_image("s.h5", Some(0)).unwrap());
        config.corrections.add("flat", Array2::from_elem((64, 64), 2.0)).unwrap();
        config.mask.mask_rectangle(0.0, 0.0, 4.0, 4.0);
        assert!(!config.load_image("s.h5", Some(0)).unwrap());
        assert_eq!(config.corrections.len(), 1);
        assert!(config.mask.masked_count() > 0);

        assert!(config.load_image("s.h5", Some(1)).unwrap());
        assert!(config.corrections.is_empty());
        assert_eq!(config.mask.shape(), (32, 32));
        assert_eq!(config.mask.masked_count(), 0);
    }

    #[test]
    fn test_cake_is_stored() {
        let mut config = calibrated();
        config.settings.cake_num_points_azi = 36;
        config.load_image("a.h5", None).unwrap();
        let cake = config.integrate_image_2d().unwrap();
        assert_eq!(cake.azi.len(), 36);
        assert!(config.cake.is_some());
    }
}
