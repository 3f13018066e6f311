//! Azimuthal integration of detector images into 1D patterns.
//!
//! Pixels are binned by scattering angle. The CSR method spreads each pixel
//! over the bins covered by its corner 2θ range and caches the resulting
//! sparse lookup table; the histogram method assigns pixel centres only.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use dioptas_core::calibration::{Calibration, PixelArrays, PoniParameters};
use dioptas_core::error::{Error, Result};
use dioptas_core::image::supersample;
use dioptas_core::units::{convert, IntegrationUnit};
use ndarray::{Array2, ArrayView2, Zip};
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Factor applied to the longest beam-centre-to-corner distance (pixels)
/// to obtain the default number of radial bins.
pub const DEFAULT_POINTS_FACTOR: f64 = 1.5;

/// Pixel-to-bin assignment strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum IntegrationMethod {
    /// Cached sparse lookup table with bounding-box pixel splitting.
    #[default]
    Csr,
    /// Pixel centres only, no splitting.
    Histogram,
}

impl IntegrationMethod {
    /// Tag used in settings and batch files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationMethod::Csr => "csr",
            IntegrationMethod::Histogram => "histogram",
        }
    }
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csr" | "bbox" | "splitbbox" => Ok(IntegrationMethod::Csr),
            "histogram" | "numpy" | "nosplit" => Ok(IntegrationMethod::Histogram),
            other => {
                log::warn!("integration method '{other}' unavailable, using histogram");
                Ok(IntegrationMethod::Histogram)
            }
        }
    }
}

/// Options of a 1D integration.
#[derive(Clone, Debug, PartialEq)]
pub struct IntegrationConfig {
    /// Unit of the returned x axis.
    pub unit: IntegrationUnit,
    /// Number of radial bins; derived from the geometry when `None`.
    pub num_points: Option<usize>,
    /// Binning method.
    pub method: IntegrationMethod,
    /// Divide by the relative solid angle.
    pub correct_solid_angle: bool,
    /// Polarisation factor overriding the calibrated one; `None` uses the
    /// calibration.
    pub polarization_factor: Option<f64>,
    /// Apply the polarisation correction at all.
    pub correct_polarization: bool,
    /// Radial range in degrees 2θ; the unmasked extent when `None`.
    pub radial_range: Option<(f64, f64)>,
    /// Drop bins without signal. When disabled every bin is returned and
    /// empty bins read 0, so repeated integrations share one axis length.
    pub trim_zeros: bool,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            unit: IntegrationUnit::TwoThetaDeg,
            num_points: None,
            method: IntegrationMethod::Csr,
            correct_solid_angle: true,
            polarization_factor: None,
            correct_polarization: true,
            radial_range: None,
            trim_zeros: true,
        }
    }
}

impl IntegrationConfig {
    /// Sets the output unit.
    #[must_use]
    pub fn with_unit(mut self, unit: IntegrationUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the number of radial bins.
    #[must_use]
    pub fn with_num_points(mut self, num_points: usize) -> Self {
        self.num_points = Some(num_points);
        self
    }

    /// Sets the binning method.
    #[must_use]
    pub fn with_method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }

    /// Enables or disables the solid-angle correction.
    #[must_use]
    pub fn with_solid_angle(mut self, enabled: bool) -> Self {
        self.correct_solid_angle = enabled;
        self
    }

    /// Overrides the polarisation factor.
    #[must_use]
    pub fn with_polarization_factor(mut self, factor: f64) -> Self {
        self.polarization_factor = Some(factor);
        self
    }

    /// Restricts the radial range (degrees 2θ).
    #[must_use]
    pub fn with_radial_range(mut self, lo: f64, hi: f64) -> Self {
        self.radial_range = Some((lo.min(hi), lo.max(hi)));
        self
    }

    /// Enables or disables dropping of empty bins.
    #[must_use]
    pub fn with_trim_zeros(mut self, enabled: bool) -> Self {
        self.trim_zeros = enabled;
        self
    }
}

/// Result of a 1D integration.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct IntegratedPattern {
    /// Bin positions in `unit`.
    pub x: Vec<f64>,
    /// Mean corrected intensity per bin.
    pub y: Vec<f64>,
    /// Unit of `x`.
    pub unit: IntegrationUnit,
}

impl IntegratedPattern {
    /// Number of bins kept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Returns true when every bin was filtered out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Corrected signal and validity of every pixel at integration resolution.
pub(crate) struct Prepared {
    pub signal: Array2<f64>,
    pub valid: Array2<bool>,
    pub valid_count: usize,
}

/// Number of radial points giving ~1.5 bins per pixel of radius.
#[must_use]
pub fn default_num_points(poni: &PoniParameters, shape: (usize, usize)) -> usize {
    let distance = poni.max_center_corner_distance(shape);
    ((DEFAULT_POINTS_FACTOR * distance).ceil() as usize).max(1)
}

/// Upsamples the image and mask, divides by corrections and flags usable pixels.
pub(crate) fn prepare(
    arrays: &PixelArrays,
    image: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
    corrections: Option<&Array2<f64>>,
    supersampling: usize,
    solid_angle: bool,
    polarization: Option<f64>,
) -> Result<Prepared> {
    let shape = arrays.shape;
    let mut signal = supersample(image, supersampling);
    if signal.dim() != shape {
        return Err(Error::shape_mismatch(shape, signal.dim()));
    }
    let mut valid = match mask {
        Some(mask) => {
            let up = supersample(mask, supersampling);
            if up.dim() != shape {
                return Err(Error::shape_mismatch(shape, up.dim()));
            }
            up.mapv(|m| !m)
        }
        None => Array2::from_elem(shape, true),
    };
    if let Some(field) = corrections {
        if field.dim() != shape {
            return Err(Error::shape_mismatch(shape, field.dim()));
        }
        signal /= field;
    }
    if solid_angle {
        signal /= &arrays.solid_angle;
    }
    if let Some(factor) = polarization {
        signal /= &arrays.polarization(factor);
    }
    Zip::from(&mut valid)
        .and(&signal)
        .for_each(|v, s| *v = *v && s.is_finite());
    let valid_count = valid.iter().filter(|&&v| v).count();
    Ok(Prepared {
        signal,
        valid,
        valid_count,
    })
}

/// Smallest and largest 2θ (radians) covered by valid pixels.
pub(crate) fn valid_tth_range(arrays: &PixelArrays, valid: &Array2<bool>) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for ((r, c), &ok) in valid.indexed_iter() {
        if ok {
            let (a, b) = arrays.pixel_tth_extent(r, c);
            lo = lo.min(a);
            hi = hi.max(b);
        }
    }
    (lo, hi)
}

#[derive(Clone, Debug, PartialEq)]
struct LutKey {
    shape: (usize, usize),
    poni: PoniParameters,
    bins: usize,
    range: (u64, u64),
    mask: u64,
}

/// Sparse bin -> pixel lookup table in CSR layout.
#[derive(Clone, Debug)]
struct CsrLut {
    key: LutKey,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    weights: Vec<f64>,
}

impl CsrLut {
    fn build(arrays: &PixelArrays, valid: &Array2<bool>, lo: f64, hi: f64, key: LutKey) -> Self {
        let bins = key.bins;
        let delta = (hi - lo) / bins as f64;
        let cols = arrays.shape.1;
        let mut per_bin: Vec<Vec<(usize, f64)>> = vec![Vec::new(); bins];
        for ((r, c), &ok) in valid.indexed_iter() {
            if !ok {
                continue;
            }
            let (a, b) = arrays.pixel_tth_extent(r, c);
            if b < lo || a > hi {
                continue;
            }
            let idx = r * cols + c;
            let first = (((a.max(lo) - lo) / delta).floor() as usize).min(bins - 1);
            let last = (((b.min(hi) - lo) / delta).floor() as usize).min(bins - 1);
            let width = b - a;
            if width <= 0.0 {
                per_bin[first].push((idx, 1.0));
                continue;
            }
            // the share of a pixel reaching past the range is dropped
            for (k, entries) in per_bin.iter_mut().enumerate().take(last + 1).skip(first) {
                let bin_lo = lo + k as f64 * delta;
                let overlap = (b.min(bin_lo + delta) - a.max(bin_lo)).max(0.0);
                if overlap > 0.0 {
                    entries.push((idx, overlap / width));
                }
            }
        }
        let mut indptr = Vec::with_capacity(bins + 1);
        let mut indices = Vec::new();
        let mut weights = Vec::new();
        indptr.push(0);
        for entries in per_bin {
            for (idx, w) in entries {
                indices.push(idx);
                weights.push(w);
            }
            indptr.push(indices.len());
        }
        Self {
            key,
            indptr,
            indices,
            weights,
        }
    }

    fn apply(&self, signal: &[f64]) -> Vec<(f64, f64)> {
        (0..self.key.bins)
            .into_par_iter()
            .map(|k| {
                let span = self.indptr[k]..self.indptr[k + 1];
                self.indices[span.clone()]
                    .iter()
                    .zip(&self.weights[span])
                    .fold((0.0, 0.0), |(sum, norm), (&i, &w)| {
                        (sum + w * signal[i], norm + w)
                    })
            })
            .collect()
    }
}

fn histogram(
    arrays: &PixelArrays,
    prepared: &Prepared,
    lo: f64,
    hi: f64,
    bins: usize,
) -> Vec<(f64, f64)> {
    let delta = (hi - lo) / bins as f64;
    let mut acc = vec![(0.0, 0.0); bins];
    Zip::from(&prepared.signal)
        .and(&prepared.valid)
        .and(&arrays.ttha)
        .for_each(|&s, &ok, &tth| {
            if ok && tth >= lo && tth <= hi {
                let k = (((tth - lo) / delta) as usize).min(bins - 1);
                acc[k].0 += s;
                acc[k].1 += 1.0;
            }
        });
    acc
}

fn mask_hash(valid: &Array2<bool>) -> u64 {
    let mut hasher = DefaultHasher::new();
    valid.dim().hash(&mut hasher);
    for (i, &v) in valid.iter().enumerate() {
        if !v {
            i.hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Azimuthal integrator with a cached lookup table and the last
/// successful pattern.
#[derive(Clone, Debug, Default)]
pub struct Integrator {
    lut: Option<CsrLut>,
    last_pattern: Option<IntegratedPattern>,
    pub(crate) last_cake: Option<crate::cake::Cake>,
}

impl Integrator {
    /// Creates an integrator with empty caches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The last successfully integrated pattern.
    #[must_use]
    pub fn last_pattern(&self) -> Option<&IntegratedPattern> {
        self.last_pattern.as_ref()
    }

    /// Drops the lookup table and cached results.
    pub fn reset(&mut self) {
        self.lut = None;
        self.last_pattern = None;
        self.last_cake = None;
    }

    /// Integrates `image` to a 1D pattern.
    ///
    /// `image` and `mask` are at detector resolution; `corrections` is the
    /// composite correction field at integration (supersampled) resolution.
    /// Bins with a non-positive or non-finite mean are dropped.
    ///
    /// A fully masked image returns the previous pattern unchanged.
    ///
    /// # Errors
    /// `NotCalibrated` without a PONI set, `ShapeMismatch` for inconsistent
    /// inputs and `FullyMasked` when everything is masked and nothing was
    /// integrated before.
    pub fn integrate_1d(
        &mut self,
        calibration: &mut Calibration,
        image: ArrayView2<'_, f64>,
        mask: Option<ArrayView2<'_, bool>>,
        corrections: Option<&Array2<f64>>,
        config: &IntegrationConfig,
    ) -> Result<IntegratedPattern> {
        let geometry = calibration.geometry_mut()?;
        let factor = geometry.supersampling();
        let base_poni = *geometry.poni();
        let poni = geometry.effective_poni();
        let native = image.dim();
        let shape = (native.0 * factor, native.1 * factor);
        let polarization = config
            .correct_polarization
            .then(|| config.polarization_factor.unwrap_or(poni.polarization_factor));

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
            return match &self.last_pattern {
                Some(last) => {
                    log::warn!("image fully masked; returning previous pattern");
                    Ok(last.clone())
                }
                None => Err(Error::FullyMasked),
            };
        }

        let bins = config
            .num_points
            .unwrap_or_else(|| default_num_points(&base_poni, native))
            .max(1);
        let (lo, hi) = match config.radial_range {
            Some((a, b)) => (a.to_radians(), b.to_radians()),
            None => valid_tth_range(arrays, &prepared.valid),
        };
        if !lo.is_finite() || !hi.is_finite() || hi <= lo {
            return Err(Error::InvalidParameter(format!(
                "empty radial range [{lo}, {hi}]"
            )));
        }

        let sums = match config.method {
            IntegrationMethod::Csr => {
                let key = LutKey {
                    shape,
                    poni,
                    bins,
                    range: (lo.to_bits(), hi.to_bits()),
                    mask: mask_hash(&prepared.valid),
                };
                let stale = self.lut.as_ref().map_or(true, |lut| lut.key != key);
                if stale {
                    log::debug!("building CSR lookup table: {bins} bins for {shape:?}");
                    self.lut = Some(CsrLut::build(arrays, &prepared.valid, lo, hi, key));
                }
                let flat: Vec<f64> = prepared.signal.iter().copied().collect();
                match &self.lut {
                    Some(lut) => lut.apply(&flat),
                    None => Vec::new(),
                }
            }
            IntegrationMethod::Histogram => histogram(arrays, &prepared, lo, hi, bins),
        };

        let delta = (hi - lo) / bins as f64;
        let mut x = Vec::with_capacity(bins);
        let mut y = Vec::with_capacity(bins);
        for (k, (sum, norm)) in sums.into_iter().enumerate() {
            let mut value = sum / norm;
            if !(value.is_finite() && value > 0.0) {
                if config.trim_zeros {
                    continue;
                }
                value = 0.0;
            }
            let tth_deg = (lo + (k as f64 + 0.5) * delta).to_degrees();
            match convert(tth_deg, poni.wavelength, IntegrationUnit::TwoThetaDeg, config.unit) {
                Ok(v) => {
                    x.push(v);
                    y.push(value);
                }
                Err(e) => log::debug!("dropping bin at {tth_deg} deg: {e}"),
            }
        }

        let pattern = IntegratedPattern {
            x,
            y,
            unit: config.unit,
        };
        self.last_pattern = Some(pattern.clone());
        Ok(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dioptas_core::calibration::PoniParameters;

    fn calibration() -> Calibration {
        let poni = PoniParameters {
            dist: 0.2,
            poni1: 64.0 * 100e-6,
            poni2: 64.0 * 100e-6,
            pixel1: 100e-6,
            pixel2: 100e-6,
            wavelength: 0.3344e-10,
            ..PoniParameters::default()
        };
        Calibration::from_poni(poni, None).unwrap()
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("csr".parse::<IntegrationMethod>().unwrap(), IntegrationMethod::Csr);
        assert_eq!(
            "lut_ocl".parse::<IntegrationMethod>().unwrap(),
            IntegrationMethod::Histogram
        );
    }

    #[test]
    fn test_default_num_points() {
        let cal = calibration();
        let poni = cal.geometry().unwrap().poni();
        // corner distance of a centred 128x128 image is 64 * sqrt(2)
        assert_eq!(default_num_points(poni, (128, 128)), 136);
    }

    #[test]
    fn test_uncalibrated() {
        let mut integrator = Integrator::new();
        let mut cal = Calibration::new();
        let image = Array2::<f64>::ones((8, 8));
        let err = integrator
            .integrate_1d(&mut cal, image.view(), None, None, &IntegrationConfig::default())
            .unwrap_err();
        assert_eq!(err, Error::NotCalibrated);
    }

    #[test]
    fn test_flat_image_without_corrections_is_flat() {
        let mut integrator = Integrator::new();
        let mut cal = calibration();
        let image = Array2::from_elem((128, 128), 5.0);
        let mut config = IntegrationConfig::default()
            .with_num_points(100)
            .with_solid_angle(false);
        config.correct_polarization = false;
        for method in [IntegrationMethod::Csr, IntegrationMethod::Histogram] {
            let pattern = integrator
                .integrate_1d(&mut cal, image.view(), None, None, &config.clone().with_method(method))
                .unwrap();
            assert!(!pattern.is_empty());
            assert!(pattern.y.iter().all(|&v| (v - 5.0).abs() < 1e-9));
        }
    }

    #[test]
    fn test_corrections_divide_signal() {
        let mut integrator = Integrator::new();
        let mut cal = calibration();
        let image = Array2::from_elem((32, 32), 4.0);
        let field = Array2::from_elem((32, 32), 2.0);
        let mut config = IntegrationConfig::default()
            .with_num_points(20)
            .with_solid_angle(false);
        config.correct_polarization = false;
        let pattern = integrator
            .integrate_1d(&mut cal, image.view(), None, Some(&field), &config)
            .unwrap();
        assert!(pattern.y.iter().all(|&v| (v - 2.0).abs() < 1e-9));
    }

    #[test]
    fn test_supersampling_requires_matching_corrections() {
        let mut integrator = Integrator::new();
        let mut cal = calibration();
        cal.set_supersampling(2).unwrap();
        let image = Array2::from_elem((16, 16), 1.0);
        let field = Array2::from_elem((16, 16), 1.0);
        let err = integrator
            .integrate_1d(&mut cal, image.view(), None, Some(&field), &IntegrationConfig::default())
            .unwrap_err();
        assert_eq!(err, Error::shape_mismatch((32, 32), (16, 16)));
    }

    #[test]
    fn test_untrimmed_pattern_keeps_every_bin() {
        let mut integrator = Integrator::new();
        let mut cal = calibration();
        let image = Array2::from_elem((64, 64), 1.0);
        let config = IntegrationConfig::default()
            .with_num_points(400)
            .with_method(IntegrationMethod::Histogram)
            .with_radial_range(0.0, 10.0)
            .with_trim_zeros(false);
        let pattern = integrator
            .integrate_1d(&mut cal, image.view(), None, None, &config)
            .unwrap();
        assert_eq!(pattern.len(), 400);
        assert!(pattern.y.iter().any(|&v| v == 0.0));
    }

    #[test]
    fn test_narrow_radial_range_ignores_outside_pixels() {
        let mut cal = calibration();
        // bright disc near the beam centre, well below 1 degree 2θ
        let image = Array2::from_shape_fn((128, 128), |(r, c)| {
            let (dr, dc) = (r as f64 - 64.0, c as f64 - 64.0);
            if dr.hypot(dc) < 20.0 {
                1000.0
            } else {
                1.0
            }
        });
        let mut config = IntegrationConfig::default()
            .with_num_points(20)
            .with_solid_angle(false)
            .with_radial_range(1.0, 1.5);
        config.correct_polarization = false;
        for method in [IntegrationMethod::Csr, IntegrationMethod::Histogram] {
            let pattern = Integrator::new()
                .integrate_1d(&mut cal, image.view(), None, None, &config.clone().with_method(method))
                .unwrap();
            assert!(!pattern.is_empty());
            assert!(
                pattern.y.iter().all(|&v| (v - 1.0).abs() < 1e-9),
                "{method:?}: {:?}",
                pattern.y
            );
        }
    }
}
