//! One-dimensional diffraction pattern with scaling, smoothing and
//! background subtraction.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use crate::background::{extract_background, BackgroundParameters};
use crate::error::{Error, Result};
use crate::units::{convert, convert_axis, IntegrationUnit};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Auto-background settings: fit parameters and optional x-range of interest.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AutoBackground {
    pub params: BackgroundParameters,
    pub roi: Option<(f64, f64)>,
}

/// Linear interpolation with end-value clamping; `xp` must be increasing.
#[must_use]
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len().min(fp.len());
    if n == 0 {
        return 0.0;
    }
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    let hi = xp[..n].partition_point(|&v| v <= x);
    let lo = hi - 1;
    let t = (x - xp[lo]) / (xp[hi] - xp[lo]);
    fp[lo] + t * (fp[hi] - fp[lo])
}

/// Gaussian smoothing with reflected edges, kernel truncated at 4 sigma.
#[must_use]
pub fn gaussian_filter1d(y: &[f64], sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 || y.is_empty() {
        return y.to_vec();
    }
    let radius = (4.0 * sigma + 0.5) as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-0.5 * (i as f64 / sigma).powi(2)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();
    let n = y.len() as isize;
    let reflect = |mut i: isize| loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        } else {
            break i as usize;
        }
    };
    (0..n)
        .map(|i| {
            kernel
                .iter()
                .zip(-radius..=radius)
                .map(|(k, off)| k * y[reflect(i + off)])
                .sum::<f64>()
                / norm
        })
        .collect()
}

/// A 1D pattern `(x, y)` tagged with its radial unit.
///
/// The raw series is kept untouched; [`Pattern::data`] returns the series
/// after scaling, offset, background pattern, smoothing and auto-background.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub name: String,
    unit: IntegrationUnit,
    original_x: Vec<f64>,
    original_y: Vec<f64>,
    scaling: f64,
    offset: f64,
    smoothing: f64,
    background_pattern: Option<Box<Pattern>>,
    auto_background: Option<AutoBackground>,
    processed_x: Vec<f64>,
    processed_y: Vec<f64>,
    auto_background_y: Option<Vec<f64>>,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            name: String::new(),
            unit: IntegrationUnit::default(),
            original_x: Vec::new(),
            original_y: Vec::new(),
            scaling: 1.0,
            offset: 0.0,
            smoothing: 0.0,
            background_pattern: None,
            auto_background: None,
            processed_x: Vec::new(),
            processed_y: Vec::new(),
            auto_background_y: None,
        }
    }
}

impl Pattern {
    /// Creates a pattern from aligned arrays.
    ///
    /// # Errors
    /// Returns `InvalidParameter` when `x` and `y` differ in length.
    pub fn new(x: Vec<f64>, y: Vec<f64>, name: impl Into<String>) -> Result<Self> {
        let mut pattern = Self {
            name: name.into(),
            ..Self::default()
        };
        pattern.set_data(x, y)?;
        Ok(pattern)
    }

    /// Sets the radial unit tag.
    #[must_use]
    pub fn with_unit(mut self, unit: IntegrationUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Replaces the raw series.
    ///
    /// # Errors
    /// Returns `InvalidParameter` when `x` and `y` differ in length.
    pub fn set_data(&mut self, x: Vec<f64>, y: Vec<f64>) -> Result<()> {
        if x.len() != y.len() {
            return Err(Error::InvalidParameter(format!(
                "pattern x has {} points but y has {}",
                x.len(),
                y.len()
            )));
        }
        self.original_x = x;
        self.original_y = y;
        self.recalculate();
        Ok(())
    }

    /// Replaces raw series, name and (optionally) unit at once.
    ///
    /// # Errors
    /// Returns `InvalidParameter` when `x` and `y` differ in length.
    pub fn set_pattern(
        &mut self,
        x: Vec<f64>,
        y: Vec<f64>,
        name: Option<&str>,
        unit: Option<IntegrationUnit>,
    ) -> Result<()> {
        if let Some(name) = name {
            self.name = name.to_string();
        }
        if let Some(unit) = unit {
            self.unit = unit;
        }
        self.set_data(x, y)
    }

    #[must_use]
    pub fn unit(&self) -> IntegrationUnit {
        self.unit
    }

    /// Converts the x axis (and auto-background ROI) to another unit.
    ///
    /// # Errors
    /// Returns `UnitDomain` if a point has no equivalent in `unit`.
    pub fn convert_unit(&mut self, unit: IntegrationUnit, wavelength: f64) -> Result<()> {
        if unit == self.unit {
            return Ok(());
        }
        let mut x = convert_axis(&self.original_x, wavelength, self.unit, unit)?;
        let roi = match self.auto_background.and_then(|auto| auto.roi) {
            Some((lo, hi)) => {
                let a = convert(lo, wavelength, self.unit, unit)?;
                let b = convert(hi, wavelength, self.unit, unit)?;
                Some((a.min(b), a.max(b)))
            }
            None => None,
        };
        if let Some(auto) = &mut self.auto_background {
            auto.roi = roi;
        }
        let mut y = std::mem::take(&mut self.original_y);
        // d-spacing runs opposite to 2θ and Q
        if x.len() > 1 && x[0] > x[x.len() - 1] {
            x.reverse();
            y.reverse();
        }
        self.unit = unit;
        self.original_x = x;
        self.original_y = y;
        self.recalculate();
        Ok(())
    }

    #[must_use]
    pub fn original_x(&self) -> &[f64] {
        &self.original_x
    }

    #[must_use]
    pub fn original_y(&self) -> &[f64] {
        &self.original_y
    }

    /// Processed `(x, y)`.
    #[must_use]
    pub fn data(&self) -> (&[f64], &[f64]) {
        (&self.processed_x, &self.processed_y)
    }

    #[must_use]
    pub fn x(&self) -> &[f64] {
        &self.processed_x
    }

    #[must_use]
    pub fn y(&self) -> &[f64] {
        &self.processed_y
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.original_x.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.original_x.is_empty()
    }

    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    pub fn set_scaling(&mut self, scaling: f64) {
        self.scaling = scaling;
        self.recalculate();
    }

    #[must_use]
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
        self.recalculate();
    }

    /// Gaussian smoothing width in points; 0 disables.
    pub fn set_smoothing(&mut self, sigma: f64) {
        self.smoothing = sigma.max(0.0);
        self.recalculate();
    }

    /// Sets or clears a background pattern subtracted after interpolation
    /// onto this pattern's x axis.
    pub fn set_background_pattern(&mut self, background: Option<Pattern>) {
        self.background_pattern = background.map(Box::new);
        self.recalculate();
    }

    #[must_use]
    pub fn background_pattern(&self) -> Option<&Pattern> {
        self.background_pattern.as_deref()
    }

    /// Enables the smooth-Brückner auto background inside `roi`.
    pub fn set_auto_background_subtraction(
        &mut self,
        params: BackgroundParameters,
        roi: Option<(f64, f64)>,
    ) {
        let roi = roi.map(|(a, b)| (a.min(b), a.max(b)));
        self.auto_background = Some(AutoBackground { params, roi });
        self.recalculate();
    }

    pub fn unset_auto_background_subtraction(&mut self) {
        self.auto_background = None;
        self.recalculate();
    }

    #[must_use]
    pub fn auto_background_settings(&self) -> Option<&AutoBackground> {
        self.auto_background.as_ref()
    }

    /// Fitted auto background on the processed x axis.
    #[must_use]
    pub fn auto_background(&self) -> Option<&[f64]> {
        self.auto_background_y.as_deref()
    }

    /// Returns the points with `lo <= x <= hi` of the processed series.
    #[must_use]
    pub fn limit(&self, lo: f64, hi: f64) -> (Vec<f64>, Vec<f64>) {
        self.processed_x
            .iter()
            .zip(&self.processed_y)
            .filter(|(x, _)| **x >= lo && **x <= hi)
            .map(|(x, y)| (*x, *y))
            .unzip()
    }

    fn recalculate(&mut self) {
        let x = self.original_x.clone();
        let mut y: Vec<f64> = self
            .original_y
            .iter()
            .map(|v| v * self.scaling + self.offset)
            .collect();

        if let Some(bkg) = &self.background_pattern {
            let (bx, by) = bkg.data();
            for (yi, xi) in y.iter_mut().zip(&x) {
                *yi -= interp(*xi, bx, by);
            }
        }
        if self.smoothing > 0.0 {
            y = gaussian_filter1d(&y, self.smoothing);
        }

        self.auto_background_y = None;
        if let Some(auto) = self.auto_background {
            let (x_roi, y_roi): (Vec<f64>, Vec<f64>) = match auto.roi {
                Some((lo, hi)) => x
                    .iter()
                    .zip(&y)
                    .filter(|(xi, _)| **xi >= lo && **xi <= hi)
                    .map(|(a, b)| (*a, *b))
                    .unzip(),
                None => (x.clone(), y.clone()),
            };
            match extract_background(&x_roi, &y_roi, &auto.params) {
                Ok(bkg) => {
                    let subtracted = y_roi.iter().zip(&bkg).map(|(a, b)| a - b).collect();
                    self.processed_x = x_roi;
                    self.processed_y = subtracted;
                    self.auto_background_y = Some(bkg);
                    return;
                }
                Err(e) => log::warn!("auto background for '{}' skipped: {e}", self.name),
            }
        }
        self.processed_x = x;
        self.processed_y = y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn peaked() -> Pattern {
        let x: Vec<f64> = (0..300).map(|i| 2.0 + f64::from(i) * 0.05).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|v| 50.0 + 300.0 * (-((v - 8.0) / 0.08).powi(2)).exp())
            .collect();
        Pattern::new(x, y, "peaked").unwrap()
    }

    #[test]
    fn test_length_mismatch() {
        assert!(Pattern::new(vec![1.0, 2.0], vec![1.0], "bad").is_err());
        assert!(Pattern::default().is_empty());
    }

    #[test]
    fn test_scaling_and_offset() {
        let mut p = Pattern::new(vec![1.0, 2.0], vec![3.0, 4.0], "p").unwrap();
        p.set_scaling(2.0);
        p.set_offset(1.0);
        assert_eq!(p.y(), &[7.0, 9.0]);
        assert_eq!(p.original_y(), &[3.0, 4.0]);
    }

    #[test]
    fn test_background_pattern_interpolated() {
        let mut p = Pattern::new(vec![1.0, 2.0, 3.0], vec![10.0, 10.0, 10.0], "p").unwrap();
        let bkg = Pattern::new(vec![0.0, 4.0], vec![0.0, 4.0], "bkg").unwrap();
        p.set_background_pattern(Some(bkg));
        assert_eq!(p.y(), &[9.0, 8.0, 7.0]);
    }

    #[test]
    fn test_auto_background_idempotent_and_roi() {
        let mut p = peaked();
        let params = BackgroundParameters::default();
        p.set_auto_background_subtraction(params, Some((4.0, 12.0)));
        let first = p.y().to_vec();
        p.set_auto_background_subtraction(params, Some((4.0, 12.0)));
        assert_eq!(p.y(), first.as_slice());
        assert!(p.x().iter().all(|&x| (4.0..=12.0).contains(&x)));
        assert_eq!(p.original_x().len(), 300);
        p.unset_auto_background_subtraction();
        assert_eq!(p.x().len(), 300);
    }

    #[test]
    fn test_gaussian_preserves_constant() {
        let smoothed = gaussian_filter1d(&[3.0; 20], 2.0);
        for v in smoothed {
            assert_relative_eq!(v, 3.0, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_convert_unit_to_d_reverses() {
        let mut p = Pattern::new(vec![5.0, 10.0], vec![1.0, 2.0], "p").unwrap();
        p.convert_unit(IntegrationUnit::DSpacing, 0.4e-10).unwrap();
        assert!(p.x()[0] < p.x()[1]);
        assert_eq!(p.y(), &[2.0, 1.0]);
        assert_eq!(p.unit(), IntegrationUnit::DSpacing);
    }
}
