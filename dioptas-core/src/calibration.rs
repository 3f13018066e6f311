//! Detector geometry: the PONI parameter set, its Fit2D view and the
//! per-pixel scattering-angle lookup arrays.
#![allow(
    clippy::cast_precision_loss,
    clippy::similar_names,
    clippy::many_single_char_names
)]

use crate::error::{Error, Result};
use ndarray::Array2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Point-of-normal-incidence geometry (pyFAI convention).
///
/// Lengths in metres, angles in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoniParameters {
    /// Sample to detector distance.
    pub dist: f64,
    /// PONI coordinate along the slow (row) axis.
    pub poni1: f64,
    /// PONI coordinate along the fast (column) axis.
    pub poni2: f64,
    pub rot1: f64,
    pub rot2: f64,
    pub rot3: f64,
    /// Pixel pitch along rows.
    pub pixel1: f64,
    /// Pixel pitch along columns.
    pub pixel2: f64,
    pub wavelength: f64,
    /// Polarisation factor in [-1, 1].
    pub polarization_factor: f64,
}

impl Default for PoniParameters {
    fn default() -> Self {
        Self {
            dist: 0.2,
            poni1: 0.0,
            poni2: 0.0,
            rot1: 0.0,
            rot2: 0.0,
            rot3: 0.0,
            pixel1: 79e-6,
            pixel2: 79e-6,
            wavelength: 0.3344e-10,
            polarization_factor: 0.99,
        }
    }
}

/// The Fit2D description of the same geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Fit2dParameters {
    /// Distance along the beam to the detector plane, millimetres.
    pub direct_dist_mm: f64,
    /// Beam centre along columns, pixels.
    pub center_x: f64,
    /// Beam centre along rows, pixels.
    pub center_y: f64,
    /// Detector tilt, degrees.
    pub tilt_deg: f64,
    /// Rotation of the tilt plane, degrees.
    pub tilt_plane_rotation_deg: f64,
    /// Pixel size along columns, micrometres.
    pub pixel_x_um: f64,
    /// Pixel size along rows, micrometres.
    pub pixel_y_um: f64,
}

impl PoniParameters {
    /// Checks that the parameter set can describe a detector.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for non-positive lengths or non-finite values.
    pub fn validate(&self) -> Result<()> {
        let values = [
            self.dist,
            self.poni1,
            self.poni2,
            self.rot1,
            self.rot2,
            self.rot3,
            self.pixel1,
            self.pixel2,
            self.wavelength,
            self.polarization_factor,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidParameter(
                "PONI parameters must be finite".to_string(),
            ));
        }
        if self.dist <= 0.0 || self.pixel1 <= 0.0 || self.pixel2 <= 0.0 || self.wavelength <= 0.0
        {
            return Err(Error::InvalidParameter(
                "distance, pixel sizes and wavelength must be positive".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.polarization_factor) {
            return Err(Error::InvalidParameter(format!(
                "polarization factor {} outside [-1, 1]",
                self.polarization_factor
            )));
        }
        Ok(())
    }

    /// Laboratory coordinates of a detector position given in continuous
    /// pixel units (pixel `i` spans `[i, i + 1)`).
    ///
    /// Returns `(t1, t2, t3)` with `t3` along the beam.
    #[must_use]
    pub fn lab_position(&self, row: f64, col: f64) -> (f64, f64, f64) {
        let d1 = row * self.pixel1 - self.poni1;
        let d2 = col * self.pixel2 - self.poni2;
        self.rotate(d1, d2)
    }

    fn rotate(&self, d1: f64, d2: f64) -> (f64, f64, f64) {
        let l = self.dist;
        let (s1, c1) = self.rot1.sin_cos();
        let (s2, c2) = self.rot2.sin_cos();
        let (s3, c3) = self.rot3.sin_cos();
        let t1 = d1 * c2 * c3 + d2 * (c3 * s1 * s2 - c1 * s3) - l * (c1 * c3 * s2 + s1 * s3);
        let t2 = d1 * c2 * s3 + d2 * (c1 * c3 + s1 * s2 * s3) - l * (-(c3 * s1) + c1 * s2 * s3);
        let t3 = d1 * s2 - d2 * c2 * s1 + l * c1 * c2;
        (t1, t2, t3)
    }

    /// Scattering angle (radians) at a continuous pixel position.
    #[must_use]
    pub fn two_theta_at(&self, row: f64, col: f64) -> f64 {
        let (t1, t2, t3) = self.lab_position(row, col);
        t1.hypot(t2).atan2(t3)
    }

    /// Azimuth (radians, in (-pi, pi]) at a continuous pixel position.
    #[must_use]
    pub fn chi_at(&self, row: f64, col: f64) -> f64 {
        let (t1, t2, _) = self.lab_position(row, col);
        t1.atan2(t2)
    }

    /// Scattering angle at the centre of pixel `(row, col)`.
    #[must_use]
    pub fn two_theta_pixel(&self, row: f64, col: f64) -> f64 {
        self.two_theta_at(row + 0.5, col + 0.5)
    }

    /// Returns the same geometry with pixel pitches divided by `factor`.
    #[must_use]
    pub fn supersampled(&self, factor: usize) -> Self {
        let factor = factor.max(1) as f64;
        Self {
            pixel1: self.pixel1 / factor,
            pixel2: self.pixel2 / factor,
            ..*self
        }
    }

    /// Converts to the Fit2D view.
    #[must_use]
    pub fn to_fit2d(&self) -> Fit2dParameters {
        let cos_tilt = self.rot1.cos() * self.rot2.cos();
        let sin_tilt = (1.0 - cos_tilt * cos_tilt).max(0.0).sqrt();
        let tan_tilt = sin_tilt / cos_tilt;
        let (cos_tpr, sin_tpr) = if sin_tilt == 0.0 {
            (1.0, 0.0)
        } else {
            (
                (-self.rot2.cos() * self.rot1.sin() / sin_tilt).clamp(-1.0, 1.0),
                self.rot2.sin() / sin_tilt,
            )
        };
        let tilt_deg = cos_tilt.clamp(-1.0, 1.0).acos().to_degrees();
        let tpr = cos_tpr.acos().to_degrees();
        let tilt_plane_rotation_deg = if sin_tpr < 0.0 { -tpr } else { tpr };
        let center_x = (self.poni2 + self.dist * tan_tilt * cos_tpr) / self.pixel2;
        let center_y = if tilt_deg.abs() < 1e-5 {
            self.poni1 / self.pixel1
        } else {
            (self.poni1 + self.dist * tan_tilt * sin_tpr) / self.pixel1
        };
        Fit2dParameters {
            direct_dist_mm: 1.0e3 * self.dist / cos_tilt,
            center_x,
            center_y,
            tilt_deg,
            tilt_plane_rotation_deg,
            pixel_x_um: self.pixel2 * 1e6,
            pixel_y_um: self.pixel1 * 1e6,
        }
    }

    /// Builds a PONI set from a Fit2D description; `rot3` is zero.
    #[must_use]
    pub fn from_fit2d(fit2d: &Fit2dParameters, wavelength: f64, polarization_factor: f64) -> Self {
        let tilt = fit2d.tilt_deg.to_radians();
        let tpr = fit2d.tilt_plane_rotation_deg.to_radians();
        let (sin_tilt, cos_tilt) = tilt.sin_cos();
        let (sin_tpr, cos_tpr) = tpr.sin_cos();
        let dist = fit2d.direct_dist_mm * cos_tilt * 1e-3;
        let pixel1 = fit2d.pixel_y_um * 1e-6;
        let pixel2 = fit2d.pixel_x_um * 1e-6;
        let rot2 = (sin_tilt * sin_tpr).clamp(-1.0, 1.0).asin();
        let denom = (1.0 - sin_tpr * sin_tpr * sin_tilt * sin_tilt).sqrt();
        let mut rot1 = (cos_tilt / denom).clamp(-1.0, 1.0).acos();
        if cos_tpr * sin_tilt > 0.0 {
            rot1 = -rot1;
        }
        let tan_tilt = tilt.tan();
        Self {
            dist,
            poni1: -dist * tan_tilt * sin_tpr + pixel1 * fit2d.center_y,
            poni2: -dist * tan_tilt * cos_tpr + pixel2 * fit2d.center_x,
            rot1,
            rot2,
            rot3: 0.0,
            pixel1,
            pixel2,
            wavelength,
            polarization_factor,
        }
    }

    /// Beam centre in continuous pixel units `(row, col)`.
    #[must_use]
    pub fn beam_center(&self) -> (f64, f64) {
        let f2d = self.to_fit2d();
        (f2d.center_y, f2d.center_x)
    }

    /// Longest distance (pixels) from the beam centre to an image corner.
    #[must_use]
    pub fn max_center_corner_distance(&self, shape: (usize, usize)) -> f64 {
        let (cy, cx) = self.beam_center();
        let (rows, cols) = (shape.0 as f64, shape.1 as f64);
        [(0.0, 0.0), (0.0, cols), (rows, 0.0), (rows, cols)]
            .iter()
            .map(|&(r, c)| (r - cy).hypot(c - cx))
            .fold(0.0, f64::max)
    }
}

/// Per-pixel lookup arrays for one image shape.
#[derive(Debug, Clone)]
pub struct PixelArrays {
    /// Image shape these arrays belong to.
    pub shape: (usize, usize),
    /// 2θ at pixel centres (radians).
    pub ttha: Array2<f64>,
    /// Azimuth at pixel centres (radians).
    pub chia: Array2<f64>,
    /// 2θ at pixel corners, shape (rows + 1, cols + 1) (radians).
    pub tth_corners: Array2<f64>,
    /// Relative solid angle, 1 at the PONI.
    pub solid_angle: Array2<f64>,
}

impl PixelArrays {
    fn compute(poni: &PoniParameters, shape: (usize, usize)) -> Self {
        let (rows, cols) = shape;
        let mut ttha = Array2::zeros(shape);
        let mut chia = Array2::zeros(shape);
        let mut solid_angle = Array2::zeros(shape);
        let dist2 = poni.dist * poni.dist;
        for r in 0..rows {
            for c in 0..cols {
                let rf = r as f64 + 0.5;
                let cf = c as f64 + 0.5;
                let (t1, t2, t3) = poni.lab_position(rf, cf);
                ttha[[r, c]] = t1.hypot(t2).atan2(t3);
                chia[[r, c]] = t1.atan2(t2);
                let d1 = rf * poni.pixel1 - poni.poni1;
                let d2 = cf * poni.pixel2 - poni.poni2;
                let cos_inc = poni.dist / (dist2 + d1 * d1 + d2 * d2).sqrt();
                solid_angle[[r, c]] = cos_inc * cos_inc * cos_inc;
            }
        }
        let tth_corners = Array2::from_shape_fn((rows + 1, cols + 1), |(r, c)| {
            poni.two_theta_at(r as f64, c as f64)
        });
        Self {
            shape,
            ttha,
            chia,
            tth_corners,
            solid_angle,
        }
    }

    /// Polarisation factor per pixel (pyFAI convention), divided out of the signal.
    #[must_use]
    pub fn polarization(&self, factor: f64) -> Array2<f64> {
        let mut out = Array2::zeros(self.shape);
        ndarray::Zip::from(&mut out)
            .and(&self.ttha)
            .and(&self.chia)
            .for_each(|p, &tth, &chi| {
                let cos2 = tth.cos().powi(2);
                *p = 0.5 * (1.0 + cos2 - factor * (2.0 * chi).cos() * (1.0 - cos2));
            });
        out
    }

    /// Smallest and largest 2θ spanned by pixel `(r, c)` including its corners.
    #[must_use]
    pub fn pixel_tth_extent(&self, r: usize, c: usize) -> (f64, f64) {
        let corners = [
            self.tth_corners[[r, c]],
            self.tth_corners[[r, c + 1]],
            self.tth_corners[[r + 1, c]],
            self.tth_corners[[r + 1, c + 1]],
        ];
        let centre = self.ttha[[r, c]];
        corners
            .iter()
            .fold((centre, centre), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }
}

/// A PONI set with cached per-pixel arrays.
///
/// The cache is keyed by image shape and dropped whenever a parameter changes.
#[derive(Debug, Clone)]
pub struct Geometry {
    poni: PoniParameters,
    supersampling: usize,
    cache: Option<PixelArrays>,
}

impl PartialEq for Geometry {
    fn eq(&self, other: &Self) -> bool {
        self.poni == other.poni && self.supersampling == other.supersampling
    }
}

impl Geometry {
    /// Creates a geometry from a validated PONI set.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the set is not physical.
    pub fn new(poni: PoniParameters) -> Result<Self> {
        poni.validate()?;
        Ok(Self {
            poni,
            supersampling: 1,
            cache: None,
        })
    }

    /// The PONI set as calibrated (without supersampling).
    #[must_use]
    pub fn poni(&self) -> &PoniParameters {
        &self.poni
    }

    /// The PONI set used for integration (pixel pitches divided by the
    /// supersampling factor).
    #[must_use]
    pub fn effective_poni(&self) -> PoniParameters {
        self.poni.supersampled(self.supersampling)
    }

    /// Replaces the PONI set and invalidates the cache.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the set is not physical.
    pub fn set_poni(&mut self, poni: PoniParameters) -> Result<()> {
        poni.validate()?;
        if poni != self.poni {
            self.poni = poni;
            self.invalidate();
        }
        Ok(())
    }

    /// Sets the polarisation factor without touching the cached arrays.
    pub fn set_polarization_factor(&mut self, factor: f64) {
        self.poni.polarization_factor = factor.clamp(-1.0, 1.0);
    }

    /// Current supersampling factor.
    #[must_use]
    pub fn supersampling(&self) -> usize {
        self.supersampling
    }

    /// Sets the supersampling factor (1..=4) and invalidates the cache.
    ///
    /// # Errors
    /// Returns `InvalidParameter` outside 1..=4.
    pub fn set_supersampling(&mut self, factor: usize) -> Result<()> {
        if !(1..=4).contains(&factor) {
            return Err(Error::InvalidParameter(format!(
                "supersampling factor must be in 1..=4, got {factor}"
            )));
        }
        if factor != self.supersampling {
            self.supersampling = factor;
            self.invalidate();
        }
        Ok(())
    }

    /// Drops the cached per-pixel arrays.
    pub fn invalidate(&mut self) {
        if self.cache.take().is_some() {
            log::debug!("geometry cache invalidated");
        }
    }

    /// Returns true if arrays for `shape` are cached.
    #[must_use]
    pub fn is_cached_for(&self, shape: (usize, usize)) -> bool {
        self.cache.as_ref().is_some_and(|c| c.shape == shape)
    }

    /// Per-pixel arrays for `shape` (the already supersampled image shape),
    /// computed on first use.
    pub fn arrays(&mut self, shape: (usize, usize)) -> &PixelArrays {
        if !self.is_cached_for(shape) {
            self.cache = None;
        }
        let poni = self.effective_poni();
        self.cache.get_or_insert_with(|| {
            log::debug!("computing pixel arrays for shape {shape:?}");
            PixelArrays::compute(&poni, shape)
        })
    }

    /// 2θ array (radians) for `shape`.
    pub fn ttha(&mut self, shape: (usize, usize)) -> &Array2<f64> {
        &self.arrays(shape).ttha
    }

    /// Azimuth array (radians) for `shape`.
    pub fn chia(&mut self, shape: (usize, usize)) -> &Array2<f64> {
        &self.arrays(shape).chia
    }
}

/// Gathered ring points: pixel coordinates tagged with a calibrant ring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RingPoints {
    sets: Vec<(Vec<[f64; 2]>, usize)>,
}

impl RingPoints {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends points (row, col) belonging to `ring_index`.
    pub fn append(&mut self, points: Vec<[f64; 2]>, ring_index: usize) {
        if !points.is_empty() {
            self.sets.push((points, ring_index));
        }
    }

    /// Removes the most recently appended set.
    pub fn remove_last(&mut self) -> Option<(Vec<[f64; 2]>, usize)> {
        self.sets.pop()
    }

    /// Discards every gathered point.
    pub fn clear(&mut self) {
        self.sets.clear();
    }

    /// Number of gathered points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.iter().map(|(p, _)| p.len()).sum()
    }

    /// Returns true when no point has been gathered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Iterates over `(row, col, ring_index)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64, usize)> + '_ {
        self.sets
            .iter()
            .flat_map(|(points, ring)| points.iter().map(move |p| (p[0], p[1], *ring)))
    }

    /// The appended sets, oldest first.
    #[must_use]
    pub fn sets(&self) -> &[(Vec<[f64; 2]>, usize)] {
        &self.sets
    }

    /// Distinct ring indices that carry points.
    #[must_use]
    pub fn rings(&self) -> Vec<usize> {
        let mut rings: Vec<usize> = self.sets.iter().map(|(_, r)| *r).collect();
        rings.sort_unstable();
        rings.dedup();
        rings
    }
}

/// Working calibration: optional geometry, its name and gathered points.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    /// Stem of the file the geometry was loaded from.
    pub name: Option<String>,
    geometry: Option<Geometry>,
    /// Points gathered for refinement.
    pub ring_points: RingPoints,
}

impl Calibration {
    /// Creates an uncalibrated state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a calibration from a PONI set.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the set is not physical.
    pub fn from_poni(poni: PoniParameters, name: Option<String>) -> Result<Self> {
        Ok(Self {
            name,
            geometry: Some(Geometry::new(poni)?),
            ring_points: RingPoints::new(),
        })
    }

    /// Returns true once a valid PONI set exists.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.geometry.is_some()
    }

    /// The active geometry.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without a PONI set.
    pub fn geometry(&self) -> Result<&Geometry> {
        self.geometry.as_ref().ok_or(Error::NotCalibrated)
    }

    /// The active geometry, mutably (for cache population).
    ///
    /// # Errors
    /// Returns `NotCalibrated` without a PONI set.
    pub fn geometry_mut(&mut self) -> Result<&mut Geometry> {
        self.geometry.as_mut().ok_or(Error::NotCalibrated)
    }

    /// Installs a PONI set, keeping the supersampling factor.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the set is not physical.
    pub fn set_poni(&mut self, poni: PoniParameters, name: Option<String>) -> Result<()> {
        match &mut self.geometry {
            Some(geometry) => geometry.set_poni(poni)?,
            None => self.geometry = Some(Geometry::new(poni)?),
        }
        if name.is_some() {
            self.name = name;
        }
        Ok(())
    }

    /// PONI and Fit2D views of the active calibration.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without a PONI set.
    pub fn calibration_parameters(&self) -> Result<(PoniParameters, Fit2dParameters)> {
        let poni = *self.geometry()?.poni();
        Ok((poni, poni.to_fit2d()))
    }

    /// Sets the supersampling factor of the active geometry.
    ///
    /// # Errors
    /// Returns `NotCalibrated` or `InvalidParameter`.
    pub fn set_supersampling(&mut self, factor: usize) -> Result<()> {
        self.geometry_mut()?.set_supersampling(factor)
    }

    /// Clears gathered ring points.
    pub fn clear_peaks(&mut self) {
        self.ring_points.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn centred_poni() -> PoniParameters {
        PoniParameters {
            dist: 0.2,
            poni1: 128.0 * 100e-6,
            poni2: 128.0 * 100e-6,
            pixel1: 100e-6,
            pixel2: 100e-6,
            wavelength: 0.3344e-10,
            ..PoniParameters::default()
        }
    }

    #[test]
    fn test_two_theta_at_poni_is_zero() {
        let poni = centred_poni();
        assert!(poni.two_theta_at(128.0, 128.0).abs() < 1e-12);
        // 100 pixels away along columns: atan(0.01 / 0.2)
        let tth = poni.two_theta_at(128.0, 228.0);
        assert_relative_eq!(tth, (0.01_f64 / 0.2).atan(), max_relative = 1e-12);
    }

    #[test]
    fn test_chi_quadrants() {
        let poni = centred_poni();
        // along +columns chi = 0, along +rows chi = +/- pi/2 depending on handedness
        assert!(poni.chi_at(128.0, 200.0).abs() < 1e-12);
        assert_relative_eq!(
            poni.chi_at(200.0, 128.0).abs(),
            std::f64::consts::FRAC_PI_2,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_fit2d_round_trip() {
        let poni = PoniParameters {
            rot1: 0.02,
            rot2: -0.015,
            ..centred_poni()
        };
        let f2d = poni.to_fit2d();
        let back = PoniParameters::from_fit2d(&f2d, poni.wavelength, poni.polarization_factor);
        assert_relative_eq!(back.dist, poni.dist, max_relative = 1e-9);
        assert_relative_eq!(back.poni1, poni.poni1, max_relative = 1e-9);
        assert_relative_eq!(back.poni2, poni.poni2, max_relative = 1e-9);
        assert_relative_eq!(back.rot1, poni.rot1, max_relative = 1e-9);
        assert_relative_eq!(back.rot2, poni.rot2, max_relative = 1e-9);
    }

    #[test]
    fn test_untilted_fit2d_centre() {
        let f2d = centred_poni().to_fit2d();
        assert_relative_eq!(f2d.center_x, 128.0, max_relative = 1e-12);
        assert_relative_eq!(f2d.center_y, 128.0, max_relative = 1e-12);
        assert_relative_eq!(f2d.direct_dist_mm, 200.0, max_relative = 1e-12);
        assert!(f2d.tilt_deg.abs() < 1e-9);
    }

    #[test]
    fn test_geometry_cache_invalidation() {
        let mut geometry = Geometry::new(centred_poni()).unwrap();
        let before = geometry.ttha((16, 16))[[0, 0]];
        assert!(geometry.is_cached_for((16, 16)));
        assert!(!geometry.is_cached_for((8, 8)));

        let mut moved = centred_poni();
        moved.dist = 0.1;
        geometry.set_poni(moved).unwrap();
        assert!(!geometry.is_cached_for((16, 16)));
        let after = geometry.ttha((16, 16))[[0, 0]];
        assert!(after > before);
    }

    #[test]
    fn test_supersampling_halves_pixels() {
        let mut geometry = Geometry::new(centred_poni()).unwrap();
        let _ = geometry.arrays((4, 4));
        geometry.set_supersampling(2).unwrap();
        assert!(!geometry.is_cached_for((4, 4)));
        assert_relative_eq!(geometry.effective_poni().pixel1, 50e-6);
        assert!(geometry.set_supersampling(5).is_err());
    }

    #[test]
    fn test_solid_angle_peaks_at_poni() {
        let mut geometry = Geometry::new(centred_poni()).unwrap();
        let arrays = geometry.arrays((256, 256));
        let centre = arrays.solid_angle[[128, 128]];
        let corner = arrays.solid_angle[[0, 0]];
        assert!(centre > corner);
        assert!(centre <= 1.0);
    }

    #[test]
    fn test_uncalibrated_reports_error() {
        let calibration = Calibration::new();
        assert_eq!(calibration.geometry().unwrap_err(), Error::NotCalibrated);
        assert!(!calibration.is_calibrated());
    }

    #[test]
    fn test_ring_points() {
        let mut points = RingPoints::new();
        points.append(vec![[1.0, 2.0], [3.0, 4.0]], 0);
        points.append(vec![[5.0, 6.0]], 2);
        points.append(Vec::new(), 3);
        assert_eq!(points.len(), 3);
        assert_eq!(points.rings(), vec![0, 2]);
        assert_eq!(points.iter().last(), Some((5.0, 6.0, 2)));
        points.clear();
        assert!(points.is_empty());
    }
}
