//! Per-pixel correction fields applied before integration.
//!
//! Every field is an attenuation-like factor; the integrator divides the
//! image by the composite (elementwise product) of all active fields.
#![allow(clippy::cast_precision_loss)]

use crate::calibration::PixelArrays;
use crate::error::{Error, Result};
use nalgebra::{Rotation3, Vector3};
use ndarray::{Array2, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Parameters of the cBN seat and diamond absorption correction.
///
/// Lengths in millimetres, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CbnParameters {
    pub diamond_thickness: f64,
    pub seat_thickness: f64,
    pub inner_seat_radius: f64,
    pub outer_seat_radius: f64,
    pub cell_tilt: f64,
    pub tilt_rotation: f64,
    pub center_offset: f64,
    pub center_offset_angle: f64,
    pub diamond_absorption_length: f64,
    pub seat_absorption_length: f64,
}

impl Default for CbnParameters {
    fn default() -> Self {
        Self {
            diamond_thickness: 2.2,
            seat_thickness: 5.3,
            inner_seat_radius: 0.4,
            outer_seat_radius: 1.95,
            cell_tilt: 0.0,
            tilt_rotation: 0.0,
            center_offset: 0.0,
            center_offset_angle: 0.0,
            diamond_absorption_length: 13.7,
            seat_absorption_length: 14.05,
        }
    }
}

impl CbnParameters {
    fn validate(&self) -> Result<()> {
        let positive = [
            self.diamond_thickness,
            self.seat_thickness,
            self.inner_seat_radius,
            self.outer_seat_radius,
            self.diamond_absorption_length,
            self.seat_absorption_length,
        ];
        if positive.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(Error::InvalidParameter(
                "cBN lengths must be positive".to_string(),
            ));
        }
        if self.outer_seat_radius <= self.inner_seat_radius {
            return Err(Error::InvalidParameter(
                "outer seat radius must exceed the inner radius".to_string(),
            ));
        }
        Ok(())
    }

    /// Seat radius seen at azimuth `chi` (radians) for a displaced cell.
    fn radius_at(&self, r0: f64, chi: f64) -> f64 {
        if self.center_offset == 0.0 {
            return r0;
        }
        let off = self.center_offset;
        let angle = chi - self.center_offset_angle.to_radians() + std::f64::consts::PI;
        (r0 * r0 + off * off - 2.0 * r0 * off * angle.cos())
            .max(0.0)
            .sqrt()
    }

    /// Path length (mm) through the seat for a ray at angle `tau` to the cell axis.
    fn seat_path(&self, tau: f64, chi: f64) -> f64 {
        let d = self.diamond_thickness;
        let s = self.seat_thickness;
        let r_in = self.radius_at(self.inner_seat_radius, chi);
        let r_out = self.radius_at(self.outer_seat_radius, chi);
        let tau1 = (r_in / d).atan();
        let tau2 = (r_out / (d + s)).atan();
        if tau <= tau1 {
            return 0.0;
        }
        if tau >= tau2 {
            return s / tau.cos();
        }
        // conic region: the ray leaves the seat through the frustum wall
        let k = (r_out - r_in) / s;
        let denom = tau.tan() - k;
        if denom.abs() < f64::EPSILON {
            return s / tau.cos();
        }
        let z_exit = ((r_in - d * k) / denom).clamp(d, d + s);
        (z_exit - d) / tau.cos()
    }
}

/// Parameters of the oblique-incidence detector absorption correction.
///
/// Tilt and rotation are the Fit2D detector tilt and tilt-plane rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OiadacParameters {
    /// Sensor thickness, millimetres.
    pub detector_thickness: f64,
    /// Sensor absorption length, millimetres.
    pub absorption_length: f64,
    /// Degrees.
    pub tilt: f64,
    /// Degrees.
    pub rotation: f64,
}

impl Default for OiadacParameters {
    fn default() -> Self {
        Self {
            detector_thickness: 40.0,
            absorption_length: 465.5,
            tilt: 0.0,
            rotation: 0.0,
        }
    }
}

/// Unit vector of an axis starting along the beam, tilted by `tilt` around y
/// and then rotated by `rotation` around the beam (both degrees).
fn tilted_axis(tilt: f64, rotation: f64) -> Vector3<f64> {
    let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), rotation.to_radians());
    let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), tilt.to_radians());
    rx * ry * Vector3::x()
}

/// Angle between `axis` and the scattered ray at (2θ, χ), radians.
fn incidence_angle(axis: &Vector3<f64>, tth: f64, chi: f64) -> f64 {
    let (sin_t, cos_t) = tth.sin_cos();
    let (sin_c, cos_c) = chi.sin_cos();
    let ray = Vector3::new(cos_t, cos_c * sin_t, sin_c * sin_t);
    axis.dot(&ray).clamp(-1.0, 1.0).acos()
}

/// A correction described by its parameters, evaluated to a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    /// Diamond and cBN seat absorption of a diamond-anvil cell.
    Cbn(CbnParameters),
    /// Oblique-incidence detector absorption.
    Oiadac(OiadacParameters),
    /// Detector transfer function, `response / original`.
    Transfer {
        original: Array2<f64>,
        response: Array2<f64>,
    },
}

impl Correction {
    /// Short name used as the key in a [`CorrectionManager`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Correction::Cbn(_) => "cbn",
            Correction::Oiadac(_) => "oiadac",
            Correction::Transfer { .. } => "transfer",
        }
    }

    /// Evaluates the correction for the given per-pixel arrays.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for unphysical parameters and
    /// `ShapeMismatch` when transfer images disagree with the pixel arrays.
    pub fn evaluate(&self, arrays: &PixelArrays) -> Result<Array2<f64>> {
        match self {
            Correction::Cbn(params) => cbn_field(params, arrays),
            Correction::Oiadac(params) => oiadac_field(params, arrays),
            Correction::Transfer { original, response } => {
                let field = transfer_field(original, response)?;
                if field.dim() != arrays.shape {
                    return Err(Error::shape_mismatch(arrays.shape, field.dim()));
                }
                Ok(field)
            }
        }
    }
}

fn cbn_field(params: &CbnParameters, arrays: &PixelArrays) -> Result<Array2<f64>> {
    params.validate()?;
    let axis = tilted_axis(params.cell_tilt, params.tilt_rotation);
    let mut field = Array2::zeros(arrays.shape);
    Zip::from(&mut field)
        .and(&arrays.ttha)
        .and(&arrays.chia)
        .for_each(|out, &tth, &chi| {
            let tau = incidence_angle(&axis, tth, chi);
            let cos_tau = tau.cos();
            if cos_tau <= 0.0 {
                *out = 1.0;
                return;
            }
            let diamond = (-(params.diamond_thickness / cos_tau)
                / params.diamond_absorption_length)
                .exp();
            let seat = (-params.seat_path(tau, chi) / params.seat_absorption_length).exp();
            *out = diamond * seat;
        });
    Ok(field)
}

fn oiadac_field(params: &OiadacParameters, arrays: &PixelArrays) -> Result<Array2<f64>> {
    if params.detector_thickness <= 0.0 || params.absorption_length <= 0.0 {
        return Err(Error::InvalidParameter(
            "detector thickness and absorption length must be positive".to_string(),
        ));
    }
    let normal = tilted_axis(params.tilt, params.rotation);
    let mu = params.absorption_length;
    let norm = 1.0 - (-params.detector_thickness / mu).exp();
    let mut field = Array2::zeros(arrays.shape);
    Zip::from(&mut field)
        .and(&arrays.ttha)
        .and(&arrays.chia)
        .for_each(|out, &tth, &chi| {
            let cos_inc = incidence_angle(&normal, tth, chi).cos();
            *out = if cos_inc > 0.0 {
                let path = params.detector_thickness / cos_inc;
                (1.0 - (-path / mu).exp()) / norm
            } else {
                1.0
            };
        });
    Ok(field)
}

/// Computes `response / original`, with `0/0` mapped to 1.
///
/// # Errors
/// Returns `ShapeMismatch` if the two images differ in shape.
pub fn transfer_field(original: &Array2<f64>, response: &Array2<f64>) -> Result<Array2<f64>> {
    if original.dim() != response.dim() {
        return Err(Error::shape_mismatch(original.dim(), response.dim()));
    }
    let mut field = Array2::zeros(original.dim());
    Zip::from(&mut field)
        .and(original)
        .and(response)
        .for_each(|out, &o, &r| {
            let ratio = r / o;
            *out = if ratio.is_finite() { ratio } else { 1.0 };
        });
    Ok(field)
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    field: Array2<f64>,
    source: Option<(Correction, u64)>,
}

/// Cheap identity of the pixel arrays a correction was evaluated on.
fn fingerprint(arrays: &PixelArrays) -> u64 {
    let mut h = (arrays.shape.0 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ arrays.shape.1 as u64;
    for v in arrays.ttha.iter().chain(arrays.chia.iter()).step_by(7) {
        h = h.rotate_left(5) ^ v.to_bits();
        h = h.wrapping_mul(0x0100_0000_01B3);
    }
    h
}

/// Ordered collection of named correction fields sharing one image shape.
#[derive(Debug, Clone, Default)]
pub struct CorrectionManager {
    shape: Option<(usize, usize)>,
    entries: Vec<Entry>,
}

impl CorrectionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The shape every field must have, once known.
    #[must_use]
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.shape
    }

    /// Sets the active image shape; a different shape clears every field.
    ///
    /// Returns true when fields were discarded.
    pub fn set_shape(&mut self, shape: (usize, usize)) -> bool {
        if self.shape == Some(shape) {
            return false;
        }
        self.shape = Some(shape);
        if self.entries.is_empty() {
            return false;
        }
        log::warn!(
            "image shape changed to {shape:?}; discarding {} correction(s)",
            self.entries.len()
        );
        self.entries.clear();
        true
    }

    /// Adds or replaces a named field.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the field does not match the active shape.
    pub fn add(&mut self, name: &str, field: Array2<f64>) -> Result<()> {
        self.insert(name, field, None)
    }

    /// Evaluates and stores a correction under its own name.
    ///
    /// Returns false when an identical correction on identical arrays is
    /// already stored and nothing was recomputed.
    ///
    /// # Errors
    /// Propagates evaluation errors and `ShapeMismatch`.
    pub fn add_correction(&mut self, correction: Correction, arrays: &PixelArrays) -> Result<bool> {
        let name = correction.name();
        let key = fingerprint(arrays);
        let unchanged = self.entries.iter().any(|e| {
            e.name == name && e.source.as_ref().is_some_and(|(c, k)| *k == key && *c == correction)
        });
        if unchanged {
            return Ok(false);
        }
        let field = correction.evaluate(arrays)?;
        self.insert(name, field, Some((correction, key)))?;
        Ok(true)
    }

    fn insert(
        &mut self,
        name: &str,
        field: Array2<f64>,
        source: Option<(Correction, u64)>,
    ) -> Result<()> {
        match self.shape {
            Some(shape) if shape != field.dim() => {
                return Err(Error::shape_mismatch(shape, field.dim()));
            }
            Some(_) => {}
            None => self.shape = Some(field.dim()),
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.field = field;
            entry.source = source;
        } else {
            self.entries.push(Entry {
                name: name.to_string(),
                field,
                source,
            });
        }
        Ok(())
    }

    /// Returns a field by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Array2<f64>> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.field)
    }

    /// Removes a field by name.
    pub fn remove(&mut self, name: &str) -> Option<Array2<f64>> {
        let pos = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(pos).field)
    }

    /// Removes every field; the shape is kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Elementwise product of every field, or `None` when empty.
    #[must_use]
    pub fn composite(&self) -> Option<Array2<f64>> {
        let mut iter = self.entries.iter();
        let first = iter.next()?.field.clone();
        Some(iter.fold(first, |acc, e| acc * &e.field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Geometry, PoniParameters};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn arrays(shape: (usize, usize)) -> PixelArrays {
        let poni = PoniParameters {
            dist: 0.1,
            poni1: shape.0 as f64 * 0.5 * 172e-6,
            poni2: shape.1 as f64 * 0.5 * 172e-6,
            pixel1: 172e-6,
            pixel2: 172e-6,
            ..PoniParameters::default()
        };
        Geometry::new(poni).unwrap().arrays(shape).clone()
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut manager = CorrectionManager::new();
        manager.add("a", Array2::ones((4, 4))).unwrap();
        let err = manager.add("b", Array2::ones((3, 4))).unwrap_err();
        assert_eq!(err, Error::shape_mismatch((4, 4), (3, 4)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_composite_commutes() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let b = array![[0.5, 0.25], [2.0, 1.0]];
        let mut ab = CorrectionManager::new();
        ab.add("a", a.clone()).unwrap();
        ab.add("b", b.clone()).unwrap();
        let mut ba = CorrectionManager::new();
        ba.add("b", b).unwrap();
        ba.add("a", a).unwrap();
        assert_eq!(ab.composite(), ba.composite());
        assert!(CorrectionManager::new().composite().is_none());
    }

    #[test]
    fn test_set_shape_clears_on_change() {
        let mut manager = CorrectionManager::new();
        manager.add("a", Array2::ones((2, 2))).unwrap();
        assert!(!manager.set_shape((2, 2)));
        assert!(manager.set_shape((3, 3)));
        assert!(manager.is_empty());
        manager.add("a", Array2::ones((3, 3))).unwrap();
        assert_eq!(manager.remove("a").map(|f| f.dim()), Some((3, 3)));
    }

    #[test]
    fn test_transfer_zero_over_zero_is_identity() {
        let original = array![[0.0, 2.0], [4.0, 1.0]];
        let response = array![[0.0, 1.0], [8.0, 1.0]];
        let field = transfer_field(&original, &response).unwrap();
        assert_eq!(field, array![[1.0, 0.5], [2.0, 1.0]]);
    }

    #[test]
    fn test_cbn_attenuates_and_is_bounded() {
        let arrays = arrays((64, 64));
        let field = Correction::Cbn(CbnParameters::default())
            .evaluate(&arrays)
            .unwrap();
        assert!(field.iter().all(|&v| v > 0.0 && v <= 1.0));
        // at the beam centre only the diamond attenuates
        let expected = (-2.2_f64 / 13.7).exp();
        assert_relative_eq!(field[[32, 32]], expected, max_relative = 1e-3);
    }

    #[test]
    fn test_cbn_structural_equality_skips_recompute() {
        let arrays = arrays((16, 16));
        let mut manager = CorrectionManager::new();
        let cbn = Correction::Cbn(CbnParameters::default());
        assert!(manager.add_correction(cbn.clone(), &arrays).unwrap());
        assert!(!manager.add_correction(cbn, &arrays).unwrap());
        let changed = Correction::Cbn(CbnParameters {
            seat_thickness: 4.0,
            ..CbnParameters::default()
        });
        assert!(manager.add_correction(changed, &arrays).unwrap());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_oiadac_unity_at_normal_incidence() {
        let arrays = arrays((32, 32));
        let field = Correction::Oiadac(OiadacParameters::default())
            .evaluate(&arrays)
            .unwrap();
        assert_relative_eq!(field[[16, 16]], 1.0, max_relative = 1e-3);
        assert!(field[[0, 0]] > field[[16, 16]]);
    }
}
