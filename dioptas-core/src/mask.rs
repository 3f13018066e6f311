//! Boolean pixel mask with region of interest and undo history.
//!
//! `true` marks a pixel excluded from integration.
#![allow(clippy::cast_precision_loss)]

use crate::cosmic::{detect_cosmics, CosmicParameters};
use crate::error::{Error, Result};
use crate::image::supersample;
use ndarray::Array2;
use std::collections::VecDeque;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of snapshots kept for undo and for redo.
pub const HISTORY_DEPTH: usize = 50;

/// Whether shape primitives add pixels to or remove pixels from the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MaskMode {
    #[default]
    Mask,
    Unmask,
}

/// Rectangular region of interest, half-open pixel bounds.
///
/// Pixels outside the ROI are excluded from integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Roi {
    pub row_min: usize,
    pub row_max: usize,
    pub col_min: usize,
    pub col_max: usize,
}

impl Roi {
    #[must_use]
    pub fn new(row_min: usize, row_max: usize, col_min: usize, col_max: usize) -> Self {
        Self {
            row_min: row_min.min(row_max),
            row_max: row_max.max(row_min),
            col_min: col_min.min(col_max),
            col_max: col_max.max(col_min),
        }
    }

    #[must_use]
    pub fn contains(&self, row: usize, col: usize) -> bool {
        (self.row_min..self.row_max).contains(&row) && (self.col_min..self.col_max).contains(&col)
    }
}

/// Ray casting test; vertices and point are `(x, y)` = `(col, row)`.
fn point_in_polygon(x: f64, y: f64, vertices: &[(f64, f64)]) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = vertices[i];
        let (xj, yj) = vertices[j];
        let crosses =
            ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi + f64::EPSILON) + xi);
        if crosses {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Pixel mask with ROI, drawing mode and bounded undo/redo.
#[derive(Debug, Clone)]
pub struct Mask {
    field: Array2<bool>,
    roi: Option<Roi>,
    mode: MaskMode,
    undo: VecDeque<Array2<bool>>,
    redo: VecDeque<Array2<bool>>,
}

impl Default for Mask {
    fn default() -> Self {
        Self::new((0, 0))
    }
}

impl Mask {
    /// Creates an empty (nothing masked) mask.
    #[must_use]
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            field: Array2::from_elem(shape, false),
            roi: None,
            mode: MaskMode::Mask,
            undo: VecDeque::new(),
            redo: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.field.dim()
    }

    /// The painted field, without the ROI.
    #[must_use]
    pub fn field(&self) -> &Array2<bool> {
        &self.field
    }

    /// Number of painted pixels.
    #[must_use]
    pub fn masked_count(&self) -> usize {
        self.field.iter().filter(|&&m| m).count()
    }

    #[must_use]
    pub fn mode(&self) -> MaskMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: MaskMode) {
        self.mode = mode;
    }

    /// Adapts to a new image shape. A different shape resets the field and
    /// the history; returns true in that case.
    pub fn set_dimension(&mut self, shape: (usize, usize)) -> bool {
        if self.field.dim() == shape {
            return false;
        }
        self.field = Array2::from_elem(shape, false);
        self.undo.clear();
        self.redo.clear();
        if let Some(roi) = self.roi {
            if roi.row_max > shape.0 || roi.col_max > shape.1 {
                self.roi = None;
            }
        }
        true
    }

    /// Replaces the field, e.g. from a loaded file.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the field differs from the current shape.
    pub fn set_field(&mut self, field: Array2<bool>) -> Result<()> {
        if field.dim() != self.field.dim() {
            return Err(Error::shape_mismatch(self.field.dim(), field.dim()));
        }
        self.update_deque();
        self.field = field;
        Ok(())
    }

    /// Records the current field for undo and forgets the redo history.
    fn update_deque(&mut self) {
        self.undo.push_back(self.field.clone());
        if self.undo.len() > HISTORY_DEPTH {
            self.undo.pop_front();
        }
        self.redo.clear();
    }

    /// Restores the previous field. Returns false if nothing to undo.
    pub fn undo(&mut self) -> bool {
        let Some(previous) = self.undo.pop_back() else {
            return false;
        };
        self.redo
            .push_back(std::mem::replace(&mut self.field, previous));
        if self.redo.len() > HISTORY_DEPTH {
            self.redo.pop_front();
        }
        true
    }

    /// Re-applies an undone change. Returns false if nothing to redo.
    pub fn redo(&mut self) -> bool {
        let Some(next) = self.redo.pop_back() else {
            return false;
        };
        self.undo.push_back(std::mem::replace(&mut self.field, next));
        if self.undo.len() > HISTORY_DEPTH {
            self.undo.pop_front();
        }
        true
    }

    fn check_image(&self, image: &Array2<f64>) -> Result<()> {
        if image.dim() == self.field.dim() {
            Ok(())
        } else {
            Err(Error::shape_mismatch(self.field.dim(), image.dim()))
        }
    }

    /// Masks every pixel with intensity below `threshold`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the image differs from the mask.
    pub fn mask_below_threshold(&mut self, image: &Array2<f64>, threshold: f64) -> Result<()> {
        self.check_image(image)?;
        self.update_deque();
        self.field
            .zip_mut_with(image, |m, &v| *m |= v < threshold);
        Ok(())
    }

    /// Masks every pixel with intensity above `threshold`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the image differs from the mask.
    pub fn mask_above_threshold(&mut self, image: &Array2<f64>, threshold: f64) -> Result<()> {
        self.check_image(image)?;
        self.update_deque();
        self.field
            .zip_mut_with(image, |m, &v| *m |= v > threshold);
        Ok(())
    }

    /// Applies the drawing mode to every pixel whose centre satisfies `inside`.
    fn paint<F: Fn(f64, f64) -> bool>(&mut self, inside: F) {
        self.update_deque();
        let value = self.mode == MaskMode::Mask;
        for ((r, c), m) in self.field.indexed_iter_mut() {
            if inside(c as f64 + 0.5, r as f64 + 0.5) {
                *m = value;
            }
        }
    }

    /// Rasterises a polygon given as `(x, y)` = `(col, row)` vertices.
    pub fn mask_polygon(&mut self, vertices: &[(f64, f64)]) {
        self.paint(|x, y| point_in_polygon(x, y, vertices));
    }

    /// Rasterises an axis-aligned rectangle with corner `(x, y)`; negative
    /// extents are allowed.
    pub fn mask_rectangle(&mut self, x: f64, y: f64, width: f64, height: f64) {
        let (x0, x1) = (x.min(x + width), x.max(x + width));
        let (y0, y1) = (y.min(y + height), y.max(y + height));
        self.paint(|px, py| px >= x0 && px <= x1 && py >= y0 && py <= y1);
    }

    /// Rasterises an ellipse centred at `(cx, cy)` with semi-axes `rx`, `ry`.
    pub fn mask_ellipse(&mut self, cx: f64, cy: f64, rx: f64, ry: f64) {
        if rx <= 0.0 || ry <= 0.0 {
            return;
        }
        self.paint(|px, py| {
            let dx = (px - cx) / rx;
            let dy = (py - cy) / ry;
            dx * dx + dy * dy <= 1.0
        });
    }

    pub fn invert(&mut self) {
        self.update_deque();
        self.field.mapv_inplace(|m| !m);
    }

    pub fn clear(&mut self) {
        self.update_deque();
        self.field.fill(false);
    }

    /// 4-neighbour dilation.
    pub fn grow(&mut self) {
        self.update_deque();
        self.field = self.neighbour_op(true);
    }

    /// 4-neighbour erosion.
    pub fn shrink(&mut self) {
        self.update_deque();
        self.field = self.neighbour_op(false);
    }

    fn neighbour_op(&self, dilate: bool) -> Array2<bool> {
        let (rows, cols) = self.field.dim();
        let f = &self.field;
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let mut neighbours = [f[[r, c]]; 4];
            if r > 0 {
                neighbours[0] = f[[r - 1, c]];
            }
            if r + 1 < rows {
                neighbours[1] = f[[r + 1, c]];
            }
            if c > 0 {
                neighbours[2] = f[[r, c - 1]];
            }
            if c + 1 < cols {
                neighbours[3] = f[[r, c + 1]];
            }
            if dilate {
                f[[r, c]] || neighbours.iter().any(|&n| n)
            } else {
                f[[r, c]] && neighbours.iter().all(|&n| n)
            }
        })
    }

    /// Detects cosmic-ray hits in `image` and masks them.
    ///
    /// Returns the number of newly masked pixels.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the image differs from the mask.
    pub fn remove_cosmic(&mut self, image: &Array2<f64>, params: &CosmicParameters) -> Result<usize> {
        self.check_image(image)?;
        let hits = detect_cosmics(image, params);
        self.update_deque();
        let mut added = 0;
        self.field.zip_mut_with(&hits, |m, &h| {
            if h && !*m {
                added += 1;
                *m = true;
            }
        });
        log::info!("cosmic removal masked {added} pixel(s)");
        Ok(added)
    }

    #[must_use]
    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    /// Sets the ROI; the painted field is untouched.
    pub fn set_roi(&mut self, roi: Roi) {
        self.roi = Some(roi);
    }

    pub fn clear_roi(&mut self) {
        self.roi = None;
    }

    /// Painted field combined with the ROI exterior.
    #[must_use]
    pub fn effective(&self) -> Array2<bool> {
        match self.roi {
            None => self.field.clone(),
            Some(roi) => {
                let mut out = self.field.clone();
                for ((r, c), m) in out.indexed_iter_mut() {
                    *m |= !roi.contains(r, c);
                }
                out
            }
        }
    }

    /// Effective mask upsampled by nearest neighbour for supersampling.
    #[must_use]
    pub fn effective_supersampled(&self, factor: usize) -> Array2<bool> {
        supersample(self.effective().view(), factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Array2<f64> {
        Array2::from_shape_fn((6, 6), |(r, c)| (r * 6 + c) as f64)
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let mut mask = Mask::new((6, 6));
        let initial = mask.field().clone();
        mask.mask_above_threshold(&ramp(), 30.0).unwrap();
        mask.mask_rectangle(0.0, 0.0, 2.0, 2.0);
        mask.grow();
        mask.invert();
        let after = mask.field().clone();

        for _ in 0..4 {
            assert!(mask.undo());
        }
        assert!(!mask.undo());
        assert_eq!(mask.field(), &initial);
        for _ in 0..4 {
            assert!(mask.redo());
        }
        assert!(!mask.redo());
        assert_eq!(mask.field(), &after);
    }

    #[test]
    fn test_history_depth_is_bounded() {
        let mut mask = Mask::new((2, 2));
        for _ in 0..(HISTORY_DEPTH + 10) {
            mask.invert();
        }
        let mut undone = 0;
        while mask.undo() {
            undone += 1;
        }
        assert_eq!(undone, HISTORY_DEPTH);
    }

    #[test]
    fn test_new_operation_clears_redo() {
        let mut mask = Mask::new((3, 3));
        mask.invert();
        mask.undo();
        mask.clear();
        assert!(!mask.redo());
    }

    #[test]
    fn test_thresholds_and_shape_check() {
        let mut mask = Mask::new((6, 6));
        mask.mask_below_threshold(&ramp(), 3.0).unwrap();
        assert_eq!(mask.masked_count(), 3);
        let err = mask.mask_above_threshold(&Array2::zeros((2, 2)), 1.0);
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_shapes_and_unmask_mode() {
        let mut mask = Mask::new((10, 10));
        mask.mask_ellipse(5.0, 5.0, 2.0, 2.0);
        assert!(mask.field()[[4, 4]]);
        assert!(!mask.field()[[0, 0]]);
        mask.set_mode(MaskMode::Unmask);
        mask.mask_polygon(&[(3.0, 3.0), (7.0, 3.0), (7.0, 7.0), (3.0, 7.0)]);
        assert_eq!(mask.masked_count(), 0);
    }

    #[test]
    fn test_grow_shrink() {
        let mut mask = Mask::new((5, 5));
        mask.mask_rectangle(2.0, 2.0, 1.0, 1.0);
        assert_eq!(mask.masked_count(), 1);
        mask.grow();
        assert_eq!(mask.masked_count(), 5);
        mask.shrink();
        assert_eq!(mask.masked_count(), 1);
    }

    #[test]
    fn test_roi_is_independent_of_paint() {
        let mut mask = Mask::new((4, 4));
        mask.set_roi(Roi::new(1, 3, 1, 3));
        assert_eq!(mask.masked_count(), 0);
        let effective = mask.effective();
        assert_eq!(effective.iter().filter(|&&m| m).count(), 12);
        assert_eq!(mask.effective_supersampled(2).dim(), (8, 8));
        mask.clear_roi();
        assert!(mask.effective().iter().all(|&m| !m));
    }

    #[test]
    fn test_set_dimension_resets() {
        let mut mask = Mask::new((4, 4));
        mask.invert();
        assert!(!mask.set_dimension((4, 4)));
        assert!(mask.set_dimension((8, 4)));
        assert_eq!(mask.masked_count(), 0);
        assert!(!mask.undo());
    }
}
