//! Image frames and their orientation log.
//!
//! The orientation record is the authoritative history of geometric
//! transformations applied since load: replaying it on the raw pixels
//! reproduces the displayed array exactly.
#![allow(clippy::cast_precision_loss)]

use crate::error::{Error, Result};
use ndarray::{s, Array2, ArrayView2};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A geometric transformation of the pixel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Orientation {
    /// Rotate by 90 degrees clockwise.
    RotateCw,
    /// Rotate by 90 degrees counter-clockwise.
    RotateCcw,
    /// Mirror left/right.
    FlipHorizontal,
    /// Mirror top/bottom.
    FlipVertical,
}

impl Orientation {
    /// Applies this transformation to an array.
    #[must_use]
    pub fn apply<T: Clone>(self, data: ArrayView2<'_, T>) -> Array2<T> {
        match self {
            // (r, c) -> (c, H-1-r)
            Orientation::RotateCw => data.t().slice(s![.., ..;-1]).to_owned(),
            // (r, c) -> (W-1-c, r)
            Orientation::RotateCcw => data.t().slice(s![..;-1, ..]).to_owned(),
            Orientation::FlipHorizontal => data.slice(s![.., ..;-1]).to_owned(),
            Orientation::FlipVertical => data.slice(s![..;-1, ..]).to_owned(),
        }
    }
}

/// Replays an orientation record on raw data.
#[must_use]
pub fn replay<T: Clone>(ops: &[Orientation], raw: ArrayView2<'_, T>) -> Array2<T> {
    let mut current = raw.to_owned();
    for op in ops {
        current = op.apply(current.view());
    }
    current
}

/// Replicates each pixel into an `s x s` block (nearest-neighbour upsampling).
#[must_use]
pub fn supersample<T: Clone>(data: ArrayView2<'_, T>, factor: usize) -> Array2<T> {
    let factor = factor.max(1);
    if factor == 1 {
        return data.to_owned();
    }
    let (rows, cols) = data.dim();
    Array2::from_shape_fn((rows * factor, cols * factor), |(r, c)| {
        data[[r / factor, c / factor]].clone()
    })
}

/// Identity of a frame: source path plus optional index inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FrameId {
    pub path: PathBuf,
    pub frame_index: Option<usize>,
}

impl FrameId {
    /// Creates an identifier for a single-frame file.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            frame_index: None,
        }
    }

    /// Creates an identifier for a frame inside a multi-frame container.
    pub fn with_frame<P: AsRef<Path>>(path: P, frame_index: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            frame_index: Some(frame_index),
        }
    }
}

/// Background image subtracted from the displayed data.
#[derive(Debug, Clone)]
struct BackgroundImage {
    raw: Array2<f64>,
    scaling: f64,
    offset: f64,
}

/// A 2D detector image with its orientation log and metadata.
#[derive(Debug, Clone)]
pub struct ImageFrame {
    raw: Array2<f64>,
    data: Array2<f64>,
    orientation: Vec<Orientation>,
    background: Option<BackgroundImage>,
    /// Where the frame came from.
    pub id: FrameId,
    /// Free-form per-file metadata.
    pub file_info: BTreeMap<String, String>,
    /// Motor positions recorded with the frame.
    pub motors_info: BTreeMap<String, f64>,
    /// Number of frames in the source container.
    pub series_max: usize,
}

impl Default for ImageFrame {
    fn default() -> Self {
        Self::new(Array2::zeros((0, 0)), FrameId::default())
    }
}

impl ImageFrame {
    /// Wraps freshly loaded raw data.
    #[must_use]
    pub fn new(raw: Array2<f64>, id: FrameId) -> Self {
        Self {
            data: raw.clone(),
            raw,
            orientation: Vec::new(),
            background: None,
            id,
            file_info: BTreeMap::new(),
            motors_info: BTreeMap::new(),
            series_max: 1,
        }
    }

    /// Shape of the oriented image (rows, columns).
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Returns true when the frame holds no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The oriented image, before background subtraction.
    #[must_use]
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// The raw pixels as loaded.
    #[must_use]
    pub fn raw(&self) -> &Array2<f64> {
        &self.raw
    }

    /// The orientation record, oldest first.
    #[must_use]
    pub fn orientation(&self) -> &[Orientation] {
        &self.orientation
    }

    /// Replaces the pixel data, replaying the current orientation record.
    ///
    /// Used when the next frame of a series is loaded: the transformations
    /// chosen by the user persist across frames.
    pub fn replace_raw(&mut self, raw: Array2<f64>, id: FrameId) {
        self.data = replay(&self.orientation, raw.view());
        self.raw = raw;
        self.id = id;
    }

    /// Applies and records an orientation operation.
    pub fn transform(&mut self, op: Orientation) {
        self.data = op.apply(self.data.view());
        self.orientation.push(op);
    }

    /// Rotates the image 90 degrees clockwise.
    pub fn rotate_cw(&mut self) {
        self.transform(Orientation::RotateCw);
    }

    /// Rotates the image 90 degrees counter-clockwise.
    pub fn rotate_ccw(&mut self) {
        self.transform(Orientation::RotateCcw);
    }

    /// Mirrors the image left/right.
    pub fn flip_horizontal(&mut self) {
        self.transform(Orientation::FlipHorizontal);
    }

    /// Mirrors the image top/bottom.
    pub fn flip_vertical(&mut self) {
        self.transform(Orientation::FlipVertical);
    }

    /// Drops the orientation record and restores the raw pixels.
    pub fn reset_transformations(&mut self) {
        self.orientation.clear();
        self.data = self.raw.clone();
    }

    /// Orients an external image (background, transfer reference) the same way
    /// as this frame.
    #[must_use]
    pub fn orient_like(&self, raw: ArrayView2<'_, f64>) -> Array2<f64> {
        replay(&self.orientation, raw)
    }

    /// Sets a background image, given in raw (loaded) orientation.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the background does not match the raw image.
    pub fn set_background_image(
        &mut self,
        raw: Array2<f64>,
        scaling: f64,
        offset: f64,
    ) -> Result<()> {
        if raw.dim() != self.raw.dim() {
            return Err(Error::shape_mismatch(self.raw.dim(), raw.dim()));
        }
        self.background = Some(BackgroundImage {
            raw,
            scaling,
            offset,
        });
        Ok(())
    }

    /// Updates background scaling and offset; no-op without a background.
    pub fn set_background_scaling(&mut self, scaling: f64, offset: f64) {
        if let Some(bkg) = &mut self.background {
            bkg.scaling = scaling;
            bkg.offset = offset;
        }
    }

    /// Removes the background image.
    pub fn reset_background(&mut self) {
        self.background = None;
    }

    /// Returns true when a background image is active.
    #[must_use]
    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    /// The image handed to integration: oriented data minus scaled background.
    ///
    /// A background whose shape no longer matches the raw image is ignored.
    #[must_use]
    pub fn img_data(&self) -> Array2<f64> {
        match &self.background {
            Some(bkg) if bkg.raw.dim() == self.raw.dim() => {
                let oriented = replay(&self.orientation, bkg.raw.view());
                &self.data - &(oriented * bkg.scaling + bkg.offset)
            }
            _ => self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Array2<f64> {
        array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]
    }

    #[test]
    fn test_rotations() {
        let img = sample();
        let cw = Orientation::RotateCw.apply(img.view());
        assert_eq!(cw, array![[4.0, 1.0], [5.0, 2.0], [6.0, 3.0]]);
        let ccw = Orientation::RotateCcw.apply(img.view());
        assert_eq!(ccw, array![[3.0, 6.0], [2.0, 5.0], [1.0, 4.0]]);
        let back = Orientation::RotateCcw.apply(cw.view());
        assert_eq!(back, img);
    }

    #[test]
    fn test_flips() {
        let img = sample();
        assert_eq!(
            Orientation::FlipHorizontal.apply(img.view()),
            array![[3.0, 2.0, 1.0], [6.0, 5.0, 4.0]]
        );
        assert_eq!(
            Orientation::FlipVertical.apply(img.view()),
            array![[4.0, 5.0, 6.0], [1.0, 2.0, 3.0]]
        );
    }

    #[test]
    fn test_orientation_replay_reproduces_image() {
        let sequences: Vec<Vec<Orientation>> = vec![
            vec![],
            vec![Orientation::RotateCw],
            vec![Orientation::RotateCw, Orientation::FlipVertical],
            vec![
                Orientation::FlipHorizontal,
                Orientation::RotateCcw,
                Orientation::RotateCcw,
                Orientation::FlipVertical,
                Orientation::RotateCw,
            ],
        ];
        for ops in sequences {
            let mut frame = ImageFrame::new(sample(), FrameId::new("a.tif"));
            for &op in &ops {
                frame.transform(op);
            }
            assert_eq!(replay(frame.orientation(), frame.raw().view()), *frame.data());
        }
    }

    #[test]
    fn test_replace_raw_keeps_orientation() {
        let mut frame = ImageFrame::new(sample(), FrameId::new("a.tif"));
        frame.rotate_cw();
        frame.replace_raw(sample() * 2.0, FrameId::with_frame("a.h5", 1));
        assert_eq!(frame.shape(), (3, 2));
        assert_eq!(frame.data()[[0, 0]], 8.0);
        assert_eq!(frame.id.frame_index, Some(1));
        frame.reset_transformations();
        assert_eq!(frame.shape(), (2, 3));
    }

    #[test]
    fn test_background_subtraction() {
        let mut frame = ImageFrame::new(sample(), FrameId::new("a.tif"));
        frame
            .set_background_image(Array2::ones((2, 3)), 2.0, 0.5)
            .unwrap();
        frame.flip_horizontal();
        let img = frame.img_data();
        assert_eq!(img[[0, 0]], 3.0 - 2.5);
        assert!(frame
            .set_background_image(Array2::ones((3, 3)), 1.0, 0.0)
            .is_err());
    }

    #[test]
    fn test_supersample() {
        let up = supersample(sample().view(), 2);
        assert_eq!(up.dim(), (4, 6));
        assert_eq!(up[[3, 5]], 6.0);
        assert_eq!(up[[1, 1]], 1.0);
    }
}
