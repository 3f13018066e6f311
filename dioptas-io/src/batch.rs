//! Batch integration of many frames sharing one calibration.
//!
//! The inventory maps a flat frame index onto `(file_index, frame_in_file)`:
//! `file_map` holds the prefix sums of the per-file frame counts and
//! `pos_map_all` lists every position in ascending flat order. A sweep
//! integrates a slice of those positions into a stack of patterns with a
//! common 2θ axis (`binning`).
#![allow(clippy::cast_precision_loss)]

use crate::config::{Configuration, SweepScope};
use crate::files::sibling_folder_files;
use crate::loader::FrameSource;
use crate::{Error, Result};
use dioptas_algorithms::IntegratedPattern;
use dioptas_core::background::{extract_background, BackgroundParameters};
use dioptas_core::units::IntegrationUnit;
use ndarray::{s, Array2, Axis};
use std::path::{Path, PathBuf};

/// What happens to a frame that cannot be read during a sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramePolicy {
    /// Drop the frame; `pos_map` lists surviving frames only.
    #[default]
    SkipAndCompress,
    /// Keep the position and store a zero row.
    Pad,
}

/// Provenance of an integrated stack.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessInfo {
    /// Calibration file used.
    pub cal_file: Option<PathBuf>,
    /// Mask file used.
    pub mask_file: Option<PathBuf>,
    /// Shape of the mask in effect.
    pub mask_shape: Option<(usize, usize)>,
    /// Integration method tag (e.g. `csr`).
    pub int_method: String,
    /// Radial unit tag of `binning`.
    pub int_unit: String,
    /// Number of radial bins per row.
    pub num_points: usize,
}

/// A stack as persisted on disk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredBatch {
    /// Integrated rows (frames, bins).
    pub data: Array2<f64>,
    /// Radial axis, degrees 2θ.
    pub binning: Vec<f64>,
    /// Background rows, same shape as `data`.
    pub bkg: Option<Array2<f64>>,
    /// Source files.
    pub files: Vec<PathBuf>,
    /// Prefix sums of frame counts, `files.len() + 1` entries.
    pub file_map: Vec<usize>,
    /// Position of each row.
    pub pos_map: Vec<(usize, usize)>,
    /// Provenance.
    pub process: ProcessInfo,
}

/// The batch stack and its inventory.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchModel {
    files: Vec<PathBuf>,
    file_map: Vec<usize>,
    pos_map_all: Vec<(usize, usize)>,
    pos_map: Vec<(usize, usize)>,
    binning: Vec<f64>,
    data: Array2<f64>,
    bkg: Option<Array2<f64>>,
    process: ProcessInfo,
    /// Handling of unreadable frames.
    pub policy: FramePolicy,
}

impl Default for BatchModel {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            file_map: vec![0],
            pos_map_all: Vec::new(),
            pos_map: Vec::new(),
            binning: Vec::new(),
            data: Array2::zeros((0, 0)),
            bkg: None,
            process: ProcessInfo::default(),
            policy: FramePolicy::default(),
        }
    }
}

fn positions(file_map: &[usize]) -> Vec<(usize, usize)> {
    file_map
        .windows(2)
        .enumerate()
        .flat_map(|(k, w)| (0..w[1].saturating_sub(w[0])).map(move |f| (k, f)))
        .collect()
}

/// Stacks rows of unequal length, padding with zeros on the right.
/// Returns the data and the longest axis.
pub(crate) fn stack_rows(rows: &[Option<IntegratedPattern>]) -> (Array2<f64>, Vec<f64>) {
    let longest = rows
        .iter()
        .flatten()
        .max_by_key(|p| p.x.len())
        .map(|p| p.x.clone())
        .unwrap_or_default();
    let n = longest.len();
    let mut data = Array2::zeros((rows.len(), n));
    for (mut out, row) in data.axis_iter_mut(Axis(0)).zip(rows) {
        if let Some(p) = row {
            out.slice_mut(s![..p.y.len()])
                .iter_mut()
                .zip(&p.y)
                .for_each(|(o, v)| *o = *v);
        }
    }
    (data, longest)
}

fn validate_stored(stored: &StoredBatch) -> Result<()> {
    let invalid = |what: String| Err(Error::InvalidFormat(what));
    if stored.file_map.len() != stored.files.len() + 1 || stored.file_map.first() != Some(&0) {
        return invalid(format!(
            "file_map has {} entries for {} files",
            stored.file_map.len(),
            stored.files.len()
        ));
    }
    if stored.file_map.windows(2).any(|w| w[1] < w[0]) {
        return invalid("file_map is not ascending".to_string());
    }
    for &(file, frame) in &stored.pos_map {
        let frames = stored
            .file_map
            .get(file + 1)
            .map_or(0, |&end| end - stored.file_map[file]);
        if frame >= frames {
            return invalid(format!("position ({file}, {frame}) outside the inventory"));
        }
    }
    let rows = stored.data.nrows();
    if rows != stored.pos_map.len() {
        return invalid(format!("{rows} rows for {} positions", stored.pos_map.len()));
    }
    if rows > 0 && stored.binning.len() != stored.data.ncols() {
        return invalid(format!(
            "{} bins for {} columns",
            stored.binning.len(),
            stored.data.ncols()
        ));
    }
    if stored.bkg.as_ref().is_some_and(|b| b.dim() != stored.data.dim()) {
        return invalid("background shape differs from data".to_string());
    }
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

impl BatchModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a model from a persisted stack.
    ///
    /// # Errors
    /// `InvalidFormat` when the inventory is inconsistent: a `file_map` that
    /// is not a prefix sum over `files`, a position outside its file, or row
    /// counts that disagree with `pos_map`.
    pub fn from_stored(stored: StoredBatch) -> Result<Self> {
        validate_stored(&stored)?;
        Ok(Self {
            pos_map_all: positions(&stored.file_map),
            files: stored.files,
            file_map: stored.file_map,
            pos_map: stored.pos_map,
            binning: stored.binning,
            data: stored.data,
            bkg: stored.bkg,
            process: stored.process,
            policy: FramePolicy::default(),
        })
    }

    /// Snapshot of the stack for persistence.
    #[must_use]
    pub fn to_stored(&self) -> StoredBatch {
        StoredBatch {
            data: self.data.clone(),
            binning: self.binning.clone(),
            bkg: self.bkg.clone(),
            files: self.files.clone(),
            file_map: self.file_map.clone(),
            pos_map: self.pos_map.clone(),
            process: self.process.clone(),
        }
    }

    /// Builds the frame inventory of `paths`, discarding any stack.
    ///
    /// # Errors
    /// The first container whose frame count cannot be read.
    pub fn set_image_files<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        loader: &mut dyn FrameSource,
    ) -> Result<()> {
        let mut file_map = Vec::with_capacity(paths.len() + 1);
        file_map.push(0);
        let mut total = 0;
        for path in paths {
            total += loader.frame_count(path.as_ref())?;
            file_map.push(total);
        }
        let policy = self.policy;
        *self = Self {
            files: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            pos_map_all: positions(&file_map),
            file_map,
            policy,
            ..Self::default()
        };
        log::info!("batch inventory: {} files, {total} frames", self.files.len());
        Ok(())
    }

    /// Integrates frames `start..stop` (every `step`-th) to 2θ.
    ///
    /// With `use_all` positions come from the full inventory, otherwise from
    /// the previously integrated subset. `on_progress` is called with the
    /// number of processed frames after each frame; returning false cancels
    /// the sweep and leaves the previous stack untouched.
    ///
    /// Returns false when cancelled.
    ///
    /// # Errors
    /// Integration errors (e.g. `NotCalibrated`) abort the sweep without
    /// committing. Unreadable frames follow [`FramePolicy`].
    pub fn integrate_raw_data<F>(
        &mut self,
        config: &mut Configuration,
        start: usize,
        stop: usize,
        step: usize,
        use_all: bool,
        mut on_progress: F,
    ) -> Result<bool>
    where
        F: FnMut(usize) -> bool,
    {
        let source = if use_all { &self.pos_map_all } else { &self.pos_map };
        let stop = stop.min(source.len());
        let selected: Vec<(usize, usize)> = source
            .get(start.min(stop)..stop)
            .unwrap_or_default()
            .iter()
            .step_by(step.max(1))
            .copied()
            .collect();
        log::info!("batch sweep over {} frames", selected.len());

        let mut guard = config.sweep(SweepScope::Batch);
        let int_config = guard
            .settings
            .integration_config()
            .with_unit(IntegrationUnit::TwoThetaDeg);
        let mut rows = Vec::with_capacity(selected.len());
        let mut kept = Vec::with_capacity(selected.len());
        for (counter, &(file_index, frame)) in selected.iter().enumerate() {
            let path = self.file(file_index)?;
            match guard.loader_mut().load_frame(path, frame) {
                Ok(loaded) => {
                    let image = guard.image.orient_like(loaded.img_data.view());
                    rows.push(Some(guard.integrate_array_1d(image.view(), &int_config)?));
                    kept.push((file_index, frame));
                }
                Err(e) => {
                    log::warn!("skipping frame {frame} of {}: {e}", path.display());
                    if self.policy == FramePolicy::Pad {
                        rows.push(None);
                        kept.push((file_index, frame));
                    }
                }
            }
            if !on_progress(counter + 1) {
                log::info!("batch sweep cancelled after {} frames", counter + 1);
                return Ok(false);
            }
        }

        let (data, binning) = stack_rows(&rows);
        self.process = ProcessInfo {
            cal_file: guard.calibration_file.clone(),
            mask_file: guard.mask_file.clone(),
            mask_shape: guard.mask_file.as_ref().map(|_| guard.mask.shape()),
            int_method: guard.settings.method.as_str().to_string(),
            int_unit: IntegrationUnit::TwoThetaDeg.as_str().to_string(),
            num_points: binning.len(),
        };
        self.data = data;
        self.binning = binning;
        self.pos_map = kept;
        self.bkg = None;
        log::info!("batch sweep finished: {:?}", self.data.dim());
        Ok(true)
    }

    /// Fits the smooth-Brückner + Chebyshev background of every row.
    ///
    /// Returns false when cancelled; `bkg` is then unchanged.
    ///
    /// # Errors
    /// `Core(EmptyPattern)` for an axis with fewer than two points.
    pub fn extract_background<F>(
        &mut self,
        params: &BackgroundParameters,
        mut on_progress: F,
    ) -> Result<bool>
    where
        F: FnMut(usize) -> bool,
    {
        let mut bkg = Array2::zeros(self.data.dim());
        for (i, (row, mut out)) in self
            .data
            .axis_iter(Axis(0))
            .zip(bkg.axis_iter_mut(Axis(0)))
            .enumerate()
        {
            let y = row.to_vec();
            let fitted = extract_background(&self.binning, &y, params)?;
            out.iter_mut().zip(fitted).for_each(|(o, v)| *o = v);
            if !on_progress(i + 1) {
                return Ok(false);
            }
        }
        self.bkg = Some(bkg);
        Ok(true)
    }

    /// Scales every row so its mean over bins `range` matches row 0.
    pub fn normalize(&mut self, range: (usize, usize)) {
        let n = self.data.ncols();
        let (a, b) = (range.0.min(n), range.1.min(n));
        if b <= a || self.data.nrows() == 0 {
            return;
        }
        let reference = mean(&self.data.row(0).slice(s![a..b]).to_vec());
        for mut row in self.data.axis_iter_mut(Axis(0)) {
            let m = mean(&row.slice(s![a..b]).to_vec());
            if m.is_finite() && m != 0.0 {
                row.mapv_inplace(|v| v * reference / m);
            }
        }
    }

    /// Brings the raw frame behind stack row `row` into `config`.
    ///
    /// Returns true when the frame's shape reset the mask or corrections of
    /// `config`.
    ///
    /// # Errors
    /// `InvalidFormat` for a row outside the stack, otherwise loader errors.
    pub fn load_frame(&self, config: &mut Configuration, row: usize) -> Result<bool> {
        let &(file_index, frame) = self.pos_map.get(row).ok_or_else(|| {
            Error::InvalidFormat(format!("row {row} outside a stack of {}", self.pos_map.len()))
        })?;
        config.load_image(self.file(file_index)?, Some(frame))
    }

    fn file(&self, index: usize) -> Result<&Path> {
        self.files.get(index).map(PathBuf::as_path).ok_or_else(|| {
            Error::InvalidFormat(format!("file {index} outside {} files", self.files.len()))
        })
    }

    /// Files of the sibling directory `step` away from the first file.
    #[must_use]
    pub fn sibling_files(&self, step: i64) -> Vec<PathBuf> {
        self.files
            .first()
            .map(|f| sibling_folder_files(f, step))
            .unwrap_or_default()
    }

    /// Source files.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Prefix sums of frame counts.
    #[must_use]
    pub fn file_map(&self) -> &[usize] {
        &self.file_map
    }

    /// Every position of the inventory.
    #[must_use]
    pub fn pos_map_all(&self) -> &[(usize, usize)] {
        &self.pos_map_all
    }

    /// Position of each stack row.
    #[must_use]
    pub fn pos_map(&self) -> &[(usize, usize)] {
        &self.pos_map
    }

    /// Flat index of a position.
    #[must_use]
    pub fn flat_index(&self, position: (usize, usize)) -> Option<usize> {
        self.file_map.get(position.0).map(|base| base + position.1)
    }

    /// Radial axis of the stack, degrees 2θ.
    #[must_use]
    pub fn binning(&self) -> &[f64] {
        &self.binning
    }

    /// Integrated rows (frames, bins).
    #[must_use]
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Background rows, if extracted.
    #[must_use]
    pub fn bkg(&self) -> Option<&Array2<f64>> {
        self.bkg.as_ref()
    }

    /// Provenance of the stack.
    #[must_use]
    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }

    /// Total frames in the inventory.
    #[must_use]
    pub fn n_frames(&self) -> usize {
        self.pos_map_all.len()
    }

    /// Number of source files.
    #[must_use]
    pub fn n_files(&self) -> usize {
        self.files.len()
    }

    /// True when no stack has been integrated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(n: usize, value: f64) -> IntegratedPattern {
        IntegratedPattern {
            x: (0..n).map(|i| i as f64).collect(),
            y: vec![value; n],
            unit: IntegrationUnit::TwoThetaDeg,
        }
    }

    #[test]
    fn test_positions_from_file_map() {
        assert_eq!(positions(&[0, 2, 2, 5]), vec![(0, 0), (0, 1), (2, 0), (2, 1), (2, 2)]);
        assert!(positions(&[0]).is_empty());
    }

    #[test]
    fn test_stack_rows_pads_with_zeros() {
        let rows = vec![Some(pattern(3, 1.0)), None, Some(pattern(5, 2.0))];
        let (data, binning) = stack_rows(&rows);
        assert_eq!(data.dim(), (3, 5));
        assert_eq!(binning.len(), 5);
        assert_eq!(data.row(0).to_vec(), vec![1.0, 1.0, 1.0, 0.0, 0.0]);
        assert!(data.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_normalize_matches_first_row() {
        let mut model = BatchModel::new();
        model.data = Array2::from_shape_fn((3, 40), |(r, _)| (r + 1) as f64);
        model.normalize((10, 30));
        assert!(model.data.iter().all(|&v| (v - 1.0).abs() < 1e-12));
        model.normalize((50, 60));
        assert!(model.data.iter().all(|&v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_stored_round_trip_rebuilds_inventory() {
        let stored = StoredBatch {
            data: Array2::zeros((3, 4)),
            binning: vec![1.0, 2.0, 3.0, 4.0],
            files: vec!["a.h5".into(), "b.h5".into()],
            file_map: vec![0, 2, 3],
            pos_map: vec![(0, 0), (0, 1), (1, 0)],
            ..StoredBatch::default()
        };
        let model = BatchModel::from_stored(stored.clone()).unwrap();
        assert_eq!(model.n_frames(), 3);
        assert_eq!(model.flat_index((1, 0)), Some(2));
        assert_eq!(model.to_stored(), stored);
    }

    #[test]
    fn test_inconsistent_stored_inventory_is_rejected() {
        let stored = StoredBatch {
            data: Array2::zeros((2, 4)),
            binning: vec![1.0, 2.0, 3.0, 4.0],
            files: vec!["a.h5".into()],
            file_map: vec![0, 2],
            pos_map: vec![(0, 0), (0, 1)],
            ..StoredBatch::default()
        };
        assert!(BatchModel::from_stored(stored.clone()).is_ok());
        assert!(BatchModel::from_stored(BatchModel::new().to_stored()).is_ok());

        let corrupt = [
            StoredBatch {
                pos_map: vec![(0, 0), (3, 0)],
                ..stored.clone()
            },
            StoredBatch {
                pos_map: vec![(0, 0), (0, 2)],
                ..stored.clone()
            },
            StoredBatch {
                file_map: vec![0, 2, 4],
                ..stored.clone()
            },
            StoredBatch {
                data: Array2::zeros((3, 4)),
                ..stored.clone()
            },
            StoredBatch {
                bkg: Some(Array2::zeros((2, 3))),
                ..stored
            },
        ];
        for bad in corrupt {
            assert!(matches!(
                BatchModel::from_stored(bad),
                Err(Error::InvalidFormat(_))
            ));
        }
    }
}
