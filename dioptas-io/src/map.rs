//! Map engine: a rectangular grid of acquisitions reduced to one scalar per
//! point.
//!
//! The grid dimension is not stored in the data files, so the model offers
//! every factorisation of the frame count and lets the caller pick one.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use crate::batch::stack_rows;
use crate::config::{Configuration, SweepScope};
use crate::{Error, Result};
use dioptas_core::units::IntegrationUnit;
use image::{Rgb, RgbImage};
use ndarray::{Array2, Axis};
use std::fmt::Write as _;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

/// Every `(rows, cols)` with `rows * cols == n_frames`, most square first.
/// Ties keep ascending row order, so `(3, 4)` precedes `(4, 3)`.
#[must_use]
pub fn dimension_candidates(n_frames: usize) -> Vec<(usize, usize)> {
    let target = (n_frames as f64).sqrt();
    let mut candidates: Vec<(usize, usize)> = (1..=n_frames)
        .filter(|r| n_frames % r == 0)
        .map(|r| (r, n_frames / r))
        .collect();
    let squareness = |&(r, c): &(usize, usize)| ((r + c) as f64 / 2.0 - target).abs();
    candidates.sort_by(|a, b| squareness(a).total_cmp(&squareness(b)));
    candidates
}

/// Colour scale for rendered map images.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Colormap {
    /// Black to white.
    #[default]
    Grayscale,
    /// Black through red and yellow to white.
    Hot,
    /// Viridis, interpolated between five anchors.
    Viridis,
}

const VIRIDIS: [[f64; 3]; 5] = [
    [68.0, 1.0, 84.0],
    [59.0, 82.0, 139.0],
    [33.0, 145.0, 140.0],
    [94.0, 201.0, 98.0],
    [253.0, 231.0, 37.0],
];

impl Colormap {
    /// Colour of `t` in `[0, 1]`.
    #[must_use]
    pub fn rgb(self, t: f64) -> [u8; 3] {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let byte = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        match self {
            Self::Grayscale => [byte(t); 3],
            Self::Hot => [byte(3.0 * t), byte(3.0 * t - 1.0), byte(3.0 * t - 2.0)],
            Self::Viridis => {
                let pos = t * (VIRIDIS.len() - 1) as f64;
                let lo = (pos.floor() as usize).min(VIRIDIS.len() - 2);
                let frac = pos - lo as f64;
                let channel = |k: usize| {
                    let v = VIRIDIS[lo][k] + (VIRIDIS[lo + 1][k] - VIRIDIS[lo][k]) * frac;
                    v.round().clamp(0.0, 255.0) as u8
                };
                [channel(0), channel(1), channel(2)]
            }
        }
    }
}

/// Integrated map acquisition.
#[derive(Clone, Debug, Default)]
pub struct MapModel {
    files: Vec<PathBuf>,
    frame_counts: Vec<usize>,
    positions: Vec<(usize, usize)>,
    pattern_x: Vec<f64>,
    intensities: Array2<f64>,
    unit: Option<IntegrationUnit>,
    window: Option<(f64, f64)>,
    dimension: Option<(usize, usize)>,
}

impl MapModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrates every frame of every file in the configuration's current
    /// unit. Unreadable frames are skipped. `on_progress` receives the
    /// number of processed frames; returning false cancels and leaves the
    /// model unchanged.
    ///
    /// Returns false when cancelled.
    ///
    /// # Errors
    /// Inventory and integration errors abort without committing.
    pub fn load<P, F>(
        &mut self,
        files: &[P],
        config: &mut Configuration,
        mut on_progress: F,
    ) -> Result<bool>
    where
        P: AsRef<Path>,
        F: FnMut(usize) -> bool,
    {
        let mut guard = config.sweep(SweepScope::Map);
        let int_config = guard.settings.integration_config();
        let files: Vec<PathBuf> = files.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let frame_counts = files
            .iter()
            .map(|f| guard.loader_mut().frame_count(f))
            .collect::<Result<Vec<_>>>()?;
        log::info!(
            "map sweep over {} frames in {} files",
            frame_counts.iter().sum::<usize>(),
            files.len()
        );

        let mut rows = Vec::new();
        let mut positions = Vec::new();
        let mut counter = 0;
        for (file_index, (path, &count)) in files.iter().zip(&frame_counts).enumerate() {
            for frame in 0..count {
                match guard.loader_mut().load_frame(path, frame) {
                    Ok(loaded) => {
                        let image = guard.image.orient_like(loaded.img_data.view());
                        rows.push(Some(guard.integrate_array_1d(image.view(), &int_config)?));
                        positions.push((file_index, frame));
                    }
                    Err(e) => log::warn!("skipping frame {frame} of {}: {e}", path.display()),
                }
                counter += 1;
                if !on_progress(counter) {
                    log::info!("map sweep cancelled after {counter} frames");
                    return Ok(false);
                }
            }
        }

        let (intensities, pattern_x) = stack_rows(&rows);
        self.files = files;
        self.frame_counts = frame_counts;
        self.positions = positions;
        self.pattern_x = pattern_x;
        self.intensities = intensities;
        self.unit = Some(int_config.unit);
        self.window = None;
        self.dimension = dimension_candidates(self.n_points()).first().copied();
        Ok(true)
    }

    /// Number of map points (integrated frames).
    #[must_use]
    pub fn n_points(&self) -> usize {
        self.positions.len()
    }

    /// Radial axis shared by all points.
    #[must_use]
    pub fn pattern_x(&self) -> &[f64] {
        &self.pattern_x
    }

    /// One pattern per point, row-major over the grid.
    #[must_use]
    pub fn intensities(&self) -> &Array2<f64> {
        &self.intensities
    }

    /// Unit of [`Self::pattern_x`], once loaded.
    #[must_use]
    pub fn unit(&self) -> Option<IntegrationUnit> {
        self.unit
    }

    #[must_use]
    pub fn dimension(&self) -> Option<(usize, usize)> {
        self.dimension
    }

    #[must_use]
    pub fn dimension_candidates(&self) -> Vec<(usize, usize)> {
        dimension_candidates(self.n_points())
    }

    /// Selects a grid dimension. Anything but a candidate is ignored and
    /// false returned.
    pub fn set_dimension(&mut self, dimension: (usize, usize)) -> bool {
        if self.dimension_candidates().contains(&dimension) {
            self.dimension = Some(dimension);
            true
        } else {
            false
        }
    }

    /// Sets the integration window in the map's unit. The bounds may be
    /// given in either order.
    pub fn set_window(&mut self, window: (f64, f64)) {
        self.window = Some((window.0.min(window.1), window.0.max(window.1)));
    }

    /// The window in use: the one set, or three axis steps around the
    /// middle of the axis.
    #[must_use]
    pub fn window(&self) -> Option<(f64, f64)> {
        if self.window.is_some() {
            return self.window;
        }
        let x = &self.pattern_x;
        if x.len() < 2 {
            return None;
        }
        let mid = x[x.len() / 2];
        // d-spacing axes descend
        let step = (x[1] - x[0]).abs();
        Some((mid - 1.5 * step, mid + 1.5 * step))
    }

    /// Sum of each point's intensities over bins strictly inside the window.
    #[must_use]
    pub fn window_intensities(&self) -> Vec<f64> {
        let Some((lo, hi)) = self.window() else {
            return vec![0.0; self.n_points()];
        };
        let inside: Vec<usize> = self
            .pattern_x
            .iter()
            .enumerate()
            .filter(|(_, &x)| lo < x && x < hi)
            .map(|(j, _)| j)
            .collect();
        self.intensities
            .axis_iter(Axis(0))
            .map(|row| inside.iter().map(|&j| row[j]).sum())
            .collect()
    }

    /// The map matrix, `map[[i, j]] == window_intensities()[j + cols * i]`.
    ///
    /// # Errors
    /// `InvalidFormat` before any data is loaded.
    pub fn map(&self) -> Result<Array2<f64>> {
        let dimension = self
            .dimension
            .ok_or_else(|| Error::InvalidFormat("no map loaded".to_string()))?;
        Array2::from_shape_vec(dimension, self.window_intensities())
            .map_err(|e| Error::InvalidFormat(format!("map reshape: {e}")))
    }

    fn flat_index(&self, row: usize, col: usize) -> Option<usize> {
        let (rows, cols) = self.dimension?;
        (row < rows && col < cols).then_some(col + cols * row)
    }

    /// File and frame behind a grid cell.
    #[must_use]
    pub fn get_point_info(&self, row: usize, col: usize) -> Option<(&Path, usize)> {
        let (file_index, frame) = *self.positions.get(self.flat_index(row, col)?)?;
        Some((self.files.get(file_index)?.as_path(), frame))
    }

    /// Loads the frame behind a grid cell into `config`, returning true when
    /// its shape reset the mask or corrections.
    ///
    /// # Errors
    /// `InvalidFormat` for a cell outside the grid or without a file behind
    /// it; loader errors.
    pub fn select_point(&self, row: usize, col: usize, config: &mut Configuration) -> Result<bool> {
        let (file_index, frame) = self
            .flat_index(row, col)
            .and_then(|index| self.positions.get(index).copied())
            .ok_or_else(|| Error::InvalidFormat(format!("no map point at ({row}, {col})")))?;
        let path = self
            .files
            .get(file_index)
            .ok_or_else(|| Error::InvalidFormat(format!("map point refers to file {file_index}")))?;
        let multi_frame = self.frame_counts.get(file_index).is_some_and(|&n| n > 1);
        config.load_image(path, multi_frame.then_some(frame))
    }

    /// Writes the map: `.png` through `colormap`, `.tif`/`.tiff` as 32-bit
    /// integers rescaled over the full range with the original min/max in
    /// the image description, `.txt` as a rounded integer matrix.
    ///
    /// # Errors
    /// `UnsupportedFormat` for other extensions; write failures.
    pub fn save_map<P: AsRef<Path>>(&self, path: P, colormap: Colormap) -> Result<()> {
        let path = path.as_ref();
        let map = self.map()?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("png") => save_png(path, &map, colormap),
            Some("tif" | "tiff") => save_tiff(path, &map),
            Some("txt") => save_txt(path, &map),
            _ => Err(Error::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

fn min_max(map: &Array2<f64>) -> (f64, f64) {
    map.iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Values scaled to `[0, 1]`; a flat map becomes all zeros.
fn normalised(map: &Array2<f64>) -> Array2<f64> {
    let (lo, hi) = min_max(map);
    let span = hi - lo;
    if span > 0.0 && span.is_finite() {
        map.mapv(|v| (v - lo) / span)
    } else {
        Array2::zeros(map.dim())
    }
}

fn dims_u32(map: &Array2<f64>) -> Result<(u32, u32)> {
    let (rows, cols) = map.dim();
    let width = u32::try_from(cols)
        .map_err(|_| Error::InvalidFormat(format!("map too wide: {cols}")))?;
    let height = u32::try_from(rows)
        .map_err(|_| Error::InvalidFormat(format!("map too tall: {rows}")))?;
    Ok((width, height))
}

fn save_png(path: &Path, map: &Array2<f64>, colormap: Colormap) -> Result<()> {
    let (width, height) = dims_u32(map)?;
    let scaled = normalised(map);
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb(colormap.rgb(scaled[[y as usize, x as usize]]))
    });
    img.save(path)?;
    Ok(())
}

fn save_tiff(path: &Path, map: &Array2<f64>) -> Result<()> {
    let (width, height) = dims_u32(map)?;
    let (lo, hi) = min_max(map);
    let data: Vec<u32> = normalised(map)
        .iter()
        .map(|&t| (t * f64::from(u32::MAX)).round() as u32)
        .collect();
    let description = format!("min: {lo:?}, max: {hi:?}");

    let file = File::create(path).map_err(|e| Error::file(path, e))?;
    let mut tiff = TiffEncoder::new(BufWriter::new(file))?;
    let mut image = tiff.new_image::<colortype::Gray32>(width, height)?;
    image
        .encoder()
        .write_tag(Tag::ImageDescription, description.as_str())?;
    image.write_data(&data)?;
    Ok(())
}

fn save_txt(path: &Path, map: &Array2<f64>) -> Result<()> {
    let mut text = String::new();
    for row in map.axis_iter(Axis(0)) {
        let line: Vec<String> = row.iter().map(|v| format!("{}", v.round() as i64)).collect();
        let _ = writeln!(text, "{}", line.join(" "));
    }
    std::fs::write(path, text).map_err(|e| Error::file(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{FrameSource, LoadedImage};
    use dioptas_core::calibration::{Calibration, PoniParameters};
    use tempfile::tempdir;

    #[test]
    fn test_twelve_frames_prefer_three_by_four() {
        let candidates = dimension_candidates(12);
        assert_eq!(candidates[0], (3, 4));
        assert_eq!(candidates[1], (4, 3));
        for pair in [(2, 6), (6, 2), (1, 12), (12, 1)] {
            assert_eq!(candidates.iter().filter(|c| **c == pair).count(), 1);
        }
        assert_eq!(candidates.len(), 6);
        assert!(candidates.iter().all(|(r, c)| r * c == 12));
    }

    #[test]
    fn test_square_and_prime_counts() {
        assert_eq!(dimension_candidates(9)[0], (3, 3));
        assert_eq!(dimension_candidates(7), vec![(1, 7), (7, 1)]);
        assert!(dimension_candidates(0).is_empty());
    }

    fn synthetic(n: usize) -> MapModel {
        MapModel {
            files: vec![PathBuf::from("scan.h5")],
            frame_counts: vec![n],
            positions: (0..n).map(|f| (0, f)).collect(),
            pattern_x: vec![1.0, 2.0, 3.0, 4.0, 5.0],
            intensities: Array2::from_shape_fn((n, 5), |(i, j)| (i * 10 + j) as f64),
            unit: Some(IntegrationUnit::TwoThetaDeg),
            window: None,
            dimension: dimension_candidates(n).first().copied(),
        }
    }

    #[test]
    fn test_rejects_foreign_dimension() {
        let mut model = synthetic(12);
        assert!(!model.set_dimension((5, 5)));
        assert_eq!(model.dimension(), Some((3, 4)));
        assert!(model.set_dimension((6, 2)));
        assert_eq!(model.dimension(), Some((6, 2)));
    }

    #[test]
    fn test_default_window_is_exclusive() {
        let model = synthetic(4);
        // mid = 3.0, step = 1.0: bins 2.0, 3.0, 4.0 fall inside (1.5, 4.5)
        assert_eq!(model.window(), Some((1.5, 4.5)));
        let sums = model.window_intensities();
        assert_eq!(sums[0], 1.0 + 2.0 + 3.0);

        let mut model = model;
        model.set_window((2.0, 4.0));
        assert_eq!(model.window_intensities()[1], 12.0);
    }

    #[test]
    fn test_d_spacing_axis_descends() {
        let mut model = synthetic(4);
        model.pattern_x = vec![5.0, 4.0, 3.0, 2.0, 1.0];
        model.unit = Some(IntegrationUnit::DSpacing);
        assert_eq!(model.window(), Some((1.5, 4.5)));
        let sums = model.window_intensities();
        assert_eq!(sums[0], 1.0 + 2.0 + 3.0);
        assert!(sums.iter().all(|&s| s > 0.0));

        model.set_window((4.0, 2.0));
        assert_eq!(model.window(), Some((2.0, 4.0)));
        assert_eq!(model.window_intensities()[1], 12.0);
    }

    #[test]
    fn test_dangling_file_index_is_rejected() {
        let mut model = synthetic(4);
        model.positions[3] = (7, 0);
        assert_eq!(model.get_point_info(1, 1), None);
        let mut config = calibrated();
        assert!(matches!(
            model.select_point(1, 1, &mut config),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_map_is_row_major() {
        let mut model = synthetic(12);
        model.set_dimension((4, 3));
        let sums = model.window_intensities();
        let map = model.map().unwrap();
        for i in 0..4 {
            for j in 0..3 {
                assert_eq!(map[[i, j]], sums[j + 3 * i]);
            }
        }
        assert_eq!(model.get_point_info(1, 2), Some((Path::new("scan.h5"), 5)));
        assert_eq!(model.get_point_info(4, 0), None);
    }

    #[test]
    fn test_exports() {
        let dir = tempdir().unwrap();
        let model = synthetic(6);
        model.save_map(dir.path().join("m.png"), Colormap::Viridis).unwrap();
        model.save_map(dir.path().join("m.tiff"), Colormap::default()).unwrap();
        model.save_map(dir.path().join("m.txt"), Colormap::default()).unwrap();
        assert!(matches!(
            model.save_map(dir.path().join("m.bmp"), Colormap::Hot),
            Err(Error::UnsupportedFormat(_))
        ));

        let text = std::fs::read_to_string(dir.path().join("m.txt")).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(text.lines().next().unwrap(), "6 36 66");

        let png = image::open(dir.path().join("m.png")).unwrap();
        assert_eq!((png.width(), png.height()), (3, 2));
    }

    #[test]
    fn test_colormap_ends() {
        assert_eq!(Colormap::Grayscale.rgb(1.0), [255, 255, 255]);
        assert_eq!(Colormap::Hot.rgb(0.0), [0, 0, 0]);
        assert_eq!(Colormap::Viridis.rgb(1.0), [253, 231, 37]);
    }

    struct Scan;

    impl FrameSource for Scan {
        fn frame_count(&mut self, _path: &Path) -> Result<usize> {
            Ok(3)
        }

        fn load_frame(&mut self, _path: &Path, frame: usize) -> Result<LoadedImage> {
            Ok(LoadedImage::new(Array2::from_elem((48, 48), 1.0 + frame as f64)))
        }
    }

    fn calibrated() -> Configuration {
        let mut config = Configuration::new().with_loader(Box::new(Scan));
        let poni = PoniParameters {
            dist: 0.1,
            poni1: 24.0 * 100e-6,
            poni2: 24.0 * 100e-6,
            pixel1: 100e-6,
            pixel2: 100e-6,
            ..PoniParameters::default()
        };
        config.calibration = Calibration::from_poni(poni, None).unwrap();
        config
    }

    #[test]
    fn test_load_keeps_full_axis_and_restores_settings() {
        let mut config = calibrated();
        let mut model = MapModel::new();
        assert!(model.load(&["a.h5", "b.h5"], &mut config, |_| true).unwrap());
        assert_eq!(model.n_points(), 6);
        assert_eq!(model.dimension(), Some((2, 3)));
        assert_eq!(model.intensities().ncols(), model.pattern_x().len());
        assert!(config.settings.trim_trailing_zeros);
        assert!(config.settings.auto_integrate);

        model.select_point(1, 0, &mut config).unwrap();
        assert_eq!(config.image.id.path, PathBuf::from("b.h5"));
        assert_eq!(config.image.id.frame_index, Some(0));
    }

    #[test]
    fn test_cancelled_load_commits_nothing() {
        let mut config = calibrated();
        let mut model = MapModel::new();
        assert!(!model.load(&["a.h5"], &mut config, |n| n < 2).unwrap());
        assert_eq!(model.n_points(), 0);
        assert!(model.map().is_err());
    }
}
