//! Detector image loaders.
//!
//! Containers are recognised by extension and, failing that, by their
//! leading bytes. TIFF and EDF are decoded natively; HDF5/NeXus needs the
//! `hdf5` feature. Multi-module NeXus acquisitions (`*_m01.nxs`,
//! `*_m02.nxs`, ...) are stitched into one image using the translation
//! recorded with each module.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

use crate::{Error, Result};
use dioptas_core::image::{FrameId, ImageFrame};
use memmap2::Mmap;
use ndarray::{s, Array2};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

/// Container kinds the loader dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// Tagged image file (single or multi page).
    Tiff,
    /// ESRF data format.
    Edf,
    /// HDF5 / NeXus container.
    Hdf5,
}

const HDF5_SIGNATURE: &[u8] = b"\x89HDF\r\n\x1a\n";

/// Determines the container kind of `path`.
///
/// # Errors
/// `UnsupportedFormat` for containers without a native loader (CBF, MAR,
/// IMG, MCCD, SPE, ...), `FileIo` when the signature cannot be read.
pub fn detect_format(path: &Path) -> Result<ImageFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "tif" | "tiff" => return Ok(ImageFormat::Tiff),
        "edf" => return Ok(ImageFormat::Edf),
        "h5" | "hdf5" | "hdf" | "nxs" | "nx" => return Ok(ImageFormat::Hdf5),
        "cbf" | "img" | "mccd" | "spe" | "sfrm" => {
            return Err(Error::UnsupportedFormat(path.to_path_buf()))
        }
        _ => {}
    }

    let mut head = [0u8; 8];
    let mut file = File::open(path).map_err(|e| Error::file(path, e))?;
    let n = file.read(&mut head).map_err(|e| Error::file(path, e))?;
    let head = &head[..n];
    if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
        Ok(ImageFormat::Tiff)
    } else if head.starts_with(HDF5_SIGNATURE) {
        Ok(ImageFormat::Hdf5)
    } else if head.first() == Some(&b'{') {
        Ok(ImageFormat::Edf)
    } else {
        Err(Error::UnsupportedFormat(path.to_path_buf()))
    }
}

/// A decoded frame and what the container says about it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadedImage {
    /// Pixel values, row-major (rows, columns).
    pub img_data: Array2<f64>,
    /// Free-form metadata (header records, detector description).
    pub file_info: BTreeMap<String, String>,
    /// Motor positions recorded with the frame.
    pub motors_info: BTreeMap<String, f64>,
    /// Number of frames in the container; at least 1.
    pub series_max: usize,
}

impl LoadedImage {
    /// Wraps pixel data of a single-frame container.
    #[must_use]
    pub fn new(img_data: Array2<f64>) -> Self {
        Self {
            img_data,
            series_max: 1,
            ..Self::default()
        }
    }

    /// Converts into an [`ImageFrame`] identified by `id`.
    #[must_use]
    pub fn into_frame(self, id: FrameId) -> ImageFrame {
        let mut frame = ImageFrame::new(self.img_data, id);
        frame.file_info = self.file_info;
        frame.motors_info = self.motors_info;
        frame.series_max = self.series_max.max(1);
        frame
    }
}

/// Anything that can hand out frames of image containers.
///
/// The batch and map engines only talk to this trait, so tests and hosts
/// can substitute in-memory sources.
pub trait FrameSource {
    /// Number of frames stored in `path`.
    ///
    /// # Errors
    /// Returns an error if the container cannot be opened.
    fn frame_count(&mut self, path: &Path) -> Result<usize>;

    /// Loads frame `frame` of `path`.
    ///
    /// # Errors
    /// Returns an error if the container cannot be read or `frame` is out
    /// of range.
    fn load_frame(&mut self, path: &Path, frame: usize) -> Result<LoadedImage>;
}

/// Filesystem loader. Keeps the most recently used container open so
/// consecutive frames of one file do not reopen it.
#[derive(Default)]
pub struct FileLoader {
    edf: Option<(PathBuf, EdfFile)>,
    #[cfg(feature = "hdf5")]
    h5: Option<(PathBuf, hdf5::File)>,
}

impl FileLoader {
    /// Creates a loader with nothing open.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes any cached container.
    pub fn close(&mut self) {
        *self = Self::default();
    }

    fn edf(&mut self, path: &Path) -> Result<&EdfFile> {
        let stale = self.edf.as_ref().map_or(true, |(p, _)| p != path);
        if stale {
            let file = EdfFile::open(path)?;
            self.edf = Some((path.to_path_buf(), file));
        }
        match &self.edf {
            Some((_, file)) => Ok(file),
            None => Err(Error::UnsupportedFormat(path.to_path_buf())),
        }
    }

    #[cfg(feature = "hdf5")]
    fn h5(&mut self, path: &Path) -> Result<&hdf5::File> {
        let stale = self.h5.as_ref().map_or(true, |(p, _)| p != path);
        if stale {
            let file = hdf5::File::open(path)?;
            self.h5 = Some((path.to_path_buf(), file));
        }
        match &self.h5 {
            Some((_, file)) => Ok(file),
            None => Err(Error::UnsupportedFormat(path.to_path_buf())),
        }
    }

    #[cfg(feature = "hdf5")]
    fn load_hdf5(&mut self, path: &Path, frame: usize) -> Result<LoadedImage> {
        let modules = module_siblings(path);
        if modules.len() < 2 {
            return crate::hdf5::read_detector_frame(self.h5(path)?, frame);
        }
        log::debug!("stitching {} detector modules for {}", modules.len(), path.display());
        let mut first: Option<LoadedImage> = None;
        let mut parts = Vec::with_capacity(modules.len());
        for module in &modules {
            let file = hdf5::File::open(module)?;
            let loaded = crate::hdf5::read_detector_frame(&file, frame)?;
            let offset = crate::hdf5::read_module_translation(&file)?;
            parts.push((loaded.img_data.clone(), offset));
            first.get_or_insert(loaded);
        }
        let mut image = first.unwrap_or_default();
        image.img_data = stitch_modules(&parts);
        image
            .file_info
            .insert("modules".to_string(), modules.len().to_string());
        Ok(image)
    }

    #[cfg(not(feature = "hdf5"))]
    #[allow(clippy::unused_self)]
    fn load_hdf5(&mut self, path: &Path, _frame: usize) -> Result<LoadedImage> {
        Err(Error::UnsupportedFormat(path.to_path_buf()))
    }
}

impl FrameSource for FileLoader {
    fn frame_count(&mut self, path: &Path) -> Result<usize> {
        match detect_format(path)? {
            ImageFormat::Tiff => tiff_frame_count(path),
            ImageFormat::Edf => Ok(self.edf(path)?.frames.len()),
            #[cfg(feature = "hdf5")]
            ImageFormat::Hdf5 => crate::hdf5::detector_frame_count(self.h5(path)?),
            #[cfg(not(feature = "hdf5"))]
            ImageFormat::Hdf5 => Err(Error::UnsupportedFormat(path.to_path_buf())),
        }
    }

    fn load_frame(&mut self, path: &Path, frame: usize) -> Result<LoadedImage> {
        match detect_format(path)? {
            ImageFormat::Tiff => read_tiff(path, frame),
            ImageFormat::Edf => self.edf(path)?.frame(frame),
            ImageFormat::Hdf5 => self.load_hdf5(path, frame),
        }
    }
}

/// Loads the first frame of `path`.
///
/// # Errors
/// See [`FrameSource::load_frame`].
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<LoadedImage> {
    FileLoader::new().load_frame(path.as_ref(), 0)
}

// ---- TIFF ----

fn open_tiff(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path).map_err(|e| Error::file(path, e))?;
    Ok(Decoder::new(BufReader::new(file))?)
}

fn tiff_frame_count(path: &Path) -> Result<usize> {
    let mut decoder = open_tiff(path)?;
    let mut n = 1;
    while decoder.more_images() {
        decoder.next_image()?;
        n += 1;
    }
    Ok(n)
}

/// Converts a decoded TIFF buffer to f64.
pub(crate) fn decoding_to_f64(result: DecodingResult) -> Result<Vec<f64>> {
    let values = match result {
        DecodingResult::U8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U64(buf) => buf.into_iter().map(|v| v as f64).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I64(buf) => buf.into_iter().map(|v| v as f64).collect(),
        DecodingResult::F32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::F64(buf) => buf,
        #[allow(unreachable_patterns)]
        _ => {
            return Err(Error::InvalidFormat(
                "unsupported TIFF sample format".to_string(),
            ))
        }
    };
    Ok(values)
}

/// Decodes page `frame` of a TIFF file into a (rows, columns) array.
pub(crate) fn read_tiff_array(path: &Path, frame: usize) -> Result<(Array2<f64>, Option<String>)> {
    let mut decoder = open_tiff(path)?;
    for _ in 0..frame {
        if !decoder.more_images() {
            return Err(Error::InvalidFormat(format!(
                "{} has no frame {frame}",
                path.display()
            )));
        }
        decoder.next_image()?;
    }
    let (width, height) = decoder.dimensions()?;
    let description = decoder.get_tag_ascii_string(Tag::ImageDescription).ok();
    let values = decoding_to_f64(decoder.read_image()?)?;
    let (rows, cols) = (height as usize, width as usize);
    if values.len() != rows * cols {
        return Err(Error::InvalidFormat(format!(
            "{}: {} samples for a {rows}x{cols} image (multi-channel TIFF?)",
            path.display(),
            values.len()
        )));
    }
    let data = Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| Error::InvalidFormat(e.to_string()))?;
    Ok((data, description))
}

fn read_tiff(path: &Path, frame: usize) -> Result<LoadedImage> {
    let (data, description) = read_tiff_array(path, frame)?;
    let mut image = LoadedImage::new(data);
    if let Some(text) = description {
        image.file_info.insert("description".to_string(), text);
    }
    Ok(image)
}

// ---- EDF ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EdfType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl EdfType {
    fn parse(name: &str) -> Option<Self> {
        let t = match name.to_ascii_lowercase().as_str() {
            "unsignedbyte" | "unsignedchar" | "unsigned8" => Self::U8,
            "signedbyte" | "signedchar" | "signed8" => Self::I8,
            "unsignedshort" | "unsigned16" => Self::U16,
            "signedshort" | "signed16" => Self::I16,
            "unsignedinteger" | "unsignedlong" | "unsigned32" => Self::U32,
            "signedinteger" | "signedlong" | "signed32" => Self::I32,
            "unsignedlong64" | "unsigned64" => Self::U64,
            "signedlong64" | "signed64" => Self::I64,
            "floatvalue" | "float" | "real" | "float32" => Self::F32,
            "doublevalue" | "double" | "float64" => Self::F64,
            _ => return None,
        };
        Some(t)
    }

    fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    fn decode(self, bytes: &[u8], little_endian: bool) -> f64 {
        macro_rules! num {
            ($t:ty, $n:expr) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(bytes);
                if little_endian {
                    <$t>::from_le_bytes(raw) as f64
                } else {
                    <$t>::from_be_bytes(raw) as f64
                }
            }};
        }
        match self {
            Self::U8 => f64::from(bytes[0]),
            Self::I8 => f64::from(bytes[0] as i8),
            Self::U16 => num!(u16, 2),
            Self::I16 => num!(i16, 2),
            Self::U32 => num!(u32, 4),
            Self::I32 => num!(i32, 4),
            Self::U64 => num!(u64, 8),
            Self::I64 => num!(i64, 8),
            Self::F32 => num!(f32, 4),
            Self::F64 => num!(f64, 8),
        }
    }
}

#[derive(Clone, Debug)]
struct EdfFrame {
    header: BTreeMap<String, String>,
    offset: usize,
    rows: usize,
    cols: usize,
    dtype: EdfType,
    little_endian: bool,
}

/// A memory-mapped EDF file with its frame table.
struct EdfFile {
    mmap: Mmap,
    frames: Vec<EdfFrame>,
}

fn parse_edf_header(text: &str) -> BTreeMap<String, String> {
    text.split(';')
        .filter_map(|record| {
            let (key, value) = record.split_once('=')?;
            let key = key.trim().trim_start_matches('{').trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn edf_frames(bytes: &[u8]) -> Result<Vec<EdfFrame>> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let Some(open) = bytes[pos..].iter().position(|&b| b == b'{') else {
            break;
        };
        let open = pos + open;
        let close = bytes[open..]
            .iter()
            .position(|&b| b == b'}')
            .map(|i| open + i)
            .ok_or_else(|| Error::InvalidFormat("unterminated EDF header".to_string()))?;
        let header = parse_edf_header(&String::from_utf8_lossy(&bytes[open + 1..close]));
        let mut offset = close + 1;
        if bytes.get(offset) == Some(&b'\n') {
            offset += 1;
        }

        let dim = |key: &str| -> Result<usize> {
            header
                .get(key)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::InvalidFormat(format!("EDF header lacks {key}")))
        };
        let cols = dim("Dim_1")?;
        let rows = dim("Dim_2")?;
        let dtype = header
            .get("DataType")
            .and_then(|t| EdfType::parse(t))
            .ok_or_else(|| Error::InvalidFormat("EDF header lacks a known DataType".to_string()))?;
        let little_endian = header
            .get("ByteOrder")
            .map_or(true, |o| !o.eq_ignore_ascii_case("HighByteFirst"));
        let size = header
            .get("Size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(rows * cols * dtype.size());
        if offset + rows * cols * dtype.size() > bytes.len() {
            return Err(Error::InvalidFormat("EDF data block truncated".to_string()));
        }
        frames.push(EdfFrame {
            header,
            offset,
            rows,
            cols,
            dtype,
            little_endian,
        });
        pos = offset + size;
    }
    if frames.is_empty() {
        return Err(Error::InvalidFormat("no EDF header found".to_string()));
    }
    Ok(frames)
}

impl EdfFile {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::file(path, e))?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::file(path, e))?;
        let frames = edf_frames(&mmap)?;
        Ok(Self { mmap, frames })
    }

    fn frame(&self, index: usize) -> Result<LoadedImage> {
        let frame = self.frames.get(index).ok_or_else(|| {
            Error::InvalidFormat(format!(
                "EDF frame {index} out of range ({} frames)",
                self.frames.len()
            ))
        })?;
        let width = frame.dtype.size();
        let end = frame.offset + frame.rows * frame.cols * width;
        let values: Vec<f64> = self.mmap[frame.offset..end]
            .chunks_exact(width)
            .map(|b| frame.dtype.decode(b, frame.little_endian))
            .collect();
        let data = Array2::from_shape_vec((frame.rows, frame.cols), values)
            .map_err(|e| Error::InvalidFormat(e.to_string()))?;

        let mut image = LoadedImage::new(data);
        image.series_max = self.frames.len();
        image.motors_info = edf_motors(&frame.header);
        image.file_info = frame.header.clone();
        Ok(image)
    }
}

fn edf_motors(header: &BTreeMap<String, String>) -> BTreeMap<String, f64> {
    let (Some(names), Some(positions)) = (header.get("motor_mne"), header.get("motor_pos")) else {
        return BTreeMap::new();
    };
    names
        .split_whitespace()
        .zip(positions.split_whitespace())
        .filter_map(|(name, pos)| Some((name.to_string(), pos.parse().ok()?)))
        .collect()
}

// ---- multi-module stitching ----

/// Splits a module file stem `prefix_mNN` into `(prefix, NN)`.
fn module_stem(stem: &str) -> Option<(&str, &str)> {
    let (prefix, number) = stem.rsplit_once("_m")?;
    (!number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())).then_some((prefix, number))
}

/// All module files belonging to the same acquisition as `path`, sorted by
/// module number. A file that is not part of a module set yields itself.
#[must_use]
pub fn module_siblings(path: &Path) -> Vec<PathBuf> {
    let own = vec![path.to_path_buf()];
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return own;
    };
    let Some((prefix, _)) = module_stem(stem) else {
        return own;
    };
    let ext = path.extension();
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return own;
    };
    let mut modules: Vec<(u32, PathBuf)> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension() == ext)
        .filter_map(|p| {
            let (pre, number) = module_stem(p.file_stem()?.to_str()?)?;
            if pre != prefix {
                return None;
            }
            let number = number.parse().ok()?;
            Some((number, p))
        })
        .collect();
    if modules.is_empty() {
        return own;
    }
    modules.sort();
    modules.into_iter().map(|(_, p)| p).collect()
}

/// Places detector modules on a common canvas.
///
/// Each module comes with its `(row, column)` offset in pixels; offsets are
/// rounded and shifted so the smallest is zero. Later modules overwrite
/// earlier ones where they overlap; uncovered pixels are 0.
#[must_use]
pub fn stitch_modules(modules: &[(Array2<f64>, (f64, f64))]) -> Array2<f64> {
    if modules.is_empty() {
        return Array2::zeros((0, 0));
    }
    let min_r = modules.iter().map(|(_, o)| o.0.round()).fold(f64::INFINITY, f64::min);
    let min_c = modules.iter().map(|(_, o)| o.1.round()).fold(f64::INFINITY, f64::min);
    let placed: Vec<(usize, usize, &Array2<f64>)> = modules
        .iter()
        .map(|(data, (r, c))| ((r.round() - min_r) as usize, (c.round() - min_c) as usize, data))
        .collect();
    let rows = placed.iter().map(|(r, _, d)| r + d.nrows()).max().unwrap_or(0);
    let cols = placed.iter().map(|(_, c, d)| c + d.ncols()).max().unwrap_or(0);
    let mut canvas = Array2::zeros((rows, cols));
    for (r, c, data) in placed {
        canvas
            .slice_mut(s![r..r + data.nrows(), c..c + data.ncols()])
            .assign(data);
    }
    canvas
}
