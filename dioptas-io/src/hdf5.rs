//! HDF5/NeXus support: detector frames and batch stack persistence.
//!
//! Batch stacks are written to a NeXus-style layout rooted at `/processed`
//! (`result` holds the stack, `process` its provenance). Files written by
//! older versions keep everything flat at the root; both are read.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

use crate::batch::{BatchModel, ProcessInfo, StoredBatch};
use crate::config::Configuration;
use crate::loader::LoadedImage;
use crate::{Error, Result};
use hdf5::types::{FloatSize, H5Type, IntSize, TypeDescriptor, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use ndarray::{s, Array2, ArrayView1};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where detector images are looked for, in order.
const DETECTOR_DATA_PATHS: [&str; 2] = ["entry/instrument/detector/data", "entry/data/data"];
const DETECTOR_DESCRIPTION: &str = "entry/instrument/detector/description";
const MODULE_TRANSLATION: &str = "entry/instrument/detector/translation/distance";

// ---- detector frames ----

fn detector_dataset(file: &File) -> Result<Dataset> {
    DETECTOR_DATA_PATHS
        .iter()
        .find_map(|p| file.dataset(p).ok())
        .ok_or_else(|| {
            Error::InvalidFormat(format!(
                "{}: no detector data at {}",
                file.filename(),
                DETECTOR_DATA_PATHS.join(" or ")
            ))
        })
}

/// Number of frames in a NeXus detector container: the leading axis of a
/// 3-D dataset, 1 for a single 2-D image.
///
/// # Errors
/// `InvalidFormat` without a detector dataset of rank 2 or 3.
pub fn detector_frame_count(file: &File) -> Result<usize> {
    let shape = detector_dataset(file)?.shape();
    match shape.len() {
        2 => Ok(1),
        3 => Ok(shape[0]),
        n => Err(Error::InvalidFormat(format!(
            "detector data has rank {n}, expected 2 or 3"
        ))),
    }
}

fn read_frame_as<T: H5Type>(dataset: &Dataset, frame: Option<usize>) -> Result<Array2<T>> {
    Ok(match frame {
        Some(i) => dataset.read_slice_2d::<T, _>(s![i, .., ..])?,
        None => dataset.read_2d::<T>()?,
    })
}

/// Reads frame `frame` of the detector dataset as f64, converting from the
/// stored integer or float type.
///
/// # Errors
/// `InvalidFormat` for an out-of-range frame or an unsupported data type.
pub fn read_detector_frame(file: &File, frame: usize) -> Result<LoadedImage> {
    let dataset = detector_dataset(file)?;
    let series_max = detector_frame_count(file)?;
    if frame >= series_max {
        return Err(Error::InvalidFormat(format!(
            "frame {frame} out of range ({series_max} frames)"
        )));
    }
    let index = (dataset.ndim() == 3).then_some(frame);
    let data = match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::Unsigned(IntSize::U1) => read_frame_as::<u8>(&dataset, index)?.mapv(f64::from),
        TypeDescriptor::Unsigned(IntSize::U2) => read_frame_as::<u16>(&dataset, index)?.mapv(f64::from),
        TypeDescriptor::Unsigned(IntSize::U4) => read_frame_as::<u32>(&dataset, index)?.mapv(f64::from),
        TypeDescriptor::Unsigned(IntSize::U8) => read_frame_as::<u64>(&dataset, index)?.mapv(|v| v as f64),
        TypeDescriptor::Integer(IntSize::U1) => read_frame_as::<i8>(&dataset, index)?.mapv(f64::from),
        TypeDescriptor::Integer(IntSize::U2) => read_frame_as::<i16>(&dataset, index)?.mapv(f64::from),
        TypeDescriptor::Integer(IntSize::U4) => read_frame_as::<i32>(&dataset, index)?.mapv(f64::from),
        TypeDescriptor::Integer(IntSize::U8) => read_frame_as::<i64>(&dataset, index)?.mapv(|v| v as f64),
        TypeDescriptor::Float(FloatSize::U4) => read_frame_as::<f32>(&dataset, index)?.mapv(f64::from),
        TypeDescriptor::Float(_) => read_frame_as::<f64>(&dataset, index)?,
        other => {
            return Err(Error::InvalidFormat(format!(
                "unsupported detector data type {other:?}"
            )))
        }
    };

    let mut image = LoadedImage::new(data);
    image.series_max = series_max;
    image.file_info.insert("dataset".to_string(), dataset.name());
    if let Some(description) = read_string_dataset_opt(file, DETECTOR_DESCRIPTION) {
        image.file_info.insert("description".to_string(), description);
    }
    Ok(image)
}

/// Offset of a detector module as `(row, column)` pixels, from the
/// `[x, y, z]` translation stored with the module. Missing translation
/// means no offset.
///
/// # Errors
/// Returns an error if the translation exists but cannot be read.
pub fn read_module_translation(file: &File) -> Result<(f64, f64)> {
    let Ok(dataset) = file.dataset(MODULE_TRANSLATION) else {
        return Ok((0.0, 0.0));
    };
    let values = dataset.read_raw::<f64>()?;
    match values.as_slice() {
        [x, y, ..] => Ok((*y, *x)),
        _ => Err(Error::InvalidFormat(
            "module translation needs at least two components".to_string(),
        )),
    }
}

// ---- batch persistence ----

fn create_fixed_dataset<T: H5Type, S>(
    group: &Group,
    name: &str,
    shape: S,
    compression: Option<u8>,
) -> Result<Dataset>
where
    S: Into<hdf5::Extents>,
{
    let mut builder = group.new_dataset::<T>().shape(shape);
    if let Some(level) = compression {
        builder = builder.deflate(level);
    }
    Ok(builder.create(name)?)
}

fn write_matrix_f32(group: &Group, name: &str, data: &Array2<f64>) -> Result<()> {
    let values = data.mapv(|v| v as f32);
    let compression = (!values.is_empty()).then_some(4);
    let dataset = create_fixed_dataset::<f32, _>(group, name, values.dim(), compression)?;
    if !values.is_empty() {
        dataset.write(values.view())?;
    }
    Ok(())
}

fn write_vec<T: H5Type>(group: &Group, name: &str, values: &[T]) -> Result<Dataset> {
    let dataset = create_fixed_dataset::<T, _>(group, name, (values.len(),), None)?;
    if !values.is_empty() {
        dataset.write(ArrayView1::from(values))?;
    }
    Ok(dataset)
}

fn write_scalar_str(group: &Group, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    group
        .new_dataset::<VarLenUnicode>()
        .shape(())
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn set_axes_attr(group: &Group, axes: &[&str]) -> Result<()> {
    let values: Vec<VarLenUnicode> = axes
        .iter()
        .map(|axis| to_var_len_unicode(axis))
        .collect::<Result<Vec<_>>>()?;
    let attr = group
        .new_attr::<VarLenUnicode>()
        .shape((values.len(),))
        .create("axes")?;
    attr.write(ArrayView1::from(values.as_slice()))?;
    Ok(())
}

fn set_attr_str_dataset(dataset: &Dataset, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    dataset
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn set_attr_str_group(group: &Group, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Writes a batch stack in the `/processed` layout.
///
/// # Errors
/// Returns an error if HDF5 I/O fails.
pub fn write_batch_hdf5<P: AsRef<Path>>(path: P, stored: &StoredBatch) -> Result<()> {
    let file = File::create(path)?;
    let processed = file.create_group("processed")?;
    set_attr_str_group(&processed, "NX_class", "NXentry")?;
    set_attr_str_group(&processed, "default", "result")?;

    let result = processed.create_group("result")?;
    set_attr_str_group(&result, "NX_class", "NXdata")?;
    set_attr_str_group(&result, "signal", "data")?;
    set_axes_attr(&result, &[".", "binning"])?;
    write_matrix_f32(&result, "data", &stored.data)?;
    let binning: Vec<f32> = stored.binning.iter().map(|&v| v as f32).collect();
    let binning = write_vec(&result, "binning", &binning)?;
    set_attr_str_dataset(&binning, "unit", "deg")?;
    set_attr_str_dataset(&binning, "long_name", "two_theta (degrees)")?;

    let process = processed.create_group("process")?;
    set_attr_str_group(&process, "NX_class", "NXprocess")?;
    let info = &stored.process;
    write_scalar_str(
        &process,
        "cal_file",
        &info.cal_file.as_deref().map(path_string).unwrap_or_default(),
    )?;
    if let Some(mask_file) = &info.mask_file {
        write_scalar_str(&process, "mask_file", &path_string(mask_file))?;
    }
    if let Some((rows, cols)) = info.mask_shape {
        write_vec(&process, "mask_shape", &[rows as i64, cols as i64])?;
    }
    write_scalar_str(&process, "int_method", &info.int_method)?;
    write_scalar_str(&process, "int_unit", &info.int_unit)?;
    process
        .new_dataset::<i64>()
        .shape(())
        .create("num_points")?
        .write_scalar(&(info.num_points as i64))?;
    if let Some(bkg) = &stored.bkg {
        write_matrix_f32(&process, "bkg", bkg)?;
    }
    write_pos_map(&process, &stored.pos_map)?;
    let file_map: Vec<i64> = stored.file_map.iter().map(|&v| v as i64).collect();
    write_vec(&process, "file_map", &file_map)?;
    let files: Vec<VarLenUnicode> = stored
        .files
        .iter()
        .map(|f| to_var_len_unicode(&path_string(f)))
        .collect::<Result<_>>()?;
    write_vec(&process, "files", &files)?;
    Ok(())
}

fn write_pos_map(group: &Group, pos_map: &[(usize, usize)]) -> Result<()> {
    let values = Array2::from_shape_fn((pos_map.len(), 2), |(i, j)| {
        let (file, frame) = pos_map[i];
        if j == 0 {
            file as i64
        } else {
            frame as i64
        }
    });
    let dataset = create_fixed_dataset::<i64, _>(group, "pos_map", values.dim(), None)?;
    if !values.is_empty() {
        dataset.write(values.view())?;
    }
    Ok(())
}

fn read_pos_map(group: &Group) -> Result<Vec<(usize, usize)>> {
    let dataset = group.dataset("pos_map")?;
    if dataset.size() == 0 {
        return Ok(Vec::new());
    }
    let values = dataset.read_2d::<i64>()?;
    if values.ncols() != 2 {
        return Err(Error::InvalidFormat("pos_map must have two columns".to_string()));
    }
    Ok(values
        .rows()
        .into_iter()
        .map(|r| (r[0].max(0) as usize, r[1].max(0) as usize))
        .collect())
}

fn read_matrix(group: &Group, name: &str) -> Result<Array2<f64>> {
    let dataset = group.dataset(name)?;
    if dataset.size() == 0 {
        let shape = dataset.shape();
        let cols = shape.get(1).copied().unwrap_or(0);
        return Ok(Array2::zeros((0, cols)));
    }
    Ok(dataset.read_2d::<f64>()?)
}

fn read_matrix_opt(group: &Group, name: &str) -> Result<Option<Array2<f64>>> {
    if group.link_exists(name) {
        read_matrix(group, name).map(Some)
    } else {
        Ok(None)
    }
}

fn read_usize_vec(group: &Group, name: &str) -> Result<Vec<usize>> {
    Ok(read_dataset_vec::<i64>(group, name)?
        .into_iter()
        .map(|v| v.max(0) as usize)
        .collect())
}

fn read_files(group: &Group) -> Result<Vec<PathBuf>> {
    Ok(read_dataset_vec::<VarLenUnicode>(group, "files")?
        .into_iter()
        .map(|s| PathBuf::from(s.as_str()))
        .collect())
}

fn non_empty_path(value: Option<String>) -> Option<PathBuf> {
    value.filter(|s| !s.is_empty()).map(PathBuf::from)
}

fn read_modern(processed: &Group) -> Result<StoredBatch> {
    let result = processed.group("result")?;
    let process = processed.group("process")?;
    let mask_shape = read_dataset_vec_opt::<i64>(&process, "mask_shape")?.and_then(|v| match v[..] {
        [r, c] => Some((r.max(0) as usize, c.max(0) as usize)),
        _ => None,
    });
    let info = ProcessInfo {
        cal_file: non_empty_path(read_string_dataset_opt(&process, "cal_file")),
        mask_file: non_empty_path(read_string_dataset_opt(&process, "mask_file")),
        mask_shape,
        int_method: read_string_dataset_opt(&process, "int_method").unwrap_or_default(),
        int_unit: read_string_dataset_opt(&process, "int_unit").unwrap_or_default(),
        num_points: process
            .dataset("num_points")
            .and_then(|d| d.read_scalar::<i64>())
            .map_or(0, |v| v.max(0) as usize),
    };
    Ok(StoredBatch {
        data: read_matrix(&result, "data")?,
        binning: read_dataset_vec::<f64>(&result, "binning")?,
        bkg: read_matrix_opt(&process, "bkg")?,
        files: read_files(&process)?,
        file_map: read_usize_vec(&process, "file_map")?,
        pos_map: read_pos_map(&process)?,
        process: info,
    })
}

fn read_legacy(file: &File) -> Result<StoredBatch> {
    let binning = read_dataset_vec::<f64>(file, "binning")?;
    let info = ProcessInfo {
        cal_file: non_empty_path(read_attr_opt_string(file, "calibration")?),
        mask_file: non_empty_path(read_attr_opt_string(file, "mask")?),
        int_unit: "2th_deg".to_string(),
        num_points: binning.len(),
        ..ProcessInfo::default()
    };
    Ok(StoredBatch {
        data: read_matrix(file, "data")?,
        binning,
        bkg: read_matrix_opt(file, "bkg")?,
        files: read_files(file)?,
        file_map: read_usize_vec(file, "file_map")?,
        pos_map: read_pos_map(file)?,
        process: info,
    })
}

/// Reads a batch stack, recognising the `/processed` layout and the older
/// flat one.
///
/// # Errors
/// Returns an error if HDF5 I/O fails or neither layout is present.
pub fn read_batch_hdf5<P: AsRef<Path>>(path: P) -> Result<StoredBatch> {
    let file = File::open(path)?;
    if let Ok(processed) = file.group("processed") {
        read_modern(&processed)
    } else if file.link_exists("data") {
        read_legacy(&file)
    } else {
        Err(Error::InvalidFormat(format!(
            "{}: neither /processed nor /data present",
            file.filename()
        )))
    }
}

/// Saves the stack of `model`.
///
/// # Errors
/// As [`write_batch_hdf5`].
pub fn save_batch<P: AsRef<Path>>(path: P, model: &BatchModel) -> Result<()> {
    write_batch_hdf5(path, &model.to_stored())
}

/// Loads a stack and tries to bring its calibration (and mask) into
/// `config`. Missing or unreadable companions are logged; the stack is
/// returned regardless.
///
/// # Errors
/// As [`read_batch_hdf5`] and [`BatchModel::from_stored`]; `config` is not
/// touched when the stack is rejected.
pub fn load_batch<P: AsRef<Path>>(path: P, config: &mut Configuration) -> Result<BatchModel> {
    let model = BatchModel::from_stored(read_batch_hdf5(path)?)?;
    let process = model.process();
    match &process.cal_file {
        Some(cal) if cal.is_file() => {
            if let Err(e) = config.load_calibration(cal) {
                log::warn!("could not load calibration {}: {e}", cal.display());
            }
        }
        Some(cal) => log::warn!("calibration {} not found; loading data only", cal.display()),
        None => log::warn!("stack names no calibration; loading data only"),
    }
    if let Some(mask) = process.mask_file.as_ref().filter(|m| m.is_file()) {
        let shape = process.mask_shape.unwrap_or(config.mask.shape());
        config.mask.set_dimension(shape);
        if let Err(e) = config.load_mask(mask) {
            log::warn!("could not load mask {}: {e}", mask.display());
        }
    }
    Ok(model)
}

// ---- small readers ----

fn read_dataset_vec<T: H5Type>(group: &Group, name: &str) -> Result<Vec<T>> {
    let dataset = group.dataset(name)?;
    if dataset.size() == 0 {
        return Ok(Vec::new());
    }
    Ok(dataset.read_raw::<T>()?)
}

fn read_dataset_vec_opt<T: H5Type>(group: &Group, name: &str) -> Result<Option<Vec<T>>> {
    match group.dataset(name) {
        Ok(dataset) => Ok(Some(dataset.read_raw::<T>()?)),
        Err(_) => Ok(None),
    }
}

fn read_string_dataset_opt(group: &Group, name: &str) -> Option<String> {
    let dataset = group.dataset(name).ok()?;
    dataset
        .read_scalar::<VarLenUnicode>()
        .map(|v| v.to_string())
        .or_else(|_| {
            dataset
                .read_scalar::<hdf5::types::VarLenAscii>()
                .map(|v| v.to_string())
        })
        .ok()
}

fn read_attr_opt_string(group: &Group, name: &str) -> Result<Option<String>> {
    match group.attr(name) {
        Ok(attr) => {
            let value: VarLenUnicode = attr.read_scalar()?;
            Ok(Some(value.to_string()))
        }
        Err(_) => Ok(None),
    }
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::{tempdir, NamedTempFile};

    fn stored() -> StoredBatch {
        StoredBatch {
            data: Array2::from_shape_fn((3, 5), |(r, c)| (r * 10 + c) as f64),
            binning: vec![1.0, 1.5, 2.0, 2.5, 3.0],
            bkg: Some(Array2::from_elem((3, 5), 0.5)),
            files: vec!["/data/a.h5".into(), "/data/b.h5".into()],
            file_map: vec![0, 2, 3],
            pos_map: vec![(0, 0), (0, 1), (1, 0)],
            process: ProcessInfo {
                cal_file: Some("/cal/ceo2.poni".into()),
                mask_file: None,
                mask_shape: None,
                int_method: "csr".into(),
                int_unit: "2th_deg".into(),
                num_points: 5,
            },
        }
    }

    #[test]
    fn test_batch_round_trip_modern_layout() {
        let file = NamedTempFile::new().unwrap();
        let original = stored();
        write_batch_hdf5(file.path(), &original).unwrap();

        let h5 = File::open(file.path()).unwrap();
        let result = h5.group("processed/result").unwrap();
        assert_eq!(result.dataset("data").unwrap().shape(), vec![3, 5]);
        drop(h5);

        let read = read_batch_hdf5(file.path()).unwrap();
        assert_eq!(read, original);
    }

    #[test]
    fn test_empty_stack_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let empty = StoredBatch {
            data: Array2::zeros((0, 0)),
            file_map: vec![0],
            ..StoredBatch::default()
        };
        write_batch_hdf5(file.path(), &empty).unwrap();
        let read = read_batch_hdf5(file.path()).unwrap();
        assert_eq!(read.data.nrows(), 0);
        assert!(read.pos_map.is_empty());
    }

    #[test]
    fn test_legacy_layout() {
        let file = NamedTempFile::new().unwrap();
        {
            let h5 = File::create(file.path()).unwrap();
            let data = Array2::from_elem((2, 3), 7.0f32);
            create_fixed_dataset::<f32, _>(&h5, "data", (2, 3), None)
                .unwrap()
                .write(data.view())
                .unwrap();
            write_vec(&h5, "binning", &[1.0f64, 2.0, 3.0]).unwrap();
            write_vec(&h5, "file_map", &[0i64, 2]).unwrap();
            write_vec(&h5, "files", &[to_var_len_unicode("x.h5").unwrap()]).unwrap();
            write_pos_map(&h5, &[(0, 0), (0, 1)]).unwrap();
            set_attr_str_group(&h5, "calibration", "old.poni").unwrap();
        }
        let read = read_batch_hdf5(file.path()).unwrap();
        assert_eq!(read.data.dim(), (2, 3));
        assert_eq!(read.process.cal_file, Some(PathBuf::from("old.poni")));
        assert_eq!(BatchModel::from_stored(read).unwrap().n_frames(), 2);
    }

    #[test]
    fn test_load_batch_without_calibration_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stack.h5");
        write_batch_hdf5(&path, &stored()).unwrap();
        let mut config = Configuration::new();
        let model = load_batch(&path, &mut config).unwrap();
        assert_eq!(model.data().dim(), (3, 5));
        assert!(!config.calibration.is_calibrated());
    }

    #[test]
    fn test_detector_frames() {
        let file = NamedTempFile::new().unwrap();
        {
            let h5 = File::create(file.path()).unwrap();
            let detector = h5
                .create_group("entry")
                .and_then(|g| g.create_group("instrument"))
                .and_then(|g| g.create_group("detector"))
                .unwrap();
            let frames = Array3::from_shape_fn((4, 3, 2), |(f, r, c)| (f * 100 + r * 2 + c) as u16);
            create_fixed_dataset::<u16, _>(&detector, "data", (4, 3, 2), None)
                .unwrap()
                .write(frames.view())
                .unwrap();
            write_scalar_str(&detector, "description", "Lambda 750K").unwrap();
            let translation = detector.create_group("translation").unwrap();
            write_vec(&translation, "distance", &[12.0f64, 30.0, 0.0]).unwrap();
        }
        let h5 = File::open(file.path()).unwrap();
        assert_eq!(detector_frame_count(&h5).unwrap(), 4);
        let image = read_detector_frame(&h5, 2).unwrap();
        assert_eq!(image.img_data.dim(), (3, 2));
        assert_eq!(image.img_data[[2, 1]], 205.0);
        assert_eq!(image.series_max, 4);
        assert_eq!(image.file_info.get("description").map(String::as_str), Some("Lambda 750K"));
        assert!(read_detector_frame(&h5, 4).is_err());
        assert_eq!(read_module_translation(&h5).unwrap(), (30.0, 12.0));
    }
}
