//! Mask files: single-page TIFF, nonzero pixels are masked.

use crate::loader::read_tiff_array;
use crate::{Error, Result};
use dioptas_core::mask::Mask;
use ndarray::Array2;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tiff::encoder::{colortype, TiffEncoder};

/// Reads a mask field.
///
/// # Errors
/// `FileIo` or `Tiff` when the file cannot be decoded.
pub fn read_mask<P: AsRef<Path>>(path: P) -> Result<Array2<bool>> {
    let (data, _) = read_tiff_array(path.as_ref(), 0)?;
    Ok(data.mapv(|v| v != 0.0))
}

/// Writes a mask field as an 8-bit TIFF (1 = masked).
///
/// # Errors
/// `FileIo` or `Tiff` on write failure.
pub fn write_mask<P: AsRef<Path>>(path: P, field: &Array2<bool>) -> Result<()> {
    let path = path.as_ref();
    let (rows, cols) = field.dim();
    let width = u32::try_from(cols)
        .map_err(|_| Error::InvalidFormat(format!("mask too wide for TIFF: {cols}")))?;
    let height = u32::try_from(rows)
        .map_err(|_| Error::InvalidFormat(format!("mask too tall for TIFF: {rows}")))?;
    let bytes: Vec<u8> = field.iter().map(|&m| u8::from(m)).collect();

    let file = File::create(path).map_err(|e| Error::file(path, e))?;
    let mut tiff = TiffEncoder::new(BufWriter::new(file))?;
    tiff.write_image::<colortype::Gray8>(width, height, &bytes)?;
    Ok(())
}

/// Loads a mask file into `mask`, recording the change for undo.
///
/// # Errors
/// As [`read_mask`]; `Core(ShapeMismatch)` when the field does not match
/// the mask dimension.
pub fn load_mask_into<P: AsRef<Path>>(mask: &mut Mask, path: P) -> Result<()> {
    let field = read_mask(path)?;
    mask.set_field(field)?;
    Ok(())
}
