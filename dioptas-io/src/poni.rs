//! PONI calibration files.
//!
//! Plain text, one `Key: value` record per line, `#` comments. Both the
//! flat `PixelSize1`/`PixelSize2` records and the `Detector_config` JSON
//! blob of newer writers are understood.

use crate::{Error, Result};
use dioptas_core::calibration::{Calibration, PoniParameters};
use std::fmt::Write as _;
use std::path::Path;

fn parse_value(key: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidFormat(format!("PONI record {key}: '{value}' is not a number")))
}

/// Parses PONI text.
///
/// Records that are absent keep the [`PoniParameters::default`] value,
/// except the distance, which is required.
///
/// # Errors
/// `InvalidFormat` for unparsable numbers or a missing distance; `Core`
/// when the resulting set is physically invalid.
pub fn parse_poni(text: &str) -> Result<PoniParameters> {
    let mut poni = PoniParameters::default();
    let mut has_dist = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        match key.as_str() {
            "dist" | "distance" => {
                poni.dist = parse_value(&key, value)?;
                has_dist = true;
            }
            "poni1" => poni.poni1 = parse_value(&key, value)?,
            "poni2" => poni.poni2 = parse_value(&key, value)?,
            "rot1" => poni.rot1 = parse_value(&key, value)?,
            "rot2" => poni.rot2 = parse_value(&key, value)?,
            "rot3" => poni.rot3 = parse_value(&key, value)?,
            "pixel1" | "pixelsize1" => poni.pixel1 = parse_value(&key, value)?,
            "pixel2" | "pixelsize2" => poni.pixel2 = parse_value(&key, value)?,
            "wavelength" => poni.wavelength = parse_value(&key, value)?,
            "polarization_factor" | "polarization" => {
                poni.polarization_factor = parse_value(&key, value)?;
            }
            "detector_config" => {
                let config: serde_json::Value = serde_json::from_str(value.trim())?;
                if let Some(p) = config.get("pixel1").and_then(serde_json::Value::as_f64) {
                    poni.pixel1 = p;
                }
                if let Some(p) = config.get("pixel2").and_then(serde_json::Value::as_f64) {
                    poni.pixel2 = p;
                }
            }
            _ => log::debug!("ignoring PONI record '{key}'"),
        }
    }
    if !has_dist {
        return Err(Error::InvalidFormat("PONI file lacks a distance".to_string()));
    }
    poni.validate()?;
    Ok(poni)
}

/// Formats a PONI set. Values are written with round-trip precision.
#[must_use]
pub fn format_poni(poni: &PoniParameters, name: Option<&str>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Nota: C-Order, 1 refers to the Y axis, 2 to the X axis");
    if let Some(name) = name {
        let _ = writeln!(out, "# Calibration: {name}");
    }
    let _ = writeln!(out, "PixelSize1: {:?}", poni.pixel1);
    let _ = writeln!(out, "PixelSize2: {:?}", poni.pixel2);
    let _ = writeln!(out, "Distance: {:?}", poni.dist);
    let _ = writeln!(out, "Poni1: {:?}", poni.poni1);
    let _ = writeln!(out, "Poni2: {:?}", poni.poni2);
    let _ = writeln!(out, "Rot1: {:?}", poni.rot1);
    let _ = writeln!(out, "Rot2: {:?}", poni.rot2);
    let _ = writeln!(out, "Rot3: {:?}", poni.rot3);
    let _ = writeln!(out, "Wavelength: {:?}", poni.wavelength);
    let _ = writeln!(out, "Polarization_factor: {:?}", poni.polarization_factor);
    out
}

/// Reads a PONI file into a calibrated [`Calibration`] named after the
/// file stem.
///
/// # Errors
/// `FileIo` if the file cannot be read, otherwise as [`parse_poni`].
pub fn read_poni<P: AsRef<Path>>(path: P) -> Result<Calibration> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
    let poni = parse_poni(&text)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned());
    Ok(Calibration::from_poni(poni, name)?)
}

/// Writes the working geometry of `calibration`.
///
/// # Errors
/// `Core(NotCalibrated)` without a geometry, `FileIo` on write failure.
pub fn write_poni<P: AsRef<Path>>(path: P, calibration: &Calibration) -> Result<()> {
    let path = path.as_ref();
    let poni = calibration.geometry()?.poni();
    let text = format_poni(poni, calibration.name.as_deref());
    std::fs::write(path, text).map_err(|e| Error::file(path, e))
}
