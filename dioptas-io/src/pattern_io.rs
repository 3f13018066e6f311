//! Integrated pattern files: `.chi`, `.fxye` and plain columns (`.xy`,
//! `.dat`, anything else).
#![allow(clippy::cast_precision_loss)]

use crate::{Error, Result};
use dioptas_core::pattern::Pattern;
use dioptas_core::units::IntegrationUnit;
use std::fmt::Write as _;
use std::path::Path;

/// Formats like C's `%.7E`: seven mantissa digits and a signed two-digit
/// exponent (`1.2345670E+01`).
fn sci(value: f64) -> String {
    let formatted = format!("{value:.7E}");
    let Some((mantissa, exponent)) = formatted.split_once('E') else {
        return formatted;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return formatted;
    };
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}E{sign}{:02}", exponent.abs())
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

fn unit_from_label(label: &str) -> IntegrationUnit {
    let label = label.trim();
    if let Ok(unit) = label.parse() {
        return unit;
    }
    if label.starts_with('Q') || label.starts_with('q') {
        IntegrationUnit::QInvAngstrom
    } else if label.starts_with("d ") || label.starts_with("d(") || label == "d" {
        IntegrationUnit::DSpacing
    } else {
        IntegrationUnit::TwoThetaDeg
    }
}

/// Writes `pattern` to `path`, choosing the layout from the extension.
///
/// With `subtract_background` the processed series is written, otherwise
/// the raw one. `wavelength` (metres) only appears in `.fxye` headers.
/// A custom `header` replaces the default header of `.chi` and plain
/// files and becomes the title line of `.fxye` files.
///
/// # Errors
/// `FileIo` on write failure, `Core(EmptyPattern)` for `.fxye` with fewer
/// than two points.
pub fn save_pattern<P: AsRef<Path>>(
    pattern: &Pattern,
    path: P,
    header: Option<&str>,
    subtract_background: bool,
    wavelength: f64,
) -> Result<()> {
    let path = path.as_ref();
    let (x, y) = if subtract_background {
        pattern.data()
    } else {
        (pattern.original_x(), pattern.original_y())
    };
    let unit = pattern.unit();
    let mut out = String::new();
    match extension(path).as_str() {
        "chi" => {
            match header {
                Some(h) => {
                    let _ = writeln!(out, "{h}");
                }
                None => {
                    let _ = writeln!(out, "{}", path.display().to_string().replace('\\', "/"));
                    let _ = writeln!(out, "{}", unit.axis_label());
                    let _ = writeln!(out);
                    let _ = writeln!(out, "{}", x.len());
                }
            }
            for (a, b) in x.iter().zip(y) {
                let _ = writeln!(out, " {}  {}", sci(*a), sci(*b));
            }
        }
        "fxye" => {
            if x.len() < 2 {
                return Err(dioptas_core::Error::EmptyPattern.into());
            }
            let (tag, factor) = match unit {
                IntegrationUnit::QInvAngstrom => ("CONQ", 1.0),
                _ => ("CONS", 100.0),
            };
            let n = x.len();
            let start = x[0] * factor;
            let step = (x[n - 1] - x[0]) / (n - 1) as f64 * factor;
            let _ = writeln!(out, "{}", header.unwrap_or(&pattern.name));
            let _ = writeln!(out, "Instrument parameter file: ");
            let _ = writeln!(out, "# Wavelength (pm): {}", wavelength * 1e12);
            let _ = writeln!(out, "BANK\t1\t{n}\t{n}\t{tag}\t{start}\t{step}\t0\t0\tFXYE");
            for (a, b) in x.iter().zip(y) {
                let _ = writeln!(out, "\t{}\t{}\t{}", a * factor, b, b.max(0.0).sqrt());
            }
        }
        _ => {
            match header {
                Some(h) => {
                    for line in h.lines() {
                        let _ = writeln!(out, "# {line}");
                    }
                }
                None => {
                    let _ = writeln!(out, "# {}", pattern.name);
                    let _ = writeln!(out, "# {}\tI", unit.as_str());
                }
            }
            for (a, b) in x.iter().zip(y) {
                let _ = writeln!(out, "{}\t{}", sci(*a), sci(*b));
            }
        }
    }
    std::fs::write(path, out).map_err(|e| Error::file(path, e))
}

fn parse_columns(lines: &[&str], x_factor: f64) -> (Vec<f64>, Vec<f64>) {
    let mut x = Vec::new();
    let mut y = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut values = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(str::parse::<f64>);
        if let (Some(Ok(a)), Some(Ok(b))) = (values.next(), values.next()) {
            x.push(a / x_factor);
            y.push(b);
        }
    }
    (x, y)
}

/// Reads a pattern file, skipping `skiprows` leading lines for plain
/// column files. The pattern is named after the file stem.
///
/// # Errors
/// `FileIo` if unreadable, `InvalidFormat` without a single data row.
pub fn load_pattern<P: AsRef<Path>>(path: P, skiprows: usize) -> Result<Pattern> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
    let lines: Vec<&str> = text.lines().collect();
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (x, y, unit) = match extension(path).as_str() {
        "chi" => {
            let unit = lines.get(1).map_or(IntegrationUnit::TwoThetaDeg, |l| unit_from_label(l));
            let (x, y) = parse_columns(lines.get(4..).unwrap_or_default(), 1.0);
            (x, y, unit)
        }
        "fxye" => {
            let bank = lines
                .iter()
                .position(|l| l.trim_start().starts_with("BANK"))
                .ok_or_else(|| Error::InvalidFormat(format!("{}: no BANK record", path.display())))?;
            let q = lines[bank].contains("CONQ");
            let (unit, factor) = if q {
                (IntegrationUnit::QInvAngstrom, 1.0)
            } else {
                (IntegrationUnit::TwoThetaDeg, 100.0)
            };
            let (x, y) = parse_columns(&lines[bank + 1..], factor);
            (x, y, unit)
        }
        _ => {
            let unit = lines
                .iter()
                .take_while(|l| l.trim_start().starts_with('#'))
                .find_map(|l| {
                    let tag = l.trim_start_matches('#').split_whitespace().next()?;
                    tag.parse::<IntegrationUnit>().ok()
                })
                .unwrap_or_default();
            let (x, y) = parse_columns(lines.get(skiprows..).unwrap_or_default(), 1.0);
            (x, y, unit)
        }
    };
    if x.is_empty() {
        return Err(Error::InvalidFormat(format!(
            "{}: no data rows",
            path.display()
        )));
    }
    Ok(Pattern::new(x, y, name)?.with_unit(unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dioptas_core::background::BackgroundParameters;
    use tempfile::tempdir;

    fn sample() -> Pattern {
        let x: Vec<f64> = (0..50).map(|i| 1.0 + 0.1 * f64::from(i)).collect();
        let y: Vec<f64> = x.iter().map(|v| 100.0 + 10.0 * (v * 3.0).sin()).collect();
        Pattern::new(x, y, "sample").unwrap()
    }

    #[test]
    fn test_sci_matches_c_format() {
        assert_eq!(sci(12.345_67), "1.2345670E+01");
        assert_eq!(sci(0.000_123), "1.2300000E-04");
        assert_eq!(sci(0.0), "0.0000000E+00");
    }

    #[test]
    fn test_chi_header_and_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.chi");
        let pattern = sample();
        save_pattern(&pattern, &path, None, false, 0.3344e-10).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "2-Theta Angle (Degrees)");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "50");

        let loaded = load_pattern(&path, 0).unwrap();
        assert_eq!(loaded.len(), 50);
        assert_eq!(loaded.name, "p");
        assert_relative_eq!(loaded.x()[7], pattern.x()[7], max_relative = 1e-7);
    }

    #[test]
    fn test_fxye_scaling_and_units() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.fxye");
        save_pattern(&sample(), &path, None, false, 0.3344e-10).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("CONS\t100\t10"));
        assert!(text.contains("33.44"));
        let loaded = load_pattern(&path, 0).unwrap();
        assert_relative_eq!(loaded.x()[0], 1.0, epsilon = 1e-12);
        assert_eq!(loaded.unit(), IntegrationUnit::TwoThetaDeg);

        let q = sample().with_unit(IntegrationUnit::QInvAngstrom);
        save_pattern(&q, &path, None, false, 0.3344e-10).unwrap();
        let loaded = load_pattern(&path, 0).unwrap();
        assert_eq!(loaded.unit(), IntegrationUnit::QInvAngstrom);
        assert_relative_eq!(loaded.x()[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_xy_background_subtracted_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.xy");
        let mut pattern = sample();
        pattern.set_auto_background_subtraction(BackgroundParameters::default(), None);
        save_pattern(&pattern, &path, Some("custom"), true, 1e-10).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# custom\n"));
        let loaded = load_pattern(&path, 0).unwrap();
        assert_eq!(loaded.len(), pattern.len());
        assert_relative_eq!(loaded.y()[10], pattern.y()[10], epsilon = 1e-5, max_relative = 1e-6);
    }

    #[test]
    fn test_plain_columns_with_skiprows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.dat");
        std::fs::write(&path, "title line\n1.0, 2.0\n2.0 4.0\n").unwrap();
        let loaded = load_pattern(&path, 1).unwrap();
        assert_eq!(loaded.x(), &[1.0, 2.0]);
        assert_eq!(loaded.y(), &[2.0, 4.0]);
        assert!(load_pattern(dir.path().join("missing.xy"), 0).is_err());
    }
}
