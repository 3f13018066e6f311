//! Conversions between two-theta, scattering vector Q and d-spacing.
//!
//! Wavelengths are always given in metres. Two-theta is in degrees,
//! Q in inverse Angstrom and d-spacing in Angstrom.

use crate::error::{Error, Result};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Radial unit of an integrated pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IntegrationUnit {
    /// Two-theta in degrees (`2th_deg`).
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "2th_deg"))]
    TwoThetaDeg,
    /// Scattering vector magnitude in inverse Angstrom (`q_A^-1`).
    #[cfg_attr(feature = "serde", serde(rename = "q_A^-1"))]
    QInvAngstrom,
    /// d-spacing in Angstrom (`d_A`).
    #[cfg_attr(feature = "serde", serde(rename = "d_A"))]
    DSpacing,
}

impl IntegrationUnit {
    /// All supported units, in tag order.
    pub const ALL: [IntegrationUnit; 3] = [
        IntegrationUnit::TwoThetaDeg,
        IntegrationUnit::QInvAngstrom,
        IntegrationUnit::DSpacing,
    ];

    /// The string tag used in files and settings.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationUnit::TwoThetaDeg => "2th_deg",
            IntegrationUnit::QInvAngstrom => "q_A^-1",
            IntegrationUnit::DSpacing => "d_A",
        }
    }

    /// Human readable axis label.
    #[must_use]
    pub fn axis_label(self) -> &'static str {
        match self {
            IntegrationUnit::TwoThetaDeg => "2-Theta Angle (Degrees)",
            IntegrationUnit::QInvAngstrom => "Q (A^-1)",
            IntegrationUnit::DSpacing => "d (A)",
        }
    }
}

impl fmt::Display for IntegrationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "2th_deg" | "2th" | "tth" => Ok(IntegrationUnit::TwoThetaDeg),
            "q_A^-1" | "q" => Ok(IntegrationUnit::QInvAngstrom),
            "d_A" | "d" => Ok(IntegrationUnit::DSpacing),
            other => Err(Error::UnknownUnit(other.to_string())),
        }
    }
}

fn check_wavelength(wavelength: f64) -> Result<()> {
    if wavelength.is_finite() && wavelength > 0.0 {
        Ok(())
    } else {
        Err(Error::UnitDomain(format!(
            "wavelength must be positive, got {wavelength}"
        )))
    }
}

fn checked_asin(arg: f64) -> Result<f64> {
    if arg.is_finite() && (-1.0..=1.0).contains(&arg) {
        Ok(arg.asin())
    } else {
        Err(Error::UnitDomain(format!("arcsin argument {arg} outside [-1, 1]")))
    }
}

/// Converts two-theta (degrees) to Q (inverse Angstrom).
///
/// # Errors
/// Returns `UnitDomain` for a non-positive wavelength.
pub fn tth_to_q(tth_deg: f64, wavelength: f64) -> Result<f64> {
    check_wavelength(wavelength)?;
    Ok(4.0 * PI * (tth_deg * PI / 360.0).sin() / (wavelength * 1e10))
}

/// Converts Q (inverse Angstrom) to two-theta (degrees).
///
/// # Errors
/// Returns `UnitDomain` if Q is not reachable with this wavelength.
pub fn q_to_tth(q: f64, wavelength: f64) -> Result<f64> {
    check_wavelength(wavelength)?;
    Ok(360.0 / PI * checked_asin(q * wavelength * 1e10 / (4.0 * PI))?)
}

/// Converts two-theta (degrees) to d-spacing (Angstrom).
///
/// # Errors
/// Returns `UnitDomain` for a zero angle or non-positive wavelength.
pub fn tth_to_d(tth_deg: f64, wavelength: f64) -> Result<f64> {
    check_wavelength(wavelength)?;
    let sin_theta = (tth_deg * PI / 360.0).sin();
    if sin_theta == 0.0 {
        return Err(Error::UnitDomain(
            "d-spacing is undefined at two-theta = 0".to_string(),
        ));
    }
    Ok(wavelength * 1e10 / (2.0 * sin_theta))
}

/// Converts d-spacing (Angstrom) to two-theta (degrees).
///
/// # Errors
/// Returns `UnitDomain` if d <= 0 or the reflection is not reachable.
pub fn d_to_tth(d: f64, wavelength: f64) -> Result<f64> {
    check_wavelength(wavelength)?;
    if d.is_nan() || d <= 0.0 {
        return Err(Error::UnitDomain(format!(
            "d-spacing must be positive, got {d}"
        )));
    }
    Ok(360.0 / PI * checked_asin(wavelength / (2.0 * d * 1e-10))?)
}

/// Converts a value in `from_unit` to two-theta in degrees.
///
/// # Errors
/// Returns `UnitDomain` if the value has no two-theta equivalent.
pub fn to_two_theta(value: f64, wavelength: f64, from_unit: IntegrationUnit) -> Result<f64> {
    match from_unit {
        IntegrationUnit::TwoThetaDeg => Ok(value),
        IntegrationUnit::QInvAngstrom => q_to_tth(value, wavelength),
        IntegrationUnit::DSpacing => d_to_tth(value, wavelength),
    }
}

/// Converts a value in `from_unit` to two-theta in radians.
///
/// # Errors
/// Returns `UnitDomain` if the value has no two-theta equivalent.
pub fn to_two_theta_rad(value: f64, wavelength: f64, from_unit: IntegrationUnit) -> Result<f64> {
    to_two_theta(value, wavelength, from_unit).map(f64::to_radians)
}

/// Converts a single value between any two units.
///
/// # Errors
/// Returns `UnitDomain` when an intermediate value leaves the physical domain.
pub fn convert(
    value: f64,
    wavelength: f64,
    from_unit: IntegrationUnit,
    to_unit: IntegrationUnit,
) -> Result<f64> {
    if from_unit == to_unit {
        return Ok(value);
    }
    let tth = to_two_theta(value, wavelength, from_unit)?;
    match to_unit {
        IntegrationUnit::TwoThetaDeg => Ok(tth),
        IntegrationUnit::QInvAngstrom => tth_to_q(tth, wavelength),
        IntegrationUnit::DSpacing => tth_to_d(tth, wavelength),
    }
}

/// Converts a string-tagged value, rejecting unknown tags.
///
/// # Errors
/// Returns `UnknownUnit` for unrecognised tags and `UnitDomain` as [`convert`].
pub fn convert_tagged(value: f64, wavelength: f64, from_unit: &str, to_unit: &str) -> Result<f64> {
    convert(value, wavelength, from_unit.parse()?, to_unit.parse()?)
}

/// Converts a whole axis between units.
///
/// # Errors
/// Returns the first domain error encountered.
pub fn convert_axis(
    values: &[f64],
    wavelength: f64,
    from_unit: IntegrationUnit,
    to_unit: IntegrationUnit,
) -> Result<Vec<f64>> {
    values
        .iter()
        .map(|&v| convert(v, wavelength, from_unit, to_unit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const LAMBDA: f64 = 0.4066e-10;

    #[test]
    fn test_tth_to_q_reference_value() {
        let q = convert(10.0, LAMBDA, IntegrationUnit::TwoThetaDeg, IntegrationUnit::QInvAngstrom)
            .unwrap();
        assert_relative_eq!(q, 2.6938, epsilon = 1e-3);
        let back =
            convert(q, LAMBDA, IntegrationUnit::QInvAngstrom, IntegrationUnit::TwoThetaDeg).unwrap();
        assert!((back - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_round_trip_all_pairs() {
        let tth_values = [0.5, 3.0, 10.0, 25.0, 60.0];
        for &tth in &tth_values {
            for from in IntegrationUnit::ALL {
                let v = convert(tth, LAMBDA, IntegrationUnit::TwoThetaDeg, from).unwrap();
                for to in IntegrationUnit::ALL {
                    let there = convert(v, LAMBDA, from, to).unwrap();
                    let back = convert(there, LAMBDA, to, from).unwrap();
                    assert_relative_eq!(back, v, max_relative = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_d_spacing_domain() {
        assert!(matches!(d_to_tth(0.0, LAMBDA), Err(Error::UnitDomain(_))));
        assert!(matches!(d_to_tth(-1.0, LAMBDA), Err(Error::UnitDomain(_))));
        // lambda / (2 d) > 1
        assert!(matches!(d_to_tth(0.01, LAMBDA), Err(Error::UnitDomain(_))));
    }

    #[test]
    fn test_q_domain() {
        assert!(matches!(q_to_tth(1000.0, LAMBDA), Err(Error::UnitDomain(_))));
    }

    #[test]
    fn test_unknown_unit_tag() {
        let err = convert_tagged(1.0, LAMBDA, "2th_deg", "r_mm").unwrap_err();
        assert_eq!(err, Error::UnknownUnit("r_mm".to_string()));
        assert_eq!("q_A^-1".parse::<IntegrationUnit>().unwrap(), IntegrationUnit::QInvAngstrom);
    }

    #[test]
    fn test_d_spacing_reference() {
        // Bragg: lambda = 2 d sin(theta)
        let d = tth_to_d(10.0, LAMBDA).unwrap();
        assert_relative_eq!(
            2.0 * d * (5.0_f64.to_radians()).sin(),
            LAMBDA * 1e10,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            to_two_theta_rad(d, LAMBDA, IntegrationUnit::DSpacing).unwrap(),
            10.0_f64.to_radians(),
            max_relative = 1e-12
        );
    }
}
