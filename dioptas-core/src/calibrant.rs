//! Calibrant reference: tabulated d-spacings of a known material.

use crate::units::d_to_tth;

/// A calibrant such as CeO2 or LaB6.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Calibrant {
    pub name: String,
    /// d-spacings in Angstrom, largest first.
    pub d_spacings: Vec<f64>,
}

impl Calibrant {
    /// Creates a calibrant; d-spacings are sorted in decreasing order.
    #[must_use]
    pub fn new(name: impl Into<String>, mut d_spacings: Vec<f64>) -> Self {
        d_spacings.retain(|d| d.is_finite() && *d > 0.0);
        d_spacings.sort_by(|a, b| b.total_cmp(a));
        Self {
            name: name.into(),
            d_spacings,
        }
    }

    /// Two-theta (radians) of every ring reachable at `wavelength`;
    /// unreachable rings are `None`, so indices line up with `d_spacings`.
    #[must_use]
    pub fn two_theta_rings(&self, wavelength: f64) -> Vec<Option<f64>> {
        self.d_spacings
            .iter()
            .map(|&d| d_to_tth(d, wavelength).ok().map(f64::to_radians))
            .collect()
    }

    /// Two-theta (radians) of ring `index`, if it exists and is reachable.
    #[must_use]
    pub fn ring_two_theta(&self, index: usize, wavelength: f64) -> Option<f64> {
        let d = *self.d_spacings.get(index)?;
        d_to_tth(d, wavelength).ok().map(f64::to_radians)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rings_sorted_and_reachable() {
        let cal = Calibrant::new("CeO2", vec![1.1, 3.124, 0.0, 2.705, 0.01]);
        assert_eq!(cal.d_spacings, vec![3.124, 2.705, 1.1, 0.01]);
        let rings = cal.two_theta_rings(0.3344e-10);
        assert!(rings[0].unwrap() < rings[1].unwrap());
        assert!(rings[3].is_none());
        assert!(cal.ring_two_theta(10, 0.3344e-10).is_none());
    }
}
