//! Automatic background estimation for 1D patterns.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use crate::error::{Error, Result};
use nalgebra::{DMatrix, DVector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Smoothing width (x units), iteration count and Chebyshev order.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BackgroundParameters {
    pub smooth_width: f64,
    pub iterations: usize,
    pub cheb_order: usize,
}

impl Default for BackgroundParameters {
    fn default() -> Self {
        Self {
            smooth_width: 0.1,
            iterations: 50,
            cheb_order: 50,
        }
    }
}

/// Iteratively clips every point above its running window mean
/// (Brückner smoothing). `half_width` is the window half width in points.
#[must_use]
pub fn smooth_bruckner(y: &[f64], half_width: usize, iterations: usize) -> Vec<f64> {
    let n_data = y.len();
    if n_data == 0 {
        return Vec::new();
    }
    let n = half_width;
    let first = y[0];
    let last = y[n_data - 1];
    let mut padded = Vec::with_capacity(n_data + 2 * n);
    padded.extend(std::iter::repeat(first).take(n));
    padded.extend_from_slice(y);
    padded.extend(std::iter::repeat(last).take(n));

    let avg = padded.iter().sum::<f64>() / padded.len() as f64;
    let min = padded.iter().copied().fold(f64::INFINITY, f64::min);
    let cap = avg + 2.0 * (avg - min);
    for v in &mut padded {
        if *v > cap {
            *v = cap;
        }
    }

    let window = (2 * n + 1) as f64;
    for _ in 0..iterations {
        let mut window_avg = padded[..=2 * n].iter().sum::<f64>() / window;
        for i in n..(n + n_data - 1) {
            let shift = padded[i + n + 1] - padded[i - n];
            if padded[i] > window_avg {
                let replaced = window_avg;
                window_avg += ((window_avg - padded[i]) + shift) / window;
                padded[i] = replaced;
            } else {
                window_avg += shift / window;
            }
        }
    }
    padded[n..n + n_data].to_vec()
}

/// Chebyshev polynomials `T_0..=T_order` evaluated at `t` in [-1, 1].
fn chebyshev_row(t: f64, order: usize, row: &mut [f64]) {
    row[0] = 1.0;
    if order >= 1 {
        row[1] = t;
    }
    for k in 2..=order {
        row[k] = 2.0 * t * row[k - 1] - row[k - 2];
    }
}

/// Least-squares Chebyshev fit of `y` over `x`, evaluated at `x`.
///
/// # Errors
/// Returns `EmptyPattern` for fewer than two points and `InvalidParameter`
/// when the least-squares solve fails.
pub fn chebyshev_fit(x: &[f64], y: &[f64], order: usize) -> Result<Vec<f64>> {
    let n = x.len().min(y.len());
    if n < 2 {
        return Err(Error::EmptyPattern);
    }
    let order = order.min(n - 1);
    let (x0, x1) = (x[0], x[n - 1]);
    let span = x1 - x0;
    if span == 0.0 {
        return Err(Error::InvalidParameter("pattern x range is empty".to_string()));
    }
    let mut row = vec![0.0; order + 1];
    let mut design = DMatrix::zeros(n, order + 1);
    for i in 0..n {
        chebyshev_row(2.0 * (x[i] - x0) / span - 1.0, order, &mut row);
        for (k, v) in row.iter().enumerate() {
            design[(i, k)] = *v;
        }
    }
    let rhs = DVector::from_column_slice(&y[..n]);
    let coeffs = design
        .clone()
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map_err(|e| Error::InvalidParameter(format!("chebyshev fit failed: {e}")))?;
    Ok((design * coeffs).iter().copied().collect())
}

/// Smooth-Brückner background followed by a Chebyshev fit.
///
/// # Errors
/// Returns `EmptyPattern` for fewer than two points.
pub fn extract_background(x: &[f64], y: &[f64], params: &BackgroundParameters) -> Result<Vec<f64>> {
    if x.len() < 2 || y.len() != x.len() {
        return Err(Error::EmptyPattern);
    }
    let step = (x[1] - x[0]).abs();
    let half_width = if step > 0.0 {
        ((params.smooth_width / step).abs() as usize).min(x.len())
    } else {
        0
    };
    let smoothed = smooth_bruckner(y, half_width, params.iterations);
    chebyshev_fit(x, &smoothed, params.cheb_order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_bruckner_removes_peak() {
        let mut y = vec![10.0; 101];
        y[50] = 1000.0;
        let smoothed = smooth_bruckner(&y, 5, 20);
        assert!(smoothed[50] < 20.0);
        assert_abs_diff_eq!(smoothed[10], 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_chebyshev_reproduces_polynomial() {
        let x: Vec<f64> = (0..50).map(|i| f64::from(i) * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|v| 1.0 + 2.0 * v - 0.3 * v * v).collect();
        let fit = chebyshev_fit(&x, &y, 3).unwrap();
        for (a, b) in fit.iter().zip(&y) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_background_below_peaks() {
        let x: Vec<f64> = (0..400).map(|i| 5.0 + f64::from(i) * 0.05).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|v| 100.0 - 2.0 * v + 500.0 * (-((v - 12.0) / 0.1).powi(2)).exp())
            .collect();
        let bkg = extract_background(&x, &y, &BackgroundParameters::default()).unwrap();
        let peak = x.iter().position(|&v| (v - 12.0).abs() < 0.026).unwrap();
        assert!(bkg[peak] < y[peak] - 100.0);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(
            extract_background(&[1.0], &[1.0], &BackgroundParameters::default()),
            Err(Error::EmptyPattern)
        );
    }
}
