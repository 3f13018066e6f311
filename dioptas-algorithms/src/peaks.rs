//! Peak search on detector images for gathering calibration ring points.
//!
//! Coordinates are continuous pixel positions `(row, col)`: the centre of
//! pixel `(r, c)` is `(r + 0.5, c + 0.5)`.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use dioptas_core::calibration::RingPoints;
use ndarray::{s, Array2};
use std::collections::VecDeque;

/// Parameters of the automatic ring search.
#[derive(Clone, Debug, PartialEq)]
pub struct AutoPeakSearch {
    /// Side of the window used to estimate the local background (pixels).
    pub background_window: usize,
    /// Region threshold as a fraction between local median and seed maximum.
    pub threshold_ratio: f64,
    /// Minimum separation between reported maxima (pixels).
    pub min_distance: f64,
    /// Upper bound on the number of reported maxima.
    pub max_points: usize,
    /// Upper bound on the grown region (pixels).
    pub max_region: usize,
}

impl Default for AutoPeakSearch {
    fn default() -> Self {
        Self {
            background_window: 21,
            threshold_ratio: 0.5,
            min_distance: 5.0,
            max_points: 1000,
            max_region: 500_000,
        }
    }
}

fn clamp_index(v: f64, len: usize) -> Option<usize> {
    if len == 0 || !v.is_finite() || v < 0.0 {
        return None;
    }
    let i = v as usize;
    (i < len).then_some(i)
}

/// Position of the maximum inside a square window of side `window` centred
/// on `(row, col)`.
#[must_use]
pub fn find_peak(image: &Array2<f64>, row: f64, col: f64, window: usize) -> Option<(f64, f64)> {
    let (rows, cols) = image.dim();
    let r = clamp_index(row, rows)?;
    let c = clamp_index(col, cols)?;
    let half = window / 2;
    let (r0, r1) = (r.saturating_sub(half), (r + half + 1).min(rows));
    let (c0, c1) = (c.saturating_sub(half), (c + half + 1).min(cols));
    let view = image.slice(s![r0..r1, c0..c1]);
    let ((pr, pc), _) = view
        .indexed_iter()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    Some(((r0 + pr) as f64 + 0.5, (c0 + pc) as f64 + 0.5))
}

/// Runs [`find_peak`] and appends the result for `ring_index`.
pub fn gather_peak(
    points: &mut RingPoints,
    image: &Array2<f64>,
    row: f64,
    col: f64,
    window: usize,
    ring_index: usize,
) -> Option<(f64, f64)> {
    let peak = find_peak(image, row, col, window)?;
    points.append(vec![[peak.0, peak.1]], ring_index);
    Some(peak)
}

const NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

fn neighbour(r: usize, c: usize, dr: isize, dc: isize, shape: (usize, usize)) -> Option<(usize, usize)> {
    let nr = r.checked_add_signed(dr)?;
    let nc = c.checked_add_signed(dc)?;
    (nr < shape.0 && nc < shape.1).then_some((nr, nc))
}

/// Follows the steepest ascent from `(r, c)` to a local maximum.
fn hill_climb(image: &Array2<f64>, mut r: usize, mut c: usize) -> (usize, usize) {
    let shape = image.dim();
    loop {
        let mut best = (r, c);
        for (dr, dc) in NEIGHBOURS {
            if let Some(n) = neighbour(r, c, dr, dc, shape) {
                if image[n] > image[best] {
                    best = n;
                }
            }
        }
        if best == (r, c) {
            return best;
        }
        (r, c) = best;
    }
}

fn local_median(image: &Array2<f64>, r: usize, c: usize, window: usize) -> f64 {
    let (rows, cols) = image.dim();
    let half = window / 2;
    let mut values: Vec<f64> = image
        .slice(s![
            r.saturating_sub(half)..(r + half + 1).min(rows),
            c.saturating_sub(half)..(c + half + 1).min(cols)
        ])
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    *values.select_nth_unstable_by(mid, f64::total_cmp).1
}

/// Searches the ring passing near `(row, col)`: climbs to the nearest
/// maximum, grows the bright connected region around it and returns the
/// thinned local maxima inside that region, strongest first.
#[must_use]
pub fn find_peaks_automatic(
    image: &Array2<f64>,
    row: f64,
    col: f64,
    search: &AutoPeakSearch,
) -> Vec<(f64, f64)> {
    let shape = image.dim();
    let (Some(r), Some(c)) = (clamp_index(row, shape.0), clamp_index(col, shape.1)) else {
        return Vec::new();
    };
    let seed = hill_climb(image, r, c);
    let peak = image[seed];
    let background = local_median(image, seed.0, seed.1, search.background_window);
    if !peak.is_finite() || peak <= background {
        return Vec::new();
    }
    let threshold = background + search.threshold_ratio * (peak - background);

    let mut in_region = Array2::from_elem(shape, false);
    let mut region = Vec::new();
    let mut queue = VecDeque::from([seed]);
    in_region[seed] = true;
    while let Some((pr, pc)) = queue.pop_front() {
        region.push((pr, pc));
        if region.len() >= search.max_region {
            log::warn!("peak region truncated at {} pixels", search.max_region);
            break;
        }
        for (dr, dc) in NEIGHBOURS {
            if let Some(n) = neighbour(pr, pc, dr, dc, shape) {
                if !in_region[n] && image[n] >= threshold {
                    in_region[n] = true;
                    queue.push_back(n);
                }
            }
        }
    }

    let mut maxima: Vec<(usize, usize)> = region
        .into_iter()
        .filter(|&(pr, pc)| {
            NEIGHBOURS.iter().all(|&(dr, dc)| {
                neighbour(pr, pc, dr, dc, shape).map_or(true, |n| image[n] <= image[[pr, pc]])
            })
        })
        .collect();
    maxima.sort_by(|a, b| image[*b].total_cmp(&image[*a]));

    let min_d2 = search.min_distance * search.min_distance;
    let mut kept: Vec<(f64, f64)> = Vec::new();
    for (pr, pc) in maxima {
        let p = (pr as f64 + 0.5, pc as f64 + 0.5);
        let crowded = kept
            .iter()
            .any(|k| (k.0 - p.0).powi(2) + (k.1 - p.1).powi(2) < min_d2);
        if !crowded {
            kept.push(p);
            if kept.len() >= search.max_points {
                break;
            }
        }
    }
    kept
}

/// Runs [`find_peaks_automatic`] and appends all found maxima for `ring_index`.
///
/// Returns the number of points appended.
pub fn gather_peaks_automatic(
    points: &mut RingPoints,
    image: &Array2<f64>,
    row: f64,
    col: f64,
    ring_index: usize,
    search: &AutoPeakSearch,
) -> usize {
    let found = find_peaks_automatic(image, row, col, search);
    let n = found.len();
    points.append(found.into_iter().map(|(r, c)| [r, c]).collect(), ring_index);
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_image() -> Array2<f64> {
        Array2::from_shape_fn((101, 101), |(r, c)| {
            let radius = ((r as f64 - 50.0).powi(2) + (c as f64 - 50.0).powi(2)).sqrt();
            let modulation = 1.0 + 0.1 * ((c as f64) * 0.7).sin() * ((r as f64) * 0.3).cos();
            10.0 + 100.0 * (-((radius - 30.0) / 1.5).powi(2)).exp() * modulation
        })
    }

    #[test]
    fn test_find_peak_in_window() {
        let mut image = Array2::zeros((20, 20));
        image[[5, 7]] = 9.0;
        image[[15, 15]] = 50.0;
        assert_eq!(find_peak(&image, 6.0, 6.0, 5), Some((5.5, 7.5)));
        assert_eq!(find_peak(&image, 50.0, 6.0, 5), None);
    }

    #[test]
    fn test_automatic_search_follows_ring() {
        let image = ring_image();
        let found = find_peaks_automatic(&image, 50.0, 78.0, &AutoPeakSearch::default());
        assert!(found.len() > 5);
        for (r, c) in &found {
            let radius = ((r - 50.5).powi(2) + (c - 50.5).powi(2)).sqrt();
            assert!((radius - 30.0).abs() < 3.0, "radius {radius}");
        }
    }

    #[test]
    fn test_gather_appends_ring_index() {
        let image = ring_image();
        let mut points = RingPoints::new();
        let n = gather_peaks_automatic(&mut points, &image, 50.0, 80.0, 2, &AutoPeakSearch::default());
        assert_eq!(points.len(), n);
        assert_eq!(points.rings(), vec![2]);
        gather_peak(&mut points, &image, 50.0, 80.0, 5, 0);
        assert_eq!(points.rings(), vec![0, 2]);
    }
}
