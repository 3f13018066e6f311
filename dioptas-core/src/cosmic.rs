//! Cosmic-ray detection by Laplacian edge detection (L.A.Cosmic).
#![allow(clippy::cast_precision_loss, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use ndarray::Array2;

/// Tuning of the cosmic-ray detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosmicParameters {
    pub iterations: usize,
    /// Laplacian-to-noise detection limit.
    pub sigclip: f64,
    /// Minimum contrast against fine structure.
    pub objlim: f64,
    /// Fraction of `sigclip` used when growing detections to neighbours.
    pub sigfrac: f64,
    /// Electrons per count.
    pub gain: f64,
    /// Read noise in electrons.
    pub readnoise: f64,
    /// Counts at which pixels are considered saturated and never flagged.
    pub satlevel: f64,
}

impl Default for CosmicParameters {
    fn default() -> Self {
        Self {
            iterations: 2,
            sigclip: 3.0,
            objlim: 3.0,
            sigfrac: 0.3,
            gain: 2.2,
            readnoise: 10.0,
            satlevel: 50_000.0,
        }
    }
}

#[inline]
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let mut i = i;
    // symmetric boundary: -1 -> 0, n -> n - 1
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        } else {
            return i as usize;
        }
    }
}

/// Median filter over a `size x size` window with reflected edges.
#[must_use]
pub fn median_filter(data: &Array2<f64>, size: usize) -> Array2<f64> {
    let (rows, cols) = data.dim();
    let half = (size / 2) as isize;
    let mut window = Vec::with_capacity(size * size);
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        window.clear();
        for dr in -half..=half {
            let rr = reflect(r as isize + dr, rows);
            for dc in -half..=half {
                window.push(data[[rr, reflect(c as isize + dc, cols)]]);
            }
        }
        let mid = window.len() / 2;
        let (_, median, _) = window.select_nth_unstable_by(mid, f64::total_cmp);
        *median
    })
}

/// Positive part of the Laplacian of the 2x subsampled image, rebinned.
fn laplacian_plus(data: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = data.dim();
    let (sub_rows, sub_cols) = (rows * 2, cols * 2);
    let at = |r: isize, c: isize| data[[reflect(r, sub_rows) / 2, reflect(c, sub_cols) / 2]];
    let mut out = Array2::zeros((rows, cols));
    for r in 0..sub_rows as isize {
        for c in 0..sub_cols as isize {
            let lap = 4.0 * at(r, c) - at(r - 1, c) - at(r + 1, c) - at(r, c - 1) - at(r, c + 1);
            if lap > 0.0 {
                out[[r as usize / 2, c as usize / 2]] += lap / 4.0;
            }
        }
    }
    out
}

fn dilate(flags: &Array2<bool>) -> Array2<bool> {
    let (rows, cols) = flags.dim();
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let r0 = r.saturating_sub(1);
        let c0 = c.saturating_sub(1);
        (r0..=(r + 1).min(rows - 1)).any(|rr| (c0..=(c + 1).min(cols - 1)).any(|cc| flags[[rr, cc]]))
    })
}

/// Runs the detector and returns the set of flagged pixels.
#[must_use]
pub fn detect_cosmics(image: &Array2<f64>, params: &CosmicParameters) -> Array2<bool> {
    let shape = image.dim();
    let mut detected = Array2::from_elem(shape, false);
    if image.is_empty() {
        return detected;
    }
    let mut clean = image.clone();
    let sigcliplow = params.sigclip * params.sigfrac;

    for iteration in 0..params.iterations {
        let lplus = laplacian_plus(&clean);
        let m5 = median_filter(&clean, 5);
        let noise = m5.mapv(|m| {
            (params.gain * m.max(1e-4) + params.readnoise * params.readnoise).sqrt() / params.gain
        });
        let s = &lplus / &(noise.mapv(|n| 2.0 * n));
        let sp = &s - &median_filter(&s, 5);

        let m3 = median_filter(&clean, 3);
        let m37 = median_filter(&m3, 7);
        let fine = ((&m3 - &m37) / &noise).mapv(|f| f.max(0.01));

        let mut candidates = Array2::from_shape_fn(shape, |idx| {
            sp[idx] > params.sigclip
                && sp[idx] / fine[idx] > params.objlim
                && image[idx] < params.satlevel
        });
        // grow to neighbours, first at full then at reduced threshold
        let grown = dilate(&candidates);
        candidates = Array2::from_shape_fn(shape, |idx| grown[idx] && sp[idx] > params.sigclip);
        let grown = dilate(&candidates);
        candidates = Array2::from_shape_fn(shape, |idx| grown[idx] && sp[idx] > sigcliplow);

        let new_hits = candidates
            .indexed_iter()
            .filter(|(idx, &flag)| flag && !detected[*idx])
            .count();
        log::debug!("cosmic iteration {iteration}: {new_hits} new pixel(s)");
        if new_hits == 0 {
            break;
        }
        detected.zip_mut_with(&candidates, |d, &c| *d |= c);
        clean = clean_flagged(&clean, &detected);
    }
    detected
}

/// Replaces flagged pixels by the median of unflagged 5x5 neighbours.
fn clean_flagged(data: &Array2<f64>, flags: &Array2<bool>) -> Array2<f64> {
    let (rows, cols) = data.dim();
    let mut out = data.clone();
    let mut window = Vec::with_capacity(25);
    for ((r, c), &flag) in flags.indexed_iter() {
        if !flag {
            continue;
        }
        window.clear();
        for rr in r.saturating_sub(2)..(r + 3).min(rows) {
            for cc in c.saturating_sub(2)..(c + 3).min(cols) {
                if !flags[[rr, cc]] {
                    window.push(data[[rr, cc]]);
                }
            }
        }
        if !window.is_empty() {
            let mid = window.len() / 2;
            let (_, median, _) = window.select_nth_unstable_by(mid, f64::total_cmp);
            out[[r, c]] = *median;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_median_filter_reflects_edges() {
        let data = array![[1.0, 2.0, 3.0], [4.0, 100.0, 6.0], [7.0, 8.0, 9.0]];
        let filtered = median_filter(&data, 3);
        assert_eq!(filtered[[1, 1]], 6.0);
        // corner window: 1,1,2,1,1,2,4,4,100 -> 2
        assert_eq!(filtered[[0, 0]], 2.0);
    }

    #[test]
    fn test_detects_single_hot_pixel() {
        let mut image = Array2::from_elem((32, 32), 100.0);
        image[[10, 20]] = 20_000.0;
        let flags = detect_cosmics(&image, &CosmicParameters::default());
        assert!(flags[[10, 20]]);
        assert!(!flags[[25, 5]]);
    }

    #[test]
    fn test_flat_image_is_clean() {
        let image = Array2::from_elem((16, 16), 500.0);
        let flags = detect_cosmics(&image, &CosmicParameters::default());
        assert!(flags.iter().all(|&f| !f));
    }
}
