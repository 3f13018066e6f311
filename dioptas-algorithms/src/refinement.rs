//! Least-squares refinement of the PONI geometry from gathered ring points.
//!
//! Minimises the difference between the predicted 2θ of every point and the
//! calibrant 2θ of its ring with a Levenberg-Marquardt iteration. The
//! Jacobian is evaluated numerically, one parameter per rayon task.
#![allow(clippy::cast_precision_loss)]

use dioptas_core::calibrant::Calibrant;
use dioptas_core::calibration::{Calibration, PoniParameters, RingPoints};
use dioptas_core::error::{Error, Result};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// Start values supplied by the user.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefinementStart {
    /// Sample-detector distance (m).
    pub dist: f64,
    /// Wavelength (m).
    pub wavelength: f64,
    /// Pixel size along columns (m).
    pub pixel_width: f64,
    /// Pixel size along rows (m).
    pub pixel_height: f64,
    /// Polarisation factor carried into the result.
    pub polarization_factor: f64,
}

impl Default for RefinementStart {
    fn default() -> Self {
        let poni = PoniParameters::default();
        Self {
            dist: poni.dist,
            wavelength: poni.wavelength,
            pixel_width: poni.pixel2,
            pixel_height: poni.pixel1,
            polarization_factor: poni.polarization_factor,
        }
    }
}

/// Refinement switches and iteration limits.
#[derive(Clone, Debug, PartialEq)]
pub struct RefinementConfig {
    /// Vary the wavelength.
    pub fit_wavelength: bool,
    /// Vary the distance; fixed at its start value otherwise.
    pub fit_distance: bool,
    /// Iteration cap.
    pub max_iterations: usize,
    /// Relative cost change that counts as converged.
    pub tolerance: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            fit_wavelength: false,
            fit_distance: true,
            max_iterations: 200,
            tolerance: 1e-12,
        }
    }
}

/// Outcome of a successful refinement.
#[derive(Clone, Debug, PartialEq)]
pub struct RefinementReport {
    /// Refined parameter set.
    pub poni: PoniParameters,
    /// Root-mean-square 2θ residual (degrees).
    pub rms_deg: f64,
    /// Iterations performed.
    pub iterations: usize,
    /// Number of points that entered the fit.
    pub points: usize,
}

/// Largest gradient component accepted as a stationary point.
const GRADIENT_TOLERANCE: f64 = 1e-12;

const DIST: usize = 0;
const PONI1: usize = 1;
const PONI2: usize = 2;
const ROT1: usize = 3;
const ROT2: usize = 4;
const ROT3: usize = 5;
const WAVELENGTH: usize = 6;
const N_PARAMS: usize = 7;

fn to_vector(p: &PoniParameters) -> [f64; N_PARAMS] {
    [p.dist, p.poni1, p.poni2, p.rot1, p.rot2, p.rot3, p.wavelength]
}

fn from_vector(v: &[f64; N_PARAMS], template: &PoniParameters) -> PoniParameters {
    PoniParameters {
        dist: v[DIST],
        poni1: v[PONI1],
        poni2: v[PONI2],
        rot1: v[ROT1],
        rot2: v[ROT2],
        rot3: v[ROT3],
        wavelength: v[WAVELENGTH],
        ..*template
    }
}

struct Problem<'a> {
    points: Vec<(f64, f64, usize)>,
    calibrant: &'a Calibrant,
    template: PoniParameters,
    free: Vec<usize>,
    scale: [f64; N_PARAMS],
    base: [f64; N_PARAMS],
}

impl Problem<'_> {
    fn full(&self, u: &DVector<f64>) -> [f64; N_PARAMS] {
        let mut v = self.base;
        for (k, &i) in self.free.iter().enumerate() {
            v[i] = u[k] * self.scale[i];
        }
        v
    }

    fn residuals(&self, u: &DVector<f64>) -> Option<DVector<f64>> {
        let poni = from_vector(&self.full(u), &self.template);
        if poni.dist <= 0.0 || poni.wavelength <= 0.0 {
            return None;
        }
        let mut out = DVector::zeros(self.points.len());
        for (k, &(row, col, ring)) in self.points.iter().enumerate() {
            let target = self.calibrant.ring_two_theta(ring, poni.wavelength)?;
            out[k] = poni.two_theta_at(row, col) - target;
        }
        out.iter().all(|v| v.is_finite()).then_some(out)
    }

    fn jacobian(&self, u: &DVector<f64>) -> Option<DMatrix<f64>> {
        let h = 1e-7;
        let columns: Vec<Option<DVector<f64>>> = (0..u.len())
            .into_par_iter()
            .map(|j| {
                let mut plus = u.clone();
                let mut minus = u.clone();
                let step = h * u[j].abs().max(1.0);
                plus[j] += step;
                minus[j] -= step;
                let rp = self.residuals(&plus)?;
                let rm = self.residuals(&minus)?;
                Some((rp - rm) / (2.0 * step))
            })
            .collect();
        let columns: Option<Vec<DVector<f64>>> = columns.into_iter().collect();
        Some(DMatrix::from_columns(&columns?))
    }
}

/// Initial PONI set: beam centre at the centroid of the points, no tilt.
#[must_use]
pub fn initial_guess(points: &RingPoints, start: &RefinementStart) -> PoniParameters {
    let n = points.len().max(1) as f64;
    let (sr, sc) = points.iter().fold((0.0, 0.0), |(a, b), (r, c, _)| (a + r, b + c));
    PoniParameters {
        dist: start.dist,
        poni1: sr / n * start.pixel_height,
        poni2: sc / n * start.pixel_width,
        rot1: 0.0,
        rot2: 0.0,
        rot3: 0.0,
        pixel1: start.pixel_height,
        pixel2: start.pixel_width,
        wavelength: start.wavelength,
        polarization_factor: start.polarization_factor,
    }
}

/// Refines `initial` against the gathered points.
///
/// # Errors
/// Returns `RefinementFailed` with too few usable points, when the
/// iteration diverges or when it stops short of convergence.
pub fn refine(
    points: &RingPoints,
    calibrant: &Calibrant,
    initial: &PoniParameters,
    config: &RefinementConfig,
) -> Result<RefinementReport> {
    let usable: Vec<(f64, f64, usize)> = points
        .iter()
        .filter(|&(_, _, ring)| calibrant.ring_two_theta(ring, initial.wavelength).is_some())
        .collect();
    if usable.len() < points.len() {
        log::warn!(
            "{} point(s) belong to rings unreachable at this wavelength",
            points.len() - usable.len()
        );
    }

    // 2θ does not depend on rot3, it stays at its start value
    let mut free = vec![PONI1, PONI2, ROT1, ROT2];
    if config.fit_distance {
        free.insert(0, DIST);
    }
    if config.fit_wavelength {
        free.push(WAVELENGTH);
    }
    if usable.len() <= free.len() {
        return Err(Error::RefinementFailed(format!(
            "{} usable point(s) for {} free parameter(s)",
            usable.len(),
            free.len()
        )));
    }

    let base = to_vector(initial);
    let mut scale = [1.0; N_PARAMS];
    scale[DIST] = initial.dist;
    scale[PONI1] = initial.pixel1 * 1000.0;
    scale[PONI2] = initial.pixel2 * 1000.0;
    scale[WAVELENGTH] = initial.wavelength;
    let problem = Problem {
        points: usable,
        calibrant,
        template: *initial,
        free,
        scale,
        base,
    };

    let mut u = DVector::from_iterator(
        problem.free.len(),
        problem.free.iter().map(|&i| base[i] / scale[i]),
    );
    let mut r = problem
        .residuals(&u)
        .ok_or_else(|| Error::RefinementFailed("start values give no residuals".to_string()))?;
    let mut cost = r.norm_squared();
    let mut lambda = 1e-3;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.max_iterations {
        iterations += 1;
        let j = problem
            .jacobian(&u)
            .ok_or_else(|| Error::RefinementFailed("jacobian not finite".to_string()))?;
        let jt = j.transpose();
        let jtj = &jt * &j;
        let gradient = &jt * &r;
        let mut stalled = true;
        while lambda < 1e12 {
            let mut a = jtj.clone();
            for k in 0..a.nrows() {
                a[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }
            let Some(step) = a.lu().solve(&(-&gradient)) else {
                lambda *= 10.0;
                continue;
            };
            let trial = &u + &step;
            match problem.residuals(&trial) {
                Some(tr) if tr.norm_squared() < cost => {
                    let new_cost = tr.norm_squared();
                    let rel = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                    u = trial;
                    r = tr;
                    cost = new_cost;
                    lambda = (lambda / 10.0).max(1e-12);
                    stalled = false;
                    converged = rel <= config.tolerance || step.norm() <= 1e-14;
                    break;
                }
                _ => lambda *= 10.0,
            }
        }
        if stalled {
            // no downhill step left: fine at a stationary point only
            converged = cost <= 1e-20 || gradient.amax() <= GRADIENT_TOLERANCE;
            break;
        }
        if converged {
            break;
        }
    }

    if !converged {
        return Err(Error::RefinementFailed(format!(
            "no convergence after {iterations} iteration(s), rms {:.3e} deg",
            (cost / problem.points.len() as f64).sqrt().to_degrees()
        )));
    }
    let poni = from_vector(&problem.full(&u), initial);
    poni.validate()
        .map_err(|e| Error::RefinementFailed(format!("refined geometry is invalid: {e}")))?;
    let rms_deg = (cost / problem.points.len() as f64).sqrt().to_degrees();
    log::info!(
        "refinement finished: {} point(s), {iterations} iteration(s), rms {rms_deg:.3e} deg",
        problem.points.len()
    );
    Ok(RefinementReport {
        poni,
        rms_deg,
        iterations,
        points: problem.points.len(),
    })
}

/// Refines the working calibration in place from its gathered points.
///
/// The current PONI set is used as the starting point when one exists,
/// otherwise [`initial_guess`] from `start`. On failure the calibration is
/// left untouched.
///
/// # Errors
/// Returns `RefinementFailed` as [`refine`].
pub fn refine_calibration(
    calibration: &mut Calibration,
    calibrant: &Calibrant,
    start: &RefinementStart,
    config: &RefinementConfig,
) -> Result<RefinementReport> {
    let initial = match calibration.geometry() {
        Ok(geometry) => PoniParameters {
            dist: start.dist,
            wavelength: start.wavelength,
            pixel1: start.pixel_height,
            pixel2: start.pixel_width,
            polarization_factor: start.polarization_factor,
            ..*geometry.poni()
        },
        Err(_) => initial_guess(&calibration.ring_points, start),
    };
    let report = refine(&calibration.ring_points, calibrant, &initial, config)?;
    calibration.set_poni(report.poni, None)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const LAMBDA: f64 = 0.3344e-10;

    fn truth() -> PoniParameters {
        PoniParameters {
            dist: 0.2,
            poni1: 0.1002,
            poni2: 0.0995,
            rot1: 0.01,
            rot2: -0.005,
            rot3: 0.0,
            pixel1: 100e-6,
            pixel2: 100e-6,
            wavelength: LAMBDA,
            polarization_factor: 0.99,
        }
    }

    fn calibrant() -> Calibrant {
        Calibrant::new("CeO2", vec![3.124, 2.705, 1.913, 1.631])
    }

    /// Samples points on each ring of `poni` by bisection along rays from the beam centre.
    fn synthetic_points(poni: &PoniParameters) -> RingPoints {
        let (cy, cx) = poni.beam_center();
        let mut points = RingPoints::new();
        for (ring, tth) in calibrant().two_theta_rings(poni.wavelength).iter().enumerate() {
            let Some(target) = *tth else { continue };
            let mut set = Vec::new();
            for k in 0..24 {
                let angle = f64::from(k) * std::f64::consts::TAU / 24.0;
                let (mut lo, mut hi) = (0.0, 2000.0);
                for _ in 0..80 {
                    let mid = 0.5 * (lo + hi);
                    let t = poni.two_theta_at(cy + mid * angle.sin(), cx + mid * angle.cos());
                    if t < target {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                set.push([cy + lo * angle.sin(), cx + lo * angle.cos()]);
            }
            points.append(set, ring);
        }
        points
    }

    #[test]
    fn test_recovers_geometry() {
        let truth = truth();
        let points = synthetic_points(&truth);
        let start = RefinementStart {
            dist: 0.19,
            wavelength: LAMBDA,
            pixel_width: 100e-6,
            pixel_height: 100e-6,
            polarization_factor: 0.99,
        };
        let initial = initial_guess(&points, &start);
        let report = refine(&points, &calibrant(), &initial, &RefinementConfig::default()).unwrap();
        assert_relative_eq!(report.poni.dist, truth.dist, max_relative = 1e-5);
        assert_relative_eq!(report.poni.poni1, truth.poni1, max_relative = 1e-5);
        assert_relative_eq!(report.poni.poni2, truth.poni2, max_relative = 1e-5);
        assert!(report.rms_deg < 1e-6);
    }

    #[test]
    fn test_fixed_distance_is_kept() {
        let points = synthetic_points(&truth());
        let start = RefinementStart {
            dist: 0.2,
            wavelength: LAMBDA,
            pixel_width: 100e-6,
            pixel_height: 100e-6,
            polarization_factor: 0.99,
        };
        let config = RefinementConfig {
            fit_distance: false,
            ..RefinementConfig::default()
        };
        let report = refine(&points, &calibrant(), &initial_guess(&points, &start), &config).unwrap();
        assert_eq!(report.poni.dist, 0.2);
    }

    #[test]
    fn test_too_few_points_leaves_calibration() {
        let mut calibration = Calibration::from_poni(truth(), Some("start".into())).unwrap();
        calibration.ring_points.append(vec![[10.0, 10.0], [20.0, 20.0]], 0);
        let err = refine_calibration(
            &mut calibration,
            &calibrant(),
            &RefinementStart::default(),
            &RefinementConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::RefinementFailed(_)));
        assert_eq!(*calibration.geometry().unwrap().poni(), truth());
    }

    #[test]
    fn test_iteration_cap_without_convergence_fails() {
        let truth = truth();
        let mut calibration = Calibration::from_poni(truth, Some("start".into())).unwrap();
        calibration.ring_points = synthetic_points(&truth);
        let start = RefinementStart {
            dist: 0.15,
            wavelength: LAMBDA,
            pixel_width: 100e-6,
            pixel_height: 100e-6,
            polarization_factor: 0.99,
        };
        let config = RefinementConfig {
            max_iterations: 1,
            ..RefinementConfig::default()
        };
        let err = refine_calibration(&mut calibration, &calibrant(), &start, &config).unwrap_err();
        assert!(matches!(err, Error::RefinementFailed(_)));
        assert_eq!(*calibration.geometry().unwrap().poni(), truth);
    }
}
