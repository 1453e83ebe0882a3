//! Critical-point search along one-dimensional probing lines.
//!
//! A one-hidden-layer ReLU network is piecewise linear, so its Jacobian is
//! piecewise constant: it changes exactly when some hidden unit's
//! pre-activation crosses zero. Along a line `x(t) = x0 + t·v` the search
//! therefore reduces to locating the `t` values where the oracle's Jacobian
//! jumps.
//!
//! ## Algorithm
//!
//! 1. **Grid scan**: evaluate the Jacobian at a uniform grid over the
//!    searched interval and flag adjacent cells whose Jacobians differ by
//!    more than the jump tolerance.
//! 2. **Bisection**: within each flagged cell, bisect on the predicate
//!    "Jacobian differs from the left endpoint" until the bracket is
//!    narrower than the `t` tolerance, with a hard iteration cap that
//!    reports the interval as inconclusive instead of looping.
//! 3. **Rank-one decomposition**: the jump across a single unit's boundary
//!    is an outer product of the unit's output-layer column and its weight
//!    row; jumps that are not rank-one within tolerance are coincident
//!    crossings and the evidence is discarded.

use fex_core::{Oracle, Result};
use ndarray::{Array1, Array2};
use tracing::{debug, trace};

use crate::config::{CriticalPoint, ExtractionConfig, SearchSkip, SkipReason};

/// A probing line through input space.
#[derive(Debug, Clone)]
pub(crate) struct ProbeLine {
    pub probe_index: usize,
    pub direction_index: usize,
    pub origin: Array1<f64>,
    /// Unit direction vector.
    pub direction: Array1<f64>,
}

impl ProbeLine {
    pub fn point_at(&self, t: f64) -> Array1<f64> {
        &self.origin + &(&self.direction * t)
    }
}

/// Everything one line search produced.
#[derive(Debug, Clone)]
pub(crate) struct LineSearch {
    pub points: Vec<CriticalPoint>,
    pub skips: Vec<SearchSkip>,
}

enum Located {
    Point(CriticalPoint),
    Ambiguous { t: f64 },
    Inconclusive { t_lo: f64, t_hi: f64 },
}

/// Largest absolute entry-wise difference between two Jacobians.
fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0_f64, |acc, (x, y)| acc.max((x - y).abs()))
}

/// Search one line for critical points.
pub(crate) fn search_line(
    oracle: &dyn Oracle,
    line: &ProbeLine,
    config: &ExtractionConfig,
) -> Result<LineSearch> {
    let n = config.grid_points;
    let range = config.search_range;

    let ts: Vec<f64> = (0..=n)
        .map(|i| -range + 2.0 * range * i as f64 / n as f64)
        .collect();
    let mut jacobians = Vec::with_capacity(n + 1);
    for &t in &ts {
        jacobians.push(oracle.jacobian(line.point_at(t).view())?);
    }

    let mut points = Vec::new();
    let mut skips = Vec::new();
    let mut flagged = 0_usize;

    for i in 0..n {
        if max_abs_diff(&jacobians[i], &jacobians[i + 1]) <= config.jump_tol {
            continue;
        }
        flagged += 1;
        match bisect(
            oracle,
            line,
            (ts[i], ts[i + 1]),
            (&jacobians[i], &jacobians[i + 1]),
            config,
        )? {
            Located::Point(point) => {
                trace!(
                    "Located critical point at t={:.6} on probe {} direction {} (jump {:.3e})",
                    point.t,
                    line.probe_index,
                    line.direction_index,
                    point.jump_magnitude
                );
                points.push(point);
            }
            Located::Ambiguous { t } => {
                skips.push(SearchSkip {
                    probe_index: line.probe_index,
                    direction_index: line.direction_index,
                    reason: SkipReason::AmbiguousDiscontinuity { t },
                });
            }
            Located::Inconclusive { t_lo, t_hi } => {
                skips.push(SearchSkip {
                    probe_index: line.probe_index,
                    direction_index: line.direction_index,
                    reason: SkipReason::Inconclusive { t_lo, t_hi },
                });
            }
        }
    }

    if flagged == 0 {
        debug!(
            "Probe {} direction {} crossed no unit boundary within range",
            line.probe_index, line.direction_index
        );
        skips.push(SearchSkip {
            probe_index: line.probe_index,
            direction_index: line.direction_index,
            reason: SkipReason::NoCrossing,
        });
    }

    Ok(LineSearch { points, skips })
}

/// Narrow a flagged interval down to a single crossing.
///
/// Invariant: the Jacobians at the bracket endpoints always differ by more
/// than the jump tolerance, so the bracket always contains a crossing.
fn bisect(
    oracle: &dyn Oracle,
    line: &ProbeLine,
    (t_lo, t_hi): (f64, f64),
    (j_lo, j_hi): (&Array2<f64>, &Array2<f64>),
    config: &ExtractionConfig,
) -> Result<Located> {
    let mut lo = t_lo;
    let mut hi = t_hi;
    let mut j_lo = j_lo.clone();
    let mut j_hi = j_hi.clone();
    let mut iters = 0_usize;

    while hi - lo > config.t_tol {
        if iters >= config.max_bisection_iters {
            return Ok(Located::Inconclusive { t_lo: lo, t_hi: hi });
        }
        let mid = 0.5 * (lo + hi);
        let j_mid = oracle.jacobian(line.point_at(mid).view())?;
        if max_abs_diff(&j_mid, &j_lo) > config.jump_tol {
            hi = mid;
            j_hi = j_mid;
        } else {
            lo = mid;
            j_lo = j_mid;
        }
        iters += 1;
    }

    let t = 0.5 * (lo + hi);
    let delta = &j_hi - &j_lo;
    match decompose_jump(&delta, config.rank_one_tol) {
        Some((jump_direction, jump_coefficients, jump_magnitude)) => {
            Ok(Located::Point(CriticalPoint {
                probe_index: line.probe_index,
                direction_index: line.direction_index,
                t,
                location: line.point_at(t),
                direction: line.direction.clone(),
                jump_direction,
                jump_coefficients,
                jump_magnitude,
            }))
        }
        None => {
            debug!(
                "Discarding ambiguous discontinuity at t={:.6} on probe {} direction {}",
                t, line.probe_index, line.direction_index
            );
            Ok(Located::Ambiguous { t })
        }
    }
}

/// Decompose a Jacobian jump as `ΔJ = α ⊗ u` with `u` a unit vector.
///
/// Returns `None` when the jump is not rank-one within the given relative
/// residual, which means more than one unit switched inside the bracket.
/// `u` is sign-canonicalized so that identical hyperplanes found on
/// different lines produce identical directions.
fn decompose_jump(
    delta: &Array2<f64>,
    rank_one_tol: f64,
) -> Option<(Array1<f64>, Array1<f64>, f64)> {
    let frob = delta.iter().map(|v| v * v).sum::<f64>().sqrt();
    if frob == 0.0 {
        return None;
    }

    // Seed with the largest row, then one power-iteration step on ΔᵀΔ for
    // stability when the largest row is itself noisy.
    let mut best_row = 0;
    let mut best_norm = 0.0_f64;
    for (i, row) in delta.outer_iter().enumerate() {
        let norm = row.dot(&row).sqrt();
        if norm > best_norm {
            best_norm = norm;
            best_row = i;
        }
    }
    let seed = delta.row(best_row).to_owned() / best_norm;
    let refined = delta.t().dot(&delta.dot(&seed));
    let refined_norm = refined.dot(&refined).sqrt();
    let mut u = if refined_norm > 0.0 {
        refined / refined_norm
    } else {
        seed
    };

    // Canonical sign: largest-magnitude component positive.
    let mut arg = 0;
    let mut max = 0.0_f64;
    for (i, &v) in u.iter().enumerate() {
        if v.abs() > max {
            max = v.abs();
            arg = i;
        }
    }
    if u[arg] < 0.0 {
        u.mapv_inplace(|v| -v);
    }

    let alpha = delta.dot(&u);
    let mut residual_sq = 0.0_f64;
    for (i, row) in delta.outer_iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            let r = v - alpha[i] * u[j];
            residual_sq += r * r;
        }
    }
    if residual_sq.sqrt() / frob > rank_one_tol {
        return None;
    }
    Some((u, alpha, frob))
}
