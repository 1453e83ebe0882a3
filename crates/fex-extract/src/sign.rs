//! Sign resolution for recovered hidden units.
//!
//! The Jacobian jump determines a unit's weight row only up to a non-zero
//! scalar. The scale convention is unit norm (magnitude is absorbed into the
//! output-layer column by the final solve), but the sign matters:
//! `relu(−z) = relu(z) − z`, so flipping a unit's sign injects a linear term
//! the output layer cannot fit. The resolver exploits exactly that: it
//! evaluates the oracle at the probe inputs plus, per unit, a pair of points
//! straddling the unit's hyperplane, and keeps the sign hypothesis whose
//! output-layer fit residual is strictly smaller.
//!
//! A wrong sign is *not* locally observable: the jump measured across a
//! straddle pair is `|c|·w1ⱼ ⊗ ŵⱼ` under either hypothesis, since the unit's
//! scale and its output column flip together. The residual test is therefore
//! run against the shared least-squares fit, and audited on two disjoint
//! halves of the evaluation set; units whose evidence is not strict on both
//! halves are surfaced as conflicts, never averaged away.

use fex_core::{Oracle, Result};
use ndarray::{s, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{ExtractionConfig, NeuronRecord};
use crate::solve::{design_matrix, least_squares};

/// Oracle evidence shared by sign resolution and the final solve.
pub(crate) struct SignEvidence {
    /// Probe inputs followed by one straddle pair per unit.
    pub inputs: Array2<f64>,
    /// Oracle outputs for `inputs`, row-aligned.
    pub outputs: Array2<f64>,
    /// Number of leading rows that are the caller's probe inputs.
    pub num_probes: usize,
}

/// Evaluate the oracle over the probes and per-unit straddle pairs.
pub(crate) fn build_evidence(
    oracle: &dyn Oracle,
    probes: ArrayView2<'_, f64>,
    neurons: &[NeuronRecord],
    delta: f64,
) -> Result<SignEvidence> {
    let d = probes.ncols();
    let num_probes = probes.nrows();
    let mut inputs = Array2::zeros((num_probes + 2 * neurons.len(), d));
    inputs.slice_mut(s![..num_probes, ..]).assign(&probes);

    for (j, neuron) in neurons.iter().enumerate() {
        let step = neuron.weight.mapv(|v| v * delta);
        let mut plus = &neuron.anchor + &step;
        let mut minus = &neuron.anchor - &step;
        if let Some((lo, hi)) = oracle.domain() {
            plus.mapv_inplace(|v| v.clamp(lo, hi));
            minus.mapv_inplace(|v| v.clamp(lo, hi));
        }
        inputs.row_mut(num_probes + 2 * j).assign(&plus);
        inputs.row_mut(num_probes + 2 * j + 1).assign(&minus);
    }

    let outputs = oracle.evaluate(inputs.view())?;
    Ok(SignEvidence {
        inputs,
        outputs,
        num_probes,
    })
}

/// Outcome of sign resolution.
pub(crate) struct SignReport {
    /// Indices of units whose sign evidence was inconsistent.
    pub conflicts: Vec<usize>,
}

fn fit_residual(
    xs: &ArrayView2<'_, f64>,
    ys: &ArrayView2<'_, f64>,
    neurons: &[NeuronRecord],
    signs: &[f64],
    rank_tol: f64,
) -> Result<f64> {
    let a = design_matrix(xs, neurons, signs);
    Ok(least_squares(&a, ys, rank_tol)?.residual)
}

/// Fix every unit's sign, mutating the records in place.
///
/// Coordinate descent over per-unit flips against the full evaluation set,
/// then a per-unit audit on two disjoint halves: the kept sign must beat its
/// negation strictly (by more than the sign residual tolerance) on both
/// halves, else the unit is reported as a conflict.
pub(crate) fn resolve_signs(
    neurons: &mut [NeuronRecord],
    evidence: &SignEvidence,
    config: &ExtractionConfig,
) -> Result<SignReport> {
    let h = neurons.len();
    let xs = evidence.inputs.view();
    let ys = evidence.outputs.view();
    let records: &[NeuronRecord] = neurons;

    let mut signs = vec![1.0_f64; h];
    let mut base = fit_residual(&xs, &ys, records, &signs, config.rank_tol)?;

    for pass in 0..config.sign_max_passes {
        let mut changed = false;
        for j in 0..h {
            signs[j] = -signs[j];
            let flipped = fit_residual(&xs, &ys, records, &signs, config.rank_tol)?;
            if flipped + config.sign_residual_tol < base {
                debug!(
                    "Pass {}: flipping unit {} improves residual {:.3e} -> {:.3e}",
                    pass, j, base, flipped
                );
                base = flipped;
                changed = true;
            } else {
                signs[j] = -signs[j];
            }
        }
        if !changed {
            break;
        }
    }

    // Audit on two disjoint halves; fall back to the full set when a half
    // would be underdetermined.
    let n = evidence.inputs.nrows();
    let even: Vec<usize> = (0..n).step_by(2).collect();
    let odd: Vec<usize> = (1..n).step_by(2).collect();
    let halves_feasible = even.len() >= h + 1 && odd.len() >= h + 1;
    let half_sets: Vec<(Array2<f64>, Array2<f64>)> = if halves_feasible {
        [&even, &odd]
            .iter()
            .map(|idx| {
                (
                    evidence.inputs.select(Axis(0), idx.as_slice()),
                    evidence.outputs.select(Axis(0), idx.as_slice()),
                )
            })
            .collect()
    } else {
        debug!("Evaluation set too small to split; auditing signs on the full set");
        Vec::new()
    };

    let audit_one = |j: usize| -> Result<(f64, f64, bool)> {
        let mut flipped_signs = signs.clone();
        flipped_signs[j] = -flipped_signs[j];
        let kept_full = base;
        let flipped_full = fit_residual(&xs, &ys, records, &flipped_signs, config.rank_tol)?;
        let consistent = if half_sets.is_empty() {
            kept_full + config.sign_residual_tol < flipped_full
        } else {
            let mut ok = true;
            for (hx, hy) in &half_sets {
                let kept = fit_residual(&hx.view(), &hy.view(), records, &signs, config.rank_tol)?;
                let flip = fit_residual(
                    &hx.view(),
                    &hy.view(),
                    records,
                    &flipped_signs,
                    config.rank_tol,
                )?;
                if kept + config.sign_residual_tol >= flip {
                    ok = false;
                    break;
                }
            }
            ok
        };
        Ok((kept_full, flipped_full, consistent))
    };

    let audits: Vec<(f64, f64, bool)> = if config.parallel && h >= 2 {
        (0..h)
            .into_par_iter()
            .map(audit_one)
            .collect::<Result<Vec<_>>>()?
    } else {
        (0..h).map(audit_one).collect::<Result<Vec<_>>>()?
    };

    let mut conflicts = Vec::new();
    for (j, (kept, flipped, consistent)) in audits.into_iter().enumerate() {
        neurons[j].sign = signs[j];
        neurons[j].finalized = true;
        neurons[j].residual_kept = Some(kept);
        neurons[j].residual_flipped = Some(flipped);
        if !consistent {
            warn!(
                "Unit {}: sign evidence inconsistent (kept {:.3e}, flipped {:.3e})",
                j, kept, flipped
            );
            conflicts.push(j);
        }
    }

    Ok(SignReport { conflicts })
}
