//! Configuration and report types for the extraction pipeline.
//!
//! Every numerical tolerance the attack depends on is an explicit field here
//! rather than a buried constant: discontinuity detection, bisection
//! convergence, coincident-crossing rejection, clustering similarity, sign
//! residual margins and the solve rank gate all interact, and tuning them is
//! part of operating the attack.

use fex_core::{ExtractionError, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Configuration for a functionally-equivalent extraction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Number of random probing directions searched per probe input.
    pub directions_per_probe: usize,
    /// Half-width of the searched parameter interval: `t ∈ [-range, range]`.
    pub search_range: f64,
    /// Number of grid cells the interval is scanned with before bisection.
    pub grid_points: usize,
    /// Minimum max-abs Jacobian change that counts as a discontinuity.
    pub jump_tol: f64,
    /// Bisection convergence tolerance in `t`.
    pub t_tol: f64,
    /// Iteration cap per bisection; exceeding it reports the interval as
    /// inconclusive instead of looping.
    pub max_bisection_iters: usize,
    /// Maximum relative residual for a Jacobian jump to count as rank-one;
    /// larger residuals mean coincident crossings and the point is discarded.
    pub rank_one_tol: f64,
    /// Minimum |cosine| between jump directions for two critical points to
    /// be attributed to the same hidden unit.
    pub cluster_cos_tol: f64,
    /// Minimum critical points per cluster before a unit is recovered.
    /// `None` uses the input dimensionality.
    pub min_cluster_points: Option<usize>,
    /// Tolerance for the affine-span rank check on cluster locations.
    pub span_tol: f64,
    /// Offset of the straddling query points used during sign resolution.
    pub sign_delta: f64,
    /// Strict margin by which the kept sign's residual must beat its
    /// negation; smaller separations are surfaced as conflicts.
    pub sign_residual_tol: f64,
    /// Maximum coordinate-descent passes over the sign vector.
    pub sign_max_passes: usize,
    /// Pivot tolerance for the output-layer solve rank check.
    pub rank_tol: f64,
    /// How many times a line whose only findings were ambiguous is retried
    /// with a perturbed direction.
    pub ambiguous_retries: usize,
    /// Random seed for probing directions.
    pub seed: u64,
    /// Whether to run line searches in parallel using Rayon.
    pub parallel: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            directions_per_probe: 4,
            search_range: 10.0,
            grid_points: 64,
            jump_tol: 1e-5,
            t_tol: 1e-6,
            max_bisection_iters: 80,
            rank_one_tol: 1e-3,
            cluster_cos_tol: 0.999,
            min_cluster_points: None,
            span_tol: 1e-8,
            sign_delta: 0.05,
            sign_residual_tol: 1e-8,
            sign_max_passes: 3,
            rank_tol: 1e-10,
            ambiguous_retries: 1,
            seed: 42,
            parallel: true,
        }
    }
}

impl ExtractionConfig {
    /// Config for a fast extraction (fewer lines, coarser grid).
    pub fn fast() -> Self {
        Self {
            directions_per_probe: 2,
            grid_points: 32,
            ambiguous_retries: 0,
            parallel: false, // Too few lines to benefit
            ..Self::default()
        }
    }

    /// Config for a thorough extraction (more lines, finer grid).
    pub fn thorough() -> Self {
        Self {
            directions_per_probe: 8,
            grid_points: 128,
            t_tol: 1e-8,
            ambiguous_retries: 2,
            ..Self::default()
        }
    }

    /// Validate field ranges before a run.
    pub fn validate(&self) -> Result<()> {
        if self.directions_per_probe == 0 {
            return Err(ExtractionError::InvalidConfig(
                "directions_per_probe must be at least 1".to_string(),
            ));
        }
        if self.grid_points < 2 {
            return Err(ExtractionError::InvalidConfig(
                "grid_points must be at least 2".to_string(),
            ));
        }
        if !(self.search_range > 0.0) {
            return Err(ExtractionError::InvalidConfig(
                "search_range must be positive".to_string(),
            ));
        }
        if !(self.jump_tol > 0.0) || !(self.t_tol > 0.0) {
            return Err(ExtractionError::InvalidConfig(
                "jump_tol and t_tol must be positive".to_string(),
            ));
        }
        if self.max_bisection_iters == 0 {
            return Err(ExtractionError::InvalidConfig(
                "max_bisection_iters must be at least 1".to_string(),
            ));
        }
        if !(self.rank_one_tol >= 0.0) {
            return Err(ExtractionError::InvalidConfig(
                "rank_one_tol must be non-negative".to_string(),
            ));
        }
        if !(self.cluster_cos_tol > 0.0 && self.cluster_cos_tol <= 1.0) {
            return Err(ExtractionError::InvalidConfig(
                "cluster_cos_tol must be in (0, 1]".to_string(),
            ));
        }
        if !(self.sign_delta > 0.0) {
            return Err(ExtractionError::InvalidConfig(
                "sign_delta must be positive".to_string(),
            ));
        }
        if self.sign_max_passes == 0 {
            return Err(ExtractionError::InvalidConfig(
                "sign_max_passes must be at least 1".to_string(),
            ));
        }
        if !(self.rank_tol > 0.0) || !(self.span_tol > 0.0) {
            return Err(ExtractionError::InvalidConfig(
                "rank_tol and span_tol must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stages of an extraction run.
///
/// `extract` drives these in order; any stage can terminate the run with a
/// failure, surfaced as an error rather than a silently degraded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionStage {
    Init,
    Searching,
    Clustering,
    SignResolution,
    LinearSolve,
    Done,
    Failed,
}

/// An input at which exactly one hidden unit's pre-activation crosses zero.
///
/// Tagged with the probe/direction pair that produced it and with the
/// rank-one decomposition of the observed Jacobian jump:
/// `ΔJ ≈ jump_coefficients ⊗ jump_direction`, where `jump_direction` is a
/// unit vector proportional to the crossing unit's weight row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalPoint {
    pub probe_index: usize,
    pub direction_index: usize,
    /// Line parameter at the crossing: `location = origin + t·direction`.
    pub t: f64,
    pub location: Array1<f64>,
    /// Unit probing direction of the line that found this point.
    pub direction: Array1<f64>,
    /// Unit input-space direction of the Jacobian jump, sign-canonicalized
    /// (largest-magnitude component positive).
    pub jump_direction: Array1<f64>,
    /// Per-output jump coefficients (proportional to the unit's output-layer
    /// column times its weight-row norm).
    pub jump_coefficients: Array1<f64>,
    /// Frobenius norm of the Jacobian jump.
    pub jump_magnitude: f64,
}

/// Why a flagged search interval produced no usable critical point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The line crossed no unit boundary within the searched range.
    NoCrossing,
    /// More than one unit switched at the located point; the evidence is
    /// discarded rather than guessed at.
    AmbiguousDiscontinuity { t: f64 },
    /// Bisection hit its iteration cap before converging.
    Inconclusive { t_lo: f64, t_hi: f64 },
}

/// A discarded or empty search, tagged with the line that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchSkip {
    pub probe_index: usize,
    pub direction_index: usize,
    pub reason: SkipReason,
}

/// Recovered state for one hidden unit.
///
/// Created once a cluster of critical points passes the size and span gates;
/// the weight is unit-normalized (magnitude is absorbed by the output-layer
/// column) and the sign is provisional until the resolver finalizes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronRecord {
    /// Unit-normalized weight direction.
    pub weight: Array1<f64>,
    /// Bias under the unit-norm convention, from `w·x* + b = 0` averaged
    /// over the cluster.
    pub bias: f64,
    /// Resolved sign (`+1.0` or `-1.0`); provisional `+1.0` until finalized.
    pub sign: f64,
    /// Whether sign resolution has finalized this record.
    pub finalized: bool,
    /// A critical point on this unit's boundary, kept for straddle queries.
    pub anchor: Array1<f64>,
    /// Number of critical points attributed to this unit.
    pub num_points: usize,
    /// Largest deviation of a per-point bias estimate from the mean.
    pub bias_spread: f64,
    /// Fit residual of the kept sign, once audited.
    pub residual_kept: Option<f64>,
    /// Fit residual of the rejected sign, once audited.
    pub residual_flipped: Option<f64>,
}

impl NeuronRecord {
    /// Weight row and bias with the resolved sign folded in.
    pub fn oriented(&self) -> (Array1<f64>, f64) {
        (self.weight.mapv(|v| v * self.sign), self.bias * self.sign)
    }
}

/// Why a hidden unit assumed to exist was not recovered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UnrecoveredReason {
    /// No cluster of critical points could be attributed to the unit; its
    /// boundary was never crossed by a probed line.
    NoCluster,
    /// A cluster existed but lacked enough independent points to pin down
    /// the unit's hyperplane.
    Underdetermined { points: usize },
    /// Sign evidence was inconsistent across the audit halves; the unit is
    /// excluded instead of guessing.
    SignConflict { kept: f64, flipped: f64 },
}
