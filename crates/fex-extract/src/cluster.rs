//! Attribution of critical points to hidden units and weight recovery.
//!
//! The victim's internal unit ordering is unobservable, so unit identity is
//! keyed by the direction of the Jacobian jump: two critical points belong
//! to the same unit iff their jump directions are parallel (or
//! anti-parallel) within a cosine tolerance. Each sufficiently large cluster
//! yields one unit's weight direction (the sign-aligned mean of its jump
//! directions) and bias (from `w·x* + b = 0`, averaged over the cluster).

use ndarray::Array1;
use tracing::debug;

use crate::config::{CriticalPoint, NeuronRecord};

/// A group of critical points attributed to one hidden unit.
#[derive(Debug, Clone)]
pub(crate) struct Cluster {
    /// Sum of sign-aligned member jump directions.
    accum: Array1<f64>,
    /// Indices into the flat critical-point list, in discovery order.
    pub members: Vec<usize>,
}

impl Cluster {
    /// Current mean direction, unit-normalized.
    pub fn direction(&self) -> Array1<f64> {
        let norm = self.accum.dot(&self.accum).sqrt();
        &self.accum / norm
    }
}

/// Greedy single-pass clustering by |cosine| of jump direction.
///
/// Points are visited in discovery order and joined to the best matching
/// cluster above the tolerance, so the result is deterministic for a fixed
/// point order.
pub(crate) fn cluster_jumps(points: &[CriticalPoint], cos_tol: f64) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();

    for (idx, point) in points.iter().enumerate() {
        let mut best: Option<(usize, f64)> = None;
        for (ci, cluster) in clusters.iter().enumerate() {
            let cos = cluster.direction().dot(&point.jump_direction);
            if cos.abs() >= cos_tol && best.map_or(true, |(_, b)| cos.abs() > b.abs()) {
                best = Some((ci, cos));
            }
        }
        match best {
            Some((ci, cos)) => {
                let aligned = point.jump_direction.mapv(|v| v * cos.signum());
                clusters[ci].accum += &aligned;
                clusters[ci].members.push(idx);
            }
            None => clusters.push(Cluster {
                accum: point.jump_direction.clone(),
                members: vec![idx],
            }),
        }
    }

    debug!(
        "Clustered {} critical points into {} candidate units",
        points.len(),
        clusters.len()
    );
    clusters
}

/// Result of turning one cluster into a neuron record.
pub(crate) enum ClusterOutcome {
    Neuron(NeuronRecord),
    /// The cluster cannot pin down a hyperplane in `d` dimensions.
    Underdetermined { points: usize },
}

/// Recover a unit's weight direction and bias from a cluster.
///
/// Gates: the cluster must contain at least `min_points` members, and the
/// member locations must affinely span the unit's hyperplane (rank `d−1`
/// among location differences) so the bias estimate is anchored by
/// geometrically independent evidence.
pub(crate) fn recover_neuron(
    cluster: &Cluster,
    points: &[CriticalPoint],
    min_points: usize,
    span_tol: f64,
) -> ClusterOutcome {
    let d = points[cluster.members[0]].location.len();
    if cluster.members.len() < min_points {
        return ClusterOutcome::Underdetermined {
            points: cluster.members.len(),
        };
    }
    if affine_rank(cluster, points, span_tol) + 1 < d {
        return ClusterOutcome::Underdetermined {
            points: cluster.members.len(),
        };
    }

    let weight = cluster.direction();
    let biases: Vec<f64> = cluster
        .members
        .iter()
        .map(|&i| -weight.dot(&points[i].location))
        .collect();
    let bias = biases.iter().sum::<f64>() / biases.len() as f64;
    let bias_spread = biases
        .iter()
        .fold(0.0_f64, |acc, b| acc.max((b - bias).abs()));

    ClusterOutcome::Neuron(NeuronRecord {
        weight,
        bias,
        sign: 1.0,
        finalized: false,
        anchor: points[cluster.members[0]].location.clone(),
        num_points: cluster.members.len(),
        bias_spread,
        residual_kept: None,
        residual_flipped: None,
    })
}

/// Rank of the differences between cluster locations and the first member,
/// via modified Gram-Schmidt with a tolerance.
fn affine_rank(cluster: &Cluster, points: &[CriticalPoint], tol: f64) -> usize {
    let x0 = &points[cluster.members[0]].location;
    let mut basis: Vec<Array1<f64>> = Vec::new();

    for &i in &cluster.members[1..] {
        let mut v = &points[i].location - x0;
        let scale = v.dot(&v).sqrt();
        if scale <= tol {
            continue;
        }
        for b in &basis {
            let c = v.dot(b);
            v = v - &(b * c);
        }
        let norm = v.dot(&v).sqrt();
        if norm > tol * scale.max(1.0) {
            basis.push(v / norm);
        }
    }
    basis.len()
}
