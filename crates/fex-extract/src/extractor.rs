//! Extraction orchestrator: drives search, clustering, sign resolution and
//! the output-layer solve, and owns all intermediate state.

use fex_core::{ExtractionError, Oracle, ReluNetwork, Result};
use ndarray::{s, Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::{debug, info, warn};

use crate::cluster::{cluster_jumps, recover_neuron, ClusterOutcome};
use crate::config::{
    CriticalPoint, ExtractionConfig, ExtractionStage, NeuronRecord, SearchSkip, SkipReason,
    UnrecoveredReason,
};
use crate::search::{search_line, LineSearch, ProbeLine};
use crate::sign::{build_evidence, resolve_signs};
use crate::solve::solve_output_layer;

/// Result of an extraction run.
///
/// Retains the recovered network plus every intermediate artifact a caller
/// may want to inspect: per-probe critical points, per-unit records,
/// unrecovered-unit reports and the discarded-search log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    /// The recovered network. Its hidden dimension is the number of units
    /// actually recovered, which is less than `num_neurons` for a partial
    /// extraction.
    pub network: ReluNetwork,
    /// Hidden-unit count the attack assumed.
    pub num_neurons: usize,
    /// Critical points discovered per probe input.
    pub critical_points: Vec<Vec<CriticalPoint>>,
    /// Finalized per-unit records, row-aligned with the network's hidden
    /// layer.
    pub neurons: Vec<NeuronRecord>,
    /// One entry per assumed unit that could not be recovered.
    pub unrecovered: Vec<UnrecoveredReason>,
    /// Searches that produced no usable critical point.
    pub skips: Vec<SearchSkip>,
    /// Total probing lines searched, retries included.
    pub lines_searched: usize,
    /// Frobenius residual of the output-layer solve.
    pub solve_residual: f64,
    /// Largest absolute error of the reconstruction against the oracle over
    /// the probe set.
    pub max_probe_error: f64,
}

impl Extraction {
    /// Recovered hidden-layer weights, one row per recovered unit.
    pub fn w0(&self) -> &Array2<f64> {
        self.network.w0()
    }

    /// Recovered hidden-layer biases.
    pub fn b0(&self) -> &Array1<f64> {
        self.network.b0()
    }

    /// Recovered output-layer weights.
    pub fn w1(&self) -> &Array2<f64> {
        self.network.w1()
    }

    /// Recovered output-layer biases.
    pub fn b1(&self) -> &Array1<f64> {
        self.network.b1()
    }

    /// Critical points discovered for one probe input.
    pub fn critical_points_for(&self, probe: usize) -> &[CriticalPoint] {
        &self.critical_points[probe]
    }

    /// Whether every assumed hidden unit was recovered.
    pub fn is_complete(&self) -> bool {
        self.unrecovered.is_empty() && self.neurons.len() == self.num_neurons
    }
}

/// Functionally-equivalent extraction driver.
///
/// Holds the victim oracle, the assumed hidden-unit count and the
/// configuration; [`Extractor::extract`] runs the full pipeline once per
/// call with fresh state (no accumulation across calls).
pub struct Extractor<'a> {
    oracle: &'a dyn Oracle,
    num_neurons: usize,
    config: ExtractionConfig,
}

impl<'a> Extractor<'a> {
    pub fn new(oracle: &'a dyn Oracle, num_neurons: usize, config: ExtractionConfig) -> Self {
        Self {
            oracle,
            num_neurons,
            config,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Run the extraction against a batch of probe inputs (rows).
    ///
    /// Drives `Init → Searching → Clustering → SignResolution → LinearSolve
    /// → Done`; any stage-level failure terminates the run with a structured
    /// error instead of a silently degraded model.
    pub fn extract(&self, probes: ArrayView2<'_, f64>) -> Result<Extraction> {
        let result = self.run(probes);
        if let Err(err) = &result {
            warn!("Extraction entered {:?}: {}", ExtractionStage::Failed, err);
        }
        result
    }

    fn run(&self, probes: ArrayView2<'_, f64>) -> Result<Extraction> {
        self.config.validate()?;
        if self.num_neurons == 0 {
            return Err(ExtractionError::InvalidConfig(
                "assumed hidden-unit count must be at least 1".to_string(),
            ));
        }
        let d = self.oracle.input_dim();
        if probes.nrows() == 0 || probes.ncols() != d {
            return Err(ExtractionError::ShapeMismatch {
                expected: vec![1, d],
                got: vec![probes.nrows(), probes.ncols()],
            });
        }

        info!(
            "Starting extraction: {} probes, {} assumed hidden units, {} outputs",
            probes.nrows(),
            self.num_neurons,
            self.oracle.output_dim()
        );

        // Searching: fan out over probe × direction lines; merge results
        // sequentially in line order so runs are deterministic.
        info!("Stage {:?}", ExtractionStage::Searching);
        let mut per_probe: Vec<Vec<CriticalPoint>> = vec![Vec::new(); probes.nrows()];
        let mut skips: Vec<SearchSkip> = Vec::new();
        let mut lines_searched = 0_usize;

        let mut pending = self.build_lines(&probes);
        let mut retry_round = 0_usize;
        while !pending.is_empty() {
            let searches = self.search_lines(&pending)?;
            lines_searched += pending.len();

            let mut retries = Vec::new();
            for (line, search) in pending.iter().zip(&searches) {
                for point in &search.points {
                    per_probe[point.probe_index].push(point.clone());
                }
                let ambiguous = search
                    .skips
                    .iter()
                    .any(|skip| matches!(skip.reason, SkipReason::AmbiguousDiscontinuity { .. }));
                skips.extend(search.skips.iter().copied());
                if ambiguous && retry_round < self.config.ambiguous_retries {
                    retries.push(self.perturbed_line(line, retry_round));
                }
            }
            if !retries.is_empty() {
                debug!(
                    "Retrying {} line(s) with perturbed directions (round {})",
                    retries.len(),
                    retry_round + 1
                );
            }
            pending = retries;
            retry_round += 1;
        }

        let all_points: Vec<CriticalPoint> =
            per_probe.iter().flat_map(|v| v.iter().cloned()).collect();
        debug!(
            "Search found {} critical points across {} lines ({} skips)",
            all_points.len(),
            lines_searched,
            skips.len()
        );
        if all_points.is_empty() {
            return Err(ExtractionError::SearchExhausted {
                lines: lines_searched,
            });
        }

        // Clustering: attribute points to units and recover weight rows.
        info!("Stage {:?}", ExtractionStage::Clustering);
        let mut clusters = cluster_jumps(&all_points, self.config.cluster_cos_tol);
        clusters.sort_by_key(|c| (Reverse(c.members.len()), c.members[0]));
        if clusters.len() > self.num_neurons {
            warn!(
                "{} candidate units found but only {} assumed; discarding the smallest clusters",
                clusters.len(),
                self.num_neurons
            );
        }

        let min_points = self.config.min_cluster_points.unwrap_or(d);
        let mut neurons: Vec<NeuronRecord> = Vec::new();
        let mut unrecovered: Vec<UnrecoveredReason> = Vec::new();
        for cluster in clusters.iter().take(self.num_neurons) {
            match recover_neuron(cluster, &all_points, min_points, self.config.span_tol) {
                ClusterOutcome::Neuron(record) => {
                    debug!(
                        "Recovered unit from {} points (bias {:.6}, spread {:.3e})",
                        record.num_points, record.bias, record.bias_spread
                    );
                    neurons.push(record);
                }
                ClusterOutcome::Underdetermined { points } => {
                    warn!("Cluster of {} point(s) cannot determine a unit; skipping", points);
                    unrecovered.push(UnrecoveredReason::Underdetermined { points });
                }
            }
        }
        for _ in clusters.len()..self.num_neurons {
            unrecovered.push(UnrecoveredReason::NoCluster);
        }
        if neurons.is_empty() {
            return Err(ExtractionError::NoNeuronsRecovered {
                points: all_points.len(),
            });
        }

        // Sign resolution: fix each unit's sign against the oracle.
        info!("Stage {:?}", ExtractionStage::SignResolution);
        let evidence = build_evidence(self.oracle, probes, &neurons, self.config.sign_delta)?;
        let report = resolve_signs(&mut neurons, &evidence, &self.config)?;
        for &j in report.conflicts.iter().rev() {
            let record = neurons.remove(j);
            unrecovered.push(UnrecoveredReason::SignConflict {
                kept: record.residual_kept.unwrap_or(0.0),
                flipped: record.residual_flipped.unwrap_or(0.0),
            });
        }
        if neurons.is_empty() {
            return Err(ExtractionError::NoNeuronsRecovered {
                points: all_points.len(),
            });
        }

        // Linear solve: closed-form output layer over the probe set.
        info!("Stage {:?}", ExtractionStage::LinearSolve);
        let probe_outputs = evidence.outputs.slice(s![..evidence.num_probes, ..]);
        let (w1, b1, solve_residual) =
            solve_output_layer(&neurons, &probes, &probe_outputs, self.config.rank_tol)?;

        let h = neurons.len();
        let mut w0 = Array2::zeros((h, d));
        let mut b0 = Array1::zeros(h);
        for (j, record) in neurons.iter().enumerate() {
            let (w, b) = record.oriented();
            w0.row_mut(j).assign(&w);
            b0[j] = b;
        }
        let network = ReluNetwork::new(w0, b0, w1, b1)?;

        let reconstruction = network.forward_batch(probes);
        let max_probe_error = (&reconstruction - &probe_outputs)
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));

        info!(
            "Stage {:?}: recovered {}/{} units, solve residual {:.3e}, max probe error {:.3e}",
            ExtractionStage::Done,
            neurons.len(),
            self.num_neurons,
            solve_residual,
            max_probe_error
        );

        Ok(Extraction {
            network,
            num_neurons: self.num_neurons,
            critical_points: per_probe,
            neurons,
            unrecovered,
            skips,
            lines_searched,
            solve_residual,
            max_probe_error,
        })
    }

    fn build_lines(&self, probes: &ArrayView2<'_, f64>) -> Vec<ProbeLine> {
        let d = probes.ncols();
        let mut lines = Vec::with_capacity(probes.nrows() * self.config.directions_per_probe);
        for (probe_index, origin) in probes.outer_iter().enumerate() {
            for direction_index in 0..self.config.directions_per_probe {
                let line_index = probe_index * self.config.directions_per_probe + direction_index;
                let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(line_index as u64));
                lines.push(ProbeLine {
                    probe_index,
                    direction_index,
                    origin: origin.to_owned(),
                    direction: random_unit(&mut rng, d),
                });
            }
        }
        lines
    }

    /// Jitter a line's direction for an ambiguity retry, deterministically.
    fn perturbed_line(&self, line: &ProbeLine, retry_round: usize) -> ProbeLine {
        let d = line.direction.len();
        let line_index = line.probe_index * self.config.directions_per_probe + line.direction_index;
        let salt = (retry_round as u64 + 1).wrapping_mul(1_000_003);
        let mut rng =
            StdRng::seed_from_u64(self.config.seed.wrapping_add(line_index as u64).wrapping_add(salt));
        let jitter = random_unit(&mut rng, d);
        let direction = &line.direction + &jitter.mapv(|v| v * 0.2);
        let norm = direction.dot(&direction).sqrt();
        ProbeLine {
            probe_index: line.probe_index,
            direction_index: line.direction_index,
            origin: line.origin.clone(),
            direction: direction / norm,
        }
    }

    fn search_lines(&self, lines: &[ProbeLine]) -> Result<Vec<LineSearch>> {
        if self.config.parallel && lines.len() >= 2 {
            lines
                .par_iter()
                .map(|line| search_line(self.oracle, line, &self.config))
                .collect()
        } else {
            lines
                .iter()
                .map(|line| search_line(self.oracle, line, &self.config))
                .collect()
        }
    }
}

/// Random unit vector with coordinates drawn uniformly from `[-1, 1]`.
fn random_unit(rng: &mut StdRng, d: usize) -> Array1<f64> {
    loop {
        let v: Array1<f64> = (0..d).map(|_| rng.random_range(-1.0..=1.0)).collect();
        let norm = v.dot(&v).sqrt();
        if norm > 1e-6 {
            return v / norm;
        }
    }
}
