//! Core types and traits for functionally-equivalent network extraction.
//!
//! This crate provides the foundational abstractions shared by the attack
//! pipeline: the error taxonomy, the [`Oracle`] capability trait through
//! which a victim classifier is queried, and the closed-form one-hidden-layer
//! [`ReluNetwork`] that serves both as the container for recovered parameters
//! and as a test double for victims.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for extraction operations.
///
/// Run-fatal conditions only; stage-local conditions (a discarded critical
/// point, a single unrecoverable unit) are reported as data alongside the
/// extraction result rather than aborting the run.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Oracle evaluation failed: {0}")]
    Oracle(String),

    #[error("No critical point survived on any of the {lines} probed lines")]
    SearchExhausted { lines: usize },

    #[error(
        "Design matrix is rank-deficient ({rows} equations for {cols} unknowns); \
         supply more or more diverse probes"
    )]
    SingularDesignMatrix { rows: usize, cols: usize },

    #[error("No hidden unit could be recovered from {points} critical points")]
    NoNeuronsRecovered { points: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ExtractionError>;

/// Query surface of a victim classifier.
///
/// The attack is coupled to its victim only through this trait: forward
/// evaluation and Jacobian evaluation at arbitrary real-valued inputs.
/// Implementations hold no extraction state and must tolerate concurrent
/// read-only queries (the trait is `Sync` so probe-line workers can fan out).
///
/// Inputs must lie in the victim's valid domain; when [`Oracle::domain`]
/// declares a range, callers clamp derived query points into it before
/// evaluating.
pub trait Oracle: Sync {
    /// Dimensionality of the victim's input space.
    fn input_dim(&self) -> usize;

    /// Number of victim outputs (logits).
    fn output_dim(&self) -> usize;

    /// Evaluate the victim on a batch of inputs (rows), returning one row of
    /// logits per input.
    fn evaluate(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Jacobian of the logits with respect to the input at a single point,
    /// shaped `(output_dim, input_dim)`.
    fn jacobian(&self, input: ArrayView1<'_, f64>) -> Result<Array2<f64>>;

    /// Declared valid input range per coordinate, if the victim has one
    /// (e.g. `(0.0, 1.0)` for a clipped image classifier).
    fn domain(&self) -> Option<(f64, f64)> {
        None
    }
}

/// A one-hidden-layer ReLU network: `f(x) = W1 · relu(W0·x + b0) + b1`.
///
/// Shapes: `W0 (h×d)`, `b0 (h)`, `W1 (k×h)`, `b1 (k)`. This is the functional
/// form the attack recovers, so it doubles as the deliverable container and
/// as a closed-form victim for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReluNetwork {
    w0: Array2<f64>,
    b0: Array1<f64>,
    w1: Array2<f64>,
    b1: Array1<f64>,
}

impl ReluNetwork {
    /// Create a network, validating that all four parameter shapes agree.
    pub fn new(
        w0: Array2<f64>,
        b0: Array1<f64>,
        w1: Array2<f64>,
        b1: Array1<f64>,
    ) -> Result<Self> {
        let (h, _d) = w0.dim();
        if b0.len() != h {
            return Err(ExtractionError::ShapeMismatch {
                expected: vec![h],
                got: vec![b0.len()],
            });
        }
        let (k, w1_h) = w1.dim();
        if w1_h != h {
            return Err(ExtractionError::ShapeMismatch {
                expected: vec![k, h],
                got: vec![k, w1_h],
            });
        }
        if b1.len() != k {
            return Err(ExtractionError::ShapeMismatch {
                expected: vec![k],
                got: vec![b1.len()],
            });
        }
        Ok(Self { w0, b0, w1, b1 })
    }

    pub fn input_dim(&self) -> usize {
        self.w0.ncols()
    }

    pub fn hidden_dim(&self) -> usize {
        self.w0.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.w1.nrows()
    }

    pub fn w0(&self) -> &Array2<f64> {
        &self.w0
    }

    pub fn b0(&self) -> &Array1<f64> {
        &self.b0
    }

    pub fn w1(&self) -> &Array2<f64> {
        &self.w1
    }

    pub fn b1(&self) -> &Array1<f64> {
        &self.b1
    }

    /// Hidden-layer pre-activations `W0·x + b0` at a single input.
    pub fn preactivations(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        self.w0.dot(&x) + &self.b0
    }

    /// Forward pass at a single input.
    pub fn forward(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        let hidden = self.preactivations(x).mapv(|z| z.max(0.0));
        self.w1.dot(&hidden) + &self.b1
    }

    /// Forward pass over a batch of inputs (rows), one row of logits each.
    pub fn forward_batch(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let hidden = (x.dot(&self.w0.t()) + &self.b0).mapv(|z| z.max(0.0));
        hidden.dot(&self.w1.t()) + &self.b1
    }

    /// Jacobian `∂f/∂x` at a single input.
    ///
    /// The network is piecewise linear: `J = W1 · diag(z > 0) · W0`, constant
    /// within each activation region and discontinuous across unit
    /// boundaries.
    pub fn jacobian(&self, x: ArrayView1<'_, f64>) -> Array2<f64> {
        let z = self.preactivations(x);
        let mut masked = self.w0.clone();
        for (i, mut row) in masked.outer_iter_mut().enumerate() {
            if z[i] <= 0.0 {
                row.fill(0.0);
            }
        }
        self.w1.dot(&masked)
    }

    /// Largest absolute output difference from `other` over a set of points.
    ///
    /// The standard equivalence diagnostic: two functionally equivalent
    /// networks agree everywhere, so the max divergence over a dense random
    /// sample bounds how far an extraction is from its victim.
    pub fn max_divergence(&self, other: &ReluNetwork, points: ArrayView2<'_, f64>) -> Result<f64> {
        if other.input_dim() != self.input_dim() || other.output_dim() != self.output_dim() {
            return Err(ExtractionError::ShapeMismatch {
                expected: vec![self.input_dim(), self.output_dim()],
                got: vec![other.input_dim(), other.output_dim()],
            });
        }
        let diff = self.forward_batch(points) - other.forward_batch(points);
        Ok(diff.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())))
    }
}

impl Oracle for ReluNetwork {
    fn input_dim(&self) -> usize {
        self.input_dim()
    }

    fn output_dim(&self) -> usize {
        self.output_dim()
    }

    fn evaluate(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if inputs.ncols() != self.input_dim() {
            return Err(ExtractionError::ShapeMismatch {
                expected: vec![inputs.nrows(), self.input_dim()],
                got: vec![inputs.nrows(), inputs.ncols()],
            });
        }
        Ok(self.forward_batch(inputs))
    }

    fn jacobian(&self, input: ArrayView1<'_, f64>) -> Result<Array2<f64>> {
        if input.len() != self.input_dim() {
            return Err(ExtractionError::ShapeMismatch {
                expected: vec![self.input_dim()],
                got: vec![input.len()],
            });
        }
        Ok(self.jacobian(input))
    }
}
