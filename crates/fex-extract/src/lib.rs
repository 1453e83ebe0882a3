//! Functionally-equivalent extraction of one-hidden-layer ReLU classifiers.
//!
//! Given forward and Jacobian query access to a trained victim, the attack
//! reconstructs a network whose input/output behavior matches the victim's,
//! recovering its weight matrices and bias vectors up to a per-unit positive
//! scale and a permutation of hidden units rather than merely approximating
//! its decisions.
//!
//! ## Algorithm
//!
//! 1. **Critical-point search**: along random 1-D probing lines, locate the
//!    inputs where the victim's Jacobian jumps; each jump marks one hidden
//!    unit's activation boundary.
//! 2. **Weight recovery**: cluster the critical points by the direction of
//!    the Jacobian jump (parallel jumps ⇒ same unit) and read each unit's
//!    weight row and bias off its cluster.
//! 3. **Sign resolution**: fix each unit's sign by testing both hypotheses
//!    against the output-layer fit residual, with straddling oracle queries
//!    around each unit's boundary.
//! 4. **Output-layer solve**: with the hidden layer fixed, the remaining
//!    parameters are linear; a least-squares solve over the probe set
//!    recovers them exactly.
//!
//! ## References
//!
//! - Jagielski et al. (2020). "High Accuracy and High Fidelity Extraction
//!   of Neural Networks"
//! - Carlini, Jagielski, Mironov (2020). "Cryptanalytic Extraction of
//!   Neural Network Models"

pub mod config;
pub mod extractor;

mod cluster;
mod search;
mod sign;
mod solve;

pub use config::{
    CriticalPoint, ExtractionConfig, ExtractionStage, NeuronRecord, SearchSkip, SkipReason,
    UnrecoveredReason,
};
pub use extractor::{Extraction, Extractor};

// Re-export core types for downstream use.
pub use fex_core::{ExtractionError, Oracle, ReluNetwork, Result};

#[cfg(test)]
mod tests;
