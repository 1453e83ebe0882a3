//! Extraction pipeline tests.

mod search;

use fex_core::ReluNetwork;
use ndarray::{arr1, arr2, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 2-input, 3-hidden, 2-output victim with hand-chosen weights.
///
/// All three unit boundaries pass near the origin, so probing lines anchored
/// at small random probes cross every one of them within the default search
/// range. Unit 2's weight row flips under the canonical jump-direction
/// convention, so the scenario exercises a genuinely negative sign.
pub(crate) fn victim_2x3x2() -> ReluNetwork {
    ReluNetwork::new(
        arr2(&[[1.0, 0.5], [-0.6, 1.2], [0.8, -1.1]]),
        arr1(&[0.25, -0.4, 0.3]),
        arr2(&[[1.5, -0.7, 0.9], [0.3, 1.1, -1.3]]),
        arr1(&[0.2, -0.5]),
    )
    .unwrap()
}

/// Uniform random probe batch in `[-scale, scale]^d`.
pub(crate) fn random_probes(n: usize, d: usize, seed: u64, scale: f64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, d), |_| rng.random_range(-scale..=scale))
}
