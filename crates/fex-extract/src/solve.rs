//! Output-layer recovery via linear least squares.
//!
//! With the hidden layer fixed, the victim is linear in the remaining
//! unknowns: `A · [W1ᵀ; b1ᵀ] = Y`, where `A` holds the recovered hidden
//! activations per probe plus a constant column. The system is solved by
//! normal equations with partial-pivoting Gaussian elimination; a pivot
//! below the rank tolerance means the probe set does not determine the
//! output layer and the run must fail rather than return an underdetermined
//! solution.

use fex_core::{ExtractionError, Result};
use ndarray::{s, Array1, Array2, ArrayView2};

use crate::config::NeuronRecord;

/// A least-squares solution and its Frobenius residual.
#[derive(Debug)]
pub(crate) struct Lstsq {
    pub solution: Array2<f64>,
    pub residual: f64,
}

/// Hidden-activation design matrix with a trailing constant column.
///
/// Entry `(p, j)` is `relu(s_j·(ŵ_j·x_p + b̂_j))` for the unit-norm
/// provisional weights; `signs` carries the current sign hypothesis.
pub(crate) fn design_matrix(
    xs: &ArrayView2<'_, f64>,
    neurons: &[NeuronRecord],
    signs: &[f64],
) -> Array2<f64> {
    let n = xs.nrows();
    let h = neurons.len();
    let mut a = Array2::zeros((n, h + 1));
    for (row, x) in xs.outer_iter().enumerate() {
        for (j, neuron) in neurons.iter().enumerate() {
            let z = signs[j] * (neuron.weight.dot(&x) + neuron.bias);
            a[[row, j]] = z.max(0.0);
        }
        a[[row, h]] = 1.0;
    }
    a
}

/// Solve `A·X = B` in the least-squares sense.
pub(crate) fn least_squares(
    a: &Array2<f64>,
    b: &ArrayView2<'_, f64>,
    rank_tol: f64,
) -> Result<Lstsq> {
    let (n, m) = a.dim();
    if n < m {
        return Err(ExtractionError::SingularDesignMatrix { rows: n, cols: m });
    }
    let gram = a.t().dot(a);
    let rhs = a.t().dot(b);
    let solution = solve_linear(gram, rhs, rank_tol)
        .ok_or(ExtractionError::SingularDesignMatrix { rows: n, cols: m })?;
    let residual = (&a.dot(&solution) - b)
        .iter()
        .map(|v| v * v)
        .sum::<f64>()
        .sqrt();
    Ok(Lstsq { solution, residual })
}

/// Gaussian elimination with partial pivoting; `None` on a pivot below the
/// rank tolerance.
fn solve_linear(mut g: Array2<f64>, mut c: Array2<f64>, rank_tol: f64) -> Option<Array2<f64>> {
    let m = g.nrows();
    let k = c.ncols();
    let scale = g.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())).max(1.0);

    for col in 0..m {
        let mut pivot_row = col;
        let mut pivot_abs = g[[col, col]].abs();
        for r in col + 1..m {
            let v = g[[r, col]].abs();
            if v > pivot_abs {
                pivot_abs = v;
                pivot_row = r;
            }
        }
        if pivot_abs <= rank_tol * scale {
            return None;
        }
        if pivot_row != col {
            for j in 0..m {
                g.swap([col, j], [pivot_row, j]);
            }
            for j in 0..k {
                c.swap([col, j], [pivot_row, j]);
            }
        }
        let pivot = g[[col, col]];
        for r in col + 1..m {
            let factor = g[[r, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in col..m {
                g[[r, j]] -= factor * g[[col, j]];
            }
            for j in 0..k {
                c[[r, j]] -= factor * c[[col, j]];
            }
        }
    }

    let mut x = Array2::zeros((m, k));
    for row in (0..m).rev() {
        for out in 0..k {
            let mut v = c[[row, out]];
            for j in row + 1..m {
                v -= g[[row, j]] * x[[j, out]];
            }
            x[[row, out]] = v / g[[row, row]];
        }
    }
    Some(x)
}

/// Solve for the output layer given finalized hidden units.
///
/// Returns `(W1, b1, residual)` with `W1` shaped `(k, h)`.
pub(crate) fn solve_output_layer(
    neurons: &[NeuronRecord],
    xs: &ArrayView2<'_, f64>,
    outputs: &ArrayView2<'_, f64>,
    rank_tol: f64,
) -> Result<(Array2<f64>, Array1<f64>, f64)> {
    let signs: Vec<f64> = neurons.iter().map(|n| n.sign).collect();
    let a = design_matrix(xs, neurons, &signs);
    let lstsq = least_squares(&a, outputs, rank_tol)?;
    let h = neurons.len();
    let w1 = lstsq.solution.slice(s![..h, ..]).t().to_owned();
    let b1 = lstsq.solution.row(h).to_owned();
    Ok((w1, b1, lstsq.residual))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fex_core::ExtractionError;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_least_squares_exact_system() {
        // x = (2, -1) solves exactly; residual 0.
        let a = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let b = arr2(&[[2.0], [-1.0], [1.0]]);
        let result = least_squares(&a, &b.view(), 1e-12).unwrap();
        assert!((result.solution[[0, 0]] - 2.0).abs() < 1e-10);
        assert!((result.solution[[1, 0]] + 1.0).abs() < 1e-10);
        assert!(result.residual < 1e-10);
    }

    #[test]
    fn test_least_squares_overdetermined_residual() {
        // Inconsistent system: best fit of [0, 1, 2] by a constant is 1.
        let a = arr2(&[[1.0], [1.0], [1.0]]);
        let b = arr2(&[[0.0], [1.0], [2.0]]);
        let result = least_squares(&a, &b.view(), 1e-12).unwrap();
        assert!((result.solution[[0, 0]] - 1.0).abs() < 1e-10);
        assert!((result.residual - 2.0_f64.sqrt()).abs() < 1e-10);
    }

    #[test]
    fn test_least_squares_rejects_underdetermined() {
        let a = arr2(&[[1.0, 2.0]]);
        let b = arr2(&[[1.0]]);
        let err = least_squares(&a, &b.view(), 1e-12).unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::SingularDesignMatrix { rows: 1, cols: 2 }
        ));
    }

    #[test]
    fn test_least_squares_rejects_rank_deficient() {
        // Second column is twice the first.
        let a = arr2(&[[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]]);
        let b = arr2(&[[1.0], [2.0], [3.0]]);
        let err = least_squares(&a, &b.view(), 1e-10).unwrap_err();
        assert!(matches!(err, ExtractionError::SingularDesignMatrix { .. }));
    }

    #[test]
    fn test_least_squares_multiple_right_hand_sides() {
        let a = arr2(&[[2.0, 0.0], [0.0, 4.0], [1.0, 1.0]]);
        let b = arr2(&[[2.0, 4.0], [4.0, -8.0], [2.0, 0.0]]);
        let result = least_squares(&a, &b.view(), 1e-12).unwrap();
        // Column 0: x = (1, 1); column 1: x = (2, -2); both exact.
        assert!((result.solution[[0, 0]] - 1.0).abs() < 1e-10);
        assert!((result.solution[[1, 0]] - 1.0).abs() < 1e-10);
        assert!((result.solution[[0, 1]] - 2.0).abs() < 1e-10);
        assert!((result.solution[[1, 1]] + 2.0).abs() < 1e-10);
        assert!(result.residual < 1e-10);
    }

    #[test]
    fn test_design_matrix_applies_sign_and_relu() {
        let neuron = NeuronRecord {
            weight: arr1(&[1.0, 0.0]),
            bias: -0.5,
            sign: 1.0,
            finalized: false,
            anchor: arr1(&[0.5, 0.0]),
            num_points: 2,
            bias_spread: 0.0,
            residual_kept: None,
            residual_flipped: None,
        };
        let xs = arr2(&[[1.0, 0.0], [0.0, 0.0]]);

        let a = design_matrix(&xs.view(), std::slice::from_ref(&neuron), &[1.0]);
        // z = x_0 - 0.5: relu(0.5) = 0.5 and relu(-0.5) = 0.
        assert!((a[[0, 0]] - 0.5).abs() < 1e-12);
        assert_eq!(a[[1, 0]], 0.0);
        // Constant column.
        assert_eq!(a[[0, 1]], 1.0);
        assert_eq!(a[[1, 1]], 1.0);

        let a = design_matrix(&xs.view(), std::slice::from_ref(&neuron), &[-1.0]);
        // Flipped: relu(-z).
        assert_eq!(a[[0, 0]], 0.0);
        assert!((a[[1, 0]] - 0.5).abs() < 1e-12);
    }
}
