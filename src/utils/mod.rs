//! # Utilities
//!
//! Shared linear-algebra helpers for the oscillator models: linear solves,
//! Cholesky factorization, and the matrix exponential used to propagate
//! latent states across time intervals.

use faer::Mat;
use faer::prelude::Solve;
use num_traits::ToPrimitive;

const EXPM_PADE_ORDER: usize = 6;

#[must_use]
pub fn identity_matrix(dim: usize) -> Mat<f64> {
    Mat::from_fn(dim, dim, |row, col| if row == col { 1.0 } else { 0.0 })
}

#[must_use]
pub fn mat_mul(a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    debug_assert_eq!(a.ncols(), b.nrows());
    let mut out = Mat::<f64>::zeros(a.nrows(), b.ncols());
    for i in 0..a.nrows() {
        for k in 0..a.ncols() {
            let left = a[(i, k)];
            if left == 0.0 {
                continue;
            }
            for j in 0..b.ncols() {
                out[(i, j)] += left * b[(k, j)];
            }
        }
    }
    out
}

#[must_use]
pub fn mat_vec_mul(a: &Mat<f64>, x: &[f64]) -> Vec<f64> {
    debug_assert_eq!(a.ncols(), x.len());
    let mut out = vec![0.0; a.nrows()];
    for i in 0..a.nrows() {
        let mut sum = 0.0;
        for j in 0..a.ncols() {
            sum += a[(i, j)] * x[j];
        }
        out[i] = sum;
    }
    out
}

#[must_use]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[must_use]
pub fn max_abs_element(matrix: &Mat<f64>) -> f64 {
    let mut max = 0.0_f64;
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            max = max.max(matrix[(i, j)].abs());
        }
    }
    max
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

/// Solve `a x = b` with a full-pivot LU decomposition.
///
/// Returns `None` if the solution contains non-finite values.
#[must_use]
pub fn solve_linear_system(a: &Mat<f64>, b: &Mat<f64>) -> Option<Mat<f64>> {
    let rhs = b.clone();
    let lu = a.full_piv_lu();
    let solution = lu.solve(rhs);
    if matrix_is_finite(&solution) {
        Some(solution)
    } else {
        None
    }
}

/// Lower Cholesky factor of a symmetric positive-definite matrix.
#[must_use]
pub fn cholesky_lower(matrix: &Mat<f64>) -> Option<Mat<f64>> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return None;
    }
    let mut lower = Mat::<f64>::zeros(n, n);
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[(i, j)];
            for k in 0..j {
                sum -= lower[(i, k)] * lower[(j, k)];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                lower[(i, i)] = sum.sqrt();
            } else {
                lower[(i, j)] = sum / lower[(j, j)];
            }
        }
    }
    Some(lower)
}

/// Log-determinant of a matrix given its lower Cholesky factor.
#[must_use]
pub fn log_det_from_cholesky(lower: &Mat<f64>) -> f64 {
    let mut log_det = 0.0;
    for i in 0..lower.nrows() {
        log_det += lower[(i, i)].ln();
    }
    2.0 * log_det
}

/// Solve `L y = b` by forward substitution for a lower-triangular `L`.
#[must_use]
pub fn forward_substitute(lower: &Mat<f64>, b: &[f64]) -> Vec<f64> {
    let n = lower.nrows();
    debug_assert_eq!(b.len(), n);
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= lower[(i, j)] * y[j];
        }
        y[i] = sum / lower[(i, i)];
    }
    y
}

/// Matrix exponential via scaling-and-squaring with a diagonal Pade
/// approximant. The companion matrices this crate exponentiates are small
/// (`2n x 2n` for `n` oscillators), so the dense algorithm is adequate.
#[must_use]
pub fn matrix_exponential(matrix: &Mat<f64>) -> Mat<f64> {
    let n = matrix.nrows();
    debug_assert_eq!(matrix.ncols(), n);

    let norm = max_abs_element(matrix);
    let squarings = if norm > 0.5 {
        let doublings = (norm / 0.5).log2().ceil().max(0.0);
        doublings.to_u32().unwrap_or(0)
    } else {
        0
    };
    let scale = 0.5_f64.powi(i32::try_from(squarings).unwrap_or(i32::MAX));
    let scaled = Mat::from_fn(n, n, |i, j| matrix[(i, j)] * scale);

    // Pade(6, 6) numerator/denominator built from powers of the scaled matrix.
    let mut coefficient = 1.0;
    let mut numerator = identity_matrix(n);
    let mut denominator = identity_matrix(n);
    let mut power = identity_matrix(n);
    for k in 1..=EXPM_PADE_ORDER {
        let k_f = usize_to_f64(k);
        let order = usize_to_f64(EXPM_PADE_ORDER);
        coefficient *= (order - k_f + 1.0) / (k_f * (2.0 * order - k_f + 1.0));
        power = mat_mul(&power, &scaled);
        for i in 0..n {
            for j in 0..n {
                let term = coefficient * power[(i, j)];
                numerator[(i, j)] += term;
                let sign = if k.is_multiple_of(2) { 1.0 } else { -1.0 };
                denominator[(i, j)] += sign * term;
            }
        }
    }

    let mut result =
        solve_linear_system(&denominator, &numerator).unwrap_or_else(|| identity_matrix(n));
    for _ in 0..squarings {
        result = mat_mul(&result, &result);
    }
    result
}

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn exponential_of_zero_matrix_is_identity() {
        let zero = Mat::<f64>::zeros(3, 3);
        let result = matrix_exponential(&zero);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(result[(i, j)], expected, epsilon = 1.0e-12);
            }
        }
    }

    #[test]
    fn exponential_matches_scalar_case() {
        let mut matrix = Mat::<f64>::zeros(1, 1);
        matrix[(0, 0)] = 1.7;
        let result = matrix_exponential(&matrix);
        assert_relative_eq!(result[(0, 0)], 1.7_f64.exp(), epsilon = 1.0e-10);
    }

    #[test]
    fn exponential_of_rotation_generator() {
        // exp([[0, -t], [t, 0]]) is a rotation by t.
        let t = 0.73_f64;
        let mut matrix = Mat::<f64>::zeros(2, 2);
        matrix[(0, 1)] = -t;
        matrix[(1, 0)] = t;
        let result = matrix_exponential(&matrix);
        assert_relative_eq!(result[(0, 0)], t.cos(), epsilon = 1.0e-10);
        assert_relative_eq!(result[(1, 0)], t.sin(), epsilon = 1.0e-10);
    }

    #[test]
    fn cholesky_recovers_simple_factor() {
        let mut matrix = Mat::<f64>::zeros(2, 2);
        matrix[(0, 0)] = 4.0;
        matrix[(0, 1)] = 2.0;
        matrix[(1, 0)] = 2.0;
        matrix[(1, 1)] = 3.0;
        let lower = cholesky_lower(&matrix).expect("matrix is positive definite");
        assert_relative_eq!(lower[(0, 0)], 2.0);
        assert_relative_eq!(lower[(1, 0)], 1.0);
        assert_relative_eq!(lower[(1, 1)], 2.0_f64.sqrt());
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let mut matrix = Mat::<f64>::zeros(2, 2);
        matrix[(0, 0)] = 1.0;
        matrix[(1, 1)] = -1.0;
        assert!(cholesky_lower(&matrix).is_none());
    }

    #[test]
    fn solve_recovers_known_solution() {
        let mut a = Mat::<f64>::zeros(2, 2);
        a[(0, 0)] = 3.0;
        a[(1, 1)] = 0.5;
        let b = Mat::from_fn(2, 1, |i, _| if i == 0 { 6.0 } else { 1.0 });
        let x = solve_linear_system(&a, &b).expect("system is solvable");
        assert_relative_eq!(x[(0, 0)], 2.0);
        assert_relative_eq!(x[(1, 0)], 2.0);
    }
}
