//! Coupled linear oscillator dynamics.
//!
//! A dyad of `n` members evolves as `n` damped oscillators with pairwise
//! coupling in both the stiffness and damping terms:
//!
//! ```text
//!   x'' = -K x - D x'
//! ```
//!
//! The parameter vector has length `n (2 + n)` and is laid out as
//! `[f_1..f_n, c_1..c_m, d_1..d_n, cd_1..cd_m]` with `m = n (n - 1)`:
//! squared natural frequencies, stiffness couplings, dampings, and damping
//! couplings. The latent state stacks positions then velocities, and the
//! companion matrix `A = [[0, I], [-K, -D]]` propagates it as
//! `x(t + dt) = exp(A dt) x(t)`.

use faer::Mat;

use crate::utils::{mat_vec_mul, matrix_exponential, usize_to_f64};

pub const DEFAULT_PERIOD: f64 = 5.0;
pub const DEFAULT_DAMPING: f64 = 0.0;

/// Number of dynamics parameters for `n` coupled oscillators:
/// `n` frequencies, `n (n - 1)` stiffness couplings, `n` dampings, and
/// `n (n - 1)` damping couplings.
#[must_use]
pub const fn param_length(num_oscillators: usize) -> usize {
    2 * num_oscillators * num_oscillators
}

/// Default parameter vector for the given period and damping: squared
/// frequency `(2 pi / period)^2` per oscillator, all couplings zero.
#[must_use]
pub fn default_params(num_oscillators: usize, period: f64, damping: f64) -> Vec<f64> {
    let mut params = vec![0.0; param_length(num_oscillators)];
    let frequency = std::f64::consts::TAU / period;
    for slot in params.iter_mut().take(num_oscillators) {
        *slot = frequency * frequency;
    }
    let couplings = num_oscillators * (num_oscillators - 1);
    for index in 0..num_oscillators {
        params[num_oscillators + couplings + index] = damping;
    }
    params
}

/// One interval's dynamics parameters plus the derived companion matrix.
#[derive(Debug, Clone)]
pub struct CoupledOscillator {
    params: Vec<f64>,
    num_oscillators: usize,
    system_matrix: Mat<f64>,
    matrix_stale: bool,
}

impl CoupledOscillator {
    /// # Panics
    ///
    /// Panics if `params.len()` is not `n (2 + n)` for some `n >= 1`.
    #[must_use]
    pub fn from_params(params: Vec<f64>) -> Self {
        let num_oscillators = oscillators_from_param_count(params.len());
        assert_eq!(
            params.len(),
            param_length(num_oscillators),
            "parameter vector length does not match any oscillator count"
        );
        let dim = 2 * num_oscillators;
        Self {
            params,
            num_oscillators,
            system_matrix: Mat::zeros(dim, dim),
            matrix_stale: true,
        }
    }

    #[must_use]
    pub fn new(num_oscillators: usize, period: f64, damping: f64) -> Self {
        Self::from_params(default_params(num_oscillators, period, damping))
    }

    #[must_use]
    pub const fn num_oscillators(&self) -> usize {
        self.num_oscillators
    }

    #[must_use]
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    #[must_use]
    pub fn param(&self, index: usize) -> f64 {
        self.params[index]
    }

    pub fn set_param(&mut self, index: usize, value: f64) {
        self.params[index] = value;
        self.matrix_stale = true;
    }

    /// Squared natural frequencies must stay positive for the dynamics to
    /// oscillate; proposals violating this are redrawn upstream.
    #[must_use]
    pub fn has_valid_params(&self) -> bool {
        self.params.iter().all(|value| value.is_finite())
            && self.params[..self.num_oscillators]
                .iter()
                .all(|frequency| *frequency > 0.0)
    }

    /// Companion matrix `[[0, I], [-K, -D]]`, rebuilt on demand.
    pub fn system_matrix(&mut self) -> &Mat<f64> {
        if self.matrix_stale {
            self.rebuild_system_matrix();
        }
        &self.system_matrix
    }

    fn rebuild_system_matrix(&mut self) {
        let n = self.num_oscillators;
        let dim = 2 * n;
        let mut matrix = Mat::<f64>::zeros(dim, dim);
        for i in 0..n {
            matrix[(i, n + i)] = 1.0;
        }

        let couplings_per_row = n - 1;
        let stiffness_base = n;
        let damping_base = n + n * couplings_per_row;
        let damping_coupling_base = damping_base + n;
        for row in 0..n {
            let frequency = self.params[row];
            let damping = self.params[damping_base + row];
            let mut stiffness_row_sum = frequency;
            let mut damping_row_sum = damping;
            let mut coupling_index = 0;
            for col in 0..n {
                if col == row {
                    continue;
                }
                let stiffness_coupling =
                    self.params[stiffness_base + row * couplings_per_row + coupling_index];
                let damping_coupling =
                    self.params[damping_coupling_base + row * couplings_per_row + coupling_index];
                matrix[(n + row, col)] = stiffness_coupling;
                matrix[(n + row, n + col)] = damping_coupling;
                stiffness_row_sum += stiffness_coupling;
                damping_row_sum += damping_coupling;
                coupling_index += 1;
            }
            matrix[(n + row, row)] = -stiffness_row_sum;
            matrix[(n + row, n + row)] = -damping_row_sum;
        }
        self.system_matrix = matrix;
        self.matrix_stale = false;
    }

    /// Member owning parameter `index` (frequencies, couplings, dampings,
    /// and damping couplings all attribute to the driven oscillator).
    #[must_use]
    pub fn param_member(&self, index: usize) -> usize {
        let n = self.num_oscillators;
        let couplings = n * (n - 1);
        if index < n {
            index
        } else if index < n + couplings {
            (index - n) / (n - 1).max(1)
        } else if index < n + couplings + n {
            index - n - couplings
        } else {
            (index - 2 * n - couplings) / (n - 1).max(1)
        }
    }
}

const fn oscillators_from_param_count(count: usize) -> usize {
    // 2 n^2 is strictly increasing in n; search the small range.
    let mut n = 1;
    while 2 * n * n < count {
        n += 1;
    }
    n
}

/// Propagate an initial state across the time grid, starting at
/// `start_index` (earlier states are taken as already valid).
///
/// With one oscillator the transition matrix is shared across intervals of
/// equal width; with drifting parameters each interval uses its own
/// oscillator.
pub fn integrate_states(
    oscillators: &mut [CoupledOscillator],
    times: &[f64],
    states: &mut Vec<Vec<f64>>,
    start_index: usize,
) {
    debug_assert!(!oscillators.is_empty());
    debug_assert!(!states.is_empty());
    states.truncate(start_index.max(1));

    let drifting = oscillators.len() > 1;
    let mut cached_dt = f64::NAN;
    let mut cached_transition: Option<Mat<f64>> = None;

    for interval in start_index.max(1)..times.len() {
        let dt = times[interval] - times[interval - 1];
        let oscillator_index = if drifting { interval - 1 } else { 0 };
        let oscillator = &mut oscillators[oscillator_index.min(oscillators.len() - 1)];
        let transition = if drifting {
            scaled_exponential(oscillator, dt)
        } else {
            if cached_transition.is_none() || (dt - cached_dt).abs() > f64::EPSILON {
                cached_transition = Some(scaled_exponential(oscillator, dt));
                cached_dt = dt;
            }
            cached_transition
                .clone()
                .unwrap_or_else(|| scaled_exponential(oscillator, dt))
        };
        let next = mat_vec_mul(&transition, &states[interval - 1]);
        states.push(next);
    }
}

fn scaled_exponential(oscillator: &mut CoupledOscillator, dt: f64) -> Mat<f64> {
    let a = oscillator.system_matrix();
    let scaled = Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[(i, j)] * dt);
    matrix_exponential(&scaled)
}

/// Mean parameter vector across a drifting trajectory (identity for a
/// single shared oscillator).
#[must_use]
pub fn mean_params(oscillators: &[CoupledOscillator]) -> Vec<f64> {
    if oscillators.is_empty() {
        return Vec::new();
    }
    let count = usize_to_f64(oscillators.len());
    let mut mean = vec![0.0; oscillators[0].num_params()];
    for oscillator in oscillators {
        for (slot, value) in mean.iter_mut().zip(oscillator.params()) {
            *slot += value;
        }
    }
    for slot in &mut mean {
        *slot /= count;
    }
    mean
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn param_length_counts_all_four_blocks() {
        assert_eq!(param_length(2), 8);
        assert_eq!(param_length(3), 18);
    }

    #[test]
    fn default_params_place_frequency_and_damping() {
        let params = default_params(2, 5.0, 0.3);
        let frequency = std::f64::consts::TAU / 5.0;
        assert_relative_eq!(params[0], frequency * frequency);
        assert_relative_eq!(params[1], frequency * frequency);
        assert_relative_eq!(params[2], 0.0);
        assert_relative_eq!(params[4], 0.3);
        assert_relative_eq!(params[5], 0.3);
    }

    #[test]
    fn system_matrix_has_companion_structure() {
        let mut clo = CoupledOscillator::from_params(vec![
            1.0, 4.0, // frequencies
            0.5, 0.25, // stiffness couplings
            0.1, 0.2, // dampings
            0.0, 0.0, // damping couplings
        ]);
        let a = clo.system_matrix();
        assert_relative_eq!(a[(0, 2)], 1.0);
        assert_relative_eq!(a[(1, 3)], 1.0);
        assert_relative_eq!(a[(2, 0)], -1.5);
        assert_relative_eq!(a[(2, 1)], 0.5);
        assert_relative_eq!(a[(3, 0)], 0.25);
        assert_relative_eq!(a[(3, 1)], -4.25);
        assert_relative_eq!(a[(2, 2)], -0.1);
        assert_relative_eq!(a[(3, 3)], -0.2);
    }

    #[test]
    fn undamped_oscillator_conserves_amplitude() {
        let mut oscillators = vec![CoupledOscillator::from_params(vec![
            1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ])];
        let times: Vec<f64> = (0..200).map(|t| f64::from(t) * 0.05).collect();
        let mut states = vec![vec![1.0, 0.0, 0.0, 0.0]];
        integrate_states(&mut oscillators, &times, &mut states, 0);
        assert_eq!(states.len(), times.len());
        // Energy of the first member: x^2 + v^2 stays near 1 for omega = 1.
        let last = states.last().expect("states are non-empty");
        let energy = last[0].mul_add(last[0], last[2] * last[2]);
        assert!((energy - 1.0).abs() < 1.0e-6);
    }

    #[test]
    fn integrate_preserves_prefix_before_start_index() {
        let mut oscillators = vec![CoupledOscillator::new(2, 5.0, 0.0)];
        let times: Vec<f64> = (0..10).map(|t| f64::from(t) * 0.1).collect();
        let mut states = vec![vec![0.5, -0.5, 0.0, 0.0]];
        integrate_states(&mut oscillators, &times, &mut states, 0);
        let frozen = states[4].clone();
        integrate_states(&mut oscillators, &times, &mut states, 5);
        assert_eq!(states[4], frozen);
        assert_eq!(states.len(), times.len());
    }

    #[test]
    fn invalid_frequency_is_rejected() {
        let clo = CoupledOscillator::from_params(vec![
            -1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ]);
        assert!(!clo.has_valid_params());
    }

    #[test]
    fn param_member_attributes_blocks() {
        let clo = CoupledOscillator::new(2, 5.0, 0.0);
        assert_eq!(clo.param_member(0), 0);
        assert_eq!(clo.param_member(1), 1);
        assert_eq!(clo.param_member(2), 0);
        assert_eq!(clo.param_member(3), 1);
        assert_eq!(clo.param_member(4), 0);
        assert_eq!(clo.param_member(5), 1);
        assert_eq!(clo.param_member(6), 0);
        assert_eq!(clo.param_member(7), 1);
    }
}
