//! Hamiltonian Monte Carlo step primitive.

use rand::rngs::StdRng;

use super::ProposalStats;
use super::gradient::{GradientEstimator, ParameterAdapter};
use super::mh::{StepOutcome, TargetDensity};
use super::random::{sample_standard_normal, should_accept};

/// One HMC block over an adapter-selected parameter subset.
///
/// Candidates whose coordinates land outside the configured bounds are
/// rejected outright rather than clipped or reflected.
#[derive(Debug, Clone)]
pub struct HmcStep {
    step_sizes: Vec<f64>,
    leapfrog_steps: usize,
    lower_bounds: Option<Vec<f64>>,
    upper_bounds: Option<Vec<f64>>,
    pub stats: ProposalStats,
    pub last: StepOutcome,
}

impl HmcStep {
    #[must_use]
    pub fn new(step_sizes: Vec<f64>, leapfrog_steps: usize) -> Self {
        Self {
            step_sizes,
            leapfrog_steps: leapfrog_steps.max(1),
            lower_bounds: None,
            upper_bounds: None,
            stats: ProposalStats::default(),
            last: StepOutcome::default(),
        }
    }

    #[must_use]
    pub fn with_lower_bounds(mut self, bounds: Vec<f64>) -> Self {
        self.lower_bounds = Some(bounds);
        self
    }

    #[must_use]
    pub fn with_upper_bounds(mut self, bounds: Vec<f64>) -> Self {
        self.upper_bounds = Some(bounds);
        self
    }

    #[must_use]
    pub fn step_sizes(&self) -> &[f64] {
        &self.step_sizes
    }

    /// Replace every step size, used by the adaptive tuner.
    pub fn reset_step_sizes(&mut self, step_sizes: Vec<f64>) {
        self.step_sizes = step_sizes;
    }

    /// Scale every step size by `factor`, flooring at `floor`.
    pub fn scale_step_sizes(&mut self, factor: f64, floor: f64) {
        for step in &mut self.step_sizes {
            *step = (*step * factor).max(floor);
        }
    }

    fn within_bounds(&self, position: &[f64]) -> bool {
        if let Some(lower) = &self.lower_bounds
            && position.iter().zip(lower.iter()).any(|(x, lo)| x < lo)
        {
            return false;
        }
        if let Some(upper) = &self.upper_bounds
            && position.iter().zip(upper.iter()).any(|(x, hi)| x > hi)
        {
            return false;
        }
        true
    }

    /// One leapfrog trajectory plus the Metropolis correction.
    ///
    /// `log_posterior` carries the target value at `model` and is updated
    /// on acceptance.
    pub fn step<M, T, A, G>(
        &mut self,
        target: &T,
        adapter: &A,
        gradient: &G,
        model: &mut M,
        log_posterior: &mut f64,
        rng: &mut StdRng,
    ) -> bool
    where
        M: Clone,
        T: TargetDensity<M>,
        A: ParameterAdapter<M>,
        G: GradientEstimator<M>,
    {
        let size = adapter.size(model);
        debug_assert_eq!(self.step_sizes.len(), size);

        let mut position: Vec<f64> = (0..size).map(|index| adapter.get(model, index)).collect();
        let mut momentum: Vec<f64> = (0..size).map(|_| sample_standard_normal(rng)).collect();
        let initial_kinetic = kinetic_energy(&momentum);

        let mut candidate = model.clone();
        let mut grad = gradient.gradient(&candidate);
        let mut diverged = false;

        for _ in 0..self.leapfrog_steps {
            for index in 0..size {
                momentum[index] += 0.5 * self.step_sizes[index] * grad[index];
            }
            for index in 0..size {
                position[index] += self.step_sizes[index] * momentum[index];
                adapter.set(&mut candidate, index, position[index]);
            }
            adapter.prepare(&mut candidate);
            if position.iter().any(|value| !value.is_finite()) {
                diverged = true;
                break;
            }
            grad = gradient.gradient(&candidate);
            for index in 0..size {
                momentum[index] += 0.5 * self.step_sizes[index] * grad[index];
            }
        }

        let out_of_bounds = !self.within_bounds(&position);
        let candidate_density = if diverged || out_of_bounds {
            f64::NEG_INFINITY
        } else {
            target.log_density(&candidate)
        };
        let log_acceptance =
            candidate_density - kinetic_energy(&momentum) - (*log_posterior - initial_kinetic);

        let accepted =
            !diverged && !out_of_bounds && candidate_density.is_finite()
                && should_accept(log_acceptance, rng);
        if accepted {
            *model = candidate;
            *log_posterior = candidate_density;
        }
        self.last = StepOutcome {
            accepted,
            log_acceptance,
        };
        self.stats.record(accepted);
        accepted
    }
}

fn kinetic_energy(momentum: &[f64]) -> f64 {
    0.5 * momentum.iter().map(|p| p * p).sum::<f64>()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use crate::inference::gradient::FiniteDifferenceGradient;

    use super::*;

    struct VecAdapter;

    impl ParameterAdapter<Vec<f64>> for VecAdapter {
        fn size(&self, model: &Vec<f64>) -> usize {
            model.len()
        }
        fn get(&self, model: &Vec<f64>, index: usize) -> f64 {
            model[index]
        }
        fn set(&self, model: &mut Vec<f64>, index: usize, value: f64) {
            model[index] = value;
        }
    }

    fn gaussian(model: &Vec<f64>) -> f64 {
        -0.5 * model.iter().map(|x| x * x).sum::<f64>()
    }

    #[test]
    fn hmc_explores_a_gaussian_target() {
        let mut rng = StdRng::seed_from_u64(17);
        let adapter = VecAdapter;
        let estimator = FiniteDifferenceGradient::new(&gaussian, &adapter, vec![1.0e-5; 2]);
        let mut step = HmcStep::new(vec![0.2; 2], 8);
        let mut model = vec![3.0, -3.0];
        let mut lp = gaussian(&model);
        let mut accepted = 0;
        for _ in 0..50 {
            if step.step(&gaussian, &adapter, &estimator, &mut model, &mut lp, &mut rng) {
                accepted += 1;
            }
        }
        assert!(accepted > 10);
        assert!(model.iter().all(|x| x.abs() < 3.0));
    }

    #[test]
    fn out_of_bounds_candidates_are_rejected() {
        let mut rng = StdRng::seed_from_u64(2);
        let adapter = VecAdapter;
        let estimator = FiniteDifferenceGradient::new(&gaussian, &adapter, vec![1.0e-5; 1]);
        // Current position already hugs the bound; any move below 1.0 must
        // be rejected and leave the model untouched.
        let mut step = HmcStep::new(vec![5.0], 4).with_lower_bounds(vec![1.0]);
        let mut model = vec![1.0];
        let mut lp = gaussian(&model);
        for _ in 0..10 {
            step.step(&gaussian, &adapter, &estimator, &mut model, &mut lp, &mut rng);
        }
        assert!(model[0] >= 1.0);
    }
}
