//! Heuristic step-size adaptation for HMC blocks.
//!
//! Two mechanisms run independently: a reactive check after every
//! invocation (degenerate acceptance probabilities), and a periodic check
//! over a window of invocations (acceptance-rate targeting). Both use
//! random multipliers, so a tuned step keeps moving instead of pinning to
//! a boundary value.

use rand::Rng;
use rand::rngs::StdRng;

use super::hmc::HmcStep;
use crate::utils::usize_to_f64;

/// Tuning thresholds and factors for `adapt_hmc_step_sizes`.
#[derive(Debug, Clone, Copy)]
pub struct StepSizeTuning {
    /// Invocations between periodic acceptance-rate checks.
    pub check_interval: usize,
    /// Acceptance rate above which step sizes grow.
    pub high_rate: f64,
    /// Acceptance rate below which step sizes shrink.
    pub low_rate: f64,
    /// Periodic growth factor is drawn from `[1, 1 + grow_span)`.
    pub grow_span: f64,
    /// Shrink divisor is drawn from `[1, 1 + shrink_span)`.
    pub shrink_span: f64,
    /// Step sizes never shrink below this floor.
    pub floor: f64,
    /// Log acceptance probability below which a rejection is treated as
    /// numerically degenerate.
    pub degenerate_log_prob: f64,
    /// Accepted steps with |log probability| below this trigger growth.
    pub tiny_log_prob: f64,
    /// Reactive growth factor is drawn from `[1, reactive_grow_span)`.
    pub reactive_grow_span: f64,
}

impl Default for StepSizeTuning {
    fn default() -> Self {
        Self {
            check_interval: 20,
            high_rate: 0.9,
            low_rate: 0.1,
            grow_span: 5.0,
            shrink_span: 9.0,
            floor: 1.0e-15,
            degenerate_log_prob: -500.0,
            tiny_log_prob: 1.0e-5,
            reactive_grow_span: 1.0e4,
        }
    }
}

/// Rolling acceptance window for one HMC block.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptState {
    pub invocations: usize,
    pub accepted_in_window: usize,
}

/// Apply reactive and periodic step-size adjustments after one invocation.
///
/// Call immediately after `HmcStep::step`; reads the step's last outcome.
pub fn adapt_hmc_step_sizes(
    step: &mut HmcStep,
    state: &mut AdaptState,
    tuning: StepSizeTuning,
    rng: &mut StdRng,
) {
    let outcome = step.last;
    if outcome.accepted {
        state.accepted_in_window += 1;
        if outcome.log_acceptance.abs() < tuning.tiny_log_prob {
            // Acceptance is near-certain; the trajectory is too timid.
            let factor = 1.0 + rng.random::<f64>() * (tuning.reactive_grow_span - 1.0);
            log::debug!("step size too low, growing by {factor:.3}");
            step.scale_step_sizes(factor, tuning.floor);
        }
    } else if outcome.log_acceptance < tuning.degenerate_log_prob
        || outcome.log_acceptance.is_nan()
    {
        if step.step_sizes().first().copied().unwrap_or(0.0) > tuning.floor {
            let divisor = 1.0 + rng.random::<f64>() * tuning.shrink_span;
            log::debug!("degenerate acceptance probability, shrinking by {divisor:.3}");
            step.scale_step_sizes(1.0 / divisor, tuning.floor);
        }
    }

    state.invocations += 1;
    if state.invocations.is_multiple_of(tuning.check_interval.max(1)) {
        let window = usize_to_f64(tuning.check_interval.max(1));
        let rate = usize_to_f64(state.accepted_in_window) / window;
        state.accepted_in_window = 0;
        if rate > tuning.high_rate {
            let factor = 1.0 + rng.random::<f64>() * tuning.grow_span;
            log::debug!("acceptance rate {rate:.2} too high, growing by {factor:.3}");
            step.scale_step_sizes(factor, tuning.floor);
        } else if rate < tuning.low_rate {
            let divisor = 1.0 + rng.random::<f64>() * tuning.shrink_span;
            log::debug!("acceptance rate {rate:.2} too low, shrinking by {divisor:.3}");
            step.scale_step_sizes(1.0 / divisor, tuning.floor);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use crate::inference::mh::StepOutcome;

    use super::*;

    fn step_with_size(size: f64) -> HmcStep {
        HmcStep::new(vec![size; 3], 2)
    }

    fn feed(step: &mut HmcStep, state: &mut AdaptState, tuning: StepSizeTuning, accepted: bool) {
        step.last = StepOutcome {
            accepted,
            log_acceptance: if accepted { -0.5 } else { -2.0 },
        };
        let mut rng = StdRng::seed_from_u64(u64::try_from(state.invocations).unwrap_or(0));
        adapt_hmc_step_sizes(step, state, tuning, &mut rng);
    }

    #[test]
    fn high_acceptance_rate_grows_step_sizes() {
        let tuning = StepSizeTuning::default();
        let mut step = step_with_size(0.1);
        let mut state = AdaptState::default();
        for _ in 0..tuning.check_interval {
            feed(&mut step, &mut state, tuning, true);
        }
        assert!(step.step_sizes()[0] > 0.1);
    }

    #[test]
    fn low_acceptance_rate_shrinks_step_sizes() {
        let tuning = StepSizeTuning::default();
        let mut step = step_with_size(0.1);
        let mut state = AdaptState::default();
        for _ in 0..tuning.check_interval {
            feed(&mut step, &mut state, tuning, false);
        }
        assert!(step.step_sizes()[0] < 0.1);
    }

    #[test]
    fn moderate_rate_leaves_step_sizes_alone() {
        let tuning = StepSizeTuning::default();
        let mut step = step_with_size(0.1);
        let mut state = AdaptState::default();
        for index in 0..tuning.check_interval {
            feed(&mut step, &mut state, tuning, index.is_multiple_of(2));
        }
        assert!((step.step_sizes()[0] - 0.1).abs() < 1.0e-12);
    }

    #[test]
    fn nan_acceptance_probability_shrinks_immediately() {
        let tuning = StepSizeTuning::default();
        let mut step = step_with_size(0.1);
        let mut state = AdaptState::default();
        step.last = StepOutcome {
            accepted: false,
            log_acceptance: f64::NAN,
        };
        let mut rng = StdRng::seed_from_u64(0);
        adapt_hmc_step_sizes(&mut step, &mut state, tuning, &mut rng);
        assert!(step.step_sizes()[0] < 0.1);
    }

    #[test]
    fn tiny_acceptance_probability_grows_immediately() {
        let tuning = StepSizeTuning::default();
        let mut step = step_with_size(0.1);
        let mut state = AdaptState::default();
        step.last = StepOutcome {
            accepted: true,
            log_acceptance: 1.0e-9,
        };
        let mut rng = StdRng::seed_from_u64(0);
        adapt_hmc_step_sizes(&mut step, &mut state, tuning, &mut rng);
        assert!(step.step_sizes()[0] > 0.1);
    }

    #[test]
    fn shrinking_respects_floor() {
        let tuning = StepSizeTuning::default();
        let mut step = step_with_size(2.0e-15);
        let mut state = AdaptState::default();
        for _ in 0..tuning.check_interval {
            feed(&mut step, &mut state, tuning, false);
        }
        assert!(step.step_sizes()[0] >= tuning.floor);
    }
}
