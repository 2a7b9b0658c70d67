//! Metropolis-Hastings step primitive.

use rand::rngs::StdRng;

use super::ProposalStats;
use super::random::should_accept;

/// A log target density over models of type `M`.
pub trait TargetDensity<M> {
    fn log_density(&self, model: &M) -> f64;
}

impl<M, F> TargetDensity<M> for F
where
    F: Fn(&M) -> f64,
{
    fn log_density(&self, model: &M) -> f64 {
        self(model)
    }
}

/// Draws a candidate model plus the log proposal-density ratio
/// (zero for symmetric proposals).
pub trait Proposer<M> {
    fn propose(&mut self, current: &M, rng: &mut StdRng) -> (M, f64);
}

/// Result of the most recent step invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOutcome {
    pub accepted: bool,
    /// Log acceptance probability of the last proposal (may be NaN when the
    /// target degenerates; the adaptive tuner reacts to that).
    pub log_acceptance: f64,
}

/// One Metropolis-Hastings block with acceptance bookkeeping.
///
/// The current log-posterior value is threaded through `step` so targets
/// are only re-evaluated on candidates.
#[derive(Debug, Clone, Default)]
pub struct MhStep {
    pub stats: ProposalStats,
    pub last: StepOutcome,
}

impl MhStep {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose, evaluate, and accept or reject in place.
    ///
    /// On acceptance `model` and `log_posterior` are replaced by the
    /// candidate and its density; otherwise both are left untouched.
    pub fn step<M, T, P>(
        &mut self,
        target: &T,
        proposer: &mut P,
        model: &mut M,
        log_posterior: &mut f64,
        rng: &mut StdRng,
    ) -> bool
    where
        T: TargetDensity<M>,
        P: Proposer<M>,
    {
        let (candidate, log_ratio) = proposer.propose(model, rng);
        let candidate_density = target.log_density(&candidate);
        let log_acceptance = candidate_density - *log_posterior + log_ratio;
        let accepted = candidate_density.is_finite() && should_accept(log_acceptance, rng);
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

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    struct Shift(f64);

    impl Proposer<f64> for Shift {
        fn propose(&mut self, current: &f64, _rng: &mut StdRng) -> (f64, f64) {
            (current + self.0, 0.0)
        }
    }

    #[test]
    fn uphill_moves_are_always_accepted() {
        let target = |x: &f64| -(x - 5.0) * (x - 5.0);
        let mut rng = StdRng::seed_from_u64(0);
        let mut step = MhStep::new();
        let mut model = 0.0;
        let mut lp = target(&model);
        let mut proposer = Shift(1.0);
        for _ in 0..5 {
            step.step(&target, &mut proposer, &mut model, &mut lp, &mut rng);
        }
        assert!((model - 5.0).abs() < 1.0e-12);
        assert_eq!(step.stats.accepted, 5);
    }

    #[test]
    fn non_finite_candidates_are_rejected() {
        let target = |x: &f64| if *x > 0.0 { f64::NEG_INFINITY } else { 0.0 };
        let mut rng = StdRng::seed_from_u64(0);
        let mut step = MhStep::new();
        let mut model = -1.0;
        let mut lp = target(&model);
        let mut proposer = Shift(2.0);
        let accepted = step.step(&target, &mut proposer, &mut model, &mut lp, &mut rng);
        assert!(!accepted);
        assert!((model + 1.0).abs() < 1.0e-12);
    }
}
