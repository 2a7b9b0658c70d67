//! Reusable MCMC machinery: step primitives, gradient estimation, and
//! step-size adaptation shared by every sampling block.

use thiserror::Error;

pub mod adapt;
pub mod gradient;
pub mod hmc;
pub mod mh;
pub mod random;

pub use adapt::{AdaptState, StepSizeTuning, adapt_hmc_step_sizes};
pub use gradient::{FiniteDifferenceGradient, GradientEstimator, ParameterAdapter};
pub use hmc::HmcStep;
pub use mh::{MhStep, Proposer, StepOutcome, TargetDensity};

use crate::utils::usize_to_f64;

/// Errors for generic MCMC configuration.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InferenceError {
    #[error("iterations must be positive")]
    InvalidIterations,
    #[error("leapfrog step count must be positive")]
    InvalidLeapfrogSteps,
    #[error("thread count must be positive")]
    InvalidThreadCount,
    #[error("step sizes must be positive and finite")]
    InvalidStepSize,
}

/// Proposal counters for a single sampling block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalStats {
    pub proposed: usize,
    pub accepted: usize,
}

impl ProposalStats {
    /// Record one proposal and whether it was accepted.
    pub const fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Acceptance rate in `[0, 1]`, or `0` if no proposals were made.
    #[must_use]
    pub fn acceptance_rate(self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            usize_to_f64(self.accepted) / usize_to_f64(self.proposed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_stats_tracks_acceptance() {
        let mut stats = ProposalStats::default();
        stats.record(true);
        stats.record(false);
        assert!((stats.acceptance_rate() - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn empty_stats_report_zero_rate() {
        assert!((ProposalStats::default().acceptance_rate()).abs() < 1.0e-12);
    }
}
