//! Posterior evaluators: per-dyad composition of likelihood and priors,
//! and the population-level posterior with optional thread-parallel
//! summation.

use crate::inference::mh::TargetDensity;

use super::likelihood::{Likelihood, LikelihoodWindow};
use super::population::LssSet;
use super::priors::{GpScalePrior, InitStatePrior, NoisePrior, SharedPrior};
use super::state_space::LinearStateSpace;

/// Toggleable terms of a per-dyad posterior.
#[derive(Debug, Clone, Copy)]
pub struct PosteriorTerms {
    pub init_state: bool,
    pub dyad_prior: bool,
    pub group_prior: bool,
    pub drift_prior: bool,
    pub likelihood: bool,
}

impl Default for PosteriorTerms {
    fn default() -> Self {
        Self {
            init_state: true,
            dyad_prior: true,
            group_prior: false,
            drift_prior: false,
            likelihood: true,
        }
    }
}

/// Posterior of one dyad's state-space model.
///
/// `log_density` takes the likelihood window explicitly; there is no
/// internal window mode to toggle and restore.
#[derive(Debug, Clone)]
pub struct DyadPosterior<'a> {
    pub likelihood: Likelihood<'a>,
    pub init_prior: InitStatePrior,
    pub terms: PosteriorTerms,
}

impl<'a> DyadPosterior<'a> {
    #[must_use]
    pub const fn new(
        likelihood: Likelihood<'a>,
        init_prior: InitStatePrior,
        terms: PosteriorTerms,
    ) -> Self {
        Self {
            likelihood,
            init_prior,
            terms,
        }
    }

    #[must_use]
    pub fn log_density(&self, lss: &LinearStateSpace, window: LikelihoodWindow) -> f64 {
        debug_assert!(
            !(self.terms.dyad_prior && self.terms.group_prior),
            "independent and group priors are mutually exclusive"
        );
        if !lss.has_valid_params() {
            return f64::NEG_INFINITY;
        }

        let mut total = 0.0;
        if self.terms.drift_prior {
            total += lss.log_drift_prior();
        } else if (self.terms.dyad_prior || self.terms.group_prior) && !lss.ignore_clo() {
            total += lss.log_clo_param_prior();
        }
        if !total.is_finite() {
            return f64::NEG_INFINITY;
        }

        // Trend and outcome blocks keep their prior regardless of how the
        // CLO block is treated.
        total += lss.log_tail_param_prior();
        if self.terms.init_state && !lss.ignore_clo() {
            total += self.init_prior.log_density(lss);
        }
        if self.terms.likelihood {
            total += self.likelihood.log_density(lss, window);
        }
        if total.is_finite() {
            total
        } else {
            f64::NEG_INFINITY
        }
    }
}

impl TargetDensity<LinearStateSpace> for DyadPosterior<'_> {
    fn log_density(&self, model: &LinearStateSpace) -> f64 {
        self.log_density(model, LikelihoodWindow::Fitting)
    }
}

/// A dyad posterior pinned to one likelihood window, for step primitives.
#[derive(Debug, Clone, Copy)]
pub struct WindowedPosterior<'a, 'b> {
    pub posterior: &'b DyadPosterior<'a>,
    pub window: LikelihoodWindow,
}

impl TargetDensity<LinearStateSpace> for WindowedPosterior<'_, '_> {
    fn log_density(&self, model: &LinearStateSpace) -> f64 {
        self.posterior.log_density(model, self.window)
    }
}

/// Population posterior: shared hyper-prior + noise prior + the sum of
/// per-dyad posteriors, each term toggleable.
///
/// With `threads > 1` the per-dyad sum is computed over contiguous index
/// slices on scoped threads and assembled in index order, so the result
/// does not depend on the thread count.
pub struct PopulationPosterior<'a, 'b> {
    pub shared_prior: &'b SharedPrior,
    pub noise_prior: &'b NoisePrior,
    pub posteriors: &'b [DyadPosterior<'a>],
    pub threads: usize,
    pub use_hyper_prior: bool,
    pub use_noise_prior: bool,
}

impl PopulationPosterior<'_, '_> {
    #[must_use]
    pub fn log_density(&self, set: &LssSet) -> f64 {
        let mut total = 0.0;
        if self.use_hyper_prior {
            total += self.shared_prior.log_density(set);
            if !total.is_finite() {
                return f64::NEG_INFINITY;
            }
        }
        if self.use_noise_prior {
            total += self.noise_prior.log_density(set);
            if !total.is_finite() {
                return f64::NEG_INFINITY;
            }
        }
        total + self.individual_sum(set, LikelihoodWindow::Fitting)
    }

    /// Sum of per-dyad posteriors over the requested window.
    #[must_use]
    pub fn individual_sum(&self, set: &LssSet, window: LikelihoodWindow) -> f64 {
        individual_posteriors(self.posteriors, set.lss_vec(), window, self.threads)
            .iter()
            .sum()
    }
}

/// Per-dyad posterior values in index order.
///
/// With `threads > 1` the index range is partitioned into contiguous
/// slices computed on scoped threads; assembly order is fixed, so the
/// result is independent of the thread count.
#[must_use]
pub fn individual_posteriors(
    posteriors: &[DyadPosterior<'_>],
    lss_vec: &[LinearStateSpace],
    window: LikelihoodWindow,
    threads: usize,
) -> Vec<f64> {
    debug_assert_eq!(lss_vec.len(), posteriors.len());
    let threads = effective_threads(threads, lss_vec.len());
    if threads <= 1 {
        return lss_vec
            .iter()
            .zip(posteriors)
            .map(|(lss, posterior)| posterior.log_density(lss, window))
            .collect();
    }

    let chunk = lss_vec.len().div_ceil(threads);
    let mut parts: Vec<(usize, Vec<f64>)> = Vec::with_capacity(threads);
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(threads);
        for (slice_index, (lss_chunk, posterior_chunk)) in lss_vec
            .chunks(chunk)
            .zip(posteriors.chunks(chunk))
            .enumerate()
        {
            handles.push(scope.spawn(move || {
                let values: Vec<f64> = lss_chunk
                    .iter()
                    .zip(posterior_chunk)
                    .map(|(lss, posterior)| posterior.log_density(lss, window))
                    .collect();
                (slice_index * chunk, values)
            }));
        }
        for handle in handles {
            if let Ok(part) = handle.join() {
                parts.push(part);
            }
        }
    });

    let mut values = vec![f64::NEG_INFINITY; lss_vec.len()];
    for (start, part) in parts {
        values[start..start + part.len()].copy_from_slice(&part);
    }
    values
}

impl TargetDensity<LssSet> for PopulationPosterior<'_, '_> {
    fn log_density(&self, model: &LssSet) -> f64 {
        self.log_density(model)
    }
}

/// Posterior of the shared regression hyper-parameters:
/// `p(coefs, vars) * p(theta | coefs, vars)`.
pub struct HyperPosterior<'b> {
    pub shared_prior: &'b SharedPrior,
}

impl TargetDensity<LssSet> for HyperPosterior<'_> {
    fn log_density(&self, set: &LssSet) -> f64 {
        let mut total = self.shared_prior.blr.log_density(set);
        if !total.is_finite() {
            return f64::NEG_INFINITY;
        }
        for lss in set.lss_vec() {
            total += if lss.allow_drift() {
                lss.log_drift_prior()
            } else {
                lss.log_clo_param_prior()
            };
            total += lss.log_tail_param_prior();
            if !total.is_finite() {
                return f64::NEG_INFINITY;
            }
        }
        total
    }
}

/// Posterior of the GP drift scales: `p(s) * p(theta | s)`.
pub struct GpScalePosterior<'b> {
    pub scale_prior: &'b GpScalePrior,
}

impl TargetDensity<LssSet> for GpScalePosterior<'_> {
    fn log_density(&self, set: &LssSet) -> f64 {
        let mut total = self.scale_prior.log_density(set);
        for lss in set.lss_vec() {
            total += lss.log_drift_prior();
            if !total.is_finite() {
                return f64::NEG_INFINITY;
            }
        }
        total
    }
}

/// Held-out predictive posterior of the population, used by the
/// stochastic noise-sigma step.
pub struct PredictivePosterior<'a, 'b> {
    pub posteriors: &'b [DyadPosterior<'a>],
    pub threads: usize,
}

impl TargetDensity<LssSet> for PredictivePosterior<'_, '_> {
    fn log_density(&self, set: &LssSet) -> f64 {
        individual_posteriors(
            self.posteriors,
            set.lss_vec(),
            LikelihoodWindow::Predictive,
            self.threads,
        )
        .iter()
        .sum()
    }
}

/// Bound worker-pool width: configured threads, available cores, jobs.
#[must_use]
pub fn effective_threads(configured: usize, jobs: usize) -> usize {
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
    configured.max(1).min(cores).min(jobs.max(1))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::input::dyad::DyadData;
    use crate::models::clo::oscillator::CoupledOscillator;
    use crate::models::clo::priors::{BlrHyperPrior, ClusterPrior, VariancePrior};
    use crate::models::clo::types::VariancePriorKind;

    use super::*;

    fn fixtures() -> (Vec<DyadData>, Vec<LinearStateSpace>) {
        let times: Vec<f64> = (0..8).map(|t| f64::from(t) * 0.4).collect();
        let mut data = Vec::new();
        let mut models = Vec::new();
        for dyad in 0..3_u64 {
            data.push(DyadData::new(dyad, times.clone()).with_observable(
                "dial",
                vec![vec![0.2; 8], vec![-0.2; 8]],
            ));
            let mut lss = LinearStateSpace::new(
                times.clone(),
                vec![0.2, -0.2, 0.0, 0.0],
                vec![CoupledOscillator::new(2, 5.0, 0.0)],
                vec!["dial".to_owned()],
                vec![0.5],
                None,
                false,
                0,
            );
            lss.set_predictors(vec![vec![1.0]; 8]);
            lss.refresh();
            models.push(lss);
        }
        (data, models)
    }

    fn shared_prior() -> SharedPrior {
        SharedPrior {
            blr: BlrHyperPrior {
                shapes: vec![1.0; 8],
                scales: vec![1.0; 8],
                coef_prior_sigma: 10.0,
                variance_prior: VariancePrior::new(VariancePriorKind::InverseGamma, false),
            },
            gp_scale: GpScalePrior {
                shapes: Vec::new(),
                scales: Vec::new(),
            },
            cluster: ClusterPrior::new(1.0, 1),
            learn_clo: true,
            learn_scale: false,
            learn_cluster: false,
        }
    }

    #[test]
    fn single_and_multi_threaded_sums_agree() {
        let (data, models) = fixtures();
        let posteriors: Vec<DyadPosterior> = data
            .iter()
            .map(|dyad| {
                DyadPosterior::new(
                    Likelihood::new(dyad, 8, 4),
                    InitStatePrior::new(0.0, 1.0).expect("positive sigma"),
                    PosteriorTerms::default(),
                )
            })
            .collect();
        let set = LssSet::new(
            vec![0, 1, 2],
            models,
            vec![crate::models::clo::population::GroupParams::new(8, 1, 1.0, 1.0)],
            vec![0.5],
            Vec::new(),
            Vec::new(),
        );
        let prior = shared_prior();
        let noise = NoisePrior {
            shapes: vec![1.0],
            scales: vec![1.0],
        };
        let sequential = PopulationPosterior {
            shared_prior: &prior,
            noise_prior: &noise,
            posteriors: &posteriors,
            threads: 1,
            use_hyper_prior: true,
            use_noise_prior: true,
        };
        let parallel = PopulationPosterior {
            shared_prior: &prior,
            noise_prior: &noise,
            posteriors: &posteriors,
            threads: 3,
            use_hyper_prior: true,
            use_noise_prior: true,
        };
        let a = sequential.log_density(&set);
        let b = parallel.log_density(&set);
        assert!(a.is_finite());
        assert_relative_eq!(a, b, epsilon = 1.0e-12);
    }

    #[test]
    fn invalid_params_yield_negative_infinity() {
        let (data, mut models) = fixtures();
        models[0].set_clo_param(0, 0, -1.0);
        models[0].refresh();
        let posterior = DyadPosterior::new(
            Likelihood::new(&data[0], 8, 4),
            InitStatePrior::new(0.0, 1.0).expect("positive sigma"),
            PosteriorTerms::default(),
        );
        assert_eq!(
            posterior.log_density(&models[0], LikelihoodWindow::Fitting),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn disabling_the_likelihood_removes_its_term() {
        let (data, models) = fixtures();
        let with = DyadPosterior::new(
            Likelihood::new(&data[0], 8, 4),
            InitStatePrior::new(0.0, 1.0).expect("positive sigma"),
            PosteriorTerms::default(),
        );
        let without = DyadPosterior::new(
            Likelihood::new(&data[0], 8, 4),
            InitStatePrior::new(0.0, 1.0).expect("positive sigma"),
            PosteriorTerms {
                likelihood: false,
                ..PosteriorTerms::default()
            },
        );
        let lhs = with.log_density(&models[0], LikelihoodWindow::Fitting);
        let rhs = without.log_density(&models[0], LikelihoodWindow::Fitting)
            + with
                .likelihood
                .log_density(&models[0], LikelihoodWindow::Fitting);
        assert_relative_eq!(lhs, rhs, epsilon = 1.0e-10);
    }
}
