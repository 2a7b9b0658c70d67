//! Population sampler orchestrator.
//!
//! One training iteration runs, in order: the per-dyad parallel phase,
//! the shared hyper-parameter phase, the GP-drift scale phase, the
//! observation-coefficient phase, the observation-noise phase, the
//! cluster phase, and bookkeeping (best-snapshot tracking, error
//! summaries, checkpoints, convergence and wall-clock checks). The best
//! posterior snapshot is the authoritative output whichever way the loop
//! terminates.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::inference::adapt::{AdaptState, StepSizeTuning, adapt_hmc_step_sizes};
use crate::inference::gradient::{FiniteDifferenceGradient, ParameterAdapter};
use crate::inference::hmc::HmcStep;
use crate::inference::mh::{MhStep, TargetDensity};
use crate::inference::random::{sample_inverse_gamma, sample_poisson};
use crate::input::dyad::{DyadData, DyadInputError, is_missing};
use crate::preprocess::{estimate_init_state, training_length};
use crate::utils::usize_to_f64;

use super::adapters::{
    GpScaleAdapter, LssStateAdapter, NoiseSigmaAdapter, ObsCoefAdapter, SharedParamAdapter,
};
use super::checkpoint::write_population;
use super::diagnostics::compute_population_error;
use super::likelihood::Likelihood;
use super::oscillator::{CoupledOscillator, default_params};
use super::population::{GroupParams, LssSet};
use super::posterior::{
    DyadPosterior, GpScalePosterior, HyperPosterior, PopulationPosterior, PosteriorTerms,
    PredictivePosterior,
};
use super::priors::{
    BlrHyperPrior, ClusterPrior, GpScalePrior, InitStatePrior, NoisePrior, SharedPrior,
    VariancePrior,
};
use super::proposers::{NoiseSigmaProposer, ObsCoefProposer, SharedParamProposer};
use super::state_space::LinearStateSpace;
use super::types::{
    CloError, CloExperimentConfig, NoiseSampleKind, PhaseTimings, SamplerKind, SharedSampleKind,
    TerminationReason, TrainReport,
};
use super::worker::{
    DriftRoundConfig, DyadSamplerState, HmcRoundConfig, MhRoundConfig, drift_round, hmc_round,
    mh_round, run_parallel_round,
};

const CHECKPOINT_INTERVAL: usize = 10;
const SHARED_SUBSTEPS: usize = 5;
const SHARED_MH_MEAN_SUBSTEPS: f64 = 100.0;
const CLUSTER_SUBSTEPS: usize = 2;
const TRAIN_BUDGET_SHARE: f64 = 0.7;
const TEST_BUDGET_SHARE: f64 = 0.8;
const TEST_PLATEAU_INTERVAL: usize = 15;
const TEST_PLATEAU_TOLERANCE: f64 = 0.1;
const PERSON_HMC_ITERATIONS: usize = 10;

/// The top-level sampler: owns the population state and coordinates every
/// sampling phase.
pub struct PopulationSampler<'a> {
    data: &'a [DyadData],
    config: CloExperimentConfig,
    set: LssSet,
    posteriors: Vec<DyadPosterior<'a>>,
    shared_prior: SharedPrior,
    noise_prior: NoisePrior,
    dyad_states: Vec<DyadSamplerState>,
    state_prop_sigma: f64,
    rng: StdRng,
}

impl<'a> PopulationSampler<'a> {
    /// Build the population container, priors, and per-dyad posteriors.
    ///
    /// # Errors
    ///
    /// Returns `CloError` on invalid configuration or data.
    pub fn new(
        data: &'a [DyadData],
        ids: &[u64],
        config: CloExperimentConfig,
    ) -> Result<Self, CloError> {
        config.validate()?;
        if data.is_empty() {
            return Err(CloError::EmptyPopulation);
        }
        if ids.len() != data.len() {
            return Err(CloError::IdDataMismatch {
                ids: ids.len(),
                data: data.len(),
            });
        }

        let members = config.model.num_oscillators;
        let first_observable = &config.data.observables[0];
        for dyad in data {
            dyad.validate()?;
            if dyad.num_members() != members {
                return Err(CloError::MemberCountMismatch {
                    id: dyad.id,
                    found: dyad.num_members(),
                    expected: members,
                });
            }
            for name in &config.data.observables {
                dyad.observable(name)?;
            }
            for name in &config.data.moderators {
                if !dyad.moderators.contains_key(name) {
                    return Err(CloError::InvalidInput(DyadInputError::UnknownModerator {
                        id: dyad.id,
                        name: name.clone(),
                    }));
                }
            }
        }

        let mut rng = StdRng::seed_from_u64(config.run.seed);
        let clo_defaults = default_params(members, config.model.init_period, config.model.init_damping);
        let clo_count = if config.model.ignore_clo {
            0
        } else {
            clo_defaults.len()
        };

        let mut lss_vec = Vec::with_capacity(data.len());
        for dyad in data {
            let train_len = training_length(dyad.times.len(), config.data.training_fraction);
            let train_times = dyad.times[..train_len].to_vec();
            let init_state =
                estimate_init_state(dyad, first_observable, config.data.training_fraction)?;
            let oscillators = if config.model.allow_drift {
                vec![
                    CoupledOscillator::from_params(clo_defaults.clone());
                    train_len.saturating_sub(1).max(1)
                ]
            } else {
                vec![CoupledOscillator::from_params(clo_defaults.clone())]
            };
            let mut lss = LinearStateSpace::new(
                train_times,
                init_state,
                oscillators,
                config.data.observables.clone(),
                vec![config.prior.init_noise_sigma; config.data.observables.len()],
                config.model.polynomial_degree,
                config.model.ignore_clo,
                0,
            );

            let mut outcomes = Vec::new();
            for name in &config.data.outcomes {
                if let Some(values) = dyad.outcomes.get(name) {
                    outcomes.extend_from_slice(values);
                }
            }
            let outcomes_modeled = config.model.model_outcomes && !outcomes.is_empty();
            lss.set_outcomes(outcomes, outcomes_modeled);
            let predictors = build_predictors(&lss, dyad, &config.data.moderators);
            lss.set_predictors(predictors);
            if config.model.allow_drift {
                lss.init_gp(
                    vec![config.prior.gp_scale_init; clo_count],
                    vec![1.0; clo_count],
                );
            }
            lss.refresh();
            lss_vec.push(lss);
        }

        let modeled = lss_vec[0].modeled_param_count();
        let predictor_dim = 1 + config.data.moderators.len();
        let num_groups = config.cluster.num_groups.max(1);
        let mut group_params = Vec::with_capacity(num_groups);
        for _ in 0..num_groups {
            let mut group = GroupParams::new(
                modeled,
                predictor_dim,
                (config.prior.clo_sigma_scale / (config.prior.clo_sigma_shape + 1.0)).max(0.1),
                1.0 / usize_to_f64(num_groups),
            );
            for index in 0..clo_count.min(modeled) {
                group.pred_coefs[index][0] = clo_defaults[index];
            }
            group_params.push(group);
        }

        let gp_scales = if config.model.allow_drift {
            vec![config.prior.gp_scale_init; clo_count]
        } else {
            Vec::new()
        };
        let gp_sigvars = if config.model.allow_drift {
            vec![1.0; clo_count]
        } else {
            Vec::new()
        };
        let mut set = LssSet::new(
            ids.to_vec(),
            lss_vec,
            group_params,
            vec![config.prior.init_noise_sigma; config.data.observables.len()],
            gp_scales,
            gp_sigvars,
        );

        let shared_prior = SharedPrior {
            blr: BlrHyperPrior {
                shapes: build_block_vector(
                    clo_count,
                    config.prior.clo_sigma_shape,
                    set.lss_vec()[0].poly_param_count(),
                    config.prior.poly_sigma_shape,
                    modeled,
                    config.prior.outcome_sigma_shape,
                ),
                scales: build_block_vector(
                    clo_count,
                    config.prior.clo_sigma_scale,
                    set.lss_vec()[0].poly_param_count(),
                    config.prior.poly_sigma_scale,
                    modeled,
                    config.prior.outcome_sigma_scale,
                ),
                coef_prior_sigma: config.prior.coef_prior_sigma,
                variance_prior: VariancePrior::new(
                    config.prior.variance_prior,
                    config.prior.log_transformed_variance,
                ),
            },
            gp_scale: GpScalePrior {
                shapes: vec![config.prior.gp_scale_shape; set.gp_scales().len()],
                scales: vec![config.prior.gp_scale_scale; set.gp_scales().len()],
            },
            cluster: ClusterPrior::new(config.cluster.group_lambda, num_groups),
            learn_clo: !(config.prior.fixed_clo || config.run.fit_fully_independent),
            learn_scale: config.model.allow_drift && !config.run.shared_prior_fixed,
            learn_cluster: config.cluster.sample_cluster,
        };
        let noise_prior = NoisePrior {
            shapes: vec![config.prior.obs_noise_shape; config.data.observables.len()],
            scales: vec![config.prior.obs_noise_scale; config.data.observables.len()],
        };

        let dyad_prior_active = !(config.run.fit_fully_independent
            || config.prior.fixed_clo
            || config.model.allow_drift);
        let posteriors: Vec<DyadPosterior<'a>> = data
            .iter()
            .map(|dyad| {
                let train_len = training_length(dyad.times.len(), config.data.training_fraction);
                DyadPosterior::new(
                    Likelihood::new(dyad, train_len, config.data.stochastic_segment_length),
                    InitStatePrior {
                        mean: config.prior.init_state_mean,
                        sigma: config.prior.init_state_sigma,
                    },
                    PosteriorTerms {
                        init_state: true,
                        dyad_prior: dyad_prior_active,
                        group_prior: false,
                        drift_prior: config.model.allow_drift,
                        likelihood: true,
                    },
                )
            })
            .collect();

        // Randomize the starting cluster layout from the prior.
        if config.cluster.sample_cluster && num_groups > 1 {
            let weights = shared_prior.cluster.sample_weights_from_prior(&mut rng);
            set.set_group_weights(&weights);
            shared_prior
                .cluster
                .sample_assignments(&mut set, &mut rng, true, false);
        }

        let state_prop_sigma = if config.proposal.data_driven_state_sigma {
            data_state_sigma(data, first_observable).unwrap_or(config.proposal.init_state_sigma)
        } else {
            config.proposal.init_state_sigma
        };

        let dyad_states = data
            .iter()
            .map(|dyad| {
                let horizon = usize_to_f64(dyad.times.len());
                DyadSamplerState {
                    hmc_step_size: config.steps.person_hmc_size / horizon.powi(3),
                    ..DyadSamplerState::default()
                }
            })
            .collect();

        Ok(Self {
            data,
            config,
            set,
            posteriors,
            shared_prior,
            noise_prior,
            dyad_states,
            state_prop_sigma,
            rng,
        })
    }

    #[must_use]
    pub fn population(&self) -> &LssSet {
        &self.set
    }

    #[must_use]
    pub const fn config(&self) -> &CloExperimentConfig {
        &self.config
    }

    /// Adopt another population's shared parameters (cluster regressions,
    /// noise sigmas, GP scales), e.g. a trained fold applied to held-out
    /// dyads.
    pub fn adopt_shared_params(&mut self, source: &LssSet) {
        for (target, template) in self
            .set
            .group_params_mut()
            .iter_mut()
            .zip(source.group_params())
        {
            *target = template.clone();
        }
        let sigmas = source.noise_sigmas().to_vec();
        self.set.set_noise_sigmas(&sigmas);
        for (index, value) in source.gp_scales().iter().enumerate() {
            if index < self.set.gp_scales().len() {
                self.set.set_gp_scale(index, *value);
            }
        }
        for (index, value) in source.gp_sigvars().iter().enumerate() {
            if index < self.set.gp_sigvars().len() {
                self.set.set_gp_sigvar(index, *value);
            }
        }
        self.set.update_means();
        self.set.update_variances();
    }

    /// Run the training loop and return the best snapshot plus a report.
    ///
    /// # Errors
    ///
    /// Returns `CloError::DegeneratePosterior` if the initial posterior is
    /// not finite.
    #[allow(clippy::too_many_lines)]
    pub fn train(&mut self) -> Result<(LssSet, TrainReport), CloError> {
        let run = self.config.run.clone();
        let noise_options = self.config.noise.clone();
        let max_seconds = run.time_budget_minutes * 60.0 * TRAIN_BUDGET_SHARE;
        let members = self.config.model.num_oscillators;
        let mut timings = PhaseTimings::default();

        self.set.clear_samples();
        self.set.refresh_all();

        let use_noise_prior = noise_options.sample_noise_sigma || run.fit_fully_independent;
        let population = PopulationPosterior {
            shared_prior: &self.shared_prior,
            noise_prior: &self.noise_prior,
            posteriors: &self.posteriors,
            threads: run.threads,
            use_hyper_prior: !run.fit_fully_independent,
            use_noise_prior,
        };

        // Shared-parameter machinery lives across iterations so its
        // adaptive state carries over.
        let shared_adapter = SharedParamAdapter {
            include_variances: !self.config.prior.fixed_clo,
        };
        let shared_size = shared_adapter.size(&self.set);
        let mut shared_proposer = SharedParamProposer::new(
            self.config.proposal.coef_sigma,
            self.config.proposal.variance_sigma,
            !self.config.prior.fixed_clo,
        );
        let mut shared_mh = MhStep::new();
        let mut shared_hmc = HmcStep::new(
            vec![self.config.steps.shared_hmc_size; shared_size],
            self.config.steps.shared_leapfrog_steps,
        );
        let mut shared_hmc_adapt = AdaptState::default();
        let shared_gradient = FiniteDifferenceGradient::new(
            &population,
            &shared_adapter,
            vec![self.config.steps.shared_grad_size; shared_size],
        )
        .with_estimated_steps(self.config.steps.estimate_grad_step)
        .with_threads(run.threads);

        let hyper = HyperPosterior {
            shared_prior: &self.shared_prior,
        };
        let hyper_gradient = FiniteDifferenceGradient::new(
            &hyper,
            &shared_adapter,
            vec![self.config.steps.shared_grad_size; shared_size],
        )
        .with_estimated_steps(self.config.steps.estimate_grad_step)
        .with_threads(run.threads);

        let scale_pos = GpScalePosterior {
            scale_prior: &self.shared_prior.gp_scale,
        };
        let scale_adapter = GpScaleAdapter;
        let scale_size = scale_adapter.size(&self.set);
        let mut scale_hmc = HmcStep::new(
            vec![self.config.steps.shared_hmc_size; scale_size],
            self.config.steps.shared_leapfrog_steps,
        )
        .with_lower_bounds(vec![f64::EPSILON; scale_size]);
        let mut scale_hmc_adapt = AdaptState::default();
        let scale_tuning = StepSizeTuning {
            check_interval: 10,
            ..StepSizeTuning::default()
        };
        let scale_gradient = FiniteDifferenceGradient::new(
            &scale_pos,
            &scale_adapter,
            vec![self.config.steps.shared_grad_size; scale_size],
        );

        let num_observables = self.config.data.observables.len();
        let obs_adapter = ObsCoefAdapter {
            num_observables,
            num_members: members,
            coef_dim: 1,
        };
        let obs_size = obs_adapter.size(&self.set);
        let mut obs_proposer = ObsCoefProposer::new(self.config.proposal.obs_coef_sigma);
        let mut obs_mh = MhStep::new();
        let mut obs_hmc = HmcStep::new(
            vec![self.config.steps.obs_coef_hmc_size; obs_size.max(1)],
            self.config.steps.shared_leapfrog_steps,
        );
        let mut obs_hmc_adapt = AdaptState::default();
        let obs_gradient = FiniteDifferenceGradient::new(
            &population,
            &obs_adapter,
            vec![self.config.steps.obs_coef_grad_size; obs_size.max(1)],
        );

        let noise_adapter = NoiseSigmaAdapter;
        let noise_size = noise_adapter.size(&self.set);
        let mut noise_proposer = NoiseSigmaProposer {
            prop_sigmas: vec![self.config.proposal.noise_sigma; noise_size],
        };
        let mut noise_mh = MhStep::new();
        let mut noise_hmc = HmcStep::new(
            vec![self.config.steps.noise_hmc_size; noise_size],
            self.config.steps.shared_leapfrog_steps,
        )
        .with_lower_bounds(vec![0.0; noise_size]);
        let mut noise_hmc_adapt = AdaptState::default();
        let noise_gradient = FiniteDifferenceGradient::new(
            &population,
            &noise_adapter,
            vec![self.config.steps.noise_grad_size; noise_size],
        );

        let tuning = StepSizeTuning::default();

        let mut lp = population.log_density(&self.set);
        if !lp.is_finite() {
            return Err(CloError::DegeneratePosterior);
        }
        log::info!("initial log posterior: {lp:.4}");

        let mut best = self.set.clone();
        let mut best_lp = lp;
        let mut last_checked_best = best_lp;
        let mut stagnant_checks = 0_usize;
        let mut termination = TerminationReason::IterationsExhausted;
        let mut iterations_completed = 0;
        let mut dyad_failures = 0;
        let mut fitting_error = f64::NAN;
        let mut prediction_error = f64::NAN;

        for iteration in 0..run.num_iterations {
            iterations_completed = iteration + 1;
            let track_best = iteration >= run.burn_in_iterations;

            // Per-dyad phase.
            let phase_started = Instant::now();
            let person_active = !self.config.prior.fixed_clo || !self.config.model.ignore_clo;
            if person_active {
                let remaining = (max_seconds - timings.total()).max(0.0);
                let (_, failures) = person_phase(
                    &mut self.set,
                    &self.posteriors,
                    &mut self.dyad_states,
                    &self.config,
                    self.state_prop_sigma,
                    iteration,
                    remaining,
                    false,
                );
                dyad_failures += failures;
                self.set.refresh_all();
                lp = population.log_density(&self.set);
                log::debug!("iteration {iteration}: after person phase lp = {lp:.4}");
                if track_best && lp > best_lp {
                    best_lp = lp;
                    best = self.set.clone();
                }
            }
            timings.person += phase_started.elapsed().as_secs_f64();

            // Shared hyper-parameter phase.
            let phase_started = Instant::now();
            if !run.fit_fully_independent {
                if self.config.prior.fixed_clo {
                    if run.shared_approach == SharedSampleKind::Hmc {
                        for _ in 0..SHARED_SUBSTEPS {
                            shared_hmc.step(
                                &population,
                                &shared_adapter,
                                &shared_gradient,
                                &mut self.set,
                                &mut lp,
                                &mut self.rng,
                            );
                            adapt_hmc_step_sizes(
                                &mut shared_hmc,
                                &mut shared_hmc_adapt,
                                tuning,
                                &mut self.rng,
                            );
                            if track_best && lp > best_lp {
                                best_lp = lp;
                                best = self.set.clone();
                            }
                        }
                    } else {
                        let substeps = sample_poisson(&mut self.rng, SHARED_MH_MEAN_SUBSTEPS);
                        for _ in 0..substeps {
                            shared_mh.step(
                                &population,
                                &mut shared_proposer,
                                &mut self.set,
                                &mut lp,
                                &mut self.rng,
                            );
                            if track_best && lp > best_lp {
                                best_lp = lp;
                                best = self.set.clone();
                            }
                        }
                    }
                } else if !run.shared_prior_fixed {
                    match run.shared_approach {
                        SharedSampleKind::Gibbs => {
                            self.shared_prior.blr.gibbs_update(&mut self.set, &mut self.rng);
                            lp = population.log_density(&self.set);
                            log::debug!("iteration {iteration}: after gibbs lp = {lp:.4}");
                            if track_best && lp > best_lp {
                                best_lp = lp;
                                best = self.set.clone();
                            }
                        }
                        SharedSampleKind::Hmc => {
                            let mut prior_value = hyper.log_density(&self.set);
                            let likelihood_part = lp - prior_value;
                            for _ in 0..SHARED_SUBSTEPS {
                                shared_hmc.step(
                                    &hyper,
                                    &shared_adapter,
                                    &hyper_gradient,
                                    &mut self.set,
                                    &mut prior_value,
                                    &mut self.rng,
                                );
                                adapt_hmc_step_sizes(
                                    &mut shared_hmc,
                                    &mut shared_hmc_adapt,
                                    tuning,
                                    &mut self.rng,
                                );
                                if track_best && likelihood_part + prior_value > best_lp {
                                    best_lp = likelihood_part + prior_value;
                                    best = self.set.clone();
                                }
                            }
                            lp = likelihood_part + prior_value;
                        }
                        SharedSampleKind::MetropolisHastings => {
                            let mut prior_value = hyper.log_density(&self.set);
                            let likelihood_part = lp - prior_value;
                            let substeps = sample_poisson(&mut self.rng, SHARED_MH_MEAN_SUBSTEPS);
                            for _ in 0..substeps {
                                shared_mh.step(
                                    &hyper,
                                    &mut shared_proposer,
                                    &mut self.set,
                                    &mut prior_value,
                                    &mut self.rng,
                                );
                                if track_best && likelihood_part + prior_value > best_lp {
                                    best_lp = likelihood_part + prior_value;
                                    best = self.set.clone();
                                }
                            }
                            lp = likelihood_part + prior_value;
                        }
                    }
                }
            }
            timings.shared += phase_started.elapsed().as_secs_f64();

            // GP drift-scale phase.
            let phase_started = Instant::now();
            if self.config.model.allow_drift && !run.shared_prior_fixed && scale_size > 0 {
                let mut prior_value = scale_pos.log_density(&self.set);
                let likelihood_part = lp - prior_value;
                for _ in 0..self.config.steps.hmc_iterations {
                    scale_hmc.step(
                        &scale_pos,
                        &scale_adapter,
                        &scale_gradient,
                        &mut self.set,
                        &mut prior_value,
                        &mut self.rng,
                    );
                    adapt_hmc_step_sizes(
                        &mut scale_hmc,
                        &mut scale_hmc_adapt,
                        scale_tuning,
                        &mut self.rng,
                    );
                }
                lp = likelihood_part + prior_value;
                log::debug!("iteration {iteration}: after gp-scale lp = {lp:.4}");
                if track_best && lp > best_lp {
                    best_lp = lp;
                    best = self.set.clone();
                }
            }
            timings.drift_scale += phase_started.elapsed().as_secs_f64();

            // Observation-coefficient phase.
            let phase_started = Instant::now();
            if num_observables > 1 && !run.obs_coefs_fixed {
                for _ in 0..num_observables * SHARED_SUBSTEPS {
                    if run.obs_coef_approach == SamplerKind::MetropolisHastings {
                        obs_mh.step(
                            &population,
                            &mut obs_proposer,
                            &mut self.set,
                            &mut lp,
                            &mut self.rng,
                        );
                    } else {
                        obs_hmc.step(
                            &population,
                            &obs_adapter,
                            &obs_gradient,
                            &mut self.set,
                            &mut lp,
                            &mut self.rng,
                        );
                        adapt_hmc_step_sizes(
                            &mut obs_hmc,
                            &mut obs_hmc_adapt,
                            tuning,
                            &mut self.rng,
                        );
                    }
                    if track_best && lp > best_lp {
                        best_lp = lp;
                        best = self.set.clone();
                    }
                }
            }
            timings.obs_coef += phase_started.elapsed().as_secs_f64();

            // Observation-noise phase.
            let phase_started = Instant::now();
            if noise_options.sample_noise_sigma {
                match noise_options.approach {
                    NoiseSampleKind::Gibbs => {
                        gibbs_noise_update(
                            &mut self.set,
                            &self.posteriors,
                            &self.noise_prior,
                            &mut self.rng,
                        );
                        lp = population.log_density(&self.set);
                        if track_best && lp > best_lp {
                            best_lp = lp;
                            best = self.set.clone();
                        }
                    }
                    NoiseSampleKind::MetropolisHastings => {
                        // Amortized: only evaluate the expensive predictive
                        // posterior on a fraction of iterations.
                        if self.rng.random::<f64>() < noise_options.mh_trigger_probability {
                            let predictive = PredictivePosterior {
                                posteriors: &self.posteriors,
                                threads: run.threads,
                            };
                            let mut predictive_lp = predictive.log_density(&self.set);
                            let mut best_predictive = predictive_lp;
                            for _ in 0..noise_options.mh_inner_iterations {
                                noise_mh.step(
                                    &predictive,
                                    &mut noise_proposer,
                                    &mut self.set,
                                    &mut predictive_lp,
                                    &mut self.rng,
                                );
                                if predictive_lp > best_predictive {
                                    best_predictive = predictive_lp;
                                    best = self.set.clone();
                                }
                            }
                            lp = population.log_density(&self.set);
                            log::debug!(
                                "iteration {iteration}: after noise-sigma mh, predictive = {best_predictive:.4}"
                            );
                        }
                    }
                    NoiseSampleKind::Hmc => {
                        noise_hmc.step(
                            &population,
                            &noise_adapter,
                            &noise_gradient,
                            &mut self.set,
                            &mut lp,
                            &mut self.rng,
                        );
                        adapt_hmc_step_sizes(
                            &mut noise_hmc,
                            &mut noise_hmc_adapt,
                            tuning,
                            &mut self.rng,
                        );
                        if track_best && lp > best_lp {
                            best_lp = lp;
                            best = self.set.clone();
                        }
                    }
                }
            }
            timings.noise += phase_started.elapsed().as_secs_f64();

            // Cluster phase.
            let phase_started = Instant::now();
            if self.config.cluster.sample_cluster {
                for _ in 0..CLUSTER_SUBSTEPS {
                    self.shared_prior
                        .cluster
                        .sample_weights(&mut self.set, &mut self.rng);
                    self.shared_prior.cluster.sample_assignments(
                        &mut self.set,
                        &mut self.rng,
                        false,
                        self.config.cluster.collapsed_gibbs,
                    );
                    lp = population.log_density(&self.set);
                    if track_best && lp > best_lp {
                        best_lp = lp;
                        best = self.set.clone();
                    }
                }
            }
            timings.cluster += phase_started.elapsed().as_secs_f64();

            // Bookkeeping: errors, checkpoints, convergence, wall clock.
            let phase_started = Instant::now();
            let errors = compute_population_error(
                self.data,
                &self.set,
                self.config.data.training_fraction,
            );
            if errors.len() == 2 * members {
                fitting_error = errors[..members].iter().sum();
                prediction_error = errors[members..].iter().sum();
            }
            log::debug!(
                "iteration {iteration}: fit error {fitting_error:.4}, prediction error {prediction_error:.4}"
            );

            if let Some(dir) = &run.output_dir
                && (iteration + 1).is_multiple_of(CHECKPOINT_INTERVAL)
            {
                if let Err(error) = write_population(&dir.join("best_model"), &best) {
                    log::warn!("checkpoint of best model failed (will retry): {error}");
                }
                if let Err(error) = write_population(dir, &self.set) {
                    log::warn!("checkpoint of current state failed (will retry): {error}");
                }
                let per_dyad_errors: Vec<Vec<f64>> = self
                    .data
                    .iter()
                    .zip(self.set.lss_vec())
                    .map(|(dyad, lss)| {
                        super::diagnostics::compute_ave_error(
                            dyad,
                            lss,
                            self.config.data.training_fraction,
                        )
                    })
                    .collect();
                if let Err(error) =
                    super::diagnostics::write_error_files(dir, self.set.ids(), &per_dyad_errors)
                {
                    log::warn!("error summary write failed (will retry): {error}");
                }
            }
            timings.bookkeeping += phase_started.elapsed().as_secs_f64();

            if best_lp - last_checked_best > run.converge_threshold {
                last_checked_best = best_lp;
                stagnant_checks = 0;
            } else {
                stagnant_checks += 1;
            }
            if stagnant_checks >= run.converge_window.max(1) {
                log::info!(
                    "converged after {iterations_completed} iterations (best lp {best_lp:.4})"
                );
                termination = TerminationReason::Converged;
                break;
            }
            if timings.total() > max_seconds {
                log::warn!("training wall-clock budget exceeded after {iterations_completed} iterations");
                termination = TerminationReason::TimeBudgetExceeded;
                break;
            }
        }

        let report = TrainReport {
            iterations_completed,
            termination,
            best_log_posterior: best_lp,
            fitting_error,
            prediction_error,
            timings,
            dyad_failures,
        };
        Ok((best, report))
    }

    /// Held-out evaluation: optimize per-dyad parameters only, with the
    /// shared hyper-prior and noise prior disabled.
    ///
    /// # Errors
    ///
    /// Returns `CloError::DegeneratePosterior` if the initial posterior is
    /// not finite.
    pub fn test(&mut self, num_iterations: usize) -> Result<(LssSet, TrainReport), CloError> {
        let run = self.config.run.clone();
        let max_seconds = run.time_budget_minutes * 60.0 * TEST_BUDGET_SHARE;
        let mut timings = PhaseTimings::default();
        self.set.clear_samples();
        self.set.refresh_all();

        let population = PopulationPosterior {
            shared_prior: &self.shared_prior,
            noise_prior: &self.noise_prior,
            posteriors: &self.posteriors,
            threads: run.threads,
            use_hyper_prior: false,
            use_noise_prior: false,
        };

        let mut lp = population.log_density(&self.set);
        if !lp.is_finite() {
            return Err(CloError::DegeneratePosterior);
        }
        let mut best = self.set.clone();
        let mut best_lp = lp;
        let mut previous_best = best_lp;
        let mut termination = TerminationReason::IterationsExhausted;
        let mut iterations_completed = 0;
        let mut dyad_failures = 0;

        for iteration in 0..num_iterations {
            iterations_completed = iteration + 1;
            let phase_started = Instant::now();
            let remaining = (max_seconds - timings.total()).max(0.0);
            let (exceeded, failures) = person_phase(
                &mut self.set,
                &self.posteriors,
                &mut self.dyad_states,
                &self.config,
                self.state_prop_sigma,
                iteration,
                remaining,
                true,
            );
            dyad_failures += failures;
            self.set.refresh_all();
            lp = population.log_density(&self.set);
            if lp > best_lp {
                best_lp = lp;
                best = self.set.clone();
            }
            timings.person += phase_started.elapsed().as_secs_f64();

            if (iteration + 1).is_multiple_of(TEST_PLATEAU_INTERVAL) {
                if (previous_best - best_lp).abs() < TEST_PLATEAU_TOLERANCE {
                    termination = TerminationReason::Converged;
                    break;
                }
                previous_best = best_lp;
            }
            if exceeded || timings.total() > max_seconds {
                log::warn!("testing wall-clock budget exceeded after {iterations_completed} iterations");
                termination = TerminationReason::TimeBudgetExceeded;
                break;
            }
        }

        let members = self.config.model.num_oscillators;
        let errors =
            compute_population_error(self.data, &best, self.config.data.training_fraction);
        let (fitting_error, prediction_error) = if errors.len() == 2 * members {
            (
                errors[..members].iter().sum(),
                errors[members..].iter().sum(),
            )
        } else {
            (f64::NAN, f64::NAN)
        };

        let report = TrainReport {
            iterations_completed,
            termination,
            best_log_posterior: best_lp,
            fitting_error,
            prediction_error,
            timings,
            dyad_failures,
        };
        Ok((best, report))
    }
}

/// Fit a population with the given configuration and return the best
/// snapshot plus the training report.
///
/// # Errors
///
/// Returns `CloError` on invalid configuration or data, or a degenerate
/// initial posterior.
pub fn fit_clo_population(
    data: &[DyadData],
    ids: &[u64],
    config: CloExperimentConfig,
) -> Result<(LssSet, TrainReport), CloError> {
    let mut sampler = PopulationSampler::new(data, ids, config)?;
    sampler.train()
}

/// One per-dyad parallel phase: drift, MH, or HMC round per the run
/// configuration. Returns the exceeded-budget flag and the failure count.
#[allow(clippy::too_many_arguments)]
fn person_phase(
    set: &mut LssSet,
    posteriors: &[DyadPosterior<'_>],
    dyad_states: &mut [DyadSamplerState],
    config: &CloExperimentConfig,
    state_prop_sigma: f64,
    iteration: usize,
    budget_seconds: f64,
    optimize: bool,
) -> (bool, usize) {
    let base_seed = config.run.seed.wrapping_add(
        u64::try_from(iteration)
            .unwrap_or(0)
            .wrapping_add(1)
            .wrapping_mul(0xD1B5_4A32_D192_ED03),
    );
    let threads = config.run.threads;
    let sample_state = !config.model.ignore_clo;
    let sample_clo = !(config.prior.fixed_clo || config.model.ignore_clo);
    let (lss_slice, samples_slice) = set.split_for_round();

    let outcome = if config.model.allow_drift {
        let round_config = DriftRoundConfig {
            state_sigma: state_prop_sigma,
            poly_sigma: config.proposal.poly_term_sigma,
            sample_state,
            sample_poly: config.model.polynomial_degree.is_some(),
            control_point_spacing: config.drift.control_point_spacing,
            burn_iterations: config.drift.burn_iterations,
            sample_iterations: config.drift.sample_iterations,
            record_samples: config.run.record_samples,
        };
        run_parallel_round(
            lss_slice,
            posteriors,
            samples_slice,
            dyad_states,
            threads,
            budget_seconds,
            base_seed,
            |slice| drift_round(slice, &round_config),
        )
    } else if config.run.person_approach == SamplerKind::MetropolisHastings {
        let round_config = MhRoundConfig {
            sample_state,
            sample_clo,
            sample_poly: config.model.polynomial_degree.is_some() && !config.prior.fixed_clo,
            state_sigma: state_prop_sigma,
            clo_sigma: config.proposal.clo_param_sigma,
            poly_sigma: config.proposal.poly_term_sigma,
            adapt: config.proposal.adapt,
            optimize,
            max_sweeps: config.run.optimize_max_sweeps,
            check_interval: config.run.person_check_interval,
            plateau_tolerance: TEST_PLATEAU_TOLERANCE,
            record_samples: config.run.record_samples,
        };
        run_parallel_round(
            lss_slice,
            posteriors,
            samples_slice,
            dyad_states,
            threads,
            budget_seconds,
            base_seed,
            |slice| mh_round(slice, &round_config),
        )
    } else {
        let round_config = HmcRoundConfig {
            sample_state,
            sample_clo,
            grad_size: config.steps.person_grad_size,
            estimate_grad_step: config.steps.estimate_grad_step,
            leapfrog_steps: config.steps.person_leapfrog_steps,
            iterations: PERSON_HMC_ITERATIONS,
            optimize,
            max_iterations: config.run.optimize_max_sweeps,
            plateau_tolerance: TEST_PLATEAU_TOLERANCE,
        };
        let adapter = LssStateAdapter {
            sample_state,
            sample_clo,
        };
        let tuning = StepSizeTuning::default();
        run_parallel_round(
            lss_slice,
            posteriors,
            samples_slice,
            dyad_states,
            threads,
            budget_seconds,
            base_seed,
            |slice| hmc_round(slice, &round_config, adapter, tuning),
        )
    };

    for failure in &outcome.failures {
        log::warn!("dyad {} update failed: {}", failure.dyad, failure.error);
    }
    (outcome.exceeded_budget, outcome.failures.len())
}

/// Closed-form draw of each observation-noise sigma from its conjugate
/// inverse-gamma posterior.
fn gibbs_noise_update(
    set: &mut LssSet,
    posteriors: &[DyadPosterior<'_>],
    prior: &NoisePrior,
    rng: &mut StdRng,
) {
    let num_observables = set.noise_sigmas().len();
    let mut sums = vec![0.0; num_observables];
    let mut counts = vec![0_usize; num_observables];
    for (lss, posterior) in set.lss_vec().iter().zip(posteriors) {
        let (dyad_sums, dyad_counts) = posterior.likelihood.squared_errors(lss);
        for index in 0..num_observables {
            sums[index] += dyad_sums[index];
            counts[index] += dyad_counts[index];
        }
    }

    let mut sigmas = set.noise_sigmas().to_vec();
    for index in 0..num_observables {
        let shape = prior.shapes[index] + usize_to_f64(counts[index]) / 2.0;
        let scale = prior.scales[index] + sums[index] / 2.0;
        if scale / shape > 1.0e8 {
            continue;
        }
        let variance = sample_inverse_gamma(rng, shape, scale);
        if variance.is_finite() && variance > 0.0 {
            sigmas[index] = variance.sqrt();
        }
    }
    set.set_noise_sigmas(&sigmas);
}

/// Moderator design vector per modeled parameter: an intercept plus the
/// owning member's moderator values.
fn build_predictors(
    lss: &LinearStateSpace,
    dyad: &DyadData,
    moderators: &[String],
) -> Vec<Vec<f64>> {
    lss.modeled_param_members()
        .iter()
        .map(|member| {
            let mut row = Vec::with_capacity(1 + moderators.len());
            row.push(1.0);
            for name in moderators {
                let value = dyad
                    .moderators
                    .get(name)
                    .and_then(|values| values.get(*member))
                    .copied()
                    .unwrap_or(0.0);
                row.push(value);
            }
            row
        })
        .collect()
}

/// Per-block hyper-parameter layout: CLO, then polynomial, then outcome.
fn build_block_vector(
    clo_count: usize,
    clo_value: f64,
    poly_count: usize,
    poly_value: f64,
    total: usize,
    outcome_value: f64,
) -> Vec<f64> {
    let mut values = Vec::with_capacity(total);
    values.extend(std::iter::repeat_n(clo_value, clo_count));
    values.extend(std::iter::repeat_n(poly_value, poly_count));
    while values.len() < total {
        values.push(outcome_value);
    }
    values
}

/// Pooled standard deviation of the first observable, used to seed the
/// init-state proposal sigma from the data.
fn data_state_sigma(data: &[DyadData], observable: &str) -> Option<f64> {
    let mut total_variance = 0.0;
    let mut series_count = 0_usize;
    for dyad in data {
        let Ok(series) = dyad.observable(observable) else {
            continue;
        };
        for values in series {
            let kept: Vec<f64> = values.iter().copied().filter(|v| !is_missing(*v)).collect();
            if kept.len() < 2 {
                continue;
            }
            let n = usize_to_f64(kept.len());
            let mean = kept.iter().sum::<f64>() / n;
            let variance = kept
                .iter()
                .map(|value| (value - mean) * (value - mean))
                .sum::<f64>()
                / n;
            total_variance += variance;
            series_count += 1;
        }
    }
    if series_count == 0 {
        None
    } else {
        Some((total_variance / usize_to_f64(series_count)).sqrt().max(1.0e-3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::clo::types::{DataOptions, ModelOptions, RunOptions};

    fn synthetic_data(num_dyads: usize, points: usize) -> (Vec<DyadData>, Vec<u64>) {
        let times: Vec<f64> = (0..points).map(|t| usize_to_f64(t) * 0.3).collect();
        let mut data = Vec::new();
        let mut ids = Vec::new();
        for dyad in 0..num_dyads {
            let phase = 0.25 * usize_to_f64(dyad);
            let series: Vec<Vec<f64>> = (0..2)
                .map(|member| {
                    times
                        .iter()
                        .map(|t| {
                            let sign = if member == 0 { 1.0 } else { -1.0 };
                            sign * (t * 1.2 + phase).sin()
                        })
                        .collect()
                })
                .collect();
            let id = u64::try_from(dyad + 1).unwrap_or(u64::MAX);
            data.push(DyadData::new(id, times.clone()).with_observable("dial", series));
            ids.push(id);
        }
        (data, ids)
    }

    fn quick_config(iterations: usize) -> CloExperimentConfig {
        CloExperimentConfig {
            data: DataOptions {
                training_fraction: 0.8,
                ..DataOptions::default()
            },
            model: ModelOptions::default(),
            run: RunOptions {
                num_iterations: iterations,
                converge_window: 1_000,
                threads: 1,
                time_budget_minutes: 5.0,
                ..RunOptions::default()
            },
            ..CloExperimentConfig::default()
        }
    }

    #[test]
    fn sampler_construction_validates_member_counts() {
        let (mut data, ids) = synthetic_data(2, 10);
        if let Some(series) = data[0].observables.get_mut("dial") {
            series.pop();
        }
        let error = match PopulationSampler::new(&data, &ids, quick_config(5)) {
            Err(error) => error,
            Ok(_) => panic!("member mismatch should fail"),
        };
        assert!(matches!(error, CloError::MemberCountMismatch { .. }));
    }

    #[test]
    fn id_data_mismatch_is_rejected() {
        let (data, _) = synthetic_data(2, 10);
        let error = match PopulationSampler::new(&data, &[1], quick_config(5)) {
            Err(error) => error,
            Ok(_) => panic!("length mismatch should fail"),
        };
        assert!(matches!(error, CloError::IdDataMismatch { .. }));
    }

    #[test]
    fn training_runs_and_returns_finite_report() {
        let (data, ids) = synthetic_data(2, 10);
        let (best, report) =
            fit_clo_population(&data, &ids, quick_config(3)).expect("training should run");
        assert_eq!(best.num_dyads(), 2);
        assert!(report.best_log_posterior.is_finite());
        assert_eq!(report.iterations_completed, 3);
    }

    #[test]
    fn convergence_stops_before_iteration_cap() {
        let (data, ids) = synthetic_data(2, 10);
        let mut config = quick_config(500);
        config.run.converge_window = 3;
        // With a huge threshold every check counts as stagnant.
        config.run.converge_threshold = 1.0e12;
        let (_, report) = fit_clo_population(&data, &ids, config).expect("training should run");
        assert_eq!(report.termination, TerminationReason::Converged);
        assert!(report.iterations_completed < 500);
    }

    #[test]
    fn tiny_time_budget_terminates_gracefully() {
        let (data, ids) = synthetic_data(3, 12);
        let mut config = quick_config(10_000);
        config.run.time_budget_minutes = 1.0e-5;
        let (best, report) = fit_clo_population(&data, &ids, config).expect("training should run");
        assert_eq!(report.termination, TerminationReason::TimeBudgetExceeded);
        assert_eq!(best.num_dyads(), 3);
        assert!(report.best_log_posterior.is_finite());
    }
}
