//! Per-dyad sampling rounds and their parallel dispatcher.
//!
//! Each round (MH sweep, HMC, or GP-drift) processes a contiguous slice
//! of dyads. Parallel dispatch hands every scoped thread a disjoint
//! `chunks_mut` slice, so no two threads can ever write the same dyad.
//! Per-dyad RNGs are derived from the round seed and the dyad's global
//! index, making results identical for any thread count. A failure in one
//! dyad's update is recorded and that dyad keeps its previous state;
//! sibling dyads are unaffected.

use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::inference::adapt::{AdaptState, StepSizeTuning, adapt_hmc_step_sizes};
use crate::inference::gradient::{FiniteDifferenceGradient, ParameterAdapter};
use crate::inference::hmc::HmcStep;
use crate::inference::mh::{MhStep, Proposer, TargetDensity};
use crate::inference::random::{sample_standard_normal, should_accept};
use crate::utils::{cholesky_lower, usize_to_f64};

use super::likelihood::LikelihoodWindow;
use super::posterior::{DyadPosterior, WindowedPosterior, effective_threads};
use super::proposers::LssProposer;
use super::state_space::LinearStateSpace;
use super::types::CloError;

const BATCH_SIZE: usize = 10;
const WARMUP_BATCHES: usize = 10;
const TARGET_ACCEPTANCE: f64 = 0.44;
const MIN_PROP_SIGMA: f64 = 1.0e-5;
const MAX_PROP_SIGMA: f64 = 100.0;
const GP_PROPOSAL_JITTER: f64 = 1.0e-8;

/// One dyad's failed update.
#[derive(Debug)]
pub struct DyadFailure {
    pub dyad: usize,
    pub error: CloError,
}

/// Aggregate result of one per-dyad round.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    pub exceeded_budget: bool,
    pub failures: Vec<DyadFailure>,
    pub accepted: usize,
    pub proposed: usize,
}

impl RoundOutcome {
    pub fn merge(&mut self, other: Self) {
        self.exceeded_budget |= other.exceeded_budget;
        self.failures.extend(other.failures);
        self.accepted += other.accepted;
        self.proposed += other.proposed;
    }
}

/// Mutable per-dyad sampler state that survives across rounds: adapted
/// proposal sigmas for MH, adapted step size and acceptance window for
/// HMC.
#[derive(Debug, Clone, Default)]
pub struct DyadSamplerState {
    pub prop_sigmas: Vec<f64>,
    pub accepted_per_coord: Vec<usize>,
    pub total_sweeps: usize,
    pub nth_batch: usize,
    pub hmc_step_size: f64,
    pub hmc_adapt: AdaptState,
}

/// A worker's view of its assigned dyads.
pub struct WorkerSlice<'s, 'a> {
    pub lss: &'s mut [LinearStateSpace],
    pub posteriors: &'s [DyadPosterior<'a>],
    pub samples: &'s mut [Vec<LinearStateSpace>],
    pub states: &'s mut [DyadSamplerState],
    pub first_index: usize,
    pub budget_seconds: f64,
    pub base_seed: u64,
}

/// MH round controls.
#[derive(Debug, Clone)]
pub struct MhRoundConfig {
    pub sample_state: bool,
    pub sample_clo: bool,
    pub sample_poly: bool,
    pub state_sigma: f64,
    pub clo_sigma: f64,
    pub poly_sigma: f64,
    pub adapt: bool,
    /// Keep the best visited model and loop until it plateaus.
    pub optimize: bool,
    pub max_sweeps: usize,
    pub check_interval: usize,
    pub plateau_tolerance: f64,
    pub record_samples: usize,
}

/// HMC round controls.
#[derive(Debug, Clone)]
pub struct HmcRoundConfig {
    pub sample_state: bool,
    pub sample_clo: bool,
    pub grad_size: f64,
    pub estimate_grad_step: bool,
    pub leapfrog_steps: usize,
    pub iterations: usize,
    pub optimize: bool,
    pub max_iterations: usize,
    pub plateau_tolerance: f64,
}

/// GP-drift round controls.
#[derive(Debug, Clone)]
pub struct DriftRoundConfig {
    pub state_sigma: f64,
    pub poly_sigma: f64,
    pub sample_state: bool,
    pub sample_poly: bool,
    pub control_point_spacing: usize,
    pub burn_iterations: usize,
    pub sample_iterations: usize,
    pub record_samples: usize,
}

fn dyad_rng(base_seed: u64, dyad: usize) -> StdRng {
    let index = u64::try_from(dyad).unwrap_or(u64::MAX);
    StdRng::seed_from_u64(base_seed.wrapping_add(index.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
}

/// One MH sweep round over the slice.
#[must_use]
pub fn mh_round(slice: WorkerSlice<'_, '_>, config: &MhRoundConfig) -> RoundOutcome {
    let mut outcome = RoundOutcome::default();
    let count = slice.lss.len();
    if count == 0 {
        return outcome;
    }
    let allowance = slice.budget_seconds / usize_to_f64(count);

    for local in 0..count {
        let dyad = slice.first_index + local;
        let started = Instant::now();
        let lss = &mut slice.lss[local];
        let posterior = &slice.posteriors[local];
        let state = &mut slice.states[local];
        let mut rng = dyad_rng(slice.base_seed, dyad);

        lss.refresh();
        let mut proposer = LssProposer::new(
            lss,
            config.state_sigma,
            config.clo_sigma,
            config.poly_sigma,
            config.sample_state,
            config.sample_clo,
            config.sample_poly,
        );
        let dimension = proposer.dimension();
        if dimension == 0 {
            continue;
        }
        if state.prop_sigmas.len() == dimension {
            proposer.prop_sigmas.copy_from_slice(&state.prop_sigmas);
        }

        let mut log_posterior = posterior.log_density(lss, LikelihoodWindow::Fitting);
        if !log_posterior.is_finite() {
            log::warn!("dyad {dyad}: posterior degenerate at round start; skipping update");
            outcome.failures.push(DyadFailure {
                dyad,
                error: CloError::DegeneratePosterior,
            });
            continue;
        }

        if state.accepted_per_coord.len() != dimension {
            state.accepted_per_coord = vec![0; dimension];
        }
        let mut step = MhStep::new();
        let mut best = lss.clone();
        let mut best_lp = log_posterior;
        let mut prev_best_lp = best_lp;
        let max_sweeps = if config.optimize { config.max_sweeps } else { 1 };
        let mut exceeded = false;

        for sweep in 0..max_sweeps {
            for coordinate in 0..dimension {
                proposer.sample_index = coordinate;
                let accepted = step.step(posterior, &mut proposer, lss, &mut log_posterior, &mut rng);
                outcome.proposed += 1;
                if accepted {
                    outcome.accepted += 1;
                    state.accepted_per_coord[coordinate] += 1;
                }
                if log_posterior > best_lp {
                    best_lp = log_posterior;
                    best.clone_from(lss);
                }
            }

            state.total_sweeps += 1;
            if state.total_sweeps.is_multiple_of(BATCH_SIZE) {
                state.nth_batch += 1;
                adapt_proposal_sigmas(
                    &mut proposer,
                    &mut state.accepted_per_coord,
                    state.nth_batch,
                    config.adapt,
                );
            }

            if config.optimize
                && sweep > 0
                && sweep.is_multiple_of(config.check_interval)
            {
                if (best_lp - prev_best_lp).abs() < config.plateau_tolerance {
                    break;
                }
                prev_best_lp = best_lp;
            }

            if started.elapsed().as_secs_f64() > allowance {
                log::warn!("dyad {dyad}: wall-clock allowance exhausted during MH round");
                exceeded = true;
                break;
            }
        }

        if config.optimize {
            lss.clone_from(&best);
            lss.refresh();
            log_posterior = best_lp;
        }

        for _ in 0..config.record_samples {
            for coordinate in 0..dimension {
                proposer.sample_index = coordinate;
                step.step(posterior, &mut proposer, lss, &mut log_posterior, &mut rng);
            }
            let cap = config.record_samples;
            if slice.samples[local].len() < cap {
                let snapshot = lss.clone();
                slice.samples[local].push(snapshot);
            }
            if started.elapsed().as_secs_f64() > allowance {
                exceeded = true;
                break;
            }
        }

        state.prop_sigmas = proposer.prop_sigmas.clone();
        outcome.exceeded_budget |= exceeded;
    }
    outcome
}

fn adapt_proposal_sigmas(
    proposer: &mut LssProposer,
    accepted_per_coord: &mut [usize],
    nth_batch: usize,
    adapt: bool,
) {
    for (coordinate, accepted) in accepted_per_coord.iter_mut().enumerate() {
        let rate = usize_to_f64(*accepted) / usize_to_f64(BATCH_SIZE);
        *accepted = 0;
        let sigma = proposer.prop_sigmas[coordinate];
        if !adapt || nth_batch < WARMUP_BATCHES || sigma <= MIN_PROP_SIGMA || sigma >= MAX_PROP_SIGMA
        {
            continue;
        }
        let delta = (1.0 / usize_to_f64(nth_batch).sqrt()).min(0.01);
        let log_sigma = sigma.ln();
        let next = if rate > TARGET_ACCEPTANCE {
            (log_sigma + delta).exp()
        } else {
            (log_sigma - delta).exp()
        };
        proposer.prop_sigmas[coordinate] = next.clamp(MIN_PROP_SIGMA, MAX_PROP_SIGMA);
    }
}

/// One HMC round over the slice.
#[must_use]
pub fn hmc_round(
    slice: WorkerSlice<'_, '_>,
    config: &HmcRoundConfig,
    adapter: super::adapters::LssStateAdapter,
    tuning: StepSizeTuning,
) -> RoundOutcome {
    let mut outcome = RoundOutcome::default();
    let count = slice.lss.len();
    if count == 0 {
        return outcome;
    }
    let allowance = slice.budget_seconds / usize_to_f64(count);

    for local in 0..count {
        let dyad = slice.first_index + local;
        let started = Instant::now();
        let lss = &mut slice.lss[local];
        let posterior = &slice.posteriors[local];
        let state = &mut slice.states[local];
        let mut rng = dyad_rng(slice.base_seed, dyad);

        lss.refresh();
        let size = adapter.size(lss);
        if size == 0 {
            continue;
        }
        let target = WindowedPosterior {
            posterior,
            window: LikelihoodWindow::Fitting,
        };
        let estimator = FiniteDifferenceGradient::new(&target, &adapter, vec![config.grad_size; size])
            .with_estimated_steps(config.estimate_grad_step);

        let step_size = if state.hmc_step_size > 0.0 {
            state.hmc_step_size
        } else {
            1.0e-3
        };
        let mut step = HmcStep::new(vec![step_size; size], config.leapfrog_steps);

        let mut log_posterior = target.log_density(lss);
        if !log_posterior.is_finite() {
            log::warn!("dyad {dyad}: posterior degenerate at HMC round start; skipping update");
            outcome.failures.push(DyadFailure {
                dyad,
                error: CloError::DegeneratePosterior,
            });
            continue;
        }

        let mut best = lss.clone();
        let mut best_lp = log_posterior;
        let mut prev_best_lp = best_lp;
        let iterations = if config.optimize {
            config.max_iterations
        } else {
            config.iterations
        };
        let mut exceeded = false;

        for iteration in 0..iterations {
            let accepted = step.step(
                &target,
                &adapter,
                &estimator,
                lss,
                &mut log_posterior,
                &mut rng,
            );
            outcome.proposed += 1;
            if accepted {
                outcome.accepted += 1;
            }
            if log_posterior > best_lp {
                best_lp = log_posterior;
                best.clone_from(lss);
            }
            adapt_hmc_step_sizes(&mut step, &mut state.hmc_adapt, tuning, &mut rng);

            if config.optimize
                && iteration > 0
                && iteration.is_multiple_of(tuning.check_interval.max(1) * 5)
            {
                if (best_lp - prev_best_lp).abs() < config.plateau_tolerance {
                    break;
                }
                prev_best_lp = best_lp;
            }
            if started.elapsed().as_secs_f64() > allowance {
                log::warn!("dyad {dyad}: wall-clock allowance exhausted during HMC round");
                exceeded = true;
                break;
            }
        }

        if config.optimize {
            lss.clone_from(&best);
            lss.refresh();
        }
        state.hmc_step_size = step.step_sizes().first().copied().unwrap_or(step_size);
        outcome.exceeded_budget |= exceeded;
    }
    outcome
}

/// One GP-drift round over the slice: init-state and trend sweeps plus
/// prior-proposal MH over each parameter's drifting trajectory (the GP
/// prior term cancels in the acceptance ratio, so the target drops it).
#[must_use]
pub fn drift_round(slice: WorkerSlice<'_, '_>, config: &DriftRoundConfig) -> RoundOutcome {
    let mut outcome = RoundOutcome::default();
    let count = slice.lss.len();
    if count == 0 {
        return outcome;
    }
    let allowance = slice.budget_seconds / usize_to_f64(count);

    for local in 0..count {
        let dyad = slice.first_index + local;
        let started = Instant::now();
        let lss = &mut slice.lss[local];
        let posterior = &slice.posteriors[local];
        let mut rng = dyad_rng(slice.base_seed, dyad);

        // Drift prior cancels against the trajectory proposal density.
        let mut trajectory_target = posterior.clone();
        trajectory_target.terms.drift_prior = false;

        lss.refresh();
        let mut log_posterior = posterior.log_density(lss, LikelihoodWindow::Fitting);
        if !log_posterior.is_finite() {
            log::warn!("dyad {dyad}: posterior degenerate at drift round start; skipping update");
            outcome.failures.push(DyadFailure {
                dyad,
                error: CloError::DegeneratePosterior,
            });
            continue;
        }

        let mut proposer = LssProposer::new(
            lss,
            config.state_sigma,
            0.0,
            config.poly_sigma,
            config.sample_state,
            false,
            config.sample_poly,
        );
        let sweep_dimension = proposer.dimension();
        let mut step = MhStep::new();

        let total_iterations = config.burn_iterations + config.sample_iterations;
        let mut exceeded = false;
        for iteration in 0..total_iterations {
            for coordinate in 0..sweep_dimension {
                proposer.sample_index = coordinate;
                let accepted =
                    step.step(posterior, &mut proposer, lss, &mut log_posterior, &mut rng);
                outcome.proposed += 1;
                outcome.accepted += usize::from(accepted);
            }

            let clo_count = if lss.ignore_clo() {
                0
            } else {
                lss.oscillators()[0].num_params()
            };
            for param in 0..clo_count {
                let (accepted, next_lp) = propose_trajectory(
                    lss,
                    &trajectory_target,
                    param,
                    config.control_point_spacing,
                    &mut rng,
                );
                outcome.proposed += 1;
                if accepted {
                    outcome.accepted += 1;
                    log_posterior = next_lp + lss.log_drift_prior();
                }
            }

            if iteration >= config.burn_iterations
                && config.record_samples > 0
                && slice.samples[local].len() < config.record_samples
            {
                let snapshot = lss.clone();
                slice.samples[local].push(snapshot);
            }

            if started.elapsed().as_secs_f64() > allowance {
                log::warn!("dyad {dyad}: wall-clock allowance exhausted during drift round");
                exceeded = true;
                break;
            }
        }
        outcome.exceeded_budget |= exceeded;
    }
    outcome
}

/// Prior-proposal MH move for one drifting parameter trajectory: the GP
/// is sampled at control points every `spacing` intervals and linearly
/// interpolated between them.
fn propose_trajectory(
    lss: &mut LinearStateSpace,
    target: &DyadPosterior<'_>,
    param: usize,
    spacing: usize,
    rng: &mut StdRng,
) -> (bool, f64) {
    let intervals = lss.oscillators().len();
    let mean = lss.param_means().get(param).copied().unwrap_or(0.0);
    let scale = lss.gp_scales().get(param).copied().unwrap_or(1.0);
    let sigvar = lss.gp_sigvars().get(param).copied().unwrap_or(1.0);

    let mut control_points: Vec<usize> = (0..intervals).step_by(spacing.max(1)).collect();
    if control_points.last() != Some(&(intervals - 1)) {
        control_points.push(intervals - 1);
    }
    let controls = control_points.len();

    let kernel = faer::Mat::from_fn(controls, controls, |i, j| {
        let distance = usize_to_f64(control_points[i].abs_diff(control_points[j]))
            / scale.max(f64::MIN_POSITIVE);
        let value = sigvar * (-0.5 * distance * distance).exp();
        if i == j {
            value + GP_PROPOSAL_JITTER
        } else {
            value
        }
    });
    let Some(lower) = cholesky_lower(&kernel) else {
        return (false, f64::NEG_INFINITY);
    };

    let noise: Vec<f64> = (0..controls).map(|_| sample_standard_normal(rng)).collect();
    let mut control_values = vec![mean; controls];
    for i in 0..controls {
        for j in 0..=i {
            control_values[i] += lower[(i, j)] * noise[j];
        }
    }

    let mut trajectory = vec![mean; intervals];
    for (index, segment) in control_points.windows(2).enumerate() {
        let (left, right) = (segment[0], segment[1]);
        let span = usize_to_f64(right - left).max(1.0);
        for interval in left..=right {
            let weight = usize_to_f64(interval - left) / span;
            trajectory[interval] =
                (1.0 - weight).mul_add(control_values[index], weight * control_values[index + 1]);
        }
    }
    if controls == 1 {
        trajectory[0] = control_values[0];
    }

    let current: Vec<f64> = lss
        .oscillators()
        .iter()
        .map(|oscillator| oscillator.param(param))
        .collect();
    let current_lp = target.log_density(lss, LikelihoodWindow::Fitting);

    for (interval, value) in trajectory.iter().enumerate() {
        lss.set_clo_param(interval, param, *value);
    }
    lss.refresh();
    let candidate_lp = if lss.has_valid_params() {
        target.log_density(lss, LikelihoodWindow::Fitting)
    } else {
        f64::NEG_INFINITY
    };

    if candidate_lp.is_finite() && should_accept(candidate_lp - current_lp, rng) {
        (true, candidate_lp)
    } else {
        for (interval, value) in current.iter().enumerate() {
            lss.set_clo_param(interval, param, *value);
        }
        lss.refresh();
        (false, current_lp)
    }
}

/// Dispatch a round across the worker pool with a static contiguous
/// partition. Slice disjointness is enforced by `chunks_mut`.
pub fn run_parallel_round<F>(
    lss_vec: &mut [LinearStateSpace],
    posteriors: &[DyadPosterior<'_>],
    samples: &mut [Vec<LinearStateSpace>],
    states: &mut [DyadSamplerState],
    threads: usize,
    budget_seconds: f64,
    base_seed: u64,
    round: F,
) -> RoundOutcome
where
    F: Fn(WorkerSlice<'_, '_>) -> RoundOutcome + Sync,
{
    let total = lss_vec.len();
    if total == 0 {
        return RoundOutcome::default();
    }
    let threads = effective_threads(threads, total);
    if threads <= 1 {
        return round(WorkerSlice {
            lss: lss_vec,
            posteriors,
            samples,
            states,
            first_index: 0,
            budget_seconds,
            base_seed,
        });
    }

    let chunk = total.div_ceil(threads);
    let mut outcome = RoundOutcome::default();
    let results: Vec<Option<RoundOutcome>> = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(threads);
        let round = &round;
        for (slice_index, ((lss_chunk, posterior_chunk), (sample_chunk, state_chunk))) in lss_vec
            .chunks_mut(chunk)
            .zip(posteriors.chunks(chunk))
            .zip(samples.chunks_mut(chunk).zip(states.chunks_mut(chunk)))
            .enumerate()
        {
            let first_index = slice_index * chunk;
            let share = budget_seconds * usize_to_f64(lss_chunk.len()) / usize_to_f64(total);
            handles.push(scope.spawn(move || {
                round(WorkerSlice {
                    lss: lss_chunk,
                    posteriors: posterior_chunk,
                    samples: sample_chunk,
                    states: state_chunk,
                    first_index,
                    budget_seconds: share,
                    base_seed,
                })
            }));
        }
        handles
            .into_iter()
            .map(|handle| handle.join().ok())
            .collect()
    });

    for (slice_index, result) in results.into_iter().enumerate() {
        if let Some(part) = result {
            outcome.merge(part);
        } else {
            log::error!("worker thread for slice {slice_index} terminated abnormally");
            outcome.failures.push(DyadFailure {
                dyad: slice_index * chunk,
                error: CloError::DegeneratePosterior,
            });
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use crate::input::dyad::DyadData;
    use crate::models::clo::likelihood::Likelihood;
    use crate::models::clo::oscillator::CoupledOscillator;
    use crate::models::clo::posterior::PosteriorTerms;
    use crate::models::clo::priors::InitStatePrior;

    use super::*;

    fn fixtures(n: usize) -> (Vec<DyadData>, Vec<LinearStateSpace>) {
        let times: Vec<f64> = (0..12).map(|t| f64::from(t) * 0.25).collect();
        let mut data = Vec::new();
        let mut models = Vec::new();
        for dyad in 0..n {
            let phase = 0.1 * usize_to_f64(dyad);
            let series: Vec<Vec<f64>> = (0..2)
                .map(|member| {
                    times
                        .iter()
                        .map(|t| (t + phase).sin() * if member == 0 { 1.0 } else { -1.0 })
                        .collect()
                })
                .collect();
            data.push(
                DyadData::new(u64::try_from(dyad).unwrap_or(0), times.clone())
                    .with_observable("dial", series),
            );
            let mut lss = LinearStateSpace::new(
                times.clone(),
                vec![0.0, 0.0, 1.0, -1.0],
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

    fn posteriors<'a>(data: &'a [DyadData]) -> Vec<DyadPosterior<'a>> {
        data.iter()
            .map(|dyad| {
                DyadPosterior::new(
                    Likelihood::new(dyad, 12, 4),
                    InitStatePrior::new(0.0, 1.0).expect("positive sigma"),
                    PosteriorTerms {
                        dyad_prior: false,
                        ..PosteriorTerms::default()
                    },
                )
            })
            .collect()
    }

    fn mh_config() -> MhRoundConfig {
        MhRoundConfig {
            sample_state: true,
            sample_clo: true,
            sample_poly: false,
            state_sigma: 0.1,
            clo_sigma: 0.05,
            poly_sigma: 0.05,
            adapt: false,
            optimize: false,
            max_sweeps: 1,
            check_interval: 100,
            plateau_tolerance: 0.1,
            record_samples: 0,
        }
    }

    #[test]
    fn single_and_multi_threaded_rounds_agree() {
        let (data, models) = fixtures(6);
        let posteriors = posteriors(&data);

        let mut models_sequential = models.clone();
        let mut models_parallel = models;
        let mut samples_a = vec![Vec::new(); 6];
        let mut samples_b = vec![Vec::new(); 6];
        let mut states_a = vec![DyadSamplerState::default(); 6];
        let mut states_b = vec![DyadSamplerState::default(); 6];
        let config = mh_config();

        let outcome_a = run_parallel_round(
            &mut models_sequential,
            &posteriors,
            &mut samples_a,
            &mut states_a,
            1,
            1.0e6,
            99,
            |slice| mh_round(slice, &config),
        );
        let outcome_b = run_parallel_round(
            &mut models_parallel,
            &posteriors,
            &mut samples_b,
            &mut states_b,
            3,
            1.0e6,
            99,
            |slice| mh_round(slice, &config),
        );

        assert_eq!(outcome_a.proposed, outcome_b.proposed);
        for (a, b) in models_sequential.iter().zip(&models_parallel) {
            for index in 0..8 {
                assert!(
                    (a.oscillators()[0].param(index) - b.oscillators()[0].param(index)).abs()
                        < 1.0e-14
                );
            }
            for index in 0..4 {
                assert!((a.init_state()[index] - b.init_state()[index]).abs() < 1.0e-14);
            }
        }
    }

    #[test]
    fn tiny_budget_sets_exceeded_flag_without_crashing() {
        let (data, mut models) = fixtures(2);
        let posteriors = posteriors(&data);
        let mut samples = vec![Vec::new(); 2];
        let mut states = vec![DyadSamplerState::default(); 2];
        let config = MhRoundConfig {
            optimize: true,
            max_sweeps: 1_000_000,
            ..mh_config()
        };
        let outcome = run_parallel_round(
            &mut models,
            &posteriors,
            &mut samples,
            &mut states,
            1,
            1.0e-9,
            7,
            |slice| mh_round(slice, &config),
        );
        assert!(outcome.exceeded_budget);
    }

    #[test]
    fn failed_dyads_keep_their_previous_state() {
        let (data, mut models) = fixtures(2);
        // Force dyad 1 into a degenerate posterior with a zero noise sigma.
        models[1].set_noise_sigmas(vec![0.0]);
        models[1].refresh();
        let reference = models[1].clone();
        let posteriors = posteriors(&data);
        let mut samples = vec![Vec::new(); 2];
        let mut states = vec![DyadSamplerState::default(); 2];
        let config = mh_config();
        let outcome = run_parallel_round(
            &mut models,
            &posteriors,
            &mut samples,
            &mut states,
            1,
            1.0e6,
            5,
            |slice| mh_round(slice, &config),
        );
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].dyad, 1);
        assert_eq!(models[1].init_state(), reference.init_state());
        // Dyad 0 still advanced.
        assert!(outcome.proposed > 0);
    }
}
