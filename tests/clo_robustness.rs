//! Robustness properties: thread-count determinism, wall-clock budgets,
//! convergence, and degraded-mode sampling paths.

use coupled_oscillator_models::{
    CloExperimentConfig, DataOptions, DyadData, ModelOptions, NoiseOptions, NoiseSampleKind,
    RunOptions, TerminationReason, fit_clo_population,
};

fn synthetic_population(num_dyads: usize, points: usize) -> (Vec<DyadData>, Vec<u64>) {
    let times: Vec<f64> = (0..points)
        .map(|t| f64::from(u32::try_from(t).unwrap()) * 0.25)
        .collect();
    let mut data = Vec::new();
    let mut ids = Vec::new();
    for dyad in 0..num_dyads {
        let phase = 0.3 * f64::from(u32::try_from(dyad).unwrap());
        let series: Vec<Vec<f64>> = (0..2)
            .map(|member| {
                times
                    .iter()
                    .map(|t| {
                        let sign = if member == 0 { 1.0 } else { -1.0 };
                        sign * (1.4 * t + phase).cos()
                    })
                    .collect()
            })
            .collect();
        let id = u64::try_from(dyad + 10).unwrap();
        data.push(DyadData::new(id, times.clone()).with_observable("dial", series));
        ids.push(id);
    }
    (data, ids)
}

fn base_config(iterations: usize, threads: usize) -> CloExperimentConfig {
    CloExperimentConfig {
        data: DataOptions {
            training_fraction: 0.8,
            ..DataOptions::default()
        },
        run: RunOptions {
            num_iterations: iterations,
            converge_window: 10_000,
            threads,
            time_budget_minutes: 10.0,
            seed: 2024,
            ..RunOptions::default()
        },
        ..CloExperimentConfig::default()
    }
}

#[test]
fn training_is_deterministic_across_thread_counts() {
    let (data, ids) = synthetic_population(6, 12);

    let (best_single, report_single) =
        fit_clo_population(&data, &ids, base_config(5, 1)).expect("training runs");
    let (best_multi, report_multi) =
        fit_clo_population(&data, &ids, base_config(5, 4)).expect("training runs");

    assert!(
        (report_single.best_log_posterior - report_multi.best_log_posterior).abs() < 1.0e-9,
        "best posterior depends on thread count"
    );
    for (lss_a, lss_b) in best_single.lss_vec().iter().zip(best_multi.lss_vec()) {
        for index in 0..8 {
            assert!(
                (lss_a.oscillators()[0].param(index) - lss_b.oscillators()[0].param(index)).abs()
                    < 1.0e-12,
                "per-dyad parameters depend on thread count"
            );
        }
        for index in 0..4 {
            assert!(
                (lss_a.init_state()[index] - lss_b.init_state()[index]).abs() < 1.0e-12,
                "per-dyad states depend on thread count"
            );
        }
    }
}

#[test]
fn tiny_wall_clock_budget_still_yields_a_snapshot() {
    let (data, ids) = synthetic_population(3, 15);
    let mut config = base_config(100_000, 2);
    config.run.time_budget_minutes = 1.0e-5;
    let started = std::time::Instant::now();
    let (best, report) = fit_clo_population(&data, &ids, config).expect("training runs");
    assert!(started.elapsed().as_secs_f64() < 60.0);
    assert_eq!(report.termination, TerminationReason::TimeBudgetExceeded);
    assert_eq!(best.num_dyads(), 3);
    assert!(report.best_log_posterior.is_finite());
}

#[test]
fn plateaued_posterior_stops_before_the_iteration_cap() {
    let (data, ids) = synthetic_population(2, 10);
    let mut config = base_config(400, 1);
    config.run.converge_window = 4;
    config.run.converge_threshold = 1.0e12;
    let (_, report) = fit_clo_population(&data, &ids, config).expect("training runs");
    assert_eq!(report.termination, TerminationReason::Converged);
    assert!(report.iterations_completed < 400);
}

#[test]
fn gibbs_noise_sampling_keeps_sigmas_positive() {
    let (data, ids) = synthetic_population(2, 12);
    let mut config = base_config(4, 1);
    config.noise = NoiseOptions {
        sample_noise_sigma: true,
        approach: NoiseSampleKind::Gibbs,
        ..NoiseOptions::default()
    };
    let (best, _) = fit_clo_population(&data, &ids, config).expect("training runs");
    for sigma in best.noise_sigmas() {
        assert!(*sigma > 0.0 && sigma.is_finite());
    }
}

#[test]
fn drifting_dynamics_run_end_to_end() {
    let (data, ids) = synthetic_population(2, 10);
    let mut config = base_config(2, 1);
    config.model = ModelOptions {
        allow_drift: true,
        ..ModelOptions::default()
    };
    config.drift.burn_iterations = 1;
    config.drift.sample_iterations = 2;
    let (best, report) = fit_clo_population(&data, &ids, config).expect("training runs");
    assert!(report.best_log_posterior.is_finite());
    // Each training interval carries its own oscillator when drifting.
    assert!(best.lss_vec()[0].oscillators().len() > 1);
}

#[test]
fn polynomial_trend_block_is_sampled() {
    let (data, ids) = synthetic_population(2, 12);
    let mut config = base_config(4, 1);
    config.model = ModelOptions {
        polynomial_degree: Some(1),
        ..ModelOptions::default()
    };
    let (best, report) = fit_clo_population(&data, &ids, config).expect("training runs");
    assert!(report.best_log_posterior.is_finite());
    assert_eq!(best.lss_vec()[0].poly_coefs().len(), 2);
}
