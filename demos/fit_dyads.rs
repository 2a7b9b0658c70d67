//! Fit a small synthetic dyad population and print error summaries.
//!
//! ```text
//! cargo run --example fit_dyads
//! ```

use coupled_oscillator_models::{
    CloExperimentConfig, DataOptions, DyadData, RunOptions, compute_ave_error,
    fit_clo_population, render_error_table,
};

fn main() {
    let times: Vec<f64> = (0..24_u32).map(|t| f64::from(t) * 0.25).collect();
    let mut data = Vec::new();
    let mut ids = Vec::new();
    for dyad in 0..4_u32 {
        let phase = 0.5 * f64::from(dyad);
        let series: Vec<Vec<f64>> = (0..2)
            .map(|member| {
                times
                    .iter()
                    .map(|t| {
                        let sign = if member == 0 { 1.0 } else { -0.7 };
                        sign * (1.3 * t + phase).sin()
                    })
                    .collect()
            })
            .collect();
        data.push(DyadData::new(u64::from(dyad + 1), times.clone()).with_observable("dial", series));
        ids.push(u64::from(dyad + 1));
    }

    let config = CloExperimentConfig {
        data: DataOptions {
            training_fraction: 0.8,
            ..DataOptions::default()
        },
        run: RunOptions {
            num_iterations: 40,
            threads: 2,
            time_budget_minutes: 2.0,
            ..RunOptions::default()
        },
        ..CloExperimentConfig::default()
    };

    match fit_clo_population(&data, &ids, config) {
        Ok((best, report)) => {
            println!(
                "finished after {} iterations ({:?}), best log posterior {:.3}",
                report.iterations_completed, report.termination, report.best_log_posterior
            );
            let errors: Vec<Vec<f64>> = data
                .iter()
                .zip(best.lss_vec())
                .map(|(dyad, lss)| compute_ave_error(dyad, lss, 0.8))
                .collect();
            println!("{}", render_error_table(&ids, &errors, 2));
        }
        Err(error) => eprintln!("fit failed: {error}"),
    }
}
