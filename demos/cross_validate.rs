//! Cross-validate a synthetic population across dyad folds.
//!
//! ```text
//! cargo run --example cross_validate
//! ```

use coupled_oscillator_models::{
    CloExperimentConfig, CrossValidationOptions, DataOptions, DyadData, RunOptions,
    cross_validate,
};

fn main() {
    let times: Vec<f64> = (0..20_u32).map(|t| f64::from(t) * 0.3).collect();
    let mut data = Vec::new();
    let mut ids = Vec::new();
    for dyad in 0..6_u32 {
        let phase = 0.35 * f64::from(dyad);
        let series: Vec<Vec<f64>> = (0..2)
            .map(|member| {
                times
                    .iter()
                    .map(|t| {
                        let sign = if member == 0 { 1.0 } else { -1.0 };
                        sign * (1.1 * t + phase).sin()
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
            num_iterations: 15,
            threads: 2,
            time_budget_minutes: 2.0,
            ..RunOptions::default()
        },
        ..CloExperimentConfig::default()
    };
    let options = CrossValidationOptions {
        folds: 3,
        parallel_folds: false,
        test_iterations: 5,
    };

    match cross_validate(&data, &ids, &config, &options) {
        Ok(report) => {
            for fold in &report.folds {
                println!(
                    "fold {}: train lp {:.3}, held-out errors {:?}",
                    fold.fold, fold.train_report.best_log_posterior, fold.holdout_errors
                );
            }
            println!("mean held-out errors: {:?}", report.mean_errors);
        }
        Err(error) => eprintln!("cross-validation failed: {error}"),
    }
}
