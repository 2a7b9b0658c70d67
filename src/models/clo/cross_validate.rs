//! K-fold cross-validation over dyads: train the population on each
//! fold's complement, re-fit only per-dyad parameters on the held-out
//! dyads with the trained shared parameters frozen, and aggregate the
//! error vectors.

use crate::input::dyad::DyadData;
use crate::utils::usize_to_f64;

use super::diagnostics::compute_population_error;
use super::posterior::effective_threads;
use super::sampler::PopulationSampler;
use super::types::{CloError, CloExperimentConfig, TrainReport};

/// Cross-validation controls.
#[derive(Debug, Clone)]
pub struct CrossValidationOptions {
    pub folds: usize,
    /// Run folds on their own threads (each fold still gets the
    /// configured per-fold worker pool).
    pub parallel_folds: bool,
    /// Held-out per-dyad refit iterations per fold.
    pub test_iterations: usize,
}

impl Default for CrossValidationOptions {
    fn default() -> Self {
        Self {
            folds: 5,
            parallel_folds: false,
            test_iterations: 10,
        }
    }
}

/// One fold's outcome.
#[derive(Debug, Clone)]
pub struct FoldResult {
    pub fold: usize,
    pub train_report: TrainReport,
    pub test_report: TrainReport,
    /// Held-out error vector: fitting then prediction halves per member.
    pub holdout_errors: Vec<f64>,
}

/// Aggregated cross-validation report.
#[derive(Debug, Clone)]
pub struct CrossValidationReport {
    pub folds: Vec<FoldResult>,
    /// Mean held-out error vector across folds.
    pub mean_errors: Vec<f64>,
}

/// Round-robin fold assignment by dyad index.
#[must_use]
pub fn fold_assignments(num_dyads: usize, folds: usize) -> Vec<usize> {
    (0..num_dyads).map(|dyad| dyad % folds.max(1)).collect()
}

/// Run K-fold cross-validation.
///
/// # Errors
///
/// Returns `CloError::InvalidFoldCount` for unusable fold counts, or any
/// training error from a fold.
pub fn cross_validate(
    data: &[DyadData],
    ids: &[u64],
    config: &CloExperimentConfig,
    options: &CrossValidationOptions,
) -> Result<CrossValidationReport, CloError> {
    if options.folds < 2 || data.len() < options.folds {
        return Err(CloError::InvalidFoldCount);
    }
    if ids.len() != data.len() {
        return Err(CloError::IdDataMismatch {
            ids: ids.len(),
            data: data.len(),
        });
    }

    let assignments = fold_assignments(data.len(), options.folds);
    let fold_indices: Vec<usize> = (0..options.folds).collect();

    let run_fold = |fold: usize| -> Result<FoldResult, CloError> {
        let mut train_data = Vec::new();
        let mut train_ids = Vec::new();
        let mut test_data = Vec::new();
        let mut test_ids = Vec::new();
        for (index, assignment) in assignments.iter().enumerate() {
            if *assignment == fold {
                test_data.push(data[index].clone());
                test_ids.push(ids[index]);
            } else {
                train_data.push(data[index].clone());
                train_ids.push(ids[index]);
            }
        }

        let mut fold_config = config.clone();
        if let Some(dir) = &config.run.output_dir {
            fold_config.run.output_dir = Some(dir.join(format!("fold_{fold:02}")));
        }

        let mut trainer = PopulationSampler::new(&train_data, &train_ids, fold_config.clone())?;
        let (trained, train_report) = trainer.train()?;

        let mut tester = PopulationSampler::new(&test_data, &test_ids, fold_config)?;
        tester.adopt_shared_params(&trained);
        let (held_out_best, test_report) = tester.test(options.test_iterations)?;
        let holdout_errors = compute_population_error(
            &test_data,
            &held_out_best,
            config.data.training_fraction,
        );

        Ok(FoldResult {
            fold,
            train_report,
            test_report,
            holdout_errors,
        })
    };

    let mut folds = Vec::with_capacity(options.folds);
    if options.parallel_folds {
        let workers = effective_threads(options.folds, options.folds);
        let mut results: Vec<Option<Result<FoldResult, CloError>>> = Vec::new();
        for _ in 0..options.folds {
            results.push(None);
        }
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for chunk in fold_indices.chunks(options.folds.div_ceil(workers)) {
                let run_fold = &run_fold;
                handles.push(scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|fold| (*fold, run_fold(*fold)))
                        .collect::<Vec<_>>()
                }));
            }
            for handle in handles {
                if let Ok(parts) = handle.join() {
                    for (fold, result) in parts {
                        results[fold] = Some(result);
                    }
                }
            }
        });
        for result in results {
            match result {
                Some(Ok(fold_result)) => folds.push(fold_result),
                Some(Err(error)) => return Err(error),
                None => return Err(CloError::DegeneratePosterior),
            }
        }
    } else {
        for fold in fold_indices {
            folds.push(run_fold(fold)?);
        }
    }

    let mean_errors = mean_rows(folds.iter().map(|fold| fold.holdout_errors.clone()));
    Ok(CrossValidationReport { folds, mean_errors })
}

fn mean_rows<I>(rows: I) -> Vec<f64>
where
    I: IntoIterator<Item = Vec<f64>>,
{
    let mut total: Vec<f64> = Vec::new();
    let mut count = 0_usize;
    for row in rows {
        if total.is_empty() {
            total = vec![0.0; row.len()];
        }
        for (slot, value) in total.iter_mut().zip(&row) {
            *slot += value;
        }
        count += 1;
    }
    for slot in &mut total {
        *slot /= usize_to_f64(count.max(1));
    }
    total
}
