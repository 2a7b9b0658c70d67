//! Fitting- and prediction-window error summaries, baseline comparators,
//! and report rendering.

use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use crate::input::dyad::{DyadData, is_missing};
use crate::preprocess::training_length;
use crate::utils::usize_to_f64;

use super::population::LssSet;
use super::state_space::LinearStateSpace;

/// Trivial comparator models fitted per member on the training window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineKind {
    /// Constant at the training mean.
    Average,
    /// Least-squares line over the training window.
    Line,
}

/// Per-observable RMS errors for one dyad: `[fit per member..,
/// predict per member..]`, one vector per observable.
///
/// The model is clone-extended to the dyad's full horizon before
/// evaluation, so prediction errors cover the held-out tail.
#[must_use]
pub fn compute_error(
    data: &DyadData,
    lss: &LinearStateSpace,
    train_fraction: f64,
) -> Vec<Vec<f64>> {
    let mut extended = lss.clone();
    extended.extend_times(data.times.clone());
    extended.refresh();

    let members = extended.num_oscillators();
    let train_len = training_length(data.times.len(), train_fraction);
    let mut errors = Vec::with_capacity(extended.obs_names().len());
    for (observable, name) in extended.obs_names().iter().enumerate() {
        let Ok(series) = data.observable(name) else {
            continue;
        };
        let mut row = vec![0.0; 2 * members];
        for (member, values) in series.iter().enumerate() {
            row[member] = window_rms(&extended, values, observable, member, 0, train_len);
            row[members + member] =
                window_rms(&extended, values, observable, member, train_len, values.len());
        }
        errors.push(row);
    }
    errors
}

fn window_rms(
    lss: &LinearStateSpace,
    observed: &[f64],
    observable: usize,
    member: usize,
    start: usize,
    end: usize,
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0_usize;
    for time_index in start..end.min(lss.times().len()) {
        let value = observed[time_index];
        if is_missing(value) {
            continue;
        }
        let residual = value - lss.predicted_observable(observable, member, time_index);
        sum += residual * residual;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / usize_to_f64(count)).sqrt()
    }
}

/// Average the per-observable errors of one dyad into a single
/// `[fit per member.., predict per member..]` vector.
#[must_use]
pub fn compute_ave_error(
    data: &DyadData,
    lss: &LinearStateSpace,
    train_fraction: f64,
) -> Vec<f64> {
    average_rows(&compute_error(data, lss, train_fraction))
}

/// Population-level average error across every dyad.
#[must_use]
pub fn compute_population_error(
    data: &[DyadData],
    set: &LssSet,
    train_fraction: f64,
) -> Vec<f64> {
    let rows: Vec<Vec<f64>> = data
        .iter()
        .zip(set.lss_vec())
        .map(|(dyad, lss)| compute_ave_error(dyad, lss, train_fraction))
        .collect();
    average_rows(&rows)
}

/// Average error of a list of sampled models for one dyad.
#[must_use]
pub fn compute_sample_error(
    data: &DyadData,
    samples: &[LinearStateSpace],
    train_fraction: f64,
) -> Vec<f64> {
    let rows: Vec<Vec<f64>> = samples
        .iter()
        .map(|lss| compute_ave_error(data, lss, train_fraction))
        .collect();
    average_rows(&rows)
}

fn average_rows(rows: &[Vec<f64>]) -> Vec<f64> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let mut total = vec![0.0; first.len()];
    for row in rows {
        for (slot, value) in total.iter_mut().zip(row) {
            *slot += value;
        }
    }
    for slot in &mut total {
        *slot /= usize_to_f64(rows.len());
    }
    total
}

/// RMS errors of a trivial per-member baseline, in the same layout as
/// `compute_ave_error`.
#[must_use]
pub fn baseline_error(data: &DyadData, kind: BaselineKind, train_fraction: f64) -> Vec<f64> {
    let members = data.num_members();
    let train_len = training_length(data.times.len(), train_fraction);
    let mut rows = Vec::new();
    for series in data.observables.values() {
        let mut row = vec![0.0; 2 * members];
        for (member, values) in series.iter().enumerate() {
            let predict = fit_baseline(&data.times[..train_len], &values[..train_len], kind);
            row[member] = baseline_window_rms(&data.times, values, &predict, 0, train_len);
            row[members + member] =
                baseline_window_rms(&data.times, values, &predict, train_len, values.len());
        }
        rows.push(row);
    }
    average_rows(&rows)
}

fn fit_baseline(times: &[f64], values: &[f64], kind: BaselineKind) -> (f64, f64) {
    let kept: Vec<(f64, f64)> = times
        .iter()
        .zip(values)
        .filter(|(_, v)| !is_missing(**v))
        .map(|(t, v)| (*t, *v))
        .collect();
    if kept.is_empty() {
        return (0.0, 0.0);
    }
    let n = usize_to_f64(kept.len());
    let mean_t: f64 = kept.iter().map(|(t, _)| t).sum::<f64>() / n;
    let mean_y: f64 = kept.iter().map(|(_, y)| y).sum::<f64>() / n;
    match kind {
        BaselineKind::Average => (mean_y, 0.0),
        BaselineKind::Line => {
            let mut cov = 0.0;
            let mut var = 0.0;
            for (t, y) in &kept {
                cov += (t - mean_t) * (y - mean_y);
                var += (t - mean_t) * (t - mean_t);
            }
            let slope = if var > 0.0 { cov / var } else { 0.0 };
            (slope.mul_add(-mean_t, mean_y), slope)
        }
    }
}

fn baseline_window_rms(
    times: &[f64],
    values: &[f64],
    line: &(f64, f64),
    start: usize,
    end: usize,
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0_usize;
    for index in start..end {
        if is_missing(values[index]) {
            continue;
        }
        let predicted = line.1.mul_add(times[index], line.0);
        let residual = values[index] - predicted;
        sum += residual * residual;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / usize_to_f64(count)).sqrt()
    }
}

/// Write one `rms_error.txt` per dyad directory: the dyad id followed by
/// the fitting-then-prediction RMS values.
///
/// # Errors
///
/// Returns `CheckpointError` on I/O failure.
pub fn write_error_files(
    dir: &std::path::Path,
    ids: &[u64],
    errors: &[Vec<f64>],
) -> Result<(), super::checkpoint::CheckpointError> {
    use std::fmt::Write as _;

    for (id, row) in ids.iter().zip(errors) {
        let sub_dir = super::checkpoint::dyad_dir(dir, *id);
        std::fs::create_dir_all(&sub_dir).map_err(|source| {
            super::checkpoint::CheckpointError::Io {
                path: sub_dir.clone(),
                source,
            }
        })?;
        let mut line = format!("{id}");
        for value in row {
            let _ = write!(line, " {value:.8e}");
        }
        line.push('\n');
        let path = sub_dir.join("rms_error.txt");
        std::fs::write(&path, line)
            .map_err(|source| super::checkpoint::CheckpointError::Io { path, source })?;
    }
    Ok(())
}

/// Render per-dyad errors as a table: one row per dyad, fitting then
/// prediction RMS per member.
#[must_use]
pub fn render_error_table(ids: &[u64], errors: &[Vec<f64>], members: usize) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    let mut header = vec![Cell::new("dyad")];
    for member in 0..members {
        header.push(Cell::new(format!("fit m{member}")));
    }
    for member in 0..members {
        header.push(Cell::new(format!("pred m{member}")));
    }
    table.set_header(header);
    for (id, row) in ids.iter().zip(errors) {
        let mut cells = vec![Cell::new(id.to_string())];
        for value in row {
            cells.push(Cell::new(format!("{value:.4}")));
        }
        table.add_row(cells);
    }
    table
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::models::clo::oscillator::CoupledOscillator;

    use super::*;

    fn flat_dyad() -> DyadData {
        let times: Vec<f64> = (0..10).map(f64::from).collect();
        DyadData::new(3, times).with_observable("dial", vec![vec![1.0; 10], vec![-1.0; 10]])
    }

    #[test]
    fn average_baseline_is_exact_on_constant_data() {
        let errors = baseline_error(&flat_dyad(), BaselineKind::Average, 0.8);
        for value in errors {
            assert_relative_eq!(value, 0.0, epsilon = 1.0e-12);
        }
    }

    #[test]
    fn line_baseline_is_exact_on_linear_data() {
        let times: Vec<f64> = (0..10).map(f64::from).collect();
        let series: Vec<f64> = times.iter().map(|t| 2.0_f64.mul_add(*t, 1.0)).collect();
        let data =
            DyadData::new(4, times).with_observable("dial", vec![series.clone(), series]);
        let errors = baseline_error(&data, BaselineKind::Line, 0.8);
        for value in errors {
            assert_relative_eq!(value, 0.0, epsilon = 1.0e-9);
        }
    }

    #[test]
    fn error_vector_has_fit_and_prediction_halves() {
        let data = flat_dyad();
        let mut lss = LinearStateSpace::new(
            data.times[..8].to_vec(),
            vec![1.0, -1.0, 0.0, 0.0],
            vec![CoupledOscillator::new(2, 5.0, 0.0)],
            vec!["dial".to_owned()],
            vec![0.5],
            None,
            false,
            0,
        );
        lss.refresh();
        let errors = compute_ave_error(&data, &lss, 0.8);
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn table_lists_every_dyad() {
        let table = render_error_table(&[17, 29], &[vec![0.1; 4], vec![0.2; 4]], 2);
        let rendered = table.to_string();
        assert!(rendered.contains("17"));
        assert!(rendered.contains("29"));
        assert!(rendered.contains("pred m1"));
    }
}
