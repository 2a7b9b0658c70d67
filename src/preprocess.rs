//! Pre-processing of dyadic time series: standardization, Gaussian
//! smoothing, and initial-state estimation for sampler seeding.

use num_traits::ToPrimitive;

use crate::input::dyad::{DyadData, DyadInputError, is_missing};
use crate::utils::usize_to_f64;

/// Per-member mean and standard deviation of one observable.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableStats {
    pub means: Vec<f64>,
    pub std_devs: Vec<f64>,
}

/// Compute per-member statistics for `name`, skipping missing points.
///
/// # Errors
///
/// Returns `DyadInputError::UnknownObservable` if the observable is absent.
pub fn observable_stats(data: &DyadData, name: &str) -> Result<ObservableStats, DyadInputError> {
    let series = data.observable(name)?;
    let mut means = Vec::with_capacity(series.len());
    let mut std_devs = Vec::with_capacity(series.len());
    for values in series {
        let kept: Vec<f64> = values.iter().copied().filter(|v| !is_missing(*v)).collect();
        let n = usize_to_f64(kept.len()).max(1.0);
        let mean = kept.iter().sum::<f64>() / n;
        let variance = kept
            .iter()
            .map(|value| {
                let centered = value - mean;
                centered * centered
            })
            .sum::<f64>()
            / n;
        means.push(mean);
        std_devs.push(variance.sqrt());
    }
    Ok(ObservableStats { means, std_devs })
}

/// Standardize one observable in place to zero mean and unit deviation per
/// member. Missing points are left untouched.
///
/// # Errors
///
/// Returns `DyadInputError::UnknownObservable` if the observable is absent.
pub fn standardize_observable(
    data: &mut DyadData,
    name: &str,
) -> Result<ObservableStats, DyadInputError> {
    let stats = observable_stats(data, name)?;
    let series = data
        .observables
        .get_mut(name)
        .ok_or_else(|| DyadInputError::UnknownObservable {
            id: data.id,
            name: name.to_owned(),
        })?;
    for (member, values) in series.iter_mut().enumerate() {
        let std_dev = stats.std_devs[member].max(f64::EPSILON);
        for value in values.iter_mut() {
            if !is_missing(*value) {
                *value = (*value - stats.means[member]) / std_dev;
            }
        }
    }
    Ok(stats)
}

/// Smooth every observable of a dyad with a truncated Gaussian kernel of
/// the given half-width (in samples) and bandwidth `sigma`. Missing points
/// neither receive nor contribute weight.
#[must_use]
pub fn smooth_data(data: &DyadData, half_width: usize, sigma: f64) -> DyadData {
    let mut smoothed = data.clone();
    for series in smoothed.observables.values_mut() {
        for values in series.iter_mut() {
            *values = smooth_series(values, half_width, sigma);
        }
    }
    smoothed
}

fn smooth_series(values: &[f64], half_width: usize, sigma: f64) -> Vec<f64> {
    if half_width == 0 || sigma <= 0.0 {
        return values.to_vec();
    }
    let len = values.len();
    let mut out = Vec::with_capacity(len);
    for center in 0..len {
        if is_missing(values[center]) {
            out.push(values[center]);
            continue;
        }
        let lo = center.saturating_sub(half_width);
        let hi = (center + half_width).min(len.saturating_sub(1));
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (index, value) in values.iter().enumerate().take(hi + 1).skip(lo) {
            if is_missing(*value) {
                continue;
            }
            let offset = usize_to_f64(index.abs_diff(center)) / sigma;
            let weight = (-0.5 * offset * offset).exp();
            weighted += weight * value;
            total_weight += weight;
        }
        out.push(if total_weight > 0.0 {
            weighted / total_weight
        } else {
            values[center]
        });
    }
    out
}

/// Estimate a latent initial state (per-member position then velocity)
/// from the head of one observable's training window.
///
/// # Errors
///
/// Returns `DyadInputError::UnknownObservable` if the observable is absent.
pub fn estimate_init_state(
    data: &DyadData,
    name: &str,
    training_fraction: f64,
) -> Result<Vec<f64>, DyadInputError> {
    let series = data.observable(name)?;
    let members = series.len();
    let train_len = training_length(data.times.len(), training_fraction);
    let mut state = vec![0.0; 2 * members];
    for (member, values) in series.iter().enumerate() {
        let window = &values[..train_len];
        let first = window
            .iter()
            .enumerate()
            .find(|(_, v)| !is_missing(**v))
            .map(|(t, v)| (t, *v));
        let Some((t0, y0)) = first else {
            continue;
        };
        state[member] = y0;
        let second = window
            .iter()
            .enumerate()
            .skip(t0 + 1)
            .find(|(_, v)| !is_missing(**v))
            .map(|(t, v)| (t, *v));
        if let Some((t1, y1)) = second {
            let dt = data.times[t1] - data.times[t0];
            if dt > 0.0 {
                state[members + member] = (y1 - y0) / dt;
            }
        }
    }
    Ok(state)
}

/// Number of leading time points belonging to the fitting window.
#[must_use]
pub fn training_length(total: usize, training_fraction: f64) -> usize {
    let raw = (usize_to_f64(total) * training_fraction)
        .ceil()
        .to_usize()
        .unwrap_or(total);
    raw.clamp(2.min(total), total)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::input::dyad::MISSING_VALUE;

    use super::*;

    fn dyad() -> DyadData {
        DyadData::new(1, vec![0.0, 1.0, 2.0, 3.0]).with_observable(
            "dial",
            vec![
                vec![1.0, 3.0, 5.0, 7.0],
                vec![2.0, MISSING_VALUE, 2.0, 2.0],
            ],
        )
    }

    #[test]
    fn stats_skip_missing_points() {
        let stats = observable_stats(&dyad(), "dial").expect("observable exists");
        assert_relative_eq!(stats.means[0], 4.0);
        assert_relative_eq!(stats.means[1], 2.0);
        assert_relative_eq!(stats.std_devs[1], 0.0);
    }

    #[test]
    fn standardize_centers_each_member() {
        let mut data = dyad();
        standardize_observable(&mut data, "dial").expect("observable exists");
        let stats = observable_stats(&data, "dial").expect("observable exists");
        assert_relative_eq!(stats.means[0], 0.0, epsilon = 1.0e-12);
    }

    #[test]
    fn smoothing_preserves_missing_sentinel() {
        let smoothed = smooth_data(&dyad(), 1, 1.0);
        assert!(is_missing(smoothed.observables["dial"][1][1]));
    }

    #[test]
    fn init_state_uses_first_finite_points() {
        let state = estimate_init_state(&dyad(), "dial", 1.0).expect("observable exists");
        assert_relative_eq!(state[0], 1.0);
        assert_relative_eq!(state[2], 2.0);
        // member 1: first points are (t=0, 2.0) and (t=2, 2.0), flat slope
        assert_relative_eq!(state[3], 0.0);
    }

    #[test]
    fn training_length_respects_fraction_and_floor() {
        assert_eq!(training_length(20, 0.8), 16);
        assert_eq!(training_length(3, 0.1), 2);
        assert_eq!(training_length(5, 1.0), 5);
    }
}
