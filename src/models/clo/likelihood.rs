//! Gaussian observation likelihood of one dyad's data.
//!
//! Three evaluation modes: the full fitting window, a stochastic estimate
//! over random contiguous segments, and the held-out predictive window.
//! The window is always an explicit argument; no evaluator state selects
//! it.

use rand::Rng;
use rand::rngs::StdRng;

use crate::input::dyad::{DyadData, is_missing};

use super::priors::log_normal_density;
use super::state_space::LinearStateSpace;

/// Default number of random segments per stochastic evaluation.
pub const DEFAULT_NUM_SEGMENTS: usize = 2;

/// Which slice of the time axis a likelihood evaluation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LikelihoodWindow {
    /// The training window `[0, train_len)`.
    #[default]
    Fitting,
    /// The held-out window `[train_len, len)`, on a model extended to the
    /// dyad's full horizon.
    Predictive,
}

/// Likelihood evaluator bound to one dyad's data.
#[derive(Debug, Clone)]
pub struct Likelihood<'a> {
    data: &'a DyadData,
    train_len: usize,
    segment_length: usize,
    num_segments: usize,
}

impl<'a> Likelihood<'a> {
    #[must_use]
    pub fn new(data: &'a DyadData, train_len: usize, segment_length: usize) -> Self {
        Self {
            data,
            train_len: train_len.min(data.times.len()),
            segment_length: segment_length.max(2),
            num_segments: DEFAULT_NUM_SEGMENTS,
        }
    }

    #[must_use]
    pub const fn data(&self) -> &'a DyadData {
        self.data
    }

    #[must_use]
    pub const fn train_len(&self) -> usize {
        self.train_len
    }

    /// Total data log-likelihood over the requested window.
    ///
    /// For `Predictive` the model is clone-extended to the dyad's full
    /// horizon; the caller's model is untouched.
    #[must_use]
    pub fn log_density(&self, lss: &LinearStateSpace, window: LikelihoodWindow) -> f64 {
        match window {
            LikelihoodWindow::Fitting => self.window_log_density(lss, 0, self.train_len),
            LikelihoodWindow::Predictive => {
                let mut extended = lss.clone();
                extended.extend_times(self.data.times.clone());
                extended.refresh();
                self.window_log_density(&extended, self.train_len, self.data.times.len())
            }
        }
    }

    /// Stochastic estimate: the masked sum over random fixed-length
    /// contiguous segments of the fitting window.
    #[must_use]
    pub fn stochastic_log_density(&self, lss: &LinearStateSpace, rng: &mut StdRng) -> f64 {
        if self.train_len <= self.segment_length * self.num_segments {
            return self.window_log_density(lss, 0, self.train_len);
        }
        let mut total = 0.0;
        for _ in 0..self.num_segments {
            let start = rng.random_range(0..=self.train_len - self.segment_length);
            total += self.window_log_density(lss, start, start + self.segment_length);
        }
        total
    }

    fn window_log_density(&self, lss: &LinearStateSpace, start: usize, end: usize) -> f64 {
        let end = end.min(lss.times().len());
        let mut total = 0.0;
        for (observable, name) in lss.obs_names().iter().enumerate() {
            let Ok(series) = self.data.observable(name) else {
                return f64::NEG_INFINITY;
            };
            let sigma = lss.noise_sigmas()[observable];
            if !(sigma > 0.0 && sigma.is_finite()) {
                return f64::NEG_INFINITY;
            }
            let variance = sigma * sigma;
            for (member, values) in series.iter().enumerate() {
                for time_index in start..end {
                    let observed = values[time_index];
                    if is_missing(observed) {
                        continue;
                    }
                    let predicted = lss.predicted_observable(observable, member, time_index);
                    let term = log_normal_density(observed, predicted, variance);
                    if !term.is_finite() {
                        return f64::NEG_INFINITY;
                    }
                    total += term;
                }
            }
        }
        total
    }

    /// Per-observable sums of squared residuals over non-missing fitting
    /// points, plus matching point counts (for the Gibbs noise update).
    #[must_use]
    pub fn squared_errors(&self, lss: &LinearStateSpace) -> (Vec<f64>, Vec<usize>) {
        let num_obs = lss.obs_names().len();
        let mut sums = vec![0.0; num_obs];
        let mut counts = vec![0; num_obs];
        for (observable, name) in lss.obs_names().iter().enumerate() {
            let Ok(series) = self.data.observable(name) else {
                continue;
            };
            for (member, values) in series.iter().enumerate() {
                for time_index in 0..self.train_len.min(lss.times().len()) {
                    let observed = values[time_index];
                    if is_missing(observed) {
                        continue;
                    }
                    let predicted = lss.predicted_observable(observable, member, time_index);
                    let residual = observed - predicted;
                    sums[observable] += residual * residual;
                    counts[observable] += 1;
                }
            }
        }
        (sums, counts)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    use crate::input::dyad::MISSING_VALUE;
    use crate::models::clo::oscillator::CoupledOscillator;

    use super::*;

    fn dyad_and_lss() -> (DyadData, LinearStateSpace) {
        let times: Vec<f64> = (0..10).map(|t| f64::from(t) * 0.3).collect();
        let data = DyadData::new(1, times.clone()).with_observable(
            "dial",
            vec![vec![0.5; 10], vec![-0.5; 10]],
        );
        let mut lss = LinearStateSpace::new(
            times,
            vec![0.5, -0.5, 0.0, 0.0],
            vec![CoupledOscillator::new(2, 5.0, 0.0)],
            vec!["dial".to_owned()],
            vec![0.5],
            None,
            false,
            0,
        );
        lss.refresh();
        (data, lss)
    }

    #[test]
    fn masked_sum_equals_analytic_gaussian_when_nothing_is_missing() {
        let (data, lss) = dyad_and_lss();
        let likelihood = Likelihood::new(&data, 10, 4);
        let from_evaluator = likelihood.log_density(&lss, LikelihoodWindow::Fitting);

        let mut expected = 0.0;
        let variance = 0.25;
        for member in 0..2 {
            for t in 0..10 {
                let observed = data.observables["dial"][member][t];
                let predicted = lss.predicted_observable(0, member, t);
                expected += log_normal_density(observed, predicted, variance);
            }
        }
        assert_relative_eq!(from_evaluator, expected, epsilon = 1.0e-12);
    }

    #[test]
    fn missing_points_contribute_nothing() {
        let (mut data, lss) = dyad_and_lss();
        let full = Likelihood::new(&data, 10, 4).log_density(&lss, LikelihoodWindow::Fitting);
        if let Some(series) = data.observables.get_mut("dial") {
            series[0][3] = MISSING_VALUE;
        }
        let masked = Likelihood::new(&data, 10, 4).log_density(&lss, LikelihoodWindow::Fitting);
        assert!(masked > full);

        let (_, counts) = Likelihood::new(&data, 10, 4).squared_errors(&lss);
        assert_eq!(counts[0], 19);
    }

    #[test]
    fn predictive_window_covers_only_the_tail() {
        let (data, mut lss) = dyad_and_lss();
        // Train on the first 8 points only.
        let train_times: Vec<f64> = data.times[..8].to_vec();
        lss.extend_times(train_times);
        lss.refresh();
        let likelihood = Likelihood::new(&data, 8, 4);
        let predictive = likelihood.log_density(&lss, LikelihoodWindow::Predictive);
        assert!(predictive.is_finite());
        // The caller's model keeps its training grid.
        assert_eq!(lss.times().len(), 8);
    }

    #[test]
    fn stochastic_estimate_is_finite_and_reproducible() {
        let (data, lss) = dyad_and_lss();
        let likelihood = Likelihood::new(&data, 10, 3);
        let mut rng_a = StdRng::seed_from_u64(4);
        let mut rng_b = StdRng::seed_from_u64(4);
        let a = likelihood.stochastic_log_density(&lss, &mut rng_a);
        let b = likelihood.stochastic_log_density(&lss, &mut rng_b);
        assert_relative_eq!(a, b);
    }
}
