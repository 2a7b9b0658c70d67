//! Per-dyad linear state-space model.
//!
//! A `LinearStateSpace` owns a time grid, an initial latent state, the
//! oscillator parameters (one shared set, or one per interval when drift
//! is enabled), the observation model, and a cached predicted-state
//! sequence. Mutators only lower the `dirty_from` low-water mark;
//! `refresh` recomputes the stale suffix and resets the mark, so reads
//! stay pure.

use super::oscillator::{CoupledOscillator, integrate_states, mean_params};
use super::priors::{log_normal_density, log_squared_exponential_gp};

/// Index value meaning "no state needs recomputation".
const CLEAN: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct LinearStateSpace {
    times: Vec<f64>,
    init_state: Vec<f64>,
    oscillators: Vec<CoupledOscillator>,
    drift: bool,
    ignore_clo: bool,
    obs_names: Vec<String>,
    /// Observation coefficients indexed `[observable][member][coef]`;
    /// the first observable is pinned at 1.0.
    obs_coefs: Vec<Vec<Vec<f64>>>,
    noise_sigmas: Vec<f64>,
    /// Polynomial trend coefficients indexed `[member][power]`; empty
    /// disables the trend block.
    poly_coefs: Vec<Vec<f64>>,
    /// Observed outcome endpoints, flattened `[outcome type x member]`.
    outcomes: Vec<f64>,
    outcomes_modeled: bool,
    /// Moderator design vector per modeled parameter.
    predictors: Vec<Vec<f64>>,
    param_means: Vec<f64>,
    param_variances: Vec<f64>,
    gp_scales: Vec<f64>,
    gp_sigvars: Vec<f64>,
    group_index: usize,
    states: Vec<Vec<f64>>,
    dirty_from: usize,
}

impl LinearStateSpace {
    #[must_use]
    pub fn new(
        times: Vec<f64>,
        init_state: Vec<f64>,
        oscillators: Vec<CoupledOscillator>,
        obs_names: Vec<String>,
        noise_sigmas: Vec<f64>,
        polynomial_degree: Option<usize>,
        ignore_clo: bool,
        group_index: usize,
    ) -> Self {
        debug_assert!(!oscillators.is_empty());
        debug_assert_eq!(obs_names.len(), noise_sigmas.len());
        let members = oscillators[0].num_oscillators();
        debug_assert_eq!(init_state.len(), 2 * members);

        let drift = oscillators.len() > 1;
        let obs_coefs = obs_names
            .iter()
            .map(|_| vec![vec![1.0]; members])
            .collect();
        let poly_coefs = polynomial_degree
            .map(|degree| vec![vec![0.0; degree + 1]; members])
            .unwrap_or_default();

        Self {
            times,
            init_state,
            oscillators,
            drift,
            ignore_clo,
            obs_names,
            obs_coefs,
            noise_sigmas,
            poly_coefs,
            outcomes: Vec::new(),
            outcomes_modeled: false,
            predictors: Vec::new(),
            param_means: Vec::new(),
            param_variances: Vec::new(),
            gp_scales: Vec::new(),
            gp_sigvars: Vec::new(),
            group_index,
            states: Vec::new(),
            dirty_from: 0,
        }
    }

    #[must_use]
    pub fn num_oscillators(&self) -> usize {
        self.oscillators[0].num_oscillators()
    }

    #[must_use]
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    #[must_use]
    pub fn init_state(&self) -> &[f64] {
        &self.init_state
    }

    #[must_use]
    pub fn oscillators(&self) -> &[CoupledOscillator] {
        &self.oscillators
    }

    #[must_use]
    pub const fn allow_drift(&self) -> bool {
        self.drift
    }

    #[must_use]
    pub const fn ignore_clo(&self) -> bool {
        self.ignore_clo
    }

    #[must_use]
    pub fn obs_names(&self) -> &[String] {
        &self.obs_names
    }

    #[must_use]
    pub fn obs_coefs(&self) -> &Vec<Vec<Vec<f64>>> {
        &self.obs_coefs
    }

    #[must_use]
    pub fn noise_sigmas(&self) -> &[f64] {
        &self.noise_sigmas
    }

    #[must_use]
    pub fn poly_coefs(&self) -> &Vec<Vec<f64>> {
        &self.poly_coefs
    }

    #[must_use]
    pub fn gp_scales(&self) -> &[f64] {
        &self.gp_scales
    }

    #[must_use]
    pub fn gp_sigvars(&self) -> &[f64] {
        &self.gp_sigvars
    }

    #[must_use]
    pub const fn group_index(&self) -> usize {
        self.group_index
    }

    pub const fn set_group_index(&mut self, group: usize) {
        self.group_index = group;
    }

    #[must_use]
    pub fn outcomes(&self) -> &[f64] {
        &self.outcomes
    }

    pub fn set_outcomes(&mut self, outcomes: Vec<f64>, modeled: bool) {
        self.outcomes = outcomes;
        self.outcomes_modeled = modeled;
    }

    #[must_use]
    pub fn predictors(&self) -> &Vec<Vec<f64>> {
        &self.predictors
    }

    pub fn set_predictors(&mut self, predictors: Vec<Vec<f64>>) {
        self.predictors = predictors;
        self.param_means.resize(self.predictors.len(), 0.0);
        self.param_variances.resize(self.predictors.len(), 1.0);
    }

    #[must_use]
    pub fn param_means(&self) -> &[f64] {
        &self.param_means
    }

    #[must_use]
    pub fn param_variances(&self) -> &[f64] {
        &self.param_variances
    }

    pub fn set_param_mean(&mut self, index: usize, mean: f64) {
        self.param_means[index] = mean;
    }

    pub fn set_param_variance(&mut self, index: usize, variance: f64) {
        self.param_variances[index] = variance;
    }

    pub fn init_gp(&mut self, scales: Vec<f64>, sigvars: Vec<f64>) {
        self.gp_scales = scales;
        self.gp_sigvars = sigvars;
    }

    pub fn set_gp_scale(&mut self, index: usize, scale: f64) {
        self.gp_scales[index] = scale;
    }

    pub fn set_gp_sigvar(&mut self, index: usize, sigvar: f64) {
        self.gp_sigvars[index] = sigvar;
    }

    /// Number of dynamics parameters per oscillator set (0 when the CLO
    /// block is ignored).
    #[must_use]
    pub fn clo_param_count(&self) -> usize {
        if self.ignore_clo {
            0
        } else {
            self.oscillators[0].num_params()
        }
    }

    #[must_use]
    pub fn poly_param_count(&self) -> usize {
        self.poly_coefs.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn polynomial_degree(&self) -> Option<usize> {
        self.poly_coefs.first().map(|coefs| coefs.len() - 1)
    }

    /// Count of parameters covered by the regression prior:
    /// CLO, then polynomial, then (optionally) outcome blocks.
    #[must_use]
    pub fn modeled_param_count(&self) -> usize {
        let outcome_count = if self.outcomes_modeled {
            self.outcomes.len()
        } else {
            0
        };
        self.clo_param_count() + self.poly_param_count() + outcome_count
    }

    /// Current values of every modeled parameter, in prior index order.
    /// Drifting CLO parameters enter as their trajectory mean.
    #[must_use]
    pub fn modeled_param_values(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.modeled_param_count());
        if !self.ignore_clo {
            values.extend(mean_params(&self.oscillators));
        }
        for coefs in &self.poly_coefs {
            values.extend_from_slice(coefs);
        }
        if self.outcomes_modeled {
            values.extend_from_slice(&self.outcomes);
        }
        values
    }

    /// Member associated with each modeled parameter, in prior index order.
    #[must_use]
    pub fn modeled_param_members(&self) -> Vec<usize> {
        let mut members = Vec::with_capacity(self.modeled_param_count());
        if !self.ignore_clo {
            let oscillator = &self.oscillators[0];
            members.extend((0..oscillator.num_params()).map(|i| oscillator.param_member(i)));
        }
        for (member, coefs) in self.poly_coefs.iter().enumerate() {
            members.extend(std::iter::repeat_n(member, coefs.len()));
        }
        if self.outcomes_modeled {
            let n = self.num_oscillators().max(1);
            members.extend((0..self.outcomes.len()).map(|i| i % n));
        }
        members
    }

    pub fn set_init_state_coord(&mut self, index: usize, value: f64) {
        self.init_state[index] = value;
        self.invalidate_from(0);
    }

    /// Set one dynamics parameter. Without drift the value is shared, so
    /// every state after the origin goes stale; with drift only states
    /// after the edited interval do.
    pub fn set_clo_param(&mut self, interval: usize, index: usize, value: f64) {
        if self.drift {
            let interval = interval.min(self.oscillators.len() - 1);
            self.oscillators[interval].set_param(index, value);
            self.invalidate_from(interval + 1);
        } else {
            self.oscillators[0].set_param(index, value);
            self.invalidate_from(0);
        }
    }

    pub fn set_poly_coef(&mut self, member: usize, power: usize, value: f64) {
        self.poly_coefs[member][power] = value;
    }

    pub fn set_obs_coef(&mut self, observable: usize, member: usize, coef: Vec<f64>) {
        self.obs_coefs[observable][member] = coef;
    }

    pub fn set_noise_sigmas(&mut self, sigmas: Vec<f64>) {
        debug_assert_eq!(sigmas.len(), self.noise_sigmas.len());
        self.noise_sigmas = sigmas;
    }

    #[must_use]
    pub fn has_valid_params(&self) -> bool {
        self.ignore_clo
            || self
                .oscillators
                .iter()
                .all(CoupledOscillator::has_valid_params)
    }

    /// First state index whose cached value is stale, or `usize::MAX` when
    /// the cache is current.
    #[must_use]
    pub const fn dirty_from(&self) -> usize {
        self.dirty_from
    }

    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.dirty_from == CLEAN
    }

    pub const fn invalidate_from(&mut self, index: usize) {
        if index < self.dirty_from {
            self.dirty_from = index;
        }
    }

    /// Recompute the stale suffix of the predicted-state sequence.
    /// Recomputation is monotone: indices before the low-water mark are
    /// never revisited.
    pub fn refresh(&mut self) {
        if self.is_clean() && self.states.len() == self.times.len() {
            return;
        }
        if self.ignore_clo {
            let dim = self.init_state.len();
            self.states = vec![vec![0.0; dim]; self.times.len()];
            self.dirty_from = CLEAN;
            return;
        }
        let start = self.dirty_from.min(self.states.len());
        if start == 0 || self.states.is_empty() {
            self.states.clear();
            self.states.push(self.init_state.clone());
        }
        integrate_states(&mut self.oscillators, &self.times, &mut self.states, start);
        self.dirty_from = CLEAN;
    }

    /// Cached latent states; `refresh` must have run since the last
    /// mutation.
    #[must_use]
    pub fn states(&self) -> &[Vec<f64>] {
        debug_assert!(self.is_clean(), "stale states read; call refresh first");
        &self.states
    }

    /// Polynomial trend value for one member at time index `t`.
    #[must_use]
    pub fn trend(&self, member: usize, time_index: usize) -> f64 {
        let Some(coefs) = self.poly_coefs.get(member) else {
            return 0.0;
        };
        let time = self.times[time_index];
        let mut power = 1.0;
        let mut total = 0.0;
        for coef in coefs {
            total += coef * power;
            power *= time;
        }
        total
    }

    /// Noise-free predicted value of `observable` for `member` at time
    /// index `t`.
    #[must_use]
    pub fn predicted_observable(&self, observable: usize, member: usize, time_index: usize) -> f64 {
        let latent = self.states()[time_index][member] + self.trend(member, time_index);
        self.obs_coefs[observable][member]
            .first()
            .copied()
            .unwrap_or(1.0)
            * latent
    }

    /// Gaussian prior over the CLO parameters, using the per-parameter
    /// means and variances installed by the cluster. Drifting parameters
    /// are scored per interval against the shared mean.
    #[must_use]
    pub fn log_clo_param_prior(&self) -> f64 {
        if self.param_means.is_empty() || self.ignore_clo {
            return 0.0;
        }
        debug_assert_eq!(self.param_means.len(), self.modeled_param_count());
        let mut total = 0.0;
        for index in 0..self.clo_param_count() {
            let mean = self.param_means[index];
            let variance = self.param_variances[index];
            if !(variance.is_finite() && variance > 0.0) || !mean.is_finite() {
                return f64::NEG_INFINITY;
            }
            for oscillator in &self.oscillators {
                total += log_normal_density(oscillator.param(index), mean, variance);
            }
        }
        total
    }

    /// Gaussian prior over the polynomial-trend and outcome blocks.
    #[must_use]
    pub fn log_tail_param_prior(&self) -> f64 {
        if self.param_means.is_empty() {
            return 0.0;
        }
        let clo_count = self.clo_param_count();
        let tail = self.modeled_param_values();
        let mut total = 0.0;
        for index in clo_count..tail.len() {
            let variance = self.param_variances[index];
            if !(variance.is_finite() && variance > 0.0) {
                return f64::NEG_INFINITY;
            }
            total += log_normal_density(tail[index], self.param_means[index], variance);
        }
        total
    }

    /// Full independent-Gaussian prior over every modeled parameter.
    #[must_use]
    pub fn log_dyad_param_prior(&self) -> f64 {
        let clo = self.log_clo_param_prior();
        if !clo.is_finite() {
            return f64::NEG_INFINITY;
        }
        clo + self.log_tail_param_prior()
    }

    /// GP prior over drifting parameter trajectories.
    #[must_use]
    pub fn log_drift_prior(&self) -> f64 {
        if !self.drift || self.ignore_clo {
            return 0.0;
        }
        let clo_count = self.oscillators[0].num_params();
        debug_assert_eq!(self.gp_scales.len(), clo_count);
        let mut total = 0.0;
        for index in 0..clo_count {
            let trajectory: Vec<f64> = self
                .oscillators
                .iter()
                .map(|oscillator| oscillator.param(index))
                .collect();
            let mean = self.param_means.get(index).copied().unwrap_or(0.0);
            total += log_squared_exponential_gp(
                &trajectory,
                mean,
                self.gp_scales[index],
                self.gp_sigvars[index],
            );
            if !total.is_finite() {
                return f64::NEG_INFINITY;
            }
        }
        total
    }

    /// Re-extend (or shorten) the grid. Extending keeps the computed
    /// prefix and, when drifting, replicates the final oscillator for the
    /// new intervals.
    pub fn extend_times(&mut self, times: Vec<f64>) {
        let old_len = self.times.len();
        if self.drift {
            if times.len() > old_len {
                let template = self
                    .oscillators
                    .last()
                    .cloned()
                    .unwrap_or_else(|| CoupledOscillator::new(self.num_oscillators(), 1.0, 0.0));
                self.oscillators
                    .resize(times.len().saturating_sub(1), template);
            } else if times.len() < old_len {
                self.oscillators
                    .truncate(times.len().saturating_sub(1).max(1));
            }
        }
        self.times = times;
        if self.states.len() > self.times.len() {
            self.states.truncate(self.times.len());
        }
        let valid = if self.is_clean() {
            self.states.len()
        } else {
            self.dirty_from.min(self.states.len())
        };
        self.dirty_from = if valid >= self.times.len() && self.states.len() == self.times.len() {
            CLEAN
        } else {
            valid
        };
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn simple_lss() -> LinearStateSpace {
        let times: Vec<f64> = (0..10).map(|t| f64::from(t) * 0.2).collect();
        LinearStateSpace::new(
            times,
            vec![1.0, -1.0, 0.0, 0.0],
            vec![CoupledOscillator::new(2, 5.0, 0.1)],
            vec!["dial".to_owned()],
            vec![0.5],
            None,
            false,
            0,
        )
    }

    #[test]
    fn refresh_fills_every_time_point() {
        let mut lss = simple_lss();
        lss.refresh();
        assert_eq!(lss.states().len(), lss.times().len());
        assert_relative_eq!(lss.states()[0][0], 1.0);
    }

    #[test]
    fn mutation_lowers_the_water_mark_and_refresh_clears_it() {
        let mut lss = simple_lss();
        lss.refresh();
        assert!(lss.is_clean());
        lss.set_init_state_coord(0, 0.5);
        assert_eq!(lss.dirty_from(), 0);
        lss.refresh();
        assert!(lss.is_clean());
        assert_relative_eq!(lss.states()[0][0], 0.5);
    }

    #[test]
    fn shared_param_edit_invalidates_whole_sequence() {
        let mut lss = simple_lss();
        lss.refresh();
        let before = lss.states()[5].clone();
        lss.set_clo_param(0, 0, 2.0);
        lss.refresh();
        assert_ne!(before, lss.states()[5]);
    }

    #[test]
    fn trend_is_polynomial_in_time() {
        let times: Vec<f64> = (0..4).map(f64::from).collect();
        let mut lss = LinearStateSpace::new(
            times,
            vec![0.0, 0.0, 0.0, 0.0],
            vec![CoupledOscillator::new(2, 5.0, 0.0)],
            vec!["dial".to_owned()],
            vec![0.5],
            Some(1),
            false,
            0,
        );
        lss.set_poly_coef(0, 0, 1.0);
        lss.set_poly_coef(0, 1, 2.0);
        assert_relative_eq!(lss.trend(0, 3), 7.0);
        assert_relative_eq!(lss.trend(1, 3), 0.0);
    }

    #[test]
    fn extend_times_keeps_prefix_and_computes_suffix() {
        let mut lss = simple_lss();
        lss.refresh();
        let prefix = lss.states()[4].clone();
        let longer: Vec<f64> = (0..15).map(|t| f64::from(t) * 0.2).collect();
        lss.extend_times(longer);
        lss.refresh();
        assert_eq!(lss.states().len(), 15);
        assert_relative_eq!(lss.states()[4][0], prefix[0]);
    }

    #[test]
    fn modeled_values_cover_clo_then_poly() {
        let times: Vec<f64> = (0..4).map(f64::from).collect();
        let lss = LinearStateSpace::new(
            times,
            vec![0.0; 4],
            vec![CoupledOscillator::new(2, 5.0, 0.0)],
            vec!["dial".to_owned()],
            vec![0.5],
            Some(0),
            false,
            0,
        );
        assert_eq!(lss.modeled_param_count(), 8 + 2);
        assert_eq!(lss.modeled_param_values().len(), 10);
        assert_eq!(lss.modeled_param_members().len(), 10);
    }
}
