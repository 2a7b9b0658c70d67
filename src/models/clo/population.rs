//! Population container: every dyad's state-space model plus the shared
//! hyper-parameter state.

use crate::utils::dot;

use super::state_space::LinearStateSpace;

/// Per-cluster shared parameters: one regression-coefficient vector and
/// one variance per modeled parameter, plus the mixture weight.
#[derive(Debug, Clone)]
pub struct GroupParams {
    pub pred_coefs: Vec<Vec<f64>>,
    pub variances: Vec<f64>,
    pub weight: f64,
}

impl GroupParams {
    #[must_use]
    pub fn new(num_params: usize, predictor_dim: usize, init_variance: f64, weight: f64) -> Self {
        Self {
            pred_coefs: vec![vec![0.0; predictor_dim]; num_params],
            variances: vec![init_variance; num_params],
            weight,
        }
    }

    #[must_use]
    pub fn coef_count(&self) -> usize {
        self.pred_coefs.iter().map(Vec::len).sum()
    }
}

/// The full population: per-dyad models (index-aligned with `ids`) and the
/// shared cluster, observation, noise, and GP-drift parameters.
///
/// Cloning the set produces the best-posterior snapshot the orchestrator
/// tracks.
#[derive(Debug, Clone)]
pub struct LssSet {
    ids: Vec<u64>,
    lss_vec: Vec<LinearStateSpace>,
    group_params: Vec<GroupParams>,
    noise_sigmas: Vec<f64>,
    gp_scales: Vec<f64>,
    gp_sigvars: Vec<f64>,
    samples: Vec<Vec<LinearStateSpace>>,
}

impl LssSet {
    /// # Panics
    ///
    /// Panics if `ids` and `lss_vec` lengths differ (callers validate).
    #[must_use]
    pub fn new(
        ids: Vec<u64>,
        lss_vec: Vec<LinearStateSpace>,
        group_params: Vec<GroupParams>,
        noise_sigmas: Vec<f64>,
        gp_scales: Vec<f64>,
        gp_sigvars: Vec<f64>,
    ) -> Self {
        assert_eq!(ids.len(), lss_vec.len());
        let dyads = lss_vec.len();
        let mut set = Self {
            ids,
            lss_vec,
            group_params,
            noise_sigmas,
            gp_scales,
            gp_sigvars,
            samples: vec![Vec::new(); dyads],
        };
        set.update_means();
        set.update_variances();
        set
    }

    #[must_use]
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    #[must_use]
    pub fn lss_vec(&self) -> &[LinearStateSpace] {
        &self.lss_vec
    }

    pub fn lss_vec_mut(&mut self) -> &mut [LinearStateSpace] {
        &mut self.lss_vec
    }

    #[must_use]
    pub fn num_dyads(&self) -> usize {
        self.lss_vec.len()
    }

    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.group_params.len()
    }

    #[must_use]
    pub fn group_params(&self) -> &[GroupParams] {
        &self.group_params
    }

    pub fn group_params_mut(&mut self) -> &mut [GroupParams] {
        &mut self.group_params
    }

    #[must_use]
    pub fn noise_sigmas(&self) -> &[f64] {
        &self.noise_sigmas
    }

    /// Replace the shared noise sigmas, mirroring into every dyad model.
    pub fn set_noise_sigmas(&mut self, sigmas: &[f64]) {
        self.noise_sigmas = sigmas.to_vec();
        for lss in &mut self.lss_vec {
            lss.set_noise_sigmas(sigmas.to_vec());
        }
    }

    /// Shared observation coefficients, read from the first dyad.
    #[must_use]
    pub fn obs_coefs(&self) -> &Vec<Vec<Vec<f64>>> {
        self.lss_vec[0].obs_coefs()
    }

    /// Replace one shared observation coefficient, mirroring into every
    /// dyad model.
    pub fn set_obs_coef(&mut self, observable: usize, member: usize, coef: &[f64]) {
        for lss in &mut self.lss_vec {
            lss.set_obs_coef(observable, member, coef.to_vec());
        }
    }

    #[must_use]
    pub fn gp_scales(&self) -> &[f64] {
        &self.gp_scales
    }

    #[must_use]
    pub fn gp_sigvars(&self) -> &[f64] {
        &self.gp_sigvars
    }

    pub fn set_gp_scale(&mut self, index: usize, value: f64) {
        self.gp_scales[index] = value;
        for lss in &mut self.lss_vec {
            lss.set_gp_scale(index, value);
        }
    }

    pub fn set_gp_sigvar(&mut self, index: usize, value: f64) {
        self.gp_sigvars[index] = value;
        for lss in &mut self.lss_vec {
            lss.set_gp_sigvar(index, value);
        }
    }

    /// Refresh every dyad's per-parameter prior means from its assigned
    /// cluster's regression coefficients.
    pub fn update_means(&mut self) {
        for lss in &mut self.lss_vec {
            let group = &self.group_params[lss.group_index()];
            for index in 0..lss.predictors().len() {
                let mean = dot(&group.pred_coefs[index], &lss.predictors()[index]);
                lss.set_param_mean(index, mean);
            }
        }
    }

    /// Refresh every dyad's per-parameter prior variances from its
    /// assigned cluster.
    pub fn update_variances(&mut self) {
        for lss in &mut self.lss_vec {
            let group = &self.group_params[lss.group_index()];
            for index in 0..lss.predictors().len() {
                lss.set_param_variance(index, group.variances[index]);
            }
        }
    }

    /// Move one dyad to a cluster and install that cluster's prior.
    pub fn assign_to_group(&mut self, dyad: usize, group: usize) {
        let lss = &mut self.lss_vec[dyad];
        lss.set_group_index(group);
        let params = &self.group_params[group];
        for index in 0..lss.predictors().len() {
            let mean = dot(&params.pred_coefs[index], &lss.predictors()[index]);
            lss.set_param_mean(index, mean);
            lss.set_param_variance(index, params.variances[index]);
        }
    }

    #[must_use]
    pub fn assignments(&self) -> Vec<usize> {
        self.lss_vec
            .iter()
            .map(LinearStateSpace::group_index)
            .collect()
    }

    /// Dyad count per cluster.
    #[must_use]
    pub fn cluster_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_groups()];
        for lss in &self.lss_vec {
            counts[lss.group_index()] += 1;
        }
        counts
    }

    #[must_use]
    pub fn group_weights(&self) -> Vec<f64> {
        self.group_params.iter().map(|group| group.weight).collect()
    }

    pub fn set_group_weights(&mut self, weights: &[f64]) {
        debug_assert_eq!(weights.len(), self.group_params.len());
        for (group, weight) in self.group_params.iter_mut().zip(weights) {
            group.weight = *weight;
        }
    }

    /// Recorded per-dyad samples (bounded by the run configuration).
    #[must_use]
    pub fn samples(&self) -> &[Vec<LinearStateSpace>] {
        &self.samples
    }

    pub fn record_sample(&mut self, dyad: usize, sample: LinearStateSpace, cap: usize) {
        let slot = &mut self.samples[dyad];
        if slot.len() < cap {
            slot.push(sample);
        }
    }

    pub fn clear_samples(&mut self) {
        for slot in &mut self.samples {
            slot.clear();
        }
    }

    /// Disjoint views of the models and the sample store, for one
    /// parallel round.
    pub fn split_for_round(
        &mut self,
    ) -> (&mut [LinearStateSpace], &mut [Vec<LinearStateSpace>]) {
        (&mut self.lss_vec, &mut self.samples)
    }

    /// Bring every dyad's predicted-state cache up to date.
    pub fn refresh_all(&mut self) {
        for lss in &mut self.lss_vec {
            lss.refresh();
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::models::clo::oscillator::CoupledOscillator;

    use super::*;

    fn small_set(num_groups: usize) -> LssSet {
        let times: Vec<f64> = (0..6).map(|t| f64::from(t) * 0.5).collect();
        let lss_vec: Vec<LinearStateSpace> = (0..3)
            .map(|dyad| {
                let mut lss = LinearStateSpace::new(
                    times.clone(),
                    vec![0.1, -0.1, 0.0, 0.0],
                    vec![CoupledOscillator::new(2, 5.0, 0.0)],
                    vec!["dial".to_owned()],
                    vec![0.5],
                    None,
                    false,
                    dyad % num_groups,
                );
                lss.set_predictors(vec![vec![1.0]; 8]);
                lss
            })
            .collect();
        let groups = (0..num_groups)
            .map(|_| GroupParams::new(8, 1, 1.0, 1.0 / crate::utils::usize_to_f64(num_groups)))
            .collect();
        LssSet::new(
            vec![1, 2, 3],
            lss_vec,
            groups,
            vec![0.5],
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn noise_sigma_updates_mirror_into_dyads() {
        let mut set = small_set(1);
        set.set_noise_sigmas(&[0.25]);
        assert_relative_eq!(set.lss_vec()[2].noise_sigmas()[0], 0.25);
    }

    #[test]
    fn update_means_applies_group_regression() {
        let mut set = small_set(1);
        set.group_params_mut()[0].pred_coefs[0][0] = 3.5;
        set.update_means();
        assert_relative_eq!(set.lss_vec()[0].param_means()[0], 3.5);
    }

    #[test]
    fn cluster_counts_follow_assignments() {
        let mut set = small_set(2);
        assert_eq!(set.cluster_counts(), vec![2, 1]);
        set.assign_to_group(0, 1);
        assert_eq!(set.cluster_counts(), vec![1, 2]);
    }

    #[test]
    fn sample_recording_is_bounded() {
        let mut set = small_set(1);
        let snapshot = set.lss_vec()[0].clone();
        set.record_sample(0, snapshot.clone(), 2);
        set.record_sample(0, snapshot.clone(), 2);
        set.record_sample(0, snapshot, 2);
        assert_eq!(set.samples()[0].len(), 2);
    }
}
