//! Parameter adapters binding the model types to the generic gradient
//! and HMC machinery.

use crate::inference::gradient::ParameterAdapter;

use super::population::LssSet;
use super::state_space::LinearStateSpace;

/// Per-dyad view: the (non-drifting) CLO parameter block followed by the
/// initial state.
#[derive(Debug, Clone, Copy)]
pub struct LssStateAdapter {
    pub sample_state: bool,
    pub sample_clo: bool,
}

impl LssStateAdapter {
    fn clo_count(self, lss: &LinearStateSpace) -> usize {
        if self.sample_clo && !lss.ignore_clo() && !lss.allow_drift() {
            lss.oscillators()[0].num_params()
        } else {
            0
        }
    }

    fn state_count(self, lss: &LinearStateSpace) -> usize {
        if self.sample_state {
            lss.init_state().len()
        } else {
            0
        }
    }
}

impl ParameterAdapter<LinearStateSpace> for LssStateAdapter {
    fn size(&self, lss: &LinearStateSpace) -> usize {
        self.clo_count(lss) + self.state_count(lss)
    }

    fn get(&self, lss: &LinearStateSpace, index: usize) -> f64 {
        let clo = self.clo_count(lss);
        if index < clo {
            lss.oscillators()[0].param(index)
        } else {
            lss.init_state()[index - clo]
        }
    }

    fn set(&self, lss: &mut LinearStateSpace, index: usize, value: f64) {
        let clo = self.clo_count(lss);
        if index < clo {
            lss.set_clo_param(0, index, value);
        } else {
            lss.set_init_state_coord(index - clo, value);
        }
    }

    fn prepare(&self, lss: &mut LinearStateSpace) {
        lss.refresh();
    }
}

/// Population view of every cluster's regression coefficients, optionally
/// followed by the per-parameter variances.
#[derive(Debug, Clone, Copy)]
pub struct SharedParamAdapter {
    pub include_variances: bool,
}

impl SharedParamAdapter {
    fn per_group(self, set: &LssSet) -> usize {
        let group = &set.group_params()[0];
        let coefs = group.coef_count();
        if self.include_variances {
            coefs + group.variances.len()
        } else {
            coefs
        }
    }

    fn locate(self, set: &LssSet, index: usize) -> (usize, usize) {
        let per_group = self.per_group(set);
        (index / per_group, index % per_group)
    }
}

impl ParameterAdapter<LssSet> for SharedParamAdapter {
    fn size(&self, set: &LssSet) -> usize {
        self.per_group(set) * set.num_groups()
    }

    fn get(&self, set: &LssSet, index: usize) -> f64 {
        let (group_index, mut offset) = self.locate(set, index);
        let group = &set.group_params()[group_index];
        for coefs in &group.pred_coefs {
            if offset < coefs.len() {
                return coefs[offset];
            }
            offset -= coefs.len();
        }
        group.variances[offset]
    }

    fn set(&self, set: &mut LssSet, index: usize, value: f64) {
        let (group_index, mut offset) = self.locate(set, index);
        let group = &mut set.group_params_mut()[group_index];
        for coefs in &mut group.pred_coefs {
            if offset < coefs.len() {
                coefs[offset] = value;
                return;
            }
            offset -= coefs.len();
        }
        group.variances[offset] = value;
    }

    fn prepare(&self, set: &mut LssSet) {
        set.update_means();
        set.update_variances();
    }
}

/// Population view of the shared noise sigmas.
#[derive(Debug, Clone, Copy)]
pub struct NoiseSigmaAdapter;

impl ParameterAdapter<LssSet> for NoiseSigmaAdapter {
    fn size(&self, set: &LssSet) -> usize {
        set.noise_sigmas().len()
    }

    fn get(&self, set: &LssSet, index: usize) -> f64 {
        set.noise_sigmas()[index]
    }

    fn set(&self, set: &mut LssSet, index: usize, value: f64) {
        let mut sigmas = set.noise_sigmas().to_vec();
        sigmas[index] = value;
        set.set_noise_sigmas(&sigmas);
    }
}

/// Population view of the free observation coefficients (observable 0 is
/// pinned).
#[derive(Debug, Clone, Copy)]
pub struct ObsCoefAdapter {
    pub num_observables: usize,
    pub num_members: usize,
    pub coef_dim: usize,
}

impl ObsCoefAdapter {
    fn locate(self, index: usize) -> (usize, usize, usize) {
        let per_obs = self.num_members * self.coef_dim;
        let obs = 1 + index / per_obs;
        let rest = index % per_obs;
        (obs, rest / self.coef_dim, rest % self.coef_dim)
    }
}

impl ParameterAdapter<LssSet> for ObsCoefAdapter {
    fn size(&self, _set: &LssSet) -> usize {
        self.num_observables.saturating_sub(1) * self.num_members * self.coef_dim
    }

    fn get(&self, set: &LssSet, index: usize) -> f64 {
        let (obs, member, within) = self.locate(index);
        set.obs_coefs()[obs][member][within]
    }

    fn set(&self, set: &mut LssSet, index: usize, value: f64) {
        let (obs, member, within) = self.locate(index);
        let mut coef = set.obs_coefs()[obs][member].clone();
        coef[within] = value;
        set.set_obs_coef(obs, member, &coef);
    }
}

/// Population view of the GP drift length-scales and signal variances.
#[derive(Debug, Clone, Copy)]
pub struct GpScaleAdapter;

impl ParameterAdapter<LssSet> for GpScaleAdapter {
    fn size(&self, set: &LssSet) -> usize {
        set.gp_scales().len() + set.gp_sigvars().len()
    }

    fn get(&self, set: &LssSet, index: usize) -> f64 {
        let scales = set.gp_scales().len();
        if index < scales {
            set.gp_scales()[index]
        } else {
            set.gp_sigvars()[index - scales]
        }
    }

    fn set(&self, set: &mut LssSet, index: usize, value: f64) {
        let scales = set.gp_scales().len();
        if index < scales {
            set.set_gp_scale(index, value);
        } else {
            set.set_gp_sigvar(index - scales, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::models::clo::oscillator::CoupledOscillator;
    use crate::models::clo::population::GroupParams;

    use super::*;

    fn set() -> LssSet {
        let times: Vec<f64> = (0..5).map(f64::from).collect();
        let mut lss = LinearStateSpace::new(
            times,
            vec![0.1, 0.2, 0.0, 0.0],
            vec![CoupledOscillator::new(2, 5.0, 0.0)],
            vec!["dial".to_owned()],
            vec![0.5],
            None,
            false,
            0,
        );
        lss.set_predictors(vec![vec![1.0]; 8]);
        LssSet::new(
            vec![1],
            vec![lss],
            vec![GroupParams::new(8, 1, 1.0, 1.0)],
            vec![0.5],
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn lss_adapter_spans_clo_and_state() {
        let set = set();
        let adapter = LssStateAdapter {
            sample_state: true,
            sample_clo: true,
        };
        let lss = &set.lss_vec()[0];
        assert_eq!(adapter.size(lss), 12);
        assert_relative_eq!(adapter.get(lss, 8), 0.1);
    }

    #[test]
    fn shared_adapter_round_trips_values() {
        let mut set = set();
        let adapter = SharedParamAdapter {
            include_variances: true,
        };
        assert_eq!(adapter.size(&set), 16);
        adapter.set(&mut set, 3, 2.5);
        assert_relative_eq!(adapter.get(&set, 3), 2.5);
        adapter.set(&mut set, 8 + 5, 0.75);
        assert_relative_eq!(set.group_params()[0].variances[5], 0.75);
    }

    #[test]
    fn noise_adapter_mirrors_into_models() {
        let mut set = set();
        let adapter = NoiseSigmaAdapter;
        adapter.set(&mut set, 0, 0.9);
        assert_relative_eq!(set.lss_vec()[0].noise_sigmas()[0], 0.9);
    }
}
