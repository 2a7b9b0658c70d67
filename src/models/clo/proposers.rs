//! Symmetric random-walk proposers for every sampling block.
//!
//! Per-dyad and shared proposers cycle through coordinates one draw per
//! call, mirroring a systematic-scan Metropolis sweep; every proposal is
//! symmetric, so the returned log proposal-density ratio is zero (the
//! noise proposer walks in log space, symmetric in those coordinates).

use rand::rngs::StdRng;

use crate::inference::mh::Proposer;
use crate::inference::random::sample_standard_normal;

use super::population::LssSet;
use super::state_space::LinearStateSpace;

const MAX_REDRAWS: usize = 100;

/// Cyclic coordinate proposer for one dyad's parameters. The init-state,
/// CLO, and polynomial blocks can each be toggled independently; the
/// coordinate order is polynomial, then CLO (per interval when drifting),
/// then init state.
#[derive(Debug, Clone)]
pub struct LssProposer {
    pub prop_sigmas: Vec<f64>,
    pub sample_state: bool,
    pub sample_clo: bool,
    pub sample_poly: bool,
    pub sample_index: usize,
}

impl LssProposer {
    #[must_use]
    pub fn new(
        lss: &LinearStateSpace,
        state_sigma: f64,
        clo_sigma: f64,
        poly_sigma: f64,
        sample_state: bool,
        sample_clo: bool,
        sample_poly: bool,
    ) -> Self {
        let mut prop_sigmas = Vec::new();
        if sample_poly {
            prop_sigmas.extend(std::iter::repeat_n(poly_sigma, lss.poly_param_count()));
        }
        if sample_clo && !lss.ignore_clo() {
            let per_interval = lss.oscillators()[0].num_params();
            let intervals = if lss.allow_drift() {
                lss.oscillators().len()
            } else {
                1
            };
            prop_sigmas.extend(std::iter::repeat_n(clo_sigma, per_interval * intervals));
        }
        if sample_state {
            prop_sigmas.extend(std::iter::repeat_n(state_sigma, lss.init_state().len()));
        }
        Self {
            prop_sigmas,
            sample_state,
            sample_clo,
            sample_poly,
            sample_index: 0,
        }
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.prop_sigmas.len()
    }

    fn poly_count(&self, lss: &LinearStateSpace) -> usize {
        if self.sample_poly {
            lss.poly_param_count()
        } else {
            0
        }
    }

    fn clo_count(&self, lss: &LinearStateSpace) -> usize {
        if self.sample_clo && !lss.ignore_clo() {
            let per_interval = lss.oscillators()[0].num_params();
            let intervals = if lss.allow_drift() {
                lss.oscillators().len()
            } else {
                1
            };
            per_interval * intervals
        } else {
            0
        }
    }
}

impl Proposer<LinearStateSpace> for LssProposer {
    fn propose(&mut self, current: &LinearStateSpace, rng: &mut StdRng) -> (LinearStateSpace, f64) {
        let mut candidate = current.clone();
        let dimension = self.dimension();
        if dimension == 0 {
            return (candidate, 0.0);
        }
        if self.sample_index >= dimension {
            self.sample_index = 0;
        }
        let coordinate = self.sample_index;
        let sigma = self.prop_sigmas[coordinate];

        let poly_count = self.poly_count(current);
        let clo_count = self.clo_count(current);
        if coordinate < poly_count {
            let degree = current
                .polynomial_degree()
                .map_or(1, |degree| degree + 1);
            let member = coordinate / degree;
            let power = coordinate % degree;
            let old = candidate.poly_coefs()[member][power];
            candidate.set_poly_coef(member, power, sigma.mul_add(sample_standard_normal(rng), old));
        } else if coordinate < poly_count + clo_count {
            let offset = coordinate - poly_count;
            let per_interval = current.oscillators()[0].num_params();
            let interval = offset / per_interval;
            let param = offset % per_interval;
            // Redraw until the frequency constraint holds; bail out to the
            // current value if the walk cannot find a valid point.
            let old = candidate.oscillators()[interval.min(candidate.oscillators().len() - 1)]
                .param(param);
            let mut accepted_value = old;
            for _ in 0..MAX_REDRAWS {
                let proposal = sigma.mul_add(sample_standard_normal(rng), old);
                candidate.set_clo_param(interval, param, proposal);
                if candidate.has_valid_params() {
                    accepted_value = proposal;
                    break;
                }
            }
            candidate.set_clo_param(interval, param, accepted_value);
        } else {
            let state_index = coordinate - poly_count - clo_count;
            let old = candidate.init_state()[state_index];
            candidate
                .set_init_state_coord(state_index, sigma.mul_add(sample_standard_normal(rng), old));
        }

        self.sample_index += 1;
        if self.sample_index == dimension {
            self.sample_index = 0;
        }
        candidate.refresh();
        (candidate, 0.0)
    }
}

/// Cyclic proposer over the shared cluster regression coefficients and
/// variances, advancing one cluster at a time.
#[derive(Debug, Clone)]
pub struct SharedParamProposer {
    pub coef_sigma: f64,
    pub variance_sigma: f64,
    pub include_variances: bool,
    sample_index: usize,
    group_id: usize,
}

impl SharedParamProposer {
    #[must_use]
    pub const fn new(coef_sigma: f64, variance_sigma: f64, include_variances: bool) -> Self {
        Self {
            coef_sigma,
            variance_sigma,
            include_variances,
            sample_index: 0,
            group_id: 0,
        }
    }
}

impl Proposer<LssSet> for SharedParamProposer {
    fn propose(&mut self, current: &LssSet, rng: &mut StdRng) -> (LssSet, f64) {
        let mut candidate = current.clone();
        let group_id = self.group_id.min(current.num_groups() - 1);
        let group = &candidate.group_params()[group_id];
        let coef_count = group.coef_count();
        let variance_count = if self.include_variances {
            group.variances.len()
        } else {
            0
        };
        let total = coef_count + variance_count;
        if total == 0 {
            return (candidate, 0.0);
        }
        if self.sample_index >= total {
            self.sample_index = 0;
        }
        let coordinate = self.sample_index;

        if coordinate < coef_count {
            let per_param = group.pred_coefs[0].len().max(1);
            let param = coordinate / per_param;
            let within = coordinate % per_param;
            let draw = self.coef_sigma * sample_standard_normal(rng);
            candidate.group_params_mut()[group_id].pred_coefs[param][within] += draw;
            candidate.update_means();
        } else {
            let param = coordinate - coef_count;
            let draw = self.variance_sigma * sample_standard_normal(rng);
            candidate.group_params_mut()[group_id].variances[param] += draw;
            candidate.update_variances();
        }

        self.sample_index += 1;
        if self.sample_index == total {
            self.sample_index = 0;
            self.group_id = (group_id + 1) % current.num_groups();
        }
        (candidate, 0.0)
    }
}

/// Log-space random walk over every shared noise sigma at once.
#[derive(Debug, Clone)]
pub struct NoiseSigmaProposer {
    pub prop_sigmas: Vec<f64>,
}

impl Proposer<LssSet> for NoiseSigmaProposer {
    fn propose(&mut self, current: &LssSet, rng: &mut StdRng) -> (LssSet, f64) {
        let mut candidate = current.clone();
        let sigmas: Vec<f64> = current
            .noise_sigmas()
            .iter()
            .zip(&self.prop_sigmas)
            .map(|(sigma, prop)| {
                (prop.mul_add(sample_standard_normal(rng), sigma.max(1.0e-12).ln())).exp()
            })
            .collect();
        candidate.set_noise_sigmas(&sigmas);
        (candidate, 0.0)
    }
}

/// Cyclic proposer over the shared observation coefficients, skipping the
/// pinned first observable.
#[derive(Debug, Clone)]
pub struct ObsCoefProposer {
    pub prop_sigma: f64,
    obs_index: usize,
    member_index: usize,
}

impl ObsCoefProposer {
    #[must_use]
    pub const fn new(prop_sigma: f64) -> Self {
        Self {
            prop_sigma,
            obs_index: 1,
            member_index: 0,
        }
    }
}

impl Proposer<LssSet> for ObsCoefProposer {
    fn propose(&mut self, current: &LssSet, rng: &mut StdRng) -> (LssSet, f64) {
        let mut candidate = current.clone();
        let num_obs = current.obs_coefs().len();
        if num_obs <= 1 {
            return (candidate, 0.0);
        }
        let num_members = current.obs_coefs()[0].len();
        let obs = self.obs_index.clamp(1, num_obs - 1);
        let member = self.member_index.min(num_members - 1);

        let mut coef = current.obs_coefs()[obs][member].clone();
        for value in &mut coef {
            *value = self.prop_sigma.mul_add(sample_standard_normal(rng), *value);
        }
        candidate.set_obs_coef(obs, member, &coef);

        self.member_index += 1;
        if self.member_index == num_members {
            self.member_index = 0;
            self.obs_index += 1;
            if self.obs_index == num_obs {
                self.obs_index = 1;
            }
        }
        (candidate, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use crate::models::clo::oscillator::CoupledOscillator;

    use super::*;

    fn lss() -> LinearStateSpace {
        let times: Vec<f64> = (0..6).map(|t| f64::from(t) * 0.5).collect();
        let mut lss = LinearStateSpace::new(
            times,
            vec![0.3, -0.3, 0.0, 0.0],
            vec![CoupledOscillator::new(2, 5.0, 0.0)],
            vec!["dial".to_owned()],
            vec![0.5],
            None,
            false,
            0,
        );
        lss.refresh();
        lss
    }

    #[test]
    fn proposer_covers_clo_then_state_coordinates() {
        let lss = lss();
        let proposer = LssProposer::new(&lss, 0.1, 0.05, 0.05, true, true, false);
        assert_eq!(proposer.dimension(), 8 + 4);
    }

    #[test]
    fn each_call_perturbs_exactly_one_coordinate() {
        let lss = lss();
        let mut proposer = LssProposer::new(&lss, 0.1, 0.05, 0.05, true, true, false);
        let mut rng = StdRng::seed_from_u64(3);
        let (candidate, ratio) = proposer.propose(&lss, &mut rng);
        assert!(ratio.abs() < f64::EPSILON);
        let mut changed = 0;
        for index in 0..8 {
            if (candidate.oscillators()[0].param(index) - lss.oscillators()[0].param(index)).abs()
                > 0.0
            {
                changed += 1;
            }
        }
        for index in 0..4 {
            if (candidate.init_state()[index] - lss.init_state()[index]).abs() > 0.0 {
                changed += 1;
            }
        }
        assert_eq!(changed, 1);
    }

    #[test]
    fn proposed_candidates_keep_valid_frequencies() {
        let lss = lss();
        let mut proposer = LssProposer::new(&lss, 0.1, 5.0, 0.05, false, true, false);
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let (candidate, _) = proposer.propose(&lss, &mut rng);
            assert!(candidate.has_valid_params());
        }
    }

    #[test]
    fn noise_proposals_stay_positive() {
        let set = {
            let lss = lss();
            crate::models::clo::population::LssSet::new(
                vec![1],
                vec![lss],
                vec![crate::models::clo::population::GroupParams::new(8, 1, 1.0, 1.0)],
                vec![0.5],
                Vec::new(),
                Vec::new(),
            )
        };
        let mut proposer = NoiseSigmaProposer {
            prop_sigmas: vec![0.5],
        };
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..25 {
            let (candidate, _) = proposer.propose(&set, &mut rng);
            assert!(candidate.noise_sigmas()[0] > 0.0);
        }
    }
}
