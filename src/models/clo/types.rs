//! Core public types for the coupled-oscillator module: the error
//! taxonomy, per-subsystem configuration blocks, and fit reports.

use std::path::PathBuf;

use thiserror::Error;

use crate::input::DyadInputError;

use super::checkpoint::CheckpointError;

/// Errors returned by configuration, validation, and fitting.
#[derive(Debug, Error)]
pub enum CloError {
    #[error(transparent)]
    InvalidInput(#[from] DyadInputError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("dyad id count ({ids}) must match data record count ({data})")]
    IdDataMismatch { ids: usize, data: usize },
    #[error("at least one dyad is required")]
    EmptyPopulation,
    #[error("at least one observable must be configured")]
    NoObservablesConfigured,
    #[error("iterations must be positive")]
    InvalidIterations,
    #[error("training fraction must lie in (0, 1]")]
    InvalidTrainingFraction,
    #[error("at least one oscillator per dyad is required")]
    InvalidOscillatorCount,
    #[error("dyad {id} has {found} members; the model expects {expected}")]
    MemberCountMismatch {
        id: u64,
        found: usize,
        expected: usize,
    },
    #[error("invalid prior configuration")]
    InvalidPriorConfig,
    #[error("invalid proposal configuration")]
    InvalidProposalConfig,
    #[error("invalid step-size configuration")]
    InvalidStepConfig,
    #[error("thread count must be positive")]
    InvalidThreadCount,
    #[error("wall-clock budget must be positive")]
    InvalidTimeBudget,
    #[error("invalid cluster configuration")]
    InvalidClusterConfig,
    #[error("invalid noise-sampling configuration")]
    InvalidNoiseConfig,
    #[error("invalid drift-sampler configuration")]
    InvalidDriftConfig,
    #[error("parameter drift cannot be combined with cluster sampling")]
    DriftWithClusterUnsupported,
    #[error("cross-validation needs at least 2 folds and one dyad per fold")]
    InvalidFoldCount,
    #[error("linear solve failed")]
    SolveFailed,
    #[error("posterior is not finite at initialization")]
    DegeneratePosterior,
}

/// Which sampler drives a parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerKind {
    #[default]
    MetropolisHastings,
    Hmc,
}

/// How shared hyper-parameters are updated each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedSampleKind {
    #[default]
    Gibbs,
    Hmc,
    MetropolisHastings,
}

/// How observation-noise sigmas are updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoiseSampleKind {
    #[default]
    Gibbs,
    MetropolisHastings,
    Hmc,
}

/// Family of the variance hyper-prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariancePriorKind {
    #[default]
    InverseGamma,
    InverseChiSquared,
}

/// Data-facing options: which series feed the model and how the time axis
/// splits into fitting and prediction windows.
#[derive(Debug, Clone)]
pub struct DataOptions {
    pub observables: Vec<String>,
    pub moderators: Vec<String>,
    pub outcomes: Vec<String>,
    pub training_fraction: f64,
    /// Segment length of the stochastic likelihood estimate.
    pub stochastic_segment_length: usize,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            observables: vec!["dial".to_owned()],
            moderators: Vec::new(),
            outcomes: Vec::new(),
            training_fraction: 0.8,
            stochastic_segment_length: 10,
        }
    }
}

impl DataOptions {
    /// # Errors
    ///
    /// Returns `CloError` if options are internally inconsistent.
    pub fn validate(&self) -> Result<(), CloError> {
        if self.observables.is_empty() {
            return Err(CloError::NoObservablesConfigured);
        }
        if !(self.training_fraction > 0.0 && self.training_fraction <= 1.0) {
            return Err(CloError::InvalidTrainingFraction);
        }
        Ok(())
    }
}

/// Structural options of the per-dyad state-space model.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub num_oscillators: usize,
    pub init_period: f64,
    pub init_damping: f64,
    /// Polynomial trend degree; `None` disables the trend block.
    pub polynomial_degree: Option<usize>,
    /// Let dynamics parameters vary per interval under a GP prior.
    pub allow_drift: bool,
    /// Drop the oscillator dynamics entirely (trend-only model).
    pub ignore_clo: bool,
    /// Include outcome endpoints in the regression prior blocks.
    pub model_outcomes: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            num_oscillators: 2,
            init_period: 5.0,
            init_damping: 0.0,
            polynomial_degree: None,
            allow_drift: false,
            ignore_clo: false,
            model_outcomes: false,
        }
    }
}

impl ModelOptions {
    /// # Errors
    ///
    /// Returns `CloError` if options are internally inconsistent.
    pub fn validate(&self) -> Result<(), CloError> {
        if self.num_oscillators == 0 {
            return Err(CloError::InvalidOscillatorCount);
        }
        if !(self.init_period > 0.0) {
            return Err(CloError::InvalidPriorConfig);
        }
        Ok(())
    }
}

/// Hyper-parameters of every prior in the model.
#[derive(Debug, Clone)]
pub struct PriorOptions {
    pub init_state_mean: f64,
    pub init_state_sigma: f64,
    pub clo_sigma_shape: f64,
    pub clo_sigma_scale: f64,
    pub poly_sigma_shape: f64,
    pub poly_sigma_scale: f64,
    pub outcome_sigma_shape: f64,
    pub outcome_sigma_scale: f64,
    /// Prior standard deviation of the regression coefficients.
    pub coef_prior_sigma: f64,
    pub gp_scale_shape: f64,
    pub gp_scale_scale: f64,
    pub gp_scale_init: f64,
    pub obs_noise_shape: f64,
    pub obs_noise_scale: f64,
    pub init_noise_sigma: f64,
    pub variance_prior: VariancePriorKind,
    /// Evaluate variance priors on log-transformed values (adds the
    /// Jacobian term).
    pub log_transformed_variance: bool,
    /// Share one dynamics-parameter value across dyads with no variance.
    pub fixed_clo: bool,
}

impl Default for PriorOptions {
    fn default() -> Self {
        Self {
            init_state_mean: 0.0,
            init_state_sigma: 1.0,
            clo_sigma_shape: 1.0,
            clo_sigma_scale: 1.0,
            poly_sigma_shape: 1.0,
            poly_sigma_scale: 1.0,
            outcome_sigma_shape: 1.0,
            outcome_sigma_scale: 1.0,
            coef_prior_sigma: 10.0,
            gp_scale_shape: 1.0,
            gp_scale_scale: 1.0,
            gp_scale_init: 10.0,
            obs_noise_shape: 1.0,
            obs_noise_scale: 1.0,
            init_noise_sigma: 0.5,
            variance_prior: VariancePriorKind::InverseGamma,
            log_transformed_variance: false,
            fixed_clo: false,
        }
    }
}

impl PriorOptions {
    /// Whether all prior hyper-parameters are numerically valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.init_state_sigma > 0.0
            && self.clo_sigma_shape > 0.0
            && self.clo_sigma_scale > 0.0
            && self.poly_sigma_shape > 0.0
            && self.poly_sigma_scale > 0.0
            && self.outcome_sigma_shape > 0.0
            && self.outcome_sigma_scale > 0.0
            && self.coef_prior_sigma > 0.0
            && self.gp_scale_shape > 0.0
            && self.gp_scale_scale > 0.0
            && self.gp_scale_init > 0.0
            && self.obs_noise_shape > 0.0
            && self.obs_noise_scale > 0.0
            && self.init_noise_sigma > 0.0
    }
}

/// Random-walk proposal scales per sampling block.
#[derive(Debug, Clone)]
pub struct ProposalOptions {
    pub init_state_sigma: f64,
    pub clo_param_sigma: f64,
    pub poly_term_sigma: f64,
    pub coef_sigma: f64,
    pub variance_sigma: f64,
    pub obs_coef_sigma: f64,
    pub noise_sigma: f64,
    /// Adapt per-dyad proposal sigmas toward the 0.44 target rate.
    pub adapt: bool,
    /// Seed the init-state proposal sigma from the data variance.
    pub data_driven_state_sigma: bool,
}

impl Default for ProposalOptions {
    fn default() -> Self {
        Self {
            init_state_sigma: 0.1,
            clo_param_sigma: 0.01,
            poly_term_sigma: 0.01,
            coef_sigma: 0.05,
            variance_sigma: 0.05,
            obs_coef_sigma: 0.05,
            noise_sigma: 0.05,
            adapt: true,
            data_driven_state_sigma: true,
        }
    }
}

impl ProposalOptions {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.init_state_sigma > 0.0
            && self.clo_param_sigma > 0.0
            && self.poly_term_sigma > 0.0
            && self.coef_sigma > 0.0
            && self.variance_sigma > 0.0
            && self.obs_coef_sigma > 0.0
            && self.noise_sigma > 0.0
    }
}

/// HMC and gradient step sizes per block.
#[derive(Debug, Clone)]
pub struct StepOptions {
    pub person_hmc_size: f64,
    pub person_grad_size: f64,
    pub person_leapfrog_steps: usize,
    pub shared_hmc_size: f64,
    pub shared_grad_size: f64,
    pub shared_leapfrog_steps: usize,
    pub obs_coef_hmc_size: f64,
    pub obs_coef_grad_size: f64,
    pub noise_hmc_size: f64,
    pub noise_grad_size: f64,
    /// Derive finite-difference steps from parameter magnitudes.
    pub estimate_grad_step: bool,
    /// Sub-steps per iteration of the GP-scale phase.
    pub hmc_iterations: usize,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            person_hmc_size: 1.0e-3,
            person_grad_size: 1.0e-5,
            person_leapfrog_steps: 5,
            shared_hmc_size: 1.0e-3,
            shared_grad_size: 1.0e-5,
            shared_leapfrog_steps: 5,
            obs_coef_hmc_size: 1.0e-3,
            obs_coef_grad_size: 1.0e-5,
            noise_hmc_size: 1.0e-3,
            noise_grad_size: 1.0e-5,
            estimate_grad_step: false,
            hmc_iterations: 5,
        }
    }
}

impl StepOptions {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.person_hmc_size > 0.0
            && self.person_grad_size > 0.0
            && self.person_leapfrog_steps > 0
            && self.shared_hmc_size > 0.0
            && self.shared_grad_size > 0.0
            && self.shared_leapfrog_steps > 0
            && self.obs_coef_hmc_size > 0.0
            && self.obs_coef_grad_size > 0.0
            && self.noise_hmc_size > 0.0
            && self.noise_grad_size > 0.0
            && self.hmc_iterations > 0
    }
}

/// Iteration counts, budgets, and sampler selection for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub num_iterations: usize,
    /// Iterations before the best-posterior snapshot starts tracking.
    pub burn_in_iterations: usize,
    /// Recent-check window for the convergence test.
    pub converge_window: usize,
    /// Minimum best-posterior improvement still counted as progress.
    pub converge_threshold: f64,
    pub time_budget_minutes: f64,
    pub threads: usize,
    pub person_approach: SamplerKind,
    pub shared_approach: SharedSampleKind,
    pub obs_coef_approach: SamplerKind,
    /// Sweeps between plateau checks inside the per-dyad optimizer.
    pub person_check_interval: usize,
    /// Hard sweep cap for the per-dyad optimizer (testing phase).
    pub optimize_max_sweeps: usize,
    /// Fit each dyad independently with no shared hyper-parameters.
    pub fit_fully_independent: bool,
    /// Shared hyper-parameters were supplied externally; do not update.
    pub shared_prior_fixed: bool,
    /// Observation coefficients were supplied externally; do not update.
    pub obs_coefs_fixed: bool,
    /// Per-dyad posterior samples to retain in memory (0 disables).
    pub record_samples: usize,
    /// Checkpoint directory; `None` disables persistence.
    pub output_dir: Option<PathBuf>,
    pub seed: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            num_iterations: 100,
            burn_in_iterations: 0,
            converge_window: 20,
            converge_threshold: 0.5,
            time_budget_minutes: 60.0,
            threads: 2,
            person_approach: SamplerKind::MetropolisHastings,
            shared_approach: SharedSampleKind::Gibbs,
            obs_coef_approach: SamplerKind::MetropolisHastings,
            person_check_interval: 500,
            optimize_max_sweeps: 2_000,
            fit_fully_independent: false,
            shared_prior_fixed: false,
            obs_coefs_fixed: false,
            record_samples: 0,
            output_dir: None,
            seed: 42,
        }
    }
}

impl RunOptions {
    /// # Errors
    ///
    /// Returns `CloError` if options are internally inconsistent.
    pub fn validate(&self) -> Result<(), CloError> {
        if self.num_iterations == 0 {
            return Err(CloError::InvalidIterations);
        }
        if self.threads == 0 {
            return Err(CloError::InvalidThreadCount);
        }
        if !(self.time_budget_minutes > 0.0) {
            return Err(CloError::InvalidTimeBudget);
        }
        if self.person_check_interval == 0 || self.optimize_max_sweeps == 0 {
            return Err(CloError::InvalidIterations);
        }
        Ok(())
    }
}

/// Observation-noise sampling controls.
///
/// The stochastic-MH path only triggers with `mh_trigger_probability` per
/// iteration and then nests `mh_inner_iterations` proposals, amortizing
/// the expensive predictive-posterior evaluation.
#[derive(Debug, Clone)]
pub struct NoiseOptions {
    pub sample_noise_sigma: bool,
    pub approach: NoiseSampleKind,
    pub mh_trigger_probability: f64,
    pub mh_inner_iterations: usize,
}

impl Default for NoiseOptions {
    fn default() -> Self {
        Self {
            sample_noise_sigma: false,
            approach: NoiseSampleKind::Gibbs,
            mh_trigger_probability: 0.2,
            mh_inner_iterations: 20,
        }
    }
}

impl NoiseOptions {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.mh_trigger_probability) && self.mh_inner_iterations > 0
    }
}

/// GP-drift sampler controls.
#[derive(Debug, Clone)]
pub struct DriftOptions {
    /// Interval stride between trajectory control points.
    pub control_point_spacing: usize,
    pub burn_iterations: usize,
    pub sample_iterations: usize,
}

impl Default for DriftOptions {
    fn default() -> Self {
        Self {
            control_point_spacing: 5,
            burn_iterations: 10,
            sample_iterations: 20,
        }
    }
}

impl DriftOptions {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.control_point_spacing > 0 && self.sample_iterations > 0
    }
}

/// Cluster-mixture controls.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub sample_cluster: bool,
    pub num_groups: usize,
    /// Symmetric Dirichlet concentration, split across groups.
    pub group_lambda: f64,
    /// Use the collapsed assignment update instead of explicit weights.
    pub collapsed_gibbs: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            sample_cluster: false,
            num_groups: 1,
            group_lambda: 1.0,
            collapsed_gibbs: false,
        }
    }
}

impl ClusterOptions {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.num_groups >= 1 && self.group_lambda > 0.0
    }
}

/// Full experiment configuration, one block per subsystem.
#[derive(Debug, Clone, Default)]
pub struct CloExperimentConfig {
    pub data: DataOptions,
    pub model: ModelOptions,
    pub prior: PriorOptions,
    pub proposal: ProposalOptions,
    pub steps: StepOptions,
    pub run: RunOptions,
    pub noise: NoiseOptions,
    pub drift: DriftOptions,
    pub cluster: ClusterOptions,
}

impl CloExperimentConfig {
    /// # Errors
    ///
    /// Returns `CloError` if any block or cross-block invariant fails.
    pub fn validate(&self) -> Result<(), CloError> {
        self.data.validate()?;
        self.model.validate()?;
        self.run.validate()?;
        if !self.prior.is_valid() {
            return Err(CloError::InvalidPriorConfig);
        }
        if !self.proposal.is_valid() {
            return Err(CloError::InvalidProposalConfig);
        }
        if !self.steps.is_valid() {
            return Err(CloError::InvalidStepConfig);
        }
        if !self.noise.is_valid() {
            return Err(CloError::InvalidNoiseConfig);
        }
        if !self.drift.is_valid() {
            return Err(CloError::InvalidDriftConfig);
        }
        if !self.cluster.is_valid() {
            return Err(CloError::InvalidClusterConfig);
        }
        if self.model.allow_drift && self.cluster.sample_cluster {
            return Err(CloError::DriftWithClusterUnsupported);
        }
        Ok(())
    }
}

/// Why the training loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    IterationsExhausted,
    Converged,
    TimeBudgetExceeded,
}

/// Wall-clock seconds spent per orchestrator phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimings {
    pub person: f64,
    pub shared: f64,
    pub drift_scale: f64,
    pub obs_coef: f64,
    pub noise: f64,
    pub cluster: f64,
    pub bookkeeping: f64,
}

impl PhaseTimings {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.person
            + self.shared
            + self.drift_scale
            + self.obs_coef
            + self.noise
            + self.cluster
            + self.bookkeeping
    }
}

/// Outcome report of one training or testing run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub iterations_completed: usize,
    pub termination: TerminationReason,
    pub best_log_posterior: f64,
    /// Fitting-window error summed across members.
    pub fitting_error: f64,
    /// Prediction-window error summed across members.
    pub prediction_error: f64,
    pub timings: PhaseTimings,
    /// Per-dyad worker failures tolerated over the whole run.
    pub dyad_failures: usize,
}
