//! Hierarchical Bayesian coupled-linear-oscillator population models.
//!
//! A population of per-dyad linear state-space models shares regression
//! priors over its dynamics parameters; the sampler alternates parallel
//! per-dyad MCMC updates with shared hyper-parameter, observation, noise,
//! and cluster updates, tracking the best joint posterior snapshot.

pub mod adapters;
pub mod checkpoint;
pub mod cross_validate;
pub mod diagnostics;
pub mod likelihood;
pub mod oscillator;
pub mod population;
pub mod posterior;
pub mod priors;
pub mod proposers;
pub mod sampler;
pub mod state_space;
pub mod types;
pub mod worker;

pub use checkpoint::{CheckpointError, read_population, write_population};
pub use cross_validate::{
    CrossValidationOptions, CrossValidationReport, FoldResult, cross_validate,
};
pub use diagnostics::{
    BaselineKind, baseline_error, compute_ave_error, compute_error, compute_population_error,
    compute_sample_error, render_error_table,
};
pub use likelihood::{Likelihood, LikelihoodWindow};
pub use oscillator::{CoupledOscillator, default_params, param_length};
pub use population::{GroupParams, LssSet};
pub use posterior::{DyadPosterior, PopulationPosterior, PosteriorTerms};
pub use priors::{
    BlrHyperPrior, ClusterPrior, GpScalePrior, InitStatePrior, NoisePrior, SharedPrior,
    VariancePrior,
};
pub use sampler::{PopulationSampler, fit_clo_population};
pub use state_space::LinearStateSpace;
pub use types::{
    CloError, CloExperimentConfig, ClusterOptions, DataOptions, DriftOptions, ModelOptions,
    NoiseOptions, NoiseSampleKind, PhaseTimings, PriorOptions, ProposalOptions, RunOptions,
    SamplerKind, SharedSampleKind, StepOptions, TerminationReason, TrainReport,
    VariancePriorKind,
};
