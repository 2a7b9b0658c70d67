#![forbid(unsafe_code)]

//! # `coupled_oscillator_models`
//!
//! Hierarchical Bayesian coupled-linear-oscillator models for dyadic
//! time series: per-dyad latent trajectories with population-shared
//! priors, fit by a Gibbs-style block sampler mixing Metropolis-Hastings
//! and Hamiltonian Monte Carlo updates with multi-threaded per-dyad
//! rounds, adaptive step sizes, convergence detection, and wall-clock
//! budgets.
//!
//! The crate was developed for paired physiological and behavioral
//! signals from two-person interactions, but the API only assumes a
//! fixed-size member count per dyad.

pub mod inference;
pub mod input;
pub mod models;
pub mod preprocess;
pub mod utils;

pub use inference::{
    AdaptState, FiniteDifferenceGradient, GradientEstimator, HmcStep, InferenceError, MhStep,
    ParameterAdapter, ProposalStats, Proposer, StepSizeTuning, TargetDensity,
};
pub use input::{DyadData, DyadInputError, MISSING_VALUE, is_missing};
pub use preprocess::{
    ObservableStats, estimate_init_state, observable_stats, smooth_data, standardize_observable,
    training_length,
};

pub use models::clo::{
    BaselineKind, CheckpointError, CloError, CloExperimentConfig, ClusterOptions,
    CoupledOscillator, CrossValidationOptions, CrossValidationReport, DataOptions, DriftOptions,
    DyadPosterior, FoldResult, GroupParams, Likelihood, LikelihoodWindow, LinearStateSpace,
    LssSet, ModelOptions, NoiseOptions, NoiseSampleKind, PhaseTimings, PopulationPosterior,
    PopulationSampler, PosteriorTerms, PriorOptions, ProposalOptions, RunOptions, SamplerKind,
    SharedSampleKind, StepOptions, TerminationReason, TrainReport, VariancePriorKind,
    baseline_error, compute_ave_error, compute_error, compute_population_error, cross_validate,
    fit_clo_population, read_population, render_error_table, write_population,
};
