//! # Models
//!
//! Model implementations for dyadic time-series dynamics. The coupled
//! linear oscillator family lives in `clo`: per-dyad state-space models,
//! population-shared priors, and the hierarchical sampler.

pub mod clo;
