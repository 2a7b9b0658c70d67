//! # Model inputs
//!
//! Per-dyad time-series records consumed by the population sampler, plus
//! their validation errors. Records are produced by an external parsing
//! collaborator and treated as read-only here.

pub mod dyad;

pub use dyad::{DyadData, DyadInputError, MISSING_VALUE, is_missing};
