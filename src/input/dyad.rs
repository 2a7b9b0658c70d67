//! Dyadic time-series input containers.
//!
//! This module defines the per-dyad record consumed by the sampler: an
//! ordered time grid, per-member observable series, and scalar moderator
//! and outcome covariates.

use std::collections::BTreeMap;

use thiserror::Error;

/// Sentinel marking a missing observation inside an observable series.
///
/// Missing points contribute neither density nor weight to any likelihood
/// or error sum.
pub const MISSING_VALUE: f64 = -99_999.0;

/// Errors returned when validating dyadic input records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DyadInputError {
    #[error("dyad {id}: at least one observable is required")]
    NoObservables { id: u64 },
    #[error("dyad {id}: time grid must contain at least two points")]
    TooFewTimePoints { id: u64 },
    #[error("dyad {id}: time grid contains non-finite values")]
    NonFiniteTime { id: u64 },
    #[error("dyad {id}: time grid must be strictly increasing")]
    NonIncreasingTime { id: u64 },
    #[error(
        "dyad {id}: observable '{name}' has {found} member series; expected {expected}"
    )]
    MemberCountMismatch {
        id: u64,
        name: String,
        found: usize,
        expected: usize,
    },
    #[error(
        "dyad {id}: observable '{name}' member {member} has {found} points; expected {expected}"
    )]
    SeriesLengthMismatch {
        id: u64,
        name: String,
        member: usize,
        found: usize,
        expected: usize,
    },
    #[error("dyad {id}: moderator '{name}' needs one value per member")]
    ModeratorLengthMismatch { id: u64, name: String },
    #[error("dyad {id}: outcome '{name}' needs one value per member")]
    OutcomeLengthMismatch { id: u64, name: String },
    #[error("observable '{name}' is not present in dyad {id}")]
    UnknownObservable { id: u64, name: String },
    #[error("moderator '{name}' is not present in dyad {id}")]
    UnknownModerator { id: u64, name: String },
}

/// One dyad's record: a shared time grid plus named per-member series.
///
/// Observable series are indexed `[member][time index]`; moderators and
/// outcomes carry one scalar per member. Records are parsed once and then
/// shared read-only across sampler components.
#[derive(Debug, Clone)]
pub struct DyadData {
    pub id: u64,
    pub times: Vec<f64>,
    pub observables: BTreeMap<String, Vec<Vec<f64>>>,
    pub moderators: BTreeMap<String, Vec<f64>>,
    pub outcomes: BTreeMap<String, Vec<f64>>,
}

impl DyadData {
    #[must_use]
    pub const fn new(id: u64, times: Vec<f64>) -> Self {
        Self {
            id,
            times,
            observables: BTreeMap::new(),
            moderators: BTreeMap::new(),
            outcomes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_observable(mut self, name: &str, series: Vec<Vec<f64>>) -> Self {
        self.observables.insert(name.to_owned(), series);
        self
    }

    #[must_use]
    pub fn with_moderator(mut self, name: &str, values: Vec<f64>) -> Self {
        self.moderators.insert(name.to_owned(), values);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, name: &str, values: Vec<f64>) -> Self {
        self.outcomes.insert(name.to_owned(), values);
        self
    }

    /// Number of members, taken from the first observable.
    #[must_use]
    pub fn num_members(&self) -> usize {
        self.observables
            .values()
            .next()
            .map_or(0, |series| series.len())
    }

    /// Observable series for `name`, or an error naming the dyad.
    ///
    /// # Errors
    ///
    /// Returns `DyadInputError::UnknownObservable` if `name` is absent.
    pub fn observable(&self, name: &str) -> Result<&Vec<Vec<f64>>, DyadInputError> {
        self.observables
            .get(name)
            .ok_or_else(|| DyadInputError::UnknownObservable {
                id: self.id,
                name: name.to_owned(),
            })
    }

    /// # Errors
    ///
    /// Returns `DyadInputError` if shapes or values are malformed.
    pub fn validate(&self) -> Result<(), DyadInputError> {
        if self.observables.is_empty() {
            return Err(DyadInputError::NoObservables { id: self.id });
        }
        if self.times.len() < 2 {
            return Err(DyadInputError::TooFewTimePoints { id: self.id });
        }
        if self.times.iter().any(|value| !value.is_finite()) {
            return Err(DyadInputError::NonFiniteTime { id: self.id });
        }
        if self.times.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(DyadInputError::NonIncreasingTime { id: self.id });
        }

        let members = self.num_members();
        for (name, series) in &self.observables {
            if series.len() != members {
                return Err(DyadInputError::MemberCountMismatch {
                    id: self.id,
                    name: name.clone(),
                    found: series.len(),
                    expected: members,
                });
            }
            for (member, values) in series.iter().enumerate() {
                if values.len() != self.times.len() {
                    return Err(DyadInputError::SeriesLengthMismatch {
                        id: self.id,
                        name: name.clone(),
                        member,
                        found: values.len(),
                        expected: self.times.len(),
                    });
                }
            }
        }
        for (name, values) in &self.moderators {
            if values.len() != members {
                return Err(DyadInputError::ModeratorLengthMismatch {
                    id: self.id,
                    name: name.clone(),
                });
            }
        }
        for (name, values) in &self.outcomes {
            if values.len() != members {
                return Err(DyadInputError::OutcomeLengthMismatch {
                    id: self.id,
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Whether an observed value should be excluded from likelihood and error
/// sums.
#[must_use]
pub fn is_missing(value: f64) -> bool {
    value == MISSING_VALUE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_member_dyad() -> DyadData {
        DyadData::new(7, vec![0.0, 0.5, 1.0]).with_observable(
            "dial",
            vec![vec![0.1, 0.2, 0.3], vec![-0.1, 0.0, 0.1]],
        )
    }

    #[test]
    fn validate_accepts_well_formed_record() {
        assert!(two_member_dyad().validate().is_ok());
    }

    #[test]
    fn validate_rejects_series_length_mismatch() {
        let dyad = DyadData::new(7, vec![0.0, 0.5, 1.0])
            .with_observable("dial", vec![vec![0.1, 0.2], vec![-0.1, 0.0, 0.1]]);
        let error = dyad.validate().expect_err("short series should fail");
        assert!(matches!(
            error,
            DyadInputError::SeriesLengthMismatch { member: 0, .. }
        ));
    }

    #[test]
    fn validate_rejects_non_increasing_times() {
        let mut dyad = two_member_dyad();
        dyad.times = vec![0.0, 1.0, 1.0];
        assert_eq!(
            dyad.validate(),
            Err(DyadInputError::NonIncreasingTime { id: 7 })
        );
    }

    #[test]
    fn validate_rejects_moderator_mismatch() {
        let dyad = two_member_dyad().with_moderator("age", vec![30.0]);
        assert!(matches!(
            dyad.validate(),
            Err(DyadInputError::ModeratorLengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_observable_is_reported_with_dyad_id() {
        let dyad = two_member_dyad();
        let error = dyad
            .observable("skin")
            .expect_err("missing observable should fail");
        assert!(matches!(
            error,
            DyadInputError::UnknownObservable { id: 7, .. }
        ));
    }

    #[test]
    fn missing_sentinel_round_trips() {
        assert!(is_missing(MISSING_VALUE));
        assert!(!is_missing(0.0));
    }
}
