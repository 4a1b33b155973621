//! Collaborator traits for cohort evaluation.
//!
//! The engine never touches clinical data itself. Everything it needs comes
//! through [`DataStore`] (facts about subjects) and [`Dictionary`] (concept
//! metadata). Implement both in the application crate that owns the data.
//!
//! # Example: a store backed by a reporting database
//!
//! ```ignore
//! use std::collections::HashSet;
//! use cohort_engine::{
//!     CancellationToken, DataStore, DateRange, ObservationQuery, ParameterMap, StoreError, SubjectId,
//! };
//!
//! impl DataStore for ReportingDb {
//!     fn evaluate_observation_filter(
//!         &self,
//!         query: &ObservationQuery,
//!         token: &CancellationToken,
//!     ) -> Result<HashSet<SubjectId>, StoreError> {
//!         let mut subjects = HashSet::new();
//!         for page in self.obs_pages(query) {
//!             if token.is_cancelled() {
//!                 return Err(StoreError::Cancelled);
//!             }
//!             subjects.extend(page.map_err(|e| StoreError::Backend(e.to_string()))?);
//!         }
//!         Ok(subjects)
//!     }
//!     // ...
//! }
//! ```

use std::collections::HashSet;

use crate::cancel::CancellationToken;
use crate::definition::{ConceptRef, NumericBound, SubjectId};
use crate::error::{EngineResult, StoreError};
use crate::params::{DateRange, ParameterMap};

/// Value constraint with concept codes already resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    /// Coded answer must be one of these concepts.
    Coded(Vec<ConceptRef>),
    /// Numeric value must satisfy every bound.
    Numeric(Vec<NumericBound>),
    /// Text value must match exactly.
    Text(String),
}

/// Fully resolved observation filter, as handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationQuery {
    /// Question concept.
    pub question: ConceptRef,
    /// Optional value constraint. `None` means any value.
    pub value: Option<ResolvedValue>,
    /// Accepted encounter types (empty = any).
    pub encounter_types: Vec<String>,
    /// Observation date range.
    pub range: DateRange,
}

/// Source of subject sets for atomic sub-queries.
///
/// Implementations must be thread-safe: with the `parallel` feature the
/// engine calls them from several worker threads at once. Every call
/// receives the evaluation's [`CancellationToken`]; long-running
/// implementations should poll it and return [`StoreError::Cancelled`]
/// (or [`StoreError::DeadlineExceeded`]) once it fires.
pub trait DataStore: Send + Sync {
    /// Subjects with at least one matching observation.
    fn evaluate_observation_filter(
        &self,
        query: &ObservationQuery,
        token: &CancellationToken,
    ) -> Result<HashSet<SubjectId>, StoreError>;

    /// Subjects with at least one encounter of the given types in `range`.
    ///
    /// An empty type list matches any encounter.
    fn evaluate_encounter_filter(
        &self,
        encounter_types: &[String],
        range: &DateRange,
        token: &CancellationToken,
    ) -> Result<HashSet<SubjectId>, StoreError>;

    /// Subjects for which the named calculation holds.
    ///
    /// `context` holds the sub-query's bound parameters overlaid on the
    /// calculation's fixed parameters.
    fn evaluate_calculation(
        &self,
        name: &str,
        context: &ParameterMap,
        token: &CancellationToken,
    ) -> Result<HashSet<SubjectId>, StoreError>;
}

/// Concept metadata lookup.
pub trait Dictionary: Send + Sync {
    /// Resolves a concept code.
    ///
    /// Fails with [`EngineError::UnknownConcept`](crate::EngineError::UnknownConcept)
    /// when the code is not registered.
    fn resolve_concept(&self, code: &str) -> EngineResult<ConceptRef>;
}
