//! Result types for cohort evaluation.

use std::collections::HashSet;
use std::time::Duration;

use crate::definition::SubjectId;
use crate::params::ParameterMap;

/// A set of subjects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cohort {
    subjects: HashSet<SubjectId>,
}

impl Cohort {
    /// Creates a cohort from a subject set.
    pub fn new(subjects: HashSet<SubjectId>) -> Self {
        Self { subjects }
    }

    /// Creates an empty cohort.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of subjects.
    pub fn count(&self) -> usize {
        self.subjects.len()
    }

    /// Returns true if the cohort has no subjects.
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Returns true if `subject` is a member.
    pub fn contains(&self, subject: SubjectId) -> bool {
        self.subjects.contains(&subject)
    }

    /// Iterates over members in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &SubjectId> {
        self.subjects.iter()
    }

    /// Members in ascending order.
    pub fn to_vec(&self) -> Vec<SubjectId> {
        let mut vec: Vec<SubjectId> = self.subjects.iter().copied().collect();
        vec.sort_unstable();
        vec
    }

    /// The underlying set.
    pub fn as_set(&self) -> &HashSet<SubjectId> {
        &self.subjects
    }

    /// Consumes the cohort, returning the underlying set.
    pub fn into_set(self) -> HashSet<SubjectId> {
        self.subjects
    }

    /// Subjects present in both cohorts.
    pub fn intersection(&self, other: &Cohort) -> Cohort {
        Cohort::new(self.subjects.intersection(&other.subjects).copied().collect())
    }
}

impl FromIterator<SubjectId> for Cohort {
    fn from_iter<I: IntoIterator<Item = SubjectId>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for Cohort {
    type Item = SubjectId;
    type IntoIter = std::collections::hash_set::IntoIter<SubjectId>;

    fn into_iter(self) -> Self::IntoIter {
        self.subjects.into_iter()
    }
}

impl<'a> IntoIterator for &'a Cohort {
    type Item = &'a SubjectId;
    type IntoIter = std::collections::hash_set::Iter<'a, SubjectId>;

    fn into_iter(self) -> Self::IntoIter {
        self.subjects.iter()
    }
}

/// Result of evaluating a composition.
///
/// # Example
///
/// ```ignore
/// let result = engine.evaluate("A AND NOT B", &searches, &params)?;
///
/// println!("{} subjects", result.count());
/// for (name, value) in result.parameters.iter() {
///     println!("{} = {}", name, value);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// The evaluated cohort.
    pub cohort: Cohort,
    /// Declared parameters with the values they were bound to.
    pub parameters: ParameterMap,
    /// Evaluation statistics.
    pub stats: EvaluationStats,
}

impl EvaluationResult {
    /// Creates a new EvaluationResult.
    pub fn new(cohort: Cohort, parameters: ParameterMap, stats: EvaluationStats) -> Self {
        Self {
            cohort,
            parameters,
            stats,
        }
    }

    /// Number of subjects in the cohort.
    pub fn count(&self) -> usize {
        self.cohort.count()
    }

    /// Returns true if the cohort is empty.
    pub fn is_empty(&self) -> bool {
        self.cohort.is_empty()
    }

    /// Returns true if `subject` is in the cohort.
    pub fn contains(&self, subject: SubjectId) -> bool {
        self.cohort.contains(subject)
    }

    /// Members in ascending order.
    pub fn to_vec(&self) -> Vec<SubjectId> {
        self.cohort.to_vec()
    }
}

/// Statistics from one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationStats {
    /// Wall-clock duration.
    pub duration: Duration,
    /// Sub-query references resolved, counting repeats.
    pub references: usize,
    /// Sub-queries computed (atomic ones hit the data store).
    pub computations: usize,
    /// References answered from a ready cache entry.
    pub cache_hits: usize,
    /// References that waited on a concurrent computation.
    pub waits: usize,
    /// Whether independent sub-queries ran concurrently.
    pub parallel: bool,
}
