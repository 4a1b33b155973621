//! Sub-query resolution.
//!
//! Binds an operand's parameters, consults the evaluation cache and, on a
//! miss, evaluates the definition: atomic variants go to the data store,
//! composites recurse into the boolean evaluator.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};

use crate::cache::{CacheKey, EvaluationCache, Lookup, SubjectSet};
use crate::cancel::CancellationToken;
use crate::definition::{
    CalculationFilter, CohortDefinition, Mapped, ObservationFilter, SubjectId, ValueConstraint,
};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::params::ParameterMap;
use crate::planner::PlanStep;
use crate::result::EvaluationStats;
use crate::traits::{DataStore, Dictionary, ObservationQuery, ResolvedValue};

#[derive(Debug, Default)]
struct Counters {
    references: AtomicUsize,
    computations: AtomicUsize,
    hits: AtomicUsize,
    waits: AtomicUsize,
}

/// State of one top-level evaluation.
pub(crate) struct Evaluation<'a> {
    store: &'a dyn DataStore,
    dictionary: &'a dyn Dictionary,
    cache: &'a EvaluationCache,
    pub(crate) token: CancellationToken,
    counters: Counters,
}

impl<'a> Evaluation<'a> {
    pub(crate) fn new(
        store: &'a dyn DataStore,
        dictionary: &'a dyn Dictionary,
        cache: &'a EvaluationCache,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            dictionary,
            cache,
            token,
            counters: Counters::default(),
        }
    }

    /// Resolves `operand` bound through `mapped` against `caller`.
    pub(crate) fn resolve(
        &self,
        operand: &str,
        mapped: &Mapped,
        caller: &ParameterMap,
    ) -> EngineResult<SubjectSet> {
        let bound = mapped
            .mapping()
            .bind(caller)
            .map_err(|err| err.for_operand(operand))?;
        let key = mapped.cache_key(&bound);
        self.resolve_bound(operand, mapped.definition(), &key, &bound)
    }

    /// Resolves a planned step.
    pub(crate) fn resolve_step(&self, step: &PlanStep) -> EngineResult<SubjectSet> {
        self.resolve_bound(&step.operand, step.definition(), &step.key, &step.parameters)
    }

    fn resolve_bound(
        &self,
        operand: &str,
        definition: &Arc<CohortDefinition>,
        key: &CacheKey,
        bound: &ParameterMap,
    ) -> EngineResult<SubjectSet> {
        self.counters.references.fetch_add(1, Ordering::Relaxed);
        self.token.check()?;

        let (set, lookup) = self.cache.get_or_compute(key, &self.token, || {
            trace!("computing {} sub-query '{}' ({})", definition.kind(), operand, key);
            self.compute(operand, definition, bound)
        })?;

        let counter = match lookup {
            Lookup::Hit => &self.counters.hits,
            Lookup::Computed => &self.counters.computations,
            Lookup::Waited => &self.counters.waits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(set)
    }

    fn compute(
        &self,
        operand: &str,
        definition: &CohortDefinition,
        bound: &ParameterMap,
    ) -> EngineResult<HashSet<SubjectId>> {
        match definition {
            CohortDefinition::Observation(filter) => self.observation(operand, filter, bound),
            CohortDefinition::Encounter(filter) => {
                let range = bound.date_range()?;
                self.store
                    .evaluate_encounter_filter(&filter.encounter_types, &range, &self.token)
                    .map_err(|err| self.store_error(operand, err))
            }
            CohortDefinition::Calculation(filter) => self.calculation(operand, filter, bound),
            CohortDefinition::Composite(composition) => {
                let set = self
                    .evaluate_composition(composition, bound)
                    .map_err(|err| err.for_operand(operand))?;
                Ok(Arc::try_unwrap(set).unwrap_or_else(|shared| (*shared).clone()))
            }
        }
    }

    fn observation(
        &self,
        operand: &str,
        filter: &ObservationFilter,
        bound: &ParameterMap,
    ) -> EngineResult<HashSet<SubjectId>> {
        let question = self.dictionary.resolve_concept(&filter.question)?;
        let value = match &filter.value {
            None => None,
            Some(ValueConstraint::Coded(codes)) => {
                let mut answers = Vec::with_capacity(codes.len());
                for code in codes {
                    match self.dictionary.resolve_concept(code) {
                        Ok(concept) => answers.push(concept),
                        Err(EngineError::UnknownConcept(missing))
                            if filter.tolerate_missing_answers =>
                        {
                            warn!("sub-query '{}': skipping unknown answer concept {}", operand, missing);
                        }
                        Err(err) => return Err(err),
                    }
                }
                if answers.is_empty() {
                    None
                } else {
                    Some(ResolvedValue::Coded(answers))
                }
            }
            Some(ValueConstraint::Numeric(bounds)) => Some(ResolvedValue::Numeric(bounds.clone())),
            Some(ValueConstraint::Text(text)) => Some(ResolvedValue::Text(text.clone())),
        };

        let query = ObservationQuery {
            question,
            value,
            encounter_types: filter.encounter_types.clone(),
            range: bound.date_range()?,
        };
        self.store
            .evaluate_observation_filter(&query, &self.token)
            .map_err(|err| self.store_error(operand, err))
    }

    fn calculation(
        &self,
        operand: &str,
        filter: &CalculationFilter,
        bound: &ParameterMap,
    ) -> EngineResult<HashSet<SubjectId>> {
        let mut context = filter.parameters.clone();
        for (name, value) in bound.iter() {
            context.insert(name, value.clone());
        }
        self.store
            .evaluate_calculation(&filter.name, &context, &self.token)
            .map_err(|err| self.store_error(operand, err))
    }

    /// Maps a store failure, preferring the token's own reason when the
    /// store stopped because the token fired.
    fn store_error(&self, operand: &str, err: StoreError) -> EngineError {
        match err {
            StoreError::Cancelled | StoreError::DeadlineExceeded => match self.token.check() {
                Err(reason) => reason,
                Ok(()) => EngineError::SubQueryEvaluation {
                    operand: operand.to_string(),
                    message: err.to_string(),
                },
            },
            StoreError::Backend(message) => EngineError::SubQueryEvaluation {
                operand: operand.to_string(),
                message,
            },
        }
    }

    pub(crate) fn stats(&self, duration: Duration, parallel: bool) -> EvaluationStats {
        EvaluationStats {
            duration,
            references: self.counters.references.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
            cache_hits: self.counters.hits.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            parallel,
        }
    }
}
