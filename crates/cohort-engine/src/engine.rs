//! Cohort engine implementation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use cohort_expr::{BinaryOperator, Expr};
use log::debug;

use crate::cache::{EvaluationCache, SubjectSet};
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::definition::{Composition, Searches, SubjectId};
use crate::error::{EngineError, EngineResult};
use crate::params::ParameterMap;
use crate::planner::{self, EvaluationPlan};
use crate::resolver::Evaluation;
use crate::result::{Cohort, EvaluationResult};
use crate::traits::{DataStore, Dictionary};
use crate::validate;

/// Main composition evaluation engine.
///
/// The engine bridges the composition parser (`cohort-expr`), a
/// [`DataStore`] holding clinical facts and a [`Dictionary`] resolving
/// concept codes.
///
/// # Example
///
/// ```rust
/// use chrono::NaiveDate;
/// use cohort_engine::memory::{InMemoryDictionary, InMemoryStore};
/// use cohort_engine::{CohortEngine, EncounterFilter, Mapped, ParameterMap, Searches};
///
/// let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
/// let mut store = InMemoryStore::new();
/// store.add_encounter(1, "APPOINTMENT", day);
/// store.add_encounter(2, "APPOINTMENT", day);
/// store.add_encounter(2, "VISIT", day);
/// let dictionary = InMemoryDictionary::new();
///
/// let period = "onOrAfter=${startDate},onOrBefore=${endDate}";
/// let searches = Searches::new()
///     .with("hasAppointment", Mapped::new(EncounterFilter::new(["APPOINTMENT"]), period).unwrap())
///     .with("hasVisit", Mapped::new(EncounterFilter::new(["VISIT"]), period).unwrap());
/// let params = ParameterMap::new()
///     .with("startDate", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
///     .with("endDate", NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
///
/// let engine = CohortEngine::new(&store, &dictionary);
/// let result = engine.evaluate("hasAppointment NOT hasVisit", &searches, &params).unwrap();
/// assert_eq!(result.to_vec(), vec![1]);
/// ```
pub struct CohortEngine<'a> {
    store: &'a dyn DataStore,
    dictionary: &'a dyn Dictionary,
    config: EngineConfig,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl<'a> CohortEngine<'a> {
    /// Creates an engine with default configuration.
    pub fn new(store: &'a dyn DataStore, dictionary: &'a dyn Dictionary) -> Self {
        Self::with_config(store, dictionary, EngineConfig::default())
    }

    /// Creates an engine with custom configuration.
    ///
    /// ```ignore
    /// let config = EngineConfig::builder()
    ///     .with_max_concurrency(4)
    ///     .with_timeout(Duration::from_secs(30))
    ///     .build();
    ///
    /// let engine = CohortEngine::with_config(&store, &dictionary, config);
    /// ```
    pub fn with_config(
        store: &'a dyn DataStore,
        dictionary: &'a dyn Dictionary,
        config: EngineConfig,
    ) -> Self {
        #[cfg(feature = "parallel")]
        let pool = if config.runs_parallel() {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(config.max_concurrency)
                .thread_name(|i| format!("cohort-eval-{}", i))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(err) => {
                    log::warn!("falling back to sequential evaluation: {}", err);
                    None
                }
            }
        } else {
            None
        };

        Self {
            store,
            dictionary,
            config,
            #[cfg(feature = "parallel")]
            pool,
        }
    }

    /// Returns a reference to the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parses and evaluates a composition string against `searches`.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Syntax`] if the string does not parse
    /// * [`EngineError::MissingOperand`] if an operand has no binding; no
    ///   data is accessed in that case
    /// * [`EngineError::SubQueryEvaluation`] if the data store fails
    pub fn evaluate(
        &self,
        expression: &str,
        searches: &Searches,
        params: &ParameterMap,
    ) -> EngineResult<EvaluationResult> {
        let composition = Composition::from_parts(expression, searches.clone())?;
        self.evaluate_composition(&composition, params)
    }

    /// Evaluates a composition.
    pub fn evaluate_composition(
        &self,
        composition: &Composition,
        params: &ParameterMap,
    ) -> EngineResult<EvaluationResult> {
        self.evaluate_with_token(composition, params, &CancellationToken::new())
    }

    /// Evaluates a composition under a caller-controlled cancellation token.
    pub fn evaluate_with_token(
        &self,
        composition: &Composition,
        params: &ParameterMap,
        token: &CancellationToken,
    ) -> EngineResult<EvaluationResult> {
        let cache = EvaluationCache::new();
        self.evaluate_in(&cache, composition, params, token)
    }

    /// Evaluates a composition using an existing cache.
    ///
    /// Sub-query results already in `cache` are reused without touching the
    /// data store. Used to share work across a batch of related
    /// evaluations.
    pub fn evaluate_in(
        &self,
        cache: &EvaluationCache,
        composition: &Composition,
        params: &ParameterMap,
        token: &CancellationToken,
    ) -> EngineResult<EvaluationResult> {
        let start = Instant::now();
        let token = match self.config.timeout {
            Some(timeout) => token.child_with_timeout(timeout),
            None => token.child(),
        };

        let parameters = composition.check_parameters(params)?;
        let plan = planner::plan(composition, params)?;
        debug!(
            "evaluating '{}': {} sub-query references, {} distinct",
            composition.label(),
            plan.steps.len(),
            plan.distinct_count()
        );

        let evaluation = Evaluation::new(self.store, self.dictionary, cache, token);
        let parallel = self.prefetch(&evaluation, &plan)?;
        let subjects = evaluation.evaluate_composition(composition, params)?;

        if let Some(limit) = self.config.max_results {
            if subjects.len() > limit {
                return Err(EngineError::ResultTooLarge {
                    count: subjects.len(),
                    limit,
                });
            }
        }

        let stats = evaluation.stats(start.elapsed(), parallel);
        debug!(
            "evaluated '{}': {} subjects in {:?} ({} computed, {} cached)",
            composition.label(),
            subjects.len(),
            stats.duration,
            stats.computations,
            stats.cache_hits
        );

        let subjects = Arc::try_unwrap(subjects).unwrap_or_else(|shared| (*shared).clone());
        Ok(EvaluationResult::new(Cohort::new(subjects), parameters, stats))
    }

    /// Checks a composition string without accessing data.
    ///
    /// Returns every problem found; an empty vector means the composition
    /// can be evaluated given the right parameters. Same as
    /// [`validate_expression`](crate::validate_expression).
    pub fn validate(&self, expression: &str, searches: &Searches) -> Vec<EngineError> {
        validate::validate_expression(expression, searches)
    }

    /// Checks a composition without accessing data. Same as
    /// [`validate`](crate::validate).
    pub fn validate_composition(&self, composition: &Composition) -> Vec<EngineError> {
        validate::validate(composition)
    }

    /// Builds the evaluation plan without accessing data.
    pub fn explain(
        &self,
        composition: &Composition,
        params: &ParameterMap,
    ) -> EngineResult<EvaluationPlan> {
        planner::plan(composition, params)
    }

    /// Computes the distinct atomic sub-queries of `plan` concurrently.
    ///
    /// The first failure cancels the evaluation token so that in-flight
    /// siblings stop early, and is the error reported.
    #[cfg(feature = "parallel")]
    fn prefetch(&self, evaluation: &Evaluation<'_>, plan: &EvaluationPlan) -> EngineResult<bool> {
        use rayon::prelude::*;

        let pool = match &self.pool {
            Some(pool) => pool,
            None => return Ok(false),
        };
        let steps: Vec<_> = plan.atomic_steps().collect();
        if steps.len() < 2 {
            return Ok(false);
        }

        debug!(
            "prefetching {} sub-queries on {} workers",
            steps.len(),
            pool.current_num_threads()
        );
        let first_failure = parking_lot::Mutex::new(None);
        let outcome = pool.install(|| {
            steps.par_iter().try_for_each(|step| {
                evaluation.resolve_step(step).map(|_| ()).map_err(|err| {
                    let mut first = first_failure.lock();
                    if first.is_none() {
                        *first = Some(err.clone());
                        evaluation.token.cancel();
                    }
                    err
                })
            })
        });

        match outcome {
            Ok(()) => Ok(true),
            Err(err) => Err(first_failure.into_inner().unwrap_or(err)),
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn prefetch(&self, _evaluation: &Evaluation<'_>, _plan: &EvaluationPlan) -> EngineResult<bool> {
        Ok(false)
    }
}

impl std::fmt::Debug for CohortEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohortEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Boolean evaluation
// =============================================================================

impl Evaluation<'_> {
    /// Evaluates `composition` with `caller` as its parameters.
    pub(crate) fn evaluate_composition(
        &self,
        composition: &Composition,
        caller: &ParameterMap,
    ) -> EngineResult<SubjectSet> {
        let universe = match composition.universe() {
            Some(name) => Some(self.operand(composition, name, caller)?),
            None => None,
        };
        self.evaluate_expr(composition.expr(), composition, caller, universe.as_deref())
    }

    fn operand(
        &self,
        composition: &Composition,
        name: &str,
        caller: &ParameterMap,
    ) -> EngineResult<SubjectSet> {
        let mapped = composition
            .searches()
            .get(name)
            .ok_or_else(|| EngineError::MissingOperand {
                operand: name.to_string(),
            })?;
        self.resolve(name, mapped, caller)
    }

    fn evaluate_expr(
        &self,
        expr: &Expr,
        composition: &Composition,
        caller: &ParameterMap,
        universe: Option<&HashSet<SubjectId>>,
    ) -> EngineResult<SubjectSet> {
        let eval = |e: &Expr| self.evaluate_expr(e, composition, caller, universe);

        match expr {
            Expr::Operand(name) => self.operand(composition, name, caller),
            Expr::Nested(inner) => eval(&**inner),
            Expr::Not(inner) => match universe {
                Some(universe) => {
                    let excluded = eval(&**inner)?;
                    Ok(Arc::new(difference(universe, &excluded)))
                }
                None => Err(EngineError::InvalidExpression(format!(
                    "'{}' has nothing to complement against",
                    expr
                ))),
            },
            Expr::And(..) | Expr::Or(..) => {
                // Folded along the left spine so chain length costs no stack.
                let (head, links) = expr.chain();
                let mut acc = Lhs::Pending(head);
                for (operator, right) in links {
                    let set = self.combine(operator, acc, right, &eval, universe.is_some())?;
                    acc = Lhs::Ready(set);
                }
                acc.resolve(&eval)
            }
        }
    }

    /// Applies `left <operator> right`. Without a universe, a negated
    /// operand is complemented against its sibling.
    fn combine(
        &self,
        operator: BinaryOperator,
        left: Lhs<'_>,
        right: &Expr,
        eval: &dyn Fn(&Expr) -> EngineResult<SubjectSet>,
        has_universe: bool,
    ) -> EngineResult<SubjectSet> {
        if !has_universe {
            if let Lhs::Pending(expr) = &left {
                if let Some(negated) = expr.as_negation() {
                    if right.as_negation().is_some() {
                        return Err(EngineError::InvalidExpression(format!(
                            "'{} {} {}' negates both operands",
                            expr, operator, right
                        )));
                    }
                    let base = eval(right)?;
                    let excluded = eval(negated)?;
                    return Ok(relative_complement(operator, base, &excluded));
                }
            }
            if let Some(negated) = right.as_negation() {
                let base = left.resolve(eval)?;
                let excluded = eval(negated)?;
                return Ok(relative_complement(operator, base, &excluded));
            }
        }

        let lhs = left.resolve(eval)?;
        let rhs = eval(right)?;
        Ok(Arc::new(match operator {
            BinaryOperator::And => intersection(&lhs, &rhs),
            BinaryOperator::Or => union(&lhs, &rhs),
        }))
    }
}

/// Left operand of a chain link: the unevaluated head, or the set folded
/// so far.
enum Lhs<'e> {
    Pending(&'e Expr),
    Ready(SubjectSet),
}

impl Lhs<'_> {
    fn resolve(self, eval: &dyn Fn(&Expr) -> EngineResult<SubjectSet>) -> EngineResult<SubjectSet> {
        match self {
            Lhs::Pending(expr) => eval(expr),
            Lhs::Ready(set) => Ok(set),
        }
    }
}

/// `base AND NOT excluded` or `base OR NOT excluded`, with `base` as the
/// universe of the negation.
fn relative_complement(
    operator: BinaryOperator,
    base: SubjectSet,
    excluded: &HashSet<SubjectId>,
) -> SubjectSet {
    match operator {
        BinaryOperator::And => Arc::new(difference(&base, excluded)),
        BinaryOperator::Or => base,
    }
}

fn intersection(a: &HashSet<SubjectId>, b: &HashSet<SubjectId>) -> HashSet<SubjectId> {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().filter(|id| large.contains(id)).copied().collect()
}

fn union(a: &HashSet<SubjectId>, b: &HashSet<SubjectId>) -> HashSet<SubjectId> {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut out = large.clone();
    out.extend(small.iter().copied());
    out
}

fn difference(a: &HashSet<SubjectId>, b: &HashSet<SubjectId>) -> HashSet<SubjectId> {
    a.iter().filter(|id| !b.contains(id)).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::definition::{CohortDefinition, Mapped};
    use crate::error::StoreError;
    use crate::params::{DateRange, ParameterType};
    use crate::traits::ObservationQuery;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock store answering calculation calls from a fixed table.
    struct MockStore {
        sets: HashMap<String, HashSet<SubjectId>>,
        calls: AtomicUsize,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                sets: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn with_set(mut self, name: &str, ids: &[SubjectId]) -> Self {
            self.sets.insert(name.to_string(), ids.iter().copied().collect());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DataStore for MockStore {
        fn evaluate_observation_filter(
            &self,
            _query: &ObservationQuery,
            _token: &CancellationToken,
        ) -> Result<HashSet<SubjectId>, StoreError> {
            Err(StoreError::Backend("not supported".into()))
        }

        fn evaluate_encounter_filter(
            &self,
            _types: &[String],
            _range: &DateRange,
            _token: &CancellationToken,
        ) -> Result<HashSet<SubjectId>, StoreError> {
            Err(StoreError::Backend("not supported".into()))
        }

        fn evaluate_calculation(
            &self,
            name: &str,
            _context: &ParameterMap,
            _token: &CancellationToken,
        ) -> Result<HashSet<SubjectId>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sets
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::Backend(format!("unknown set {}", name)))
        }
    }

    struct NoConcepts;

    impl Dictionary for NoConcepts {
        fn resolve_concept(&self, code: &str) -> EngineResult<crate::ConceptRef> {
            Err(EngineError::UnknownConcept(code.to_string()))
        }
    }

    fn set_of(name: &str) -> Mapped {
        Mapped::unmapped(CohortDefinition::Calculation(crate::CalculationFilter::new(name)))
    }

    /// A = {1,2,3}, B = {2,3,4}, U = {1..6}
    fn create_test_store() -> MockStore {
        MockStore::new()
            .with_set("A", &[1, 2, 3])
            .with_set("B", &[2, 3, 4])
            .with_set("U", &[1, 2, 3, 4, 5, 6])
    }

    fn searches() -> Searches {
        Searches::new()
            .with("A", set_of("A"))
            .with("B", set_of("B"))
            .with("U", set_of("U"))
    }

    fn run(store: &MockStore, expression: &str) -> EngineResult<Vec<SubjectId>> {
        let engine = CohortEngine::with_config(store, &NoConcepts, EngineConfig::sequential());
        engine
            .evaluate(expression, &searches(), &ParameterMap::new())
            .map(|result| result.to_vec())
    }

    #[test]
    fn test_and_or_not() {
        let store = create_test_store();
        assert_eq!(run(&store, "A AND B").unwrap(), vec![2, 3]);
        assert_eq!(run(&store, "A OR B").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(run(&store, "A AND NOT B").unwrap(), vec![1]);
        assert_eq!(run(&store, "NOT B AND A").unwrap(), vec![1]);
        assert_eq!(run(&store, "A NOT B").unwrap(), vec![1]);
        assert_eq!(run(&store, "A OR NOT B").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_left_to_right_chain() {
        let store = create_test_store();
        // (A OR B) AND U, not A OR (B AND U)
        assert_eq!(run(&store, "A OR B AND U").unwrap(), vec![1, 2, 3, 4]);
        // (U AND A) OR B
        assert_eq!(run(&store, "U AND A OR B").unwrap(), vec![1, 2, 3, 4]);
        // (B OR A) AND NOT B
        assert_eq!(run(&store, "B OR A AND NOT B").unwrap(), vec![1]);
    }

    #[test]
    fn test_bare_not_without_universe() {
        let store = create_test_store();
        assert!(matches!(
            run(&store, "NOT A"),
            Err(EngineError::InvalidExpression(_))
        ));
        assert!(matches!(
            run(&store, "NOT A AND NOT B"),
            Err(EngineError::InvalidExpression(_))
        ));
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_not_with_universe() {
        let store = create_test_store();
        let engine = CohortEngine::with_config(&store, &NoConcepts, EngineConfig::sequential());
        let composition = Composition::from_parts("NOT A AND NOT B", searches())
            .unwrap()
            .with_universe("U");
        let result = engine
            .evaluate_composition(&composition, &ParameterMap::new())
            .unwrap();
        assert_eq!(result.to_vec(), vec![5, 6]);
    }

    #[test]
    fn test_missing_operand_makes_no_calls() {
        let store = create_test_store();
        let err = run(&store, "A AND C").unwrap_err();
        assert_eq!(
            err,
            EngineError::MissingOperand {
                operand: "C".into()
            }
        );
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_repeated_operand_computed_once() {
        let store = create_test_store();
        assert_eq!(run(&store, "(A AND B) OR (A AND NOT B)").unwrap(), vec![1, 2, 3]);
        assert_eq!(store.calls(), 2);
    }

    #[test]
    fn test_stats_and_declared_parameters() {
        let store = create_test_store();
        let engine = CohortEngine::with_config(&store, &NoConcepts, EngineConfig::sequential());
        let composition = Composition::from_parts("A AND A", searches())
            .unwrap()
            .with_parameter("endDate", ParameterType::Date);
        let params = ParameterMap::new()
            .with("endDate", "2024-01-31")
            .with("unrelated", 1.0);

        let result = engine.evaluate_composition(&composition, &params).unwrap();
        assert_eq!(result.parameters.len(), 1);
        assert!(result.parameters.contains("endDate"));
        assert_eq!(result.stats.references, 2);
        assert_eq!(result.stats.computations, 1);
        assert_eq!(result.stats.cache_hits, 1);
        assert!(!result.stats.parallel);
    }

    #[test]
    fn test_max_results() {
        let store = create_test_store();
        let config = EngineConfig::builder()
            .with_parallel(false)
            .with_max_results(2)
            .build();
        let engine = CohortEngine::with_config(&store, &NoConcepts, config);
        let err = engine
            .evaluate("A OR B", &searches(), &ParameterMap::new())
            .unwrap_err();
        assert_eq!(err, EngineError::ResultTooLarge { count: 4, limit: 2 });
    }

    #[test]
    fn test_store_failure_wrapped() {
        let store = MockStore::new().with_set("A", &[1]);
        let engine = CohortEngine::with_config(&store, &NoConcepts, EngineConfig::sequential());
        let err = engine
            .evaluate("A AND B", &searches(), &ParameterMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::SubQueryEvaluation { ref operand, .. } if operand == "B"
        ));
    }

    #[test]
    fn test_validate_collects_errors() {
        let store = create_test_store();
        let engine = CohortEngine::new(&store, &NoConcepts);
        assert!(engine.validate("A AND NOT B", &searches()).is_empty());
        assert_eq!(engine.validate("A AND", &searches()).len(), 1);
        assert_eq!(engine.validate("NOT X", &searches()).len(), 2);
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_set_helpers() {
        let a: HashSet<SubjectId> = [1, 2, 3].into_iter().collect();
        let b: HashSet<SubjectId> = [3, 4].into_iter().collect();
        let mut u: Vec<_> = union(&a, &b).into_iter().collect();
        u.sort_unstable();
        assert_eq!(u, vec![1, 2, 3, 4]);
        assert_eq!(intersection(&a, &b).len(), 1);
        assert_eq!(difference(&a, &b).len(), 2);
    }
}
