//! Data-free evaluation planning.
//!
//! The planner walks a composition and every composite it references,
//! binding parameters along the way, without touching the data store. The
//! resulting [`EvaluationPlan`] lists each sub-query reference with its
//! cache key, so the engine knows up front which atomic sub-queries are
//! distinct and can prefetch them concurrently.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::cache::CacheKey;
use crate::definition::{CohortDefinition, Composition};
use crate::error::{EngineError, EngineResult};
use crate::params::ParameterMap;
use crate::validate::{check_negations, required_operands};

/// A complete evaluation plan for a composition.
///
/// # Example
///
/// ```ignore
/// let plan = engine.explain(&composition, &params)?;
///
/// println!("{} distinct sub-queries", plan.distinct_count());
/// for step in &plan.steps {
///     println!("{}", step);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct EvaluationPlan {
    /// The composition expression, normalized.
    pub expression: String,
    /// Every sub-query reference, depth first, in order of first appearance.
    pub steps: Vec<PlanStep>,
}

impl EvaluationPlan {
    fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            steps: Vec::new(),
        }
    }

    /// Number of distinct sub-queries (composite or atomic).
    pub fn distinct_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.duplicate).count()
    }

    /// Number of references that reuse another reference's result.
    pub fn duplicate_count(&self) -> usize {
        self.steps.iter().filter(|s| s.duplicate).count()
    }

    /// Distinct sub-queries that call the data store.
    pub fn atomic_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps
            .iter()
            .filter(|s| !s.duplicate && s.definition.is_atomic())
    }
}

impl fmt::Display for EvaluationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Evaluation Plan for: {}", self.expression)?;
        writeln!(
            f,
            "Sub-queries: {} distinct, {} reused",
            self.distinct_count(),
            self.duplicate_count()
        )?;
        writeln!(f)?;
        writeln!(f, "Steps:")?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, step)?;
        }
        Ok(())
    }
}

/// A single sub-query reference in the plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// Operand name in the composition that references it.
    pub operand: String,
    /// Dotted path from the root composition (`outer.inner`).
    pub path: String,
    /// Nesting depth; operands of the root composition have depth 0.
    pub depth: usize,
    /// Definition variant (`observation`, `encounter`, ...).
    pub kind: &'static str,
    /// Parameters bound for this reference.
    pub parameters: ParameterMap,
    /// Cache identity.
    pub key: CacheKey,
    /// True if an earlier step has the same key.
    pub duplicate: bool,
    definition: Arc<CohortDefinition>,
}

impl PlanStep {
    /// The referenced definition.
    pub fn definition(&self) -> &Arc<CohortDefinition> {
        &self.definition
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}: {}", "  ".repeat(self.depth), self.path, self.kind)?;
        if !self.parameters.is_empty() {
            write!(f, " {{{}}}", self.parameters.canonical())?;
        }
        if self.duplicate {
            write!(f, " (reused)")?;
        }
        Ok(())
    }
}

/// Builds the plan for `composition` evaluated with `caller` parameters.
///
/// Fails with the same definition errors evaluation would raise, so a
/// successful plan means evaluation can only fail on data or resource
/// errors.
pub(crate) fn plan(composition: &Composition, caller: &ParameterMap) -> EngineResult<EvaluationPlan> {
    let mut plan = EvaluationPlan::new(composition.expr().to_string());
    let mut seen = HashSet::new();
    plan_composition(composition, caller, "", 0, &mut plan, &mut seen)?;
    Ok(plan)
}

fn plan_composition(
    composition: &Composition,
    caller: &ParameterMap,
    prefix: &str,
    depth: usize,
    plan: &mut EvaluationPlan,
    seen: &mut HashSet<CacheKey>,
) -> EngineResult<()> {
    let operands = required_operands(composition);
    if let Some(missing) = operands
        .iter()
        .find(|name| !composition.searches().contains(name))
    {
        return Err(EngineError::MissingOperand {
            operand: missing.to_string(),
        });
    }
    check_negations(composition.expr(), composition.universe().is_some())?;
    composition.check_parameters(caller)?;

    for name in operands {
        let mapped = match composition.searches().get(name) {
            Some(mapped) => mapped,
            None => continue,
        };
        let bound = mapped
            .mapping()
            .bind(caller)
            .map_err(|err| err.for_operand(name))?;
        let key = mapped.cache_key(&bound);
        let duplicate = !seen.insert(key.clone());
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        };

        plan.steps.push(PlanStep {
            operand: name.to_string(),
            path: path.clone(),
            depth,
            kind: mapped.definition().kind(),
            parameters: bound.clone(),
            key,
            duplicate,
            definition: mapped.definition().clone(),
        });

        if let CohortDefinition::Composite(inner) = mapped.definition().as_ref() {
            if !duplicate {
                plan_composition(inner, &bound, &path, depth + 1, plan, seen)
                    .map_err(|err| err.for_operand(name))?;
            }
        }
    }
    Ok(())
}
