//! # cohort-engine
//!
//! Evaluation engine for parameterized cohort compositions.
//!
//! A composition is a boolean expression (`AND`, `OR`, `NOT`, parentheses)
//! over named operands. Each operand is bound to a sub-query definition
//! together with a parameter mapping that derives the sub-query's
//! parameters from the caller's. Evaluating a composition yields the set of
//! subjects that satisfy it.
//!
//! ## Key Features
//!
//! - **Single evaluation per sub-query** - identical definitions with
//!   identical bound parameters are computed once per evaluation, even when
//!   requested concurrently
//! - **Nested compositions** - a composition can be an operand of another
//! - **Date offsets** - mappings like `onOrBefore=${endDate-1d}`
//! - **Optional parallelism** - enable the `parallel` feature to prefetch
//!   independent sub-queries on a bounded thread pool
//! - **Cancellation** - timeouts and caller tokens stop work early
//!
//! ## Quick Start
//!
//! ```ignore
//! use cohort_engine::{CohortEngine, EncounterFilter, Mapped, ParameterMap, Searches};
//!
//! let period = "onOrAfter=${startDate},onOrBefore=${endDate}";
//! let searches = Searches::new()
//!     .with("hasAppointment", Mapped::new(EncounterFilter::new(["APPOINTMENT"]), period)?)
//!     .with("hasVisit", Mapped::new(EncounterFilter::new(["VISIT"]), period)?);
//!
//! let engine = CohortEngine::new(&store, &dictionary);
//! let missed = engine.evaluate("hasAppointment AND NOT hasVisit", &searches, &params)?;
//! println!("{} subjects missed their appointment", missed.count());
//! ```
//!
//! ## With Configuration
//!
//! ```ignore
//! use cohort_engine::{CohortEngine, EngineConfig};
//! use std::time::Duration;
//!
//! let config = EngineConfig::builder()
//!     .with_max_concurrency(8)
//!     .with_timeout(Duration::from_secs(60))
//!     .with_max_results(1_000_000)
//!     .build();
//!
//! let engine = CohortEngine::with_config(&store, &dictionary, config);
//! ```
//!
//! ## Expression Semantics
//!
//! | Form | Example | Result |
//! |------|---------|--------|
//! | Operand | `A` | subjects of `A` |
//! | AND | `A AND B` | intersection |
//! | OR | `A OR B` | union |
//! | AND NOT | `A AND NOT B` | `A` minus `B` |
//! | Implicit AND | `A NOT B` | `A` minus `B` |
//! | OR NOT | `A OR NOT B` | `A` |
//! | Bare NOT | `NOT A` | complement, needs a universe |
//!
//! `AND` and `OR` have equal precedence and combine left to right.
//!
//! ## Feature Flags
//!
//! - `parallel` - Enables concurrent sub-query evaluation using rayon
//! - `serde` - Serialize and deserialize definitions and results
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      cohort-engine                           │
//! │                                                              │
//! │  CohortEngine                                                │
//! │  ├── parse composition → Expr (cohort-expr)                 │
//! │  ├── plan: bind parameters, find distinct sub-queries       │
//! │  ├── prefetch atomic sub-queries (rayon, optional)          │
//! │  ├── combine sets (AND/OR/NOT) through EvaluationCache      │
//! │  └── return EvaluationResult with stats                     │
//! │                                                              │
//! │  Seams:                                                      │
//! │  ├── DataStore  - observation/encounter/calculation lookups │
//! │  └── Dictionary - concept code resolution                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod binder;
mod cache;
mod cancel;
mod config;
mod definition;
mod engine;
mod error;
pub mod memory;
mod params;
mod planner;
mod resolver;
mod result;
mod traits;
mod validate;

// Public re-exports
pub use binder::{bind, DateOffset, MappingEntry, MappingSource, OffsetUnit, ParameterMapping};
pub use cache::{CacheKey, CacheStats, EvaluationCache, Lookup, SubjectSet};
pub use cancel::CancellationToken;
pub use config::{EngineConfig, EngineConfigBuilder};
pub use definition::{
    CalculationFilter, CohortDefinition, Composition, ConceptRef, EncounterFilter, Mapped,
    NumericBound, ObservationFilter, RangeComparator, Searches, SubjectId, ValueConstraint,
};
pub use engine::CohortEngine;
pub use error::{EngineError, EngineResult, StoreError};
pub use params::{
    DateRange, ParameterMap, ParameterType, ParameterValue, ON_OR_AFTER, ON_OR_BEFORE,
};
pub use planner::{EvaluationPlan, PlanStep};
pub use result::{Cohort, EvaluationResult, EvaluationStats};
pub use traits::{DataStore, Dictionary, ObservationQuery, ResolvedValue};
pub use validate::{validate, validate_expression};

// Re-export commonly used types from dependencies for convenience
pub use cohort_expr::{parse, Expr};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_accessible() {
        let _: Option<EngineConfig> = None;
        let _: Option<EvaluationResult> = None;
        let _: Option<EvaluationStats> = None;
        let _: Option<EvaluationPlan> = None;
        let _: Option<EngineResult<()>> = None;
    }

    #[test]
    fn test_re_exports() {
        let _id: SubjectId = 42;
        let expr: Expr = parse("a AND NOT b").unwrap();
        assert_eq!(expr.to_string(), "a AND NOT b");
    }
}
