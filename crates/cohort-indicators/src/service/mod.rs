//! Indicator evaluation service.
//!
//! This module provides a high-level service for counting indicators,
//! disaggregating them by dimensions and evaluating whole batches, with
//! sub-query results shared across the compositions of one call.
//!
//! # Example
//!
//! ```ignore
//! use cohort_indicators::IndicatorService;
//!
//! let service = IndicatorService::new(&store, &dictionary);
//!
//! // Single count
//! let value = service.count(&anc_first_visit, &params)?;
//! println!("{}: {}", value.name, value.count());
//!
//! // Break down by gender
//! let by_gender = service.disaggregate(&anc_first_visit, &gender, &params)?;
//!
//! // Or under a token the caller can cancel
//! let token = CancellationToken::with_timeout(Duration::from_secs(30));
//! let by_age = service.disaggregate_with_token(&anc_first_visit, &age, &params, &token)?;
//! println!("F: {:?}", by_gender.get("F"));
//!
//! // A report's worth of indicators sharing one cache
//! let report = service.evaluate_batch(&[anc_first_visit, anc_fourth_visit], &params)?;
//! ```

mod types;

pub use types::{BatchReport, DimensionCell, Disaggregation, IndicatorStats, IndicatorValue};

use std::collections::HashSet;
use std::time::Instant;

use cohort_engine::{
    CancellationToken, CohortEngine, DataStore, Dictionary, EngineConfig, EvaluationCache,
    EvaluationResult, Expr, Mapped, ParameterMap, Searches,
};
use log::debug;
use parking_lot::RwLock;

use crate::dimension::{Dimension, OPTION};
use crate::error::{IndicatorError, IndicatorResult};
use crate::indicator::{Indicator, COHORT};

/// Configuration for the indicator service.
#[derive(Debug, Clone)]
pub struct IndicatorServiceConfig {
    /// Configuration of the underlying engine.
    pub engine: EngineConfig,
    /// Whether the compositions of one call share a sub-query cache.
    pub share_cache: bool,
}

impl Default for IndicatorServiceConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            share_cache: true,
        }
    }
}

impl IndicatorServiceConfig {
    /// Creates a config where every composition gets its own cache.
    pub fn isolated() -> Self {
        Self {
            share_cache: false,
            ..Self::default()
        }
    }

    /// Creates a config with a custom engine configuration.
    pub fn with_engine(engine: EngineConfig) -> Self {
        Self {
            engine,
            ..Self::default()
        }
    }
}

/// A high-level service for evaluating indicators.
pub struct IndicatorService<'a> {
    engine: CohortEngine<'a>,
    config: IndicatorServiceConfig,
    stats: RwLock<IndicatorStats>,
}

impl<'a> IndicatorService<'a> {
    /// Creates a new indicator service with default configuration.
    pub fn new(store: &'a dyn DataStore, dictionary: &'a dyn Dictionary) -> Self {
        Self::with_config(store, dictionary, IndicatorServiceConfig::default())
    }

    /// Creates a new indicator service with custom configuration.
    pub fn with_config(
        store: &'a dyn DataStore,
        dictionary: &'a dyn Dictionary,
        config: IndicatorServiceConfig,
    ) -> Self {
        let engine = CohortEngine::with_config(store, dictionary, config.engine.clone());
        Self {
            engine,
            config,
            stats: RwLock::new(IndicatorStats::default()),
        }
    }

    /// Counts the subjects of an indicator.
    pub fn count(
        &self,
        indicator: &Indicator,
        params: &ParameterMap,
    ) -> IndicatorResult<IndicatorValue> {
        self.count_with_token(indicator, params, &CancellationToken::new())
    }

    /// Counts the subjects of an indicator under a caller-controlled token.
    pub fn count_with_token(
        &self,
        indicator: &Indicator,
        params: &ParameterMap,
        token: &CancellationToken,
    ) -> IndicatorResult<IndicatorValue> {
        let start = Instant::now();
        let cache = EvaluationCache::new();
        let result = self.run(&cache, indicator, None, params, token)?;
        let evaluation_time_ms = elapsed_ms(start);

        self.stats.write().total_evaluation_time_ms += evaluation_time_ms;
        Ok(IndicatorValue {
            name: indicator.name().to_string(),
            cohort: result.cohort,
            evaluation_time_ms,
        })
    }

    /// Breaks an indicator down by the options of `dimension`.
    ///
    /// Each cell counts the subjects in both the indicator and the option.
    /// The indicator's own sub-queries are computed once for all cells.
    pub fn disaggregate(
        &self,
        indicator: &Indicator,
        dimension: &Dimension,
        params: &ParameterMap,
    ) -> IndicatorResult<Disaggregation> {
        self.disaggregate_with_token(indicator, dimension, params, &CancellationToken::new())
    }

    /// Breaks an indicator down under a caller-controlled token.
    ///
    /// Cancelling the token aborts the total and every remaining cell.
    pub fn disaggregate_with_token(
        &self,
        indicator: &Indicator,
        dimension: &Dimension,
        params: &ParameterMap,
        token: &CancellationToken,
    ) -> IndicatorResult<Disaggregation> {
        if dimension.is_empty() {
            return Err(IndicatorError::EmptyDimension(dimension.name().to_string()));
        }

        let start = Instant::now();
        let shared = EvaluationCache::new();

        let total = self.run(&shared, indicator, None, params, token)?;
        let mut classified = HashSet::new();
        let mut cells = Vec::with_capacity(dimension.len());
        for (key, cohort) in dimension.options() {
            let isolated;
            let cache = if self.config.share_cache {
                &shared
            } else {
                isolated = EvaluationCache::new();
                &isolated
            };
            let option = Some((dimension, key.as_str(), cohort));
            let result = self.run(cache, indicator, option, params, token)?;
            classified.extend(result.cohort.iter().copied());
            cells.push(DimensionCell {
                option: key.clone(),
                count: result.count(),
            });
        }
        let evaluation_time_ms = elapsed_ms(start);

        debug!(
            "disaggregated '{}' by '{}' into {} cells",
            indicator.name(),
            dimension.name(),
            cells.len()
        );
        {
            let mut stats = self.stats.write();
            stats.disaggregations += 1;
            stats.total_evaluation_time_ms += evaluation_time_ms;
        }

        // With isolated caches a cell may see subjects the total did not,
        // so only subjects of the total itself count as unclassified.
        let unclassified = total
            .cohort
            .iter()
            .filter(|subject| !classified.contains(*subject))
            .count();

        Ok(Disaggregation {
            indicator: indicator.name().to_string(),
            dimension: dimension.name().to_string(),
            total: total.count(),
            cells,
            unclassified,
            evaluation_time_ms,
        })
    }

    /// Evaluates a batch of indicators together.
    ///
    /// Sub-queries shared between indicators are computed once. Any failure
    /// aborts the whole batch.
    pub fn evaluate_batch(
        &self,
        indicators: &[Indicator],
        params: &ParameterMap,
    ) -> IndicatorResult<BatchReport> {
        self.evaluate_batch_with_token(indicators, params, &CancellationToken::new())
    }

    /// Evaluates a batch of indicators under a caller-controlled token.
    pub fn evaluate_batch_with_token(
        &self,
        indicators: &[Indicator],
        params: &ParameterMap,
        token: &CancellationToken,
    ) -> IndicatorResult<BatchReport> {
        let mut names = HashSet::new();
        for indicator in indicators {
            if !names.insert(indicator.name()) {
                return Err(IndicatorError::DuplicateIndicator(
                    indicator.name().to_string(),
                ));
            }
        }

        let start = Instant::now();
        let shared = EvaluationCache::new();
        let mut values = Vec::with_capacity(indicators.len());
        let mut computed = 0;
        let mut reused = 0;

        for indicator in indicators {
            let began = Instant::now();
            let isolated;
            let cache = if self.config.share_cache {
                &shared
            } else {
                isolated = EvaluationCache::new();
                &isolated
            };
            let result = self.run(cache, indicator, None, params, token)?;
            computed += result.stats.computations;
            reused += result.stats.cache_hits + result.stats.waits;
            values.push(IndicatorValue {
                name: indicator.name().to_string(),
                cohort: result.cohort,
                evaluation_time_ms: elapsed_ms(began),
            });
        }
        let evaluation_time_ms = elapsed_ms(start);

        debug!(
            "evaluated {} indicators: {} sub-queries computed, {} reused",
            values.len(),
            computed,
            reused
        );
        {
            let mut stats = self.stats.write();
            stats.batches += 1;
            stats.total_evaluation_time_ms += evaluation_time_ms;
        }

        Ok(BatchReport {
            values,
            subqueries_computed: computed,
            subqueries_reused: reused,
            evaluation_time_ms,
        })
    }

    /// Evaluates an indicator, optionally restricted to one dimension
    /// option.
    fn run(
        &self,
        cache: &EvaluationCache,
        indicator: &Indicator,
        option: Option<(&Dimension, &str, &Mapped)>,
        params: &ParameterMap,
        token: &CancellationToken,
    ) -> IndicatorResult<EvaluationResult> {
        let composition = match option {
            None => indicator.composition(),
            Some((dimension, key, cohort)) => {
                let expr = Expr::operand(COHORT).and(Expr::operand(OPTION));
                let composition =
                    indicator.restricted_to(expr, Searches::new().with(OPTION, cohort.clone()));
                dimension
                    .parameters()
                    .iter()
                    .fold(composition, |c, (name, kind)| c.with_parameter(name.as_str(), *kind))
                    .with_name(format!("{} [{}={}]", indicator.name(), dimension.name(), key))
            }
        };

        let result = self.engine.evaluate_in(cache, &composition, params, token)?;
        self.stats.write().record(&result.stats);
        Ok(result)
    }

    /// Returns service statistics.
    pub fn stats(&self) -> IndicatorStats {
        self.stats.read().clone()
    }

    /// Resets statistics.
    pub fn reset_stats(&self) {
        *self.stats.write() = IndicatorStats::default();
    }

    /// Returns a reference to the underlying engine.
    pub fn engine(&self) -> &CohortEngine<'a> {
        &self.engine
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &IndicatorServiceConfig {
        &self.config
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_constructors() {
        assert!(IndicatorServiceConfig::default().share_cache);
        assert!(!IndicatorServiceConfig::isolated().share_cache);

        let config = IndicatorServiceConfig::with_engine(EngineConfig::sequential());
        assert!(config.share_cache);
        assert!(!config.engine.runs_parallel());
    }
}
