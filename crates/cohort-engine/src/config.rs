//! Configuration types for the cohort engine.

use std::time::Duration;

/// Fallback worker count when the platform cannot report its parallelism.
const DEFAULT_CONCURRENCY: usize = 4;

/// Configuration for the cohort engine.
///
/// # Example
///
/// ```rust
/// use cohort_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::builder()
///     .with_parallel(true)
///     .with_max_concurrency(8)
///     .with_max_results(100_000)
///     .with_timeout(Duration::from_secs(30))
///     .build();
/// assert_eq!(config.max_concurrency, 8);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Evaluate independent sub-queries concurrently (requires the
    /// `parallel` feature; ignored without it).
    pub parallel: bool,
    /// Upper bound on concurrently running sub-queries.
    pub max_concurrency: usize,
    /// Per-evaluation deadline (None = no deadline).
    pub timeout: Option<Duration>,
    /// Maximum size of the final cohort (None = unlimited).
    pub max_results: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: cfg!(feature = "parallel"),
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_CONCURRENCY),
            timeout: None,
            max_results: None,
        }
    }
}

impl EngineConfig {
    /// Creates a new builder for EngineConfig.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// A configuration that evaluates everything on the calling thread.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    /// Returns true if parallel evaluation is both requested and compiled in.
    pub fn runs_parallel(&self) -> bool {
        cfg!(feature = "parallel") && self.parallel && self.max_concurrency > 1
    }
}

/// Builder for EngineConfig.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Enables or disables parallel evaluation.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    /// Sets the concurrency bound. Values below 1 are treated as 1.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the per-evaluation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Sets the maximum cohort size.
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.config.max_results = Some(max_results);
        self
    }

    /// Builds the EngineConfig.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.parallel, cfg!(feature = "parallel"));
        assert!(config.max_concurrency >= 1);
        assert!(config.timeout.is_none());
        assert!(config.max_results.is_none());
    }

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::builder()
            .with_parallel(false)
            .with_max_concurrency(0)
            .with_max_results(50_000)
            .with_timeout(Duration::from_secs(60))
            .build();

        assert!(!config.parallel);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.max_results, Some(50_000));
        assert_eq!(config.timeout, Some(Duration::from_secs(60)));
        assert!(!config.runs_parallel());
    }

    #[test]
    fn test_sequential() {
        assert!(!EngineConfig::sequential().runs_parallel());
    }
}
