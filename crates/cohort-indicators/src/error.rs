//! Error types for the indicators crate.

use cohort_engine::EngineError;

/// Result type for indicator operations.
pub type IndicatorResult<T> = Result<T, IndicatorError>;

/// Errors that can occur while evaluating indicators.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndicatorError {
    /// Composition evaluation failed.
    #[error("evaluation error: {0}")]
    Engine(#[from] EngineError),

    /// A dimension with no options cannot disaggregate anything.
    #[error("dimension '{0}' has no options")]
    EmptyDimension(String),

    /// Two indicators in one batch share a name.
    #[error("indicator '{0}' appears more than once in the batch")]
    DuplicateIndicator(String),
}

impl IndicatorError {
    /// Returns the underlying engine error, if any.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            IndicatorError::Engine(err) => Some(err),
            _ => None,
        }
    }
}
