//! Error types for cohort evaluation.

use std::time::Duration;

use thiserror::Error;

use crate::params::ParameterType;

/// Errors that can occur while validating or evaluating a composition.
///
/// Errors are `Clone` so that a failure computed once can be handed to every
/// caller waiting on the same cache entry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed composition string.
    #[error("composition syntax error: {0}")]
    Syntax(#[from] cohort_expr::ExprError),

    /// A parameter mapping (or declared parameter) references a parameter
    /// the caller did not supply.
    #[error("unbound parameter '{parameter}'{}", context_suffix(.operand))]
    UnboundParameter {
        /// Name of the missing source parameter.
        parameter: String,
        /// Operand whose binding needed it, if known.
        operand: Option<String>,
    },

    /// A parameter mapping expression could not be parsed or applied.
    #[error("invalid parameter mapping '{mapping}': {message}")]
    InvalidParameterMapping {
        /// The offending mapping text.
        mapping: String,
        /// What is wrong with it.
        message: String,
    },

    /// A bound parameter holds a value of the wrong type.
    #[error("parameter '{parameter}' expects a {expected}, found '{found}'")]
    InvalidParameterValue {
        /// Parameter name.
        parameter: String,
        /// Type the consumer needed.
        expected: ParameterType,
        /// Display form of the offending value.
        found: String,
    },

    /// The expression references an operand with no binding.
    #[error("operand '{operand}' has no binding")]
    MissingOperand {
        /// The unbound operand name.
        operand: String,
    },

    /// The expression is syntactically valid but cannot be evaluated.
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// Concept code not registered in the dictionary.
    #[error("unknown concept: {0}")]
    UnknownConcept(String),

    /// Failure surfaced by the external data store.
    #[error("sub-query '{operand}' failed: {message}")]
    SubQueryEvaluation {
        /// Operand whose sub-query failed.
        operand: String,
        /// Message reported by the data store.
        message: String,
    },

    /// Evaluation was cancelled by the caller.
    #[error("evaluation cancelled")]
    Cancelled,

    /// Evaluation exceeded its deadline.
    #[error("evaluation timeout after {0:?}")]
    Timeout(Duration),

    /// Result set exceeds configured limit.
    #[error("result set too large: {count} exceeds limit {limit}")]
    ResultTooLarge {
        /// Number of subjects found.
        count: usize,
        /// Configured limit.
        limit: usize,
    },
}

fn context_suffix(operand: &Option<String>) -> String {
    match operand {
        Some(name) => format!(" for operand '{}'", name),
        None => String::new(),
    }
}

impl EngineError {
    /// Creates an [`EngineError::UnboundParameter`] without operand context.
    pub fn unbound(parameter: impl Into<String>) -> Self {
        EngineError::UnboundParameter {
            parameter: parameter.into(),
            operand: None,
        }
    }

    /// Creates an [`EngineError::InvalidParameterMapping`].
    pub fn invalid_mapping(mapping: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidParameterMapping {
            mapping: mapping.into(),
            message: message.into(),
        }
    }

    /// Attaches the operand name to errors that carry operand context.
    pub fn for_operand(self, name: &str) -> Self {
        match self {
            EngineError::UnboundParameter {
                parameter,
                operand: None,
            } => EngineError::UnboundParameter {
                parameter,
                operand: Some(name.to_string()),
            },
            other => other,
        }
    }

    /// Returns true for errors that indicate a defect in the definition
    /// itself rather than in the data or the runtime.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            EngineError::Syntax(_)
                | EngineError::UnboundParameter { .. }
                | EngineError::InvalidParameterMapping { .. }
                | EngineError::InvalidParameterValue { .. }
                | EngineError::MissingOperand { .. }
                | EngineError::InvalidExpression(_)
        )
    }
}

/// Failure reported by a [`DataStore`](crate::DataStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The call observed a cancelled token and stopped.
    #[error("cancelled")]
    Cancelled,

    /// The call observed an expired deadline and stopped.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Backend failure (connection, query, decoding...).
    #[error("{0}")]
    Backend(String),
}

/// Result type for cohort engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_missing_operand() {
        let err = EngineError::MissingOperand {
            operand: "C".to_string(),
        };
        assert_eq!(err.to_string(), "operand 'C' has no binding");
    }

    #[test]
    fn test_error_display_unbound_parameter() {
        let err = EngineError::unbound("onOrAfter");
        assert_eq!(err.to_string(), "unbound parameter 'onOrAfter'");

        let err = err.for_operand("ancEncounter");
        assert_eq!(
            err.to_string(),
            "unbound parameter 'onOrAfter' for operand 'ancEncounter'"
        );
    }

    #[test]
    fn test_for_operand_keeps_existing_context() {
        let err = EngineError::UnboundParameter {
            parameter: "endDate".to_string(),
            operand: Some("inner".to_string()),
        };
        assert_eq!(err.clone().for_operand("outer"), err);
    }

    #[test]
    fn test_error_display_sub_query() {
        let err = EngineError::SubQueryEvaluation {
            operand: "hasVisit".to_string(),
            message: "connection reset".to_string(),
        };
        assert_eq!(err.to_string(), "sub-query 'hasVisit' failed: connection reset");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = EngineError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "evaluation timeout after 30s");
    }

    #[test]
    fn test_error_from_expr_error() {
        let err: EngineError = cohort_expr::ExprError::EmptyExpression.into();
        assert!(matches!(err, EngineError::Syntax(_)));
        assert!(err.is_definition_error());
        assert!(!EngineError::Cancelled.is_definition_error());
    }
}
