//! Error types for composition expression parsing.

use thiserror::Error;

/// Errors that can occur while parsing a composition expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// Empty input provided.
    #[error("empty composition expression")]
    EmptyExpression,

    /// A parenthesis without its partner.
    #[error("unbalanced parentheses at position {position}")]
    UnbalancedParentheses {
        /// Position of the unmatched parenthesis.
        position: usize,
    },

    /// An operator is missing its left or right operand.
    #[error("operator '{operator}' at position {position} is missing an operand")]
    MissingOperand {
        /// Position of the operator.
        position: usize,
        /// The operator keyword (or parenthesis) lacking an operand.
        operator: String,
    },

    /// Two operands (or groups) follow each other without an operator.
    #[error("missing operator before '{token}' at position {position}")]
    MissingOperator {
        /// Position of the token that should have been preceded by an operator.
        position: usize,
        /// The offending token.
        token: String,
    },

    /// Token that is neither a keyword, a parenthesis, nor an operand name.
    #[error("invalid token '{token}' at position {position}")]
    InvalidToken {
        /// Position of the token.
        position: usize,
        /// The token text.
        token: String,
    },

    /// Parentheses nest deeper than the parser accepts.
    #[error("parentheses nested deeper than {limit} levels at position {position}")]
    NestingTooDeep {
        /// Position of the first parenthesis past the limit.
        position: usize,
        /// The maximum nesting depth.
        limit: usize,
    },

    /// Parse failure not covered by a more specific variant.
    #[error("parse error at position {position}: {message}")]
    ParseError {
        /// Position in the input where the error occurred.
        position: usize,
        /// Description of the error.
        message: String,
    },
}

impl ExprError {
    /// Returns the byte position the error refers to, if any.
    pub fn position(&self) -> Option<usize> {
        match self {
            ExprError::EmptyExpression => None,
            ExprError::UnbalancedParentheses { position }
            | ExprError::MissingOperand { position, .. }
            | ExprError::MissingOperator { position, .. }
            | ExprError::InvalidToken { position, .. }
            | ExprError::NestingTooDeep { position, .. }
            | ExprError::ParseError { position, .. } => Some(*position),
        }
    }
}

/// Result type for expression parsing.
pub type ExprResult<T> = std::result::Result<T, ExprError>;
