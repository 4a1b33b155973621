//! # cohort-expr
//!
//! Parser for the boolean composition expressions that combine named cohort
//! sub-queries into indicator cohorts.
//!
//! A composition expression references operands by name and combines them
//! with `AND`, `OR`, `NOT` and parentheses:
//!
//! ```rust
//! use cohort_expr::{parse, Expr};
//!
//! let expr = parse("(ancEncounter AND femaleAndHasAncVisit) AND (takingIron OR takingFolic)").unwrap();
//!
//! let names: Vec<&str> = expr.operands().into_iter().collect();
//! assert_eq!(names, ["ancEncounter", "femaleAndHasAncVisit", "takingFolic", "takingIron"]);
//! ```
//!
//! ## Syntax Quick Reference
//!
//! | Syntax | Meaning | Example |
//! |--------|---------|---------|
//! | `name` | Operand reference | `ancEncounter` |
//! | `AND` | Intersection | `female AND ancVisit` |
//! | `OR` | Union | `takingIron OR takingFolic` |
//! | `NOT` | Complement against the universe | `hasObs AND NOT ancEncounter` |
//! | `A NOT B` | Implicit AND | `hasAppointment NOT hasVisit` |
//! | `( )` | Grouping | `(a OR b) AND c` |
//!
//! `AND` and `OR` have equal precedence and are evaluated strictly left to
//! right; only parentheses change grouping. Keywords are matched
//! case-insensitively, operand names case-sensitively.
//!
//! Chains of any length are accepted. Parentheses may nest at most
//! [`MAX_NESTING_DEPTH`] levels deep.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod ast;
mod error;
mod parser;

pub use ast::{is_keyword, is_operand_name, BinaryOperator, Expr, Nodes, KEYWORDS};
pub use error::{ExprError, ExprResult};
pub use parser::{parse, MAX_NESTING_DEPTH};
