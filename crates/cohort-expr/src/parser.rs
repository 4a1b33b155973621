//! Composition expression parser implementation using nom.
//!
//! The grammar is deliberately small:
//!
//! ```text
//! expr   := term (("AND" | "OR") term | "NOT" factor)*
//! term   := "NOT" factor | factor
//! factor := OPERAND | "(" expr ")"
//! ```
//!
//! `AND` and `OR` share one precedence level and are folded strictly left to
//! right. A `NOT` term written directly after an operand (`A NOT B`) is an
//! implicit `AND`.

use nom::{
    branch::alt,
    bytes::complete::take_while,
    character::complete::{char, multispace0, satisfy},
    combinator::{all_consuming, map, recognize, value},
    error::{Error, ErrorKind},
    sequence::{delimited, pair, preceded},
    IResult,
};

use crate::ast::{is_keyword, is_operand_name, BinaryOperator, Expr};
use crate::error::{ExprError, ExprResult};

/// Deepest parenthesis nesting [`parse`] accepts.
pub const MAX_NESTING_DEPTH: usize = 100;

/// Parse a composition expression string.
///
/// # Arguments
/// * `input` - The composition string, e.g. `"A AND NOT B"`
///
/// # Returns
/// The parsed expression tree or a syntax error describing the first problem
/// found in the input.
///
/// # Examples
///
/// ```rust
/// use cohort_expr::{parse, Expr};
///
/// let expr = parse("female AND ancVist AND ancEncounter").unwrap();
/// assert_eq!(expr.operands().len(), 3);
///
/// // `NOT` after an operand is an implicit AND
/// let expr = parse("hasAppointment NOT hasVisit").unwrap();
/// assert_eq!(expr.to_string(), "hasAppointment AND NOT hasVisit");
/// ```
pub fn parse(input: &str) -> ExprResult<Expr> {
    if input.trim().is_empty() {
        return Err(ExprError::EmptyExpression);
    }
    check_nesting(input)?;

    match all_consuming(delimited(ws, expression, ws))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(_) => Err(diagnose(input)),
    }
}

// ============================================================================
// Grammar
// ============================================================================

fn expression(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut left) = term(input)?;

    loop {
        if let Ok((rest, op)) = preceded(ws, binary_operator)(input) {
            let (rest, right) = preceded(ws, term)(rest)?;
            left = Expr::binary(op, left, right);
            input = rest;
            continue;
        }

        // `A NOT B` reads as `A AND NOT B`
        if let Ok((rest, right)) = preceded(ws, negation)(input) {
            left = left.and(right);
            input = rest;
            continue;
        }

        return Ok((input, left));
    }
}

fn binary_operator(input: &str) -> IResult<&str, BinaryOperator> {
    alt((
        value(BinaryOperator::And, and_keyword),
        value(BinaryOperator::Or, or_keyword),
    ))(input)
}

fn term(input: &str) -> IResult<&str, Expr> {
    alt((negation, factor))(input)
}

fn negation(input: &str) -> IResult<&str, Expr> {
    let (input, _) = not_keyword(input)?;
    let (input, _) = ws(input)?;
    let (input, inner) = factor(input)?;
    Ok((input, Expr::Not(Box::new(inner))))
}

fn factor(input: &str) -> IResult<&str, Expr> {
    alt((operand, group))(input)
}

fn group(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(pair(char('('), ws), expression, pair(ws, char(')'))),
        |inner| Expr::Nested(Box::new(inner)),
    )(input)
}

fn operand(input: &str) -> IResult<&str, Expr> {
    let (rest, word) = identifier(input)?;
    if is_keyword(word) {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::Verify)));
    }
    Ok((rest, Expr::Operand(word.to_string())))
}

/// `[A-Za-z][A-Za-z0-9_]*`
fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn keyword<'a>(input: &'a str, kw: &str) -> IResult<&'a str, &'a str> {
    let (rest, word) = identifier(input)?;
    if word.eq_ignore_ascii_case(kw) {
        Ok((rest, word))
    } else {
        Err(nom::Err::Error(Error::new(input, ErrorKind::Tag)))
    }
}

fn and_keyword(input: &str) -> IResult<&str, &str> {
    keyword(input, "AND")
}

fn or_keyword(input: &str) -> IResult<&str, &str> {
    keyword(input, "OR")
}

fn not_keyword(input: &str) -> IResult<&str, &str> {
    keyword(input, "NOT")
}

/// Optional whitespace
fn ws(input: &str) -> IResult<&str, &str> {
    multispace0(input)
}

// ============================================================================
// Error diagnosis
// ============================================================================

/// Rejects inputs whose parentheses nest deeper than [`MAX_NESTING_DEPTH`].
fn check_nesting(input: &str) -> ExprResult<()> {
    let mut depth = 0usize;
    for (position, c) in input.char_indices() {
        match c {
            '(' => {
                depth += 1;
                if depth > MAX_NESTING_DEPTH {
                    return Err(ExprError::NestingTooDeep {
                        position,
                        limit: MAX_NESTING_DEPTH,
                    });
                }
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Operand,
    And,
    Or,
    Not,
    Open,
    Close,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    position: usize,
}

/// Finds the first structural problem in an input the grammar rejected.
fn diagnose(input: &str) -> ExprError {
    let tokens = match tokenize(input) {
        Ok(tokens) => tokens,
        Err(err) => return err,
    };

    if let Err(err) = check_balance(&tokens) {
        return err;
    }

    if let Err(err) = check_sequence(&tokens) {
        return err;
    }

    ExprError::ParseError {
        position: 0,
        message: "unrecognized composition structure".to_string(),
    }
}

fn tokenize(input: &str) -> ExprResult<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(position, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '(' || c == ')' {
            let kind = if c == '(' { TokenKind::Open } else { TokenKind::Close };
            tokens.push(Token {
                kind,
                text: &input[position..position + 1],
                position,
            });
            chars.next();
            continue;
        }

        let mut end = position;
        while let Some(&(p, ch)) = chars.peek() {
            if ch.is_whitespace() || ch == '(' || ch == ')' {
                break;
            }
            end = p + ch.len_utf8();
            chars.next();
        }

        let text = &input[position..end];
        let kind = if text.eq_ignore_ascii_case("AND") {
            TokenKind::And
        } else if text.eq_ignore_ascii_case("OR") {
            TokenKind::Or
        } else if text.eq_ignore_ascii_case("NOT") {
            TokenKind::Not
        } else if is_operand_name(text) {
            TokenKind::Operand
        } else {
            return Err(ExprError::InvalidToken {
                position,
                token: text.to_string(),
            });
        };
        tokens.push(Token {
            kind,
            text,
            position,
        });
    }

    Ok(tokens)
}

fn check_balance(tokens: &[Token<'_>]) -> ExprResult<()> {
    let mut open = Vec::new();
    for token in tokens {
        match token.kind {
            TokenKind::Open => open.push(token.position),
            TokenKind::Close => {
                if open.pop().is_none() {
                    return Err(ExprError::UnbalancedParentheses {
                        position: token.position,
                    });
                }
            }
            _ => {}
        }
    }
    match open.last() {
        Some(&position) => Err(ExprError::UnbalancedParentheses { position }),
        None => Ok(()),
    }
}

fn check_sequence(tokens: &[Token<'_>]) -> ExprResult<()> {
    let missing_operand = |token: &Token<'_>| ExprError::MissingOperand {
        position: token.position,
        operator: token.text.to_string(),
    };

    let mut prev: Option<&Token<'_>> = None;
    for token in tokens {
        let expecting_operand = match prev {
            None => true,
            Some(p) => matches!(
                p.kind,
                TokenKind::And | TokenKind::Or | TokenKind::Not | TokenKind::Open
            ),
        };

        match (expecting_operand, token.kind) {
            (true, TokenKind::And | TokenKind::Or) => {
                return Err(match prev {
                    Some(p) if p.kind != TokenKind::Open => missing_operand(p),
                    _ => missing_operand(token),
                });
            }
            (true, TokenKind::Close) => {
                return Err(match prev {
                    Some(p) if p.kind == TokenKind::Open => ExprError::MissingOperand {
                        position: p.position,
                        operator: "()".to_string(),
                    },
                    Some(p) => missing_operand(p),
                    None => missing_operand(token),
                });
            }
            (true, TokenKind::Not) => {
                if let Some(p) = prev {
                    if p.kind == TokenKind::Not {
                        return Err(missing_operand(p));
                    }
                }
            }
            (false, TokenKind::Operand | TokenKind::Open) => {
                return Err(ExprError::MissingOperator {
                    position: token.position,
                    token: token.text.to_string(),
                });
            }
            _ => {}
        }

        prev = Some(token);
    }

    match prev {
        Some(p) if matches!(p.kind, TokenKind::And | TokenKind::Or | TokenKind::Not) => {
            Err(missing_operand(p))
        }
        _ => Ok(()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &str) -> Expr {
        Expr::operand(name)
    }

    mod simple_expressions {
        use super::*;

        #[test]
        fn test_single_operand() {
            assert_eq!(parse("ancEncounter").unwrap(), op("ancEncounter"));
        }

        #[test]
        fn test_surrounding_whitespace() {
            assert_eq!(parse("  \tancEncounter \n").unwrap(), op("ancEncounter"));
        }

        #[test]
        fn test_and() {
            assert_eq!(parse("A AND B").unwrap(), op("A").and(op("B")));
        }

        #[test]
        fn test_or() {
            assert_eq!(parse("A OR B").unwrap(), op("A").or(op("B")));
        }

        #[test]
        fn test_not_in_and_chain() {
            assert_eq!(
                parse("hasObs AND NOT ancEncounter").unwrap(),
                op("hasObs").and(op("ancEncounter").negate())
            );
        }

        #[test]
        fn test_bare_not_parses() {
            // Rejected later by the evaluator, but syntactically valid
            assert_eq!(parse("NOT A").unwrap(), op("A").negate());
        }

        #[test]
        fn test_keywords_case_insensitive() {
            assert_eq!(parse("A and B").unwrap(), op("A").and(op("B")));
            assert_eq!(parse("A Or B").unwrap(), op("A").or(op("B")));
            assert_eq!(parse("A and not B").unwrap(), op("A").and_not(op("B")));
        }

        #[test]
        fn test_operands_case_sensitive() {
            let expr = parse("ancEncounter AND AncEncounter").unwrap();
            assert_eq!(expr.operands().len(), 2);
        }

        #[test]
        fn test_keyword_prefix_is_operand() {
            // ANDrew, ORder and NOTified are plain operand names
            assert_eq!(
                parse("ANDrew OR ORder AND NOTified").unwrap(),
                op("ANDrew").or(op("ORder")).and(op("NOTified"))
            );
        }

        #[test]
        fn test_underscore_and_digits() {
            assert_eq!(parse("a_1 AND b2").unwrap(), op("a_1").and(op("b2")));
        }
    }

    mod precedence {
        use super::*;

        #[test]
        fn test_left_to_right_and_or() {
            // No AND-before-OR precedence: ((A OR B) AND C)
            assert_eq!(
                parse("A OR B AND C").unwrap(),
                op("A").or(op("B")).and(op("C"))
            );
        }

        #[test]
        fn test_left_to_right_or_and() {
            assert_eq!(
                parse("A AND B OR C").unwrap(),
                op("A").and(op("B")).or(op("C"))
            );
        }

        #[test]
        fn test_left_associative_chain() {
            assert_eq!(
                parse("female AND ancVist AND ancEncounter").unwrap(),
                op("female").and(op("ancVist")).and(op("ancEncounter"))
            );
        }

        #[test]
        fn test_not_binds_tighter() {
            assert_eq!(
                parse("NOT A OR B").unwrap(),
                op("A").negate().or(op("B"))
            );
        }

        #[test]
        fn test_implicit_and_before_not() {
            assert_eq!(
                parse("hasAppointment NOT hasVisit").unwrap(),
                op("hasAppointment").and(op("hasVisit").negate())
            );
        }

        #[test]
        fn test_implicit_and_continues_chain() {
            assert_eq!(
                parse("A NOT B OR C").unwrap(),
                op("A").and(op("B").negate()).or(op("C"))
            );
        }

        #[test]
        fn test_not_group() {
            assert_eq!(
                parse("A AND NOT (B OR C)").unwrap(),
                op("A").and(op("B").or(op("C")).grouped().negate())
            );
        }
    }

    mod grouping {
        use super::*;

        #[test]
        fn test_nested_simple() {
            assert_eq!(parse("(A)").unwrap(), op("A").grouped());
        }

        #[test]
        fn test_nested_compound() {
            assert_eq!(
                parse("(ancEncounter AND femaleAndHasAncVisit) AND (takingIron OR takingFolic)")
                    .unwrap(),
                op("ancEncounter")
                    .and(op("femaleAndHasAncVisit"))
                    .grouped()
                    .and(op("takingIron").or(op("takingFolic")).grouped())
            );
        }

        #[test]
        fn test_deep_nesting() {
            let expr = parse("((((A))))").unwrap();
            assert_eq!(expr.unwrap_nested(), &op("A"));
            assert_eq!(expr.depth(), 5);
        }

        #[test]
        fn test_nesting_limit() {
            let at_limit = format!(
                "{}A{}",
                "(".repeat(MAX_NESTING_DEPTH),
                ")".repeat(MAX_NESTING_DEPTH)
            );
            assert_eq!(parse(&at_limit).unwrap().unwrap_nested(), &op("A"));

            let too_deep = format!("B AND {}A{}", "(".repeat(150), ")".repeat(150));
            assert_eq!(
                parse(&too_deep),
                Err(ExprError::NestingTooDeep {
                    position: 6 + MAX_NESTING_DEPTH,
                    limit: MAX_NESTING_DEPTH
                })
            );
        }

        #[test]
        fn test_no_whitespace_around_parens() {
            assert_eq!(
                parse("(A)AND(B)").unwrap(),
                op("A").grouped().and(op("B").grouped())
            );
        }

        #[test]
        fn test_couple_discordance_expression() {
            let expr = parse(
                "CounseledAsACouple AND ((testedHivPositive AND NOT partnerTestedHivPositive) OR (testedHivNegative AND NOT partnerTestedHivNegative))",
            )
            .unwrap();
            let expected = op("CounseledAsACouple").and(
                op("testedHivPositive")
                    .and_not(op("partnerTestedHivPositive"))
                    .grouped()
                    .or(op("testedHivNegative")
                        .and_not(op("partnerTestedHivNegative"))
                        .grouped())
                    .grouped(),
            );
            assert_eq!(expr, expected);
        }
    }

    mod display_round_trip {
        use super::*;

        #[test]
        fn test_display_reparses_to_same_tree() {
            for input in [
                "A",
                "A AND B OR C",
                "(A OR B) AND NOT C",
                "NOT (A AND B)",
                "x AND ((y OR z) AND NOT w)",
            ] {
                let expr = parse(input).unwrap();
                let reparsed = parse(&expr.to_string()).unwrap();
                assert_eq!(expr, reparsed, "round trip failed for {}", input);
            }
        }

        #[test]
        fn test_display_normalizes_whitespace_and_implicit_and() {
            let expr = parse("  a   and(b)   NOT  c ").unwrap();
            assert_eq!(expr.to_string(), "a AND (b) AND NOT c");
        }
    }

    mod error_handling {
        use super::*;

        #[test]
        fn test_empty_input() {
            assert_eq!(parse(""), Err(ExprError::EmptyExpression));
        }

        #[test]
        fn test_whitespace_only() {
            assert_eq!(parse("  \n "), Err(ExprError::EmptyExpression));
        }

        #[test]
        fn test_unclosed_parenthesis() {
            assert_eq!(
                parse("(A AND B"),
                Err(ExprError::UnbalancedParentheses { position: 0 })
            );
        }

        #[test]
        fn test_unopened_parenthesis() {
            assert_eq!(
                parse("A AND B)"),
                Err(ExprError::UnbalancedParentheses { position: 7 })
            );
        }

        #[test]
        fn test_and_without_right_operand() {
            assert_eq!(
                parse("A AND"),
                Err(ExprError::MissingOperand {
                    position: 2,
                    operator: "AND".to_string()
                })
            );
        }

        #[test]
        fn test_or_without_left_operand() {
            assert_eq!(
                parse("OR B"),
                Err(ExprError::MissingOperand {
                    position: 0,
                    operator: "OR".to_string()
                })
            );
        }

        #[test]
        fn test_double_operator() {
            assert_eq!(
                parse("A AND OR B"),
                Err(ExprError::MissingOperand {
                    position: 2,
                    operator: "AND".to_string()
                })
            );
        }

        #[test]
        fn test_operator_before_close() {
            assert_eq!(
                parse("(A OR) AND B"),
                Err(ExprError::MissingOperand {
                    position: 3,
                    operator: "OR".to_string()
                })
            );
        }

        #[test]
        fn test_operator_after_open() {
            assert_eq!(
                parse("(AND A)"),
                Err(ExprError::MissingOperand {
                    position: 1,
                    operator: "AND".to_string()
                })
            );
        }

        #[test]
        fn test_empty_group() {
            assert_eq!(
                parse("A AND ()"),
                Err(ExprError::MissingOperand {
                    position: 6,
                    operator: "()".to_string()
                })
            );
        }

        #[test]
        fn test_trailing_not() {
            assert_eq!(
                parse("A AND NOT"),
                Err(ExprError::MissingOperand {
                    position: 6,
                    operator: "NOT".to_string()
                })
            );
        }

        #[test]
        fn test_double_not() {
            assert!(matches!(
                parse("A AND NOT NOT B"),
                Err(ExprError::MissingOperand { position: 6, .. })
            ));
        }

        #[test]
        fn test_adjacent_operands() {
            assert_eq!(
                parse("A B"),
                Err(ExprError::MissingOperator {
                    position: 2,
                    token: "B".to_string()
                })
            );
        }

        #[test]
        fn test_group_after_operand() {
            assert!(matches!(
                parse("A (B)"),
                Err(ExprError::MissingOperator { position: 2, .. })
            ));
        }

        #[test]
        fn test_invalid_token_symbol() {
            assert_eq!(
                parse("A && B"),
                Err(ExprError::InvalidToken {
                    position: 2,
                    token: "&&".to_string()
                })
            );
        }

        #[test]
        fn test_invalid_token_leading_digit() {
            assert_eq!(
                parse("A AND 1B"),
                Err(ExprError::InvalidToken {
                    position: 6,
                    token: "1B".to_string()
                })
            );
        }

        #[test]
        fn test_invalid_token_hyphen() {
            assert!(matches!(
                parse("has-visit"),
                Err(ExprError::InvalidToken { position: 0, .. })
            ));
        }

        #[test]
        fn test_invalid_token_minus_keyword_style() {
            // Set difference is spelled AND NOT, there is no MINUS symbol
            assert!(matches!(
                parse("A - B"),
                Err(ExprError::InvalidToken { position: 2, .. })
            ));
        }
    }
}
