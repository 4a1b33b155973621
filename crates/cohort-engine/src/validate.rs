//! Static checks that need no data access.

use std::collections::{BTreeSet, HashSet};

use cohort_expr::Expr;

use crate::definition::{CohortDefinition, Composition, Searches};
use crate::error::{EngineError, EngineResult};

/// Checks a composition without accessing data.
///
/// Reports every definition defect: operands without a binding (also inside
/// nested composites), a universe that is not bound, `NOT` with nothing to
/// complement against, and mapping sources no declared parameter covers.
/// Needs no store or dictionary, so indicators can be checked when they are
/// registered.
///
/// ```rust
/// use cohort_engine::{validate, CalculationFilter, Composition, EngineError, Mapped};
///
/// let composition = Composition::new("visit AND NOT tested")
///     .unwrap()
///     .with_search("visit", Mapped::unmapped(CalculationFilter::new("visits")));
///
/// assert_eq!(
///     validate(&composition),
///     vec![EngineError::MissingOperand { operand: "tested".into() }]
/// );
/// ```
pub fn validate(composition: &Composition) -> Vec<EngineError> {
    let mut errors = Vec::new();
    collect_errors(composition, None, &mut errors);
    errors
}

/// Parses `expression` against `searches` and checks the result like
/// [`validate`]. A syntax error is returned on its own.
pub fn validate_expression(expression: &str, searches: &Searches) -> Vec<EngineError> {
    match Composition::from_parts(expression, searches.clone()) {
        Ok(composition) => validate(&composition),
        Err(err) => vec![err],
    }
}

/// Distinct operand names in order of first appearance.
pub(crate) fn operands_in_order(expr: &Expr) -> Vec<&str> {
    let mut seen = HashSet::new();
    expr.operand_names().filter(|name| seen.insert(*name)).collect()
}

/// Operands a composition needs bound: every referenced one plus the
/// universe.
pub(crate) fn required_operands(composition: &Composition) -> Vec<&str> {
    let mut names = operands_in_order(composition.expr());
    if let Some(universe) = composition.universe() {
        if !names.contains(&universe) {
            names.push(universe);
        }
    }
    names
}

/// Rejects `NOT` placements that have no universe to complement against.
///
/// Without a declared universe, `NOT x` is only meaningful as a direct
/// operand of `AND`/`OR` whose other operand is not negated.
pub(crate) fn check_negations(expr: &Expr, has_universe: bool) -> EngineResult<()> {
    let mut pending = vec![(expr, false)];
    while let Some((expr, as_operand)) = pending.pop() {
        match expr {
            Expr::Operand(_) => {}
            Expr::Nested(inner) => pending.push((&**inner, as_operand)),
            Expr::Not(inner) => {
                if !has_universe && !as_operand {
                    return Err(EngineError::InvalidExpression(format!(
                        "'{}' has nothing to complement against; \
                         combine it with AND/OR or declare a universe",
                        expr
                    )));
                }
                pending.push((&**inner, false));
            }
            Expr::And(..) | Expr::Or(..) => {
                let (head, links) = expr.chain();
                if let Some(&(operator, first)) = links.first() {
                    if !has_universe && head.as_negation().is_some() && first.as_negation().is_some()
                    {
                        return Err(EngineError::InvalidExpression(format!(
                            "'{} {} {}' negates both operands; declare a universe",
                            head, operator, first
                        )));
                    }
                }
                pending.extend(links.into_iter().rev().map(|(_, right)| (right, true)));
                pending.push((head, true));
            }
        }
    }
    Ok(())
}

/// Collects every definition defect in `composition`, recursing into
/// referenced composites.
///
/// `available` is the set of parameter names the caller is known to supply.
/// At the top level it is unknown (`None`) and mapping sources are checked
/// against the declared parameters instead, when there are any.
pub(crate) fn collect_errors(
    composition: &Composition,
    available: Option<&BTreeSet<String>>,
    errors: &mut Vec<EngineError>,
) {
    let declared: BTreeSet<String> = composition
        .parameters()
        .iter()
        .map(|(name, _)| name.clone())
        .collect();

    if let Some(available) = available {
        for name in declared.difference(available) {
            errors.push(EngineError::unbound(name.as_str()));
        }
    }

    let known = match available {
        Some(available) => Some(available),
        None if !declared.is_empty() => Some(&declared),
        None => None,
    };

    if let Err(err) = check_negations(composition.expr(), composition.universe().is_some()) {
        errors.push(err);
    }

    for name in required_operands(composition) {
        let mapped = match composition.searches().get(name) {
            Some(mapped) => mapped,
            None => {
                errors.push(EngineError::MissingOperand {
                    operand: name.to_string(),
                });
                continue;
            }
        };

        if let Some(known) = known {
            for source in mapped.mapping().sources() {
                if !known.contains(source) {
                    errors.push(EngineError::UnboundParameter {
                        parameter: source.to_string(),
                        operand: Some(name.to_string()),
                    });
                }
            }
        }

        if let CohortDefinition::Composite(inner) = mapped.definition().as_ref() {
            let targets: BTreeSet<String> = mapped
                .mapping()
                .entries()
                .iter()
                .map(|entry| entry.target.clone())
                .collect();
            let before = errors.len();
            collect_errors(inner, Some(&targets), errors);
            for err in &mut errors[before..] {
                *err = err.clone().for_operand(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EncounterFilter, Mapped};
    use crate::params::ParameterType;

    fn parse(text: &str) -> Expr {
        cohort_expr::parse(text).unwrap()
    }

    fn visit() -> Mapped {
        Mapped::new(EncounterFilter::new(["VISIT"]), "onOrBefore=${endDate}").unwrap()
    }

    #[test]
    fn test_negation_placement() {
        assert!(check_negations(&parse("a AND NOT b"), false).is_ok());
        assert!(check_negations(&parse("a OR NOT b"), false).is_ok());
        assert!(check_negations(&parse("NOT b AND a"), false).is_ok());
        assert!(check_negations(&parse("a AND (NOT b)"), false).is_ok());
        assert!(check_negations(&parse("hasAppointment NOT hasVisit"), false).is_ok());

        for text in ["NOT a", "NOT a AND NOT b", "a AND NOT (NOT b)", "(NOT a)"] {
            assert!(
                matches!(
                    check_negations(&parse(text), false),
                    Err(EngineError::InvalidExpression(_))
                ),
                "{} should be rejected",
                text
            );
            assert!(check_negations(&parse(text), true).is_ok());
        }
    }

    #[test]
    fn test_validate_without_engine() {
        let searches = Searches::new().with("a", visit());
        assert!(validate_expression("a", &searches).is_empty());
        assert_eq!(
            validate_expression("a AND b", &searches),
            vec![EngineError::MissingOperand {
                operand: "b".into()
            }]
        );
        assert!(matches!(
            validate_expression("a AND", &searches).as_slice(),
            [EngineError::Syntax(_)]
        ));

        let composition = Composition::new("NOT a").unwrap().with_search("a", visit());
        assert!(matches!(
            validate(&composition).as_slice(),
            [EngineError::InvalidExpression(_)]
        ));
        assert!(validate(&composition.with_universe("a")).is_empty());
    }

    #[test]
    fn test_operands_in_order() {
        let expr = parse("b AND (a OR b) AND NOT c");
        assert_eq!(operands_in_order(&expr), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_collect_missing_operands() {
        let composition = Composition::new("a AND c")
            .unwrap()
            .with_search("a", visit())
            .with_search("unused", visit())
            .with_universe("everyone");
        let mut errors = Vec::new();
        collect_errors(&composition, None, &mut errors);
        assert_eq!(
            errors,
            vec![
                EngineError::MissingOperand {
                    operand: "c".into()
                },
                EngineError::MissingOperand {
                    operand: "everyone".into()
                },
            ]
        );
    }

    #[test]
    fn test_collect_uncovered_sources() {
        let composition = Composition::new("a")
            .unwrap()
            .with_search("a", visit())
            .with_parameter("startDate", ParameterType::Date);
        let mut errors = Vec::new();
        collect_errors(&composition, None, &mut errors);
        assert_eq!(
            errors,
            vec![EngineError::UnboundParameter {
                parameter: "endDate".into(),
                operand: Some("a".into()),
            }]
        );
    }

    #[test]
    fn test_collect_recurses_into_composites() {
        let inner = Composition::new("x AND y").unwrap().with_search("x", visit());
        let outer = Composition::new("nested")
            .unwrap()
            .with_search("nested", Mapped::new(inner, "onOrBefore=${endDate}").unwrap());
        let mut errors = Vec::new();
        collect_errors(&outer, None, &mut errors);
        // x reads endDate, but the nested composite only receives onOrBefore.
        assert_eq!(
            errors,
            vec![
                EngineError::UnboundParameter {
                    parameter: "endDate".into(),
                    operand: Some("x".into()),
                },
                EngineError::MissingOperand {
                    operand: "y".into()
                },
            ]
        );
    }
}
