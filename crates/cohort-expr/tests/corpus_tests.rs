//! Composition strings taken verbatim from the MOH 105 indicator library.
//!
//! Every literal must parse, and the parsed tree must reference exactly the
//! operands its definition binds.

use cohort_expr::{parse, Expr, ExprError};
use rstest::rstest;

#[rstest]
#[case("female AND ancVist AND ancEncounter", &["ancEncounter", "ancVist", "female"])]
#[case(
    "(ancEncounter AND femaleAndHasAncVisit) AND (takingIron OR takingFolic)",
    &["ancEncounter", "femaleAndHasAncVisit", "takingFolic", "takingIron"]
)]
#[case("assessedBy AND ancEncounter", &["ancEncounter", "assessedBy"])]
#[case("emctCodes AND ancEncounter", &["ancEncounter", "emctCodes"])]
#[case("hasEncounter AND babyAl", &["babyAl", "hasEncounter"])]
#[case("hasAppointment NOT hasVisit", &["hasAppointment", "hasVisit"])]
#[case("hasObs AND NOT ancEncounter", &["ancEncounter", "hasObs"])]
#[case("(facilityObs OR emptyObs) AND smcEncounter", &["emptyObs", "facilityObs", "smcEncounter"])]
#[case("outreach AND smcEncounter", &["outreach", "smcEncounter"])]
#[case(
    "(procedureMethod OR emptyProcedureObs) AND smcEncounter",
    &["emptyProcedureObs", "procedureMethod", "smcEncounter"]
)]
#[case("counseled AND results AND smcEncounter", &["counseled", "results", "smcEncounter"])]
#[case("visit AND smcEncounter", &["smcEncounter", "visit"])]
#[case("PretestCounselingDone AND counseledAsIndividuals", &["PretestCounselingDone", "counseledAsIndividuals"])]
#[case("trr AND anyVisit AND ancEncounter", &["ancEncounter", "anyVisit", "trr"])]
#[case(
    "receivedHivTestResults AND counseledAsIndividuals AND TestedInLast12Months",
    &["TestedInLast12Months", "counseledAsIndividuals", "receivedHivTestResults"]
)]
#[case("tested AND CounseledAsACouple", &["CounseledAsACouple", "tested"])]
#[case(
    "testedHIVPositive AND counseledAsIndividuals AND testedAtAnEarlyStage",
    &["counseledAsIndividuals", "testedAtAnEarlyStage", "testedHIVPositive"]
)]
#[case(
    "CounseledAsACouple AND testedHivPositive AND partnerTestedHivPositive",
    &["CounseledAsACouple", "partnerTestedHivPositive", "testedHivPositive"]
)]
#[case(
    "CounseledAsACouple AND ((testedHivPositive AND NOT partnerTestedHivPositive) OR (testedHivNegative AND NOT partnerTestedHivNegative))",
    &[
        "CounseledAsACouple",
        "partnerTestedHivNegative",
        "partnerTestedHivPositive",
        "testedHivNegative",
        "testedHivPositive",
    ]
)]
fn library_composition_parses(#[case] composition: &str, #[case] operands: &[&str]) {
    let expr = parse(composition).unwrap_or_else(|e| panic!("{}: {}", composition, e));
    let names: Vec<&str> = expr.operands().into_iter().collect();
    assert_eq!(names, operands);
}

#[rstest]
#[case("")]
#[case("A AND")]
#[case("(A OR B")]
#[case("A OR B)")]
#[case("A B")]
#[case("A && B")]
#[case("AND")]
#[case("NOT")]
fn malformed_composition_rejected(#[case] composition: &str) {
    assert!(parse(composition).is_err(), "{:?} should not parse", composition);
}

#[test]
fn missing_appointment_reads_as_and_not() {
    let expr = parse("hasAppointment NOT hasVisit").unwrap();
    let explicit = parse("hasAppointment AND NOT hasVisit").unwrap();
    assert_eq!(expr, explicit);
}

#[test]
fn error_positions_point_into_input() {
    let input = "counseled AND results AND";
    match parse(input) {
        Err(ExprError::MissingOperand { position, operator }) => {
            assert_eq!(&input[position..position + operator.len()], "AND");
            assert_eq!(position, 22);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn mixed_chain_is_left_to_right() {
    let expr = parse("a OR b AND c OR d").unwrap();
    let expected = Expr::operand("a")
        .or(Expr::operand("b"))
        .and(Expr::operand("c"))
        .or(Expr::operand("d"));
    assert_eq!(expr, expected);
}

#[test]
fn generated_chain_round_trips() {
    let names: Vec<String> = (0..10_000).map(|i| format!("facility{}", i)).collect();
    let text = names.join(" OR ");

    let expr = parse(&text).unwrap();
    assert_eq!(expr.reference_count(), 10_000);
    assert_eq!(expr.to_string(), text);
    assert_eq!(parse(&expr.to_string()).unwrap(), expr);
}

#[cfg(feature = "serde")]
#[test]
fn expression_serializes() {
    let expr = parse("hasObs AND NOT ancEncounter").unwrap();
    let json = serde_json::to_string(&expr).unwrap();
    let back: Expr = serde_json::from_str(&json).unwrap();
    assert_eq!(expr, back);
}
