//! Trip-rule DSL coverage: the grammar surface, typed comparisons, rule
//! management, and the evaluation contract the sniffer relies on.

use vts_core::rules::{RuleError, RuleValue, TripRuleEvaluator};

#[test]
fn test_grammar_accepts_representative_expressions() {
    let mut eval = TripRuleEvaluator::new();
    let accepted = [
        "A == true",
        "A.B.C == true",
        "X/Y > 100",
        "A && (B || !C)",
        "!A",
        "!!A",
        "!(A && B)",
        "A == 1 && B == 0",
        "Relay1/data0 == true || Relay2/data0 == true",
        "f >= 59.5 && f <= 60.5",
        "value != -10",
        "(((A)))",
        "  A  ==  true  ",
        "path_with_underscores/and.dots == false",
    ];
    for (index, expression) in accepted.iter().enumerate() {
        assert!(
            eval.add_rule(&format!("rule{}", index), expression).is_ok(),
            "{:?} must parse",
            expression
        );
    }
    assert_eq!(eval.rule_names().len(), accepted.len());
}

#[test]
fn test_grammar_rejects_malformed_expressions_with_position() {
    let mut eval = TripRuleEvaluator::new();
    let rejected = [
        "",
        "==",
        "A ==",
        "A = true",
        "A === true",
        "(A == true",
        "A == true)",
        "A &&",
        "&& A",
        "A || || B",
        "A ! B",
        "A < ",
    ];
    for expression in rejected {
        match eval.add_rule("bad", expression) {
            Err(RuleError::Parse { position, message }) => {
                assert!(
                    !message.is_empty(),
                    "{:?} must carry a reason",
                    expression
                );
                assert!(position <= expression.len());
            }
            other => panic!("{:?} must be rejected, got {:?}", expression, other),
        }
        assert!(!eval.last_error().is_empty());
    }
    assert!(eval.rule_names().is_empty());
}

#[test]
fn test_typed_comparisons() {
    let mut eval = TripRuleEvaluator::new();
    eval.update_data_point("b", RuleValue::Bool(true));
    eval.update_data_point("i", RuleValue::Int(-25));
    eval.update_data_point("f", RuleValue::Float(59.97));

    let truthy = [
        "b == true",
        "b == 1",
        "b != false",
        "i == -25",
        "i != 0",
        "i < 0",
        "i <= -25",
        "i > -100",
        "f < 60",
        "f >= 59.9",
        "f != 60.0",
    ];
    for expression in truthy {
        eval.clear_rules();
        eval.add_rule("r", expression).unwrap();
        assert!(eval.evaluate().triggered, "{:?} must hold", expression);
    }

    let falsy = ["b == false", "b != 1", "i > 0", "i == 25", "f > 60.0", "f == 60.0"];
    for expression in falsy {
        eval.clear_rules();
        eval.add_rule("r", expression).unwrap();
        assert!(!eval.evaluate().triggered, "{:?} must not hold", expression);
    }
}

#[test]
fn test_missing_points_and_unknown_keys() {
    let mut eval = TripRuleEvaluator::new();
    eval.add_rule("r", "ghost == true").unwrap();
    assert!(!eval.evaluate().triggered, "unknown key evaluates false");

    // A negation over a missing point holds: !false.
    eval.clear_rules();
    eval.add_rule("r", "!ghost").unwrap();
    assert!(eval.evaluate().triggered);
}

#[test]
fn test_last_write_wins_across_frames() {
    let mut eval = TripRuleEvaluator::new();
    eval.add_rule("r", "RelayA/data0 == true").unwrap();

    // Frame 1: false.
    eval.update_data_point("RelayA/data0", RuleValue::Bool(false));
    assert!(!eval.evaluate().triggered);

    // Frame 2: true.
    eval.update_data_point("RelayA/data0", RuleValue::Bool(true));
    assert!(eval.evaluate().triggered);

    // The point retains its value until the next frame overwrites it.
    assert_eq!(
        eval.data_point("RelayA/data0"),
        Some(RuleValue::Bool(true))
    );
    assert!(eval.evaluate().triggered);
}

#[test]
fn test_rule_management() {
    let mut eval = TripRuleEvaluator::new();
    eval.update_data_point("A", RuleValue::Bool(true));

    eval.add_rule("first", "A == true").unwrap();
    eval.add_rule("second", "A == true").unwrap();
    assert_eq!(eval.rule_names(), vec!["first", "second"]);
    assert_eq!(eval.rule_expression("first"), Some("A == true"));
    assert!(eval.is_rule_enabled("first"));

    // Disabling skips a rule without removing it.
    eval.set_rule_enabled("first", false);
    assert_eq!(eval.evaluate().rule_name, "second");

    // Re-adding under the same name replaces the expression.
    eval.add_rule("second", "A == false").unwrap();
    assert!(!eval.evaluate().triggered);

    eval.remove_rule("second");
    assert_eq!(eval.rule_names(), vec!["first"]);
    eval.clear_rules();
    assert!(eval.rule_names().is_empty());
}

#[test]
fn test_first_triggered_rule_short_circuits_the_cycle() {
    let mut eval = TripRuleEvaluator::new();
    eval.update_data_point("A", RuleValue::Bool(true));
    eval.update_data_point("N", RuleValue::Int(5));

    // The first rule (by name order) triggers; the later rule would raise a
    // type error but must never be evaluated this cycle.
    eval.add_rule("a_trips", "A == true").unwrap();
    eval.add_rule("z_type_error", "N == abc").unwrap();

    let result = eval.evaluate();
    assert!(result.triggered);
    assert_eq!(result.rule_name, "a_trips");
    assert!(result.message.contains("A == true"));
}

#[test]
fn test_eval_type_errors_are_reported_not_fatal() {
    let mut eval = TripRuleEvaluator::new();
    eval.update_data_point("N", RuleValue::Int(5));
    eval.add_rule("r", "N >= abc").unwrap();

    let result = eval.evaluate();
    assert!(!result.triggered);
    assert!(result.message.contains("Error evaluating rule 'r'"));

    // The engine keeps working after the diagnostic.
    eval.clear_rules();
    eval.add_rule("r", "N >= 5").unwrap();
    assert!(eval.evaluate().triggered);
}

#[test]
fn test_timestamps_are_epoch_micros_and_monotonic_enough() {
    let mut eval = TripRuleEvaluator::new();
    eval.update_data_point("A", RuleValue::Bool(true));
    eval.add_rule("r", "A == true").unwrap();

    let first = eval.evaluate();
    let second = eval.evaluate();
    assert!(first.triggered && second.triggered);
    // Sometime after 2020 in microseconds.
    assert!(first.timestamp_us > 1_577_836_800_000_000);
    assert!(second.timestamp_us >= first.timestamp_us);
}

#[test]
fn test_compound_protection_logic() {
    // A realistic interlock: trip when either relay reports a fault while
    // the breaker is not already open.
    let mut eval = TripRuleEvaluator::new();
    eval.add_rule(
        "interlock",
        "(RelayA/data0 == true || RelayB/data0 == true) && !Breaker/data0",
    )
    .unwrap();

    eval.update_data_point("RelayA/data0", RuleValue::Bool(false));
    eval.update_data_point("RelayB/data0", RuleValue::Bool(false));
    eval.update_data_point("Breaker/data0", RuleValue::Bool(false));
    assert!(!eval.evaluate().triggered);

    eval.update_data_point("RelayB/data0", RuleValue::Bool(true));
    assert!(eval.evaluate().triggered);

    // Breaker already open suppresses the trip.
    eval.update_data_point("Breaker/data0", RuleValue::Bool(true));
    assert!(!eval.evaluate().triggered);
}
