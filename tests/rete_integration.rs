//! End-to-end scenarios for the ephemeral engine: joins with shared
//! variables, negation toggling, unlinking behavior and the reset/replay
//! and retract/re-assert laws.

use blackboard_engine::{attrs, Engine, Pattern, Rule, Value};
use std::cell::RefCell;
use std::rc::Rc;

fn stock(symbol: &str, price: f64) -> blackboard_engine::Attributes {
    attrs([("symbol", Value::from(symbol)), ("price", Value::from(price))])
}

fn threshold(symbol: &str, max: f64) -> blackboard_engine::Attributes {
    attrs([("symbol", Value::from(symbol)), ("max", Value::from(max))])
}

#[test]
fn simple_join_binds_consistently() {
    let mut engine = Engine::new();
    let observed: Rc<RefCell<Vec<(String, f64, f64)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = observed.clone();

    engine
        .add_rule(
            Rule::new("R1")
                .when(Pattern::new("stock").bind("symbol", "?s").bind("price", "?p"))
                .when(Pattern::new("threshold").bind("symbol", "?s").bind("max", "?m"))
                .then(move |activation, _| {
                    sink.borrow_mut().push((
                        activation.bindings["?s"].as_string(),
                        activation.bindings["?p"].as_number().unwrap(),
                        activation.bindings["?m"].as_number().unwrap(),
                    ));
                    Ok(())
                }),
        )
        .unwrap();

    engine.assert_fact("stock", stock("AAPL", 145.5));
    engine.assert_fact("threshold", threshold("AAPL", 150.0));
    let result = engine.run();
    assert_eq!(result.rules_fired(), 1);
    assert_eq!(
        *observed.borrow(),
        vec![("AAPL".to_string(), 145.5, 150.0)]
    );

    // A threshold with no matching stock produces no new firing.
    engine.assert_fact("threshold", threshold("GOOG", 1000.0));
    assert_eq!(engine.run().rules_fired(), 0);
    assert_eq!(observed.borrow().len(), 1);

    // The supporting facts arrive with the activation in condition order.
    assert_eq!(result.firings[0].facts.len(), 2);
    assert_eq!(result.firings[0].facts[0].fact_type, "stock");
    assert_eq!(result.firings[0].facts[1].fact_type, "threshold");
}

#[test]
fn negation_toggles_produce_fresh_matches() {
    let mut engine = Engine::new();
    let observed: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = observed.clone();

    engine
        .add_rule(
            Rule::new("R2")
                .when(Pattern::new("stock").bind("symbol", "?s"))
                .when_not(Pattern::new("alert").bind("symbol", "?s"))
                .then(move |activation, _| {
                    sink.borrow_mut().push(activation.bindings["?s"].as_string());
                    Ok(())
                }),
        )
        .unwrap();

    engine.assert_fact("stock", attrs([("symbol", "AAPL")]));
    assert_eq!(engine.run().rules_fired(), 1);
    assert_eq!(*observed.borrow(), vec!["AAPL"]);

    // The alert deactivates the match; the earlier side effect stays.
    let alert = engine.assert_fact("alert", attrs([("symbol", "AAPL")]));
    assert_eq!(engine.match_count("R2"), Some(0));
    assert_eq!(engine.run().rules_fired(), 0);

    // Retracting the alert releases a fresh token with a fresh fired bit.
    engine.retract_fact(alert.id).unwrap();
    assert_eq!(engine.run().rules_fired(), 1);
    assert_eq!(*observed.borrow(), vec!["AAPL", "AAPL"]);
}

#[test]
fn negation_double_toggle_settles_to_steady_state() {
    let mut engine = Engine::new();
    engine
        .add_rule(
            Rule::new("R2")
                .when(Pattern::new("stock").bind("symbol", "?s"))
                .when_not(Pattern::new("alert").bind("symbol", "?s"))
                .then(|_, _| Ok(())),
        )
        .unwrap();

    engine.assert_fact("stock", attrs([("symbol", "AAPL")]));
    let a1 = engine.assert_fact("alert", attrs([("symbol", "AAPL")]));
    engine.retract_fact(a1.id).unwrap();
    let a2 = engine.assert_fact("alert", attrs([("symbol", "AAPL")]));
    engine.retract_fact(a2.id).unwrap();

    // Same state as a single steady state: one live match.
    assert_eq!(engine.match_count("R2"), Some(1));
    assert_eq!(engine.run().rules_fired(), 1);
    assert_eq!(engine.run().rules_fired(), 0);
}

#[test]
fn negated_first_condition_is_legal() {
    let mut engine = Engine::new();
    engine
        .add_rule(
            Rule::new("quiet")
                .when_not(Pattern::new("alert").bind("symbol", "?a"))
                .when(Pattern::new("stock").bind("symbol", "?s"))
                .then(|_, _| Ok(())),
        )
        .unwrap();

    engine.assert_fact("stock", attrs([("symbol", "AAPL")]));
    assert_eq!(engine.match_count("quiet"), Some(1));

    // Any alert inhibits the unconstrained negation.
    engine.assert_fact("alert", attrs([("symbol", "GOOG")]));
    assert_eq!(engine.match_count("quiet"), Some(0));
}

#[test]
fn unlinking_skips_work_until_relink() {
    let mut engine = Engine::new();
    engine
        .add_rule(
            Rule::new("R3")
                .when(Pattern::new("a").bind("val", "?x"))
                .when(Pattern::new("b").bind("val", "?x"))
                .when(Pattern::new("c").bind("val", "?x"))
                .then(|_, _| Ok(())),
        )
        .unwrap();

    engine.assert_fact("a", attrs([("val", 1i64)]));

    let chain = engine.rule_chain("R3").unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0].beta_tokens, 1);
    assert_eq!(chain[1].beta_tokens, 0);
    // The join between depth 2 and the c-alpha has an empty left input.
    assert!(!chain[2].left_linked);

    // A thousand c-facts arrive while unlinked: no token is built.
    for _ in 0..1000 {
        engine.assert_fact("c", attrs([("val", 1i64)]));
    }
    let chain = engine.rule_chain("R3").unwrap();
    assert!(!chain[2].left_linked);
    assert!(chain[2].right_linked);
    assert_eq!(chain[2].beta_tokens, 0);
    // Live tokens: the sentinel plus the single depth-1 token.
    assert_eq!(engine.network_stats().live_tokens, 2);

    // The matching b-fact relinks and replays the c-facts exactly once.
    engine.assert_fact("b", attrs([("val", 1i64)]));
    let chain = engine.rule_chain("R3").unwrap();
    assert_eq!(chain[1].beta_tokens, 1);
    assert!(chain[2].left_linked);
    assert_eq!(chain[2].beta_tokens, 1000);
    assert_eq!(engine.match_count("R3"), Some(1000));
}

#[test]
fn retract_and_equal_reassert_restores_alpha_state() {
    let mut engine = Engine::new();
    let pattern = Pattern::new("stock").bind("symbol", "?s");
    engine
        .add_rule(Rule::new("r").when(pattern.clone()).then(|_, _| Ok(())))
        .unwrap();

    let f = engine.assert_fact("stock", stock("AAPL", 145.5));
    engine.retract_fact(f.id).unwrap();
    engine.assert_fact("stock", stock("AAPL", 145.5));

    assert_eq!(engine.alpha_memory_len(&pattern), Some(1));
    assert_eq!(engine.match_count("r"), Some(1));

    // Identical to a fresh engine with a single assert.
    let mut fresh = Engine::new();
    fresh
        .add_rule(Rule::new("r").when(pattern.clone()).then(|_, _| Ok(())))
        .unwrap();
    fresh.assert_fact("stock", stock("AAPL", 145.5));
    assert_eq!(
        engine.alpha_memory_len(&pattern),
        fresh.alpha_memory_len(&pattern)
    );
    assert_eq!(engine.match_count("r"), fresh.match_count("r"));
}

#[test]
fn reset_then_replay_matches_fresh_engine() {
    let build = || {
        let mut engine = Engine::new();
        engine
            .add_rule(
                Rule::new("R1")
                    .when(Pattern::new("stock").bind("symbol", "?s").bind("price", "?p"))
                    .when(Pattern::new("threshold").bind("symbol", "?s").bind("max", "?m"))
                    .then(|_, _| Ok(())),
            )
            .unwrap();
        engine
    };
    let replay = |engine: &mut Engine| {
        engine.assert_fact("stock", stock("AAPL", 145.5));
        engine.assert_fact("stock", stock("GOOG", 99.0));
        engine.assert_fact("threshold", threshold("AAPL", 150.0));
        let result = engine.run();
        result
            .firings
            .iter()
            .map(|f| (f.rule.clone(), f.bindings["?s"].as_string()))
            .collect::<Vec<_>>()
    };

    let mut reused = build();
    let first = replay(&mut reused);
    reused.reset();
    let second = replay(&mut reused);

    let mut fresh = build();
    let fresh_run = replay(&mut fresh);

    assert_eq!(first, second);
    assert_eq!(second, fresh_run);
}

#[test]
fn constant_and_predicate_constraints_filter_alpha() {
    let mut engine = Engine::new();
    engine
        .add_rule(
            Rule::new("hot-aapl")
                .when(
                    Pattern::new("stock")
                        .equals("symbol", "AAPL")
                        .test("price", |v| v.as_number().is_some_and(|p| p > 100.0)),
                )
                .then(|_, _| Ok(())),
        )
        .unwrap();

    engine.assert_fact("stock", stock("AAPL", 145.5));
    engine.assert_fact("stock", stock("AAPL", 50.0));
    engine.assert_fact("stock", stock("GOOG", 500.0));

    assert_eq!(engine.match_count("hot-aapl"), Some(1));
}
