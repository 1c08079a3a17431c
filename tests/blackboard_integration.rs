//! End-to-end scenarios for the blackboard engine: persistence
//! round-trips across close/reopen, message priority, session clearing,
//! transactions and the hybrid store split.

use blackboard_engine::{
    attrs, AuditAction, BlackboardEngine, EngineError, HybridStore, MemoryStore, Pattern, Rule,
    SqliteStore, Store, Value,
};
use std::sync::Arc;

fn db_path(name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    format!("/tmp/blackboard-engine-tests/{name}-{nanos}.db")
}

fn watch_rule() -> Rule {
    Rule::new("watch-aapl")
        .when(Pattern::new("stock").equals("symbol", "AAPL").bind("price", "?p"))
        .then(|_, _| Ok(()))
}

#[test]
fn persistence_roundtrip_restores_matches_with_fresh_fired_state() {
    let path = db_path("roundtrip");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let mut bb = BlackboardEngine::new(store).unwrap();
        bb.add_rule(watch_rule()).unwrap();

        bb.assert_fact("stock", attrs([("symbol", Value::from("AAPL")), ("price", Value::from(145.5))]))
            .unwrap();
        bb.assert_fact("stock", attrs([("symbol", Value::from("GOOG")), ("price", Value::from(99.0))]))
            .unwrap();
        bb.assert_fact("threshold", attrs([("symbol", Value::from("AAPL")), ("max", Value::from(150.0))]))
            .unwrap();

        assert_eq!(bb.run().unwrap().rules_fired(), 1);
        bb.close().unwrap();
    }

    // Fresh engine over the reopened store, same rule registered.
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let mut bb = BlackboardEngine::new(store).unwrap();
    bb.add_rule(watch_rule()).unwrap();

    assert_eq!(bb.facts().len(), 3);
    assert_eq!(bb.match_count("watch-aapl"), Some(1));

    // Fired state is not persisted, so the match fires again.
    assert_eq!(bb.run().unwrap().rules_fired(), 1);
}

#[test]
fn message_priority_with_post_time_tiebreak() {
    let mut bb = BlackboardEngine::new(Arc::new(MemoryStore::new())).unwrap();

    // Post order stands in for post time: A first, then C, then B.
    let a = bb.post_message("x", "T", Value::from("A"), 1).unwrap();
    let c = bb.post_message("x", "T", Value::from("C"), 5).unwrap();
    let b = bb.post_message("x", "T", Value::from("B"), 5).unwrap();

    let order: Vec<i64> = std::iter::from_fn(|| bb.consume_message("T", "worker").unwrap())
        .map(|m| m.id)
        .collect();
    assert_eq!(order, vec![c, b, a]);

    let stats = bb.message_stats().unwrap();
    assert_eq!(stats.total_posted, 3);
    assert_eq!(stats.unconsumed, 0);
}

#[test]
fn clear_session_retracts_exactly_its_facts() {
    let store = Arc::new(MemoryStore::new());
    let mut bb = BlackboardEngine::with_session(store, "S1").unwrap();
    let pattern = Pattern::new("reading").bind("n", "?n");
    bb.add_rule(Rule::new("all-readings").when(pattern.clone()).then(|_, _| Ok(())))
        .unwrap();

    for i in 0..100 {
        bb.assert_fact("reading", attrs([("n", Value::from(i as i64))]))
            .unwrap();
    }
    bb.set_session("S2");
    for i in 0..50 {
        bb.assert_fact("reading", attrs([("n", Value::from(1000 + i as i64))]))
            .unwrap();
    }
    assert_eq!(bb.alpha_memory_len(&pattern), Some(150));

    let cleared = bb.clear_session("S1").unwrap();
    assert_eq!(cleared, 100);

    // 50 facts stay active, and the alpha memory lost exactly the S1 set.
    assert_eq!(bb.stats().unwrap().active_facts, 50);
    assert_eq!(bb.alpha_memory_len(&pattern), Some(50));
    assert_eq!(bb.match_count("all-readings"), Some(50));

    // The audit log holds one retraction per cleared fact, tagged S1.
    let retractions = bb
        .fact_history(None, 1000)
        .unwrap()
        .into_iter()
        .filter(|c| c.action == AuditAction::Retract && c.session_id.as_deref() == Some("S1"))
        .count();
    assert_eq!(retractions, 100);
}

#[test]
fn transaction_rolls_back_store_mutations() {
    let path = db_path("tx");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let mut bb = BlackboardEngine::new(store).unwrap();

    let err = bb
        .transaction(|bb| {
            bb.assert_fact("stock", attrs([("symbol", Value::from("AAPL"))]))?;
            Err::<(), _>(EngineError::Unavailable {
                message: "caller aborted".into(),
            })
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::Unavailable { .. }));

    // The nested assert (and its audit row) rolled back with the scope.
    let stats = bb.stats().unwrap();
    assert_eq!(stats.total_facts, 0);
    assert_eq!(stats.fact_history_entries, 0);

    // A committing transaction persists its writes.
    bb.transaction(|bb| {
        bb.assert_fact("stock", attrs([("symbol", Value::from("GOOG"))]))?;
        Ok(())
    })
    .unwrap();
    assert_eq!(bb.stats().unwrap().active_facts, 1);
    assert_eq!(bb.stats().unwrap().fact_history_entries, 1);
}

#[test]
fn hybrid_store_splits_facts_and_audit() {
    let memory = MemoryStore::new();
    let durable = SqliteStore::open(db_path("hybrid")).unwrap();
    let store = Arc::new(HybridStore::new(memory, durable));
    let mut bb = BlackboardEngine::new(store.clone()).unwrap();
    bb.add_rule(watch_rule()).unwrap();

    bb.assert_fact("stock", attrs([("symbol", Value::from("AAPL")), ("price", Value::from(120.0))]))
        .unwrap();
    bb.run().unwrap();
    bb.post_message("scout", "alerts", Value::from("AAPL"), 3).unwrap();

    // Facts and messages live in memory; audit lives in sqlite.
    assert_eq!(store.memory().stats().unwrap().active_facts, 1);
    assert_eq!(store.durable().stats().unwrap().active_facts, 0);
    assert_eq!(store.durable().fact_history(None, 10).unwrap().len(), 1);
    assert_eq!(store.durable().rule_firings(None, 10).unwrap().len(), 1);

    let merged = bb.stats().unwrap();
    assert_eq!(merged.active_facts, 1);
    assert_eq!(merged.fact_history_entries, 1);
    assert_eq!(merged.rule_firings, 1);
    assert_eq!(merged.queued_messages, 1);

    bb.close().unwrap();
    assert!(matches!(
        store.memory().get_fact("x"),
        Err(EngineError::Closed)
    ));
}

#[test]
fn engines_sharing_a_store_keep_private_networks() {
    let store = Arc::new(MemoryStore::new());
    let mut writer = BlackboardEngine::new(store.clone()).unwrap();
    writer
        .assert_fact("stock", attrs([("symbol", Value::from("AAPL"))]))
        .unwrap();

    // A second engine sees stored facts at construction...
    let mut reader = BlackboardEngine::new(store.clone()).unwrap();
    reader.add_rule(
        Rule::new("r")
            .when(Pattern::new("stock").bind("symbol", "?s"))
            .then(|_, _| Ok(())),
    )
    .unwrap();
    assert_eq!(reader.match_count("r"), Some(1));

    // ...but later changes through the writer are not pushed into it.
    writer
        .assert_fact("stock", attrs([("symbol", Value::from("GOOG"))]))
        .unwrap();
    assert_eq!(reader.match_count("r"), Some(1));
    assert_eq!(store.stats().unwrap().active_facts, 2);
}

#[test]
fn knowledge_sources_round_trip_through_the_engine() {
    let mut bb = BlackboardEngine::new(Arc::new(MemoryStore::new())).unwrap();
    bb.register_knowledge_source("scout", "watches the market", &["stocks".into()])
        .unwrap();
    bb.register_knowledge_source("scout", "watches everything", &["stocks".into(), "news".into()])
        .unwrap();

    let sources = bb.knowledge_sources().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].description, "watches everything");
    assert_eq!(bb.stats().unwrap().knowledge_sources, 1);
}
