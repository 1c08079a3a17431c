//! The ephemeral engine: working memory plus a compiled network.
//!
//! Single-threaded cooperative; observers run inline. `run` snapshots the
//! eligible matches before dispatching, so rule actions that assert or
//! retract facts see their effects applied after the dispatch loop and
//! picked up by the next `run`.

use log::warn;
use std::cell::RefCell;
use std::rc::Rc;

use super::network::{Firing, NetworkStats, NodeState, ReteNetwork};
use super::pattern::Pattern;
use super::rule::{Effect, Rule};
use super::working_memory::{Fact, FactId, WorkingMemory};
use crate::errors::{EngineError, Result};
use crate::types::Attributes;

/// Outcome of one `run` call
#[derive(Debug, Default)]
pub struct RunResult {
    /// Dispatched firings, in dispatch order
    pub firings: Vec<Firing>,
    /// Action failures, isolated per token
    pub errors: Vec<EngineError>,
}

impl RunResult {
    /// Number of rule firings dispatched
    pub fn rules_fired(&self) -> usize {
        self.firings.len()
    }
}

/// Forward-chaining engine over an in-process working memory
pub struct Engine {
    working_memory: WorkingMemory,
    network: Rc<RefCell<ReteNetwork>>,
}

impl Engine {
    /// Create an engine with an empty working memory and network
    pub fn new() -> Self {
        let network = Rc::new(RefCell::new(ReteNetwork::new()));
        let mut working_memory = WorkingMemory::new();
        working_memory.subscribe(network.clone());
        Self {
            working_memory,
            network,
        }
    }

    /// Compile a rule into the network.
    ///
    /// Rules sharing a pattern share one alpha memory; re-adding a rule
    /// name replaces its production node without duplicating upstream
    /// nodes. Facts already asserted are visible to the new rule.
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        self.network.borrow_mut().add_rule(rule)
    }

    /// Assert a fact; the network reacts before this returns
    pub fn assert_fact(&mut self, fact_type: impl Into<String>, attributes: Attributes) -> Rc<Fact> {
        self.working_memory.assert_fact(fact_type, attributes, None)
    }

    pub(crate) fn assert_fact_with_id(
        &mut self,
        fact_type: impl Into<String>,
        attributes: Attributes,
        external_id: String,
    ) -> Rc<Fact> {
        self.working_memory
            .assert_fact(fact_type, attributes, Some(external_id))
    }

    /// Retract a fact; dependent tokens are removed before this returns
    pub fn retract_fact(&mut self, id: FactId) -> Result<Rc<Fact>> {
        self.working_memory.retract_fact(id)
    }

    /// Fire every eligible not-yet-fired match exactly once.
    ///
    /// Order: rule priority descending, then registration order, then
    /// token arrival order — stable for a given compilation. Effects
    /// recorded by actions are applied after the dispatch loop.
    pub fn run(&mut self) -> RunResult {
        let mut no_hook = |_: &Firing| {};
        let (result, effects) = self.run_internal(&mut no_hook);
        self.apply_effects(effects);
        result
    }

    pub(crate) fn run_internal(
        &mut self,
        hook: &mut dyn FnMut(&Firing),
    ) -> (RunResult, Vec<Effect>) {
        let (firings, errors, effects) = self.network.borrow_mut().run_collected(hook);
        (RunResult { firings, errors }, effects)
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Assert {
                    fact_type,
                    attributes,
                } => {
                    self.assert_fact(fact_type, attributes);
                }
                Effect::Retract { id, .. } => {
                    if self.retract_fact(id).is_err() {
                        warn!("effect retracted already-absent fact {}", id);
                    }
                }
                Effect::Update { external_id, .. } => {
                    warn!(
                        "update effect for {} ignored by the ephemeral engine",
                        external_id
                    );
                }
                Effect::PostMessage { topic, .. } => {
                    warn!("message for topic '{}' ignored by the ephemeral engine", topic);
                }
            }
        }
    }

    /// Clear facts, memories and match state, keeping the compiled network
    pub fn reset(&mut self) {
        self.working_memory.clear();
        self.network.borrow_mut().reset();
    }

    // ── introspection ────────────────────────────────────────────────────

    /// Snapshot of all asserted facts
    pub fn facts(&self) -> Vec<Rc<Fact>> {
        self.working_memory.facts().cloned().collect()
    }

    /// Look up one fact
    pub fn fact(&self, id: FactId) -> Option<Rc<Fact>> {
        self.working_memory.get(id).cloned()
    }

    /// All facts of one type
    pub fn facts_of_type(&self, fact_type: &str) -> Vec<Rc<Fact>> {
        self.working_memory
            .get_by_type(fact_type)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Number of asserted facts
    pub fn fact_count(&self) -> usize {
        self.working_memory.len()
    }

    /// Registered rule names in registration order
    pub fn rule_names(&self) -> Vec<String> {
        self.network.borrow().rule_names()
    }

    /// Whether a rule is registered
    pub fn has_rule(&self, name: &str) -> bool {
        self.network.borrow().has_rule(name)
    }

    /// Complete matches currently held for a rule
    pub fn match_count(&self, name: &str) -> Option<usize> {
        self.network.borrow().match_count(name)
    }

    /// Link flags and beta sizes along a rule's chain, per condition
    pub fn rule_chain(&self, name: &str) -> Option<Vec<NodeState>> {
        self.network.borrow().rule_chain(name)
    }

    /// Item count of the alpha memory for a pattern
    pub fn alpha_memory_len(&self, pattern: &Pattern) -> Option<usize> {
        self.network.borrow().alpha_memory_len(pattern)
    }

    /// `(pattern, item count)` snapshot of all alpha memories
    pub fn alpha_memories(&self) -> Vec<(Pattern, usize)> {
        self.network
            .borrow()
            .alpha_memories()
            .map(|(p, n)| (p.clone(), n))
            .collect()
    }

    /// Network arena sizes
    pub fn network_stats(&self) -> NetworkStats {
        self.network.borrow().stats()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rete::rule::RuleEffects;
    use crate::types::{attrs, Value};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn stock(symbol: &str, price: f64) -> Attributes {
        attrs([("symbol", Value::from(symbol)), ("price", Value::from(price))])
    }

    #[test]
    fn test_single_condition_rule_fires_once() {
        let mut engine = Engine::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let log = fired.clone();
        engine
            .add_rule(
                Rule::new("any-stock")
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(move |activation, _| {
                        log.borrow_mut()
                            .push(activation.bindings["?s"].as_string());
                        Ok(())
                    }),
            )
            .unwrap();

        engine.assert_fact("stock", stock("AAPL", 145.5));
        assert_eq!(engine.run().rules_fired(), 1);
        assert_eq!(*fired.borrow(), vec!["AAPL"]);

        // Already-fired match does not fire again.
        assert_eq!(engine.run().rules_fired(), 0);
    }

    #[test]
    fn test_rule_sees_pre_existing_facts() {
        let mut engine = Engine::new();
        engine.assert_fact("stock", stock("AAPL", 145.5));
        engine
            .add_rule(
                Rule::new("late")
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|_, _| Ok(())),
            )
            .unwrap();
        assert_eq!(engine.match_count("late"), Some(1));
    }

    #[test]
    fn test_retraction_removes_match_before_run() {
        let mut engine = Engine::new();
        engine
            .add_rule(
                Rule::new("any")
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|_, _| Ok(())),
            )
            .unwrap();
        let fact = engine.assert_fact("stock", stock("AAPL", 145.5));
        assert_eq!(engine.match_count("any"), Some(1));

        engine.retract_fact(fact.id).unwrap();
        assert_eq!(engine.match_count("any"), Some(0));
        assert_eq!(engine.run().rules_fired(), 0);
    }

    #[test]
    fn test_shared_pattern_shares_alpha_memory() {
        let mut engine = Engine::new();
        let pattern = || Pattern::new("stock").bind("symbol", "?s");
        engine
            .add_rule(Rule::new("a").when(pattern()).then(|_, _| Ok(())))
            .unwrap();
        engine
            .add_rule(Rule::new("b").when(pattern()).then(|_, _| Ok(())))
            .unwrap();

        let stats = engine.network_stats();
        assert_eq!(stats.alpha_memories, 1);

        engine.assert_fact("stock", stock("AAPL", 1.0));
        assert_eq!(engine.alpha_memory_len(&pattern()), Some(1));
        assert_eq!(engine.match_count("a"), Some(1));
        assert_eq!(engine.match_count("b"), Some(1));
    }

    #[test]
    fn test_shared_chain_rules_fire_independently() {
        let mut engine = Engine::new();
        let pattern = || Pattern::new("stock").bind("symbol", "?s");
        engine
            .add_rule(Rule::new("a").when(pattern()).then(|_, _| Ok(())))
            .unwrap();
        engine
            .add_rule(Rule::new("b").when(pattern()).then(|_, _| Ok(())))
            .unwrap();
        engine.assert_fact("stock", stock("AAPL", 1.0));

        let result = engine.run();
        let mut fired: Vec<&str> = result.firings.iter().map(|f| f.rule.as_str()).collect();
        fired.sort();
        assert_eq!(fired, vec!["a", "b"]);
    }

    #[test]
    fn test_priority_orders_firings() {
        let mut engine = Engine::new();
        engine
            .add_rule(
                Rule::new("low")
                    .priority(1)
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|_, _| Ok(())),
            )
            .unwrap();
        engine
            .add_rule(
                Rule::new("high")
                    .priority(10)
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|_, _| Ok(())),
            )
            .unwrap();
        engine.assert_fact("stock", stock("AAPL", 1.0));

        let result = engine.run();
        let fired: Vec<&str> = result.firings.iter().map(|f| f.rule.as_str()).collect();
        assert_eq!(fired, vec!["high", "low"]);
    }

    #[test]
    fn test_action_effects_apply_after_dispatch() {
        let mut engine = Engine::new();
        engine
            .add_rule(
                Rule::new("derive-alert")
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|activation, effects: &mut RuleEffects| {
                        effects.assert_fact(
                            "alert",
                            attrs([("symbol", activation.bindings["?s"].clone())]),
                        );
                        Ok(())
                    }),
            )
            .unwrap();
        engine
            .add_rule(
                Rule::new("on-alert")
                    .when(Pattern::new("alert").bind("symbol", "?s"))
                    .then(|_, _| Ok(())),
            )
            .unwrap();

        engine.assert_fact("stock", stock("AAPL", 1.0));
        let first = engine.run();
        assert_eq!(first.rules_fired(), 1);
        assert_eq!(engine.facts_of_type("alert").len(), 1);

        // The derived alert becomes visible to the next run.
        let second = engine.run();
        let fired: Vec<&str> = second.firings.iter().map(|f| f.rule.as_str()).collect();
        assert_eq!(fired, vec!["on-alert"]);
    }

    #[test]
    fn test_action_failure_is_isolated() {
        let mut engine = Engine::new();
        engine
            .add_rule(
                Rule::new("boom")
                    .priority(10)
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|_, _| {
                        Err(EngineError::Unavailable {
                            message: "action exploded".into(),
                        })
                    }),
            )
            .unwrap();
        engine
            .add_rule(
                Rule::new("fine")
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|_, _| Ok(())),
            )
            .unwrap();
        engine.assert_fact("stock", stock("AAPL", 1.0));

        let result = engine.run();
        assert_eq!(result.rules_fired(), 2);
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(
            &result.errors[0],
            EngineError::ActionFailure { rule, .. } if rule == "boom"
        ));
        // The failed token never fires twice either.
        assert_eq!(engine.run().rules_fired(), 0);
    }

    #[test]
    fn test_zero_condition_rule_rejected() {
        let mut engine = Engine::new();
        let err = engine.add_rule(Rule::new("empty").then(|_, _| Ok(()))).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRule { .. }));
    }

    #[test]
    fn test_unbound_variable_via_negation_rejected() {
        let mut engine = Engine::new();
        let err = engine
            .add_rule(
                Rule::new("bad")
                    .when_not(Pattern::new("alert").bind("symbol", "?s"))
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|_, _| Ok(())),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::PatternMismatch { .. }));
    }

    #[test]
    fn test_replacing_a_rule_keeps_single_chain() {
        let mut engine = Engine::new();
        let pattern = || Pattern::new("stock").bind("symbol", "?s");
        engine
            .add_rule(Rule::new("r").when(pattern()).then(|_, _| Ok(())))
            .unwrap();
        let before = engine.network_stats();

        engine
            .add_rule(Rule::new("r").when(pattern()).then(|_, _| Ok(())))
            .unwrap();
        let after = engine.network_stats();
        assert_eq!(before.nodes, after.nodes);
        assert_eq!(before.productions, after.productions);
        assert_eq!(engine.rule_names(), vec!["r"]);

        engine.assert_fact("stock", stock("AAPL", 1.0));
        assert_eq!(engine.run().rules_fired(), 1);
    }

    #[test]
    fn test_reset_preserves_network_and_replays() {
        let mut engine = Engine::new();
        engine
            .add_rule(
                Rule::new("r")
                    .when(Pattern::new("stock").bind("symbol", "?s"))
                    .then(|_, _| Ok(())),
            )
            .unwrap();
        engine.assert_fact("stock", stock("AAPL", 1.0));
        assert_eq!(engine.run().rules_fired(), 1);

        engine.reset();
        assert_eq!(engine.fact_count(), 0);
        assert_eq!(engine.match_count("r"), Some(0));

        // Same assert sequence produces the same firings on a kept network.
        engine.assert_fact("stock", stock("AAPL", 1.0));
        assert_eq!(engine.run().rules_fired(), 1);
    }
}
