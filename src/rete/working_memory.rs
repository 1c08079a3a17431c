//! Working memory: the authoritative set of currently-asserted facts.
//!
//! Observers (the network, and on the blackboard an audit hook) are
//! notified inline, in registration order, before the triggering call
//! returns.

use crate::errors::{EngineError, Result};
use crate::rete::pattern::Pattern;
use crate::types::Attributes;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Unique handle for a fact while it is asserted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactId(u64);

impl FactId {
    /// Numeric id behind the handle
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// A typed attribute bag with stable identity while asserted
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    /// In-process handle
    pub id: FactId,
    /// UUID identity when the fact lives on a blackboard
    pub external_id: Option<String>,
    /// Symbolic type tag
    pub fact_type: String,
    /// Attribute map; the type tag does not constrain which attributes exist
    pub attributes: Attributes,
}

impl Fact {
    /// Check this fact against a pattern
    pub fn matches(&self, pattern: &Pattern) -> bool {
        pattern.matches(&self.fact_type, &self.attributes)
    }
}

/// Observer of working-memory changes
pub trait FactObserver {
    /// A fact was asserted
    fn on_assert(&mut self, fact: &Rc<Fact>);
    /// A fact was retracted
    fn on_retract(&mut self, fact: &Rc<Fact>);
}

/// The authoritative set of currently-active facts
pub struct WorkingMemory {
    facts: HashMap<FactId, Rc<Fact>>,
    type_index: HashMap<String, HashSet<FactId>>,
    next_id: u64,
    observers: Vec<Rc<RefCell<dyn FactObserver>>>,
}

impl WorkingMemory {
    /// Create an empty working memory
    pub fn new() -> Self {
        Self {
            facts: HashMap::new(),
            type_index: HashMap::new(),
            next_id: 1,
            observers: Vec::new(),
        }
    }

    /// Register an observer; observers run in registration order
    pub fn subscribe(&mut self, observer: Rc<RefCell<dyn FactObserver>>) {
        self.observers.push(observer);
    }

    /// Assert a fact and notify observers before returning
    ///
    /// Identity is assigned here, so two asserts always produce two
    /// distinct facts even for equal attribute bags.
    pub fn assert_fact(
        &mut self,
        fact_type: impl Into<String>,
        attributes: Attributes,
        external_id: Option<String>,
    ) -> Rc<Fact> {
        let id = FactId(self.next_id);
        self.next_id += 1;

        let fact = Rc::new(Fact {
            id,
            external_id,
            fact_type: fact_type.into(),
            attributes,
        });

        self.facts.insert(id, fact.clone());
        self.type_index
            .entry(fact.fact_type.clone())
            .or_default()
            .insert(id);

        for observer in self.observers.clone() {
            observer.borrow_mut().on_assert(&fact);
        }
        fact
    }

    /// Retract a fact and notify observers exactly once
    pub fn retract_fact(&mut self, id: FactId) -> Result<Rc<Fact>> {
        let fact = self.facts.remove(&id).ok_or_else(|| EngineError::NotFound {
            id: id.to_string(),
        })?;
        if let Some(ids) = self.type_index.get_mut(&fact.fact_type) {
            ids.remove(&id);
        }

        for observer in self.observers.clone() {
            observer.borrow_mut().on_retract(&fact);
        }
        Ok(fact)
    }

    /// Look up a fact by handle
    pub fn get(&self, id: FactId) -> Option<&Rc<Fact>> {
        self.facts.get(&id)
    }

    /// Iterate all asserted facts
    pub fn facts(&self) -> impl Iterator<Item = &Rc<Fact>> {
        self.facts.values()
    }

    /// All facts of one type
    pub fn get_by_type(&self, fact_type: &str) -> Vec<&Rc<Fact>> {
        self.type_index
            .get(fact_type)
            .map(|ids| ids.iter().filter_map(|id| self.facts.get(id)).collect())
            .unwrap_or_default()
    }

    /// Number of asserted facts
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Whether working memory is empty
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Drop all facts without emitting events (reset path)
    pub(crate) fn clear(&mut self) {
        self.facts.clear();
        self.type_index.clear();
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::attrs;

    struct Recorder {
        events: Vec<String>,
    }

    impl FactObserver for Recorder {
        fn on_assert(&mut self, fact: &Rc<Fact>) {
            self.events.push(format!("+{}", fact.fact_type));
        }
        fn on_retract(&mut self, fact: &Rc<Fact>) {
            self.events.push(format!("-{}", fact.fact_type));
        }
    }

    #[test]
    fn test_assert_and_retract() {
        let mut wm = WorkingMemory::new();
        let fact = wm.assert_fact("stock", attrs([("symbol", "AAPL")]), None);
        assert_eq!(wm.len(), 1);
        assert_eq!(wm.get(fact.id).unwrap().fact_type, "stock");

        let removed = wm.retract_fact(fact.id).unwrap();
        assert_eq!(removed.id, fact.id);
        assert!(wm.is_empty());
        assert!(wm.retract_fact(fact.id).is_err());
    }

    #[test]
    fn test_type_index() {
        let mut wm = WorkingMemory::new();
        wm.assert_fact("stock", attrs([("symbol", "AAPL")]), None);
        wm.assert_fact("stock", attrs([("symbol", "GOOG")]), None);
        wm.assert_fact("threshold", attrs([("max", 10i64)]), None);

        assert_eq!(wm.get_by_type("stock").len(), 2);
        assert_eq!(wm.get_by_type("threshold").len(), 1);
        assert_eq!(wm.get_by_type("alert").len(), 0);
    }

    #[test]
    fn test_observers_see_events_in_order() {
        let mut wm = WorkingMemory::new();
        let recorder = Rc::new(RefCell::new(Recorder { events: Vec::new() }));
        wm.subscribe(recorder.clone());

        let fact = wm.assert_fact("stock", attrs([("symbol", "AAPL")]), None);
        wm.assert_fact("alert", attrs([("symbol", "AAPL")]), None);
        wm.retract_fact(fact.id).unwrap();

        assert_eq!(
            recorder.borrow().events,
            vec!["+stock", "+alert", "-stock"]
        );
    }

    #[test]
    fn test_distinct_identity_for_equal_facts() {
        let mut wm = WorkingMemory::new();
        let a = wm.assert_fact("stock", attrs([("symbol", "AAPL")]), None);
        let b = wm.assert_fact("stock", attrs([("symbol", "AAPL")]), None);
        assert_ne!(a.id, b.id);
        assert_eq!(wm.len(), 2);
    }
}
