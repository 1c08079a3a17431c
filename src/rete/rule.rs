//! Rules, conditions, join tests and the action surface.
//!
//! A rule is a named, prioritized condition list plus an action. Actions
//! receive the matched facts and variable bindings and record their
//! side effects into a [`RuleEffects`] buffer; the engine applies the
//! buffer after the dispatch loop so re-entrant mutations become visible
//! on the next run.

use super::pattern::Pattern;
use super::working_memory::{Fact, FactId};
use crate::errors::Result;
use crate::types::{Attributes, Value};
use std::collections::HashMap;
use std::rc::Rc;

/// Comparison applied by a variable join test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOp {
    /// Values must be equal
    Eq,
    /// Values must differ
    Ne,
}

/// Inter-fact consistency test attached to a join or negation node
#[derive(Debug, Clone, PartialEq)]
pub enum JoinTest {
    /// Compare an attribute of an earlier condition's fact against an
    /// attribute of the candidate fact
    Variable {
        /// Index of the earlier condition supplying the left value
        token_index: usize,
        /// Attribute read from that condition's fact
        token_attr: String,
        /// Attribute read from the candidate fact
        fact_attr: String,
        /// Comparison to apply
        op: TestOp,
    },
    /// Compare an attribute of the candidate fact against a literal
    Constant {
        /// Attribute read from the candidate fact
        fact_attr: String,
        /// Expected value
        value: Value,
    },
}

/// A pattern plus a negated flag plus optional explicit join tests
#[derive(Debug, Clone)]
pub struct Condition {
    /// What the condition accepts
    pub pattern: Pattern,
    /// Negated conditions block token propagation and bind nothing
    pub negated: bool,
    /// Tests appended after the ones derived from variable reuse
    pub tests: Vec<JoinTest>,
}

impl Condition {
    /// A positive condition
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            negated: false,
            tests: Vec::new(),
        }
    }

    /// A negated condition
    pub fn negated(pattern: Pattern) -> Self {
        Self {
            pattern,
            negated: true,
            tests: Vec::new(),
        }
    }

    /// Attach an explicit join test
    pub fn join_test(mut self, test: JoinTest) -> Self {
        self.tests.push(test);
        self
    }
}

impl From<Pattern> for Condition {
    fn from(pattern: Pattern) -> Self {
        Condition::new(pattern)
    }
}

/// A complete match handed to a rule action
#[derive(Debug, Clone)]
pub struct Activation {
    /// Supporting facts in condition order (negated slots excluded)
    pub facts: Vec<Rc<Fact>>,
    /// Variable name → value observed on the supporting facts
    pub bindings: HashMap<String, Value>,
}

/// A side effect recorded by a rule action
#[derive(Debug, Clone)]
pub enum Effect {
    /// Assert a new fact
    Assert {
        /// Type of the new fact
        fact_type: String,
        /// Its attributes
        attributes: Attributes,
    },
    /// Retract an existing fact
    Retract {
        /// Working-memory handle
        id: FactId,
        /// Blackboard uuid, when the fact has one
        external_id: Option<String>,
    },
    /// Update a blackboard fact in place
    Update {
        /// Blackboard uuid
        external_id: String,
        /// Replacement attributes
        attributes: Attributes,
    },
    /// Post to the blackboard message queue
    PostMessage {
        /// Posting agent
        sender: String,
        /// Topic to post on
        topic: String,
        /// Structured payload
        content: Value,
        /// Higher consumes first
        priority: i64,
    },
}

/// Buffer of side effects recorded while a rule action runs
///
/// Effects are applied after the dispatch loop, so a firing never mutates
/// the network out from under the tokens snapshotted for this run.
#[derive(Debug, Default)]
pub struct RuleEffects {
    effects: Vec<Effect>,
}

impl RuleEffects {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a fact assertion
    pub fn assert_fact(&mut self, fact_type: impl Into<String>, attributes: Attributes) {
        self.effects.push(Effect::Assert {
            fact_type: fact_type.into(),
            attributes,
        });
    }

    /// Schedule a fact retraction
    pub fn retract(&mut self, fact: &Fact) {
        self.effects.push(Effect::Retract {
            id: fact.id,
            external_id: fact.external_id.clone(),
        });
    }

    /// Schedule an in-place update of a blackboard fact
    pub fn update(&mut self, fact: &Fact, attributes: Attributes) {
        if let Some(uuid) = &fact.external_id {
            self.effects.push(Effect::Update {
                external_id: uuid.clone(),
                attributes,
            });
        } else {
            log::warn!("update effect ignored for non-blackboard fact {}", fact.id);
        }
    }

    /// Schedule a message post (blackboard engines only)
    pub fn post_message(
        &mut self,
        sender: impl Into<String>,
        topic: impl Into<String>,
        content: Value,
        priority: i64,
    ) {
        self.effects.push(Effect::PostMessage {
            sender: sender.into(),
            topic: topic.into(),
            content,
            priority,
        });
    }

    /// Number of buffered effects
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub(crate) fn drain(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

/// Rule action: receives the activation, records effects, may fail
pub type Action = Box<dyn FnMut(&Activation, &mut RuleEffects) -> Result<()>>;

/// A named, prioritized pair of condition list and action
pub struct Rule {
    /// Unique name within an engine
    pub name: String,
    /// Higher priority fires first within one run
    pub priority: i32,
    /// Ordered condition list
    pub conditions: Vec<Condition>,
    pub(crate) action: Action,
}

impl Rule {
    /// New rule with no conditions and a no-op action
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            conditions: Vec::new(),
            action: Box::new(|_, _| Ok(())),
        }
    }

    /// Set the priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Append a positive condition
    pub fn when(mut self, condition: impl Into<Condition>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    /// Append a negated condition
    pub fn when_not(mut self, pattern: Pattern) -> Self {
        self.conditions.push(Condition::negated(pattern));
        self
    }

    /// Set the action
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: FnMut(&Activation, &mut RuleEffects) -> Result<()> + 'static,
    {
        self.action = Box::new(action);
        self
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("conditions", &self.conditions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_builder() {
        let rule = Rule::new("high-price")
            .priority(10)
            .when(Pattern::new("stock").bind("symbol", "?s"))
            .when_not(Pattern::new("alert").bind("symbol", "?s"))
            .then(|_, _| Ok(()));

        assert_eq!(rule.name, "high-price");
        assert_eq!(rule.priority, 10);
        assert_eq!(rule.conditions.len(), 2);
        assert!(!rule.conditions[0].negated);
        assert!(rule.conditions[1].negated);
    }

    #[test]
    fn test_effects_buffering() {
        let mut effects = RuleEffects::new();
        assert!(effects.is_empty());

        effects.assert_fact("alert", crate::types::attrs([("symbol", "AAPL")]));
        effects.post_message("trader", "alerts", Value::from("AAPL over limit"), 5);
        assert_eq!(effects.len(), 2);

        let drained = effects.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(&drained[0], Effect::Assert { fact_type, .. } if fact_type == "alert"));
        assert!(effects.is_empty());
    }
}
