//! Patterns: the intra-fact filter behind every alpha memory.
//!
//! A pattern is a fact type plus a set of per-attribute constraints. Two
//! patterns that compare equal share one alpha memory, which is required
//! both for unlinking correctness and for network size.

use crate::types::{Attributes, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque predicate applied to a single attribute value
pub type Predicate = Arc<dyn Fn(&Value) -> bool>;

/// Constraint on one attribute of a candidate fact
#[derive(Clone)]
pub enum Constraint {
    /// Attribute must equal the constant
    Equals(Value),
    /// Attribute must satisfy the predicate
    Test(Predicate),
    /// Attribute matches anything and is exported under the variable name
    Binding(String),
}

impl std::fmt::Debug for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraint::Equals(v) => write!(f, "Equals({:?})", v),
            Constraint::Test(p) => write!(f, "Test(@{:p})", Arc::as_ptr(p)),
            Constraint::Binding(name) => write!(f, "Binding({})", name),
        }
    }
}

impl PartialEq for Constraint {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constraint::Equals(a), Constraint::Equals(b)) => a == b,
            // Predicates compare by closure identity: the same Arc shared
            // between rules unifies, distinct closures never do.
            (Constraint::Test(a), Constraint::Test(b)) => Arc::ptr_eq(a, b),
            (Constraint::Binding(a), Constraint::Binding(b)) => a == b,
            _ => false,
        }
    }
}

/// A (type, constraints) description of facts of interest
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    fact_type: String,
    constraints: BTreeMap<String, Constraint>,
}

impl Pattern {
    /// Create a pattern accepting any fact of the given type
    pub fn new(fact_type: impl Into<String>) -> Self {
        Self {
            fact_type: fact_type.into(),
            constraints: BTreeMap::new(),
        }
    }

    /// Require an attribute to equal a constant
    pub fn equals(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints
            .insert(attr.into(), Constraint::Equals(value.into()));
        self
    }

    /// Require an attribute to satisfy a predicate
    pub fn test<F>(mut self, attr: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + 'static,
    {
        self.constraints
            .insert(attr.into(), Constraint::Test(Arc::new(predicate)));
        self
    }

    /// Require an attribute to satisfy an already-shared predicate
    ///
    /// Sharing the same `Arc` across rules lets their patterns compare
    /// equal and therefore share one alpha memory.
    pub fn test_shared(mut self, attr: impl Into<String>, predicate: Predicate) -> Self {
        self.constraints
            .insert(attr.into(), Constraint::Test(predicate));
        self
    }

    /// Bind an attribute to a variable, exported to later conditions and
    /// to the rule action
    pub fn bind(mut self, attr: impl Into<String>, variable: impl Into<String>) -> Self {
        self.constraints
            .insert(attr.into(), Constraint::Binding(variable.into()));
        self
    }

    /// The fact type this pattern accepts
    pub fn fact_type(&self) -> &str {
        &self.fact_type
    }

    /// The per-attribute constraints, ordered by attribute name
    pub fn constraints(&self) -> impl Iterator<Item = (&str, &Constraint)> {
        self.constraints.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Look up the constraint on one attribute
    pub fn constraint(&self, attr: &str) -> Option<&Constraint> {
        self.constraints.get(attr)
    }

    /// Remove and return the constraint on one attribute
    pub(crate) fn take_constraint(&mut self, attr: &str) -> Option<Constraint> {
        self.constraints.remove(attr)
    }

    /// Iterate the `(attribute, variable)` pairs bound by this pattern
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.constraints.iter().filter_map(|(attr, c)| match c {
            Constraint::Binding(var) => Some((attr.as_str(), var.as_str())),
            _ => None,
        })
    }

    /// Check a fact against this pattern
    ///
    /// Types must agree; every constrained attribute must be present and
    /// pass its constraint. A binding requires presence (the value is
    /// exported) but constrains nothing else.
    pub fn matches(&self, fact_type: &str, attributes: &Attributes) -> bool {
        if fact_type != self.fact_type {
            return false;
        }
        self.constraints.iter().all(|(attr, constraint)| {
            match (attributes.get(attr), constraint) {
                (Some(value), Constraint::Equals(expected)) => value == expected,
                (Some(value), Constraint::Test(pred)) => pred(value),
                (Some(_), Constraint::Binding(_)) => true,
                (None, _) => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::attrs;

    #[test]
    fn test_type_and_constant_matching() {
        let p = Pattern::new("stock").equals("symbol", "AAPL");

        assert!(p.matches("stock", &attrs([("symbol", "AAPL")])));
        assert!(!p.matches("stock", &attrs([("symbol", "GOOG")])));
        assert!(!p.matches("threshold", &attrs([("symbol", "AAPL")])));
    }

    #[test]
    fn test_predicate_matching() {
        let p = Pattern::new("stock").test("price", |v| v.as_number().is_some_and(|n| n > 100.0));

        assert!(p.matches("stock", &attrs([("price", 145.5)])));
        assert!(!p.matches("stock", &attrs([("price", 99.0)])));
        assert!(!p.matches("stock", &attrs([("volume", 1_000i64)])));
    }

    #[test]
    fn test_binding_requires_presence() {
        let p = Pattern::new("stock").bind("symbol", "?s");

        assert!(p.matches("stock", &attrs([("symbol", "AAPL")])));
        assert!(!p.matches("stock", &attrs([("price", 1.0)])));
    }

    #[test]
    fn test_value_equality_for_sharing() {
        let a = Pattern::new("stock").equals("symbol", "AAPL").bind("price", "?p");
        let b = Pattern::new("stock").equals("symbol", "AAPL").bind("price", "?p");
        assert_eq!(a, b);

        let c = Pattern::new("stock").equals("symbol", "GOOG").bind("price", "?p");
        assert_ne!(a, c);
    }

    #[test]
    fn test_predicate_identity_sharing_policy() {
        let shared: Predicate = Arc::new(|v: &Value| v.as_number().is_some_and(|n| n > 0.0));

        let a = Pattern::new("stock").test_shared("price", shared.clone());
        let b = Pattern::new("stock").test_shared("price", shared);
        assert_eq!(a, b);

        // Structurally identical but distinct closures stay distinct.
        let c = Pattern::new("stock").test("price", |v| v.as_number().is_some_and(|n| n > 0.0));
        let d = Pattern::new("stock").test("price", |v| v.as_number().is_some_and(|n| n > 0.0));
        assert_ne!(c, d);
    }
}
