//! Join, negation and production nodes.

use super::memory::{AlphaId, BetaId};
use super::rule::{JoinTest, Rule};
use super::token::TokenId;
use super::working_memory::FactId;
use std::collections::HashMap;

/// Handle to a join/negation node in the network arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// Handle to a production node in the network arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProdId(pub(crate) u32);

/// What a two-input node does with passing combinations
#[derive(Debug)]
pub enum NodeKind {
    /// Emit a child token per (token, fact) pair passing the tests
    Join,
    /// Emit a fact-less child token only while no right fact passes the
    /// tests; the map tracks which facts currently inhibit each left token
    Negation {
        /// Left token → right facts blocking it (entries are non-empty)
        inhibitors: HashMap<TokenId, Vec<FactId>>,
    },
}

/// A two-input combinator over a beta memory (left) and an alpha memory
/// (right)
#[derive(Debug)]
pub struct BetaNode {
    /// Join or negation behavior
    pub kind: NodeKind,
    /// Left input
    pub left: BetaId,
    /// Right input
    pub right: AlphaId,
    /// Inter-fact consistency tests
    pub tests: Vec<JoinTest>,
    /// Output beta memories
    pub successors: Vec<BetaId>,
    /// False while the left beta memory is empty; gates right activations
    pub left_linked: bool,
    /// False while the right alpha memory is empty; gates left activations
    pub right_linked: bool,
}

impl BetaNode {
    /// Whether this is a negation node
    pub fn is_negation(&self) -> bool {
        matches!(self.kind, NodeKind::Negation { .. })
    }
}

/// Terminal node holding a rule's complete matches
pub struct ProductionNode {
    /// The compiled rule, including its action
    pub rule: Rule,
    /// Tokens representing complete matches, in arrival order
    pub tokens: Vec<TokenId>,
    /// The join/negation chain compiled for this rule, condition by
    /// condition (shared prefixes appear in several rules' chains)
    pub chain: Vec<NodeId>,
    /// The beta memory this production is attached to
    pub beta: BetaId,
}

impl std::fmt::Debug for ProductionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionNode")
            .field("rule", &self.rule.name)
            .field("tokens", &self.tokens)
            .field("chain", &self.chain)
            .finish()
    }
}
