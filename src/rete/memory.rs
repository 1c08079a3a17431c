//! Alpha and beta memories.
//!
//! Memories always store their full contents; link state lives on the
//! join nodes and only gates activation propagation. That keeps the
//! set-equality invariants (memory contents == what a naive evaluation
//! would hold) independent of activation order.

use super::node::{NodeId, ProdId};
use super::pattern::Pattern;
use super::token::TokenId;
use super::working_memory::FactId;

/// Handle to an alpha memory in the network arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaId(pub(crate) u32);

/// Handle to a beta memory in the network arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BetaId(pub(crate) u32);

/// Per-pattern index of facts passing the intra-fact filter
#[derive(Debug)]
pub struct AlphaMemory {
    /// The shared pattern; at most one alpha memory exists per value
    pub pattern: Pattern,
    /// Facts currently matching the pattern
    pub items: Vec<FactId>,
    /// Join/negation nodes fed from the right by this memory
    pub successors: Vec<NodeId>,
}

impl AlphaMemory {
    pub(crate) fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            items: Vec::new(),
            successors: Vec::new(),
        }
    }
}

/// Downstream receiver of a beta memory's tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSuccessor {
    /// A join or negation node taking this memory as its left input
    Node(NodeId),
    /// A production node holding complete matches
    Production(ProdId),
}

/// Token store at one depth of a rule's condition chain
#[derive(Debug, Default)]
pub struct BetaMemory {
    /// Tokens whose chain satisfies every condition up to this depth
    pub tokens: Vec<TokenId>,
    /// Nodes and productions activated by this memory, in wiring order
    pub successors: Vec<BetaSuccessor>,
}

impl BetaMemory {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}
