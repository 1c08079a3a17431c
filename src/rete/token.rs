//! Tokens: partial matches along a rule's condition chain.
//!
//! A token is a cons cell over facts. Walking parent pointers to the root
//! and skipping empty slots (negation tokens carry no fact) yields the
//! facts supporting the match. Tokens live in the network-owned arena and
//! are referred to by handle everywhere else.

use super::node::NodeId;
use super::working_memory::FactId;

/// Handle into the network token arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub(crate) u32);

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Which node produced a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// The sentinel in the root beta memory
    Root,
    /// A join or negation node
    Node(NodeId),
}

/// One link in a partial-match chain
#[derive(Debug)]
pub struct Token {
    /// Parent token, `None` only for the root sentinel
    pub parent: Option<TokenId>,
    /// Supporting fact; `None` for the sentinel and for negation tokens
    pub fact: Option<FactId>,
    /// Node that produced this token
    pub source: TokenSource,
    /// Child tokens, deactivated in cascade with this one
    pub children: Vec<TokenId>,
}

impl Token {
    /// The root sentinel representing "no conditions matched yet"
    pub fn sentinel() -> Self {
        Self {
            parent: None,
            fact: None,
            source: TokenSource::Root,
            children: Vec::new(),
        }
    }

    /// A token produced by a node
    pub fn child_of(parent: TokenId, fact: Option<FactId>, node: NodeId) -> Self {
        Self {
            parent: Some(parent),
            fact,
            source: TokenSource::Node(node),
            children: Vec::new(),
        }
    }
}
