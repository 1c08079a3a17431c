//! RETE algorithm core: patterns, memories, nodes, tokens and the engine.

pub mod engine;
pub mod memory;
pub mod network;
pub mod node;
pub mod pattern;
pub mod rule;
pub mod token;
pub mod working_memory;

pub use engine::{Engine, RunResult};
pub use memory::{AlphaId, AlphaMemory, BetaId, BetaMemory, BetaSuccessor};
pub use network::{Firing, NetworkStats, NodeState, ReteNetwork};
pub use node::{BetaNode, NodeId, NodeKind, ProdId, ProductionNode};
pub use pattern::{Constraint, Pattern, Predicate};
pub use rule::{Activation, Condition, Effect, JoinTest, Rule, RuleEffects, TestOp};
pub use token::{Token, TokenId, TokenSource};
pub use working_memory::{Fact, FactId, FactObserver, WorkingMemory};
