//! # Blackboard Engine
//!
//! A forward-chaining production rule engine for Rust built on an
//! incremental **RETE** network, extended with a persistent **blackboard**
//! for multi-agent knowledge sharing.
//!
//! ## Features
//!
//! - **Incremental matching**: facts propagate through shared alpha
//!   memories, join and negation nodes; retraction unwinds dependent
//!   matches (truth maintenance)
//! - **Unlinking**: joins whose opposite input is empty are skipped and
//!   replayed exactly once on relink
//! - **Negation**: `when_not` conditions block matches while an
//!   inhibiting fact exists and release them when it goes away
//! - **Blackboard persistence**: UUID-identified facts in SQLite, a
//!   shared in-memory store, a hybrid of the two, or Redis (feature
//!   `redis-store`)
//! - **Audit trail**: every fact change and rule firing is logged and
//!   queryable, newest first
//! - **Priority messaging**: a per-topic queue for inter-agent
//!   coordination with deterministic consume order
//!
//! ## Quick start
//!
//! ```rust
//! use blackboard_engine::{attrs, Engine, Pattern, Rule, Value};
//!
//! fn main() -> blackboard_engine::Result<()> {
//!     let mut engine = Engine::new();
//!
//!     engine.add_rule(
//!         Rule::new("price-alert")
//!             .when(Pattern::new("stock").bind("symbol", "?s").bind("price", "?p"))
//!             .when(Pattern::new("threshold").bind("symbol", "?s").bind("max", "?m"))
//!             .then(|activation, effects| {
//!                 effects.assert_fact(
//!                     "alert",
//!                     attrs([("symbol", activation.bindings["?s"].clone())]),
//!                 );
//!                 Ok(())
//!             }),
//!     )?;
//!
//!     engine.assert_fact(
//!         "stock",
//!         attrs([("symbol", Value::from("AAPL")), ("price", Value::from(145.5))]),
//!     );
//!     engine.assert_fact(
//!         "threshold",
//!         attrs([("symbol", Value::from("AAPL")), ("max", Value::from(150.0))]),
//!     );
//!
//!     let result = engine.run();
//!     assert_eq!(result.rules_fired(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Blackboard
//!
//! ```rust
//! use blackboard_engine::{attrs, BlackboardEngine, MemoryStore, Value};
//! use std::sync::Arc;
//!
//! fn main() -> blackboard_engine::Result<()> {
//!     let mut bb = BlackboardEngine::new(Arc::new(MemoryStore::new()))?;
//!
//!     let fact = bb.assert_fact("stock", attrs([("symbol", Value::from("AAPL"))]))?;
//!     bb.post_message("scout", "alerts", Value::from("AAPL moved"), 5)?;
//!
//!     // Facts carry uuid identity; every change is audited.
//!     let uuid = fact.external_id.clone().unwrap();
//!     assert_eq!(bb.fact_history(Some(&uuid), 10)?.len(), 1);
//!     assert!(bb.consume_message("alerts", "analyst")?.is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Core components
//!
//! - [`Engine`]: the ephemeral engine — rules, facts, `run`, reset
//! - [`Rule`] / [`Pattern`]: condition lists with constants, predicates
//!   and binding variables
//! - [`BlackboardEngine`]: the persistent engine — uuid facts, audit,
//!   sessions, messaging, transactions
//! - [`Store`]: the pluggable persistence interface behind
//!   [`SqliteStore`], [`MemoryStore`] and [`HybridStore`]

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Blackboard layer: stores, audit, messaging, persistent engine
pub mod blackboard;
/// Error types and result handling
pub mod errors;
/// RETE network core and the ephemeral engine
pub mod rete;
/// Core value and attribute types
pub mod types;

pub use errors::{EngineError, Result};
pub use types::{attrs, Attributes, Value};

pub use rete::{
    Activation, Condition, Engine, Fact, FactId, Firing, JoinTest, NodeState, Pattern, Rule,
    RuleEffects, RunResult, TestOp,
};

pub use blackboard::{
    AuditAction, BlackboardEngine, FactChange, HybridStore, KnowledgeSource, MemoryStore,
    MemoryStoreConfig, Message, MessageStats, RuleFiring, SqliteStore, SqliteStoreConfig, Store,
    StoredFact, StoreStats,
};

#[cfg(feature = "redis-store")]
pub use blackboard::{RedisStore, RedisStoreConfig};
