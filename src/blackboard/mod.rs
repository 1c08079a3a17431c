//! Blackboard layer: persistent stores, audit trail, message queue and
//! the store-backed engine.

pub mod audit;
pub mod engine;
pub mod hybrid_store;
pub mod memory_store;
pub mod message;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod sqlite_store;
pub mod store;

pub use audit::{AuditAction, FactChange, RuleFiring};
pub use engine::BlackboardEngine;
pub use hybrid_store::HybridStore;
pub use memory_store::{MemoryStore, MemoryStoreConfig};
pub use message::{Message, MessageStats};
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use sqlite_store::{SqliteStore, SqliteStoreConfig};
pub use store::{KnowledgeSource, Store, StoredFact, StoreStats};
