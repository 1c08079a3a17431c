//! The pluggable fact persistence interface.
//!
//! A `Store` holds uuid-identified facts, the audit trail and the message
//! queue. Backends are swappable at engine construction and shareable
//! across threads (`Arc<dyn Store>`); every operation is internally
//! atomic. Retraction is a logical tombstone; `vacuum` compacts
//! tombstones past the backend's retention horizon.

use super::audit::{FactChange, RuleFiring};
use super::message::{Message, MessageStats};
use crate::errors::Result;
use crate::types::{Attributes, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fact as persisted by a store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFact {
    /// UUID identity, stable for the life of the fact
    pub uuid: String,
    /// Symbolic type tag
    pub fact_type: String,
    /// Attribute map
    pub attributes: Attributes,
    /// Session the fact was asserted under
    pub session_id: Option<String>,
    /// When the fact was added
    pub created_at: DateTime<Utc>,
    /// Maintained on every mutation
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag
    pub retracted: bool,
    /// When the tombstone was set
    pub retracted_at: Option<DateTime<Utc>>,
}

impl StoredFact {
    /// Subset match: every pattern attribute must be present and equal
    pub fn matches_pattern(&self, pattern: &Attributes) -> bool {
        pattern
            .iter()
            .all(|(attr, expected)| self.attributes.get(attr) == Some(expected))
    }
}

/// A registered collaborating agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSource {
    /// Unique name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Topics the source works on
    pub topics: Vec<String>,
    /// Whether the source is active
    pub active: bool,
    /// When the source first registered
    pub registered_at: DateTime<Utc>,
}

/// Counters reported by `Store::stats`
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    /// All fact records including tombstones
    pub total_facts: usize,
    /// Facts not tombstoned
    pub active_facts: usize,
    /// Registered knowledge sources
    pub knowledge_sources: usize,
    /// Fact-change audit records
    pub fact_history_entries: usize,
    /// Rule-firing audit records
    pub rule_firings: usize,
    /// Messages not yet consumed
    pub queued_messages: usize,
    /// Messages ever posted
    pub total_messages: usize,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "store: {}/{} facts active, {} sources, {} changes, {} firings, {}/{} messages queued",
            self.active_facts,
            self.total_facts,
            self.knowledge_sources,
            self.fact_history_entries,
            self.rule_firings,
            self.queued_messages,
            self.total_messages
        )
    }
}

/// Fact persistence back end.
///
/// Implementations: [`super::SqliteStore`] (durable, transactional),
/// [`super::MemoryStore`] (shared in-memory), [`super::HybridStore`]
/// (facts in memory, audit durable) and, behind the `redis-store`
/// feature, a Redis-backed equivalent of the in-memory layout.
pub trait Store: Send + Sync {
    // ── facts ────────────────────────────────────────────────────────────

    /// Add a fact; fails with `DuplicateId` if the uuid exists
    fn add_fact(
        &self,
        uuid: &str,
        fact_type: &str,
        attributes: &Attributes,
        session_id: Option<&str>,
    ) -> Result<()>;

    /// Tombstone a fact, returning its (type, attributes); `NotFound` if
    /// unknown or already retracted
    fn remove_fact(&self, uuid: &str) -> Result<(String, Attributes)>;

    /// Replace a fact's attributes; `NotFound` if retracted or unknown
    fn update_fact(&self, uuid: &str, attributes: &Attributes) -> Result<()>;

    /// Look up one active fact; `Ok(None)` when missing
    fn get_fact(&self, uuid: &str) -> Result<Option<StoredFact>>;

    /// Active facts, optionally filtered by type and attribute subset
    fn get_facts(
        &self,
        fact_type: Option<&str>,
        pattern: Option<&Attributes>,
    ) -> Result<Vec<StoredFact>>;

    /// Active facts passing an arbitrary predicate
    fn query_facts(&self, predicate: &dyn Fn(&StoredFact) -> bool) -> Result<Vec<StoredFact>>;

    /// Tombstone every fact tagged with the session; returns the facts
    /// that were active before the call
    fn clear_session(&self, session_id: &str) -> Result<Vec<StoredFact>>;

    /// Physically remove tombstones older than the retention horizon;
    /// returns how many records were compacted
    fn vacuum(&self) -> Result<usize>;

    // ── knowledge sources ────────────────────────────────────────────────

    /// Register a collaborating agent; idempotent, re-registration
    /// refreshes description and topics
    fn register_knowledge_source(
        &self,
        name: &str,
        description: &str,
        topics: &[String],
    ) -> Result<()>;

    /// All registered knowledge sources
    fn knowledge_sources(&self) -> Result<Vec<KnowledgeSource>>;

    // ── audit ────────────────────────────────────────────────────────────

    /// Append a fact-change record
    fn record_fact_change(&self, change: &FactChange) -> Result<()>;

    /// Append a rule-firing record
    fn record_rule_firing(&self, firing: &RuleFiring) -> Result<()>;

    /// Newest-first fact history, optionally scoped to one uuid
    fn fact_history(&self, uuid: Option<&str>, limit: usize) -> Result<Vec<FactChange>>;

    /// Newest-first rule firings, optionally scoped to one rule
    fn rule_firings(&self, rule: Option<&str>, limit: usize) -> Result<Vec<RuleFiring>>;

    // ── messages ─────────────────────────────────────────────────────────

    /// Post a message; returns the monotonically assigned id
    fn post_message(&self, sender: &str, topic: &str, content: &Value, priority: i64)
        -> Result<i64>;

    /// Atomically take the highest-priority unconsumed message on a topic
    /// (earlier post time breaks ties); a message is delivered to at most
    /// one consumer
    fn consume_message(&self, topic: &str, consumer: &str) -> Result<Option<Message>>;

    /// Up to `limit` highest-priority unconsumed messages, unmodified
    fn peek_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>>;

    /// Queue counters
    fn message_stats(&self) -> Result<MessageStats>;

    // ── lifecycle ────────────────────────────────────────────────────────

    /// Store-wide counters
    fn stats(&self) -> Result<StoreStats>;

    /// Open a (re-entrant) transaction scope where the backend supports
    /// one; a passive scope otherwise
    fn begin(&self) -> Result<()>;

    /// Close the innermost scope, committing when it is the outermost
    fn commit(&self) -> Result<()>;

    /// Abort the whole transaction, rolling back where supported
    fn rollback(&self) -> Result<()>;

    /// Release resources; subsequent operations fail with `Closed`
    fn close(&self) -> Result<()>;
}
