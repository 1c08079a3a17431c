//! Hybrid store: fast facts, durable audit.
//!
//! Fact CRUD, knowledge sources and messaging go to the in-memory store;
//! the audit trail goes to the transactional store. `stats` merges both
//! sides; `close` closes both.

use super::audit::{FactChange, RuleFiring};
use super::memory_store::MemoryStore;
use super::message::{Message, MessageStats};
use super::sqlite_store::SqliteStore;
use super::store::{KnowledgeSource, Store, StoredFact, StoreStats};
use crate::errors::Result;
use crate::types::{Attributes, Value};

/// In-memory facts and messaging composed with a durable audit trail
pub struct HybridStore {
    memory: MemoryStore,
    durable: SqliteStore,
}

impl HybridStore {
    /// Compose a fresh in-memory side with an existing durable side
    pub fn new(memory: MemoryStore, durable: SqliteStore) -> Self {
        Self { memory, durable }
    }

    /// Open with a new in-memory side and a durable side at `path`
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            memory: MemoryStore::new(),
            durable: SqliteStore::open(path)?,
        })
    }

    /// The in-memory side
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// The durable side
    pub fn durable(&self) -> &SqliteStore {
        &self.durable
    }
}

impl Store for HybridStore {
    fn add_fact(
        &self,
        uuid: &str,
        fact_type: &str,
        attributes: &Attributes,
        session_id: Option<&str>,
    ) -> Result<()> {
        self.memory.add_fact(uuid, fact_type, attributes, session_id)
    }

    fn remove_fact(&self, uuid: &str) -> Result<(String, Attributes)> {
        self.memory.remove_fact(uuid)
    }

    fn update_fact(&self, uuid: &str, attributes: &Attributes) -> Result<()> {
        self.memory.update_fact(uuid, attributes)
    }

    fn get_fact(&self, uuid: &str) -> Result<Option<StoredFact>> {
        self.memory.get_fact(uuid)
    }

    fn get_facts(
        &self,
        fact_type: Option<&str>,
        pattern: Option<&Attributes>,
    ) -> Result<Vec<StoredFact>> {
        self.memory.get_facts(fact_type, pattern)
    }

    fn query_facts(&self, predicate: &dyn Fn(&StoredFact) -> bool) -> Result<Vec<StoredFact>> {
        self.memory.query_facts(predicate)
    }

    fn clear_session(&self, session_id: &str) -> Result<Vec<StoredFact>> {
        self.memory.clear_session(session_id)
    }

    fn vacuum(&self) -> Result<usize> {
        let memory = self.memory.vacuum()?;
        let durable = self.durable.vacuum()?;
        Ok(memory + durable)
    }

    fn register_knowledge_source(
        &self,
        name: &str,
        description: &str,
        topics: &[String],
    ) -> Result<()> {
        self.memory.register_knowledge_source(name, description, topics)
    }

    fn knowledge_sources(&self) -> Result<Vec<KnowledgeSource>> {
        self.memory.knowledge_sources()
    }

    fn record_fact_change(&self, change: &FactChange) -> Result<()> {
        self.durable.record_fact_change(change)
    }

    fn record_rule_firing(&self, firing: &RuleFiring) -> Result<()> {
        self.durable.record_rule_firing(firing)
    }

    fn fact_history(&self, uuid: Option<&str>, limit: usize) -> Result<Vec<FactChange>> {
        self.durable.fact_history(uuid, limit)
    }

    fn rule_firings(&self, rule: Option<&str>, limit: usize) -> Result<Vec<RuleFiring>> {
        self.durable.rule_firings(rule, limit)
    }

    fn post_message(
        &self,
        sender: &str,
        topic: &str,
        content: &Value,
        priority: i64,
    ) -> Result<i64> {
        self.memory.post_message(sender, topic, content, priority)
    }

    fn consume_message(&self, topic: &str, consumer: &str) -> Result<Option<Message>> {
        self.memory.consume_message(topic, consumer)
    }

    fn peek_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>> {
        self.memory.peek_messages(topic, limit)
    }

    fn message_stats(&self) -> Result<MessageStats> {
        self.memory.message_stats()
    }

    fn stats(&self) -> Result<StoreStats> {
        let facts = self.memory.stats()?;
        let audit = self.durable.stats()?;
        Ok(StoreStats {
            total_facts: facts.total_facts,
            active_facts: facts.active_facts,
            knowledge_sources: facts.knowledge_sources,
            fact_history_entries: audit.fact_history_entries,
            rule_firings: audit.rule_firings,
            queued_messages: facts.queued_messages,
            total_messages: facts.total_messages,
        })
    }

    fn begin(&self) -> Result<()> {
        self.durable.begin()
    }

    fn commit(&self) -> Result<()> {
        self.durable.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.durable.rollback()
    }

    fn close(&self) -> Result<()> {
        let memory = self.memory.close();
        let durable = self.durable.close();
        memory.and(durable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::audit::AuditAction;
    use crate::errors::EngineError;
    use crate::types::attrs;
    use chrono::Utc;

    fn store() -> HybridStore {
        HybridStore::new(MemoryStore::new(), SqliteStore::open_in_memory().unwrap())
    }

    #[test]
    fn test_facts_live_in_memory_audit_in_sqlite() {
        let s = store();
        s.add_fact("u1", "stock", &attrs([("symbol", "AAPL")]), None)
            .unwrap();
        s.record_fact_change(&FactChange {
            fact_uuid: "u1".into(),
            fact_type: "stock".into(),
            attributes: attrs([("symbol", "AAPL")]),
            action: AuditAction::Assert,
            timestamp: Utc::now(),
            session_id: None,
        })
        .unwrap();

        assert!(s.memory().get_fact("u1").unwrap().is_some());
        assert_eq!(s.durable().stats().unwrap().active_facts, 0);
        assert_eq!(s.durable().fact_history(Some("u1"), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_merged_stats() {
        let s = store();
        s.add_fact("u1", "stock", &attrs([("symbol", "AAPL")]), None)
            .unwrap();
        s.post_message("x", "T", &Value::from("hello"), 3).unwrap();
        s.record_rule_firing(&RuleFiring {
            rule_name: "r".into(),
            fact_uuids: vec!["u1".into()],
            bindings: Default::default(),
            fired_at: Utc::now(),
            session_id: None,
        })
        .unwrap();

        let stats = s.stats().unwrap();
        assert_eq!(stats.active_facts, 1);
        assert_eq!(stats.queued_messages, 1);
        assert_eq!(stats.rule_firings, 1);
    }

    #[test]
    fn test_close_closes_both_sides() {
        let s = store();
        s.close().unwrap();
        assert!(matches!(s.memory().get_fact("u1"), Err(EngineError::Closed)));
        assert!(matches!(
            s.durable().fact_history(None, 1),
            Err(EngineError::Closed)
        ));
    }
}
