//! Shared in-memory store.
//!
//! One lock-guarded record map plus the secondary index sets of the
//! distributed layout: the set of active uuids, active uuids per type,
//! active uuids per session, and the all-records set that vacuum walks.
//! Audit lists are newest-first and trimmed to configurable caps; the
//! message queue is ordered by `(-priority, post time, id)` through a
//! score map. Handles are cheap clones sharing one store, so the store
//! can back several engines or threads at once.

use super::audit::{FactChange, RuleFiring};
use super::message::{queue_score, Message, MessageStats};
use super::store::{KnowledgeSource, Store, StoredFact, StoreStats};
use crate::errors::{EngineError, Result};
use crate::types::{Attributes, Value};
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Tunables for the in-memory backend
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// How long tombstoned records survive before `vacuum` removes them
    pub tombstone_retention: Duration,
    /// Cap on the global audit lists
    pub audit_cap_global: usize,
    /// Cap on the per-fact and per-rule audit lists
    pub audit_cap_scoped: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            tombstone_retention: Duration::days(30),
            audit_cap_global: 10_000,
            audit_cap_scoped: 1_000,
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    facts: HashMap<String, StoredFact>,
    active: HashSet<String>,
    by_type: HashMap<String, HashSet<String>>,
    by_session: HashMap<String, HashSet<String>>,
    all: HashSet<String>,
    knowledge_sources: HashMap<String, KnowledgeSource>,
    messages: HashMap<i64, Message>,
    queues: HashMap<String, BTreeMap<(i128, i64), i64>>,
    history_all: VecDeque<FactChange>,
    history_by_fact: HashMap<String, VecDeque<FactChange>>,
    firings_all: VecDeque<RuleFiring>,
    firings_by_rule: HashMap<String, VecDeque<RuleFiring>>,
    total_messages: usize,
    closed: bool,
}

/// Process-shared in-memory backend
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
    next_message_id: Arc<AtomicI64>,
    config: MemoryStoreConfig,
}

impl MemoryStore {
    /// New empty store with default retention and caps
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// New empty store with explicit tunables
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner::default())),
            next_message_id: Arc::new(AtomicI64::new(1)),
            config,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryInner>> {
        let guard = self.inner.read().unwrap();
        if guard.closed {
            return Err(EngineError::Closed);
        }
        Ok(guard)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryInner>> {
        let guard = self.inner.write().unwrap();
        if guard.closed {
            return Err(EngineError::Closed);
        }
        Ok(guard)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tombstone(inner: &mut MemoryInner, uuid: &str) -> Option<(String, Attributes)> {
    let record = inner.facts.get_mut(uuid)?;
    if record.retracted {
        return None;
    }
    record.retracted = true;
    record.retracted_at = Some(Utc::now());
    record.updated_at = Utc::now();
    let fact_type = record.fact_type.clone();
    let attributes = record.attributes.clone();
    let session = record.session_id.clone();

    inner.active.remove(uuid);
    if let Some(ids) = inner.by_type.get_mut(&fact_type) {
        ids.remove(uuid);
    }
    if let Some(session) = session {
        if let Some(ids) = inner.by_session.get_mut(&session) {
            ids.remove(uuid);
        }
    }
    Some((fact_type, attributes))
}

fn push_capped<T>(list: &mut VecDeque<T>, entry: T, cap: usize) {
    list.push_front(entry);
    list.truncate(cap);
}

impl Store for MemoryStore {
    fn add_fact(
        &self,
        uuid: &str,
        fact_type: &str,
        attributes: &Attributes,
        session_id: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.write()?;
        if inner.facts.contains_key(uuid) {
            return Err(EngineError::DuplicateId { id: uuid.into() });
        }
        let now = Utc::now();
        inner.facts.insert(
            uuid.to_string(),
            StoredFact {
                uuid: uuid.to_string(),
                fact_type: fact_type.to_string(),
                attributes: attributes.clone(),
                session_id: session_id.map(str::to_string),
                created_at: now,
                updated_at: now,
                retracted: false,
                retracted_at: None,
            },
        );
        inner.active.insert(uuid.to_string());
        inner.all.insert(uuid.to_string());
        inner
            .by_type
            .entry(fact_type.to_string())
            .or_default()
            .insert(uuid.to_string());
        if let Some(session) = session_id {
            inner
                .by_session
                .entry(session.to_string())
                .or_default()
                .insert(uuid.to_string());
        }
        Ok(())
    }

    fn remove_fact(&self, uuid: &str) -> Result<(String, Attributes)> {
        let mut inner = self.write()?;
        tombstone(&mut inner, uuid).ok_or_else(|| EngineError::NotFound { id: uuid.into() })
    }

    fn update_fact(&self, uuid: &str, attributes: &Attributes) -> Result<()> {
        let mut inner = self.write()?;
        let record = inner
            .facts
            .get_mut(uuid)
            .filter(|f| !f.retracted)
            .ok_or_else(|| EngineError::NotFound { id: uuid.into() })?;
        record.attributes = attributes.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    fn get_fact(&self, uuid: &str) -> Result<Option<StoredFact>> {
        let inner = self.read()?;
        Ok(inner.facts.get(uuid).filter(|f| !f.retracted).cloned())
    }

    fn get_facts(
        &self,
        fact_type: Option<&str>,
        pattern: Option<&Attributes>,
    ) -> Result<Vec<StoredFact>> {
        let inner = self.read()?;
        let uuids: Vec<&String> = match fact_type {
            // Pattern queries scan the relevant type set.
            Some(t) => inner
                .by_type
                .get(t)
                .map(|ids| ids.iter().collect())
                .unwrap_or_default(),
            None => inner.active.iter().collect(),
        };
        let mut facts: Vec<StoredFact> = uuids
            .into_iter()
            .filter_map(|uuid| inner.facts.get(uuid))
            .filter(|f| !f.retracted)
            .filter(|f| pattern.map_or(true, |p| f.matches_pattern(p)))
            .cloned()
            .collect();
        facts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        Ok(facts)
    }

    fn query_facts(&self, predicate: &dyn Fn(&StoredFact) -> bool) -> Result<Vec<StoredFact>> {
        let inner = self.read()?;
        let mut facts: Vec<StoredFact> = inner
            .active
            .iter()
            .filter_map(|uuid| inner.facts.get(uuid))
            .filter(|f| predicate(f))
            .cloned()
            .collect();
        facts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        Ok(facts)
    }

    fn clear_session(&self, session_id: &str) -> Result<Vec<StoredFact>> {
        let mut inner = self.write()?;
        let uuids: Vec<String> = inner
            .by_session
            .get(session_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut cleared = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            let snapshot = inner.facts.get(&uuid).filter(|f| !f.retracted).cloned();
            if let Some(fact) = snapshot {
                tombstone(&mut inner, &uuid);
                cleared.push(fact);
            }
        }
        Ok(cleared)
    }

    fn vacuum(&self) -> Result<usize> {
        let mut inner = self.write()?;
        let horizon = Utc::now() - self.config.tombstone_retention;
        let expired: Vec<String> = inner
            .all
            .iter()
            .filter(|uuid| {
                inner
                    .facts
                    .get(*uuid)
                    .and_then(|f| f.retracted_at)
                    .is_some_and(|at| at < horizon)
            })
            .cloned()
            .collect();
        for uuid in &expired {
            inner.facts.remove(uuid);
            inner.all.remove(uuid);
        }
        log::info!("vacuum compacted {} tombstoned facts", expired.len());
        Ok(expired.len())
    }

    fn register_knowledge_source(
        &self,
        name: &str,
        description: &str,
        topics: &[String],
    ) -> Result<()> {
        let mut inner = self.write()?;
        let registered_at = inner
            .knowledge_sources
            .get(name)
            .map(|ks| ks.registered_at)
            .unwrap_or_else(Utc::now);
        inner.knowledge_sources.insert(
            name.to_string(),
            KnowledgeSource {
                name: name.to_string(),
                description: description.to_string(),
                topics: topics.to_vec(),
                active: true,
                registered_at,
            },
        );
        Ok(())
    }

    fn knowledge_sources(&self) -> Result<Vec<KnowledgeSource>> {
        let inner = self.read()?;
        let mut sources: Vec<KnowledgeSource> =
            inner.knowledge_sources.values().cloned().collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    fn record_fact_change(&self, change: &FactChange) -> Result<()> {
        let mut inner = self.write()?;
        push_capped(
            &mut inner.history_all,
            change.clone(),
            self.config.audit_cap_global,
        );
        let scoped = inner
            .history_by_fact
            .entry(change.fact_uuid.clone())
            .or_default();
        push_capped(scoped, change.clone(), self.config.audit_cap_scoped);
        Ok(())
    }

    fn record_rule_firing(&self, firing: &RuleFiring) -> Result<()> {
        let mut inner = self.write()?;
        push_capped(
            &mut inner.firings_all,
            firing.clone(),
            self.config.audit_cap_global,
        );
        let scoped = inner
            .firings_by_rule
            .entry(firing.rule_name.clone())
            .or_default();
        push_capped(scoped, firing.clone(), self.config.audit_cap_scoped);
        Ok(())
    }

    fn fact_history(&self, uuid: Option<&str>, limit: usize) -> Result<Vec<FactChange>> {
        let inner = self.read()?;
        let list = match uuid {
            Some(uuid) => inner.history_by_fact.get(uuid),
            None => Some(&inner.history_all),
        };
        Ok(list
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn rule_firings(&self, rule: Option<&str>, limit: usize) -> Result<Vec<RuleFiring>> {
        let inner = self.read()?;
        let list = match rule {
            Some(rule) => inner.firings_by_rule.get(rule),
            None => Some(&inner.firings_all),
        };
        Ok(list
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn post_message(
        &self,
        sender: &str,
        topic: &str,
        content: &Value,
        priority: i64,
    ) -> Result<i64> {
        let mut inner = self.write()?;
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let posted_at = Utc::now();
        inner.messages.insert(
            id,
            Message {
                id,
                sender: sender.to_string(),
                topic: topic.to_string(),
                content: content.clone(),
                priority,
                posted_at,
                consumed: false,
                consumed_by: None,
                consumed_at: None,
            },
        );
        inner
            .queues
            .entry(topic.to_string())
            .or_default()
            .insert((queue_score(priority, posted_at), id), id);
        inner.total_messages += 1;
        Ok(id)
    }

    fn consume_message(&self, topic: &str, consumer: &str) -> Result<Option<Message>> {
        let mut inner = self.write()?;
        let Some(queue) = inner.queues.get_mut(topic) else {
            return Ok(None);
        };
        let Some((&key, &id)) = queue.iter().next() else {
            return Ok(None);
        };
        queue.remove(&key);
        let message = inner
            .messages
            .get_mut(&id)
            .expect("queued id must have a message record");
        message.consumed = true;
        message.consumed_by = Some(consumer.to_string());
        message.consumed_at = Some(Utc::now());
        Ok(Some(message.clone()))
    }

    fn peek_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>> {
        let inner = self.read()?;
        Ok(inner
            .queues
            .get(topic)
            .map(|queue| {
                queue
                    .values()
                    .take(limit)
                    .filter_map(|id| inner.messages.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn message_stats(&self) -> Result<MessageStats> {
        let inner = self.read()?;
        Ok(MessageStats {
            total_posted: inner.total_messages,
            unconsumed: inner.queues.values().map(|q| q.len()).sum(),
        })
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = self.read()?;
        Ok(StoreStats {
            total_facts: inner.all.len(),
            active_facts: inner.active.len(),
            knowledge_sources: inner.knowledge_sources.len(),
            fact_history_entries: inner.history_all.len(),
            rule_firings: inner.firings_all.len(),
            queued_messages: inner.queues.values().map(|q| q.len()).sum(),
            total_messages: inner.total_messages,
        })
    }

    // Mutations here are already atomic under the write lock; the
    // transaction scope is passive.
    fn begin(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    fn commit(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    fn rollback(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::attrs;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[test]
    fn test_add_get_remove_roundtrip() {
        let s = store();
        s.add_fact("u1", "stock", &attrs([("symbol", "AAPL")]), Some("s1"))
            .unwrap();

        let fact = s.get_fact("u1").unwrap().unwrap();
        assert_eq!(fact.fact_type, "stock");
        assert!(!fact.retracted);

        let (fact_type, attributes) = s.remove_fact("u1").unwrap();
        assert_eq!(fact_type, "stock");
        assert_eq!(attributes.get("symbol"), Some(&Value::String("AAPL".into())));

        // Tombstoned: invisible to reads, NotFound for further mutation.
        assert!(s.get_fact("u1").unwrap().is_none());
        assert!(matches!(
            s.remove_fact("u1"),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            s.update_fact("u1", &attrs([("symbol", "X")])),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let s = store();
        s.add_fact("u1", "stock", &attrs([("symbol", "AAPL")]), None)
            .unwrap();
        assert!(matches!(
            s.add_fact("u1", "stock", &attrs([("symbol", "GOOG")]), None),
            Err(EngineError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_type_and_pattern_queries() {
        let s = store();
        s.add_fact("u1", "stock", &attrs([("symbol", "AAPL")]), None)
            .unwrap();
        s.add_fact("u2", "stock", &attrs([("symbol", "GOOG")]), None)
            .unwrap();
        s.add_fact("u3", "threshold", &attrs([("symbol", "AAPL")]), None)
            .unwrap();

        assert_eq!(s.get_facts(Some("stock"), None).unwrap().len(), 2);
        assert_eq!(s.get_facts(None, None).unwrap().len(), 3);

        let aapl = s
            .get_facts(Some("stock"), Some(&attrs([("symbol", "AAPL")])))
            .unwrap();
        assert_eq!(aapl.len(), 1);
        assert_eq!(aapl[0].uuid, "u1");

        let by_predicate = s
            .query_facts(&|f| f.attributes.get("symbol") == Some(&Value::String("GOOG".into())))
            .unwrap();
        assert_eq!(by_predicate.len(), 1);
        assert_eq!(by_predicate[0].uuid, "u2");
    }

    #[test]
    fn test_clear_session() {
        let s = store();
        for i in 0..4 {
            s.add_fact(&format!("a{}", i), "stock", &attrs([("n", i as i64)]), Some("s1"))
                .unwrap();
        }
        s.add_fact("b0", "stock", &attrs([("n", 9i64)]), Some("s2"))
            .unwrap();

        let cleared = s.clear_session("s1").unwrap();
        assert_eq!(cleared.len(), 4);
        assert_eq!(s.stats().unwrap().active_facts, 1);
        assert_eq!(s.clear_session("s1").unwrap().len(), 0);
    }

    #[test]
    fn test_vacuum_respects_retention() {
        let s = MemoryStore::with_config(MemoryStoreConfig {
            tombstone_retention: Duration::zero(),
            ..Default::default()
        });
        s.add_fact("u1", "stock", &attrs([("symbol", "AAPL")]), None)
            .unwrap();
        s.remove_fact("u1").unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(s.vacuum().unwrap(), 1);
        assert_eq!(s.stats().unwrap().total_facts, 0);

        // A fresh tombstone under the default 30-day horizon survives.
        let s = store();
        s.add_fact("u2", "stock", &attrs([("symbol", "AAPL")]), None)
            .unwrap();
        s.remove_fact("u2").unwrap();
        assert_eq!(s.vacuum().unwrap(), 0);
        assert_eq!(s.stats().unwrap().total_facts, 1);
    }

    #[test]
    fn test_message_priority_and_tiebreak() {
        let s = store();
        let a = s.post_message("agent", "T", &Value::from("A"), 1).unwrap();
        let c = s.post_message("agent", "T", &Value::from("C"), 5).unwrap();
        let b = s.post_message("agent", "T", &Value::from("B"), 5).unwrap();
        assert!(a < c && c < b);

        let order: Vec<i64> = std::iter::from_fn(|| s.consume_message("T", "w").unwrap())
            .map(|m| m.id)
            .collect();
        assert_eq!(order, vec![c, b, a]);
        assert!(s.consume_message("T", "w").unwrap().is_none());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let s = store();
        s.post_message("agent", "T", &Value::from("A"), 1).unwrap();
        s.post_message("agent", "T", &Value::from("B"), 9).unwrap();

        let peeked = s.peek_messages("T", 10).unwrap();
        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0].priority, 9);
        assert_eq!(s.message_stats().unwrap().unconsumed, 2);
    }

    #[test]
    fn test_audit_caps() {
        let s = MemoryStore::with_config(MemoryStoreConfig {
            audit_cap_global: 5,
            audit_cap_scoped: 2,
            ..Default::default()
        });
        for i in 0..10 {
            s.record_fact_change(&FactChange {
                fact_uuid: "u1".into(),
                fact_type: "stock".into(),
                attributes: attrs([("n", i as i64)]),
                action: super::super::audit::AuditAction::Update,
                timestamp: Utc::now(),
                session_id: None,
            })
            .unwrap();
        }
        assert_eq!(s.fact_history(None, 100).unwrap().len(), 5);
        assert_eq!(s.fact_history(Some("u1"), 100).unwrap().len(), 2);

        // Newest first.
        let newest = &s.fact_history(Some("u1"), 1).unwrap()[0];
        assert_eq!(newest.attributes.get("n"), Some(&Value::Integer(9)));
    }

    #[test]
    fn test_close_refuses_operations() {
        let s = store();
        let shared = s.clone();
        s.close().unwrap();
        assert!(matches!(
            shared.get_fact("u1"),
            Err(EngineError::Closed)
        ));
        assert!(matches!(
            shared.post_message("a", "T", &Value::Null, 0),
            Err(EngineError::Closed)
        ));
    }

    #[test]
    fn test_knowledge_source_idempotent() {
        let s = store();
        s.register_knowledge_source("scout", "finds stocks", &["stocks".into()])
            .unwrap();
        let first = s.knowledge_sources().unwrap()[0].registered_at;
        s.register_knowledge_source("scout", "finds more stocks", &["stocks".into()])
            .unwrap();

        let sources = s.knowledge_sources().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].description, "finds more stocks");
        assert_eq!(sources[0].registered_at, first);
    }
}
