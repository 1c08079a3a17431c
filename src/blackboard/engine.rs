//! The blackboard engine: a persistent-backed rule engine.
//!
//! Wraps the ephemeral engine with a store-backed working memory:
//! - facts get UUID identity on assert and every change goes through the
//!   store and the audit log before working memory sees it,
//! - each rule firing is logged before its action runs,
//! - rule-action effects re-enter the same audited paths,
//! - the message queue and knowledge-source registry pass through to the
//!   store.
//!
//! Several engines may share one store; each keeps its private network,
//! and fact changes made through one engine are not pushed into another
//! engine's network (synchronization is the application's concern).

use log::warn;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

use super::audit::{AuditAction, FactChange, RuleFiring};
use super::message::{Message, MessageStats};
use super::store::{KnowledgeSource, Store, StoreStats};
use crate::errors::{EngineError, Result};
use crate::rete::engine::{Engine, RunResult};
use crate::rete::network::{Firing, NetworkStats, NodeState};
use crate::rete::pattern::Pattern;
use crate::rete::rule::{Effect, Rule};
use crate::rete::working_memory::{Fact, FactId};
use crate::types::{Attributes, Value};
use chrono::Utc;

/// Engine whose working memory is backed by a persistent [`Store`]
pub struct BlackboardEngine {
    engine: Engine,
    store: Arc<dyn Store>,
    session_id: String,
    by_uuid: HashMap<String, FactId>,
    closed: bool,
}

impl BlackboardEngine {
    /// Open on a store under a fresh session id, replaying the store's
    /// active facts into the network
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        Self::with_session(store, Uuid::new_v4().to_string())
    }

    /// Open on a store under an explicit session id
    pub fn with_session(store: Arc<dyn Store>, session_id: impl Into<String>) -> Result<Self> {
        let mut engine = Engine::new();
        let mut by_uuid = HashMap::new();
        for stored in store.get_facts(None, None)? {
            let fact =
                engine.assert_fact_with_id(stored.fact_type, stored.attributes, stored.uuid.clone());
            by_uuid.insert(stored.uuid, fact.id);
        }
        Ok(Self {
            engine,
            store,
            session_id: session_id.into(),
            by_uuid,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Session id stamped on facts and audit records
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Switch the session id used for subsequent mutations
    pub fn set_session(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
    }

    /// Compile a rule into the private network
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        self.engine.add_rule(rule)
    }

    /// Assert a fact under a fresh UUID
    pub fn assert_fact(
        &mut self,
        fact_type: impl Into<String>,
        attributes: Attributes,
    ) -> Result<Rc<Fact>> {
        self.assert_fact_with_uuid(Uuid::new_v4().to_string(), fact_type, attributes)
    }

    /// Assert a fact under a caller-chosen UUID; re-asserting an existing
    /// uuid fails with `DuplicateId`
    pub fn assert_fact_with_uuid(
        &mut self,
        uuid: impl Into<String>,
        fact_type: impl Into<String>,
        attributes: Attributes,
    ) -> Result<Rc<Fact>> {
        self.ensure_open()?;
        let uuid = uuid.into();
        let fact_type = fact_type.into();
        if self.by_uuid.contains_key(&uuid) {
            return Err(EngineError::DuplicateId { id: uuid });
        }

        self.store.begin()?;
        let written = self
            .store
            .add_fact(&uuid, &fact_type, &attributes, Some(&self.session_id))
            .and_then(|_| {
                self.store.record_fact_change(&FactChange {
                    fact_uuid: uuid.clone(),
                    fact_type: fact_type.clone(),
                    attributes: attributes.clone(),
                    action: AuditAction::Assert,
                    timestamp: Utc::now(),
                    session_id: Some(self.session_id.clone()),
                })
            });
        self.finish_tx(written)?;

        let fact = self
            .engine
            .assert_fact_with_id(fact_type, attributes, uuid.clone());
        self.by_uuid.insert(uuid, fact.id);
        Ok(fact)
    }

    /// Retract a fact by UUID; the store tombstones it and the network
    /// drops its tokens
    pub fn retract_fact(&mut self, uuid: &str) -> Result<()> {
        self.ensure_open()?;
        let fact_id = *self
            .by_uuid
            .get(uuid)
            .ok_or_else(|| EngineError::NotFound { id: uuid.into() })?;

        self.store.begin()?;
        let written = self.store.remove_fact(uuid).and_then(|(fact_type, attributes)| {
            self.store.record_fact_change(&FactChange {
                fact_uuid: uuid.to_string(),
                fact_type,
                attributes,
                action: AuditAction::Retract,
                timestamp: Utc::now(),
                session_id: Some(self.session_id.clone()),
            })
        });
        self.finish_tx(written)?;

        self.engine.retract_fact(fact_id)?;
        self.by_uuid.remove(uuid);
        Ok(())
    }

    /// Replace a fact's attributes in place.
    ///
    /// The UUID identity is stable; inside the network the fact re-enters
    /// as retract plus re-assert so every dependent token is re-derived.
    pub fn update_fact(&mut self, uuid: &str, attributes: Attributes) -> Result<Rc<Fact>> {
        self.ensure_open()?;
        let fact_id = *self
            .by_uuid
            .get(uuid)
            .ok_or_else(|| EngineError::NotFound { id: uuid.into() })?;
        let fact_type = self
            .engine
            .fact(fact_id)
            .map(|f| f.fact_type.clone())
            .ok_or_else(|| EngineError::NotFound { id: uuid.into() })?;

        self.store.begin()?;
        let written = self.store.update_fact(uuid, &attributes).and_then(|_| {
            self.store.record_fact_change(&FactChange {
                fact_uuid: uuid.to_string(),
                fact_type: fact_type.clone(),
                attributes: attributes.clone(),
                action: AuditAction::Update,
                timestamp: Utc::now(),
                session_id: Some(self.session_id.clone()),
            })
        });
        self.finish_tx(written)?;

        self.engine.retract_fact(fact_id)?;
        let fact = self
            .engine
            .assert_fact_with_id(fact_type, attributes, uuid.to_string());
        self.by_uuid.insert(uuid.to_string(), fact.id);
        Ok(fact)
    }

    fn finish_tx(&self, written: Result<()>) -> Result<()> {
        match written {
            Ok(()) => self.store.commit(),
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback() {
                    warn!("rollback after store error failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Fire every eligible not-yet-fired match exactly once, logging each
    /// firing through the store before its action runs.
    ///
    /// Effects recorded by actions are applied through the same audited
    /// paths after the dispatch loop; effect failures are appended to the
    /// result's errors. Firing-log failures are best-effort and only
    /// warned about.
    pub fn run(&mut self) -> Result<RunResult> {
        self.ensure_open()?;
        let store = self.store.clone();
        let session = self.session_id.clone();
        let mut hook = |firing: &Firing| {
            let record = RuleFiring {
                rule_name: firing.rule.clone(),
                fact_uuids: firing
                    .facts
                    .iter()
                    .filter_map(|f| f.external_id.clone())
                    .collect(),
                bindings: firing.bindings.clone(),
                fired_at: Utc::now(),
                session_id: Some(session.clone()),
            };
            if let Err(err) = store.record_rule_firing(&record) {
                warn!("failed to log firing of '{}': {}", firing.rule, err);
            }
        };
        let (mut result, effects) = self.engine.run_internal(&mut hook);

        for effect in effects {
            if let Err(err) = self.apply_effect(effect) {
                warn!("rule effect failed: {}", err);
                result.errors.push(err);
            }
        }
        Ok(result)
    }

    fn apply_effect(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::Assert {
                fact_type,
                attributes,
            } => self.assert_fact(fact_type, attributes).map(|_| ()),
            Effect::Retract { id, external_id } => match external_id {
                Some(uuid) => self.retract_fact(&uuid),
                None => self.engine.retract_fact(id).map(|_| ()),
            },
            Effect::Update {
                external_id,
                attributes,
            } => self.update_fact(&external_id, attributes).map(|_| ()),
            Effect::PostMessage {
                sender,
                topic,
                content,
                priority,
            } => self
                .post_message(&sender, &topic, content, priority)
                .map(|_| ()),
        }
    }

    /// Clear the private network state; the store is untouched
    pub fn reset(&mut self) {
        self.engine.reset();
        self.by_uuid.clear();
    }

    /// Bulk-retract every fact tagged with a session, in the store and in
    /// this engine's network; returns how many facts were cleared
    pub fn clear_session(&mut self, session_id: &str) -> Result<usize> {
        self.ensure_open()?;
        self.store.begin()?;
        let written = self.store.clear_session(session_id).and_then(|facts| {
            for fact in &facts {
                self.store.record_fact_change(&FactChange {
                    fact_uuid: fact.uuid.clone(),
                    fact_type: fact.fact_type.clone(),
                    attributes: fact.attributes.clone(),
                    action: AuditAction::Retract,
                    timestamp: Utc::now(),
                    session_id: Some(session_id.to_string()),
                })?;
            }
            Ok(facts)
        });
        let cleared = match written {
            Ok(facts) => {
                self.store.commit()?;
                facts
            }
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback() {
                    warn!("rollback after store error failed: {}", rollback_err);
                }
                return Err(err);
            }
        };

        for fact in &cleared {
            if let Some(fact_id) = self.by_uuid.remove(&fact.uuid) {
                self.engine.retract_fact(fact_id)?;
            }
        }
        Ok(cleared.len())
    }

    /// Run a closure inside a store transaction; the outermost scope
    /// commits on success and rolls back on error where the backend
    /// supports it. Network state is not transactional.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        self.store.begin()?;
        match f(self) {
            Ok(value) => {
                self.store.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback() {
                    warn!("rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    // ── messaging ────────────────────────────────────────────────────────

    /// Post a message on a topic
    pub fn post_message(
        &mut self,
        sender: &str,
        topic: &str,
        content: Value,
        priority: i64,
    ) -> Result<i64> {
        self.ensure_open()?;
        self.store.post_message(sender, topic, &content, priority)
    }

    /// Take the highest-priority unconsumed message on a topic
    pub fn consume_message(&mut self, topic: &str, consumer: &str) -> Result<Option<Message>> {
        self.ensure_open()?;
        self.store.consume_message(topic, consumer)
    }

    /// Up to `limit` pending messages on a topic, unmodified
    pub fn peek_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>> {
        self.ensure_open()?;
        self.store.peek_messages(topic, limit)
    }

    /// Queue counters
    pub fn message_stats(&self) -> Result<MessageStats> {
        self.ensure_open()?;
        self.store.message_stats()
    }

    // ── store surface ────────────────────────────────────────────────────

    /// Register a collaborating agent (idempotent)
    pub fn register_knowledge_source(
        &mut self,
        name: &str,
        description: &str,
        topics: &[String],
    ) -> Result<()> {
        self.ensure_open()?;
        self.store.register_knowledge_source(name, description, topics)
    }

    /// Registered knowledge sources
    pub fn knowledge_sources(&self) -> Result<Vec<KnowledgeSource>> {
        self.ensure_open()?;
        self.store.knowledge_sources()
    }

    /// Store-wide counters
    pub fn stats(&self) -> Result<StoreStats> {
        self.ensure_open()?;
        self.store.stats()
    }

    /// Newest-first fact history, optionally scoped to one uuid
    pub fn fact_history(&self, uuid: Option<&str>, limit: usize) -> Result<Vec<FactChange>> {
        self.ensure_open()?;
        self.store.fact_history(uuid, limit)
    }

    /// Newest-first rule firings, optionally scoped to one rule
    pub fn rule_firings(&self, rule: Option<&str>, limit: usize) -> Result<Vec<RuleFiring>> {
        self.ensure_open()?;
        self.store.rule_firings(rule, limit)
    }

    /// Compact old tombstones in the store
    pub fn vacuum(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.store.vacuum()
    }

    /// Close the store; subsequent operations fail with `Closed`
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.store.close()?;
        self.closed = true;
        Ok(())
    }

    // ── introspection ────────────────────────────────────────────────────

    /// Snapshot of the facts visible to this engine's network
    pub fn facts(&self) -> Vec<Rc<Fact>> {
        self.engine.facts()
    }

    /// Look up a working-memory fact by UUID
    pub fn fact_by_uuid(&self, uuid: &str) -> Option<Rc<Fact>> {
        self.by_uuid.get(uuid).and_then(|id| self.engine.fact(*id))
    }

    /// Registered rule names in registration order
    pub fn rule_names(&self) -> Vec<String> {
        self.engine.rule_names()
    }

    /// Complete matches currently held for a rule
    pub fn match_count(&self, name: &str) -> Option<usize> {
        self.engine.match_count(name)
    }

    /// Link flags and beta sizes along a rule's chain
    pub fn rule_chain(&self, name: &str) -> Option<Vec<NodeState>> {
        self.engine.rule_chain(name)
    }

    /// Item count of the alpha memory for a pattern
    pub fn alpha_memory_len(&self, pattern: &Pattern) -> Option<usize> {
        self.engine.alpha_memory_len(pattern)
    }

    /// Network arena sizes
    pub fn network_stats(&self) -> NetworkStats {
        self.engine.network_stats()
    }
}
