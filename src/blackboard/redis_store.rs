//! Redis-backed store (feature `redis-store`).
//!
//! The distributed rendition of the in-memory layout, shareable across
//! processes:
//! - `fact:{uuid}` JSON records with `facts:active`, `facts:type:{T}`,
//!   `facts:session:{S}` and `facts:all` index sets
//! - `ks:{name}` records plus the `knowledge_sources:active` set
//! - `message:{id}` records; `messages:{topic}` sorted sets scored by
//!   `-priority * BIG + posted-at-millis` so the lowest score pops first;
//!   ids from the backend's atomic `INCR`
//! - newest-first audit lists `fact_history:all`, `fact_history:{uuid}`,
//!   `rules_fired:all`, `rules_fired:{rule}`, trimmed to the configured
//!   caps
//!
//! All keys are namespaced by a configurable prefix. Transactions are a
//! passive scope; each operation is individually atomic on the server.

use super::audit::{FactChange, RuleFiring};
use super::message::{Message, MessageStats};
use super::store::{KnowledgeSource, Store, StoredFact, StoreStats};
use crate::errors::{EngineError, Result};
use crate::types::{Attributes, Value};
use chrono::{Duration, Utc};
use redis::{Client, Commands, Connection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Tunables for the Redis backend
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Key prefix for namespacing
    pub key_prefix: String,
    /// How long tombstoned records survive before `vacuum` removes them
    pub tombstone_retention: Duration,
    /// Cap on the global audit lists
    pub audit_cap_global: usize,
    /// Cap on the per-fact and per-rule audit lists
    pub audit_cap_scoped: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "blackboard".into(),
            tombstone_retention: Duration::days(30),
            audit_cap_global: 10_000,
            audit_cap_scoped: 1_000,
        }
    }
}

/// Distributed store on a shared Redis server
pub struct RedisStore {
    conn: Mutex<Connection>,
    config: RedisStoreConfig,
    closed: AtomicBool,
}

const SCORE_BASE: f64 = 10_000_000_000_000.0;

impl RedisStore {
    /// Connect with the default prefix and caps
    pub fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default())
    }

    /// Connect with explicit tunables
    pub fn connect_with_config(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
            closed: AtomicBool::new(false),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.config.key_prefix, suffix)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }

    fn load_fact(&self, conn: &mut Connection, uuid: &str) -> Result<Option<StoredFact>> {
        let json: Option<String> = conn.get(self.key(&format!("fact:{}", uuid)))?;
        json.map(|j| serde_json::from_str(&j).map_err(Into::into))
            .transpose()
    }

    fn save_fact(&self, conn: &mut Connection, fact: &StoredFact) -> Result<()> {
        let json = serde_json::to_string(fact)?;
        let _: () = conn.set(self.key(&format!("fact:{}", fact.uuid)), json)?;
        Ok(())
    }

    fn push_audit<T: serde::Serialize>(
        &self,
        conn: &mut Connection,
        global_key: String,
        scoped_key: String,
        entry: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let _: () = conn.lpush(&global_key, &json)?;
        let _: () = conn.ltrim(&global_key, 0, self.config.audit_cap_global as isize - 1)?;
        let _: () = conn.lpush(&scoped_key, &json)?;
        let _: () = conn.ltrim(&scoped_key, 0, self.config.audit_cap_scoped as isize - 1)?;
        Ok(())
    }

    fn read_audit<T: serde::de::DeserializeOwned>(
        &self,
        conn: &mut Connection,
        key: String,
        limit: usize,
    ) -> Result<Vec<T>> {
        let entries: Vec<String> = conn.lrange(key, 0, limit as isize - 1)?;
        entries
            .iter()
            .map(|j| serde_json::from_str(j).map_err(Into::into))
            .collect()
    }

    fn tombstone(&self, conn: &mut Connection, uuid: &str) -> Result<Option<StoredFact>> {
        let Some(mut fact) = self.load_fact(conn, uuid)? else {
            return Ok(None);
        };
        if fact.retracted {
            return Ok(None);
        }
        fact.retracted = true;
        fact.retracted_at = Some(Utc::now());
        fact.updated_at = Utc::now();
        self.save_fact(conn, &fact)?;

        let _: () = conn.srem(self.key("facts:active"), uuid)?;
        let _: () = conn.srem(self.key(&format!("facts:type:{}", fact.fact_type)), uuid)?;
        if let Some(session) = &fact.session_id {
            let _: () = conn.srem(self.key(&format!("facts:session:{}", session)), uuid)?;
        }
        Ok(Some(fact))
    }
}

impl Store for RedisStore {
    fn add_fact(
        &self,
        uuid: &str,
        fact_type: &str,
        attributes: &Attributes,
        session_id: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let exists: bool = conn.exists(self.key(&format!("fact:{}", uuid)))?;
            if exists {
                return Err(EngineError::DuplicateId { id: uuid.into() });
            }
            let now = Utc::now();
            let fact = StoredFact {
                uuid: uuid.to_string(),
                fact_type: fact_type.to_string(),
                attributes: attributes.clone(),
                session_id: session_id.map(str::to_string),
                created_at: now,
                updated_at: now,
                retracted: false,
                retracted_at: None,
            };
            self.save_fact(conn, &fact)?;
            let _: () = conn.sadd(self.key("facts:active"), uuid)?;
            let _: () = conn.sadd(self.key("facts:all"), uuid)?;
            let _: () = conn.sadd(self.key(&format!("facts:type:{}", fact_type)), uuid)?;
            if let Some(session) = session_id {
                let _: () = conn.sadd(self.key(&format!("facts:session:{}", session)), uuid)?;
            }
            Ok(())
        })
    }

    fn remove_fact(&self, uuid: &str) -> Result<(String, Attributes)> {
        self.with_conn(|conn| {
            self.tombstone(conn, uuid)?
                .map(|f| (f.fact_type, f.attributes))
                .ok_or_else(|| EngineError::NotFound { id: uuid.into() })
        })
    }

    fn update_fact(&self, uuid: &str, attributes: &Attributes) -> Result<()> {
        self.with_conn(|conn| {
            let mut fact = self
                .load_fact(conn, uuid)?
                .filter(|f| !f.retracted)
                .ok_or_else(|| EngineError::NotFound { id: uuid.into() })?;
            fact.attributes = attributes.clone();
            fact.updated_at = Utc::now();
            self.save_fact(conn, &fact)
        })
    }

    fn get_fact(&self, uuid: &str) -> Result<Option<StoredFact>> {
        self.with_conn(|conn| Ok(self.load_fact(conn, uuid)?.filter(|f| !f.retracted)))
    }

    fn get_facts(
        &self,
        fact_type: Option<&str>,
        pattern: Option<&Attributes>,
    ) -> Result<Vec<StoredFact>> {
        self.with_conn(|conn| {
            let set = match fact_type {
                Some(t) => self.key(&format!("facts:type:{}", t)),
                None => self.key("facts:active"),
            };
            let uuids: Vec<String> = conn.smembers(set)?;
            let mut facts = Vec::with_capacity(uuids.len());
            for uuid in uuids {
                if let Some(fact) = self.load_fact(conn, &uuid)?.filter(|f| !f.retracted) {
                    if pattern.map_or(true, |p| fact.matches_pattern(p)) {
                        facts.push(fact);
                    }
                }
            }
            facts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
            Ok(facts)
        })
    }

    fn query_facts(&self, predicate: &dyn Fn(&StoredFact) -> bool) -> Result<Vec<StoredFact>> {
        let mut facts = self.get_facts(None, None)?;
        facts.retain(|f| predicate(f));
        Ok(facts)
    }

    fn clear_session(&self, session_id: &str) -> Result<Vec<StoredFact>> {
        self.with_conn(|conn| {
            let uuids: Vec<String> =
                conn.smembers(self.key(&format!("facts:session:{}", session_id)))?;
            let mut cleared = Vec::with_capacity(uuids.len());
            for uuid in uuids {
                if let Some(fact) = self.tombstone(conn, &uuid)? {
                    cleared.push(fact);
                }
            }
            Ok(cleared)
        })
    }

    fn vacuum(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let horizon = Utc::now() - self.config.tombstone_retention;
            let uuids: Vec<String> = conn.smembers(self.key("facts:all"))?;
            let mut removed = 0;
            for uuid in uuids {
                let expired = self
                    .load_fact(conn, &uuid)?
                    .and_then(|f| f.retracted_at)
                    .is_some_and(|at| at < horizon);
                if expired {
                    let _: () = conn.del(self.key(&format!("fact:{}", uuid)))?;
                    let _: () = conn.srem(self.key("facts:all"), &uuid)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn register_knowledge_source(
        &self,
        name: &str,
        description: &str,
        topics: &[String],
    ) -> Result<()> {
        self.with_conn(|conn| {
            let key = self.key(&format!("ks:{}", name));
            let existing: Option<String> = conn.get(&key)?;
            let registered_at = existing
                .as_deref()
                .and_then(|j| serde_json::from_str::<KnowledgeSource>(j).ok())
                .map(|ks| ks.registered_at)
                .unwrap_or_else(Utc::now);
            let source = KnowledgeSource {
                name: name.to_string(),
                description: description.to_string(),
                topics: topics.to_vec(),
                active: true,
                registered_at,
            };
            let _: () = conn.set(&key, serde_json::to_string(&source)?)?;
            let _: () = conn.sadd(self.key("knowledge_sources:active"), name)?;
            Ok(())
        })
    }

    fn knowledge_sources(&self) -> Result<Vec<KnowledgeSource>> {
        self.with_conn(|conn| {
            let names: Vec<String> = conn.smembers(self.key("knowledge_sources:active"))?;
            let mut sources = Vec::with_capacity(names.len());
            for name in names {
                let json: Option<String> = conn.get(self.key(&format!("ks:{}", name)))?;
                if let Some(json) = json {
                    sources.push(serde_json::from_str(&json)?);
                }
            }
            sources.sort_by(|a: &KnowledgeSource, b: &KnowledgeSource| a.name.cmp(&b.name));
            Ok(sources)
        })
    }

    fn record_fact_change(&self, change: &FactChange) -> Result<()> {
        self.with_conn(|conn| {
            self.push_audit(
                conn,
                self.key("fact_history:all"),
                self.key(&format!("fact_history:{}", change.fact_uuid)),
                change,
            )
        })
    }

    fn record_rule_firing(&self, firing: &RuleFiring) -> Result<()> {
        self.with_conn(|conn| {
            self.push_audit(
                conn,
                self.key("rules_fired:all"),
                self.key(&format!("rules_fired:{}", firing.rule_name)),
                firing,
            )
        })
    }

    fn fact_history(&self, uuid: Option<&str>, limit: usize) -> Result<Vec<FactChange>> {
        self.with_conn(|conn| {
            let key = match uuid {
                Some(uuid) => self.key(&format!("fact_history:{}", uuid)),
                None => self.key("fact_history:all"),
            };
            self.read_audit(conn, key, limit)
        })
    }

    fn rule_firings(&self, rule: Option<&str>, limit: usize) -> Result<Vec<RuleFiring>> {
        self.with_conn(|conn| {
            let key = match rule {
                Some(rule) => self.key(&format!("rules_fired:{}", rule)),
                None => self.key("rules_fired:all"),
            };
            self.read_audit(conn, key, limit)
        })
    }

    fn post_message(
        &self,
        sender: &str,
        topic: &str,
        content: &Value,
        priority: i64,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            let id: i64 = conn.incr(self.key("message:id"), 1)?;
            let posted_at = Utc::now();
            let message = Message {
                id,
                sender: sender.to_string(),
                topic: topic.to_string(),
                content: content.clone(),
                priority,
                posted_at,
                consumed: false,
                consumed_by: None,
                consumed_at: None,
            };
            let _: () = conn.set(
                self.key(&format!("message:{}", id)),
                serde_json::to_string(&message)?,
            )?;
            let score =
                -(priority as f64) * SCORE_BASE + posted_at.timestamp_millis() as f64;
            let _: () = conn.zadd(self.key(&format!("messages:{}", topic)), id, score)?;
            let _: () = conn.sadd(self.key("messages:topics"), topic)?;
            Ok(id)
        })
    }

    fn consume_message(&self, topic: &str, consumer: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            // ZPOPMIN is atomic on the server, so concurrent consumers
            // never take the same message.
            let popped: Vec<(String, f64)> =
                conn.zpopmin(self.key(&format!("messages:{}", topic)), 1)?;
            let Some((member, _)) = popped.into_iter().next() else {
                return Ok(None);
            };
            let id: i64 = member.parse().map_err(|_| EngineError::Serialization {
                message: format!("malformed queue member: {}", member),
            })?;
            let json: Option<String> = conn.get(self.key(&format!("message:{}", id)))?;
            let Some(json) = json else {
                return Ok(None);
            };
            let mut message: Message = serde_json::from_str(&json)?;
            message.consumed = true;
            message.consumed_by = Some(consumer.to_string());
            message.consumed_at = Some(Utc::now());
            let _: () = conn.set(
                self.key(&format!("message:{}", id)),
                serde_json::to_string(&message)?,
            )?;
            Ok(Some(message))
        })
    }

    fn peek_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let ids: Vec<String> = conn.zrange(
                self.key(&format!("messages:{}", topic)),
                0,
                limit as isize - 1,
            )?;
            let mut messages = Vec::with_capacity(ids.len());
            for id in ids {
                let json: Option<String> = conn.get(self.key(&format!("message:{}", id)))?;
                if let Some(json) = json {
                    messages.push(serde_json::from_str(&json)?);
                }
            }
            Ok(messages)
        })
    }

    fn message_stats(&self) -> Result<MessageStats> {
        self.with_conn(|conn| {
            let total: Option<i64> = conn.get(self.key("message:id"))?;
            let topics: Vec<String> = conn.smembers(self.key("messages:topics"))?;
            let mut unconsumed = 0usize;
            for topic in topics {
                let n: usize = conn.zcard(self.key(&format!("messages:{}", topic)))?;
                unconsumed += n;
            }
            Ok(MessageStats {
                total_posted: total.unwrap_or(0) as usize,
                unconsumed,
            })
        })
    }

    fn stats(&self) -> Result<StoreStats> {
        let messages = self.message_stats()?;
        self.with_conn(|conn| {
            let active: usize = conn.scard(self.key("facts:active"))?;
            let total: usize = conn.scard(self.key("facts:all"))?;
            let sources: usize = conn.scard(self.key("knowledge_sources:active"))?;
            let history: usize = conn.llen(self.key("fact_history:all"))?;
            let firings: usize = conn.llen(self.key("rules_fired:all"))?;
            Ok(StoreStats {
                total_facts: total,
                active_facts: active,
                knowledge_sources: sources,
                fact_history_entries: history,
                rule_firings: firings,
                queued_messages: messages.unconsumed,
                total_messages: messages.total_posted,
            })
        })
    }

    // Each operation is individually atomic on the server; the transaction
    // scope is passive.
    fn begin(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
