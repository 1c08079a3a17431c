//! Durable transactional store on SQLite.
//!
//! Facts are soft-deleted behind a tombstone column; an SQL trigger
//! maintains `updated_at` on every mutation. All timestamps are stored as
//! RFC 3339 UTC text with millisecond precision, so lexicographic
//! comparison in SQL matches chronological order.

use super::audit::{AuditAction, FactChange, RuleFiring};
use super::message::{Message, MessageStats};
use super::store::{KnowledgeSource, Store, StoredFact, StoreStats};
use crate::errors::{EngineError, Result};
use crate::types::{Attributes, Value};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Tunables for the SQLite backend
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// How long tombstoned records survive before `vacuum` removes them
    pub tombstone_retention: Duration,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            tombstone_retention: Duration::days(30),
        }
    }
}

struct SqliteInner {
    conn: Option<Connection>,
    depth: u32,
}

/// Durable transactional backend
pub struct SqliteStore {
    inner: Mutex<SqliteInner>,
    config: SqliteStoreConfig,
}

const SCHEMA: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
CREATE TABLE IF NOT EXISTS facts (
    uuid TEXT PRIMARY KEY,
    fact_type TEXT NOT NULL,
    attributes TEXT NOT NULL,
    session_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    retracted INTEGER NOT NULL DEFAULT 0,
    retracted_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_facts_type ON facts(fact_type);
CREATE INDEX IF NOT EXISTS idx_facts_session ON facts(session_id);
CREATE INDEX IF NOT EXISTS idx_facts_retracted ON facts(retracted);
CREATE TRIGGER IF NOT EXISTS facts_touch_updated_at
AFTER UPDATE ON facts FOR EACH ROW
BEGIN
    UPDATE facts SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
    WHERE uuid = NEW.uuid;
END;
CREATE TABLE IF NOT EXISTS knowledge_sources (
    name TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    topics TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    registered_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS fact_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fact_uuid TEXT NOT NULL,
    fact_type TEXT NOT NULL,
    attributes TEXT NOT NULL,
    action TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    session_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_history_uuid ON fact_history(fact_uuid);
CREATE TABLE IF NOT EXISTS rules_fired (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_name TEXT NOT NULL,
    fact_uuids TEXT NOT NULL,
    bindings TEXT NOT NULL,
    fired_at TEXT NOT NULL,
    session_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_fired_session ON rules_fired(session_id);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    topic TEXT NOT NULL,
    content TEXT NOT NULL,
    priority INTEGER NOT NULL,
    posted_at TEXT NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0,
    consumed_by TEXT,
    consumed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages(topic);
CREATE INDEX IF NOT EXISTS idx_messages_consumed ON messages(consumed);
";

fn ts_string(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_string() -> String {
    ts_string(Utc::now())
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn map_fact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredFact> {
    let attributes_text: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let retracted_at: Option<String> = row.get(7)?;
    Ok(StoredFact {
        uuid: row.get(0)?,
        fact_type: row.get(1)?,
        attributes: parse_json(2, &attributes_text)?,
        session_id: row.get(3)?,
        created_at: parse_ts(4, &created_at)?,
        updated_at: parse_ts(5, &updated_at)?,
        retracted: row.get::<_, i64>(6)? != 0,
        retracted_at: retracted_at.as_deref().map(|s| parse_ts(7, s)).transpose()?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let content_text: String = row.get(3)?;
    let posted_at: String = row.get(5)?;
    let consumed_at: Option<String> = row.get(8)?;
    Ok(Message {
        id: row.get(0)?,
        sender: row.get(1)?,
        topic: row.get(2)?,
        content: parse_json(3, &content_text)?,
        priority: row.get(4)?,
        posted_at: parse_ts(5, &posted_at)?,
        consumed: row.get::<_, i64>(6)? != 0,
        consumed_by: row.get(7)?,
        consumed_at: consumed_at.as_deref().map(|s| parse_ts(8, s)).transpose()?,
    })
}

const FACT_COLUMNS: &str =
    "uuid, fact_type, attributes, session_id, created_at, updated_at, retracted, retracted_at";
const MESSAGE_COLUMNS: &str =
    "id, sender, topic, content, priority, posted_at, consumed, consumed_by, consumed_at";

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, SqliteStoreConfig::default())
    }

    /// Open with explicit tunables
    pub fn open_with_config(path: impl AsRef<Path>, config: SqliteStoreConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        log::info!("opened sqlite store at {}", path.display());
        Ok(Self {
            inner: Mutex::new(SqliteInner {
                conn: Some(conn),
                depth: 0,
            }),
            config,
        })
    }

    /// Open a private in-memory database (handy for a hybrid audit side
    /// that does not need to survive the process)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Mutex::new(SqliteInner {
                conn: Some(conn),
                depth: 0,
            }),
            config: SqliteStoreConfig::default(),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let inner = self.inner.lock().unwrap();
        let conn = inner.conn.as_ref().ok_or(EngineError::Closed)?;
        f(conn)
    }
}

impl Store for SqliteStore {
    fn add_fact(
        &self,
        uuid: &str,
        fact_type: &str,
        attributes: &Attributes,
        session_id: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let now = now_string();
            let result = conn.execute(
                "INSERT INTO facts (uuid, fact_type, attributes, session_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    uuid,
                    fact_type,
                    serde_json::to_string(attributes)?,
                    session_id,
                    now,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(EngineError::DuplicateId { id: uuid.into() })
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    fn remove_fact(&self, uuid: &str) -> Result<(String, Attributes)> {
        self.with_conn(|conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT fact_type, attributes FROM facts WHERE uuid = ?1 AND retracted = 0",
                    params![uuid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (fact_type, attributes_text) =
                row.ok_or_else(|| EngineError::NotFound { id: uuid.into() })?;
            conn.execute(
                "UPDATE facts SET retracted = 1, retracted_at = ?2 WHERE uuid = ?1",
                params![uuid, now_string()],
            )?;
            Ok((fact_type, serde_json::from_str(&attributes_text)?))
        })
    }

    fn update_fact(&self, uuid: &str, attributes: &Attributes) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE facts SET attributes = ?2 WHERE uuid = ?1 AND retracted = 0",
                params![uuid, serde_json::to_string(attributes)?],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound { id: uuid.into() });
            }
            Ok(())
        })
    }

    fn get_fact(&self, uuid: &str) -> Result<Option<StoredFact>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM facts WHERE uuid = ?1 AND retracted = 0",
                        FACT_COLUMNS
                    ),
                    params![uuid],
                    map_fact_row,
                )
                .optional()?)
        })
    }

    fn get_facts(
        &self,
        fact_type: Option<&str>,
        pattern: Option<&Attributes>,
    ) -> Result<Vec<StoredFact>> {
        self.with_conn(|conn| {
            let mut facts = Vec::new();
            match fact_type {
                Some(t) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM facts WHERE retracted = 0 AND fact_type = ?1
                         ORDER BY created_at, uuid",
                        FACT_COLUMNS
                    ))?;
                    for row in stmt.query_map(params![t], map_fact_row)? {
                        facts.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM facts WHERE retracted = 0 ORDER BY created_at, uuid",
                        FACT_COLUMNS
                    ))?;
                    for row in stmt.query_map([], map_fact_row)? {
                        facts.push(row?);
                    }
                }
            }
            if let Some(pattern) = pattern {
                facts.retain(|f| f.matches_pattern(pattern));
            }
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
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM facts WHERE retracted = 0 AND session_id = ?1
                 ORDER BY created_at, uuid",
                FACT_COLUMNS
            ))?;
            let mut cleared = Vec::new();
            for row in stmt.query_map(params![session_id], map_fact_row)? {
                cleared.push(row?);
            }
            conn.execute(
                "UPDATE facts SET retracted = 1, retracted_at = ?2
                 WHERE retracted = 0 AND session_id = ?1",
                params![session_id, now_string()],
            )?;
            Ok(cleared)
        })
    }

    fn vacuum(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let cutoff = ts_string(Utc::now() - self.config.tombstone_retention);
            let removed = conn.execute(
                "DELETE FROM facts WHERE retracted = 1 AND retracted_at < ?1",
                params![cutoff],
            )?;
            log::info!("vacuum compacted {} tombstoned facts", removed);
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
            conn.execute(
                "INSERT INTO knowledge_sources (name, description, topics, active, registered_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                     description = excluded.description,
                     topics = excluded.topics,
                     active = 1",
                params![name, description, serde_json::to_string(topics)?, now_string()],
            )?;
            Ok(())
        })
    }

    fn knowledge_sources(&self) -> Result<Vec<KnowledgeSource>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, description, topics, active, registered_at
                 FROM knowledge_sources ORDER BY name",
            )?;
            let mut sources = Vec::new();
            for row in stmt.query_map([], |row| {
                let topics_text: String = row.get(2)?;
                let registered_at: String = row.get(4)?;
                Ok(KnowledgeSource {
                    name: row.get(0)?,
                    description: row.get(1)?,
                    topics: parse_json(2, &topics_text)?,
                    active: row.get::<_, i64>(3)? != 0,
                    registered_at: parse_ts(4, &registered_at)?,
                })
            })? {
                sources.push(row?);
            }
            Ok(sources)
        })
    }

    fn record_fact_change(&self, change: &FactChange) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fact_history (fact_uuid, fact_type, attributes, action, timestamp, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    change.fact_uuid,
                    change.fact_type,
                    serde_json::to_string(&change.attributes)?,
                    change.action.as_str(),
                    ts_string(change.timestamp),
                    change.session_id,
                ],
            )?;
            Ok(())
        })
    }

    fn record_rule_firing(&self, firing: &RuleFiring) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rules_fired (rule_name, fact_uuids, bindings, fired_at, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    firing.rule_name,
                    serde_json::to_string(&firing.fact_uuids)?,
                    serde_json::to_string(&firing.bindings)?,
                    ts_string(firing.fired_at),
                    firing.session_id,
                ],
            )?;
            Ok(())
        })
    }

    fn fact_history(&self, uuid: Option<&str>, limit: usize) -> Result<Vec<FactChange>> {
        self.with_conn(|conn| {
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<FactChange> {
                let attributes_text: String = row.get(2)?;
                let action_text: String = row.get(3)?;
                let timestamp: String = row.get(4)?;
                Ok(FactChange {
                    fact_uuid: row.get(0)?,
                    fact_type: row.get(1)?,
                    attributes: parse_json(2, &attributes_text)?,
                    action: AuditAction::parse(&action_text).unwrap_or(AuditAction::Assert),
                    timestamp: parse_ts(4, &timestamp)?,
                    session_id: row.get(5)?,
                })
            };
            let mut changes = Vec::new();
            match uuid {
                Some(uuid) => {
                    let mut stmt = conn.prepare(
                        "SELECT fact_uuid, fact_type, attributes, action, timestamp, session_id
                         FROM fact_history WHERE fact_uuid = ?1 ORDER BY id DESC LIMIT ?2",
                    )?;
                    for row in stmt.query_map(params![uuid, limit as i64], map_row)? {
                        changes.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT fact_uuid, fact_type, attributes, action, timestamp, session_id
                         FROM fact_history ORDER BY id DESC LIMIT ?1",
                    )?;
                    for row in stmt.query_map(params![limit as i64], map_row)? {
                        changes.push(row?);
                    }
                }
            }
            Ok(changes)
        })
    }

    fn rule_firings(&self, rule: Option<&str>, limit: usize) -> Result<Vec<RuleFiring>> {
        self.with_conn(|conn| {
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RuleFiring> {
                let uuids_text: String = row.get(1)?;
                let bindings_text: String = row.get(2)?;
                let fired_at: String = row.get(3)?;
                let bindings: HashMap<String, Value> = parse_json(2, &bindings_text)?;
                Ok(RuleFiring {
                    rule_name: row.get(0)?,
                    fact_uuids: parse_json(1, &uuids_text)?,
                    bindings,
                    fired_at: parse_ts(3, &fired_at)?,
                    session_id: row.get(4)?,
                })
            };
            let mut firings = Vec::new();
            match rule {
                Some(rule) => {
                    let mut stmt = conn.prepare(
                        "SELECT rule_name, fact_uuids, bindings, fired_at, session_id
                         FROM rules_fired WHERE rule_name = ?1 ORDER BY id DESC LIMIT ?2",
                    )?;
                    for row in stmt.query_map(params![rule, limit as i64], map_row)? {
                        firings.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT rule_name, fact_uuids, bindings, fired_at, session_id
                         FROM rules_fired ORDER BY id DESC LIMIT ?1",
                    )?;
                    for row in stmt.query_map(params![limit as i64], map_row)? {
                        firings.push(row?);
                    }
                }
            }
            Ok(firings)
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
            conn.execute(
                "INSERT INTO messages (sender, topic, content, priority, posted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    sender,
                    topic,
                    serde_json::to_string(content)?,
                    priority,
                    now_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn consume_message(&self, topic: &str, consumer: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM messages WHERE topic = ?1 AND consumed = 0
                     ORDER BY priority DESC, posted_at ASC, id ASC LIMIT 1",
                    params![topic],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = id else {
                return Ok(None);
            };
            conn.execute(
                "UPDATE messages SET consumed = 1, consumed_by = ?2, consumed_at = ?3
                 WHERE id = ?1",
                params![id, consumer, now_string()],
            )?;
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                    params![id],
                    map_message_row,
                )
                .optional()?)
        })
    }

    fn peek_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE topic = ?1 AND consumed = 0
                 ORDER BY priority DESC, posted_at ASC, id ASC LIMIT ?2",
                MESSAGE_COLUMNS
            ))?;
            let mut messages = Vec::new();
            for row in stmt.query_map(params![topic, limit as i64], map_message_row)? {
                messages.push(row?);
            }
            Ok(messages)
        })
    }

    fn message_stats(&self) -> Result<MessageStats> {
        self.with_conn(|conn| {
            let (total, unconsumed): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(consumed = 0), 0) FROM messages",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(MessageStats {
                total_posted: total as usize,
                unconsumed: unconsumed as usize,
            })
        })
    }

    fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<usize> {
                Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as usize)
            };
            let messages = message_counts(conn)?;
            Ok(StoreStats {
                total_facts: count("SELECT COUNT(*) FROM facts")?,
                active_facts: count("SELECT COUNT(*) FROM facts WHERE retracted = 0")?,
                knowledge_sources: count("SELECT COUNT(*) FROM knowledge_sources")?,
                fact_history_entries: count("SELECT COUNT(*) FROM fact_history")?,
                rule_firings: count("SELECT COUNT(*) FROM rules_fired")?,
                queued_messages: messages.1,
                total_messages: messages.0,
            })
        })
    }

    fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let conn = inner.conn.as_ref().ok_or(EngineError::Closed)?;
        if inner.depth == 0 {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        inner.depth += 1;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.conn.is_none() {
            return Err(EngineError::Closed);
        }
        if inner.depth > 0 {
            inner.depth -= 1;
            if inner.depth == 0 {
                inner.conn.as_ref().unwrap().execute_batch("COMMIT")?;
            }
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.conn.is_none() {
            return Err(EngineError::Closed);
        }
        if inner.depth > 0 {
            inner.depth = 0;
            inner.conn.as_ref().unwrap().execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.depth = 0;
        inner.conn = None;
        Ok(())
    }
}

fn message_counts(conn: &Connection) -> Result<(usize, usize)> {
    let (total, unconsumed): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(consumed = 0), 0) FROM messages",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((total as usize, unconsumed as usize))
}
