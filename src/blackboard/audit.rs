//! Audit records: the append-only history of fact changes and firings.

use crate::types::{Attributes, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What happened to a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Fact was asserted
    Assert,
    /// Fact attributes were replaced
    Update,
    /// Fact was retracted (tombstoned in persistent stores)
    Retract,
}

impl AuditAction {
    /// Stable text form used by the persistent backends
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Assert => "assert",
            AuditAction::Update => "update",
            AuditAction::Retract => "retract",
        }
    }

    /// Parse the stable text form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assert" => Some(AuditAction::Assert),
            "update" => Some(AuditAction::Update),
            "retract" => Some(AuditAction::Retract),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-stamped snapshot of one fact mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactChange {
    /// UUID of the affected fact
    pub fact_uuid: String,
    /// Type at the time of the change
    pub fact_type: String,
    /// Attribute snapshot at the time of the change
    pub attributes: Attributes,
    /// Which mutation happened
    pub action: AuditAction,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Session the mutation was issued under
    pub session_id: Option<String>,
}

/// Time-stamped record of one rule firing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFiring {
    /// Rule that fired
    pub rule_name: String,
    /// UUIDs of the supporting facts
    pub fact_uuids: Vec<String>,
    /// Variable bindings observed at firing time
    pub bindings: HashMap<String, Value>,
    /// When the rule fired
    pub fired_at: DateTime<Utc>,
    /// Session the run was issued under
    pub session_id: Option<String>,
}
