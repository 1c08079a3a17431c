//! Inter-agent messages and the queue ordering they share.

use crate::types::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A queued inter-agent message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonically assigned id
    pub id: i64,
    /// Posting agent
    pub sender: String,
    /// Topic the message was posted on
    pub topic: String,
    /// Structured payload
    pub content: Value,
    /// Higher priority is consumed first
    pub priority: i64,
    /// When the message was posted
    pub posted_at: DateTime<Utc>,
    /// Whether a consumer has taken it
    pub consumed: bool,
    /// Who consumed it
    pub consumed_by: Option<String>,
    /// When it was consumed
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Counters over one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageStats {
    /// Messages ever posted
    pub total_posted: usize,
    /// Messages not yet consumed
    pub unconsumed: usize,
}

impl std::fmt::Display for MessageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "messages: {} posted, {} unconsumed",
            self.total_posted, self.unconsumed
        )
    }
}

/// Factor keeping priority dominant over post time in queue scores
const SCORE_BASE: i128 = 10_000_000_000_000;

/// Queue score: lowest score pops first, so higher priority wins and an
/// earlier post time breaks ties
pub(crate) fn queue_score(priority: i64, posted_at: DateTime<Utc>) -> i128 {
    -(priority as i128) * SCORE_BASE + posted_at.timestamp_millis() as i128
}
