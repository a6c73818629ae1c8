//! Memory types for the Engram system
//!
//! Defines the stored record, its lifecycle state, per-session metrics and
//! the session metadata persisted alongside records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Record identifier, monotonically increasing within a session
pub type RecordId = u64;

/// Lifecycle state of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Counted against capacity, eligible for reinjection
    Active,
    /// Merged back into context at least once; still recallable
    Reinjected,
}

/// A compressed snapshot of one conversational turn.
///
/// Everything except `state` is fixed at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique within the session; creation order
    pub id: RecordId,
    /// Session this record belongs to
    pub session_id: SessionId,
    /// Codec output, only decoded on read paths
    pub encoded_payload: String,
    /// Token count of the original text
    pub original_length: usize,
    /// Byte length of the original text
    pub original_chars: usize,
    /// Byte length of `encoded_payload`
    pub encoded_length: usize,
    /// Quality score assigned at creation
    pub grade: u8,
    /// Turn counter value at creation
    pub created_at_turn: u64,
    /// Short human label, e.g. "Turn 3: how do I..."
    pub title: String,
    /// Wall clock creation time
    pub created_at: DateTime<Utc>,
    /// Active or Reinjected
    pub state: RecordState,
}

impl MemoryRecord {
    /// Total ordering key: creation turn, then id
    pub fn order_key(&self) -> (u64, RecordId) {
        (self.created_at_turn, self.id)
    }

    pub fn is_active(&self) -> bool {
        self.state == RecordState::Active
    }

    /// Original bytes per encoded byte (higher is better)
    pub fn compression_ratio(&self) -> f64 {
        if self.encoded_length == 0 {
            return 1.0;
        }
        self.original_chars as f64 / self.encoded_length as f64
    }

    /// Bytes saved by storing the payload instead of the text (may be negative
    /// for very short inputs)
    pub fn chars_saved(&self) -> i64 {
        self.original_chars as i64 - self.encoded_length as i64
    }
}

/// Why a candidate was not stored. These are normal control flow, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FilterReason {
    /// Below the minimum token length
    TooShort { tokens: usize, min: usize },
    /// Graded below the minimum grade
    LowGrade { grade: u8, min: u8 },
    /// The grader failed and the adapter is configured fail-closed
    GraderUnavailable { detail: String },
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterReason::TooShort { tokens, min } => {
                write!(f, "too short: {tokens} tokens (< {min})")
            }
            FilterReason::LowGrade { grade, min } => {
                write!(f, "low grade: {grade}/10 (< {min})")
            }
            FilterReason::GraderUnavailable { detail } => {
                write!(f, "grader unavailable: {detail}")
            }
        }
    }
}

/// Running per-session counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetrics {
    pub total_stores: u64,
    pub total_recalls: u64,
    /// Sum of original bytes minus encoded bytes over all stores
    pub total_chars_saved: i64,
    /// Sum of original bytes over all stores
    pub original_chars: u64,
    /// Sum of encoded bytes over all stores
    pub encoded_chars: u64,
    pub skipped_short: u64,
    pub skipped_low_grade: u64,
    pub skipped_unavailable: u64,
    /// Number of controller triggers that reinjected at least one record
    pub reabsorbs: u64,
    pub reinjected_records: u64,
    pub interval_triggers: u64,
    pub usage_triggers: u64,
    pub corrupt_skipped: u64,
    pub persist_failures: u64,
}

impl SessionMetrics {
    /// Cumulative expansion ratio: original bytes over encoded bytes
    pub fn expansion_ratio(&self) -> f64 {
        if self.encoded_chars == 0 {
            return 1.0;
        }
        self.original_chars as f64 / self.encoded_chars as f64
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped_short + self.skipped_low_grade + self.skipped_unavailable
    }

    pub(crate) fn record_filtered(&mut self, reason: &FilterReason) {
        match reason {
            FilterReason::TooShort { .. } => self.skipped_short += 1,
            FilterReason::LowGrade { .. } => self.skipped_low_grade += 1,
            FilterReason::GraderUnavailable { .. } => self.skipped_unavailable += 1,
        }
    }
}

/// Point-in-time view of a session's memory usage and counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub session_id: SessionId,
    pub turn_counter: u64,
    pub live_tokens: usize,
    pub capacity_tokens: usize,
    pub usage_ratio: f64,
    pub active_records: usize,
    pub total_records: usize,
    pub expansion_ratio: f64,
    pub metrics: SessionMetrics,
}

impl MetricsSnapshot {
    /// One-line human summary of the session
    pub fn summary_line(&self) -> String {
        let m = &self.metrics;
        format!(
            "Session {}: {} stores ({} skipped), {} reabsorbs, {} recalls, {:.1}x expansion, saved {} chars, usage {:.0}%",
            self.session_id.short(),
            m.total_stores,
            m.total_skipped(),
            m.reabsorbs,
            m.total_recalls,
            self.expansion_ratio,
            m.total_chars_saved,
            self.usage_ratio * 100.0,
        )
    }
}

/// Session metadata persisted next to the records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,
    pub title: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub turn_counter: u64,
    #[serde(default)]
    pub first_prompt: Option<String>,
    #[serde(default)]
    pub metrics: SessionMetrics,
    /// Records that failed to decode during reinjection; never retried
    #[serde(default)]
    pub undecodable: Vec<RecordId>,
}

/// Title given to sessions until the first stored turn renames them
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

impl SessionMeta {
    pub fn new(session_id: SessionId, title: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            title: title.unwrap_or(DEFAULT_SESSION_TITLE).to_string(),
            preview: "Welcome to chat!".to_string(),
            created_at: now,
            last_updated: now,
            turn_counter: 0,
            first_prompt: None,
            metrics: SessionMetrics::default(),
            undecodable: Vec::new(),
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title.contains(DEFAULT_SESSION_TITLE)
    }
}

/// One row of a session's history listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub record_id: RecordId,
    pub title: String,
    pub tokens: usize,
    pub grade: u8,
    pub state: RecordState,
    pub created_at_turn: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&MemoryRecord> for HistoryEntry {
    fn from(record: &MemoryRecord) -> Self {
        Self {
            record_id: record.id,
            title: record.title.clone(),
            tokens: record.original_length,
            grade: record.grade,
            state: record.state,
            created_at_turn: record.created_at_turn,
            created_at: record.created_at,
        }
    }
}
