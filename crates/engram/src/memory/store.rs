//! Per-session memory store
//!
//! An append-only, ordered log of encoded records plus the running usage
//! counter the reabsorption controller reads. Records are never removed while
//! the session exists; reinjection only moves them out of the counted set.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::codec::{Codec, CodecError};
use crate::config::MemoryConfig;
use crate::memory::types::{FilterReason, MemoryRecord, RecordId, RecordState, SessionMetrics};
use crate::session::SessionId;

/// Outcome of [`MemoryStore::put`]
#[derive(Debug, Clone)]
pub enum PutOutcome {
    Stored(MemoryRecord),
    Filtered(FilterReason),
}

/// Ordered collection of one session's memory records
pub struct MemoryStore {
    session_id: SessionId,
    codec: Arc<dyn Codec>,
    records: Vec<MemoryRecord>,
    next_id: RecordId,
    live_tokens: usize,
    min_grade: u8,
    capacity_tokens: usize,
    metrics: SessionMetrics,
}

impl MemoryStore {
    /// Create an empty store for a new session
    pub fn new(session_id: SessionId, codec: Arc<dyn Codec>, config: &MemoryConfig) -> Self {
        Self {
            session_id,
            codec,
            records: Vec::new(),
            next_id: 1,
            live_tokens: 0,
            min_grade: config.min_grade,
            capacity_tokens: config.capacity_tokens.max(1),
            metrics: SessionMetrics::default(),
        }
    }

    /// Rebuild a store from persisted records and metrics (session resume)
    pub fn from_records(
        session_id: SessionId,
        codec: Arc<dyn Codec>,
        config: &MemoryConfig,
        mut records: Vec<MemoryRecord>,
        metrics: SessionMetrics,
    ) -> Self {
        records.retain(|r| r.session_id == session_id);
        records.sort_by_key(MemoryRecord::order_key);

        let live_tokens = records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.original_length)
            .sum();
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;

        Self {
            session_id,
            codec,
            records,
            next_id,
            live_tokens,
            min_grade: config.min_grade,
            capacity_tokens: config.capacity_tokens.max(1),
            metrics,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Store a graded candidate.
    ///
    /// Grades strictly below the minimum are filtered. Capacity is not
    /// enforced here; overflow is corrected by the controller on the next
    /// evaluation.
    pub fn put(
        &mut self,
        text: &str,
        tokens: usize,
        grade: u8,
        turn: u64,
        title: &str,
    ) -> Result<PutOutcome, CodecError> {
        if grade < self.min_grade {
            let reason = FilterReason::LowGrade {
                grade,
                min: self.min_grade,
            };
            info!(session = %self.session_id, grade, "Skipped low-grade response: {reason}");
            self.metrics.record_filtered(&reason);
            return Ok(PutOutcome::Filtered(reason));
        }

        let encoded_payload = self.codec.encode(text)?;
        let record = MemoryRecord {
            id: self.next_id,
            session_id: self.session_id.clone(),
            encoded_length: encoded_payload.len(),
            encoded_payload,
            original_length: tokens,
            original_chars: text.len(),
            grade,
            created_at_turn: turn,
            title: title.to_string(),
            created_at: Utc::now(),
            state: RecordState::Active,
        };
        self.next_id += 1;

        self.live_tokens += record.original_length;
        self.metrics.total_stores += 1;
        self.metrics.total_chars_saved += record.chars_saved();
        self.metrics.original_chars += record.original_chars as u64;
        self.metrics.encoded_chars += record.encoded_length as u64;

        info!(
            session = %self.session_id,
            record_id = record.id,
            tokens,
            grade,
            "Stored '{}': {} chars -> {} chars ({:.1}x)",
            record.title,
            record.original_chars,
            record.encoded_length,
            record.compression_ratio()
        );

        self.records.push(record.clone());
        Ok(PutOutcome::Stored(record))
    }

    /// Sum of `original_length` over Active records
    pub fn live_tokens(&self) -> usize {
        self.live_tokens
    }

    pub fn capacity_tokens(&self) -> usize {
        self.capacity_tokens
    }

    /// Live usage over capacity, O(1)
    pub fn usage_ratio(&self) -> f64 {
        self.live_tokens as f64 / self.capacity_tokens as f64
    }

    /// Up to `n` Active records, oldest first
    pub fn oldest_active(&self, n: usize) -> Vec<MemoryRecord> {
        self.oldest_active_where(n, |_| true)
    }

    /// Up to `n` Active records accepted by `eligible`, oldest first
    pub fn oldest_active_where<F>(&self, n: usize, eligible: F) -> Vec<MemoryRecord>
    where
        F: Fn(&MemoryRecord) -> bool,
    {
        self.records
            .iter()
            .filter(|r| r.is_active() && eligible(r))
            .take(n)
            .cloned()
            .collect()
    }

    /// Move records from Active to Reinjected, releasing their usage.
    ///
    /// Idempotent: ids that are already Reinjected or unknown are ignored.
    /// Returns the records that actually transitioned.
    pub fn mark_reinjected(&mut self, ids: &[RecordId]) -> Vec<MemoryRecord> {
        let mut transitioned = Vec::new();
        for record in self.records.iter_mut() {
            if record.is_active() && ids.contains(&record.id) {
                record.state = RecordState::Reinjected;
                self.live_tokens = self.live_tokens.saturating_sub(record.original_length);
                transitioned.push(record.clone());
            }
        }

        if !transitioned.is_empty() {
            debug!(
                session = %self.session_id,
                count = transitioned.len(),
                live_tokens = self.live_tokens,
                "Marked records reinjected"
            );
        }
        transitioned
    }

    /// Every record in both states, in creation order
    pub fn all(&self) -> &[MemoryRecord] {
        &self.records
    }

    pub fn get(&self, id: RecordId) -> Option<&MemoryRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Decode a record's payload
    pub fn decode(&self, record: &MemoryRecord) -> Result<String, CodecError> {
        self.codec.decode(&record.encoded_payload)
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_active()).count()
    }

    pub fn has_active(&self) -> bool {
        self.records.iter().any(MemoryRecord::is_active)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut SessionMetrics {
        &mut self.metrics
    }
}
