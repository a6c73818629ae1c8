//! Reabsorption controller
//!
//! Evaluated once per completed turn. Two triggers, checked in order:
//! 1. Interval: `turn % interval_turns == 0` with at least one eligible
//!    Active record.
//! 2. Usage: `usage_ratio > usage_threshold`.
//!
//! On trigger the oldest Active batch is decoded, committed as Reinjected and
//! held as a pending block until the caller takes it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::CodecError;
use crate::config::MemoryConfig;
use crate::memory::store::MemoryStore;
use crate::memory::types::{MemoryRecord, RecordId};

/// Which trigger fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Interval,
    Usage,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::Interval => write!(f, "interval"),
            TriggerReason::Usage => write!(f, "usage"),
        }
    }
}

/// Controller state per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// No pending reinjection
    Idle,
    /// A block is waiting to be merged into the next prompt
    Triggered,
}

/// Trigger thresholds, taken from [`MemoryConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReabsorptionPolicy {
    pub interval_turns: u64,
    pub usage_threshold: f64,
    pub batch_size: usize,
}

impl From<&MemoryConfig> for ReabsorptionPolicy {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            interval_turns: config.interval_turns,
            usage_threshold: config.usage_threshold,
            batch_size: config.reinject_batch_size,
        }
    }
}

/// A record that could not be decoded during reinjection
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    pub record_id: RecordId,
    pub error: CodecError,
}

/// Decoded memories to merge into the next outbound prompt, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReinjectionBlock {
    pub reason: Option<TriggerReason>,
    pub record_ids: Vec<RecordId>,
    pub texts: Vec<String>,
    /// Sum of `original_length` of the reinjected records
    pub tokens: usize,
    pub skipped: Vec<SkippedRecord>,
}

impl ReinjectionBlock {
    /// Empty block: the caller sends no extra context
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Texts joined in order, ready for prompt merging
    pub fn render(&self) -> String {
        self.texts.join("\n\n")
    }

    fn absorb(&mut self, other: ReinjectionBlock) {
        if self.reason.is_none() {
            self.reason = other.reason;
        }
        self.record_ids.extend(other.record_ids);
        self.texts.extend(other.texts);
        self.tokens += other.tokens;
        self.skipped.extend(other.skipped);
    }
}

/// Per-session reabsorption state machine
#[derive(Debug)]
pub struct ReabsorptionController {
    policy: ReabsorptionPolicy,
    state: ControllerState,
    pending: ReinjectionBlock,
    undecodable: HashSet<RecordId>,
}

impl ReabsorptionController {
    pub fn new(policy: ReabsorptionPolicy) -> Self {
        Self {
            policy,
            state: ControllerState::Idle,
            pending: ReinjectionBlock::empty(),
            undecodable: HashSet::new(),
        }
    }

    /// Seed the set of records known to fail decoding, e.g. on resume
    pub fn with_undecodable<I: IntoIterator<Item = RecordId>>(mut self, ids: I) -> Self {
        self.undecodable.extend(ids);
        self
    }

    pub fn policy(&self) -> &ReabsorptionPolicy {
        &self.policy
    }

    /// Records excluded from reinjection after a decode failure, sorted
    pub fn undecodable_ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self.undecodable.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Decide whether reinjection is due at `turn`, without side effects
    pub fn check(&self, turn: u64, store: &MemoryStore) -> Option<TriggerReason> {
        let has_eligible = !self.eligible_batch(store, 1).is_empty();
        if !has_eligible {
            return None;
        }

        let interval = self.policy.interval_turns;
        if interval > 0 && turn > 0 && turn % interval == 0 {
            return Some(TriggerReason::Interval);
        }

        if store.usage_ratio() > self.policy.usage_threshold {
            return Some(TriggerReason::Usage);
        }

        None
    }

    /// Evaluate the triggers for `turn` and, if one fires, commit the oldest
    /// batch as Reinjected and stage its decoded text.
    ///
    /// Records that fail to decode are skipped, logged and excluded from
    /// future batches; the rest of the batch still goes through.
    pub fn evaluate(&mut self, turn: u64, store: &mut MemoryStore) -> Option<TriggerReason> {
        let reason = self.check(turn, store);
        debug!(
            session = %store.session_id(),
            turn,
            usage = store.usage_ratio(),
            ?reason,
            "Reabsorb check"
        );
        let reason = reason?;

        let batch = self.eligible_batch(store, self.policy.batch_size);
        let mut block = ReinjectionBlock {
            reason: Some(reason),
            ..ReinjectionBlock::default()
        };
        let mut commit = Vec::with_capacity(batch.len());

        for record in &batch {
            match store.decode(record) {
                Ok(text) => {
                    commit.push(record.id);
                    block.texts.push(text);
                    block.tokens += record.original_length;
                }
                Err(error) => {
                    warn!(
                        session = %store.session_id(),
                        record_id = record.id,
                        "Skipping undecodable record during reinjection: {error}"
                    );
                    self.undecodable.insert(record.id);
                    block.skipped.push(SkippedRecord {
                        record_id: record.id,
                        error,
                    });
                }
            }
        }

        let moved = store.mark_reinjected(&commit);
        block.record_ids = moved.iter().map(|r| r.id).collect();

        info!(
            session = %store.session_id(),
            turn,
            %reason,
            records = block.record_ids.len(),
            tokens = block.tokens,
            skipped = block.skipped.len(),
            "Reabsorbed oldest memories"
        );

        self.pending.absorb(block);
        self.state = ControllerState::Triggered;
        Some(reason)
    }

    /// Hand the staged block to the caller and return to Idle.
    /// Returns an empty block when nothing is pending.
    pub fn take_block(&mut self) -> ReinjectionBlock {
        self.state = ControllerState::Idle;
        std::mem::take(&mut self.pending)
    }

    /// Peek at the staged block without consuming it
    pub fn pending(&self) -> &ReinjectionBlock {
        &self.pending
    }

    fn eligible_batch(&self, store: &MemoryStore, n: usize) -> Vec<MemoryRecord> {
        store.oldest_active_where(n, |r| !self.undecodable.contains(&r.id))
    }
}
