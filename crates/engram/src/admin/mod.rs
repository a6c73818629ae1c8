//! Admin module for monitoring
//!
//! Provides the event stream emitted by the memory manager and the DTOs
//! served to admin clients (SSE subscribers, the CLI, dashboards).

pub mod handlers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::reabsorption::TriggerReason;
use crate::memory::types::{FilterReason, MetricsSnapshot, RecordId, SessionMeta};

/// Events emitted by the memory manager for real-time monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryEvent {
    /// A fresh session was registered
    SessionStarted {
        session_id: String,
        title: String,
        timestamp: DateTime<Utc>,
    },
    /// A persisted session was loaded back into the registry
    SessionResumed {
        session_id: String,
        records: usize,
        turn_counter: u64,
    },
    /// A response passed filtering and was stored
    MemoryStored {
        session_id: String,
        record_id: RecordId,
        turn: u64,
        tokens: usize,
        grade: u8,
        encoded_length: usize,
        compression_ratio: f64,
    },
    /// A response was not stored
    MemoryFiltered {
        session_id: String,
        turn: u64,
        reason: FilterReason,
    },
    /// The controller moved records back into context
    Reinjected {
        session_id: String,
        turn: u64,
        trigger: TriggerReason,
        record_ids: Vec<RecordId>,
        tokens: usize,
        usage_ratio: f64,
    },
    /// A record could not be decoded during reinjection
    RecordSkipped {
        session_id: String,
        record_id: RecordId,
        error: String,
    },
    /// A recall query was answered
    Recalled {
        session_id: String,
        query: String,
        record_ids: Vec<RecordId>,
    },
    /// A session was removed from the registry
    SessionEnded {
        session_id: String,
        snapshot: MetricsSnapshot,
    },
}

impl MemoryEvent {
    /// Session the event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            MemoryEvent::SessionStarted { session_id, .. }
            | MemoryEvent::SessionResumed { session_id, .. }
            | MemoryEvent::MemoryStored { session_id, .. }
            | MemoryEvent::MemoryFiltered { session_id, .. }
            | MemoryEvent::Reinjected { session_id, .. }
            | MemoryEvent::RecordSkipped { session_id, .. }
            | MemoryEvent::Recalled { session_id, .. }
            | MemoryEvent::SessionEnded { session_id, .. } => session_id,
        }
    }
}

/// Session row for admin listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSession {
    pub session_id: String,
    pub title: String,
    pub preview: String,
    pub turn_counter: u64,
    pub total_stores: u64,
    pub total_recalls: u64,
    pub reabsorbs: u64,
    /// Currently registered with the manager
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl AdminSession {
    pub fn from_meta(meta: &SessionMeta, active: bool) -> Self {
        Self {
            session_id: meta.session_id.to_string(),
            title: meta.title.clone(),
            preview: meta.preview.clone(),
            turn_counter: meta.turn_counter,
            total_stores: meta.metrics.total_stores,
            total_recalls: meta.metrics.total_recalls,
            reabsorbs: meta.metrics.reabsorbs,
            active,
            created_at: meta.created_at,
            last_updated: meta.last_updated,
        }
    }
}

/// Aggregate statistics across all known sessions
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_stores: u64,
    pub total_recalls: u64,
    pub total_reabsorbs: u64,
    pub total_chars_saved: i64,
}

impl EngineStats {
    pub fn from_sessions(sessions: &[AdminSession], meta: &[SessionMeta]) -> Self {
        Self {
            total_sessions: sessions.len() as u64,
            active_sessions: sessions.iter().filter(|s| s.active).count() as u64,
            total_stores: meta.iter().map(|m| m.metrics.total_stores).sum(),
            total_recalls: meta.iter().map(|m| m.metrics.total_recalls).sum(),
            total_reabsorbs: meta.iter().map(|m| m.metrics.reabsorbs).sum(),
            total_chars_saved: meta.iter().map(|m| m.metrics.total_chars_saved).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    #[test]
    fn test_memory_event_serialization() {
        let event = MemoryEvent::MemoryFiltered {
            session_id: "s1".to_string(),
            turn: 2,
            reason: FilterReason::TooShort { tokens: 40, min: 50 },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "memory_filtered");
        assert_eq!(json["reason"]["reason"], "too_short");
        assert_eq!(json["reason"]["tokens"], 40);
        assert_eq!(event.session_id(), "s1");
    }

    #[test]
    fn test_reinjected_event_serialization() {
        let event = MemoryEvent::Reinjected {
            session_id: "s1".to_string(),
            turn: 3,
            trigger: TriggerReason::Interval,
            record_ids: vec![1],
            tokens: 80,
            usage_ratio: 0.08,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"reinjected\""));
        assert!(json.contains("\"trigger\":\"interval\""));
    }

    #[test]
    fn test_admin_session_from_meta() {
        let mut meta = SessionMeta::new(SessionId::try_from("abc").unwrap(), None);
        meta.metrics.total_stores = 4;
        meta.turn_counter = 9;

        let row = AdminSession::from_meta(&meta, true);
        assert_eq!(row.session_id, "abc");
        assert_eq!(row.total_stores, 4);
        assert_eq!(row.turn_counter, 9);
        assert!(row.active);
    }

    #[test]
    fn test_engine_stats() {
        let mut a = SessionMeta::new(SessionId::try_from("a").unwrap(), None);
        a.metrics.total_stores = 2;
        a.metrics.total_chars_saved = 100;
        let mut b = SessionMeta::new(SessionId::try_from("b").unwrap(), None);
        b.metrics.total_stores = 3;
        b.metrics.reabsorbs = 1;
        let meta = vec![a, b];
        let rows: Vec<AdminSession> = meta
            .iter()
            .enumerate()
            .map(|(i, m)| AdminSession::from_meta(m, i == 0))
            .collect();

        let stats = EngineStats::from_sessions(&rows, &meta);
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_stores, 5);
        assert_eq!(stats.total_reabsorbs, 1);
        assert_eq!(stats.total_chars_saved, 100);
    }
}
