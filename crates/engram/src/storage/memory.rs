//! In-process durable store backed by `DashMap`

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::memory::types::{MemoryRecord, RecordId, SessionMeta};
use crate::session::SessionId;
use crate::storage::{DurableStore, sort_by_recency};

/// Keeps everything in memory; contents are lost when dropped
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<SessionId, BTreeMap<RecordId, MemoryRecord>>,
    meta: DashMap<SessionId, SessionMeta>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn save_record(&self, session_id: &SessionId, record: &MemoryRecord) -> Result<()> {
        self.records
            .entry(session_id.clone())
            .or_default()
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn load_records(&self, session_id: &SessionId) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .records
            .get(session_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_session_meta(&self, meta: &SessionMeta) -> Result<()> {
        self.meta.insert(meta.session_id.clone(), meta.clone());
        Ok(())
    }

    async fn load_session_meta(&self, session_id: &SessionId) -> Result<Option<SessionMeta>> {
        Ok(self.meta.get(session_id).map(|m| m.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        let mut sessions: Vec<SessionMeta> = self.meta.iter().map(|m| m.value().clone()).collect();
        sort_by_recency(&mut sessions);
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<bool> {
        let had_records = self.records.remove(session_id).is_some();
        let had_meta = self.meta.remove(session_id).is_some();
        Ok(had_records || had_meta)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::RecordState;
    use chrono::Utc;

    fn record(session: &SessionId, id: RecordId) -> MemoryRecord {
        MemoryRecord {
            id,
            session_id: session.clone(),
            encoded_payload: String::new(),
            original_length: 10,
            original_chars: 50,
            encoded_length: 40,
            grade: 7,
            created_at_turn: id,
            title: String::new(),
            created_at: Utc::now(),
            state: RecordState::Active,
        }
    }

    #[tokio::test]
    async fn test_records_ordered_and_upserted() {
        let store = InMemoryStore::new();
        let s = SessionId::try_from("mem").unwrap();

        store.save_record(&s, &record(&s, 3)).await.unwrap();
        store.save_record(&s, &record(&s, 1)).await.unwrap();
        let mut updated = record(&s, 3);
        updated.state = RecordState::Reinjected;
        store.save_record(&s, &updated).await.unwrap();

        let loaded = store.load_records(&s).await.unwrap();
        assert_eq!(loaded.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(loaded[1].state, RecordState::Reinjected);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = InMemoryStore::new();
        let a = SessionId::try_from("a").unwrap();
        let b = SessionId::try_from("b").unwrap();
        store.save_record(&a, &record(&a, 1)).await.unwrap();

        assert!(store.load_records(&b).await.unwrap().is_empty());
        assert!(store.delete_session(&a).await.unwrap());
        assert!(!store.delete_session(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let store = InMemoryStore::new();
        let s = SessionId::try_from("meta").unwrap();
        let meta = SessionMeta::new(s.clone(), Some("Chat about tests"));
        store.save_session_meta(&meta).await.unwrap();

        assert_eq!(store.load_session_meta(&s).await.unwrap(), Some(meta));
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);
    }
}
