//! JSON file store
//!
//! Layout under the data directory:
//!
//! ```text
//! sessions/<session_id>/meta.json
//! sessions/<session_id>/records.json
//! ```
//!
//! Every write replaces the whole file through a temp file and a rename, so a
//! crash mid-write leaves the previous version in place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{EngramError, Result};
use crate::memory::types::{MemoryRecord, SessionMeta};
use crate::session::SessionId;
use crate::storage::{DurableStore, sort_by_recency};

const SESSIONS_DIR: &str = "sessions";
const META_FILE: &str = "meta.json";
const RECORDS_FILE: &str = "records.json";

/// Durable store writing one directory per session
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `data_dir`
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let root = data_dir.join(SESSIONS_DIR);
        fs::create_dir_all(&root).await.map_err(|e| {
            EngramError::Storage(format!(
                "Failed to create data directory {}: {e}",
                root.display()
            ))
        })?;
        debug!("JSON store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngramError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            EngramError::Storage(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await.map_err(|e| {
            EngramError::Storage(format!("Failed to write {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, path).await.map_err(|e| {
            EngramError::Storage(format!("Failed to replace {}: {e}", path.display()))
        })
    }

    async fn ensure_session_dir(&self, session_id: &SessionId) -> Result<PathBuf> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await.map_err(|e| {
            EngramError::Storage(format!("Failed to create {}: {e}", dir.display()))
        })?;
        Ok(dir)
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn save_record(&self, session_id: &SessionId, record: &MemoryRecord) -> Result<()> {
        let dir = self.ensure_session_dir(session_id).await?;
        let path = dir.join(RECORDS_FILE);

        let mut records: Vec<MemoryRecord> = Self::read_json(&path).await?.unwrap_or_default();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        records.sort_by_key(|r| r.id);

        Self::write_json(&path, &records).await
    }

    async fn load_records(&self, session_id: &SessionId) -> Result<Vec<MemoryRecord>> {
        let path = self.session_dir(session_id).join(RECORDS_FILE);
        let mut records: Vec<MemoryRecord> = Self::read_json(&path).await?.unwrap_or_default();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn save_session_meta(&self, meta: &SessionMeta) -> Result<()> {
        let dir = self.ensure_session_dir(&meta.session_id).await?;
        Self::write_json(&dir.join(META_FILE), meta).await
    }

    async fn load_session_meta(&self, session_id: &SessionId) -> Result<Option<SessionMeta>> {
        Self::read_json(&self.session_dir(session_id).join(META_FILE)).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            EngramError::Storage(format!("Failed to list {}: {e}", self.root.display()))
        })?;

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(META_FILE);
            match Self::read_json::<SessionMeta>(&path).await {
                Ok(Some(meta)) => sessions.push(meta),
                Ok(None) => {}
                // One unreadable session must not hide the others
                Err(e) => warn!("Skipping session directory: {e}"),
            }
        }

        sort_by_recency(&mut sessions);
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<bool> {
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngramError::Storage(format!(
                "Failed to delete {}: {e}",
                dir.display()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::RecordState;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn sid(s: &str) -> SessionId {
        SessionId::try_from(s).unwrap()
    }

    fn record(session: &SessionId, id: u64) -> MemoryRecord {
        MemoryRecord {
            id,
            session_id: session.clone(),
            encoded_payload: format!("payload-{id}"),
            original_length: 60,
            original_chars: 300,
            encoded_length: 120,
            grade: 8,
            created_at_turn: id,
            title: format!("Turn {id}"),
            created_at: Utc::now(),
            state: RecordState::Active,
        }
    }

    #[tokio::test]
    async fn test_open_creates_sessions_dir() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert!(store.root().is_dir());
    }

    #[tokio::test]
    async fn test_save_and_load_records() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let s = sid("json-records");

        store.save_record(&s, &record(&s, 2)).await.unwrap();
        store.save_record(&s, &record(&s, 1)).await.unwrap();

        let loaded = store.load_records(&s).await.unwrap();
        assert_eq!(loaded.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(loaded[0].encoded_payload, "payload-1");
        assert_eq!(loaded[0].title, "Turn 1");
    }

    #[tokio::test]
    async fn test_save_record_upserts_by_id() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let s = sid("json-upsert");

        let mut r = record(&s, 1);
        store.save_record(&s, &r).await.unwrap();
        r.state = RecordState::Reinjected;
        store.save_record(&s, &r).await.unwrap();

        let loaded = store.load_records(&s).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, RecordState::Reinjected);
    }

    #[tokio::test]
    async fn test_unknown_session_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let s = sid("nobody");
        assert!(store.load_records(&s).await.unwrap().is_empty());
        assert!(store.load_session_meta(&s).await.unwrap().is_none());
        assert!(!store.delete_session(&s).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_sessions_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();

        let mut older = SessionMeta::new(sid("older"), None);
        older.last_updated = Utc::now() - Duration::hours(1);
        let newer = SessionMeta::new(sid("newer"), Some("Chat about rust"));
        store.save_session_meta(&older).await.unwrap();
        store.save_session_meta(&newer).await.unwrap();

        let listed = store.list_sessions().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.session_id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(listed[0].title, "Chat about rust");
    }

    #[tokio::test]
    async fn test_corrupt_meta_is_skipped_in_listing() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store
            .save_session_meta(&SessionMeta::new(sid("good"), None))
            .await
            .unwrap();

        let bad = store.root().join("bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(META_FILE), "{not json").unwrap();

        let listed = store.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.load_session_meta(&sid("bad")).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_session_removes_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let s = sid("to-delete");
        store.save_record(&s, &record(&s, 1)).await.unwrap();
        store
            .save_session_meta(&SessionMeta::new(s.clone(), None))
            .await
            .unwrap();

        assert!(store.delete_session(&s).await.unwrap());
        assert!(store.load_records(&s).await.unwrap().is_empty());
        assert!(store.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let s = sid("atomic");
        store.save_record(&s, &record(&s, 1)).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.root().join("atomic"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![RECORDS_FILE.to_string()]);
    }
}
