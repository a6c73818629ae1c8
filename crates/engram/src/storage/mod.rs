//! Durable storage for memory records and session metadata
//!
//! The manager only talks to [`DurableStore`]: it loads on resume and saves
//! after every store or reinjection. Implementations own the schema.

pub mod json;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::memory::types::{MemoryRecord, SessionMeta};
use crate::session::SessionId;

pub use json::JsonFileStore;
pub use memory::InMemoryStore;

/// Save/load contract for raw records and session metadata
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or replace a record, keyed by `(session_id, record.id)`
    async fn save_record(&self, session_id: &SessionId, record: &MemoryRecord) -> Result<()>;

    /// All records of a session ordered by id; empty if the session is unknown
    async fn load_records(&self, session_id: &SessionId) -> Result<Vec<MemoryRecord>>;

    async fn save_session_meta(&self, meta: &SessionMeta) -> Result<()>;

    async fn load_session_meta(&self, session_id: &SessionId) -> Result<Option<SessionMeta>>;

    /// Metadata of every stored session, most recently updated first
    async fn list_sessions(&self) -> Result<Vec<SessionMeta>>;

    /// Remove a session and its records. Returns false if it did not exist.
    async fn delete_session(&self, session_id: &SessionId) -> Result<bool>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Sort metadata most recently updated first
pub(crate) fn sort_by_recency(sessions: &mut [SessionMeta]) {
    sessions.sort_by(|a, b| {
        b.last_updated
            .cmp(&a.last_updated)
            .then_with(|| a.session_id.as_str().cmp(b.session_id.as_str()))
    });
}
