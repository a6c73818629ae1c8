//! Memory manager
//!
//! Single entry point for the rest of the system. The write path runs
//! grading, filtering, encoding and storage, then lets the reabsorption
//! controller decide what goes back into context. The read path ranks
//! stored memories against a query without touching their state.
//!
//! Sessions live in a [`SessionRegistry`] injected at construction. Each
//! session sits behind its own async mutex, so operations on one session are
//! serialized while different sessions proceed independently.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::admin::MemoryEvent;
use crate::codec::{Codec, DeflateCodec};
use crate::config::{Config, MemoryConfig};
use crate::error::{EngramError, Result};
use crate::grader::{GradeVerdict, GraderAdapter};
use crate::memory::reabsorption::{
    ReabsorptionController, ReabsorptionPolicy, ReinjectionBlock, TriggerReason,
};
use crate::memory::similarity::SimilarityIndex;
use crate::memory::store::{MemoryStore, PutOutcome};
use crate::memory::tokens::{count_tokens, preview};
use crate::memory::types::{
    FilterReason, HistoryEntry, MemoryRecord, MetricsSnapshot, RecordId, RecordState,
    SessionMeta,
};
use crate::session::SessionId;
use crate::storage::{DurableStore, JsonFileStore};

const DEFAULT_EVENT_CAPACITY: usize = 256;
const TITLE_PREVIEW_CHARS: usize = 30;
const PREVIEW_CHARS: usize = 50;

/// State owned by one active conversation
pub struct Session {
    id: SessionId,
    turn_counter: u64,
    store: MemoryStore,
    controller: ReabsorptionController,
    meta: SessionMeta,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn turn_counter(&self) -> u64 {
        self.turn_counter
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn controller(&self) -> &ReabsorptionController {
        &self.controller
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.store.metrics().clone();
        MetricsSnapshot {
            session_id: self.id.clone(),
            turn_counter: self.turn_counter,
            live_tokens: self.store.live_tokens(),
            capacity_tokens: self.store.capacity_tokens(),
            usage_ratio: self.store.usage_ratio(),
            active_records: self.store.active_count(),
            total_records: self.store.len(),
            expansion_ratio: metrics.expansion_ratio(),
            metrics,
        }
    }

    /// Copy the live counters into the metadata before it is persisted
    fn sync_meta(&mut self) {
        self.meta.turn_counter = self.turn_counter;
        self.meta.metrics = self.store.metrics().clone();
        self.meta.undecodable = self.controller.undecodable_ids();
        self.meta.last_updated = Utc::now();
    }

    /// Apply a graded response and run the triggers for the next turn.
    ///
    /// Nothing here awaits, so the counter, the store and the controller
    /// move together or not at all. A failed `put` leaves the turn counter
    /// where it was.
    fn commit_turn(
        &mut self,
        prompt: Option<&str>,
        response: &str,
        tokens: usize,
        verdict: GradeVerdict,
    ) -> Result<TurnCommit> {
        let turn = self.turn_counter + 1;
        let (grade, fallback_grade, outcome) = match verdict {
            GradeVerdict::TooShort { tokens, min } => {
                let reason = FilterReason::TooShort { tokens, min };
                info!(session = %self.id, turn, "Skipped response: {reason}");
                self.store.metrics_mut().record_filtered(&reason);
                (None, false, PutOutcome::Filtered(reason))
            }
            GradeVerdict::Unavailable { reason } => {
                let reason = FilterReason::GraderUnavailable { detail: reason };
                info!(session = %self.id, turn, "Skipped response: {reason}");
                self.store.metrics_mut().record_filtered(&reason);
                (None, false, PutOutcome::Filtered(reason))
            }
            GradeVerdict::Graded { score, fallback } => {
                let title = format!(
                    "Turn {turn}: {}",
                    preview(prompt.unwrap_or(response), TITLE_PREVIEW_CHARS)
                );
                let outcome = self.store.put(response, tokens, score, turn, &title)?;
                (Some(score), fallback, outcome)
            }
        };
        self.turn_counter = turn;

        let mut events = Vec::new();
        let mut dirty = Vec::new();
        match &outcome {
            PutOutcome::Stored(record) => {
                dirty.push(record.id);
                update_meta_on_store(&mut self.meta, prompt, response);
                events.push(MemoryEvent::MemoryStored {
                    session_id: self.id.to_string(),
                    record_id: record.id,
                    turn,
                    tokens,
                    grade: record.grade,
                    encoded_length: record.encoded_length,
                    compression_ratio: record.compression_ratio(),
                });
            }
            PutOutcome::Filtered(reason) => {
                events.push(MemoryEvent::MemoryFiltered {
                    session_id: self.id.to_string(),
                    turn,
                    reason: reason.clone(),
                });
            }
        }

        let reinjection = self.reabsorb(turn, &mut events);
        for record_id in &reinjection.record_ids {
            if !dirty.contains(record_id) {
                dirty.push(*record_id);
            }
        }

        Ok(TurnCommit {
            report: TurnReport {
                session_id: self.id.clone(),
                turn,
                tokens,
                grade,
                fallback_grade,
                outcome,
                reinjection,
            },
            dirty,
            events,
        })
    }

    /// Run the controller for `turn` and consume whatever it staged
    fn reabsorb(&mut self, turn: u64, events: &mut Vec<MemoryEvent>) -> ReinjectionBlock {
        let Some(trigger) = self.controller.evaluate(turn, &mut self.store) else {
            return self.controller.take_block();
        };
        let block = self.controller.take_block();

        let metrics = self.store.metrics_mut();
        match trigger {
            TriggerReason::Interval => metrics.interval_triggers += 1,
            TriggerReason::Usage => metrics.usage_triggers += 1,
        }
        if !block.record_ids.is_empty() {
            metrics.reabsorbs += 1;
        }
        metrics.reinjected_records += block.record_ids.len() as u64;
        metrics.corrupt_skipped += block.skipped.len() as u64;

        events.extend(block.skipped.iter().map(|skipped| MemoryEvent::RecordSkipped {
            session_id: self.id.to_string(),
            record_id: skipped.record_id,
            error: skipped.error.to_string(),
        }));
        if !block.record_ids.is_empty() {
            events.push(MemoryEvent::Reinjected {
                session_id: self.id.to_string(),
                turn,
                trigger,
                record_ids: block.record_ids.clone(),
                tokens: block.tokens,
                usage_ratio: self.store.usage_ratio(),
            });
        }

        block
    }
}

/// A committed turn whose side effects are not yet written out
struct TurnCommit {
    report: TurnReport,
    /// Records whose durable copy is stale
    dirty: Vec<RecordId>,
    events: Vec<MemoryEvent>,
}

/// Shared handle to a registered session
pub type SessionHandle = Arc<Mutex<Session>>;

/// Mapping from session id to live session state
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Register `session` unless its id is taken. Returns the registered
    /// handle and whether it is the one just inserted.
    fn insert_if_absent(&self, session: Session) -> (SessionHandle, bool) {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let handle = Arc::new(Mutex::new(session));
                entry.insert(Arc::clone(&handle));
                (handle, true)
            }
        }
    }

    fn remove(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    /// Registered session ids, sorted
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Result of one write-path turn
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub session_id: SessionId,
    /// Turn counter after this turn
    pub turn: u64,
    /// Token count of the response
    pub tokens: usize,
    /// Grader score, when the grader was consulted
    pub grade: Option<u8>,
    /// True when the grade is the fail-open default
    pub fallback_grade: bool,
    pub outcome: PutOutcome,
    /// Memories to merge into the next prompt; empty when nothing fired
    pub reinjection: ReinjectionBlock,
}

impl TurnReport {
    pub fn stored_record(&self) -> Option<&MemoryRecord> {
        match &self.outcome {
            PutOutcome::Stored(record) => Some(record),
            PutOutcome::Filtered(_) => None,
        }
    }

    pub fn filter_reason(&self) -> Option<&FilterReason> {
        match &self.outcome {
            PutOutcome::Stored(_) => None,
            PutOutcome::Filtered(reason) => Some(reason),
        }
    }
}

/// A decoded recall hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub record_id: RecordId,
    pub title: String,
    pub score: f64,
    pub text: String,
    pub created_at_turn: u64,
    pub state: RecordState,
}

/// Durable writes and event fan-out, cheap to move into a spawned turn
#[derive(Clone)]
struct Persister {
    durable: Arc<dyn DurableStore>,
    events: broadcast::Sender<MemoryEvent>,
}

impl Persister {
    fn emit(&self, event: MemoryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Write the current state of one record. Failures are counted, not raised.
    async fn save_record(&self, session: &mut Session, record_id: RecordId) {
        let Some(record) = session.store.get(record_id).cloned() else {
            return;
        };
        if let Err(e) = self.durable.save_record(&session.id, &record).await {
            warn!(session = %session.id, record_id, "Failed to persist record: {e}");
            session.store.metrics_mut().persist_failures += 1;
        }
    }

    async fn save_meta(&self, session: &mut Session) {
        session.sync_meta();
        if let Err(e) = self.durable.save_session_meta(&session.meta).await {
            warn!(session = %session.id, "Failed to persist session metadata: {e}");
            session.store.metrics_mut().persist_failures += 1;
            session.meta.metrics.persist_failures += 1;
        }
    }
}

/// Façade over codec, grader, store, controller and similarity index
pub struct MemoryManager {
    config: MemoryConfig,
    codec: Arc<dyn Codec>,
    grader: GraderAdapter,
    persister: Persister,
    registry: Arc<SessionRegistry>,
}

impl MemoryManager {
    pub fn new(
        config: MemoryConfig,
        codec: Arc<dyn Codec>,
        grader: GraderAdapter,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            config,
            codec,
            grader,
            persister: Persister { durable, events },
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// Use an externally owned registry
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Resize the event channel; existing subscribers are dropped
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        self.persister.events = events;
        self
    }

    /// Wire up the configured codec, grader and JSON store
    pub async fn from_config(config: &Config) -> Result<Self> {
        let codec: Arc<dyn Codec> = Arc::new(DeflateCodec::new(config.codec.level));
        let grader = GraderAdapter::from_config(config)?;
        let durable: Arc<dyn DurableStore> =
            Arc::new(JsonFileStore::open(&config.storage.data_dir).await?);

        info!(
            codec = codec.name(),
            grader = grader.grader_name(),
            store = durable.name(),
            "Memory manager initialized"
        );

        Ok(Self::new(config.memory.clone(), codec, grader, durable)
            .with_event_capacity(config.server.event_buffer))
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.persister.durable
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.persister.events.subscribe()
    }

    fn emit(&self, event: MemoryEvent) {
        self.persister.emit(event);
    }

    fn session(&self, id: &SessionId) -> Result<SessionHandle> {
        self.registry
            .get(id)
            .ok_or_else(|| EngramError::SessionNotFound(id.to_string()))
    }

    fn new_session(&self, id: SessionId, meta: SessionMeta) -> Session {
        Session {
            store: MemoryStore::new(id.clone(), Arc::clone(&self.codec), &self.config),
            controller: ReabsorptionController::new(ReabsorptionPolicy::from(&self.config)),
            id,
            turn_counter: 0,
            meta,
        }
    }

    /// Register a session.
    ///
    /// Without an id a fresh one is generated. An id that is already
    /// registered is returned as is; an id with persisted data is resumed.
    pub async fn start_session(
        &self,
        id: Option<SessionId>,
        title: Option<&str>,
    ) -> Result<SessionId> {
        let id = id.unwrap_or_else(SessionId::generate);
        if self.registry.contains(&id) {
            debug!(session = %id, "Session already registered");
            return Ok(id);
        }
        if self.durable().load_session_meta(&id).await?.is_some() {
            self.resume_session(&id).await?;
            return Ok(id);
        }

        let session = self.new_session(id.clone(), SessionMeta::new(id.clone(), title));
        let title = session.meta.title.clone();
        let (handle, inserted) = self.registry.insert_if_absent(session);
        if !inserted {
            debug!(session = %id, "Session registered concurrently");
            return Ok(id);
        }
        let mut session = handle.lock().await;
        self.persister.save_meta(&mut session).await;
        drop(session);

        info!(session = %id, "Session started");
        self.emit(MemoryEvent::SessionStarted {
            session_id: id.to_string(),
            title,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    /// Load a persisted session into the registry.
    ///
    /// A durable store failure here is fatal for this session only.
    pub async fn resume_session(&self, id: &SessionId) -> Result<MetricsSnapshot> {
        if let Some(handle) = self.registry.get(id) {
            return Ok(handle.lock().await.snapshot());
        }

        let meta = self.durable().load_session_meta(id).await?;
        let records = self.durable().load_records(id).await?;
        if meta.is_none() && records.is_empty() {
            return Err(EngramError::SessionNotFound(id.to_string()));
        }

        let meta = meta.unwrap_or_else(|| SessionMeta::new(id.clone(), None));
        let last_turn = records.iter().map(|r| r.created_at_turn).max().unwrap_or(0);
        let store = MemoryStore::from_records(
            id.clone(),
            Arc::clone(&self.codec),
            &self.config,
            records,
            meta.metrics.clone(),
        );
        let session = Session {
            id: id.clone(),
            turn_counter: meta.turn_counter.max(last_turn),
            controller: ReabsorptionController::new(ReabsorptionPolicy::from(&self.config))
                .with_undecodable(meta.undecodable.iter().copied()),
            store,
            meta,
        };
        let snapshot = session.snapshot();
        let (handle, inserted) = self.registry.insert_if_absent(session);
        if !inserted {
            return Ok(handle.lock().await.snapshot());
        }

        info!(
            session = %id,
            records = snapshot.total_records,
            turn = snapshot.turn_counter,
            "Session resumed"
        );
        self.emit(MemoryEvent::SessionResumed {
            session_id: id.to_string(),
            records: snapshot.total_records,
            turn_counter: snapshot.turn_counter,
        });
        Ok(snapshot)
    }

    /// Remove a session from the registry, persist its metadata and return
    /// the final metrics
    pub async fn end_session(&self, id: &SessionId) -> Result<MetricsSnapshot> {
        let handle = self
            .registry
            .remove(id)
            .ok_or_else(|| EngramError::SessionNotFound(id.to_string()))?;
        let mut session = handle.lock().await;
        self.persister.save_meta(&mut session).await;

        let snapshot = session.snapshot();
        info!(session = %id, "{}", snapshot.summary_line());
        self.emit(MemoryEvent::SessionEnded {
            session_id: id.to_string(),
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Delete a persisted session. Refused while the session is registered.
    pub async fn delete_session(&self, id: &SessionId) -> Result<bool> {
        if self.registry.contains(id) {
            return Err(EngramError::SessionActive(id.to_string()));
        }
        let deleted = self.durable().delete_session(id).await?;
        if deleted {
            info!(session = %id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Write path for a response without a known prompt
    pub async fn record_turn(&self, id: &SessionId, response: &str) -> Result<TurnReport> {
        self.record_turn_with_prompt(id, None, response).await
    }

    /// Write path: grade and maybe store the response, advance the turn,
    /// then evaluate the reabsorption triggers.
    ///
    /// The prompt, when given, is passed to the grader as context and names
    /// the record and the session. Dropping the returned future while the
    /// grader runs leaves the session untouched; once the session lock is
    /// taken the turn runs to completion on its own task.
    pub async fn record_turn_with_prompt(
        &self,
        id: &SessionId,
        prompt: Option<&str>,
        response: &str,
    ) -> Result<TurnReport> {
        let handle = self.session(id)?;
        let tokens = count_tokens(response);
        let verdict = self.grader.grade(response, tokens, prompt.unwrap_or("")).await;

        let mut session = handle.lock_owned().await;
        let persister = self.persister.clone();
        let prompt = prompt.map(str::to_string);
        let response = response.to_string();

        let task = tokio::spawn(async move {
            let commit = session.commit_turn(prompt.as_deref(), &response, tokens, verdict)?;
            for record_id in &commit.dirty {
                persister.save_record(&mut session, *record_id).await;
            }
            persister.save_meta(&mut session).await;
            for event in commit.events {
                persister.emit(event);
            }
            Ok::<_, EngramError>(commit.report)
        });
        task.await
            .map_err(|e| EngramError::Server(format!("turn task failed: {e}")))?
    }

    /// Read path: the `k` (default `recall_top_k`) most similar memories,
    /// decoded. Only `total_recalls` changes.
    pub async fn recall(
        &self,
        id: &SessionId,
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<RecalledMemory>> {
        let handle = self.session(id)?;
        let mut session = handle.lock().await;

        let k = k.unwrap_or(self.config.recall_top_k);
        let index = SimilarityIndex::new(self.config.min_recall_score);
        let hits = index.query(&session.store, query, k)?;
        session.store.metrics_mut().total_recalls += 1;

        let recalled: Vec<RecalledMemory> = hits
            .into_iter()
            .map(|hit| RecalledMemory {
                record_id: hit.record.id,
                title: hit.record.title,
                score: hit.score,
                text: hit.text,
                created_at_turn: hit.record.created_at_turn,
                state: hit.record.state,
            })
            .collect();

        info!(session = %id, query, hits = recalled.len(), "Recall");
        self.emit(MemoryEvent::Recalled {
            session_id: id.to_string(),
            query: query.to_string(),
            record_ids: recalled.iter().map(|r| r.record_id).collect(),
        });
        Ok(recalled)
    }

    pub async fn metrics(&self, id: &SessionId) -> Result<MetricsSnapshot> {
        let handle = self.session(id)?;
        let session = handle.lock().await;
        Ok(session.snapshot())
    }

    /// Every record of a registered session, both states, in order
    pub async fn records(&self, id: &SessionId) -> Result<Vec<MemoryRecord>> {
        let handle = self.session(id)?;
        let session = handle.lock().await;
        Ok(session.store.all().to_vec())
    }

    /// History rows for a session, registered or only persisted
    pub async fn session_history(&self, id: &SessionId) -> Result<Vec<HistoryEntry>> {
        let records = match self.registry.get(id) {
            Some(handle) => handle.lock().await.store.all().to_vec(),
            None => {
                let records = self.durable().load_records(id).await?;
                if records.is_empty() && self.durable().load_session_meta(id).await?.is_none() {
                    return Err(EngramError::SessionNotFound(id.to_string()));
                }
                records
            }
        };
        Ok(records.iter().map(HistoryEntry::from).collect())
    }

    /// Metadata of every persisted session, most recently updated first
    pub async fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        self.durable().list_sessions().await
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.registry.ids()
    }
}

/// Auto-title from the first prompt and refresh the preview
fn update_meta_on_store(meta: &mut SessionMeta, prompt: Option<&str>, response: &str) {
    if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
        if meta.first_prompt.is_none() {
            meta.first_prompt = Some(prompt.to_string());
        }
        if meta.has_default_title() {
            let topic: String = prompt
                .chars()
                .take(TITLE_PREVIEW_CHARS)
                .map(|c| if c == ' ' { '_' } else { c })
                .collect();
            meta.title = format!("Chat about {topic}");
        }
    }
    let head: String = response.chars().take(PREVIEW_CHARS).collect();
    meta.preview = format!("Last: {head}...");
}
