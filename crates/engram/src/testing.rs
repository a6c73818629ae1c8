//! Test utilities for engram - mocks for the external collaborators
//!
//! This module provides:
//! - A scriptable grader (fixed scores, sequences, failures, delays)
//! - A scriptable generator that records the prompts it receives
//! - A durable store wrapper that fails or stalls on demand
//! - Records whose payload no codec accepts

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::completion::ChatMessage;
use crate::error::{EngramError, Result};
use crate::generator::{Generator, GeneratorError};
use crate::grader::{Grader, GraderError};
use crate::memory::types::{MemoryRecord, RecordId, RecordState, SessionMeta};
use crate::session::SessionId;
use crate::storage::{DurableStore, InMemoryStore};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `n` copies of `word` separated by spaces: a text of exactly `n` tokens
pub fn words(word: &str, n: usize) -> String {
    vec![word; n].join(" ")
}

/// An active 60-token record whose payload fails to decode
pub fn corrupt_record(session_id: &SessionId, id: RecordId, turn: u64) -> MemoryRecord {
    let payload = "garbage".to_string();
    MemoryRecord {
        id,
        session_id: session_id.clone(),
        encoded_length: payload.len(),
        encoded_payload: payload,
        original_length: 60,
        original_chars: 360,
        grade: 8,
        created_at_turn: turn,
        title: format!("Turn {turn}: corrupt"),
        created_at: Utc::now(),
        state: RecordState::Active,
    }
}

/// Grader returning scripted scores.
///
/// Scores are consumed in order; the last one repeats once the script runs
/// out. `None` entries fail the call.
#[derive(Debug)]
pub struct MockGrader {
    script: Mutex<VecDeque<Option<u8>>>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockGrader {
    fn scripted(script: Vec<Option<u8>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always returns `score`
    pub fn fixed(score: u8) -> Self {
        Self::scripted(vec![Some(score)])
    }

    /// Returns `scores` in order, then repeats the last
    pub fn sequence(scores: Vec<u8>) -> Self {
        Self::scripted(scores.into_iter().map(Some).collect())
    }

    /// Every call fails
    pub fn failing() -> Self {
        Self::scripted(vec![None])
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared counter of `score` calls
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Grader for MockGrader {
    async fn score(&self, _text: &str, _context: &str) -> std::result::Result<u8, GraderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut script = lock(&self.script);
            if script.len() > 1 {
                script.pop_front().flatten()
            } else {
                script.front().copied().flatten()
            }
        };

        next.ok_or_else(|| GraderError::Unavailable("mock grader failure".to_string()))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Generator returning scripted replies and recording its prompts
#[derive(Debug, Default)]
pub struct MockGenerator {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    prompts: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl MockGenerator {
    /// Replies in order; once exhausted every call fails
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Arc::default(),
        }
    }

    /// Every call fails
    pub fn failing() -> Self {
        Self::default()
    }

    /// Queue a failure after the current replies
    pub fn then_fail(self, message: &str) -> Self {
        lock(&self.replies).push_back(Err(message.to_string()));
        self
    }

    /// Prompts received so far, shared with the generator
    pub fn prompts(&self) -> Arc<Mutex<Vec<Vec<ChatMessage>>>> {
        Arc::clone(&self.prompts)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(
        &self,
        messages: &[ChatMessage],
    ) -> std::result::Result<String, GeneratorError> {
        lock(&self.prompts).push(messages.to_vec());
        match lock(&self.replies).pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(GeneratorError::Unavailable(message)),
            None => Err(GeneratorError::Unavailable("no scripted reply".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// In-memory store that fails saves and/or loads on demand
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: InMemoryStore,
    fail_saves: bool,
    fail_loads: bool,
    only: Option<SessionId>,
    delay: Option<Duration>,
}

impl FailingStore {
    /// Every save fails; loads work
    pub fn saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// Every load fails; saves work
    pub fn loads() -> Self {
        Self {
            fail_loads: true,
            ..Self::default()
        }
    }

    /// Loads fail for one session only
    pub fn loads_for(session_id: SessionId) -> Self {
        Self {
            fail_loads: true,
            only: Some(session_id),
            ..Self::default()
        }
    }

    /// Every call succeeds after sleeping for `delay`
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// The wrapped store, for seeding and inspection
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    async fn stall(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn applies(&self, session_id: &SessionId) -> bool {
        self.only.as_ref().is_none_or(|only| only == session_id)
    }

    fn check_save(&self, session_id: &SessionId) -> Result<()> {
        if self.fail_saves && self.applies(session_id) {
            return Err(EngramError::Storage("injected save failure".to_string()));
        }
        Ok(())
    }

    fn check_load(&self, session_id: &SessionId) -> Result<()> {
        if self.fail_loads && self.applies(session_id) {
            return Err(EngramError::Storage("injected load failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    async fn save_record(&self, session_id: &SessionId, record: &MemoryRecord) -> Result<()> {
        self.stall().await;
        self.check_save(session_id)?;
        self.inner.save_record(session_id, record).await
    }

    async fn load_records(&self, session_id: &SessionId) -> Result<Vec<MemoryRecord>> {
        self.stall().await;
        self.check_load(session_id)?;
        self.inner.load_records(session_id).await
    }

    async fn save_session_meta(&self, meta: &SessionMeta) -> Result<()> {
        self.stall().await;
        self.check_save(&meta.session_id)?;
        self.inner.save_session_meta(meta).await
    }

    async fn load_session_meta(&self, session_id: &SessionId) -> Result<Option<SessionMeta>> {
        self.stall().await;
        self.check_load(session_id)?;
        self.inner.load_session_meta(session_id).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        self.stall().await;
        if self.fail_loads && self.only.is_none() {
            return Err(EngramError::Storage("injected load failure".to_string()));
        }
        self.inner.list_sessions().await
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<bool> {
        self.stall().await;
        self.check_save(session_id)?;
        self.inner.delete_session(session_id).await
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
