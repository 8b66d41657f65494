//! In-memory session state and per-session FIFO message queues.
//!
//! The manager never writes to the store. Persisted sessions are only read,
//! through [`SessionLookup`], when a session is explicitly initialized.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use crate::memory::types::SessionRecord;
use crate::memory::Store;

/// Read access to persisted sessions.
pub trait SessionLookup: Send + Sync {
    fn lookup_session(&self, id: i64) -> Result<Option<SessionRecord>>;
}

impl SessionLookup for Store {
    fn lookup_session(&self, id: i64) -> Result<Option<SessionRecord>> {
        self.get_session(id)
    }
}

/// A tool-use event, passed through to the processor unexamined.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationMessage {
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub tool_output: serde_json::Value,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizeMessage {
    pub last_user: Option<String>,
    pub last_assistant: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Observation(ObservationMessage),
    Summarize(SummarizeMessage),
}

#[derive(Debug)]
struct ActiveSession {
    content_session_id: Option<String>,
    project: Option<String>,
    user_prompt: Option<String>,
    prompt_number: Option<i64>,
    started_at: Instant,
    processing: bool,
    queue: VecDeque<Message>,
}

impl ActiveSession {
    fn empty() -> Self {
        Self {
            content_session_id: None,
            project: None,
            user_prompt: None,
            prompt_number: None,
            started_at: Instant::now(),
            processing: false,
            queue: VecDeque::new(),
        }
    }
}

/// Point-in-time view of one active session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: i64,
    pub content_session_id: Option<String>,
    pub project: Option<String>,
    pub user_prompt: Option<String>,
    pub prompt_number: Option<i64>,
    pub queue_depth: usize,
    pub processing: bool,
    pub age_ms: u64,
}

type DeleteCallback = Box<dyn Fn(i64) + Send + Sync>;

pub struct SessionManager {
    lookup: Arc<dyn SessionLookup>,
    sessions: Mutex<HashMap<i64, ActiveSession>>,
    on_delete: RwLock<Option<DeleteCallback>>,
    closed: AtomicBool,
}

impl SessionManager {
    pub fn new(lookup: Arc<dyn SessionLookup>) -> Self {
        Self {
            lookup,
            sessions: Mutex::new(HashMap::new()),
            on_delete: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<i64, ActiveSession>> {
        // Session state is plain data; a panic mid-update leaves nothing to repair.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the callback invoked after [`Self::delete_session`] removes a session.
    pub fn set_on_delete(&self, callback: impl Fn(i64) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_delete.write() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Activate session `id` in memory from its persisted record.
    ///
    /// Returns `None` if no such session was ever persisted. Queued messages of
    /// a lazily created entry are kept.
    pub fn initialize_session(
        &self,
        id: i64,
        user_prompt: Option<&str>,
        prompt_number: Option<i64>,
    ) -> Result<Option<SessionSnapshot>> {
        let Some(record) = self.lookup.lookup_session(id)? else {
            return Ok(None);
        };
        let mut sessions = self.sessions();
        let entry = sessions.entry(id).or_insert_with(ActiveSession::empty);
        entry.content_session_id = Some(record.content_session_id);
        entry.project = Some(record.project);
        entry.user_prompt = user_prompt.map(str::to_string).or(record.user_prompt);
        entry.prompt_number = prompt_number.or(Some(record.prompt_counter));
        tracing::debug!(session_id = id, "session initialized");
        Ok(Some(snapshot(id, entry)))
    }

    fn enqueue(&self, id: i64, message: Message) -> bool {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(session_id = id, "session manager shut down, message dropped");
            return false;
        }
        self.sessions()
            .entry(id)
            .or_insert_with(ActiveSession::empty)
            .queue
            .push_back(message);
        true
    }

    /// Append an observation to the session's queue, creating the entry lazily.
    pub fn queue_observation(&self, id: i64, message: ObservationMessage) -> bool {
        self.enqueue(id, Message::Observation(message))
    }

    /// Append a summarize request to the session's queue, creating the entry lazily.
    pub fn queue_summarize(
        &self,
        id: i64,
        last_user: Option<String>,
        last_assistant: Option<String>,
    ) -> bool {
        self.enqueue(
            id,
            Message::Summarize(SummarizeMessage {
                last_user,
                last_assistant,
            }),
        )
    }

    /// Atomically empty the session's queue and return its messages in order.
    pub fn drain_messages(&self, id: i64) -> Vec<Message> {
        self.sessions()
            .get_mut(&id)
            .map(|s| s.queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn set_processing(&self, id: i64, processing: bool) {
        if let Some(session) = self.sessions().get_mut(&id) {
            session.processing = processing;
        }
    }

    pub fn get_session(&self, id: i64) -> Option<SessionSnapshot> {
        self.sessions().get(&id).map(|s| snapshot(id, s))
    }

    /// Snapshot of every active session, ordered by id.
    pub fn get_all_sessions(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .sessions()
            .iter()
            .map(|(id, s)| snapshot(*id, s))
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Remove a session and notify the deletion callback. Returns `false` if
    /// it was not active.
    pub fn delete_session(&self, id: i64) -> bool {
        let removed = self.sessions().remove(&id);
        let Some(session) = removed else {
            return false;
        };
        if !session.queue.is_empty() {
            tracing::debug!(
                session_id = id,
                discarded = session.queue.len(),
                "session deleted with queued messages"
            );
        }
        if let Ok(callback) = self.on_delete.read() {
            if let Some(callback) = callback.as_ref() {
                callback(id);
            }
        }
        true
    }

    /// Stop accepting messages, wait up to `deadline` for in-flight processing
    /// to finish, then discard every session. Returns the number of queued
    /// messages discarded.
    pub async fn shutdown_all(&self, deadline: Duration) -> usize {
        self.closed.store(true, Ordering::Release);
        let start = Instant::now();
        while self.is_any_session_processing() && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.is_any_session_processing() {
            tracing::warn!("shutting down sessions while processing is still in flight");
        }

        let drained: Vec<ActiveSession> = self.sessions().drain().map(|(_, s)| s).collect();
        let discarded: usize = drained.iter().map(|s| s.queue.len()).sum();
        tracing::info!(sessions = drained.len(), discarded, "all sessions shut down");
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn get_active_session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn get_total_queue_depth(&self) -> usize {
        self.sessions().values().map(|s| s.queue.len()).sum()
    }

    pub fn is_any_session_processing(&self) -> bool {
        self.sessions().values().any(|s| s.processing)
    }
}

fn snapshot(id: i64, session: &ActiveSession) -> SessionSnapshot {
    SessionSnapshot {
        id,
        content_session_id: session.content_session_id.clone(),
        project: session.project.clone(),
        user_prompt: session.user_prompt.clone(),
        prompt_number: session.prompt_number,
        queue_depth: session.queue.len(),
        processing: session.processing,
        age_ms: session.started_at.elapsed().as_millis() as u64,
    }
}
