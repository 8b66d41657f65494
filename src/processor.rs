//! Turns queued session messages into stored observations and summaries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::memory::types::{NewObservation, SessionStatus, SessionSummary};
use crate::memory::Store;
use crate::privacy::{strip_private, strip_private_json};
use crate::retrieval::staleness::current_mtimes;
use crate::session::{ObservationMessage, SummarizeMessage};
use crate::vector::VectorIndex;

const MAX_NARRATIVE_CHARS: usize = 2000;
const MAX_TITLE_CHARS: usize = 120;

/// Identity of the session a message came from. Project and prompt number
/// are unknown for sessions that were queued to before being initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: i64,
    pub project: Option<String>,
    pub prompt_number: Option<i64>,
    pub user_prompt: Option<String>,
}

/// Consumes drained messages. Synchronous; the queue processor calls it from
/// `spawn_blocking`.
pub trait ObservationProcessor: Send + Sync {
    fn process_observation(&self, session: &SessionContext, message: &ObservationMessage)
        -> Result<()>;

    fn process_summary(&self, session: &SessionContext, message: &SummarizeMessage) -> Result<()>;
}

/// Writes one observation per tool event straight into the store and vector
/// index.
pub struct DirectProcessor {
    store: Arc<Store>,
    vector: Option<Arc<dyn VectorIndex>>,
}

impl DirectProcessor {
    pub fn new(store: Arc<Store>, vector: Option<Arc<dyn VectorIndex>>) -> Self {
        Self { store, vector }
    }

    /// Fill in the project (and prompt) from the persisted session when the
    /// in-memory entry never learned them.
    fn resolve(&self, session: &SessionContext) -> Result<SessionContext> {
        if session.project.is_some() {
            return Ok(session.clone());
        }
        let record = self
            .store
            .get_session(session.session_id)?
            .with_context(|| format!("unknown session {}", session.session_id))?;
        Ok(SessionContext {
            session_id: session.session_id,
            project: Some(record.project),
            prompt_number: session.prompt_number.or(Some(record.prompt_counter)),
            user_prompt: session.user_prompt.clone().or(record.user_prompt),
        })
    }
}

impl ObservationProcessor for DirectProcessor {
    fn process_observation(
        &self,
        session: &SessionContext,
        message: &ObservationMessage,
    ) -> Result<()> {
        let session = self.resolve(session)?;
        let project = session.project.clone().unwrap_or_default();
        let input = strip_private_json(&message.tool_input);
        let output = strip_private_json(&message.tool_output);

        let files = referenced_files(&input);
        let cwd = message.cwd.as_deref().map(PathBuf::from);
        let file_mtimes = current_mtimes(&files, cwd.as_deref());

        let new = NewObservation {
            session_id: Some(session.session_id),
            project,
            scope: None,
            obs_type: observation_type(&message.tool_name).into(),
            title: truncate(&title_for(&message.tool_name, &input), MAX_TITLE_CHARS),
            subtitle: message.cwd.clone(),
            narrative: truncate(&value_text(&output), MAX_NARRATIVE_CHARS),
            facts: facts_for(&input),
            concepts: vec![message.tool_name.to_lowercase()],
            files,
            file_mtimes,
            prompt_number: session.prompt_number,
        };
        let stored = self.store.insert_observation(&new)?;
        tracing::debug!(id = %stored.id, tool = %message.tool_name, "observation stored");

        if let Some(vector) = &self.vector {
            if let Err(e) = vector.upsert(&stored) {
                tracing::warn!(id = %stored.id, error = %e, "vector upsert failed");
            }
        }
        Ok(())
    }

    fn process_summary(&self, session: &SessionContext, message: &SummarizeMessage) -> Result<()> {
        let session = self.resolve(session)?;
        let clean = |t: &Option<String>| {
            t.as_deref()
                .map(strip_private)
                .filter(|s| !s.is_empty())
                .map(|s| truncate(&s, MAX_NARRATIVE_CHARS))
        };
        self.store.insert_summary(&SessionSummary {
            session_id: session.session_id,
            project: session.project.unwrap_or_default(),
            request: session
                .user_prompt
                .as_deref()
                .map(strip_private)
                .or_else(|| clean(&message.last_user)),
            completed: clean(&message.last_assistant),
            learned: None,
            next_steps: None,
        })?;
        self.store
            .set_session_status(session.session_id, SessionStatus::Completed)?;
        tracing::info!(session_id = session.session_id, "session summarized");
        Ok(())
    }
}

fn observation_type(tool_name: &str) -> &'static str {
    match tool_name {
        "Edit" | "MultiEdit" | "Write" | "NotebookEdit" => "change",
        "Read" | "Grep" | "Glob" | "LS" | "WebFetch" | "WebSearch" => "discovery",
        "Bash" => "command",
        _ => "tool",
    }
}

fn title_for(tool_name: &str, input: &Value) -> String {
    let target = ["file_path", "notebook_path", "path", "command", "pattern", "url", "query"]
        .iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str));
    match target {
        Some(t) => format!("{tool_name}: {t}"),
        None => tool_name.to_string(),
    }
}

fn facts_for(input: &Value) -> Vec<String> {
    ["command", "description", "pattern"]
        .iter()
        .filter_map(|k| input.get(*k).and_then(Value::as_str).map(|v| format!("{k}: {v}")))
        .collect()
}

/// File paths named in a tool input.
fn referenced_files(input: &Value) -> Vec<String> {
    let mut files: Vec<String> = ["file_path", "notebook_path", "path"]
        .iter()
        .filter_map(|k| input.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    if let Some(list) = input.get("files").and_then(Value::as_array) {
        files.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
    }
    files.sort();
    files.dedup();
    files
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
