use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;

use super::AppState;
use crate::error::ApiError;
use crate::memory::types::{SessionRecord, SessionStatus};
use crate::memory::Store;
use crate::privacy::{is_entirely_private, strip_private};
use crate::retrieval::{validate_project, InjectRequest, InjectResponse, SearchRequest, SearchResponse};
use crate::session::ObservationMessage;

/// Identical prompts within this window are the same submission.
pub const DUPLICATE_PROMPT_WINDOW: Duration = Duration::from_secs(10);

fn require(value: &str, name: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!("{name} is required")));
    }
    Ok(value.to_string())
}

// ── Sessions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionBody {
    #[serde(alias = "contentSessionId", alias = "conversationID")]
    pub conversation_id: String,
    pub project: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub matched_observations: i64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionResponse {
    pub session_db_id: i64,
    pub prompt_number: i64,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Persist a prompt, creating the session on first use. Entirely private
/// prompts are recorded without text and leave the session skipped.
fn record_prompt_submission(
    store: &Store,
    conversation_id: &str,
    project: &str,
    prompt: &str,
    matched: i64,
) -> anyhow::Result<InitSessionResponse> {
    let cleaned = strip_private(prompt);
    let private = is_entirely_private(prompt);

    if let Some(previous) =
        store.find_recent_prompt(conversation_id, &cleaned, DUPLICATE_PROMPT_WINDOW)?
    {
        tracing::debug!(conversation_id, "duplicate prompt submission");
        return Ok(InitSessionResponse {
            session_db_id: previous.session_id,
            prompt_number: previous.prompt_number,
            skipped: private,
            reason: private.then(|| "private".to_string()),
        });
    }

    let session = store.create_or_get_session(conversation_id, project)?;
    let recorded = store.record_prompt(session.id, &cleaned, private, matched)?;

    if private {
        if session.user_prompt.is_none() {
            store.set_session_status(session.id, SessionStatus::Skipped)?;
        }
        tracing::info!(session_id = session.id, "private prompt skipped");
        return Ok(InitSessionResponse {
            session_db_id: session.id,
            prompt_number: recorded.prompt_number,
            skipped: true,
            reason: Some("private".into()),
        });
    }

    if session.status == SessionStatus::Skipped {
        store.set_session_status(session.id, SessionStatus::Active)?;
    }
    tracing::info!(
        session_id = session.id,
        prompt_number = recorded.prompt_number,
        project = %session.project,
        "prompt recorded"
    );
    Ok(InitSessionResponse {
        session_db_id: session.id,
        prompt_number: recorded.prompt_number,
        skipped: false,
        reason: None,
    })
}

pub async fn init_session(
    State(state): State<AppState>,
    Json(body): Json<InitSessionBody>,
) -> Result<Json<InitSessionResponse>, ApiError> {
    let conversation_id = require(&body.conversation_id, "conversationId")?;
    let project = require(&body.project, "project")?;
    validate_project(&project)?;

    let _guard = state.init_lock.lock().await;
    let store = state.service.components().store.clone();
    let response = tokio::task::spawn_blocking(move || {
        record_prompt_submission(
            &store,
            &conversation_id,
            &project,
            &body.prompt,
            body.matched_observations,
        )
    })
    .await??;
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateSessionBody {
    pub user_prompt: Option<String>,
    pub prompt_number: Option<i64>,
}

pub async fn activate_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<ActivateSessionBody>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let sessions = state.service.components().sessions.clone();
    let user_prompt = body.user_prompt.map(|p| strip_private(&p));
    let snapshot = tokio::task::spawn_blocking(move || {
        sessions.initialize_session(id, user_prompt.as_deref(), body.prompt_number)
    })
    .await??
    .ok_or_else(|| ApiError::NotFound(format!("session {id} not found")))?;
    Ok(Json(json!({ "status": "initialized", "session": snapshot })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationBody {
    #[serde(alias = "contentSessionId", alias = "conversationID")]
    pub conversation_id: String,
    #[serde(default)]
    pub project: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default, alias = "toolResponse")]
    pub tool_output: Value,
    pub cwd: Option<String>,
}

pub async fn queue_observation(
    State(state): State<AppState>,
    Json(body): Json<ObservationBody>,
) -> Result<Json<Value>, ApiError> {
    let conversation_id = require(&body.conversation_id, "conversationId")?;
    let tool_name = require(&body.tool_name, "toolName")?;
    let project = body.project.trim().to_string();
    if !project.is_empty() {
        validate_project(&project)?;
    }

    let components = state.service.components();
    let store = components.store.clone();
    let lookup_id = conversation_id.clone();
    let session = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<SessionRecord>> {
        match store.get_session_by_content_id(&lookup_id)? {
            Some(session) => Ok(Some(session)),
            None if !project.is_empty() => store.create_or_get_session(&lookup_id, &project).map(Some),
            None => Ok(None),
        }
    })
    .await??
    .ok_or_else(|| {
        ApiError::BadRequest(format!(
            "unknown conversation {conversation_id}; project is required to start one"
        ))
    })?;

    if session.status == SessionStatus::Skipped {
        return Ok(Json(json!({ "status": "skipped", "reason": "private" })));
    }

    let queued = components.sessions.queue_observation(
        session.id,
        ObservationMessage {
            tool_name,
            tool_input: body.tool_input,
            tool_output: body.tool_output,
            cwd: body.cwd,
        },
    );
    if !queued {
        return Err(ApiError::NotReady);
    }
    Ok(Json(json!({ "status": "queued", "sessionDbId": session.id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentCompleteBody {
    #[serde(alias = "contentSessionId", alias = "conversationID")]
    pub conversation_id: String,
    #[serde(default)]
    pub project: String,
}

pub async fn subagent_complete(
    State(state): State<AppState>,
    Json(body): Json<SubagentCompleteBody>,
) -> Result<Json<Value>, ApiError> {
    let conversation_id = require(&body.conversation_id, "conversationId")?;
    let store = state.service.components().store.clone();
    let session = tokio::task::spawn_blocking(move || {
        store.get_session_by_content_id(&conversation_id)
    })
    .await??
    .ok_or_else(|| ApiError::NotFound("unknown conversation".into()))?;

    let processed = state
        .service
        .queue()
        .process_now(&state.service, session.id)
        .await;
    Ok(Json(json!({ "status": "processed", "processed": processed })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeBody {
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
}

pub async fn queue_summarize(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<SummarizeBody>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let components = state.service.components();
    let store = components.store.clone();
    let persisted = tokio::task::spawn_blocking(move || store.get_session(id)).await??;
    if persisted.is_some_and(|s| s.status == SessionStatus::Skipped) {
        return Ok(Json(json!({ "status": "skipped", "reason": "private" })));
    }

    let queued = components.sessions.queue_summarize(
        id,
        body.last_user_message,
        body.last_assistant_message,
    );
    if !queued {
        return Err(ApiError::NotReady);
    }
    Ok(Json(json!({ "status": "queued" })))
}

// ── Context ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub query: String,
    pub cwd: Option<String>,
    pub limit: Option<usize>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let response = state
        .service
        .retriever()
        .search(SearchRequest {
            project: params.project,
            query: params.query,
            cwd: params.cwd,
            limit: params.limit,
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct InjectParams {
    #[serde(default)]
    pub project: String,
    pub cwd: Option<String>,
    pub limit: Option<usize>,
}

pub async fn inject(
    State(state): State<AppState>,
    Query(params): Query<InjectParams>,
) -> Result<Json<InjectResponse>, ApiError> {
    let response = state
        .service
        .retriever()
        .inject(InjectRequest {
            project: params.project,
            cwd: params.cwd,
            limit: params.limit,
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct CountParams {
    #[serde(default)]
    pub project: String,
}

pub async fn count(
    State(state): State<AppState>,
    Query(params): Query<CountParams>,
) -> Result<Json<Value>, ApiError> {
    let project = params.project.trim().to_string();
    validate_project(&project)?;
    if let Some(count) = state.counts.get(&project) {
        return Ok(Json(json!({ "project": project, "count": count, "cached": true })));
    }
    let store = state.service.components().store.clone();
    let lookup = project.clone();
    let count = tokio::task::spawn_blocking(move || store.count_observations(&lookup)).await??;
    state.counts.put(&project, count);
    Ok(Json(json!({ "project": project, "count": count, "cached": false })))
}

// ── Status ───────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let service = &state.service;
    let sessions = service.components().sessions.clone();
    Json(json!({
        "status": if service.is_ready() { "ok" } else { "initializing" },
        "ready": service.is_ready(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": service.uptime().as_secs(),
        "activeSessions": sessions.get_active_session_count(),
        "queueDepth": sessions.get_total_queue_depth(),
        "processing": sessions.is_any_session_processing(),
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "retrieval": state.service.stats().report(),
        "recentQueries": state.service.recent().snapshot(),
        "queueTicks": state.service.queue().ticks(),
    }))
}

/// Status events as Server-Sent Events. Ends when the service shuts down.
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.service.subscribe())
        .filter_map(|result| async move {
            // Lagged receivers skip what they missed.
            let event = result.ok()?;
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok(Event::default().event(event.name()).data(data)))
        })
        .take_until(state.service.token().cancelled_owned());

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_prompt_returns_same_numbers() {
        let store = Store::open_in_memory().unwrap();
        let first = record_prompt_submission(&store, "conv", "demo", "fix login", 0).unwrap();
        let second = record_prompt_submission(&store, "conv", "demo", "fix login", 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count_prompts("conv").unwrap(), 1);

        let third = record_prompt_submission(&store, "conv", "demo", "now the logout", 0).unwrap();
        assert_eq!(third.session_db_id, first.session_db_id);
        assert_eq!(third.prompt_number, 2);
    }

    #[test]
    fn private_prompt_skips_session() {
        let store = Store::open_in_memory().unwrap();
        let resp =
            record_prompt_submission(&store, "conv", "demo", "<private>api key</private>", 0)
                .unwrap();
        assert!(resp.skipped);
        assert_eq!(resp.reason.as_deref(), Some("private"));
        let session = store.get_session(resp.session_db_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Skipped);
        assert!(session.user_prompt.is_none());

        let next = record_prompt_submission(&store, "conv", "demo", "public question", 0).unwrap();
        assert!(!next.skipped);
        let session = store.get_session(next.session_db_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn private_tags_are_stripped_before_storage() {
        let store = Store::open_in_memory().unwrap();
        let resp = record_prompt_submission(
            &store,
            "conv",
            "demo",
            "deploy with <private>hunter2</private> creds",
            0,
        )
        .unwrap();
        let session = store.get_session(resp.session_db_id).unwrap().unwrap();
        assert_eq!(session.user_prompt.as_deref(), Some("deploy with  creds"));
    }
}
