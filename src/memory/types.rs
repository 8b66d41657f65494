//! Core record definitions.
//!
//! Defines [`Scope`] (visibility of an observation), [`Observation`] (a stored
//! unit of captured knowledge), [`NewObservation`] (the write-side shape),
//! [`SessionRecord`] (a persisted conversation session) and [`SessionSummary`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Visibility scope for an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Visible only to searches from the owning project.
    Project,
    /// Visible to searches from any project.
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "global" => Ok(Self::Global),
            _ => Err(format!("unknown scope: {s}")),
        }
    }
}

/// An observation record, matching the `observations` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub session_id: Option<i64>,
    pub project: String,
    pub scope: Scope,
    /// Free-form category assigned by the processor (e.g. `"change"`, `"discovery"`).
    #[serde(rename = "type")]
    pub obs_type: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub narrative: String,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files: Vec<String>,
    /// Referenced file path → modification time (ms since epoch) when recorded.
    pub file_mtimes: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_number: Option<i64>,
    /// Number of times this observation has been served by retrieval.
    pub retrieval_count: i64,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    pub created_at_epoch: i64,
    /// Relevance score assigned by the retrieval pipeline, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Observation {
    /// Text used for reranking: `title + " " + narrative`.
    pub fn rerank_text(&self) -> String {
        format!("{} {}", self.title, self.narrative)
    }

    /// Whether a search issued from `project` may see this observation.
    pub fn visible_to(&self, project: &str) -> bool {
        self.scope == Scope::Global || self.project == project
    }
}

/// Write-side shape of an observation, produced by the processor.
#[derive(Debug, Clone, Default)]
pub struct NewObservation {
    pub session_id: Option<i64>,
    pub project: String,
    pub scope: Option<Scope>,
    pub obs_type: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: String,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files: Vec<String>,
    pub file_mtimes: BTreeMap<String, i64>,
    pub prompt_number: Option<i64>,
}

/// Lifecycle status of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    /// Every prompt so far was entirely private; nothing enters the pipeline.
    Skipped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

/// A persisted conversation session, matching the `sessions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: i64,
    pub content_session_id: String,
    pub project: String,
    pub user_prompt: Option<String>,
    pub prompt_counter: i64,
    pub status: SessionStatus,
    pub created_at: String,
}

/// Structured end-of-session summary written by the processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: i64,
    pub project: String,
    pub request: Option<String>,
    pub completed: Option<String>,
    pub learned: Option<String>,
    pub next_steps: Option<String>,
}
