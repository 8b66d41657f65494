//! SQLite-backed observation store.
//!
//! [`Store`] owns the single connection behind a mutex and exposes the narrow
//! interface the rest of the daemon consumes: observation CRUD, full-text and
//! ID-batch lookups, recency listings, retrieval bookkeeping and summaries.
//! Session and prompt persistence lives in [`super::sessions`].
//!
//! All methods are synchronous. Async callers go through
//! `tokio::task::spawn_blocking`.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{NewObservation, Observation, Scope, SessionSummary};
use crate::db;

const OBS_COLUMNS: &str = "o.id, o.session_id, o.project, o.scope, o.obs_type, o.title, \
     o.subtitle, o.narrative, o.facts, o.concepts, o.files, o.file_mtimes, o.prompt_number, \
     o.retrieval_count, o.created_at, o.created_at_epoch";

/// The persistent observation store.
pub struct Store {
    conn: Mutex<Option<Connection>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store at `path`, running schema init and migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = db::open_database(path)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = db::open_memory_database()?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
        })
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// Fails once the store has been closed.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| anyhow!("store lock poisoned: {e}"))?;
        let conn = guard.as_mut().ok_or_else(|| anyhow!("store is closed"))?;
        f(conn)
    }

    /// Close the underlying connection. Later calls fail with "store is closed".
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| anyhow!("store lock poisoned: {e}"))?;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| anyhow!("failed to close database: {e}"))?;
            tracing::info!(path = ?self.path, "store closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    // ── Observations ─────────────────────────────────────────────────────────

    /// Insert a new observation. Returns the stored record.
    pub fn insert_observation(&self, new: &NewObservation) -> Result<Observation> {
        let id = uuid::Uuid::now_v7().to_string();
        let now = chrono::Utc::now();
        let scope = new.scope.unwrap_or(Scope::Project);

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO observations (id, session_id, project, scope, obs_type, title, subtitle, \
                 narrative, facts, concepts, files, file_mtimes, prompt_number, created_at, created_at_epoch) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    id,
                    new.session_id,
                    new.project,
                    scope.as_str(),
                    new.obs_type,
                    new.title,
                    new.subtitle,
                    new.narrative,
                    serde_json::to_string(&new.facts)?,
                    serde_json::to_string(&new.concepts)?,
                    serde_json::to_string(&new.files)?,
                    serde_json::to_string(&new.file_mtimes)?,
                    new.prompt_number,
                    now.to_rfc3339(),
                    now.timestamp_millis(),
                ],
            )
            .context("failed to insert observation")?;
            Ok(())
        })?;

        self.get_observation(&id)?
            .ok_or_else(|| anyhow!("observation vanished after insert: {id}"))
    }

    /// Fetch one observation by ID.
    pub fn get_observation(&self, id: &str) -> Result<Option<Observation>> {
        self.with_conn(|conn| {
            let obs = conn
                .query_row(
                    &format!("SELECT {OBS_COLUMNS} FROM observations o WHERE o.id = ?1"),
                    params![id],
                    row_to_observation,
                )
                .optional()?;
            Ok(obs)
        })
    }

    /// Batch-fetch observations by ID, newest first, capped at `limit`.
    pub fn get_observations_by_ids(&self, ids: &[String], limit: usize) -> Result<Vec<Observation>> {
        if ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "SELECT {OBS_COLUMNS} FROM observations o WHERE o.id IN ({}) \
                 ORDER BY o.created_at_epoch DESC, o.rowid DESC LIMIT {}",
                placeholders.join(", "),
                limit
            );
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
            let rows = stmt
                .query_map(params.as_slice(), row_to_observation)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// The `limit` most recent observations visible to `project`.
    pub fn recent_observations(&self, project: &str, limit: usize) -> Result<Vec<Observation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OBS_COLUMNS} FROM observations o \
                 WHERE o.project = ?1 OR o.scope = 'global' \
                 ORDER BY o.created_at_epoch DESC, o.rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![project, limit as i64], row_to_observation)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// FTS5 BM25 search over title/narrative/facts/concepts, restricted to
    /// observations visible to `project`. Best match first.
    pub fn search_fts(&self, project: &str, query: &str, limit: usize) -> Result<Vec<Observation>> {
        let escaped = escape_fts_query(query);
        if escaped.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OBS_COLUMNS} FROM observations_fts \
                 JOIN observations o ON o.rowid = observations_fts.rowid \
                 WHERE observations_fts MATCH ?1 AND (o.project = ?2 OR o.scope = 'global') \
                 ORDER BY observations_fts.rank LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![escaped, project, limit as i64], row_to_observation)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of observations visible to `project`.
    pub fn count_observations(&self, project: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM observations WHERE project = ?1 OR scope = 'global'",
                params![project],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Permanently delete an observation (the FTS index follows via trigger).
    /// Returns `false` if it did not exist.
    pub fn delete_observation(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM observations WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })
    }

    /// Bump `retrieval_count` and `last_retrieved_at` for served observations.
    pub fn increment_retrieval_counts(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE observations SET retrieval_count = retrieval_count + 1, \
                     last_retrieved_at = ?1 WHERE id = ?2",
                )?;
                for id in ids {
                    stmt.execute(params![now, id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Replace the recorded file modification times of an observation.
    pub fn refresh_file_mtimes(&self, id: &str, mtimes: &BTreeMap<String, i64>) -> Result<()> {
        let json = serde_json::to_string(mtimes)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE observations SET file_mtimes = ?1 WHERE id = ?2",
                params![json, id],
            )?;
            Ok(())
        })
    }

    // ── Summaries ────────────────────────────────────────────────────────────

    /// Store an end-of-session summary. Returns its row id.
    pub fn insert_summary(&self, summary: &SessionSummary) -> Result<i64> {
        let now = chrono::Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_summaries (session_id, project, request, completed, learned, \
                 next_steps, created_at, created_at_epoch) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    summary.session_id,
                    summary.project,
                    summary.request,
                    summary.completed,
                    summary.learned,
                    summary.next_steps,
                    now.to_rfc3339(),
                    now.timestamp_millis(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent summary for a session, if one was written.
    pub fn latest_summary(&self, session_id: i64) -> Result<Option<SessionSummary>> {
        self.with_conn(|conn| {
            let summary = conn
                .query_row(
                    "SELECT session_id, project, request, completed, learned, next_steps \
                     FROM session_summaries WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![session_id],
                    |row| {
                        Ok(SessionSummary {
                            session_id: row.get(0)?,
                            project: row.get(1)?,
                            request: row.get(2)?,
                            completed: row.get(3)?,
                            learned: row.get(4)?,
                            next_steps: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(summary)
        })
    }
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let scope: String = row.get(3)?;
    let facts: String = row.get(8)?;
    let concepts: String = row.get(9)?;
    let files: String = row.get(10)?;
    let mtimes: String = row.get(11)?;
    Ok(Observation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        project: row.get(2)?,
        scope: scope.parse().unwrap_or(Scope::Project),
        obs_type: row.get(4)?,
        title: row.get(5)?,
        subtitle: row.get(6)?,
        narrative: row.get(7)?,
        facts: serde_json::from_str(&facts).unwrap_or_default(),
        concepts: serde_json::from_str(&concepts).unwrap_or_default(),
        files: serde_json::from_str(&files).unwrap_or_default(),
        file_mtimes: serde_json::from_str(&mtimes).unwrap_or_default(),
        prompt_number: row.get(12)?,
        retrieval_count: row.get(13)?,
        created_at: row.get(14)?,
        created_at_epoch: row.get(15)?,
        score: None,
    })
}

/// Escape a free-text query for FTS5 MATCH syntax.
///
/// Each whitespace-delimited word is quoted and the terms are OR-ed, so a long
/// prompt still matches observations that share only some of its words.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}
