//! Session and prompt persistence.
//!
//! Sessions are created on the first prompt of a conversation and looked up by
//! the assistant's conversation id. Every prompt is recorded with its sequence
//! number; [`Store::find_recent_prompt`] backs the duplicate-submission window.

use anyhow::{anyhow, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::time::Duration;

use super::store::Store;
use super::types::{SessionRecord, SessionStatus};

const SESSION_COLUMNS: &str =
    "id, content_session_id, project, user_prompt, prompt_counter, status, created_at";

/// A prompt that was just recorded (or recognised as a duplicate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptRef {
    pub session_id: i64,
    pub prompt_number: i64,
}

impl Store {
    /// Return the session for `content_session_id`, creating it if needed.
    ///
    /// An existing session keeps its original project.
    pub fn create_or_get_session(
        &self,
        content_session_id: &str,
        project: &str,
    ) -> Result<SessionRecord> {
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sessions (content_session_id, project, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![content_session_id, project, now],
            )?;
            let session = conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE content_session_id = ?1"),
                params![content_session_id],
                row_to_session,
            )?;
            Ok(session)
        })
    }

    pub fn get_session(&self, id: i64) -> Result<Option<SessionRecord>> {
        self.with_conn(|conn| {
            let session = conn
                .query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                    params![id],
                    row_to_session,
                )
                .optional()?;
            Ok(session)
        })
    }

    pub fn get_session_by_content_id(&self, content_session_id: &str) -> Result<Option<SessionRecord>> {
        self.with_conn(|conn| {
            let session = conn
                .query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE content_session_id = ?1"),
                    params![content_session_id],
                    row_to_session,
                )
                .optional()?;
            Ok(session)
        })
    }

    pub fn set_session_status(&self, id: i64, status: SessionStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
            Ok(())
        })
    }

    /// Find a prompt with identical text submitted for the same conversation
    /// within `window`.
    pub fn find_recent_prompt(
        &self,
        content_session_id: &str,
        prompt_text: &str,
        window: Duration,
    ) -> Result<Option<PromptRef>> {
        let cutoff = chrono::Utc::now().timestamp_millis() - window.as_millis() as i64;
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT session_id, prompt_number FROM user_prompts \
                     WHERE content_session_id = ?1 AND prompt_text = ?2 AND created_at_epoch >= ?3 \
                     ORDER BY id DESC LIMIT 1",
                    params![content_session_id, prompt_text, cutoff],
                    |row| {
                        Ok(PromptRef {
                            session_id: row.get(0)?,
                            prompt_number: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(found)
        })
    }

    /// Record a prompt for a session, assigning the next prompt number.
    ///
    /// The first non-private prompt also becomes the session's `user_prompt`.
    pub fn record_prompt(
        &self,
        session_id: i64,
        prompt_text: &str,
        is_private: bool,
        matched_observations: i64,
    ) -> Result<PromptRef> {
        let now = chrono::Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let (content_session_id, counter): (String, i64) = tx
                .query_row(
                    "SELECT content_session_id, prompt_counter FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| anyhow!("session not found: {session_id}"))?;
            let prompt_number = counter + 1;

            tx.execute(
                "UPDATE sessions SET prompt_counter = ?1 WHERE id = ?2",
                params![prompt_number, session_id],
            )?;
            if !is_private {
                tx.execute(
                    "UPDATE sessions SET user_prompt = COALESCE(user_prompt, ?1) WHERE id = ?2",
                    params![prompt_text, session_id],
                )?;
            }
            tx.execute(
                "INSERT INTO user_prompts (session_id, content_session_id, prompt_number, prompt_text, \
                 is_private, matched_observations, created_at_epoch) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session_id,
                    content_session_id,
                    prompt_number,
                    prompt_text,
                    is_private,
                    matched_observations,
                    now
                ],
            )?;
            tx.commit()?;

            Ok(PromptRef {
                session_id,
                prompt_number,
            })
        })
    }

    /// Number of prompts stored for a conversation.
    pub fn count_prompts(&self, content_session_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_prompts WHERE content_session_id = ?1",
                params![content_session_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(5)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        content_session_id: row.get(1)?,
        project: row.get(2)?,
        user_prompt: row.get(3)?,
        prompt_counter: row.get(4)?,
        status: status.parse().unwrap_or(SessionStatus::Active),
        created_at: row.get(6)?,
    })
}
