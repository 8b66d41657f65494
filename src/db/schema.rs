//! SQL DDL for all memoria tables.
//!
//! Defines `sessions`, `user_prompts`, `observations`, `observations_fts` (FTS5),
//! `observations_vec` (vec0), `session_summaries` and `schema_meta`. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Conversation sessions, keyed by the assistant's conversation id
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id TEXT NOT NULL UNIQUE,
    project TEXT NOT NULL,
    user_prompt TEXT,
    prompt_counter INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','completed','skipped')),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);

-- Every prompt submitted in a session
CREATE TABLE IF NOT EXISTS user_prompts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    content_session_id TEXT NOT NULL,
    prompt_number INTEGER NOT NULL,
    prompt_text TEXT NOT NULL,
    is_private INTEGER NOT NULL DEFAULT 0,
    matched_observations INTEGER NOT NULL DEFAULT 0,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prompts_content_session ON user_prompts(content_session_id, created_at_epoch);

-- Observations
CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    session_id INTEGER,
    project TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'project' CHECK(scope IN ('project','global')),
    obs_type TEXT NOT NULL DEFAULT 'change',
    title TEXT NOT NULL,
    subtitle TEXT,
    narrative TEXT NOT NULL DEFAULT '',
    facts TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files TEXT NOT NULL DEFAULT '[]',
    file_mtimes TEXT NOT NULL DEFAULT '{}',
    prompt_number INTEGER,
    retrieval_count INTEGER NOT NULL DEFAULT 0,
    last_retrieved_at TEXT,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_observations_project ON observations(project, created_at_epoch);
CREATE INDEX IF NOT EXISTS idx_observations_scope ON observations(scope);

-- Full-text search over the observation text fields
CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title,
    narrative,
    facts,
    concepts,
    id UNINDEXED,
    content='observations',
    content_rowid='rowid'
);

-- End-of-session summaries
CREATE TABLE IF NOT EXISTS session_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    project TEXT NOT NULL,
    request TEXT,
    completed TEXT,
    learned TEXT,
    next_steps TEXT,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summaries_project ON session_summaries(project, created_at_epoch);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS observations_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "sessions",
            "user_prompts",
            "observations",
            "observations_fts",
            "observations_vec",
            "session_summaries",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn scope_check_rejects_unknown_values() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let err = conn.execute(
            "INSERT INTO observations (id, project, scope, title, created_at, created_at_epoch) \
             VALUES ('x', 'p', 'team', 't', '2026-01-01', 0)",
            [],
        );
        assert!(err.is_err());
    }
}
