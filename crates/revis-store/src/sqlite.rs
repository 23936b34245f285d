// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQLite-backed store.
//!
//! Uses [`rusqlite`] for synchronous access, bridged to async via
//! [`tokio::task::spawn_blocking`].  WAL journal mode keeps readers cheap;
//! every mutation commits before the call returns so a killed process never
//! loses acknowledged state.
//!
//! # Schema evolution
//!
//! The base schema is created with `CREATE TABLE IF NOT EXISTS`.  On open,
//! `migrate` inspects `PRAGMA table_info` and adds any column a newer build
//! knows about that an existing database lacks, with a backfill for required
//! fields.  Columns are never dropped or renamed.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::types::{
    short_id, ActionType, Artifact, Budget, BudgetKind, ChangeType, Decision, Metric, Run,
    RunOutcome, RunStatus, Session, SessionStatus, Suggestion, SuggestionStatus,
    TerminationReason, TraceEvent,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a session named '{0}' already exists")]
    NameExists(String),
    #[error("another session is already running (id {0})")]
    SessionRunning(String),
    #[error("cannot delete running session '{0}' (use --force)")]
    DeleteRunning(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("store lock poisoned: {0}")]
    Lock(String),
    #[error("blocking task failed: {0}")]
    Task(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id                 TEXT PRIMARY KEY,
    name               TEXT,
    branch             TEXT NOT NULL,
    base_sha           TEXT NOT NULL,
    baseline_run_id    TEXT,
    status             TEXT NOT NULL DEFAULT 'running',
    termination_reason TEXT,
    started_at         TEXT NOT NULL,
    ended_at           TEXT,
    budget_type        TEXT NOT NULL,
    budget_value       INTEGER NOT NULL,
    budget_used        INTEGER NOT NULL DEFAULT 0,
    iteration_count    INTEGER NOT NULL DEFAULT 0,
    llm_cost_usd       REAL NOT NULL DEFAULT 0.0,
    retry_budget       INTEGER NOT NULL DEFAULT 3,
    pr_url             TEXT,
    exported_at        TEXT,
    pid                INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_name ON sessions(name);

CREATE TABLE IF NOT EXISTS runs (
    id                 TEXT PRIMARY KEY,
    session_id         TEXT NOT NULL REFERENCES sessions(id),
    iteration_number   INTEGER NOT NULL,
    config_json        TEXT NOT NULL,
    git_sha            TEXT,
    status             TEXT NOT NULL DEFAULT 'pending',
    started_at         TEXT,
    ended_at           TEXT,
    exit_code          INTEGER,
    change_type        TEXT,
    change_description TEXT,
    diff               TEXT,
    hypothesis         TEXT,
    outcome            TEXT,
    analysis           TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id);

CREATE TABLE IF NOT EXISTS metrics (
    run_id    TEXT NOT NULL REFERENCES runs(id),
    name      TEXT NOT NULL,
    value     REAL NOT NULL,
    step      INTEGER,
    logged_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_run ON metrics(run_id);

CREATE TABLE IF NOT EXISTS artifacts (
    id          TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL REFERENCES runs(id),
    kind        TEXT NOT NULL,
    path        TEXT NOT NULL,
    size_bytes  INTEGER,
    uploaded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decisions (
    id          TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL REFERENCES runs(id),
    action_type TEXT NOT NULL,
    rationale   TEXT NOT NULL,
    commit_sha  TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS suggestions (
    id            TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL REFERENCES sessions(id),
    run_id        TEXT,
    content       TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'pending',
    handoff_agent TEXT,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS traces (
    id         TEXT PRIMARY KEY,
    run_id     TEXT NOT NULL REFERENCES runs(id),
    timestamp  TEXT NOT NULL,
    event_type TEXT NOT NULL,
    data_json  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_traces_run ON traces(run_id);
";

/// The durable store.  Cloneable: all handles share one connection.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and apply migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("creating store dir: {e}")))?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Ephemeral in-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(BASE_SCHEMA)?;
        migrate(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Bridge a synchronous closure onto the tokio blocking thread pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| StoreError::Lock(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    /// Create a session.
    ///
    /// Fails with [`StoreError::NameExists`] when the name was ever used and
    /// with [`StoreError::SessionRunning`] when another session currently
    /// holds running status — at most one session runs per repository.
    pub async fn create_session(
        &self,
        name: &str,
        branch: &str,
        base_sha: &str,
        budget: Budget,
        baseline_run_id: Option<&str>,
    ) -> Result<String> {
        let name = name.to_string();
        let branch = branch.to_string();
        let base_sha = base_sha.to_string();
        let baseline = baseline_run_id.map(str::to_string);
        let pid = std::process::id() as i64;
        self.blocking(move |conn| {
            if let Some(running_id) = conn
                .query_row(
                    "SELECT id FROM sessions WHERE status = 'running' LIMIT 1",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
            {
                return Err(StoreError::SessionRunning(running_id));
            }
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM sessions WHERE name = ?1", params![name], |r| {
                    r.get(0)
                })
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::NameExists(name));
            }

            let id = short_id();
            conn.execute(
                "INSERT INTO sessions (
                     id, name, branch, base_sha, baseline_run_id, status,
                     started_at, budget_type, budget_value, budget_used,
                     retry_budget, pid
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7, ?8, 0, 3, ?9)",
                params![
                    id,
                    name,
                    branch,
                    base_sha,
                    baseline,
                    Utc::now().to_rfc3339(),
                    budget.kind.as_str(),
                    budget.value,
                    pid
                ],
            )?;
            debug!(session = %id, "created session");
            Ok(id)
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let id = session_id.to_string();
        self.blocking(move |conn| {
            conn.query_row("SELECT * FROM sessions WHERE id = ?1", params![id], row_to_session)
                .optional()
                .map_err(Into::into)
        })
        .await
    }

    pub async fn get_session_by_name(&self, name: &str) -> Result<Option<Session>> {
        let name = name.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT * FROM sessions WHERE name = ?1",
                params![name],
                row_to_session,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn get_running_session(&self) -> Result<Option<Session>> {
        self.blocking(|conn| {
            conn.query_row(
                "SELECT * FROM sessions WHERE status = 'running' \
                 ORDER BY started_at DESC LIMIT 1",
                [],
                row_to_session,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn session_name_exists(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let row: Option<i64> = conn
                .query_row("SELECT 1 FROM sessions WHERE name = ?1 LIMIT 1", params![name], |r| {
                    r.get(0)
                })
                .optional()?;
            Ok(row.is_some())
        })
        .await
    }

    /// Sessions newest first, optionally filtered by status.
    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<Session>> {
        self.blocking(move |conn| {
            let mut out = Vec::new();
            match status {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sessions WHERE status = ?1 \
                         ORDER BY started_at DESC LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![s.as_str(), limit as i64], row_to_session)?;
                    for r in rows {
                        out.push(r?);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM sessions ORDER BY started_at DESC LIMIT ?1")?;
                    let rows = stmt.query_map(params![limit as i64], row_to_session)?;
                    for r in rows {
                        out.push(r?);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    /// Sessions marked running whose holder process no longer exists.
    pub async fn get_orphaned_sessions(&self) -> Result<Vec<Session>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM sessions WHERE status = 'running'")?;
            let rows = stmt.query_map([], row_to_session)?;
            let mut orphaned = Vec::new();
            for r in rows {
                let session = r?;
                match session.pid {
                    Some(pid) if !process_exists(pid) => orphaned.push(session),
                    _ => {}
                }
            }
            Ok(orphaned)
        })
        .await
    }

    /// Put a non-running session back into running state for resume: clears
    /// termination fields and records the new holder process.  Refuses when
    /// a different session currently holds running status.
    pub async fn reopen_session(&self, session_id: &str) -> Result<()> {
        let id = session_id.to_string();
        let pid = std::process::id() as i64;
        self.blocking(move |conn| {
            if let Some(running_id) = conn
                .query_row(
                    "SELECT id FROM sessions WHERE status = 'running' AND id != ?1 LIMIT 1",
                    params![&id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
            {
                return Err(StoreError::SessionRunning(running_id));
            }
            conn.execute(
                "UPDATE sessions \
                 SET status = 'running', termination_reason = NULL, ended_at = NULL, pid = ?1 \
                 WHERE id = ?2",
                params![pid, id],
            )?;
            Ok(())
        })
        .await
    }

    /// Terminate a session: status derives from the reason, end time is now.
    pub async fn end_session(
        &self,
        session_id: &str,
        reason: TerminationReason,
        pr_url: Option<&str>,
    ) -> Result<()> {
        let id = session_id.to_string();
        let pr_url = pr_url.map(str::to_string);
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE sessions \
                 SET status = ?1, termination_reason = ?2, pr_url = ?3, ended_at = ?4 \
                 WHERE id = ?5",
                params![
                    reason.final_status().as_str(),
                    reason.as_str(),
                    pr_url,
                    Utc::now().to_rfc3339(),
                    id
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a session and everything it owns.  Running sessions require
    /// `force`.
    pub async fn delete_session(&self, session_id: &str, force: bool) -> Result<bool> {
        let id = session_id.to_string();
        self.blocking(move |conn| {
            let session = match conn
                .query_row("SELECT * FROM sessions WHERE id = ?1", params![&id], row_to_session)
                .optional()?
            {
                Some(s) => s,
                None => return Ok(false),
            };
            if session.status == SessionStatus::Running && !force {
                return Err(StoreError::DeleteRunning(session.name));
            }

            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM traces WHERE run_id IN (SELECT id FROM runs WHERE session_id = ?1)",
                params![&id],
            )?;
            tx.execute(
                "DELETE FROM decisions WHERE run_id IN (SELECT id FROM runs WHERE session_id = ?1)",
                params![&id],
            )?;
            tx.execute(
                "DELETE FROM artifacts WHERE run_id IN (SELECT id FROM runs WHERE session_id = ?1)",
                params![&id],
            )?;
            tx.execute(
                "DELETE FROM metrics WHERE run_id IN (SELECT id FROM runs WHERE session_id = ?1)",
                params![&id],
            )?;
            tx.execute("DELETE FROM suggestions WHERE session_id = ?1", params![&id])?;
            tx.execute("DELETE FROM runs WHERE session_id = ?1", params![&id])?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![&id])?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    pub async fn mark_session_exported(
        &self,
        session_id: &str,
        pr_url: Option<&str>,
    ) -> Result<()> {
        let id = session_id.to_string();
        let pr_url = pr_url.map(str::to_string);
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE sessions SET exported_at = ?1, pr_url = ?2 WHERE id = ?3",
                params![Utc::now().to_rfc3339(), pr_url, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_session_budget(&self, session_id: &str, budget_used: i64) -> Result<()> {
        let id = session_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE sessions SET budget_used = ?1 WHERE id = ?2",
                params![budget_used, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_session_cost(&self, session_id: &str, cost_usd: f64) -> Result<()> {
        let id = session_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE sessions SET llm_cost_usd = ?1 WHERE id = ?2",
                params![cost_usd, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_session_retry_budget(
        &self,
        session_id: &str,
        retry_budget: i64,
    ) -> Result<()> {
        let id = session_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE sessions SET retry_budget = ?1 WHERE id = ?2",
                params![retry_budget, id],
            )?;
            Ok(())
        })
        .await
    }

    /// Atomically bump the iteration counter; returns the new value.
    pub async fn increment_iteration(&self, session_id: &str) -> Result<i64> {
        let id = session_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE sessions SET iteration_count = iteration_count + 1 WHERE id = ?1",
                params![&id],
            )?;
            let count: i64 = conn.query_row(
                "SELECT iteration_count FROM sessions WHERE id = ?1",
                params![&id],
                |r| r.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    // ─── Runs ────────────────────────────────────────────────────────────────

    pub async fn create_run(
        &self,
        session_id: &str,
        config_json: &str,
        iteration: i64,
    ) -> Result<String> {
        let sid = session_id.to_string();
        let config_json = config_json.to_string();
        self.blocking(move |conn| {
            let id = short_id();
            conn.execute(
                "INSERT INTO runs (id, session_id, iteration_number, config_json, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
                params![id, sid, iteration, config_json, Utc::now().to_rfc3339()],
            )?;
            Ok(id)
        })
        .await
    }

    /// Update run status; terminal states also stamp the end time.
    pub async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let id = run_id.to_string();
        self.blocking(move |conn| {
            if matches!(status, RunStatus::Completed | RunStatus::Failed) {
                conn.execute(
                    "UPDATE runs SET status = ?1, ended_at = ?2 WHERE id = ?3",
                    params![status.as_str(), Utc::now().to_rfc3339(), id],
                )?;
            } else {
                conn.execute(
                    "UPDATE runs SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), id],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn set_run_commit(&self, run_id: &str, sha: &str) -> Result<()> {
        let id = run_id.to_string();
        let sha = sha.to_string();
        self.blocking(move |conn| {
            conn.execute("UPDATE runs SET git_sha = ?1 WHERE id = ?2", params![sha, id])?;
            Ok(())
        })
        .await
    }

    pub async fn set_run_exit_code(&self, run_id: &str, exit_code: i64) -> Result<()> {
        let id = run_id.to_string();
        self.blocking(move |conn| {
            conn.execute("UPDATE runs SET exit_code = ?1 WHERE id = ?2", params![exit_code, id])?;
            Ok(())
        })
        .await
    }

    pub async fn set_run_outcome(&self, run_id: &str, outcome: RunOutcome) -> Result<()> {
        let id = run_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE runs SET outcome = ?1 WHERE id = ?2",
                params![outcome.as_str(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_run_change(
        &self,
        run_id: &str,
        change_type: ChangeType,
        change_description: Option<&str>,
        hypothesis: Option<&str>,
        diff: Option<&str>,
    ) -> Result<()> {
        let id = run_id.to_string();
        let description = change_description.map(str::to_string);
        let hypothesis = hypothesis.map(str::to_string);
        let diff = diff.map(str::to_string);
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE runs SET change_type = ?1, change_description = ?2, \
                 hypothesis = ?3, diff = ?4 WHERE id = ?5",
                params![change_type.as_str(), description, hypothesis, diff, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_run_analysis(&self, run_id: &str, analysis: &str) -> Result<()> {
        let id = run_id.to_string();
        let analysis = analysis.to_string();
        self.blocking(move |conn| {
            conn.execute("UPDATE runs SET analysis = ?1 WHERE id = ?2", params![analysis, id])?;
            Ok(())
        })
        .await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let id = run_id.to_string();
        self.blocking(move |conn| {
            conn.query_row("SELECT * FROM runs WHERE id = ?1", params![id], row_to_run)
                .optional()
                .map_err(Into::into)
        })
        .await
    }

    /// Runs of a session, newest iteration first.
    pub async fn query_runs(&self, session_id: &str, limit: usize) -> Result<Vec<Run>> {
        let sid = session_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM runs WHERE session_id = ?1 \
                 ORDER BY iteration_number DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![sid, limit as i64], row_to_run)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn get_baseline_run(&self, session_id: &str) -> Result<Option<Run>> {
        let session = match self.get_session(session_id).await? {
            Some(s) => s,
            None => return Ok(None),
        };
        match session.baseline_run_id {
            Some(run_id) => self.get_run(&run_id).await,
            None => Ok(None),
        }
    }

    // ─── Metrics / artifacts ─────────────────────────────────────────────────

    pub async fn log_metrics(
        &self,
        run_id: &str,
        metrics: &std::collections::HashMap<String, f64>,
        step: Option<i64>,
    ) -> Result<()> {
        let id = run_id.to_string();
        let metrics: Vec<(String, f64)> =
            metrics.iter().map(|(k, v)| (k.clone(), *v)).collect();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO metrics (run_id, name, value, step, logged_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                let now = Utc::now().to_rfc3339();
                for (name, value) in &metrics {
                    stmt.execute(params![id, name, value, step, now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_run_metrics(&self, run_id: &str) -> Result<Vec<Metric>> {
        let id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, value, step, logged_at FROM metrics \
                 WHERE run_id = ?1 ORDER BY logged_at",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (name, value, step, logged_at) = r?;
                out.push(Metric { name, value, step, logged_at: parse_ts(&logged_at)? });
            }
            Ok(out)
        })
        .await
    }

    pub async fn log_artifact(
        &self,
        run_id: &str,
        kind: &str,
        path: &str,
        size_bytes: Option<i64>,
    ) -> Result<String> {
        let run_id = run_id.to_string();
        let kind = kind.to_string();
        let path = path.to_string();
        self.blocking(move |conn| {
            let id = short_id();
            conn.execute(
                "INSERT INTO artifacts (id, run_id, kind, path, size_bytes, uploaded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, run_id, kind, path, size_bytes, Utc::now().to_rfc3339()],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn get_run_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM artifacts WHERE run_id = ?1")?;
            let rows = stmt.query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>("id")?,
                    row.get::<_, String>("run_id")?,
                    row.get::<_, String>("kind")?,
                    row.get::<_, String>("path")?,
                    row.get::<_, Option<i64>>("size_bytes")?,
                    row.get::<_, String>("uploaded_at")?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (id, run_id, kind, path, size_bytes, uploaded_at) = r?;
                out.push(Artifact {
                    id,
                    run_id,
                    kind,
                    path,
                    size_bytes,
                    uploaded_at: parse_ts(&uploaded_at)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // ─── Decisions ───────────────────────────────────────────────────────────

    pub async fn attach_decision(&self, run_id: &str, decision: Decision) -> Result<String> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let id = short_id();
            conn.execute(
                "INSERT INTO decisions (id, run_id, action_type, rationale, commit_sha, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    run_id,
                    decision.action_type.as_str(),
                    decision.rationale,
                    decision.commit_sha,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn get_decisions(&self, run_id: &str) -> Result<Vec<Decision>> {
        let id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT action_type, rationale, commit_sha FROM decisions \
                 WHERE run_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (action, rationale, commit_sha) = r?;
                let action_type = ActionType::parse(&action)
                    .ok_or_else(|| StoreError::Corrupt(format!("action_type '{action}'")))?;
                out.push(Decision { action_type, rationale, commit_sha });
            }
            Ok(out)
        })
        .await
    }

    // ─── Suggestions ─────────────────────────────────────────────────────────

    pub async fn create_suggestion(
        &self,
        session_id: &str,
        run_id: Option<&str>,
        content: &str,
    ) -> Result<String> {
        let session_id = session_id.to_string();
        let run_id = run_id.map(str::to_string);
        let content = content.to_string();
        self.blocking(move |conn| {
            let id = short_id();
            conn.execute(
                "INSERT INTO suggestions (id, session_id, run_id, content, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![id, session_id, run_id, content, Utc::now().to_rfc3339()],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn update_suggestion_status(
        &self,
        suggestion_id: &str,
        status: SuggestionStatus,
        handoff_agent: Option<&str>,
    ) -> Result<()> {
        let id = suggestion_id.to_string();
        let agent = handoff_agent.map(str::to_string);
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE suggestions SET status = ?1, handoff_agent = ?2 WHERE id = ?3",
                params![status.as_str(), agent, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_suggestions(&self, session_id: &str) -> Result<Vec<Suggestion>> {
        let sid = session_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM suggestions WHERE session_id = ?1 ORDER BY created_at")?;
            let rows = stmt.query_map(params![sid], |row| {
                Ok((
                    row.get::<_, String>("id")?,
                    row.get::<_, String>("session_id")?,
                    row.get::<_, Option<String>>("run_id")?,
                    row.get::<_, String>("content")?,
                    row.get::<_, String>("status")?,
                    row.get::<_, Option<String>>("handoff_agent")?,
                    row.get::<_, String>("created_at")?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (id, session_id, run_id, content, status, handoff_agent, created_at) = r?;
                let status = SuggestionStatus::parse(&status)
                    .ok_or_else(|| StoreError::Corrupt(format!("suggestion status '{status}'")))?;
                out.push(Suggestion {
                    id,
                    session_id,
                    run_id,
                    content,
                    status,
                    handoff_agent,
                    created_at: parse_ts(&created_at)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // ─── Traces ──────────────────────────────────────────────────────────────

    pub async fn log_trace(
        &self,
        run_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let run_id = run_id.to_string();
        let event_type = event_type.to_string();
        let data_json = serde_json::to_string(&data)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO traces (id, run_id, timestamp, event_type, data_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![short_id(), run_id, Utc::now().to_rfc3339(), event_type, data_json],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_traces(&self, run_id: &str) -> Result<Vec<TraceEvent>> {
        let id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, event_type, data_json FROM traces \
                 WHERE run_id = ?1 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (timestamp, event_type, data_json) = r?;
                out.push(TraceEvent {
                    timestamp,
                    event_type,
                    data: serde_json::from_str(&data_json)?,
                });
            }
            Ok(out)
        })
        .await
    }
}

/// Add columns/tables a newer build knows about to an older database.
fn migrate(conn: &Connection) -> Result<()> {
    let session_cols = table_columns(conn, "sessions")?;
    if !session_cols.iter().any(|c| c == "name") {
        conn.execute_batch(
            "ALTER TABLE sessions ADD COLUMN name TEXT;\
             UPDATE sessions SET name = 'session-' || id WHERE name IS NULL;",
        )?;
        conn.execute_batch("CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_name ON sessions(name)")?;
    }
    if !session_cols.iter().any(|c| c == "exported_at") {
        conn.execute_batch("ALTER TABLE sessions ADD COLUMN exported_at TEXT")?;
    }
    if !session_cols.iter().any(|c| c == "pid") {
        conn.execute_batch("ALTER TABLE sessions ADD COLUMN pid INTEGER")?;
    }

    let run_cols = table_columns(conn, "runs")?;
    for col in ["change_type", "change_description", "diff", "hypothesis", "outcome", "analysis"] {
        if !run_cols.iter().any(|c| c == col) {
            conn.execute_batch(&format!("ALTER TABLE runs ADD COLUMN {col} TEXT"))?;
        }
    }

    // Trace table arrived after the first release.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS traces (
             id         TEXT PRIMARY KEY,
             run_id     TEXT NOT NULL REFERENCES runs(id),
             timestamp  TEXT NOT NULL,
             event_type TEXT NOT NULL,
             data_json  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_traces_run ON traces(run_id);",
    )?;
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut cols = Vec::new();
    for r in rows {
        cols.push(r?);
    }
    Ok(cols)
}

/// Check whether a process is alive (signal 0 probe).
fn process_exists(pid: i64) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, StoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Legacy rows written by sqlite's datetime('now').
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{s}': {e}")))
}

fn opt_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    match raw {
        Some(s) => match parse_ts(&s) {
            Ok(dt) => Ok(Some(dt)),
            Err(_) => Ok(None),
        },
        None => Ok(None),
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status_raw: String = row.get("status")?;
    let reason_raw: Option<String> = row.get("termination_reason")?;
    let budget_kind_raw: String = row.get("budget_type")?;
    let started_raw: String = row.get("started_at")?;
    Ok(Session {
        id: row.get("id")?,
        name: row.get("name")?,
        branch: row.get("branch")?,
        base_sha: row.get("base_sha")?,
        baseline_run_id: row.get("baseline_run_id")?,
        status: SessionStatus::parse(&status_raw).unwrap_or(SessionStatus::Failed),
        termination_reason: reason_raw.as_deref().and_then(TerminationReason::parse),
        started_at: parse_ts(&started_raw).unwrap_or_else(|_| Utc::now()),
        ended_at: opt_ts(row, "ended_at")?,
        budget: Budget {
            kind: BudgetKind::parse(&budget_kind_raw).unwrap_or(BudgetKind::Runs),
            value: row.get("budget_value")?,
            used: row.get("budget_used")?,
        },
        iteration_count: row.get("iteration_count")?,
        pr_url: row.get("pr_url")?,
        llm_cost_usd: row.get("llm_cost_usd")?,
        retry_budget: row.get("retry_budget")?,
        exported_at: opt_ts(row, "exported_at")?,
        pid: row.get("pid")?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status_raw: String = row.get("status")?;
    let change_raw: Option<String> = row.get("change_type")?;
    let outcome_raw: Option<String> = row.get("outcome")?;
    Ok(Run {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        iteration_number: row.get("iteration_number")?,
        config_json: row.get("config_json")?,
        git_sha: row.get("git_sha")?,
        status: RunStatus::parse(&status_raw).unwrap_or(RunStatus::Failed),
        started_at: opt_ts(row, "started_at")?,
        ended_at: opt_ts(row, "ended_at")?,
        exit_code: row.get("exit_code")?,
        change_type: change_raw.as_deref().and_then(ChangeType::parse),
        change_description: row.get("change_description")?,
        diff: row.get("diff")?,
        hypothesis: row.get("hypothesis")?,
        outcome: outcome_raw.as_deref().and_then(RunOutcome::parse),
        analysis: row.get("analysis")?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
