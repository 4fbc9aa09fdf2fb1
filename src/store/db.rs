use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::OrchestrateError;
use crate::workflow::{self, WorkflowAction};

/// Async-safe handle to the site database.
///
/// Wraps `SiteDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. The mutex also gives the
/// single-writer discipline the project store relies on: read-modify-write
/// sequences (thought-step appends) happen under one lock acquisition.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SiteDb>>,
}

impl DbHandle {
    pub fn new(db: SiteDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SiteDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Durable write with one retry before surfacing `StoreWrite`.
    ///
    /// The closure must be idempotent under retry (the store operations in
    /// this crate are: inserts happen at most once because the first failed
    /// attempt did not commit, updates are absolute assignments).
    pub async fn write<F, R>(&self, f: F) -> Result<R, OrchestrateError>
    where
        F: Fn(&SiteDb) -> Result<R> + Clone + Send + 'static,
        R: Send + 'static,
    {
        match self.call(f.clone()).await {
            Ok(value) => Ok(value),
            Err(first) => {
                tracing::warn!(error = %first, "store write failed, retrying once");
                self.call(f)
                    .await
                    .map_err(|e| OrchestrateError::StoreWrite(e.context(format!("first attempt: {first:#}"))))
            }
        }
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, SiteDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct SiteDb {
    conn: Connection,
}

impl SiteDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    lat REAL,
                    lon REAL,
                    capacity_mw REAL,
                    status TEXT NOT NULL DEFAULT 'new',
                    terrain_results TEXT,
                    layout_results TEXT,
                    simulation_results TEXT,
                    wind_rose_results TEXT,
                    report_results TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    artifacts TEXT,
                    thought_steps TEXT NOT NULL DEFAULT '[]',
                    response_complete INTEGER NOT NULL DEFAULT 0,
                    error_kind TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_projects_session ON projects(session_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(
        &self,
        session_id: &str,
        name: &str,
        lat: Option<f64>,
        lon: Option<f64>,
        capacity_mw: Option<f64>,
    ) -> Result<Project> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO projects (id, session_id, name, lat, lon, capacity_mw)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, session_id, name, lat, lon, capacity_mw],
            )
            .context("Failed to insert project")?;
        self.get_project(&id)?
            .ok_or_else(|| anyhow::anyhow!("Project vanished after insert"))
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                row_to_project,
            )
            .optional()
            .context("Failed to query project")
    }

    /// Most recently updated project for a session, if any.
    pub fn latest_project_for_session(&self, session_id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM projects WHERE session_id = ?1
                     ORDER BY updated_at DESC, created_at DESC LIMIT 1",
                    PROJECT_COLUMNS
                ),
                params![session_id],
                row_to_project,
            )
            .optional()
            .context("Failed to query latest project")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM projects ORDER BY updated_at DESC",
            PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_project)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }

    /// Merge a step result and its status transition in one statement, so
    /// the result and the new status are never observed apart.
    pub fn merge_step_result(
        &self,
        project_id: &str,
        action: WorkflowAction,
        result: &serde_json::Value,
        new_status: ProjectStatus,
    ) -> Result<Project> {
        let column = workflow::result_column(action)
            .ok_or_else(|| anyhow::anyhow!("{} has no result column", action.as_str()))?;
        let changed = self
            .conn
            .execute(
                // Column name comes from the static workflow table, never
                // from user input.
                &format!(
                    "UPDATE projects SET {column} = ?1, status = ?2,
                     updated_at = datetime('now') WHERE id = ?3"
                ),
                params![result.to_string(), new_status.as_str(), project_id],
            )
            .context("Failed to merge step result")?;
        if changed == 0 {
            anyhow::bail!("Project {} not found during merge", project_id);
        }
        self.get_project(project_id)?
            .ok_or_else(|| anyhow::anyhow!("Project vanished after merge"))
    }

    // ── Message log ───────────────────────────────────────────────────

    /// Append a turn to the session's log. Returns the new message id.
    pub fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        response_complete: bool,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO messages (session_id, role, content, response_complete)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, role.as_str(), content, response_complete],
            )
            .context("Failed to append message")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id],
                row_to_message,
            )
            .optional()
            .context("Failed to query message")
    }

    /// Newest ai/ai_stream turn in a session. What the polling controller
    /// compares each tick.
    pub fn latest_ai_message(&self, session_id: &str) -> Result<Option<Message>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages
                     WHERE session_id = ?1 AND role IN ('ai', 'ai_stream')
                     ORDER BY id DESC LIMIT 1",
                    MESSAGE_COLUMNS
                ),
                params![session_id],
                row_to_message,
            )
            .optional()
            .context("Failed to query latest ai message")
    }

    pub fn messages_since(&self, session_id: &str, after_id: i64) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM messages WHERE session_id = ?1 AND id > ?2 ORDER BY id",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_id, after_id], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Append one thought step to an in-flight turn.
    ///
    /// Read-modify-write on the JSON column; exclusion is provided by the
    /// `DbHandle` mutex (all writers go through it).
    pub fn push_thought_step(&self, message_id: i64, step: &ThoughtStep) -> Result<()> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT thought_steps FROM messages WHERE id = ?1 AND response_complete = 0",
                params![message_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read thought steps")?;
        let raw = raw.ok_or_else(|| {
            anyhow::anyhow!("Message {} is not an open turn", message_id)
        })?;
        let mut steps: Vec<ThoughtStep> =
            serde_json::from_str(&raw).context("Corrupt thought_steps column")?;
        steps.push(step.clone());
        self.conn
            .execute(
                "UPDATE messages SET thought_steps = ?1 WHERE id = ?2",
                params![serde_json::to_string(&steps)?, message_id],
            )
            .context("Failed to write thought steps")?;
        Ok(())
    }

    /// Finalize a turn exactly once. Returns false if the turn was already
    /// complete (the guard against duplicate terminal writes).
    pub fn finalize_message(
        &self,
        message_id: i64,
        content: &str,
        artifacts: Option<&serde_json::Value>,
        error_kind: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE messages SET content = ?1, artifacts = ?2, error_kind = ?3,
                 response_complete = 1
                 WHERE id = ?4 AND response_complete = 0",
                params![
                    content,
                    artifacts.map(|a| a.to_string()),
                    error_kind,
                    message_id
                ],
            )
            .context("Failed to finalize message")?;
        Ok(changed == 1)
    }

    /// Incomplete ai turns in a session other than `keep`. Used to enforce
    /// the one-open-turn-per-session invariant at dispatch.
    pub fn open_ai_messages(&self, session_id: &str, keep: Option<i64>) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM messages
             WHERE session_id = ?1 AND role IN ('ai', 'ai_stream')
               AND response_complete = 0 AND id != ?2",
        )?;
        let rows = stmt.query_map(params![session_id, keep.unwrap_or(-1)], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Incomplete ai turns older than the given bound, for the sweeper.
    pub fn stale_incomplete_messages(&self, older_than_secs: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM messages
             WHERE role IN ('ai', 'ai_stream') AND response_complete = 0
               AND created_at < datetime('now', ?1)",
        )?;
        let modifier = format!("-{} seconds", older_than_secs);
        let rows = stmt.query_map(params![modifier], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    #[cfg(test)]
    pub(crate) fn backdate_message(&self, id: i64, modifier: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE messages SET created_at = datetime('now', ?1) WHERE id = ?2",
            params![modifier, id],
        )?;
        Ok(())
    }
}

const PROJECT_COLUMNS: &str = "id, session_id, name, lat, lon, capacity_mw, status, \
     terrain_results, layout_results, simulation_results, wind_rose_results, \
     report_results, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, session_id, role, content, artifacts, thought_steps, response_complete, \
     error_kind, created_at";

fn parse_json_column(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let status: String = row.get(6)?;
    Ok(Project {
        id: row.get(0)?,
        session_id: row.get(1)?,
        name: row.get(2)?,
        lat: row.get(3)?,
        lon: row.get(4)?,
        capacity_mw: row.get(5)?,
        status: ProjectStatus::from_str(&status).unwrap_or(ProjectStatus::New),
        terrain_results: parse_json_column(row.get(7)?),
        layout_results: parse_json_column(row.get(8)?),
        simulation_results: parse_json_column(row.get(9)?),
        wind_rose_results: parse_json_column(row.get(10)?),
        report_results: parse_json_column(row.get(11)?),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let steps_raw: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::from_str(&role).unwrap_or(MessageRole::Ai),
        content: row.get(3)?,
        artifacts: parse_json_column(row.get(4)?),
        thought_steps: serde_json::from_str(&steps_raw).unwrap_or_default(),
        response_complete: row.get(6)?,
        error_kind: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> SiteDb {
        SiteDb::new_in_memory().unwrap()
    }

    #[test]
    fn create_and_fetch_project() {
        let db = db();
        let project = db
            .create_project("s1", "Ridge North", Some(40.7128), Some(-74.006), Some(30.0))
            .unwrap();
        assert_eq!(project.status, ProjectStatus::New);
        assert_eq!(project.lat, Some(40.7128));

        let fetched = db.get_project(&project.id).unwrap().unwrap();
        assert_eq!(fetched.name, "Ridge North");
        assert!(db.get_project("nope").unwrap().is_none());
    }

    #[test]
    fn latest_project_prefers_most_recently_updated() {
        let db = db();
        let first = db.create_project("s1", "A", None, None, None).unwrap();
        let _second = db.create_project("s1", "B", None, None, None).unwrap();
        let _other = db.create_project("s2", "C", None, None, None).unwrap();

        // Merging into the first project bumps updated_at.
        db.conn
            .execute(
                "UPDATE projects SET updated_at = datetime('now', '+1 hour') WHERE id = ?1",
                params![first.id],
            )
            .unwrap();
        let latest = db.latest_project_for_session("s1").unwrap().unwrap();
        assert_eq!(latest.name, "A");
        assert!(db.latest_project_for_session("s3").unwrap().is_none());
    }

    #[test]
    fn merge_sets_result_and_status_together() {
        let db = db();
        let project = db.create_project("s1", "A", None, None, None).unwrap();
        let result = serde_json::json!({"usable_area_km2": 14.2});
        let merged = db
            .merge_step_result(
                &project.id,
                WorkflowAction::Terrain,
                &result,
                ProjectStatus::TerrainDone,
            )
            .unwrap();
        assert_eq!(merged.status, ProjectStatus::TerrainDone);
        assert_eq!(merged.terrain_results.unwrap(), result);
        assert!(merged.layout_results.is_none());
    }

    #[test]
    fn merge_into_missing_project_fails() {
        let db = db();
        let err = db
            .merge_step_result(
                "ghost",
                WorkflowAction::Terrain,
                &serde_json::json!({}),
                ProjectStatus::TerrainDone,
            )
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn message_log_is_ordered_and_filterable() {
        let db = db();
        let u1 = db
            .append_message("s1", MessageRole::User, "analyze terrain", true)
            .unwrap();
        let a1 = db
            .append_message("s1", MessageRole::AiStream, "", false)
            .unwrap();
        assert!(a1 > u1);

        let since = db.messages_since("s1", u1).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, a1);

        let latest = db.latest_ai_message("s1").unwrap().unwrap();
        assert_eq!(latest.id, a1);
        assert!(!latest.response_complete);
    }

    #[test]
    fn thought_steps_append_in_order() {
        let db = db();
        let id = db
            .append_message("s1", MessageRole::AiStream, "", false)
            .unwrap();
        db.push_thought_step(id, &ThoughtStep::new("Understanding request", None))
            .unwrap();
        db.push_thought_step(
            id,
            &ThoughtStep::new("Dispatching terrain analysis", Some("radius 5km".into())),
        )
        .unwrap();

        let msg = db.get_message(id).unwrap().unwrap();
        assert_eq!(msg.thought_steps.len(), 2);
        assert_eq!(msg.thought_steps[0].label, "Understanding request");
        assert_eq!(msg.thought_steps[1].detail.as_deref(), Some("radius 5km"));
    }

    #[test]
    fn thought_step_on_finalized_turn_is_rejected() {
        let db = db();
        let id = db
            .append_message("s1", MessageRole::AiStream, "", false)
            .unwrap();
        db.finalize_message(id, "done", None, None).unwrap();
        let err = db
            .push_thought_step(id, &ThoughtStep::new("late", None))
            .unwrap_err();
        assert!(err.to_string().contains("not an open turn"));
    }

    #[test]
    fn finalize_is_exactly_once() {
        let db = db();
        let id = db
            .append_message("s1", MessageRole::AiStream, "", false)
            .unwrap();
        let artifact = serde_json::json!({"action": "terrain"});
        assert!(db.finalize_message(id, "done", Some(&artifact), None).unwrap());
        // Second finalization is a no-op.
        assert!(!db
            .finalize_message(id, "other", None, Some("task_runner_failure"))
            .unwrap());

        let msg = db.get_message(id).unwrap().unwrap();
        assert!(msg.response_complete);
        assert_eq!(msg.content, "done");
        assert_eq!(msg.artifacts.unwrap(), artifact);
        assert!(msg.error_kind.is_none());
    }

    #[test]
    fn open_ai_messages_excludes_kept_id() {
        let db = db();
        let stale = db
            .append_message("s1", MessageRole::AiStream, "", false)
            .unwrap();
        let current = db
            .append_message("s1", MessageRole::AiStream, "", false)
            .unwrap();
        let open = db.open_ai_messages("s1", Some(current)).unwrap();
        assert_eq!(open, vec![stale]);
    }

    #[test]
    fn stale_query_ignores_fresh_turns() {
        let db = db();
        let id = db
            .append_message("s1", MessageRole::AiStream, "", false)
            .unwrap();
        assert!(db.stale_incomplete_messages(60).unwrap().is_empty());

        db.conn
            .execute(
                "UPDATE messages SET created_at = datetime('now', '-20 minutes') WHERE id = ?1",
                params![id],
            )
            .unwrap();
        assert_eq!(db.stale_incomplete_messages(600).unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn handle_write_retries_once() {
        // A closure that fails on the first call and succeeds on the second.
        use std::sync::atomic::{AtomicU32, Ordering};
        let handle = DbHandle::new(SiteDb::new_in_memory().unwrap());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = handle
            .write(move |db| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient");
                }
                db.append_message("s1", MessageRole::User, "hi", true)
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handle_write_surfaces_store_failure() {
        let handle = DbHandle::new(SiteDb::new_in_memory().unwrap());
        let result: Result<(), OrchestrateError> =
            handle.write(|_db| anyhow::bail!("disk full")).await;
        match result {
            Err(OrchestrateError::StoreWrite(_)) => {}
            other => panic!("Expected StoreWrite, got {:?}", other.err()),
        }
    }
}
