//! The sole durable authority for tasks, runs, and settings.
//!
//! Single-writer discipline: one `rusqlite::Connection` behind a `Mutex`, driven
//! from async callers via `spawn_blocking` so the scheduler/executor never block
//! the tokio runtime on disk I/O. Schema migrations are additive and idempotent,
//! following the `add_column_if_missing` pattern used for SQLite schema evolution
//! in the wider pack (cron job stores that persist to a single `*.db` file).

pub mod types;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{AgentSchedError, Result};
pub use types::*;

#[derive(Clone)]
pub struct Store {
    conn: Arc<AsyncMutex<Connection>>,
}

const DEFAULT_USAGE_THRESHOLD: &str = "80";

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .expect("store open task panicked")?;

        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            f(&guard)
        })
        .await
        .expect("store task panicked")
    }

    // ---------------- Tasks ----------------

    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        validate_new_task(&new)?;
        self.with_conn(move |conn| {
            let now = Utc::now();
            let working_dir = new.working_dir.unwrap_or_else(|| ".".to_string());
            let webhooks = serde_json::to_string(&new.webhook_urls).unwrap_or_default();
            conn.execute(
                "INSERT INTO tasks (
                    name, prompt, working_dir, webhook_urls, cron_expr, scheduled_at,
                    enabled, created_at, updated_at, last_run_at, next_run_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL)",
                params![
                    new.name,
                    new.prompt,
                    working_dir,
                    webhooks,
                    new.cron_expr,
                    new.scheduled_at.map(|t| t.to_rfc3339()),
                    new.enabled as i64,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            get_task_sync(conn, id)
        })
        .await
    }

    pub async fn get_task(&self, id: i64) -> Result<Task> {
        self.with_conn(move |conn| get_task_sync(conn, id)).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_TASK} ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AgentSchedError::from)
        })
        .await
    }

    pub async fn list_enabled_tasks(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_TASK} WHERE enabled = 1 ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AgentSchedError::from)
        })
        .await
    }

    /// Full update: refreshes `updated_at`. Fails with `NotFound` if the id is unknown.
    pub async fn update_task(&self, task: Task) -> Result<Task> {
        validate_task(&task)?;
        self.with_conn(move |conn| {
            let webhooks = serde_json::to_string(&task.webhook_urls).unwrap_or_default();
            let now = Utc::now();
            let changed = conn.execute(
                "UPDATE tasks SET name=?1, prompt=?2, working_dir=?3, webhook_urls=?4,
                    cron_expr=?5, scheduled_at=?6, enabled=?7, updated_at=?8
                 WHERE id=?9",
                params![
                    task.name,
                    task.prompt,
                    task.working_dir,
                    webhooks,
                    task.cron_expr,
                    task.scheduled_at.map(|t| t.to_rfc3339()),
                    task.enabled as i64,
                    now.to_rfc3339(),
                    task.id,
                ],
            )?;
            if changed == 0 {
                return Err(AgentSchedError::not_found("task", task.id));
            }
            get_task_sync(conn, task.id)
        })
        .await
    }

    /// Flips `enabled`; returns the new value. Fails with `NotFound` if unknown.
    pub async fn toggle_task(&self, id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let task = get_task_sync(conn, id)?;
            let new_enabled = !task.enabled;
            conn.execute(
                "UPDATE tasks SET enabled=?1, updated_at=?2 WHERE id=?3",
                params![new_enabled as i64, Utc::now().to_rfc3339(), id],
            )?;
            Ok(new_enabled)
        })
        .await
    }

    pub async fn delete_task(&self, id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM tasks WHERE id=?1", params![id])?;
            if changed == 0 {
                return Err(AgentSchedError::not_found("task", id));
            }
            Ok(())
        })
        .await
    }

    /// Owned by the executor: called once a run finishes, never by the scheduler.
    pub async fn update_last_run_at(&self, task_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tasks SET last_run_at=?1 WHERE id=?2",
                params![at.to_rfc3339(), task_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Owned by the scheduler: recomputed whenever a task is (re)scheduled.
    pub async fn update_next_run_at(&self, task_id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tasks SET next_run_at=?1 WHERE id=?2",
                params![at.map(|t| t.to_rfc3339()), task_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn disable_task(&self, task_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tasks SET enabled=0, next_run_at=NULL, updated_at=?1 WHERE id=?2",
                params![Utc::now().to_rfc3339(), task_id],
            )?;
            Ok(())
        })
        .await
    }

    // ---------------- Runs ----------------

    /// Requires the caller to hand back a `Running` row; the Store just inserts it.
    pub async fn create_run(&self, new: NewRun) -> Result<Run> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_runs (task_id, started_at, ended_at, status, output, error)
                 VALUES (?1, ?2, NULL, 'running', '', '')",
                params![new.task_id, new.started_at.to_rfc3339()],
            )?;
            let id = conn.last_insert_rowid();
            get_run_sync(conn, id)
        })
        .await
    }

    /// Persists ended_at/status/output/error. Callers (the executor) are
    /// responsible for only ever moving a run forward toward a terminal status.
    pub async fn update_run(&self, run: Run) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE task_runs SET ended_at=?1, status=?2, output=?3, error=?4 WHERE id=?5",
                params![
                    run.ended_at.map(|t| t.to_rfc3339()),
                    run.status.as_str(),
                    run.output,
                    run.error,
                    run.id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn append_run_output(&self, run_id: i64, output: &str) -> Result<()> {
        let output = output.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE task_runs SET output=?1 WHERE id=?2",
                params![output, run_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_run(&self, id: i64) -> Result<Run> {
        self.with_conn(move |conn| get_run_sync(conn, id)).await
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<Run>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_RUN} ORDER BY started_at DESC LIMIT ?1"))?;
            let rows = stmt.query_map(params![limit], row_to_run)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AgentSchedError::from)
        })
        .await
    }

    pub async fn list_runs_for_task(&self, task_id: i64, limit: i64) -> Result<Vec<Run>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_RUN} WHERE task_id=?1 ORDER BY started_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![task_id, limit], row_to_run)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AgentSchedError::from)
        })
        .await
    }

    /// `lastStatusPerTask`: single-row join of the latest Run per Task.
    pub async fn last_status_per_task(&self) -> Result<std::collections::HashMap<i64, Run>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_RUN} WHERE id IN (
                    SELECT MAX(id) FROM task_runs GROUP BY task_id
                 )"
            ))?;
            let rows = stmt.query_map([], row_to_run)?;
            let mut map = std::collections::HashMap::new();
            for row in rows {
                let run = row?;
                map.insert(run.task_id, run);
            }
            Ok(map)
        })
        .await
    }

    /// Transitions every `running` row to `failed` with the stranded-run reason,
    /// returning the affected count. Called once at startup, before the
    /// scheduler resumes, to clean up runs orphaned by a prior crash.
    pub async fn mark_stranded_running(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE task_runs SET status='failed', error=?1, ended_at=?2 WHERE status='running'",
                params!["server restarted during execution", now],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    // ---------------- Settings ----------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key=?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(AgentSchedError::from)
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn usage_threshold(&self) -> Result<f64> {
        let raw = self
            .get_setting("usage_threshold")
            .await?
            .unwrap_or_else(|| DEFAULT_USAGE_THRESHOLD.to_string());
        Ok(raw.parse().unwrap_or(80.0))
    }
}

const SELECT_TASK: &str = "SELECT id, name, prompt, working_dir, webhook_urls, cron_expr,
    scheduled_at, enabled, created_at, updated_at, last_run_at, next_run_at FROM tasks";

const SELECT_RUN: &str =
    "SELECT id, task_id, started_at, ended_at, status, output, error FROM task_runs";

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let webhooks_raw: String = row.get(4)?;
    let scheduled_at: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let last_run_at: Option<String> = row.get(10)?;
    let next_run_at: Option<String> = row.get(11)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        prompt: row.get(2)?,
        working_dir: row.get(3)?,
        webhook_urls: serde_json::from_str(&webhooks_raw).unwrap_or_default(),
        cron_expr: row.get(5)?,
        scheduled_at: scheduled_at.and_then(|s| parse_rfc3339(&s)),
        enabled: row.get::<_, i64>(7)? != 0,
        created_at: parse_rfc3339(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_rfc3339(&updated_at).unwrap_or_else(Utc::now),
        last_run_at: last_run_at.and_then(|s| parse_rfc3339(&s)),
        next_run_at: next_run_at.and_then(|s| parse_rfc3339(&s)),
    })
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let started_at: String = row.get(2)?;
    let ended_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(Run {
        id: row.get(0)?,
        task_id: row.get(1)?,
        started_at: parse_rfc3339(&started_at).unwrap_or_else(Utc::now),
        ended_at: ended_at.and_then(|s| parse_rfc3339(&s)),
        status: RunStatus::parse(&status),
        output: row.get(5)?,
        error: row.get(6)?,
    })
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn get_task_sync(conn: &Connection, id: i64) -> Result<Task> {
    conn.query_row(&format!("{SELECT_TASK} WHERE id=?1"), params![id], row_to_task)
        .optional()?
        .ok_or_else(|| AgentSchedError::not_found("task", id))
}

fn get_run_sync(conn: &Connection, id: i64) -> Result<Run> {
    conn.query_row(&format!("{SELECT_RUN} WHERE id=?1"), params![id], row_to_run)
        .optional()?
        .ok_or_else(|| AgentSchedError::not_found("run", id))
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE IF NOT EXISTS tasks (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            name          TEXT NOT NULL DEFAULT '',
            prompt        TEXT NOT NULL DEFAULT '',
            working_dir   TEXT NOT NULL DEFAULT '.',
            webhook_urls  TEXT NOT NULL DEFAULT '[]',
            cron_expr     TEXT NOT NULL DEFAULT '',
            scheduled_at  TEXT,
            enabled       INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            last_run_at   TEXT,
            next_run_at   TEXT
         );

         CREATE TABLE IF NOT EXISTS task_runs (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id    INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            ended_at   TEXT,
            status     TEXT NOT NULL DEFAULT 'pending',
            output     TEXT NOT NULL DEFAULT '',
            error      TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
         );
         CREATE INDEX IF NOT EXISTS idx_task_runs_task_id ON task_runs(task_id);
         CREATE INDEX IF NOT EXISTS idx_task_runs_started_at ON task_runs(started_at);

         CREATE TABLE IF NOT EXISTS settings (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
         );",
    )?;
    Ok(())
}

#[cfg(test)]
mod store_tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_task() {
        let s = store().await;
        let t = s
            .create_task(NewTask {
                name: "t1".into(),
                prompt: "echo hi".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(t.working_dir, ".");
        let fetched = s.get_task(t.id).await.unwrap();
        assert_eq!(fetched.name, "t1");
    }

    #[tokio::test]
    async fn toggle_is_idempotent_round_trip() {
        let s = store().await;
        let t = s
            .create_task(NewTask {
                name: "t".into(),
                prompt: "p".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();
        let after_1 = s.toggle_task(t.id).await.unwrap();
        let after_2 = s.toggle_task(t.id).await.unwrap();
        assert_ne!(after_1, after_2);
        assert_eq!(after_2, t.enabled);
    }

    #[tokio::test]
    async fn delete_task_cascades_to_runs() {
        let s = store().await;
        let t = s
            .create_task(NewTask {
                name: "t".into(),
                prompt: "p".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();
        s.create_run(NewRun {
            task_id: t.id,
            started_at: Utc::now(),
        })
        .await
        .unwrap();
        s.delete_task(t.id).await.unwrap();
        let runs = s.list_runs_for_task(t.id, 10).await.unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn mark_stranded_running_transitions_to_failed() {
        let s = store().await;
        let t = s
            .create_task(NewTask {
                name: "t".into(),
                prompt: "p".into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap();
        let run = s
            .create_run(NewRun {
                task_id: t.id,
                started_at: Utc::now() - chrono::Duration::hours(1),
            })
            .await
            .unwrap();
        let affected = s.mark_stranded_running().await.unwrap();
        assert_eq!(affected, 1);
        let reloaded = s.get_run(run.id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Failed);
        assert!(reloaded.error.contains("restart"));
        assert!(reloaded.ended_at.is_some());
    }

    #[tokio::test]
    async fn usage_threshold_defaults_to_80() {
        let s = store().await;
        assert_eq!(s.usage_threshold().await.unwrap(), 80.0);
        s.set_setting("usage_threshold", "42.5").await.unwrap();
        assert_eq!(s.usage_threshold().await.unwrap(), 42.5);
    }
}
