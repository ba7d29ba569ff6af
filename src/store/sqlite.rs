//! SQLite-backed run store.
//!
//! One row per run. Payloads and the step log are stored as JSON text,
//! timestamps as RFC 3339 text. The correlation-key uniqueness constraints
//! live in the schema so a re-delivered trigger cannot create a second run.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::{RunStore, StoreError};
use crate::domain::{NewRun, RunStatus, WorkflowRun};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_runs (
    id               TEXT PRIMARY KEY,
    workflow_name    TEXT NOT NULL,
    status           TEXT NOT NULL,
    input_data       TEXT,
    output_data      TEXT,
    error_message    TEXT,
    steps            TEXT NOT NULL DEFAULT '[]',
    started_at       TEXT,
    finished_at      TEXT,
    slack_message_id TEXT NOT NULL,
    slack_channel_id TEXT NOT NULL,
    slack_thread_ts  TEXT,
    template_id      TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    UNIQUE (slack_channel_id, slack_message_id),
    UNIQUE (slack_channel_id, slack_thread_ts)
);
CREATE INDEX IF NOT EXISTS idx_workflow_runs_status
    ON workflow_runs (status, created_at);
"#;

const COLUMNS: &str = "id, workflow_name, status, input_data, output_data, error_message, steps, \
     started_at, finished_at, slack_message_id, slack_channel_id, slack_thread_ts, template_id, \
     created_at, updated_at";

/// How long a statement waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run store on a single SQLite connection.
///
/// Statements run on tokio's blocking pool, one at a time: the connection
/// mutex serializes every run's reads and writes, so a statement waiting out
/// `BUSY_TIMEOUT` delays other runs' persistence but never a runtime worker.
pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Fresh in-memory database
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to apply workflow_runs schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `work` against the connection on the blocking pool
    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            work(&guard)
        })
        .await?
    }
}

fn insert(conn: &Connection, run: &WorkflowRun) -> Result<(), StoreError> {
    let result = conn.execute(
        &format!(
            "INSERT INTO workflow_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            COLUMNS
        ),
        params![
            run.id.to_string(),
            run.workflow_name,
            run.status.as_str(),
            json_opt(&run.input_data)?,
            json_opt(&run.output_data)?,
            run.error_message,
            serde_json::to_string(&run.steps)?,
            run.started_at.map(ts),
            run.finished_at.map(ts),
            run.slack_message_id,
            run.slack_channel_id,
            run.slack_thread_ts,
            run.template_id,
            ts(run.created_at),
            ts(run.updated_at),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(duplicate_or(e, run)),
    }
}

/// Map a UNIQUE violation onto [`StoreError::Duplicate`]
fn duplicate_or(err: rusqlite::Error, run: &WorkflowRun) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation && message.contains("UNIQUE") {
            let (key, value) = if message.contains("slack_thread_ts") {
                ("thread_ts", run.slack_thread_ts.clone().unwrap_or_default())
            } else {
                ("message", run.slack_message_id.clone())
            };
            return StoreError::Duplicate {
                channel_id: run.slack_channel_id.clone(),
                key,
                value,
            };
        }
    }
    StoreError::Database(err)
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn json_opt(value: &Option<serde_json::Value>) -> Result<Option<String>, StoreError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

/// Row as stored, before parsing
struct RawRun {
    id: String,
    workflow_name: String,
    status: String,
    input_data: Option<String>,
    output_data: Option<String>,
    error_message: Option<String>,
    steps: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    slack_message_id: String,
    slack_channel_id: String,
    slack_thread_ts: Option<String>,
    template_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_name: row.get(1)?,
            status: row.get(2)?,
            input_data: row.get(3)?,
            output_data: row.get(4)?,
            error_message: row.get(5)?,
            steps: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
            slack_message_id: row.get(9)?,
            slack_channel_id: row.get(10)?,
            slack_thread_ts: row.get(11)?,
            template_id: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, StoreError> {
        let id = self.id.clone();
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.clone(),
            reason,
        };
        let parse_ts = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp '{}': {}", s, e)))
        };

        Ok(WorkflowRun {
            id: Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?,
            workflow_name: self.workflow_name,
            status: self.status.parse::<RunStatus>().map_err(corrupt)?,
            input_data: self.input_data.as_deref().map(serde_json::from_str).transpose()?,
            output_data: self.output_data.as_deref().map(serde_json::from_str).transpose()?,
            error_message: self.error_message,
            steps: serde_json::from_str(&self.steps)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            slack_message_id: self.slack_message_id,
            slack_channel_id: self.slack_channel_id,
            slack_thread_ts: self.slack_thread_ts,
            template_id: self.template_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError> {
        let run = WorkflowRun::new(Uuid::new_v4(), new_run);
        let run = self
            .blocking(move |conn| {
                insert(conn, &run)?;
                Ok(run)
            })
            .await?;
        debug!(workflow_run_id = %run.id, "Created workflow run");
        Ok(run)
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        self.blocking(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM workflow_runs WHERE id = ?1", COLUMNS),
                    params![id.to_string()],
                    RawRun::from_row,
                )
                .optional()?;
            raw.map(RawRun::into_run).transpose()
        })
        .await
    }

    async fn update(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let run = run.clone();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE workflow_runs SET
                    status = ?2, input_data = ?3, output_data = ?4, error_message = ?5, steps = ?6,
                    started_at = ?7, finished_at = ?8, template_id = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    run.id.to_string(),
                    run.status.as_str(),
                    json_opt(&run.input_data)?,
                    json_opt(&run.output_data)?,
                    run.error_message,
                    serde_json::to_string(&run.steps)?,
                    run.started_at.map(ts),
                    run.finished_at.map(ts),
                    run.template_id,
                    ts(run.updated_at),
                ],
            )?;

            if changed == 0 {
                return Err(StoreError::NotFound(run.id));
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<WorkflowRun>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM workflow_runs ORDER BY created_at DESC LIMIT ?1",
                COLUMNS
            ))?;
            let raws = stmt
                .query_map(params![limit as i64], RawRun::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            raws.into_iter().map(RawRun::into_run).collect()
        })
        .await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM workflow_runs WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1",
            )?;
            let ids = stmt
                .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            ids.into_iter()
                .map(|id| {
                    Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt {
                        id: id.clone(),
                        reason: e.to_string(),
                    })
                })
                .collect()
        })
        .await
    }
}
