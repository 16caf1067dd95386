//! SQLite state store for durable, versioned workflow state
//!
//! Every persisted mutation of a workflow bumps its `version` and appends an
//! immutable snapshot of the full [`WorkflowState`] to the history table, so
//! any earlier version can be restored with [`StateStore::rollback_workflow`].
//!
//! # Database Schema
//!
//! 1. **workflow_states** - one row per workflow (status, timestamps, variables, metadata, version)
//! 2. **task_states** - one row per task, replaced wholesale on every workflow write
//! 3. **workflow_state_history** - append-only JSON snapshots keyed by `(workflow_id, version)`
//! 4. **schema_version** - database schema version for migrations
//!
//! Writes that touch a workflow row and its task rows run in one transaction.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use agent_orchestrator::state_store::{StateStore, TaskUpdate};
//! use agent_orchestrator_sdk::{TaskDefinition, TaskState, TaskStatus};
//! use std::collections::HashMap;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = StateStore::new("/tmp/agent-orchestrator/workflows.db")?;
//!
//! let task = TaskState::from_definition(&TaskDefinition::new("fetch", "http"));
//! let state = store.create_workflow(None, vec![task], HashMap::new())?;
//! assert_eq!(state.version, 1);
//!
//! let state = store.update_task(&state.workflow_id, "fetch", TaskUpdate::status(TaskStatus::Running))?;
//! assert_eq!(state.version, 2);
//!
//! // Restore the freshly created state
//! let restored = store.rollback_workflow(&state.workflow_id, 1)?;
//! assert_eq!(restored.tasks["fetch"].status, TaskStatus::Pending);
//! # Ok(())
//! # }
//! ```

use agent_orchestrator_sdk::{
    TaskError, TaskState, TaskStatus, WorkflowState, WorkflowStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("workflow `{0}` not found")]
    NotFound(String),

    #[error("task `{task_id}` not found in workflow `{workflow_id}`")]
    TaskNotFound { workflow_id: String, task_id: String },

    #[error("no snapshot of workflow `{workflow_id}` at version {version}")]
    VersionNotFound { workflow_id: String, version: i64 },

    #[error("workflow `{0}` already exists")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

/// Partial update of one task. Fields left as `None` are untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub execution_time: Option<f64>,
    pub retry_count: Option<u32>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: TaskError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = Some(seconds);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Apply to a task, maintaining the timestamp and result/error rules:
    /// `started_at` is set on the first move to RUNNING, `completed_at` on
    /// entering a terminal status, a COMPLETED task carries no error and a
    /// FAILED task carries no result.
    pub fn apply(self, task: &mut TaskState) {
        let now = Utc::now();

        if let Some(status) = self.status {
            if status == TaskStatus::Running && task.started_at.is_none() {
                task.started_at = Some(now);
            }
            if status.is_terminal() && !task.status.is_terminal() {
                task.completed_at = Some(now);
            }
            match status {
                TaskStatus::Completed => task.error = None,
                TaskStatus::Failed => task.result = None,
                _ => {}
            }
            task.status = status;
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        if let Some(seconds) = self.execution_time {
            task.execution_time = Some(seconds);
        }
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count;
        }
    }
}

/// One row of a workflow's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Workflow counts per status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Durable, versioned store for workflow and task state
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the database at `path` and initialize its schema
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets readers proceed while a write transaction is open
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        info!(path = %path.display(), "opened state store");
        Ok(store)
    }

    /// In-memory database, used by tests and throwaway runs
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateStoreError::LockPoisoned)
    }

    /// Create all tables and indexes if they do not exist yet
    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_states (
                workflow_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,

                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,

                -- JSON objects
                variables TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',

                error TEXT,
                version INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_workflow_states_status ON workflow_states(status);
            CREATE INDEX IF NOT EXISTS idx_workflow_states_updated_at ON workflow_states(updated_at DESC);
            "#,
        )?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS task_states (
                workflow_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                execution_time REAL,

                -- JSON values
                result TEXT,
                error TEXT,

                retry_count INTEGER NOT NULL DEFAULT 0,
                dependencies TEXT NOT NULL DEFAULT '[]',

                PRIMARY KEY (workflow_id, task_id),
                FOREIGN KEY(workflow_id) REFERENCES workflow_states(workflow_id) ON DELETE CASCADE
            );
            "#,
        )?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_state_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                state_snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL,

                UNIQUE(workflow_id, version)
            );

            CREATE INDEX IF NOT EXISTS idx_history_workflow_id ON workflow_state_history(workflow_id, version);
            "#,
        )?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;

        Ok(())
    }

    /// Get current schema version
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        let version: i32 =
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Insert a new PENDING workflow at version 1 with its tasks and first snapshot
    pub fn create_workflow(
        &self,
        workflow_id: Option<String>,
        tasks: Vec<TaskState>,
        metadata: HashMap<String, Value>,
    ) -> Result<WorkflowState> {
        let workflow_id = workflow_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = WorkflowState::new(workflow_id, tasks);
        state.metadata = metadata;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT version FROM workflow_states WHERE workflow_id = ?1",
                params![state.workflow_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StateStoreError::AlreadyExists(state.workflow_id));
        }

        insert_workflow_row(&tx, &state)?;
        replace_task_rows(&tx, &state)?;
        append_history(&tx, &state)?;
        tx.commit()?;

        info!(
            workflow_id = %state.workflow_id,
            tasks = state.tasks.len(),
            "created workflow"
        );
        Ok(state)
    }

    /// Load a workflow with all of its tasks
    pub fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        let conn = self.lock()?;
        load_workflow(&conn, workflow_id)
    }

    /// Persist `state` as the new current version of its workflow.
    ///
    /// The stored version is bumped from whatever is currently persisted, so
    /// a caller holding an older copy overwrites the row (last writer wins)
    /// without colliding with an existing history entry.
    pub fn update_workflow(&self, mut state: WorkflowState) -> Result<WorkflowState> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        persist_update(&tx, &mut state)?;
        tx.commit()?;
        Ok(state)
    }

    /// Atomic read-modify-write of one workflow.
    ///
    /// `f` runs while the store is locked, against the freshly loaded state.
    /// If it returns an error nothing is written.
    pub fn modify_workflow<F, E>(&self, workflow_id: &str, f: F) -> std::result::Result<WorkflowState, E>
    where
        F: FnOnce(&mut WorkflowState) -> std::result::Result<(), E>,
        E: From<StateStoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateStoreError::from)?;
        let mut state = load_workflow(&tx, workflow_id)?;
        f(&mut state)?;
        persist_update(&tx, &mut state)?;
        tx.commit().map_err(StateStoreError::from)?;
        Ok(state)
    }

    /// Update a single task; bumps the workflow version like any other write
    pub fn update_task(
        &self,
        workflow_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<WorkflowState> {
        self.modify_workflow(workflow_id, |state| {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StateStoreError::TaskNotFound {
                    workflow_id: workflow_id.to_string(),
                    task_id: task_id.to_string(),
                })?;
            update.apply(task);
            Ok(())
        })
    }

    /// Read the snapshot stored for `version`
    pub fn get_snapshot(&self, workflow_id: &str, version: i64) -> Result<WorkflowState> {
        let conn = self.lock()?;
        load_snapshot(&conn, workflow_id, version)
    }

    /// Restore the snapshot taken at `version` as the current state.
    ///
    /// The restored state is written as a new version with its own history
    /// entry, so history stays append-only and later forward writes never
    /// reuse a version number.
    pub fn rollback_workflow(&self, workflow_id: &str, version: i64) -> Result<WorkflowState> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut state = load_snapshot(&tx, workflow_id, version)?;
        persist_update(&tx, &mut state)?;
        tx.commit()?;

        info!(
            workflow_id,
            restored_version = version,
            new_version = state.version,
            "rolled back workflow"
        );
        Ok(state)
    }

    /// Versions recorded for a workflow, oldest first
    pub fn workflow_history(&self, workflow_id: &str) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT version, created_at
            FROM workflow_state_history
            WHERE workflow_id = ?1
            ORDER BY version ASC
            "#,
        )?;

        let entries = stmt
            .query_map(params![workflow_id], |row| {
                Ok(HistoryEntry {
                    version: row.get(0)?,
                    created_at: parse_time(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if entries.is_empty() {
            return Err(StateStoreError::NotFound(workflow_id.to_string()));
        }
        Ok(entries)
    }

    /// Delete a workflow, its tasks and its history
    pub fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let deleted = delete_workflow_rows(&tx, workflow_id)?;
        if deleted == 0 {
            return Err(StateStoreError::NotFound(workflow_id.to_string()));
        }
        tx.commit()?;
        info!(workflow_id, "deleted workflow");
        Ok(())
    }

    /// Delete terminal workflows last updated before `cutoff`
    pub fn delete_workflows_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT workflow_id FROM workflow_states
                WHERE updated_at < ?1 AND status IN ('completed', 'failed', 'cancelled')
                "#,
            )?;
            let ids = stmt
                .query_map(params![format_time(&cutoff)], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };

        for id in &ids {
            delete_workflow_rows(&tx, id)?;
        }
        tx.commit()?;

        debug!(count = ids.len(), "deleted old workflows");
        Ok(ids.len())
    }

    /// Most recently updated workflows first, optionally filtered by status
    pub fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: usize,
    ) -> Result<Vec<WorkflowState>> {
        let conn = self.lock()?;

        let ids: Vec<String> = if let Some(status) = status {
            let mut stmt = conn.prepare(
                r#"
                SELECT workflow_id FROM workflow_states
                WHERE status = ?1
                ORDER BY updated_at DESC
                LIMIT ?2
                "#,
            )?;
            let ids = stmt
                .query_map(params![status.as_str(), limit], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        } else {
            let mut stmt = conn.prepare(
                r#"
                SELECT workflow_id FROM workflow_states
                ORDER BY updated_at DESC
                LIMIT ?1
                "#,
            )?;
            let ids = stmt
                .query_map(params![limit], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };

        ids.iter().map(|id| load_workflow(&conn, id)).collect()
    }

    /// Count workflows per status
    pub fn workflow_stats(&self) -> Result<WorkflowStats> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM workflow_states GROUP BY status")?;

        let mut stats = WorkflowStats::default();
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: usize = row.get(1)?;
            Ok((status, count))
        })?;

        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            match status.parse::<WorkflowStatus>() {
                Ok(WorkflowStatus::Pending) => stats.pending += count,
                Ok(WorkflowStatus::Running) => stats.running += count,
                Ok(WorkflowStatus::Paused) => stats.paused += count,
                Ok(WorkflowStatus::Completed) => stats.completed += count,
                Ok(WorkflowStatus::Failed) => stats.failed += count,
                Ok(WorkflowStatus::Cancelled) => stats.cancelled += count,
                Err(_) => {}
            }
        }

        Ok(stats)
    }
}

// Helper functions shared by the public operations. They take a plain
// connection so they can run inside a transaction.

fn persist_update(conn: &Connection, state: &mut WorkflowState) -> Result<()> {
    let current: i64 = conn
        .query_row(
            "SELECT version FROM workflow_states WHERE workflow_id = ?1",
            params![state.workflow_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StateStoreError::NotFound(state.workflow_id.clone()))?;

    state.version = current + 1;
    state.updated_at = Utc::now();

    conn.execute(
        r#"
        UPDATE workflow_states
        SET status = ?1, created_at = ?2, updated_at = ?3, started_at = ?4, completed_at = ?5,
            variables = ?6, metadata = ?7, error = ?8, version = ?9
        WHERE workflow_id = ?10
        "#,
        params![
            state.status.as_str(),
            format_time(&state.created_at),
            format_time(&state.updated_at),
            state.started_at.as_ref().map(format_time),
            state.completed_at.as_ref().map(format_time),
            serde_json::to_string(&state.variables)?,
            serde_json::to_string(&state.metadata)?,
            state.error,
            state.version,
            state.workflow_id,
        ],
    )?;
    replace_task_rows(conn, state)?;
    append_history(conn, state)?;

    debug!(
        workflow_id = %state.workflow_id,
        version = state.version,
        status = %state.status,
        "persisted workflow"
    );
    Ok(())
}

fn insert_workflow_row(conn: &Connection, state: &WorkflowState) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO workflow_states (
            workflow_id, status, created_at, updated_at, started_at, completed_at,
            variables, metadata, error, version
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            state.workflow_id,
            state.status.as_str(),
            format_time(&state.created_at),
            format_time(&state.updated_at),
            state.started_at.as_ref().map(format_time),
            state.completed_at.as_ref().map(format_time),
            serde_json::to_string(&state.variables)?,
            serde_json::to_string(&state.metadata)?,
            state.error,
            state.version,
        ],
    )?;
    Ok(())
}

/// Delete-then-reinsert every task row of the workflow
fn replace_task_rows(conn: &Connection, state: &WorkflowState) -> Result<()> {
    conn.execute(
        "DELETE FROM task_states WHERE workflow_id = ?1",
        params![state.workflow_id],
    )?;

    let mut stmt = conn.prepare(
        r#"
        INSERT INTO task_states (
            workflow_id, task_id, agent_id, agent_type, status, started_at, completed_at,
            execution_time, result, error, retry_count, dependencies
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )?;

    for task in state.tasks.values() {
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let error = task.error.as_ref().map(serde_json::to_string).transpose()?;

        stmt.execute(params![
            state.workflow_id,
            task.task_id,
            task.agent_id,
            task.agent_type,
            task.status.as_str(),
            task.started_at.as_ref().map(format_time),
            task.completed_at.as_ref().map(format_time),
            task.execution_time,
            result,
            error,
            task.retry_count,
            serde_json::to_string(&task.dependencies)?,
        ])?;
    }

    Ok(())
}

fn append_history(conn: &Connection, state: &WorkflowState) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO workflow_state_history (workflow_id, version, state_snapshot, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            state.workflow_id,
            state.version,
            serde_json::to_string(state)?,
            format_time(&Utc::now()),
        ],
    )?;
    Ok(())
}

fn delete_workflow_rows(conn: &Connection, workflow_id: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM workflow_state_history WHERE workflow_id = ?1",
        params![workflow_id],
    )?;
    // task_states rows go with the workflow row (ON DELETE CASCADE)
    let deleted = conn.execute(
        "DELETE FROM workflow_states WHERE workflow_id = ?1",
        params![workflow_id],
    )?;
    Ok(deleted)
}

fn load_workflow(conn: &Connection, workflow_id: &str) -> Result<WorkflowState> {
    let mut state = conn
        .query_row(
            r#"
            SELECT workflow_id, status, created_at, updated_at, started_at, completed_at,
                   variables, metadata, error, version
            FROM workflow_states
            WHERE workflow_id = ?1
            "#,
            params![workflow_id],
            map_workflow_row,
        )
        .optional()?
        .ok_or_else(|| StateStoreError::NotFound(workflow_id.to_string()))?;

    let mut stmt = conn.prepare(
        r#"
        SELECT task_id, agent_id, agent_type, status, started_at, completed_at,
               execution_time, result, error, retry_count, dependencies
        FROM task_states
        WHERE workflow_id = ?1
        "#,
    )?;
    let tasks = stmt
        .query_map(params![workflow_id], map_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    state.tasks = tasks
        .into_iter()
        .map(|task| (task.task_id.clone(), task))
        .collect();
    Ok(state)
}

fn load_snapshot(conn: &Connection, workflow_id: &str, version: i64) -> Result<WorkflowState> {
    let snapshot: String = conn
        .query_row(
            r#"
            SELECT state_snapshot FROM workflow_state_history
            WHERE workflow_id = ?1 AND version = ?2
            "#,
            params![workflow_id, version],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StateStoreError::VersionNotFound {
            workflow_id: workflow_id.to_string(),
            version,
        })?;

    Ok(serde_json::from_str(&snapshot)?)
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically and
/// round-trip without losing precision
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_time(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_optional_time(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parse_optional_json<T: serde::de::DeserializeOwned>(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// Map a workflow_states row; tasks are filled in by the caller
fn map_workflow_row(row: &Row) -> rusqlite::Result<WorkflowState> {
    let status: String = row.get(1)?;
    let status = status
        .parse::<WorkflowStatus>()
        .map_err(|e| conversion_error(1, e))?;

    Ok(WorkflowState {
        workflow_id: row.get(0)?,
        status,
        tasks: BTreeMap::new(),
        created_at: parse_time(row, 2)?,
        updated_at: parse_time(row, 3)?,
        started_at: parse_optional_time(row, 4)?,
        completed_at: parse_optional_time(row, 5)?,
        variables: parse_json(row, 6)?,
        metadata: parse_json(row, 7)?,
        error: row.get(8)?,
        version: row.get(9)?,
    })
}

fn map_task_row(row: &Row) -> rusqlite::Result<TaskState> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| conversion_error(3, e))?;

    Ok(TaskState {
        task_id: row.get(0)?,
        agent_id: row.get(1)?,
        agent_type: row.get(2)?,
        status,
        started_at: parse_optional_time(row, 4)?,
        completed_at: parse_optional_time(row, 5)?,
        execution_time: row.get(6)?,
        result: parse_optional_json(row, 7)?,
        error: parse_optional_json(row, 8)?,
        retry_count: row.get(9)?,
        dependencies: parse_json(row, 10)?,
    })
}
