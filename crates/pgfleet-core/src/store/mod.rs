// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence layer for databases and tasks.
//!
//! The coordinator state lives in two tables: `fleet_databases` (lifecycle
//! state per managed database) and `fleet_tasks` (the durable half of the
//! scheduler; pending/running rows are what crash recovery replays).
//! Backends exist for PostgreSQL (production) and SQLite (development and
//! tests).

mod postgres;
mod sqlite;

pub use postgres::PostgresTaskStore;
pub use sqlite::SqliteTaskStore;

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;

use crate::error::{CoreError, Result};
use crate::model::{Database, DbStatus, Stage, Task, TaskAction, TaskData, TaskStatus};

/// Raw database row as stored; enums are text, task data is JSON.
#[derive(Debug, Clone, FromRow)]
pub struct DatabaseRow {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub instance_name: String,
    pub stage: String,
    pub status: String,
    pub migrate_from: Option<String>,
    pub migrate_to: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<String>,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DatabaseRow> for Database {
    type Error = CoreError;

    fn try_from(row: DatabaseRow) -> Result<Self> {
        let stage = Stage::parse(&row.stage).ok_or_else(|| corrupt("stage", &row.stage))?;
        let status = DbStatus::parse(&row.status).ok_or_else(|| corrupt("status", &row.status))?;
        Ok(Database {
            id: row.id,
            name: row.name,
            owner: row.owner,
            instance_name: row.instance_name,
            stage,
            status,
            migrate_from: row.migrate_from,
            migrate_to: row.migrate_to,
            expired_at: row.expired_at,
            last_job_id: row.last_job_id,
            error_msg: row.error_msg,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Raw task row as stored.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub job_id: String,
    pub db_id: String,
    pub db_name: String,
    pub instance_name: String,
    pub action: String,
    pub status: String,
    pub reason: Option<String>,
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let action =
            TaskAction::parse(&row.action).ok_or_else(|| corrupt("action", &row.action))?;
        let status =
            TaskStatus::parse(&row.status).ok_or_else(|| corrupt("status", &row.status))?;
        let data: TaskData = serde_json::from_str(&row.data)?;
        Ok(Task {
            id: row.id,
            job_id: row.job_id,
            db_id: row.db_id,
            db_name: row.db_name,
            instance_name: row.instance_name,
            action,
            status,
            reason: row.reason,
            data,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn corrupt(column: &str, value: &str) -> CoreError {
    CoreError::StoreError {
        operation: "decode".to_string(),
        details: format!("unknown {} value '{}'", column, value),
    }
}

/// Pick the next `updated_at` so the column is strictly monotonic per row.
///
/// Wall clocks can stand still (or step backwards) between two writes;
/// subscribers and agents dedup on `updated_at` equality, so two distinct
/// states must never share a timestamp.
pub(crate) fn next_updated_at(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + Duration::milliseconds(1)
    }
}

/// Storage contract the scheduler, handlers and API are written against.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new database row.
    async fn create_database(&self, db: &Database) -> Result<()>;

    /// Fetch a database by instance and name.
    async fn get_database(&self, instance: &str, name: &str) -> Result<Option<Database>>;

    /// Fetch a database by row id.
    async fn get_database_by_id(&self, id: &str) -> Result<Option<Database>>;

    /// List all databases on one instance.
    async fn list_databases(&self, instance: &str) -> Result<Vec<Database>>;

    /// Move a database to a new (stage, status), clearing or setting the
    /// error message. Returns the new `updated_at`, which is guaranteed to
    /// be strictly greater than the previous one.
    async fn update_database_state(
        &self,
        id: &str,
        stage: Stage,
        status: DbStatus,
        error_msg: Option<&str>,
    ) -> Result<DateTime<Utc>>;

    /// Stamp migration bookkeeping when a database migrates out.
    async fn set_migration_out(
        &self,
        id: &str,
        migrate_to: &str,
        expired_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record the job currently driving this database, for idempotent
    /// request handling.
    async fn set_last_job(&self, id: &str, job_id: &str) -> Result<()>;

    /// Insert a batch of tasks atomically: either the whole chain is
    /// durable or none of it is.
    async fn create_tasks(&self, tasks: &[Task]) -> Result<()>;

    /// Fetch one task.
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Update a task's status and (optionally) its cancellation/failure
    /// reason.
    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<()>;

    /// All non-terminal tasks, ordered by creation time. This is the crash
    /// recovery working set.
    async fn list_active_tasks(&self) -> Result<Vec<Task>>;

    /// All tasks belonging to one job.
    async fn list_job_tasks(&self, job_id: &str) -> Result<Vec<Task>>;

    /// Close the underlying pool.
    async fn close(&self) {}
}
