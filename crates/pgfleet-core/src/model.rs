// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model: databases, tasks and jobs.
//!
//! Stage, status and action enums are closed sets with canonical string
//! forms. The store persists the strings; the wire protocol carries them
//! verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle stage of a managed database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Row exists, nothing provisioned yet.
    None,
    /// Owner role is being (or has been) created.
    CreateUser,
    /// Database itself is being (or has been) created.
    CreateDatabase,
    /// A dump is being taken.
    Backuping,
    /// A dump is being (or has been) loaded.
    Restoring,
    /// Fully provisioned and serving.
    ReadyToUse,
    /// Migrated away, kept only for the retention window.
    Idle,
    /// Drop in progress.
    Dropping,
    /// Dropped, terminal.
    DropCompleted,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::None => "none",
            Stage::CreateUser => "create_user",
            Stage::CreateDatabase => "create_database",
            Stage::Backuping => "backuping",
            Stage::Restoring => "restoring",
            Stage::ReadyToUse => "ready_to_use",
            Stage::Idle => "idle",
            Stage::Dropping => "dropping",
            Stage::DropCompleted => "drop_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Stage::None),
            "create_user" => Some(Stage::CreateUser),
            "create_database" => Some(Stage::CreateDatabase),
            "backuping" => Some(Stage::Backuping),
            "restoring" => Some(Stage::Restoring),
            "ready_to_use" => Some(Stage::ReadyToUse),
            "idle" => Some(Stage::Idle),
            "dropping" => Some(Stage::Dropping),
            "drop_completed" => Some(Stage::DropCompleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a database's current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbStatus {
    /// The stage's work is in flight.
    Processing,
    /// The stage's work finished successfully.
    Done,
    /// The stage's work failed; see `error_msg`.
    Failed,
    /// Retention window after migrate-out has elapsed.
    Expired,
    /// Work was cancelled before completion.
    Cancelled,
}

impl DbStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbStatus::Processing => "processing",
            DbStatus::Done => "done",
            DbStatus::Failed => "failed",
            DbStatus::Expired => "expired",
            DbStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(DbStatus::Processing),
            "done" => Some(DbStatus::Done),
            "failed" => Some(DbStatus::Failed),
            "expired" => Some(DbStatus::Expired),
            "cancelled" => Some(DbStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for DbStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One managed database.
#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    pub id: String,
    /// Database name, unique per instance.
    pub name: String,
    /// Role that owns the database.
    pub owner: String,
    /// Instance the database lives on.
    pub instance_name: String,
    pub stage: Stage,
    pub status: DbStatus,
    /// Source instance, set when the database was restored from elsewhere.
    pub migrate_from: Option<String>,
    /// Destination instance, set once the database migrates out.
    pub migrate_to: Option<String>,
    /// Retention deadline after migrate-out.
    pub expired_at: Option<DateTime<Utc>>,
    /// Most recent job that touched this database, for request idempotency.
    pub last_job_id: Option<String>,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    /// Fully provisioned and serving traffic.
    pub fn is_ready_to_use(&self) -> bool {
        self.stage == Stage::ReadyToUse && self.status == DbStatus::Done
    }

    /// Migrated away (or being dropped); only retention bookkeeping remains.
    pub fn is_migrated(&self) -> bool {
        matches!(
            self.stage,
            Stage::Idle | Stage::Dropping | Stage::DropCompleted
        )
    }
}

/// Action a task performs against a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskAction {
    CreateUser,
    CreateDatabase,
    Backup,
    DailyBackup,
    Restore,
    WaitReady,
    MigrateOut,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::CreateUser => "create_user",
            TaskAction::CreateDatabase => "create_database",
            TaskAction::Backup => "backup",
            TaskAction::DailyBackup => "daily_backup",
            TaskAction::Restore => "restore",
            TaskAction::WaitReady => "wait_ready",
            TaskAction::MigrateOut => "migrate_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create_user" => Some(TaskAction::CreateUser),
            "create_database" => Some(TaskAction::CreateDatabase),
            "backup" => Some(TaskAction::Backup),
            "daily_backup" => Some(TaskAction::DailyBackup),
            "restore" => Some(TaskAction::Restore),
            "wait_ready" => Some(TaskAction::WaitReady),
            "migrate_out" => Some(TaskAction::MigrateOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting for dependencies or a worker slot.
    Pending,
    /// Handed to a worker.
    Running,
    /// Cancellation requested while the task was running.
    Cancelling,
    /// Cancelled before completion, never ran or was interrupted.
    Cancelled,
    /// Finished successfully.
    Completed,
    /// Finished with an error; see `reason`.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "cancelling" => Some(TaskStatus::Cancelling),
            "cancelled" => Some(TaskStatus::Cancelled),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses never leave the store again via recovery.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled | TaskStatus::Completed | TaskStatus::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action-specific payload, persisted as JSON next to the task row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    /// Owner role for create actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Password for the owner role on create-user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Instance to dump from, for backup/restore chains.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_from: Option<String>,
    /// Dump file location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    /// Destination instance for migrate-out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrate_to: Option<String>,
    /// Task ids this task waits on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// One unit of work against a single database.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    /// Logical job this task belongs to.
    pub job_id: String,
    /// Database row the task operates on.
    pub db_id: String,
    pub db_name: String,
    /// Instance the action executes against.
    pub instance_name: String,
    pub action: TaskAction,
    pub status: TaskStatus,
    /// Cancellation or failure cause.
    pub reason: Option<String>,
    pub data: TaskData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A logical group of tasks submitted together.
///
/// Jobs exist only in memory; their identity lives on the task rows. A job
/// is done when every task is terminal, and failed when any task failed.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub tasks: Vec<Task>,
}

impl Job {
    pub fn new(id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: id.into(),
            tasks,
        }
    }

    /// Every task has reached a terminal status.
    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// At least one task failed or was cancelled.
    pub fn is_failed(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_string_round_trip() {
        for stage in [
            Stage::None,
            Stage::CreateUser,
            Stage::CreateDatabase,
            Stage::Backuping,
            Stage::Restoring,
            Stage::ReadyToUse,
            Stage::Idle,
            Stage::Dropping,
            Stage::DropCompleted,
        ] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn test_task_status_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Cancelling.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_task_data_json_round_trip() {
        let data = TaskData {
            owner: Some("shop_owner".to_string()),
            backup_from: Some("pg-eu-1".to_string()),
            depends_on: vec!["t-1".to_string(), "t-2".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&data).unwrap();
        let parsed: TaskData = serde_json::from_str(&json).unwrap();
        assert_eq!(data, parsed);
        // Unset optionals are omitted entirely
        assert!(!json.contains("password"));
    }

    #[test]
    fn test_task_data_defaults_from_empty_json() {
        let parsed: TaskData = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, TaskData::default());
    }

    #[test]
    fn test_database_readiness() {
        let mut db = test_db();
        assert!(!db.is_ready_to_use());

        db.stage = Stage::ReadyToUse;
        db.status = DbStatus::Done;
        assert!(db.is_ready_to_use());

        db.status = DbStatus::Processing;
        assert!(!db.is_ready_to_use());
    }

    #[test]
    fn test_database_migrated_states() {
        let mut db = test_db();
        assert!(!db.is_migrated());
        for stage in [Stage::Idle, Stage::Dropping, Stage::DropCompleted] {
            db.stage = stage;
            assert!(db.is_migrated(), "{stage} should count as migrated");
        }
    }

    #[test]
    fn test_job_done_and_failed_aggregates() {
        let in_flight = job_with(&[TaskStatus::Completed, TaskStatus::Running]);
        assert!(!in_flight.is_done());
        assert!(!in_flight.is_failed());

        let done = job_with(&[TaskStatus::Completed, TaskStatus::Completed]);
        assert!(done.is_done());
        assert!(!done.is_failed());

        let failed = job_with(&[TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled]);
        assert!(failed.is_done());
        assert!(failed.is_failed());

        // Failed shows up before the rest of the job drains
        let draining = job_with(&[TaskStatus::Cancelled, TaskStatus::Running]);
        assert!(!draining.is_done());
        assert!(draining.is_failed());
    }

    fn job_with(statuses: &[TaskStatus]) -> Job {
        let now = Utc::now();
        let tasks = statuses
            .iter()
            .enumerate()
            .map(|(i, &status)| Task {
                id: format!("t-{i}"),
                job_id: "j-1".to_string(),
                db_id: "db-1".to_string(),
                db_name: "shop".to_string(),
                instance_name: "pg-1".to_string(),
                action: TaskAction::CreateUser,
                status,
                reason: None,
                data: TaskData::default(),
                created_at: now,
                updated_at: now,
            })
            .collect();
        Job::new("j-1", tasks)
    }

    fn test_db() -> Database {
        Database {
            id: "db-1".to_string(),
            name: "shop".to_string(),
            owner: "shop_owner".to_string(),
            instance_name: "pg-eu-1".to_string(),
            stage: Stage::None,
            status: DbStatus::Processing,
            migrate_from: None,
            migrate_to: None,
            expired_at: None,
            last_job_id: None,
            error_msg: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
