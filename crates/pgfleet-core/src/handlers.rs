// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task execution against PostgreSQL instances.
//!
//! The coordinator runs most actions itself over an administrative
//! connection per instance; dumps and restores shell out to `pg_dump` and
//! `pg_restore`. Migrate-out is the one action handed to the owning agent
//! when its connection is live, since only the agent can hand the database
//! over gracefully.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pgfleet_protocol::fleet_proto::TaskPush;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::lifecycle::{action_allowed, running_stage, success_state};
use crate::model::{Database, DbStatus, Stage, Task, TaskAction};
use crate::registry::{DbStatusEvent, InstanceRegistry};
use crate::scheduler::TaskRunner;
use crate::store::TaskStore;

/// Tunables for the action runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory dumps are written under, one subdirectory per instance.
    pub backup_dir: PathBuf,
    pub pg_dump: String,
    pub pg_restore: String,
    /// Connection attempts while waiting for a database to come up.
    pub ready_poll_attempts: u32,
    pub ready_poll_interval: Duration,
    /// How long a migrated-out database is kept before it expires, and how
    /// long daily dumps are retained.
    pub retention: Duration,
    /// How long to wait for an agent to report migrate-out completion.
    pub push_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/lib/pgfleet/backups"),
            pg_dump: "pg_dump".to_string(),
            pg_restore: "pg_restore".to_string(),
            ready_poll_attempts: 30,
            ready_poll_interval: Duration::from_secs(2),
            retention: Duration::from_secs(7 * 24 * 3600),
            push_timeout: Duration::from_secs(60),
        }
    }
}

/// Administrative connection pools, one per instance, connected on first use.
pub struct InstancePools {
    urls: HashMap<String, String>,
    pools: tokio::sync::Mutex<HashMap<String, PgPool>>,
}

impl InstancePools {
    /// `urls` maps instance name to an administrative connection URL.
    pub fn new(urls: HashMap<String, String>) -> Self {
        Self {
            urls,
            pools: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn admin_url(&self, instance: &str) -> Result<&str> {
        self.urls
            .get(instance)
            .map(String::as_str)
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance: instance.to_string(),
            })
    }

    async fn pool(&self, instance: &str) -> Result<PgPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(instance) {
            return Ok(pool.clone());
        }

        let url = self.admin_url(instance)?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| CoreError::StoreError {
                operation: "instance_connect".to_string(),
                details: format!("instance '{}': {}", instance, e),
            })?;
        pools.insert(instance.to_string(), pool.clone());
        Ok(pool)
    }
}

/// Runs lifecycle actions and keeps the store and registry cache in step.
pub struct ActionRunner {
    store: Arc<dyn TaskStore>,
    registry: Arc<InstanceRegistry>,
    pools: InstancePools,
    config: RunnerConfig,
}

impl ActionRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<InstanceRegistry>,
        pools: InstancePools,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            pools,
            config,
        }
    }

    /// Persist a stage/status change and mirror it into the registry cache.
    async fn transition(
        &self,
        db: &Database,
        stage: Stage,
        status: DbStatus,
        error_msg: Option<&str>,
    ) -> Result<()> {
        let updated_at = self
            .store
            .update_database_state(&db.id, stage, status, error_msg)
            .await?;
        self.registry.apply_db_status(DbStatusEvent {
            instance_name: db.instance_name.clone(),
            name: db.name.clone(),
            owner: db.owner.clone(),
            stage,
            status,
            migrate_from: db.migrate_from.clone(),
            migrate_to: db.migrate_to.clone(),
            expired_at: db.expired_at,
            updated_at,
            error_msg: error_msg.map(str::to_string),
        })?;
        Ok(())
    }

    async fn execute(&self, task: &Task, db: &Database) -> Result<()> {
        match task.action {
            TaskAction::CreateUser => self.create_user(task, db).await,
            TaskAction::CreateDatabase => self.create_database(task, db).await,
            TaskAction::Backup => self.backup(task, db).await,
            TaskAction::DailyBackup => self.daily_backup(db).await,
            TaskAction::Restore => self.restore(task, db).await,
            TaskAction::WaitReady => self.wait_ready(db).await,
            TaskAction::MigrateOut => unreachable!("handled before the generic path"),
        }
    }

    async fn create_user(&self, task: &Task, db: &Database) -> Result<()> {
        let owner = task.data.owner.as_deref().unwrap_or(&db.owner);
        let password = task
            .data
            .password
            .as_deref()
            .ok_or_else(|| CoreError::ValidationError {
                field: "password".to_string(),
                message: "create_user requires a password".to_string(),
            })?;

        let pool = self.pools.pool(&db.instance_name).await?;
        let create = format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD {}",
            quote_ident(owner),
            quote_literal(password)
        );
        match sqlx::query(&create).execute(&pool).await {
            Ok(_) => Ok(()),
            // duplicate_object: role exists, refresh its password instead
            Err(e) if pg_code(&e).as_deref() == Some("42710") => {
                debug!(owner, "role exists, resetting password");
                let alter = format!(
                    "ALTER ROLE {} WITH LOGIN PASSWORD {}",
                    quote_ident(owner),
                    quote_literal(password)
                );
                sqlx::query(&alter).execute(&pool).await?;
                Ok(())
            }
            Err(e) => Err(exec_failed(task.action, e)),
        }
    }

    async fn create_database(&self, task: &Task, db: &Database) -> Result<()> {
        let owner = task.data.owner.as_deref().unwrap_or(&db.owner);
        let pool = self.pools.pool(&db.instance_name).await?;
        let create = format!(
            "CREATE DATABASE {} WITH OWNER {}",
            quote_ident(&db.name),
            quote_ident(owner)
        );
        match sqlx::query(&create).execute(&pool).await {
            Ok(_) => Ok(()),
            // duplicate_database: a crashed earlier attempt got this far,
            // or the name is taken by someone else's database
            Err(e) if pg_code(&e).as_deref() == Some("42P04") => {
                let current: Option<String> = sqlx::query_scalar(
                    "SELECT pg_get_userbyid(datdba) FROM pg_database WHERE datname = $1",
                )
                .bind(&db.name)
                .fetch_optional(&pool)
                .await?;
                verify_existing_owner(&db.name, owner, current.as_deref())?;
                debug!(db = %db.name, "database already exists with the expected owner");
                Ok(())
            }
            Err(e) => Err(exec_failed(task.action, e)),
        }
    }

    async fn backup(&self, task: &Task, db: &Database) -> Result<()> {
        let source = task
            .data
            .backup_from
            .as_deref()
            .ok_or_else(|| CoreError::ValidationError {
                field: "backup_from".to_string(),
                message: "backup requires a source database".to_string(),
            })?;
        let path = self.job_backup_path(&db.instance_name, source, &task.job_id);
        let url = replace_db_in_url(self.pools.admin_url(&db.instance_name)?, source);
        self.run_pg_dump(&url, &path).await
    }

    async fn daily_backup(&self, db: &Database) -> Result<()> {
        let dir = self.config.backup_dir.join(&db.instance_name);
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let path = dir.join(format!("{}-{}.dump", db.name, stamp));
        let url = replace_db_in_url(self.pools.admin_url(&db.instance_name)?, &db.name);
        self.run_pg_dump(&url, &path).await?;
        self.prune_old_dumps(&dir, &db.name).await;
        Ok(())
    }

    async fn restore(&self, task: &Task, db: &Database) -> Result<()> {
        let source = task
            .data
            .backup_from
            .as_deref()
            .ok_or_else(|| CoreError::ValidationError {
                field: "backup_from".to_string(),
                message: "restore requires a source database".to_string(),
            })?;
        let path = match &task.data.backup_path {
            Some(p) => PathBuf::from(p),
            None => self.job_backup_path(&db.instance_name, source, &task.job_id),
        };
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(CoreError::ExecutionFailed {
                    action: "restore".to_string(),
                    details: format!("backup artifact {} does not exist", path.display()),
                });
            }
            Err(e) => {
                return Err(CoreError::ExecutionFailed {
                    action: "restore".to_string(),
                    details: format!("cannot stat {}: {}", path.display(), e),
                });
            }
        }
        let url = replace_db_in_url(self.pools.admin_url(&db.instance_name)?, &db.name);

        let output = Command::new(&self.config.pg_restore)
            .arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--dbname")
            .arg(&url)
            .arg(&path)
            .output()
            .await
            .map_err(|e| CoreError::ExecutionFailed {
                action: "restore".to_string(),
                details: format!("failed to spawn {}: {}", self.config.pg_restore, e),
            })?;
        if !output.status.success() {
            return Err(CoreError::ExecutionFailed {
                action: "restore".to_string(),
                details: trim_output(&output.stderr),
            });
        }
        info!(db = %db.name, path = %path.display(), "restore finished");
        Ok(())
    }

    async fn wait_ready(&self, db: &Database) -> Result<()> {
        let url = replace_db_in_url(self.pools.admin_url(&db.instance_name)?, &db.name);
        let mut last_err = String::new();
        for attempt in 1..=self.config.ready_poll_attempts {
            match sqlx::postgres::PgConnection::connect(&url).await {
                Ok(mut conn) => {
                    let probe = sqlx::query("SELECT 1").execute(&mut conn).await;
                    let _ = conn.close().await;
                    if probe.is_ok() {
                        return Ok(());
                    }
                    if let Err(e) = probe {
                        last_err = e.to_string();
                    }
                }
                Err(e) => last_err = e.to_string(),
            }
            debug!(db = %db.name, attempt, "database not ready yet");
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
        Err(CoreError::ExecutionFailed {
            action: "wait_ready".to_string(),
            details: format!(
                "database '{}' not reachable after {} attempts: {}",
                db.name, self.config.ready_poll_attempts, last_err
            ),
        })
    }

    /// Migrate-out goes to the agent when one is connected; otherwise the
    /// coordinator stamps the handover locally and the agent reconciles from
    /// its seed on the next registration.
    async fn migrate_out(&self, task: &Task, db: &Database) -> Result<()> {
        if db.is_migrated() {
            info!(db = %db.name, stage = %db.stage, "already migrated out, nothing to do");
            return Ok(());
        }

        let migrate_to =
            task.data
                .migrate_to
                .clone()
                .ok_or_else(|| CoreError::ValidationError {
                    field: "migrate_to".to_string(),
                    message: "migrate_out requires a target".to_string(),
                })?;
        let expired_at = Utc::now()
            + chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));

        if self.registry.is_online(&db.instance_name) {
            self.registry
                .push_task(
                    &db.instance_name,
                    TaskPush {
                        task_id: task.id.clone(),
                        job_id: task.job_id.clone(),
                        db_name: db.name.clone(),
                        instance_name: db.instance_name.clone(),
                        action: TaskAction::MigrateOut.as_str().to_string(),
                        reason: task.reason.clone(),
                        ..Default::default()
                    },
                )
                .await?;

            let reported = self
                .registry
                .wait_for_db(
                    &db.instance_name,
                    &db.name,
                    |ev| matches!(ev.stage, Stage::Idle | Stage::Dropping | Stage::DropCompleted),
                    self.config.push_timeout,
                )
                .await?;
            let Some(event) = reported else {
                return Err(CoreError::DeliveryTimeout {
                    instance: db.instance_name.clone(),
                    task_id: task.id.clone(),
                });
            };
            self.store
                .update_database_state(&db.id, event.stage, event.status, None)
                .await?;
        } else {
            warn!(
                db = %db.name,
                instance = %db.instance_name,
                "agent offline, stamping migrate-out locally"
            );
            self.transition(db, Stage::Idle, DbStatus::Processing, None)
                .await?;
        }

        self.store
            .set_migration_out(&db.id, &migrate_to, expired_at)
            .await?;
        info!(db = %db.name, %migrate_to, %expired_at, "migrate-out recorded");
        Ok(())
    }

    fn job_backup_path(&self, instance: &str, source: &str, job_id: &str) -> PathBuf {
        self.config
            .backup_dir
            .join(instance)
            .join(format!("{}-{}.dump", source, job_id))
    }

    async fn run_pg_dump(&self, url: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::ExecutionFailed {
                    action: "backup".to_string(),
                    details: format!("cannot create {}: {}", parent.display(), e),
                })?;
        }

        let output = Command::new(&self.config.pg_dump)
            .arg("--format=custom")
            .arg("--file")
            .arg(path)
            .arg("--dbname")
            .arg(url)
            .output()
            .await
            .map_err(|e| CoreError::ExecutionFailed {
                action: "backup".to_string(),
                details: format!("failed to spawn {}: {}", self.config.pg_dump, e),
            })?;
        if !output.status.success() {
            return Err(CoreError::ExecutionFailed {
                action: "backup".to_string(),
                details: trim_output(&output.stderr),
            });
        }
        info!(path = %path.display(), "dump written");
        Ok(())
    }

    /// Delete dumps for `db` older than the retention window. Failures are
    /// logged and ignored; pruning never fails a backup.
    async fn prune_old_dumps(&self, dir: &Path, db: &str) {
        let cutoff = std::time::SystemTime::now() - self.config.retention;
        let prefix = format!("{}-", db);
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".dump") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.modified().map(|m| m < cutoff).unwrap_or(false) {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!(path = %entry.path().display(), error = %e, "failed to prune dump");
                } else {
                    debug!(path = %entry.path().display(), "pruned expired dump");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl TaskRunner for ActionRunner {
    #[instrument(skip(self, task), fields(task_id = %task.id, action = %task.action, db = %task.db_name))]
    async fn run(&self, task: Task) -> Result<()> {
        let db = self
            .store
            .get_database_by_id(&task.db_id)
            .await?
            .ok_or_else(|| CoreError::DatabaseNotFound {
                instance: task.instance_name.clone(),
                name: task.db_name.clone(),
            })?;

        action_allowed(&db, task.action)?;

        if task.action == TaskAction::MigrateOut {
            return self.migrate_out(&task, &db).await;
        }

        let entry_stage = running_stage(task.action, db.stage);
        self.transition(&db, entry_stage, DbStatus::Processing, None)
            .await?;

        match self.execute(&task, &db).await {
            Ok(()) => {
                let (stage, status) = success_state(task.action, db.stage);
                self.transition(&db, stage, status, None).await?;
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                error!(error = %msg, "action failed");
                if let Err(pe) = self
                    .transition(&db, entry_stage, DbStatus::Failed, Some(&msg))
                    .await
                {
                    error!(error = %pe, "failed to record failure state");
                }
                Err(e.logged())
            }
        }
    }

    async fn cancel(&self, task: Task, reason: &str) {
        // SQL statements and dump processes run to completion; cancellation
        // only stops tasks that have not started.
        warn!(
            task_id = %task.id,
            action = %task.action,
            reason,
            "cancellation requested, letting in-flight work finish"
        );
    }
}

/// A physically present database only counts as an idempotent duplicate
/// when its owner matches the requested one.
fn verify_existing_owner(name: &str, requested: &str, current: Option<&str>) -> Result<()> {
    match current {
        Some(current) if current == requested => Ok(()),
        Some(current) => Err(CoreError::OwnerMismatch {
            name: name.to_string(),
            expected: current.to_string(),
            actual: requested.to_string(),
        }),
        None => Err(CoreError::ExecutionFailed {
            action: "create_database".to_string(),
            details: format!("database '{}' disappeared while verifying its owner", name),
        }),
    }
}

fn pg_code(e: &sqlx::Error) -> Option<String> {
    e.as_database_error()
        .and_then(|db| db.code())
        .map(|c| c.into_owned())
}

fn exec_failed(action: TaskAction, e: sqlx::Error) -> CoreError {
    CoreError::ExecutionFailed {
        action: action.as_str().to_string(),
        details: e.to_string(),
    }
}

fn trim_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() > 2000 {
        let mut end = 2000;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}

/// Double-quote an SQL identifier.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote an SQL string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Swap the database path segment of a PostgreSQL connection URL.
fn replace_db_in_url(url: &str, db: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (url, None),
    };
    let authority_start = base.find("://").map(|i| i + 3).unwrap_or(0);
    let base = match base[authority_start..].find('/') {
        Some(slash) => &base[..authority_start + slash],
        None => base,
    };
    match query {
        Some(q) => format!("{}/{}?{}", base, db, q),
        None => format!("{}/{}", base, db),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskData, TaskStatus};
    use crate::store::SqliteTaskStore;
    use tempfile::TempDir;

    async fn runner(dir: &TempDir) -> ActionRunner {
        let store = Arc::new(
            SqliteTaskStore::from_path(&dir.path().join("fleet.db"))
                .await
                .unwrap(),
        );
        let urls = HashMap::from([(
            "pg-1".to_string(),
            "postgres://admin@localhost:5432/postgres".to_string(),
        )]);
        ActionRunner::new(
            store,
            Arc::new(InstanceRegistry::new()),
            InstancePools::new(urls),
            RunnerConfig {
                backup_dir: dir.path().join("backups"),
                ..Default::default()
            },
        )
    }

    fn db_fixture() -> Database {
        let now = Utc::now();
        Database {
            id: "db-1".to_string(),
            name: "shop".to_string(),
            owner: "shop_owner".to_string(),
            instance_name: "pg-1".to_string(),
            stage: Stage::CreateDatabase,
            status: DbStatus::Done,
            migrate_from: None,
            migrate_to: None,
            expired_at: None,
            last_job_id: None,
            error_msg: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn task_fixture(action: TaskAction, data: TaskData) -> Task {
        let now = Utc::now();
        Task {
            id: "t-1".to_string(),
            job_id: "j-1".to_string(),
            db_id: "db-1".to_string(),
            db_name: "shop".to_string(),
            instance_name: "pg-1".to_string(),
            action,
            status: TaskStatus::Running,
            reason: None,
            data,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_restore_requires_backup_artifact_on_disk() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir).await;
        let task = task_fixture(
            TaskAction::Restore,
            TaskData {
                backup_from: Some("origin".to_string()),
                ..Default::default()
            },
        );

        let err = runner.restore(&task, &db_fixture()).await.unwrap_err();
        assert_eq!(err.error_code(), "EXECUTION_FAILED");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_verify_existing_owner() {
        assert!(verify_existing_owner("shop", "shop_owner", Some("shop_owner")).is_ok());

        let err = verify_existing_owner("shop", "intruder", Some("shop_owner")).unwrap_err();
        assert_eq!(err.error_code(), "OWNER_MISMATCH");

        // Gone between the duplicate error and the check
        assert!(verify_existing_owner("shop", "shop_owner", None).is_err());
    }

    #[test]
    fn test_replace_db_in_url() {
        assert_eq!(
            replace_db_in_url("postgres://admin:pw@pg-1:5432/postgres", "shop"),
            "postgres://admin:pw@pg-1:5432/shop"
        );
        assert_eq!(
            replace_db_in_url("postgres://pg-1/postgres?sslmode=require", "shop"),
            "postgres://pg-1/shop?sslmode=require"
        );
        assert_eq!(
            replace_db_in_url("postgres://pg-1:5432", "shop"),
            "postgres://pg-1:5432/shop"
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("p'w"), "'p''w'");
    }

    #[test]
    fn test_trim_output_truncates() {
        let long = "x".repeat(3000);
        let trimmed = trim_output(long.as_bytes());
        assert_eq!(trimmed.len(), 2003);
        assert!(trimmed.ends_with("..."));
    }
}
