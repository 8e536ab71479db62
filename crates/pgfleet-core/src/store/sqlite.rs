// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed task store.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{CoreError, Result};
use crate::model::{Database, DbStatus, Stage, Task, TaskStatus};

use super::{DatabaseRow, TaskRow, TaskStore, next_updated_at};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed store, used for development and tests.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new store from an existing pool. Migrations must already
    /// have been run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file as needed, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::StoreError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::StoreError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::StoreError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_database(&self, db: &Database) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fleet_databases
                (id, name, owner, instance_name, stage, status,
                 migrate_from, migrate_to, expired_at, last_job_id, error_msg,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&db.id)
        .bind(&db.name)
        .bind(&db.owner)
        .bind(&db.instance_name)
        .bind(db.stage.as_str())
        .bind(db.status.as_str())
        .bind(&db.migrate_from)
        .bind(&db.migrate_to)
        .bind(db.expired_at)
        .bind(&db.last_job_id)
        .bind(&db.error_msg)
        .bind(db.created_at)
        .bind(db.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_database(&self, instance: &str, name: &str) -> Result<Option<Database>> {
        let row = sqlx::query_as::<_, DatabaseRow>(
            r#"
            SELECT id, name, owner, instance_name, stage, status,
                   migrate_from, migrate_to, expired_at, last_job_id, error_msg,
                   created_at, updated_at
            FROM fleet_databases
            WHERE instance_name = ? AND name = ?
            "#,
        )
        .bind(instance)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Database::try_from).transpose()
    }

    async fn get_database_by_id(&self, id: &str) -> Result<Option<Database>> {
        let row = sqlx::query_as::<_, DatabaseRow>(
            r#"
            SELECT id, name, owner, instance_name, stage, status,
                   migrate_from, migrate_to, expired_at, last_job_id, error_msg,
                   created_at, updated_at
            FROM fleet_databases
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Database::try_from).transpose()
    }

    async fn list_databases(&self, instance: &str) -> Result<Vec<Database>> {
        let rows = sqlx::query_as::<_, DatabaseRow>(
            r#"
            SELECT id, name, owner, instance_name, stage, status,
                   migrate_from, migrate_to, expired_at, last_job_id, error_msg,
                   created_at, updated_at
            FROM fleet_databases
            WHERE instance_name = ?
            ORDER BY name
            "#,
        )
        .bind(instance)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Database::try_from).collect()
    }

    async fn update_database_state(
        &self,
        id: &str,
        stage: Stage,
        status: DbStatus,
        error_msg: Option<&str>,
    ) -> Result<DateTime<Utc>> {
        let mut tx = self.pool.begin().await?;

        let prev: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT updated_at FROM fleet_databases WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((prev_updated,)) = prev else {
            return Err(CoreError::StoreError {
                operation: "update_database_state".to_string(),
                details: format!("no database row with id '{}'", id),
            });
        };

        let updated_at = next_updated_at(prev_updated);

        sqlx::query(
            r#"
            UPDATE fleet_databases
            SET stage = ?, status = ?, error_msg = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(stage.as_str())
        .bind(status.as_str())
        .bind(error_msg)
        .bind(updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated_at)
    }

    async fn set_migration_out(
        &self,
        id: &str,
        migrate_to: &str,
        expired_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleet_databases
            SET migrate_to = ?, expired_at = ?
            WHERE id = ?
            "#,
        )
        .bind(migrate_to)
        .bind(expired_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_last_job(&self, id: &str, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE fleet_databases SET last_job_id = ? WHERE id = ?")
            .bind(job_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO fleet_tasks
                    (id, job_id, db_id, db_name, instance_name, action, status,
                     reason, data, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.id)
            .bind(&task.job_id)
            .bind(&task.db_id)
            .bind(&task.db_name)
            .bind(&task.instance_name)
            .bind(task.action.as_str())
            .bind(task.status.as_str())
            .bind(&task.reason)
            .bind(serde_json::to_string(&task.data)?)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, job_id, db_id, db_name, instance_name, action, status,
                   reason, data, created_at, updated_at
            FROM fleet_tasks
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleet_tasks
            SET status = ?, reason = COALESCE(?, reason), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_active_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, job_id, db_id, db_name, instance_name, action, status,
                   reason, data, created_at, updated_at
            FROM fleet_tasks
            WHERE status IN ('pending', 'running', 'cancelling')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn list_job_tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, job_id, db_id, db_name, instance_name, action, status,
                   reason, data, created_at, updated_at
            FROM fleet_tasks
            WHERE job_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskAction, TaskData};
    use uuid::Uuid;

    async fn test_store() -> (SqliteTaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::from_path(dir.path().join("fleet.db"))
            .await
            .unwrap();
        (store, dir)
    }

    fn sample_db() -> Database {
        let now = Utc::now();
        Database {
            id: Uuid::new_v4().to_string(),
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
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_task(db: &Database, action: TaskAction, depends_on: Vec<String>) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4().to_string(),
            job_id: "job-1".to_string(),
            db_id: db.id.clone(),
            db_name: db.name.clone(),
            instance_name: db.instance_name.clone(),
            action,
            status: TaskStatus::Pending,
            reason: None,
            data: TaskData {
                owner: Some(db.owner.clone()),
                depends_on,
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_database_round_trip() {
        let (store, _dir) = test_store().await;
        let db = sample_db();
        store.create_database(&db).await.unwrap();

        let loaded = store
            .get_database("pg-eu-1", "shop")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, db.id);
        assert_eq!(loaded.stage, Stage::None);
        assert_eq!(loaded.status, DbStatus::Processing);

        assert!(
            store
                .get_database("pg-eu-1", "missing")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_update_database_state_advances_updated_at() {
        let (store, _dir) = test_store().await;
        let db = sample_db();
        store.create_database(&db).await.unwrap();

        let first = store
            .update_database_state(&db.id, Stage::CreateUser, DbStatus::Processing, None)
            .await
            .unwrap();
        let second = store
            .update_database_state(&db.id, Stage::CreateUser, DbStatus::Done, None)
            .await
            .unwrap();
        assert!(second > first, "updated_at must strictly increase");

        let loaded = store.get_database_by_id(&db.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::CreateUser);
        assert_eq!(loaded.status, DbStatus::Done);
        assert_eq!(loaded.updated_at, second);
    }

    #[tokio::test]
    async fn test_update_database_state_records_error() {
        let (store, _dir) = test_store().await;
        let db = sample_db();
        store.create_database(&db).await.unwrap();

        store
            .update_database_state(
                &db.id,
                Stage::Backuping,
                DbStatus::Failed,
                Some("pg_dump exited with 1"),
            )
            .await
            .unwrap();

        let loaded = store.get_database_by_id(&db.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DbStatus::Failed);
        assert_eq!(loaded.error_msg.as_deref(), Some("pg_dump exited with 1"));
    }

    #[tokio::test]
    async fn test_task_chain_round_trip_and_active_listing() {
        let (store, _dir) = test_store().await;
        let db = sample_db();
        store.create_database(&db).await.unwrap();

        let t1 = sample_task(&db, TaskAction::CreateUser, vec![]);
        let t2 = sample_task(&db, TaskAction::CreateDatabase, vec![t1.id.clone()]);
        store.create_tasks(&[t1.clone(), t2.clone()]).await.unwrap();

        let active = store.list_active_tasks().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].data.depends_on, Vec::<String>::new());
        assert_eq!(active[1].data.depends_on, vec![t1.id.clone()]);

        store
            .set_task_status(&t1.id, TaskStatus::Completed, None)
            .await
            .unwrap();
        let active = store.list_active_tasks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, t2.id);

        let job = store.list_job_tasks("job-1").await.unwrap();
        assert_eq!(job.len(), 2);
    }

    #[tokio::test]
    async fn test_set_task_status_keeps_existing_reason() {
        let (store, _dir) = test_store().await;
        let db = sample_db();
        store.create_database(&db).await.unwrap();
        let task = sample_task(&db, TaskAction::Backup, vec![]);
        store.create_tasks(std::slice::from_ref(&task)).await.unwrap();

        store
            .set_task_status(&task.id, TaskStatus::Cancelling, Some("operator request"))
            .await
            .unwrap();
        store
            .set_task_status(&task.id, TaskStatus::Cancelled, None)
            .await
            .unwrap();

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert_eq!(loaded.reason.as_deref(), Some("operator request"));
    }

    #[tokio::test]
    async fn test_migration_stamps() {
        let (store, _dir) = test_store().await;
        let db = sample_db();
        store.create_database(&db).await.unwrap();

        let deadline = Utc::now() + chrono::Duration::hours(24);
        store
            .set_migration_out(&db.id, "pg-us-2", deadline)
            .await
            .unwrap();
        store.set_last_job(&db.id, "job-42").await.unwrap();

        let loaded = store.get_database_by_id(&db.id).await.unwrap().unwrap();
        assert_eq!(loaded.migrate_to.as_deref(), Some("pg-us-2"));
        assert_eq!(loaded.last_job_id.as_deref(), Some("job-42"));
        assert!(loaded.expired_at.is_some());
    }
}
