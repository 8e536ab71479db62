// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed task store.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{CoreError, Result};
use crate::model::{Database, DbStatus, Stage, Task, TaskStatus};

use super::{DatabaseRow, TaskRow, TaskStore, next_updated_at};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

/// PostgreSQL-backed store, used in production.
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a new store from an existing pool. Migrations must already
    /// have been run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given URL and run all migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| CoreError::StoreError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
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
impl TaskStore for PostgresTaskStore {
    async fn create_database(&self, db: &Database) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fleet_databases
                (id, name, owner, instance_name, stage, status,
                 migrate_from, migrate_to, expired_at, last_job_id, error_msg,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
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
            WHERE instance_name = $1 AND name = $2
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
            WHERE id = $1
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
            WHERE instance_name = $1
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
            sqlx::query_as("SELECT updated_at FROM fleet_databases WHERE id = $1 FOR UPDATE")
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
            SET stage = $1, status = $2, error_msg = $3, updated_at = $4
            WHERE id = $5
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
            SET migrate_to = $1, expired_at = $2
            WHERE id = $3
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
        sqlx::query("UPDATE fleet_databases SET last_job_id = $1 WHERE id = $2")
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
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
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
            WHERE id = $1
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
            SET status = $1, reason = COALESCE($2, reason), updated_at = $3
            WHERE id = $4
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
            WHERE job_id = $1
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
