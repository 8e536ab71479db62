// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator entry points: the operations callers invoke to provision,
//! back up and migrate databases. Each operation validates, persists and
//! hands a job to the scheduler; the heavy lifting happens in the runner.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::lifecycle::action_allowed;
use crate::model::{Database, DbStatus, Job, Stage, Task, TaskAction, TaskData, TaskStatus};
use crate::registry::InstanceRegistry;
use crate::scheduler::SchedulerHandle;
use crate::store::TaskStore;

/// Names PostgreSQL itself owns.
const RESERVED_NAMES: &[&str] = &["postgres", "template0", "template1"];

/// Parameters for provisioning a database.
#[derive(Debug, Clone)]
pub struct CreateDatabaseRequest {
    pub name: String,
    pub owner: String,
    pub password: String,
    pub instance_name: String,
    /// Existing database to clone via dump and restore.
    pub backup_from: Option<String>,
    /// Caller-chosen id for idempotent retries. Generated when absent.
    pub job_id: Option<String>,
}

/// The coordinator facade.
pub struct Coordinator {
    store: Arc<dyn TaskStore>,
    registry: Arc<InstanceRegistry>,
    scheduler: SchedulerHandle,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<InstanceRegistry>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Provision a database: create the owner role, the database itself,
    /// optionally clone content from `backup_from`, then wait for it to
    /// accept connections.
    ///
    /// Re-submitting with the same `job_id` returns the existing record
    /// without scheduling anything.
    #[instrument(skip(self, req), fields(db = %req.name, instance = %req.instance_name))]
    pub async fn create_database(&self, req: CreateDatabaseRequest) -> Result<Database> {
        require_nonempty("name", &req.name)?;
        require_nonempty("owner", &req.owner)?;
        require_nonempty("password", &req.password)?;
        require_nonempty("instance_name", &req.instance_name)?;
        if RESERVED_NAMES.contains(&req.name.as_str()) {
            return Err(CoreError::ReservedName {
                name: req.name.clone(),
            });
        }

        let job_id = req
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let db = match self
            .store
            .get_database(&req.instance_name, &req.name)
            .await?
        {
            Some(existing) => {
                if existing.owner != req.owner {
                    return Err(CoreError::OwnerMismatch {
                        name: req.name.clone(),
                        expected: existing.owner.clone(),
                        actual: req.owner.clone(),
                    });
                }
                if existing.last_job_id.as_deref() == Some(job_id.as_str()) {
                    info!(job_id, "job already submitted, returning current state");
                    return Ok(existing);
                }
                existing
            }
            None => {
                let now = Utc::now();
                let db = Database {
                    id: Uuid::new_v4().to_string(),
                    name: req.name.clone(),
                    owner: req.owner.clone(),
                    instance_name: req.instance_name.clone(),
                    stage: Stage::None,
                    status: DbStatus::Processing,
                    migrate_from: req.backup_from.as_ref().map(|_| req.instance_name.clone()),
                    migrate_to: None,
                    expired_at: None,
                    last_job_id: None,
                    error_msg: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.create_database(&db).await?;
                db
            }
        };

        let mut tasks = Vec::new();
        let create_user = new_task(
            &job_id,
            &db,
            TaskAction::CreateUser,
            TaskData {
                owner: Some(req.owner.clone()),
                password: Some(req.password.clone()),
                ..Default::default()
            },
        );
        let create_db = new_task(
            &job_id,
            &db,
            TaskAction::CreateDatabase,
            TaskData {
                owner: Some(req.owner.clone()),
                depends_on: vec![create_user.id.clone()],
                ..Default::default()
            },
        );
        let mut last_id = create_db.id.clone();
        tasks.push(create_user);
        tasks.push(create_db);

        if let Some(source) = &req.backup_from {
            let backup = new_task(
                &job_id,
                &db,
                TaskAction::Backup,
                TaskData {
                    backup_from: Some(source.clone()),
                    depends_on: vec![last_id.clone()],
                    ..Default::default()
                },
            );
            let restore = new_task(
                &job_id,
                &db,
                TaskAction::Restore,
                TaskData {
                    backup_from: Some(source.clone()),
                    depends_on: vec![backup.id.clone()],
                    ..Default::default()
                },
            );
            last_id = restore.id.clone();
            tasks.push(backup);
            tasks.push(restore);
        }

        tasks.push(new_task(
            &job_id,
            &db,
            TaskAction::WaitReady,
            TaskData {
                depends_on: vec![last_id],
                ..Default::default()
            },
        ));

        self.submit(&db, job_id, tasks).await?;
        Ok(db)
    }

    /// Hand a database over to another owner. A no-op when the database has
    /// already left this fleet.
    #[instrument(skip(self), fields(db = %name, instance = %instance))]
    pub async fn migrate_out(
        &self,
        instance: &str,
        name: &str,
        migrate_to: &str,
    ) -> Result<Database> {
        require_nonempty("migrate_to", migrate_to)?;
        let db = self.require_database(instance, name).await?;
        if db.is_migrated() {
            info!(stage = %db.stage, "already migrated out");
            return Ok(db);
        }
        action_allowed(&db, TaskAction::MigrateOut)?;

        let job_id = Uuid::new_v4().to_string();
        let task = new_task(
            &job_id,
            &db,
            TaskAction::MigrateOut,
            TaskData {
                migrate_to: Some(migrate_to.to_string()),
                ..Default::default()
            },
        );
        self.submit(&db, job_id, vec![task]).await?;
        Ok(db)
    }

    /// Schedule a dump of a ready database.
    #[instrument(skip(self), fields(db = %name, instance = %instance))]
    pub async fn schedule_daily_backup(&self, instance: &str, name: &str) -> Result<String> {
        let db = self.require_database(instance, name).await?;
        action_allowed(&db, TaskAction::DailyBackup)?;

        let job_id = Uuid::new_v4().to_string();
        let task = new_task(&job_id, &db, TaskAction::DailyBackup, TaskData::default());
        self.submit(&db, job_id.clone(), vec![task]).await?;
        Ok(job_id)
    }

    pub async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<()> {
        self.scheduler.cancel_job(job_id, reason).await
    }

    pub async fn get_database(&self, instance: &str, name: &str) -> Result<Option<Database>> {
        self.store.get_database(instance, name).await
    }

    pub async fn list_databases(&self, instance: &str) -> Result<Vec<Database>> {
        self.store.list_databases(instance).await
    }

    /// Whether the database has completed provisioning.
    pub async fn is_ready(&self, instance: &str, name: &str) -> Result<bool> {
        Ok(self.require_database(instance, name).await?.is_ready_to_use())
    }

    /// All tasks of a job, for status inspection.
    pub async fn job_tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        self.store.list_job_tasks(job_id).await
    }

    /// The job as a derived view over its persisted tasks; done and failed
    /// aggregates come from [`Job::is_done`] and [`Job::is_failed`].
    pub async fn job(&self, job_id: &str) -> Result<Job> {
        Ok(Job::new(job_id, self.store.list_job_tasks(job_id).await?))
    }

    async fn require_database(&self, instance: &str, name: &str) -> Result<Database> {
        self.store
            .get_database(instance, name)
            .await?
            .ok_or_else(|| CoreError::DatabaseNotFound {
                instance: instance.to_string(),
                name: name.to_string(),
            })
    }

    async fn submit(&self, db: &Database, job_id: String, tasks: Vec<Task>) -> Result<()> {
        self.store.create_tasks(&tasks).await?;
        self.store.set_last_job(&db.id, &job_id).await?;
        info!(job_id, tasks = tasks.len(), "job submitted");
        self.scheduler.add_job(Job { id: job_id, tasks }).await
    }
}

fn new_task(job_id: &str, db: &Database, action: TaskAction, data: TaskData) -> Task {
    let now = Utc::now();
    Task {
        id: Uuid::new_v4().to_string(),
        job_id: job_id.to_string(),
        db_id: db.id.clone(),
        db_name: db.name.clone(),
        instance_name: db.instance_name.clone(),
        action,
        status: TaskStatus::Pending,
        reason: None,
        data,
        created_at: now,
        updated_at: now,
    }
}

fn require_nonempty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoreError::ValidationError {
            field: field.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(())
}
