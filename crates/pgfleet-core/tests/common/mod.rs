// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for the coordinator integration tests.
// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use pgfleet_core::error::{CoreError, Result};
use pgfleet_core::model::{Database, DbStatus, Stage, Task, TaskAction, TaskData, TaskStatus};
use pgfleet_core::scheduler::TaskRunner;
use pgfleet_core::store::{SqliteTaskStore, TaskStore};
use tempfile::TempDir;

pub async fn sqlite_store() -> (Arc<SqliteTaskStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = SqliteTaskStore::from_path(&dir.path().join("fleet.db"))
        .await
        .unwrap();
    (Arc::new(store), dir)
}

pub fn database(instance: &str, name: &str) -> Database {
    let now = Utc::now();
    Database {
        id: format!("db-{}-{}", instance, name),
        name: name.to_string(),
        owner: format!("{}_owner", name),
        instance_name: instance.to_string(),
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

pub fn task(id: &str, job_id: &str, db: &Database, action: TaskAction, deps: &[&str]) -> Task {
    let now = Utc::now();
    Task {
        id: id.to_string(),
        job_id: job_id.to_string(),
        db_id: db.id.clone(),
        db_name: db.name.clone(),
        instance_name: db.instance_name.clone(),
        action,
        status: TaskStatus::Pending,
        reason: None,
        data: TaskData {
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        created_at: now,
        updated_at: now,
    }
}

/// Runner that records execution order and fails on request.
pub struct MockRunner {
    pub order: Mutex<Vec<String>>,
    pub failing: Mutex<HashSet<String>>,
    pub cancels: Mutex<Vec<String>>,
    pub delay: Duration,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(5))
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            order: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            cancels: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn fail_task(&self, task_id: &str) {
        self.failing.lock().unwrap().insert(task_id.to_string());
    }

    pub fn ran(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TaskRunner for MockRunner {
    async fn run(&self, task: Task) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.order.lock().unwrap().push(task.id.clone());
        if self.failing.lock().unwrap().contains(&task.id) {
            return Err(CoreError::ExecutionFailed {
                action: task.action.as_str().to_string(),
                details: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn cancel(&self, task: Task, _reason: &str) {
        self.cancels.lock().unwrap().push(task.id);
    }
}

/// Poll until `pred` holds for the task, or panic after five seconds.
pub async fn wait_for_task_status(store: &dyn TaskStore, task_id: &str, status: TaskStatus) {
    for _ in 0..250 {
        if let Some(task) = store.get_task(task_id).await.unwrap()
            && task.status == status
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let actual = store.get_task(task_id).await.unwrap().map(|t| t.status);
    panic!(
        "task {} never reached {:?}, last seen {:?}",
        task_id, status, actual
    );
}
