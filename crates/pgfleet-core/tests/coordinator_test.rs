// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator API: provisioning jobs, idempotency, migrate-out.

mod common;

use std::sync::Arc;

use pgfleet_core::api::{Coordinator, CreateDatabaseRequest};
use pgfleet_core::model::{DbStatus, Stage, TaskAction, TaskStatus};
use pgfleet_core::registry::InstanceRegistry;
use pgfleet_core::scheduler::Scheduler;
use pgfleet_core::store::TaskStore;

use common::{MockRunner, sqlite_store, wait_for_task_status};

async fn coordinator() -> (Coordinator, Arc<dyn TaskStore>, tempfile::TempDir) {
    let (store, dir) = sqlite_store().await;
    let store: Arc<dyn TaskStore> = store;
    let registry = Arc::new(InstanceRegistry::new());
    let runner = Arc::new(MockRunner::new());
    let (scheduler, handle) = Scheduler::new(store.clone(), runner, 4);
    tokio::spawn(scheduler.run());
    (
        Coordinator::new(store.clone(), registry, handle),
        store,
        dir,
    )
}

fn request(name: &str) -> CreateDatabaseRequest {
    CreateDatabaseRequest {
        name: name.to_string(),
        owner: format!("{}_owner", name),
        password: "s3cret".to_string(),
        instance_name: "pg-1".to_string(),
        backup_from: None,
        job_id: Some(format!("job-{}", name)),
    }
}

#[tokio::test]
async fn test_create_database_schedules_provisioning_chain() {
    let (coordinator, store, _dir) = coordinator().await;

    let db = coordinator.create_database(request("shop")).await.unwrap();
    assert_eq!(db.stage, Stage::None);
    assert_eq!(db.status, DbStatus::Processing);

    let tasks = coordinator.job_tasks("job-shop").await.unwrap();
    let actions: Vec<TaskAction> = tasks.iter().map(|t| t.action).collect();
    assert_eq!(
        actions,
        vec![
            TaskAction::CreateUser,
            TaskAction::CreateDatabase,
            TaskAction::WaitReady,
        ]
    );

    // Dependencies form a single chain
    assert!(tasks[0].data.depends_on.is_empty());
    assert_eq!(tasks[1].data.depends_on, vec![tasks[0].id.clone()]);
    assert_eq!(tasks[2].data.depends_on, vec![tasks[1].id.clone()]);

    let last = tasks.last().unwrap().id.clone();
    wait_for_task_status(store.as_ref(), &last, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_clone_request_adds_backup_and_restore() {
    let (coordinator, _store, _dir) = coordinator().await;

    let mut req = request("replica");
    req.backup_from = Some("shop".to_string());
    coordinator.create_database(req).await.unwrap();

    let tasks = coordinator.job_tasks("job-replica").await.unwrap();
    let actions: Vec<TaskAction> = tasks.iter().map(|t| t.action).collect();
    assert_eq!(
        actions,
        vec![
            TaskAction::CreateUser,
            TaskAction::CreateDatabase,
            TaskAction::Backup,
            TaskAction::Restore,
            TaskAction::WaitReady,
        ]
    );
    assert_eq!(tasks[2].data.backup_from.as_deref(), Some("shop"));
    assert_eq!(tasks[3].data.backup_from.as_deref(), Some("shop"));
}

#[tokio::test]
async fn test_same_job_id_does_not_schedule_twice() {
    let (coordinator, _store, _dir) = coordinator().await;

    coordinator.create_database(request("shop")).await.unwrap();
    let first = coordinator.job_tasks("job-shop").await.unwrap();

    // Replay with the same job id: the record comes back, no new tasks
    let db = coordinator.create_database(request("shop")).await.unwrap();
    assert_eq!(db.name, "shop");
    let second = coordinator.job_tasks("job-shop").await.unwrap();
    assert_eq!(first.len(), second.len());
}

#[tokio::test]
async fn test_reserved_names_rejected() {
    let (coordinator, _store, _dir) = coordinator().await;

    for name in ["postgres", "template0", "template1"] {
        let err = coordinator.create_database(request(name)).await.unwrap_err();
        assert_eq!(err.error_code(), "RESERVED_NAME");
    }
}

#[tokio::test]
async fn test_owner_mismatch_rejected() {
    let (coordinator, _store, _dir) = coordinator().await;

    coordinator.create_database(request("shop")).await.unwrap();

    let mut req = request("shop");
    req.owner = "someone_else".to_string();
    req.job_id = Some("job-shop-2".to_string());
    let err = coordinator.create_database(req).await.unwrap_err();
    assert_eq!(err.error_code(), "OWNER_MISMATCH");
}

#[tokio::test]
async fn test_migrate_out_requires_ready_database() {
    let (coordinator, _store, _dir) = coordinator().await;

    coordinator.create_database(request("shop")).await.unwrap();
    // Still at stage none: not eligible for handover
    let err = coordinator
        .migrate_out("pg-1", "shop", "pg-2")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
}

#[tokio::test]
async fn test_migrate_out_is_noop_after_handover() {
    let (coordinator, store, _dir) = coordinator().await;

    let db = coordinator.create_database(request("shop")).await.unwrap();
    store
        .update_database_state(&db.id, Stage::Idle, DbStatus::Processing, None)
        .await
        .unwrap();
    let before = store.list_job_tasks("job-shop").await.unwrap().len();

    let migrated = coordinator.migrate_out("pg-1", "shop", "pg-2").await.unwrap();
    assert!(migrated.is_migrated());

    // No new job was attached to the database
    let after = store
        .get_database("pg-1", "shop")
        .await
        .unwrap()
        .unwrap()
        .last_job_id;
    assert_eq!(after.as_deref(), Some("job-shop"));
    assert_eq!(
        store.list_job_tasks("job-shop").await.unwrap().len(),
        before
    );
}

#[tokio::test]
async fn test_unknown_database_reported() {
    let (coordinator, _store, _dir) = coordinator().await;

    let err = coordinator
        .migrate_out("pg-1", "ghost", "pg-2")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "DATABASE_NOT_FOUND");

    assert!(coordinator.is_ready("pg-1", "ghost").await.is_err());
}
