// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database lifecycle state machine.
//!
//! A database moves through `Stage` values while `DbStatus` tracks whether
//! the current stage's work is in flight, finished or failed:
//!
//! ```text
//! none ──▶ create_user ──▶ create_database ──▶ [backuping] ──▶ [restoring]
//!                                   │                              │
//!                                   └──────────▶ ready_to_use ◀────┘
//!                                                     │ migrate_out
//!                                                     ▼
//!                                    idle ──▶ dropping ──▶ drop_completed
//! ```
//!
//! `backuping` and `restoring` are transient: a successful backup returns the
//! stage to `create_database` (the dump is a side artifact), while a
//! successful restore parks at `restoring` until `wait_ready` confirms the
//! database answers queries. The bracketed stages therefore appear in the
//! legality sets below both as "normal predecessor" and as "retry after a
//! crash mid-stage".

use crate::error::CoreError;
use crate::model::{Database, DbStatus, Stage, TaskAction};

/// Check that `action` is legal for the database's current state.
///
/// Called by the action runner before any mutation; an illegal combination
/// fails the task without touching the database.
pub fn action_allowed(db: &Database, action: TaskAction) -> Result<(), CoreError> {
    let allowed = match action {
        TaskAction::CreateUser => matches!(db.stage, Stage::None | Stage::CreateUser),
        TaskAction::CreateDatabase => matches!(
            db.stage,
            Stage::None | Stage::CreateUser | Stage::CreateDatabase
        ),
        // Initial backup runs right after provisioning; `backuping` re-admits
        // a backup interrupted by a crash.
        TaskAction::Backup => matches!(db.stage, Stage::CreateDatabase | Stage::Backuping),
        TaskAction::DailyBackup => db.is_ready_to_use(),
        TaskAction::Restore => {
            db.status == DbStatus::Done
                && matches!(db.stage, Stage::CreateDatabase | Stage::Restoring)
        }
        TaskAction::WaitReady => {
            db.status == DbStatus::Done
                && matches!(db.stage, Stage::CreateDatabase | Stage::Restoring)
        }
        TaskAction::MigrateOut => db.is_ready_to_use() || db.is_migrated(),
    };

    if allowed {
        Ok(())
    } else {
        Err(CoreError::IllegalTransition {
            name: db.name.clone(),
            action: action.to_string(),
            stage: db.stage.to_string(),
            status: db.status.to_string(),
        })
    }
}

/// The stage a database sits in while `action` executes.
pub fn running_stage(action: TaskAction, current: Stage) -> Stage {
    match action {
        TaskAction::CreateUser => Stage::CreateUser,
        TaskAction::CreateDatabase => Stage::CreateDatabase,
        TaskAction::Backup => Stage::Backuping,
        // Daily backups do not move the database out of service.
        TaskAction::DailyBackup => current,
        TaskAction::Restore => Stage::Restoring,
        TaskAction::WaitReady => current,
        TaskAction::MigrateOut => Stage::Idle,
    }
}

/// The (stage, status) a database lands in when `action` succeeds.
pub fn success_state(action: TaskAction, current: Stage) -> (Stage, DbStatus) {
    match action {
        TaskAction::CreateUser => (Stage::CreateUser, DbStatus::Done),
        TaskAction::CreateDatabase => (Stage::CreateDatabase, DbStatus::Done),
        // The dump is a side artifact; the database itself returns to the
        // provisioned stage so a restore (or wait_ready) can follow.
        TaskAction::Backup => (Stage::CreateDatabase, DbStatus::Done),
        TaskAction::DailyBackup => (current, DbStatus::Done),
        TaskAction::Restore => (Stage::Restoring, DbStatus::Done),
        TaskAction::WaitReady => (Stage::ReadyToUse, DbStatus::Done),
        // Still Processing: the drop on the source side has not happened yet.
        TaskAction::MigrateOut => (Stage::Idle, DbStatus::Processing),
    }
}

/// Whether a state change warrants notifying status subscribers.
///
/// Exact repeats are already dropped by the `updated_at` dedup in the
/// registry; this filters updates that change neither stage nor status
/// (e.g. a refreshed timestamp or error text rewrite).
pub fn meaningful_transition(
    prev: (Stage, DbStatus),
    next: (Stage, DbStatus),
) -> bool {
    prev != next
}
