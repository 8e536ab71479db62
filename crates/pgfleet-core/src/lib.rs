// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator for a fleet of PostgreSQL instances.
//!
//! The coordinator owns the record of every managed database, schedules the
//! work to provision, back up and migrate them, and talks to per-instance
//! agents over QUIC. The main moving parts:
//!
//! - [`api::Coordinator`]: the operations callers invoke
//! - [`scheduler::Scheduler`]: dependency-ordered, crash-recoverable task
//!   execution
//! - [`handlers::ActionRunner`]: runs each action against PostgreSQL
//! - [`registry::InstanceRegistry`]: live agents, cached database state and
//!   task delivery with at-least-once semantics
//! - [`store`]: SQLite or PostgreSQL persistence behind one trait

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;

pub use api::{Coordinator, CreateDatabaseRequest};
pub use auth::{AgentAuthenticator, AgentIdentity, StaticTokenAuthenticator};
pub use config::{Config, ConfigError};
pub use error::{CoreError, Result};
pub use handlers::{ActionRunner, InstancePools, RunnerConfig};
pub use model::{Database, DbStatus, Job, Stage, Task, TaskAction, TaskData, TaskStatus};
pub use registry::{DbStatusEvent, InstanceEvent, InstanceRegistry};
pub use scheduler::{Scheduler, SchedulerHandle, TaskRunner};
pub use server::{AgentServerState, run_agent_server};
pub use store::{PostgresTaskStore, SqliteTaskStore, TaskStore};
