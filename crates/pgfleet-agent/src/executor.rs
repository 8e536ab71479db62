// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution of pushed tasks against the local PostgreSQL server.
//!
//! The executor keeps an in-memory snapshot of every database state it has
//! reported. The snapshot rides along on re-registration, so changes made
//! while the coordinator was unreachable still arrive.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use pgfleet_protocol::FleetClient;
use pgfleet_protocol::fleet_proto::{
    DatabaseState, NotifyDbStatusRequest, RpcRequest, RpcResponse, TaskPush, rpc_response,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info, instrument, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;

pub struct LocalExecutor {
    pool: PgPool,
    instance_name: String,
    token: String,
    states: Mutex<HashMap<String, DatabaseState>>,
}

impl LocalExecutor {
    pub async fn connect(config: &AgentConfig) -> Result<Self, AgentError> {
        let pool = PgPoolOptions::new()
            .max_connections(3)
            .connect(&config.database_url)
            .await?;
        Ok(Self {
            pool,
            instance_name: config.instance_name.clone(),
            token: config.token.clone(),
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Version string of the local server, reported at registration.
    pub async fn pg_version(&self) -> Result<String, AgentError> {
        let version: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// States to seed the coordinator cache with at registration.
    pub fn snapshot(&self) -> Vec<DatabaseState> {
        self.states.lock().unwrap().values().cloned().collect()
    }

    /// Run one pushed task and report the outcome.
    #[instrument(skip(self, client, push), fields(task_id = %push.task_id, action = %push.action, db = %push.db_name))]
    pub async fn execute(&self, client: &FleetClient, push: TaskPush) {
        match push.action.as_str() {
            "migrate_out" => {
                let state = match self.migrate_out(&push).await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(error = %e, "migrate-out failed");
                        return;
                    }
                };
                self.states
                    .lock()
                    .unwrap()
                    .insert(state.name.clone(), state.clone());
                self.notify(client, state).await;
            }
            other => {
                warn!(action = other, "unsupported pushed action");
            }
        }
    }

    /// Hand the database over: block new connections, kick existing ones,
    /// report it idle.
    async fn migrate_out(&self, push: &TaskPush) -> Result<DatabaseState, AgentError> {
        let owner: Option<String> = sqlx::query_scalar(
            "SELECT pg_catalog.pg_get_userbyid(datdba) FROM pg_database WHERE datname = $1",
        )
        .bind(&push.db_name)
        .fetch_optional(&self.pool)
        .await?;

        if owner.is_some() {
            let limit = format!(
                "ALTER DATABASE {} WITH CONNECTION LIMIT 0",
                quote_ident(&push.db_name)
            );
            sqlx::query(&limit).execute(&self.pool).await?;

            sqlx::query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
            )
            .bind(&push.db_name)
            .execute(&self.pool)
            .await?;
            info!(db = %push.db_name, "connections drained");
        } else {
            // Already gone locally; reporting idle is still correct
            warn!(db = %push.db_name, "database not found locally");
        }

        Ok(idle_state(
            &self.instance_name,
            &push.db_name,
            owner.as_deref().unwrap_or(""),
        ))
    }

    /// Report one database state; failures are logged, the coordinator will
    /// get the state again from the next registration seed.
    pub async fn notify(&self, client: &FleetClient, state: DatabaseState) {
        let request = RpcRequest::notify_db_status(NotifyDbStatusRequest {
            token: self.token.clone(),
            instance_name: self.instance_name.clone(),
            state: Some(state.clone()),
        });

        match client.request::<_, RpcResponse>(&request).await {
            Ok(response) => match response.response {
                Some(rpc_response::Response::NotifyDbStatus(ack)) if ack.success => {
                    debug!(db = %state.name, "status reported");
                }
                Some(rpc_response::Response::NotifyDbStatus(ack)) => {
                    warn!(db = %state.name, error = %ack.error, "status report not applied");
                }
                other => warn!(db = %state.name, ?other, "unexpected notify response"),
            },
            Err(e) => warn!(db = %state.name, error = %e, "status report failed"),
        }
    }
}

/// The state a database reports after migrate-out.
fn idle_state(instance: &str, name: &str, owner: &str) -> DatabaseState {
    DatabaseState {
        name: name.to_string(),
        owner: owner.to_string(),
        instance_name: instance.to_string(),
        stage: "idle".to_string(),
        status: "processing".to_string(),
        migrate_from: None,
        migrate_to: None,
        expired_at_ms: None,
        updated_at_ms: Utc::now().timestamp_millis(),
        error_msg: None,
    }
}

/// Double-quote an SQL identifier.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
