// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator binary.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use pgfleet_core::{
    ActionRunner, AgentServerState, Config, Coordinator, InstancePools, InstanceRegistry,
    PostgresTaskStore, Scheduler, SqliteTaskStore, StaticTokenAuthenticator, TaskStore,
    run_agent_server,
};
use pgfleet_protocol::server::{FleetServer, FleetServerConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgfleet_core=info,pgfleet_protocol=info".into()),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    let store: Arc<dyn TaskStore> = if let Some(path) = config.database_url.strip_prefix("sqlite:")
    {
        Arc::new(SqliteTaskStore::from_path(Path::new(path)).await?)
    } else {
        Arc::new(PostgresTaskStore::connect(&config.database_url).await?)
    };

    let registry = Arc::new(InstanceRegistry::new());
    let auth = Arc::new(StaticTokenAuthenticator::from_spec(&config.agent_tokens)?);
    let pools = InstancePools::new(config.instance_urls.clone());
    let runner = Arc::new(ActionRunner::new(
        store.clone(),
        registry.clone(),
        pools,
        config.runner_config(),
    ));

    let (mut scheduler, scheduler_handle) =
        Scheduler::new(store.clone(), runner, config.max_concurrent_tasks);
    scheduler
        .recover()
        .await
        .context("crash recovery failed")?;
    let scheduler_task = tokio::spawn(scheduler.run());

    let _coordinator = Coordinator::new(store.clone(), registry.clone(), scheduler_handle.clone());

    let bind_addr: SocketAddr = ([0, 0, 0, 0], config.quic_port).into();
    let server = build_server(bind_addr).context("failed to start QUIC server")?;
    let state = Arc::new(AgentServerState {
        registry,
        auth,
        store: store.clone(),
    });
    let server_task = tokio::spawn(async move {
        if let Err(e) = run_agent_server(server, state).await {
            warn!(error = %e, "agent server stopped");
        }
    });

    info!(addr = %bind_addr, "coordinator running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    scheduler_handle.shutdown().await;
    let _ = scheduler_task.await;
    server_task.abort();
    store.close().await;
    Ok(())
}

/// Use the certificate from `PGFLEET_QUIC_CERT` / `PGFLEET_QUIC_KEY`, or a
/// self-signed one when not configured.
fn build_server(bind_addr: SocketAddr) -> anyhow::Result<FleetServer> {
    let mut server_config = FleetServerConfig::from_env();
    server_config.bind_addr = bind_addr;

    match (
        std::env::var("PGFLEET_QUIC_CERT"),
        std::env::var("PGFLEET_QUIC_KEY"),
    ) {
        (Ok(cert_path), Ok(key_path)) => {
            server_config.cert_pem =
                std::fs::read(&cert_path).with_context(|| format!("reading {}", cert_path))?;
            server_config.key_pem =
                std::fs::read(&key_path).with_context(|| format!("reading {}", key_path))?;
            Ok(FleetServer::new(server_config)?)
        }
        _ => {
            warn!("no TLS certificate configured, using a self-signed one");
            Ok(FleetServer::localhost_with_config(bind_addr, server_config)?)
        }
    }
}
