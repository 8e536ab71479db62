// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent binary.

use std::sync::Arc;

use anyhow::Context;
use pgfleet_agent::{Agent, AgentConfig, LocalExecutor};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgfleet_agent=info,pgfleet_protocol=info".into()),
        )
        .init();

    let config = AgentConfig::from_env().context("failed to load configuration")?;
    info!(
        instance = %config.instance_name,
        coordinator = %config.coordinator_addr,
        "starting agent"
    );

    let executor = Arc::new(
        LocalExecutor::connect(&config)
            .await
            .context("failed to connect to the local PostgreSQL server")?,
    );
    let agent = Agent::new(config, executor)?;
    agent.run().await?;
    Ok(())
}
