// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent configuration, loaded from `PGFLEET_AGENT_*` environment variables.

use std::net::SocketAddr;

use pgfleet_protocol::FleetClientConfig;

use crate::error::AgentError;

/// Runtime configuration for one instance agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub coordinator_addr: SocketAddr,
    /// Server name for TLS verification.
    pub server_name: String,
    /// Instance this agent manages; must match the token's scope.
    pub instance_name: String,
    pub token: String,
    /// Administrative URL for the local PostgreSQL server.
    pub database_url: String,
    /// Accept any coordinator certificate. Development only.
    pub skip_cert_verify: bool,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, AgentError> {
        let addr_raw = std::env::var("PGFLEET_AGENT_COORDINATOR_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7401".to_string());
        let coordinator_addr =
            addr_raw
                .parse()
                .map_err(|_| AgentError::InvalidConfig {
                    var: "PGFLEET_AGENT_COORDINATOR_ADDR".to_string(),
                    message: format!("cannot parse '{}' as a socket address", addr_raw),
                })?;

        Ok(Self {
            coordinator_addr,
            server_name: std::env::var("PGFLEET_AGENT_SERVER_NAME")
                .unwrap_or_else(|_| "localhost".to_string()),
            instance_name: require("PGFLEET_AGENT_INSTANCE_NAME")?,
            token: require("PGFLEET_AGENT_TOKEN")?,
            database_url: require("PGFLEET_AGENT_DATABASE_URL")?,
            skip_cert_verify: std::env::var("PGFLEET_AGENT_SKIP_CERT_VERIFY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    pub fn client_config(&self) -> FleetClientConfig {
        FleetClientConfig {
            server_addr: self.coordinator_addr,
            server_name: self.server_name.clone(),
            dangerous_skip_cert_verification: self.skip_cert_verify,
            ..Default::default()
        }
    }
}

fn require(var: &str) -> Result<String, AgentError> {
    std::env::var(var).map_err(|_| AgentError::MissingConfig {
        var: var.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn set_required() {
        unsafe {
            std::env::set_var("PGFLEET_AGENT_INSTANCE_NAME", "pg-1");
            std::env::set_var("PGFLEET_AGENT_TOKEN", "tok-1");
            std::env::set_var(
                "PGFLEET_AGENT_DATABASE_URL",
                "postgres://postgres@localhost/postgres",
            );
        }
    }

    fn clear_all() {
        for var in [
            "PGFLEET_AGENT_COORDINATOR_ADDR",
            "PGFLEET_AGENT_SERVER_NAME",
            "PGFLEET_AGENT_INSTANCE_NAME",
            "PGFLEET_AGENT_TOKEN",
            "PGFLEET_AGENT_DATABASE_URL",
            "PGFLEET_AGENT_SKIP_CERT_VERIFY",
        ] {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_all();
        set_required();

        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.coordinator_addr.port(), 7401);
        assert_eq!(config.server_name, "localhost");
        assert!(!config.skip_cert_verify);
        clear_all();
    }

    #[test]
    fn test_missing_token_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var("PGFLEET_AGENT_INSTANCE_NAME", "pg-1");
            std::env::set_var(
                "PGFLEET_AGENT_DATABASE_URL",
                "postgres://postgres@localhost/postgres",
            );
        }

        let err = AgentConfig::from_env().unwrap_err();
        assert!(matches!(err, AgentError::MissingConfig { .. }));
        clear_all();
    }

    #[test]
    fn test_bad_address_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_all();
        set_required();
        unsafe { std::env::set_var("PGFLEET_AGENT_COORDINATOR_ADDR", "not-an-addr") };

        let err = AgentConfig::from_env().unwrap_err();
        assert!(matches!(err, AgentError::InvalidConfig { .. }));
        clear_all();
    }
}
