// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator configuration, loaded from `PGFLEET_*` environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::handlers::RunnerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    Missing { var: String },
    #[error("invalid value for {var}: {message}")]
    Invalid { var: String, message: String },
}

/// Runtime configuration for the coordinator process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store backend. `sqlite:` URLs select the embedded store, anything
    /// else is treated as PostgreSQL.
    pub database_url: String,
    pub quic_port: u16,
    pub max_concurrent_tasks: usize,
    /// `token=instance` pairs, comma separated. `*` scopes a token to any
    /// instance.
    pub agent_tokens: String,
    /// Administrative connection URL per instance.
    pub instance_urls: HashMap<String, String>,
    pub backup_dir: PathBuf,
    pub pg_dump: String,
    pub pg_restore: String,
    pub retention_hours: u64,
    pub push_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require("PGFLEET_DATABASE_URL")?,
            quic_port: parse_or("PGFLEET_QUIC_PORT", 7401)?,
            max_concurrent_tasks: parse_or("PGFLEET_MAX_CONCURRENT_TASKS", 8)?,
            agent_tokens: std::env::var("PGFLEET_AGENT_TOKENS").unwrap_or_default(),
            instance_urls: parse_instance_urls(
                &std::env::var("PGFLEET_INSTANCE_URLS").unwrap_or_default(),
            )?,
            backup_dir: PathBuf::from(
                std::env::var("PGFLEET_BACKUP_DIR")
                    .unwrap_or_else(|_| "/var/lib/pgfleet/backups".to_string()),
            ),
            pg_dump: std::env::var("PGFLEET_PG_DUMP").unwrap_or_else(|_| "pg_dump".to_string()),
            pg_restore: std::env::var("PGFLEET_PG_RESTORE")
                .unwrap_or_else(|_| "pg_restore".to_string()),
            retention_hours: parse_or("PGFLEET_RETENTION_HOURS", 168)?,
            push_timeout_secs: parse_or("PGFLEET_PUSH_TIMEOUT_SECS", 60)?,
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            backup_dir: self.backup_dir.clone(),
            pg_dump: self.pg_dump.clone(),
            pg_restore: self.pg_restore.clone(),
            retention: Duration::from_secs(self.retention_hours * 3600),
            push_timeout: Duration::from_secs(self.push_timeout_secs),
            ..RunnerConfig::default()
        }
    }
}

fn require(var: &str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::Missing {
        var: var.to_string(),
    })
}

fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            var: var.to_string(),
            message: format!("cannot parse '{}'", value),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `pg-1=postgres://...,pg-2=postgres://...` into a map.
fn parse_instance_urls(spec: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut urls = HashMap::new();
    for pair in spec.split(',').filter(|p| !p.trim().is_empty()) {
        let Some((name, url)) = pair.split_once('=') else {
            return Err(ConfigError::Invalid {
                var: "PGFLEET_INSTANCE_URLS".to_string(),
                message: format!("expected name=url, got '{}'", pair),
            });
        };
        urls.insert(name.trim().to_string(), url.trim().to_string());
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            let saved = vars
                .iter()
                .map(|(k, v)| {
                    let old = std::env::var(k).ok();
                    unsafe { std::env::set_var(k, v) };
                    (*k, old)
                })
                .collect();
            Self { vars: saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, old) in &self.vars {
                match old {
                    Some(v) => unsafe { std::env::set_var(k, v) },
                    None => unsafe { std::env::remove_var(k) },
                }
            }
        }
    }

    #[test]
    fn test_defaults_applied() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::set(&[("PGFLEET_DATABASE_URL", "sqlite:/tmp/fleet.db")]);

        let config = Config::from_env().unwrap();
        assert_eq!(config.quic_port, 7401);
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.retention_hours, 168);
        assert!(config.instance_urls.is_empty());
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let old = std::env::var("PGFLEET_DATABASE_URL").ok();
        unsafe { std::env::remove_var("PGFLEET_DATABASE_URL") };

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));

        if let Some(v) = old {
            unsafe { std::env::set_var("PGFLEET_DATABASE_URL", v) };
        }
    }

    #[test]
    fn test_instance_urls_parsed() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::set(&[
            ("PGFLEET_DATABASE_URL", "sqlite:/tmp/fleet.db"),
            (
                "PGFLEET_INSTANCE_URLS",
                "pg-1=postgres://admin@pg-1/postgres, pg-2=postgres://admin@pg-2/postgres",
            ),
        ]);

        let config = Config::from_env().unwrap();
        assert_eq!(config.instance_urls.len(), 2);
        assert_eq!(
            config.instance_urls["pg-2"],
            "postgres://admin@pg-2/postgres"
        );
    }

    #[test]
    fn test_invalid_port_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::set(&[
            ("PGFLEET_DATABASE_URL", "sqlite:/tmp/fleet.db"),
            ("PGFLEET_QUIC_PORT", "not-a-port"),
        ]);

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }
}
