//! Runtime configuration.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for all settings.
pub const ENV_PREFIX: &str = "CODE_RUNNER_";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Settings shared by the server, the interpreter backends and the shell runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Interpreter command line (split with shell rules).
    pub interpreter: String,
    /// Bound on interpreter startup, including the readiness handshake.
    pub startup_timeout: Duration,
    /// Bound on the wait for each interpreter message during an execution.
    pub message_timeout: Duration,
    /// Bound on one shell command.
    pub shell_timeout: Duration,
    /// Time a backend gets to exit after a shutdown request before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            interpreter: "python3".to_string(),
            startup_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(600),
            shell_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RunnerConfig {
    /// Build the configuration from `CODE_RUNNER_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Keys are the full variable names, e.g. `CODE_RUNNER_ADDR`.
    ///
    /// # Errors
    /// Returns error if a value cannot be parsed.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("ADDR") {
            config.bind_addr = value.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::InvalidValue {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some((key, value)) = get("INTERPRETER") {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key,
                    value,
                    reason: "must not be empty".to_string(),
                });
            }
            config.interpreter = value;
        }
        if let Some((key, value)) = get("STARTUP_TIMEOUT_SECS") {
            config.startup_timeout = parse_secs(key, &value)?;
        }
        if let Some((key, value)) = get("MESSAGE_TIMEOUT_SECS") {
            config.message_timeout = parse_secs(key, &value)?;
        }
        if let Some((key, value)) = get("SHELL_TIMEOUT_SECS") {
            config.shell_timeout = parse_secs(key, &value)?;
        }
        if let Some((key, value)) = get("SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace = parse_secs(key, &value)?;
        }

        Ok(config)
    }
}

fn parse_secs(key: String, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}
