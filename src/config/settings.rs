use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::registry::{ConnectionLimits, StalePolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Heartbeat probe interval in seconds (server pings each connection)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Idle timeout in seconds (connection is stale with no activity)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Health sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    /// Consecutive probe failures before auto-disconnect
    #[serde(default = "default_max_heartbeat_failures")]
    pub max_heartbeat_failures: u32,
    /// Total error budget before the sweep removes a connection
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    #[serde(default = "default_max_connections_per_tenant")]
    pub max_connections_per_tenant: usize,
    #[serde(default = "default_max_total_connections")]
    pub max_total_connections: usize,
}

impl ConnectionConfig {
    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_total_connections: self.max_total_connections,
            max_connections_per_tenant: self.max_connections_per_tenant,
        }
    }

    pub fn stale_policy(&self) -> StalePolicy {
        StalePolicy {
            idle_timeout_secs: self.idle_timeout as i64,
            max_heartbeat_failures: self.max_heartbeat_failures,
            max_errors: self.max_errors,
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30 // 30 seconds
}

fn default_idle_timeout() -> u64 {
    120 // 2 minutes
}

fn default_sweep_interval() -> u64 {
    60 // 1 minute
}

fn default_max_heartbeat_failures() -> u32 {
    3
}

fn default_max_errors() -> u32 {
    10
}

fn default_max_connections_per_tenant() -> usize {
    1000
}

fn default_max_total_connections() -> usize {
    10000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("connection.heartbeat_interval", 30)?
            .set_default("connection.idle_timeout", 120)?
            .set_default("connection.sweep_interval", 60)?
            .set_default("connection.max_heartbeat_failures", 3)?
            .set_default("connection.max_errors", 10)?
            .set_default("connection.max_connections_per_tenant", 1000)?
            .set_default("connection.max_total_connections", 10000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, CONNECTION_HEARTBEAT_INTERVAL, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            max_heartbeat_failures: default_max_heartbeat_failures(),
            max_errors: default_max_errors(),
            max_connections_per_tenant: default_max_connections_per_tenant(),
            max_total_connections: default_max_total_connections(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8082);

        let connection = ConnectionConfig::default();
        assert_eq!(connection.heartbeat_interval, 30);
        assert_eq!(connection.idle_timeout, 120);
        assert_eq!(connection.max_heartbeat_failures, 3);
    }

    #[test]
    fn test_policy_from_config() {
        let connection = ConnectionConfig::default();
        let policy = connection.stale_policy();
        assert_eq!(policy.idle_timeout_secs, 120);
        assert_eq!(policy.max_errors, 10);

        let limits = connection.limits();
        assert_eq!(limits.max_total_connections, 10000);
        assert_eq!(limits.max_connections_per_tenant, 1000);
    }
}
