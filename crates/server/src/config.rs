//! Server configuration from `STRATUS_*` environment variables.
//!
//! Everything has a default suitable for local development: without a
//! database URL the in-memory stores are used, without collaborator URLs the
//! scripted mock clients stand in.

use std::str::FromStr;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// PostgreSQL URL; absent means in-memory stores.
    pub database_url: Option<String>,
    pub max_db_connections: u32,
    /// Provisioner base URL; absent means the mock client.
    pub provisioner_url: Option<String>,
    /// Reconciler base URL; absent means the mock client.
    pub reconciler_url: Option<String>,
    /// Per-call timeout of the HTTP collaborator clients.
    pub http_timeout_ms: u64,
    pub executor_workers: usize,
    pub default_runtime_version: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: parsed("STRATUS_PORT", 8080)?,
            database_url: optional("STRATUS_DATABASE_URL"),
            max_db_connections: parsed("STRATUS_MAX_DB_CONNECTIONS", 10)?,
            provisioner_url: optional("STRATUS_PROVISIONER_URL"),
            reconciler_url: optional("STRATUS_RECONCILER_URL"),
            http_timeout_ms: parsed("STRATUS_HTTP_TIMEOUT_MS", 30_000)?,
            executor_workers: parsed("STRATUS_EXECUTOR_WORKERS", 4)?,
            default_runtime_version: std::env::var("STRATUS_DEFAULT_RUNTIME_VERSION")
                .unwrap_or_else(|_| "2.0.0".to_string()),
        })
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}
