//! Configuration for the quota service

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Database pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL (MySQL/TiDB, or SQLite for local runs and tests)
    pub url: String,

    /// Maximum database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections kept warm
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long a request may wait for a pooled connection, in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Enable SQL query logging
    #[serde(default)]
    pub sqlx_logging: bool,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            acquire_timeout_secs: default_acquire_timeout(),
            sqlx_logging: false,
        }
    }

    /// True for `sqlite::memory:` style URLs, which only exist per connection
    pub fn is_sqlite_memory(&self) -> bool {
        self.url.starts_with("sqlite") && self.url.contains(":memory:")
    }
}

/// Quota service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// JSON file with territories, dealers and products
    pub directory_file: PathBuf,

    /// Upper bound on a single order admission, in milliseconds
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,

    /// Create missing tables on startup
    #[serde(default)]
    pub create_schema: bool,
}

impl ServiceConfig {
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
}

fn default_max_connections() -> u32 {
    50
}

fn default_min_connections() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

pub(crate) fn default_admission_timeout_ms() -> u64 {
    5000
}
