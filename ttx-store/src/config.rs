//! Configuration for the transaction store

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage backend selected at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// SQLite through sqlx
    #[default]
    Sqlite,
    /// Process-local tables, lost on exit
    Memory,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend
    pub driver: Driver,

    /// SQLite configuration
    pub sqlite: SqliteConfig,

    /// Token lock configuration
    pub locks: LockConfig,

    /// Identity cache configuration
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: Driver::Sqlite,
            sqlite: SqliteConfig::default(),
            locks: LockConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// SQLite configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Connection URL, e.g. `sqlite://./data/ttx.db`
    pub url: String,

    /// Pool size
    pub max_connections: u32,

    /// How long a writer waits on a locked database (milliseconds)
    pub busy_timeout_ms: u64,

    /// Create tables on open
    pub create_schema: bool,

    /// Prefix for every table name
    pub table_prefix: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/ttx.db".to_string(),
            max_connections: 10,
            busy_timeout_ms: 5_000,
            create_schema: true,
            table_prefix: String::new(),
        }
    }
}

/// Token lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Age after which a lock is considered abandoned (seconds)
    pub lease_expiry_secs: u64,

    /// Period of the cleanup task (seconds)
    pub cleanup_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_expiry_secs: 300,    // 5 minutes
            cleanup_interval_secs: 60,
        }
    }
}

impl LockConfig {
    /// Lease as a duration
    pub fn lease_expiry(&self) -> Duration {
        Duration::from_secs(self.lease_expiry_secs)
    }

    /// Cleanup period as a duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Identity cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries kept for signer-info existence
    pub signer_info_capacity: usize,

    /// Entries kept for audit info
    pub audit_info_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            signer_info_capacity: 1_000,
            audit_info_capacity: 1_000,
        }
    }
}

impl Config {
    /// In-memory configuration, handy for tests and tooling
    pub fn memory() -> Self {
        Self {
            driver: Driver::Memory,
            ..Self::default()
        }
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(driver) = std::env::var("TTX_DRIVER") {
            config.driver = match driver.to_ascii_lowercase().as_str() {
                "sqlite" => Driver::Sqlite,
                "memory" => Driver::Memory,
                other => {
                    return Err(crate::Error::Config(format!("unknown driver '{}'", other)))
                }
            };
        }

        if let Ok(url) = std::env::var("TTX_SQLITE_URL") {
            config.sqlite.url = url;
        }

        if let Ok(prefix) = std::env::var("TTX_TABLE_PREFIX") {
            config.sqlite.table_prefix = prefix;
        }

        if let Ok(lease) = std::env::var("TTX_LOCK_LEASE_SECS") {
            config.locks.lease_expiry_secs = lease
                .parse()
                .map_err(|e| crate::Error::Config(format!("TTX_LOCK_LEASE_SECS: {}", e)))?;
        }

        if let Ok(interval) = std::env::var("TTX_LOCK_CLEANUP_SECS") {
            config.locks.cleanup_interval_secs = interval
                .parse()
                .map_err(|e| crate::Error::Config(format!("TTX_LOCK_CLEANUP_SECS: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.driver == Driver::Sqlite {
            if self.sqlite.url.is_empty() {
                return Err(crate::Error::Config("sqlite url is required".to_string()));
            }
            if self.sqlite.max_connections == 0 {
                return Err(crate::Error::Config(
                    "sqlite max_connections cannot be 0".to_string(),
                ));
            }
        }

        let prefix_ok = self
            .sqlite
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !prefix_ok {
            return Err(crate::Error::Config(format!(
                "illegal character in table prefix '{}'",
                self.sqlite.table_prefix
            )));
        }

        if self.locks.lease_expiry_secs == 0 {
            return Err(crate::Error::Config("lock lease cannot be 0".to_string()));
        }

        Ok(())
    }
}
