//! Datastore connection pool configuration.

use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use meridian_core::{StorageError, StorageResult};
use std::time::Duration;
use tokio_postgres::NoTls;

/// Environment prefix of the primary store.
pub const PRIMARY_ENV_PREFIX: &str = "MERIDIAN_DB_";
/// Environment prefix of the secondary (archival) store.
pub const SECONDARY_ENV_PREFIX: &str = "MERIDIAN_BACKUP_DB_";

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection wait timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "meridian".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Primary store configuration from `MERIDIAN_DB_*`.
    pub fn primary_from_env() -> Self {
        Self::from_env_prefixed(PRIMARY_ENV_PREFIX, "meridian")
    }

    /// Secondary store configuration from `MERIDIAN_BACKUP_DB_*`.
    pub fn secondary_from_env() -> Self {
        Self::from_env_prefixed(SECONDARY_ENV_PREFIX, "meridian_backup")
    }

    /// Read `{prefix}HOST`, `PORT`, `NAME`, `USER`, `PASSWORD`, `POOL_SIZE`
    /// and `TIMEOUT`, falling back to defaults.
    pub fn from_env_prefixed(prefix: &str, default_dbname: &str) -> Self {
        let var = |name: &str| std::env::var(format!("{prefix}{name}")).ok();
        let defaults = Self::default();
        Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: var("PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: var("NAME").unwrap_or_else(|| default_dbname.to_string()),
            user: var("USER").unwrap_or(defaults.user),
            password: var("PASSWORD").unwrap_or_default(),
            max_size: var("POOL_SIZE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: var("TIMEOUT")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> StorageResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = deadpool_postgres::PoolConfig::new(self.max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Pool {
                reason: format!("Failed to create pool: {}", e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_unset_prefix() {
        let config = DbConfig::from_env_prefixed("MERIDIAN_TEST_UNSET_PREFIX_", "archive");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "archive");
        assert_eq!(config.max_size, 16);
    }
}
