//! Connection pool management and environment configuration.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use taxa_core::{Error, Result};

/// Default maximum number of connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Pool configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long to wait for a connection before failing.
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the environment, keeping defaults for unset
    /// variables:
    ///
    /// - `DATABASE_MAX_CONNECTIONS`
    /// - `DATABASE_MIN_CONNECTIONS`
    /// - `DATABASE_CONNECT_TIMEOUT_SECS`
    /// - `DATABASE_IDLE_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(n) = parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(n) = parse_var(&lookup, "DATABASE_MIN_CONNECTIONS")? {
            config.min_connections = n;
        }
        if let Some(secs) = parse_var(&lookup, "DATABASE_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "DATABASE_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if config.min_connections > config.max_connections {
            return Err(Error::Config(format!(
                "DATABASE_MIN_CONNECTIONS ({}) exceeds DATABASE_MAX_CONNECTIONS ({})",
                config.min_connections, config.max_connections
            )));
        }
        Ok(config)
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    fn options(&self) -> PgPoolOptions {
        let mut options = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.connect_timeout)
            .idle_timeout(self.idle_timeout);
        if let Some(max_lifetime) = self.max_lifetime {
            options = options.max_lifetime(max_lifetime);
        }
        options
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))),
    }
}

/// `DATABASE_URL` from the environment.
pub fn database_url_from_env() -> Result<String> {
    std::env::var("DATABASE_URL").map_err(|_| Error::Config("DATABASE_URL is not set".to_string()))
}

/// Create a new PostgreSQL connection pool with default configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

/// Create a new PostgreSQL connection pool with custom configuration.
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    connect_with_options(database_url, &config, config.options()).await
}

/// Like [`create_pool_with_config`], but every connection starts with
/// `search_path` set to `schema`.
pub async fn create_scoped_pool(
    database_url: &str,
    config: PoolConfig,
    schema: &str,
) -> Result<PgPool> {
    let statement = format!("SET search_path TO {}, public", schema);
    let options = config.options().after_connect(move |conn, _meta| {
        let statement = statement.clone();
        Box::pin(async move {
            sqlx::query(&statement).execute(&mut *conn).await?;
            Ok(())
        })
    });
    connect_with_options(database_url, &config, options).await
}

async fn connect_with_options(
    database_url: &str,
    config: &PoolConfig,
    options: PgPoolOptions,
) -> Result<PgPool> {
    let start = Instant::now();

    info!(
        subsystem = "database",
        component = "pool",
        op = "create",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        connect_timeout_secs = config.connect_timeout.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Creating database connection pool"
    );

    let pool = options
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "established",
        pool_size = pool.size(),
        pool_idle = pool.num_idle(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Log current pool health; warns when no idle connection is left.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "database",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool health check"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = size,
            "Connection pool has no idle connections"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new()
            .max_connections(20)
            .min_connections(5)
            .connect_timeout(Duration::from_secs(60));

        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_from_env_defaults_when_unset() {
        let config = PoolConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PoolConfig::default());
    }

    #[test]
    fn test_from_env_overrides() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DATABASE_MAX_CONNECTIONS", "32"),
            ("DATABASE_MIN_CONNECTIONS", " 4 "),
            ("DATABASE_CONNECT_TIMEOUT_SECS", "5"),
            ("DATABASE_IDLE_TIMEOUT_SECS", "90"),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.min_connections, 4);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        let err = PoolConfig::from_lookup(lookup(&[("DATABASE_MAX_CONNECTIONS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("DATABASE_MAX_CONNECTIONS")));
    }

    #[test]
    fn test_from_env_rejects_inverted_bounds() {
        let err = PoolConfig::from_lookup(lookup(&[
            ("DATABASE_MAX_CONNECTIONS", "2"),
            ("DATABASE_MIN_CONNECTIONS", "3"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
