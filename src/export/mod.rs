pub mod health;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

/// Native-protocol connection pool for the ClickHouse exporter and migrations.
///
/// LZ4 compression, between 2 and 5 pooled connections.
pub struct ClickHouseConnection {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
}

impl ClickHouseConnection {
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the pool and verifies connectivity with a ping.
    pub async fn connect(&mut self) -> Result<&Pool> {
        let pool = Pool::new(dsn(&self.cfg));

        let mut handle = pool
            .get_handle()
            .await
            .with_context(|| format!("opening ClickHouse connection to {}", self.cfg.endpoint))?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "ClickHouse connected",
        );

        Ok(self.pool.insert(pool))
    }

    /// Returns the pool once connected.
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Fully qualified target table, `database.table`.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.cfg.database, self.cfg.table)
    }

    /// Releases the pool.
    pub fn close(&mut self) {
        if self.pool.take().is_some() {
            tracing::debug!(endpoint = %self.cfg.endpoint, "ClickHouse pool closed");
        }
    }
}

/// Builds a clickhouse-rs TCP DSN.
///
/// Format: `tcp://[user[:pass]@]host:port/database?options`
pub fn dsn(cfg: &ClickHouseConfig) -> String {
    let mut dsn = "tcp://".to_string();

    if !cfg.username.is_empty() {
        dsn.push_str(&cfg.username);
        if !cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&cfg.password);
        }
        dsn.push('@');
    }

    dsn.push_str(&cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&cfg.database);
    dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

    dsn
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(username: &str, password: &str) -> ClickHouseConfig {
        ClickHouseConfig {
            endpoint: "ch:9000".to_string(),
            database: "clicks".to_string(),
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dsn_variants() {
        assert_eq!(
            dsn(&cfg("user", "pass")),
            "tcp://user:pass@ch:9000/clicks?compression=lz4&pool_min=2&pool_max=5"
        );
        assert_eq!(
            dsn(&cfg("admin", "")),
            "tcp://admin@ch:9000/clicks?compression=lz4&pool_min=2&pool_max=5"
        );
        // A password without a username is ignored.
        assert_eq!(
            dsn(&cfg("", "secret")),
            "tcp://ch:9000/clicks?compression=lz4&pool_min=2&pool_max=5"
        );
    }

    #[test]
    fn test_qualified_table() {
        let conn = ClickHouseConnection::new(cfg("", ""));
        assert_eq!(conn.qualified_table(), "clicks.stats");
        assert!(conn.pool().is_none());
    }
}
