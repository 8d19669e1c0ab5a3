use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

/// Placeholder replaced with the configured table name.
const TABLE_PLACEHOLDER: &str = "{table}";

/// Embedded schema change with up and down SQL templates.
struct Migration {
    version: u32,
    name: &'static str,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "create_stats",
    up_sql: include_str!("sql/001_create_stats.up.sql"),
    down_sql: include_str!("sql/001_create_stats.down.sql"),
}];

/// Applied schema version as recorded in `schema_migrations`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    pub dirty: bool,
}

/// Schema migration runner.
///
/// Bookkeeping follows golang-migrate's `schema_migrations` table so the
/// schema can also be managed with the `migrate` CLI.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the applied version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<MigrationStatus>> + Send;
}

/// Migrator for the stats table in ClickHouse.
pub struct ClickHouseMigrator {
    pool: Pool,
    table: String,
}

impl ClickHouseMigrator {
    /// Creates a migrator managing `table` through `pool`.
    pub fn new(pool: Pool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations table")?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn read_status(&self) -> Result<MigrationStatus> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok(MigrationStatus::default());
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;

        Ok(MigrationStatus {
            version: u32::try_from(version).context("migration version out of range")?,
            dirty: dirty != 0,
        })
    }

    /// Replaces the recorded version; `None` clears it.
    async fn record(&self, status: Option<MigrationStatus>) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;

        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        let Some(status) = status else {
            return Ok(());
        };

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({}, {}, 1)",
            status.version,
            u8::from(status.dirty),
        );

        handle
            .execute(sql.as_str())
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    async fn execute_template(&self, template: &str) -> Result<()> {
        let sql = render(template, &self.table);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for SQL execution")?;

        for statement in split_statements(&sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let current = self.read_status().await?;
        if current.dirty {
            bail!(
                "migration version {} is dirty, manual intervention required",
                current.version
            );
        }

        let pending: Vec<&Migration> = MIGRATIONS
            .iter()
            .filter(|m| m.version > current.version)
            .collect();

        if pending.is_empty() {
            tracing::info!(version = current.version, "schema up to date");
            return Ok(());
        }

        for migration in &pending {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                table = %self.table,
                "applying migration",
            );

            self.record(Some(MigrationStatus {
                version: migration.version,
                dirty: true,
            }))
            .await?;

            self.execute_template(migration.up_sql)
                .await
                .with_context(|| format!("applying migration {}", migration.version))?;

            self.record(Some(MigrationStatus {
                version: migration.version,
                dirty: false,
            }))
            .await?;
        }

        tracing::info!(applied = pending.len(), "migrations completed");

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let current = self.read_status().await?;
        if current.version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current.version)
            .with_context(|| format!("migration version {} not found", current.version))?;

        tracing::info!(version = migration.version, name = migration.name, "rolling back migration");

        self.record(Some(MigrationStatus {
            version: migration.version,
            dirty: true,
        }))
        .await?;

        self.execute_template(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration {}", migration.version))?;

        let previous = previous_version(migration.version);
        self.record(previous.map(|version| MigrationStatus {
            version,
            dirty: false,
        }))
        .await?;

        tracing::info!(version = previous.unwrap_or(0), "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<MigrationStatus> {
        self.ensure_migrations_table().await?;
        self.read_status().await
    }
}

/// Version applied before `version`, if any.
fn previous_version(version: u32) -> Option<u32> {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < version)
        .max()
}

fn render(template: &str, table: &str) -> String {
    template.replace(TABLE_PLACEHOLDER, table)
}

/// Splits SQL text into individual statements by semicolons.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
