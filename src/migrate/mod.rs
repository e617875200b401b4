use std::future::Future;

use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

/// Table recording the applied schema version.
const VERSION_TABLE: &str = "logagg_schema_migrations";

/// One embedded schema change.
struct Migration {
    version: u32,
    name: &'static str,
    up: &'static str,
    down: &'static str,
}

/// Embedded migrations, ascending by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "init",
    up: include_str!("sql/001_init.up.sql"),
    down: include_str!("sql/001_init.down.sql"),
}];

/// Applies and rolls back the `request_counts` schema.
pub trait Migrator: Send {
    /// Applies every migration newer than the recorded version.
    fn up(&self) -> impl Future<Output = Result<()>> + Send;

    /// Reverts the most recently applied migration.
    fn down(&self) -> impl Future<Output = Result<()>> + Send;

    /// Returns the recorded version and whether the last run was interrupted.
    fn status(&self) -> impl Future<Output = Result<(u32, bool)>> + Send;
}

/// Runs migrations against the configured ClickHouse database.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn exec(&self, sql: &str, what: &'static str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {what}"))?;

        handle.execute(sql).await.context(what)?;

        Ok(())
    }

    async fn ensure_version_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {VERSION_TABLE} (
                version Int64,
                dirty UInt8,
                sequence UInt64
            ) ENGINE = TinyLog"
        );
        self.exec(&sql, "creating version table").await
    }

    async fn recorded_version(&self) -> Result<(u32, bool)> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let sql = format!("SELECT version, dirty FROM {VERSION_TABLE} ORDER BY sequence DESC LIMIT 1");
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("reading schema version")?;

        let Some(row) = block.rows().next() else {
            return Ok((0, false));
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
        let version = u32::try_from(version).context("schema version out of range")?;

        Ok((version, dirty != 0))
    }

    async fn record_version(&self, version: u32, dirty: bool) -> Result<()> {
        self.exec(&format!("TRUNCATE TABLE {VERSION_TABLE}"), "clearing version table")
            .await?;

        if version == 0 {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO {VERSION_TABLE} (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty),
        );
        self.exec(&sql, "recording schema version").await
    }

    async fn apply(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            let preview: String = statement.chars().take(60).collect();
            self.exec(statement, "executing migration statement")
                .await
                .with_context(|| format!("statement: {preview}"))?;
        }
        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_version_table().await?;

        let (current, dirty) = self.recorded_version().await?;
        if dirty {
            bail!("schema version {current} is dirty, fix it by hand before migrating");
        }

        let pending = pending(current);
        if pending.is_empty() {
            tracing::info!(version = current, "schema up to date");
            return Ok(());
        }

        for m in pending {
            tracing::info!(version = m.version, name = m.name, "applying migration");

            self.record_version(m.version, true).await?;
            self.apply(m.up)
                .await
                .with_context(|| format!("applying migration {} ({})", m.version, m.name))?;
            self.record_version(m.version, false).await?;
        }

        let (version, _) = self.recorded_version().await?;
        tracing::info!(version, "migrations applied");

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_version_table().await?;

        let (current, _) = self.recorded_version().await?;
        if current == 0 {
            tracing::info!("nothing to roll back");
            return Ok(());
        }

        let m = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("unknown schema version {current}"))?;

        tracing::info!(version = m.version, name = m.name, "rolling back migration");

        self.record_version(current, true).await?;
        self.apply(m.down)
            .await
            .with_context(|| format!("rolling back migration {} ({})", m.version, m.name))?;

        let previous = previous_version(current);
        self.record_version(previous, false).await?;

        tracing::info!(version = previous, "rollback complete");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_version_table().await?;
        self.recorded_version().await
    }
}

fn pending(current: u32) -> Vec<&'static Migration> {
    MIGRATIONS.iter().filter(|m| m.version > current).collect()
}

fn previous_version(current: u32) -> u32 {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < current)
        .max()
        .unwrap_or(0)
}

/// Splits a migration file on semicolons, dropping blank segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let stmts = split_statements("CREATE TABLE a (x Int32);\n\n  DROP TABLE b;;\n");
        assert_eq!(stmts, vec!["CREATE TABLE a (x Int32)", "DROP TABLE b"]);
        assert!(split_statements("  \n").is_empty());
    }

    #[test]
    fn test_migrations_ascending_and_embedded() {
        assert!(!MIGRATIONS.is_empty());
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
        for m in MIGRATIONS {
            assert!(!split_statements(m.up).is_empty(), "{} has no up SQL", m.name);
            assert!(!split_statements(m.down).is_empty(), "{} has no down SQL", m.name);
        }
    }

    #[test]
    fn test_init_creates_request_counts() {
        let init = &MIGRATIONS[0];
        assert_eq!(init.version, 1);
        assert!(init.up.contains("request_counts"));
        assert!(init.up.contains("MergeTree"));
        assert!(init.down.contains("DROP TABLE"));
    }

    #[test]
    fn test_pending_and_previous() {
        assert_eq!(pending(0).len(), MIGRATIONS.len());
        assert!(pending(1).is_empty());
        assert_eq!(previous_version(1), 0);
    }
}
