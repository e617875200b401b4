use std::fmt::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use serde::Serialize;

use crate::config::ClickHouseConfig;
use crate::ingest::event::Dimension;
use crate::pipeline::record::AggregateRecord;

use super::{format_datetime, Store};

/// Table holding one row per aggregate record.
pub const TABLE: &str = "request_counts";

const COLUMNS: &str = "created_at, updated_at, server_id, type, value, count";

/// Inserts each batch into `request_counts` with a single multi-row INSERT.
///
/// Rows are appended, never merged: every window is its own snapshot.
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
}

impl ClickHouseStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: Pool, database: String) -> Self {
        Self { pool, database }
    }

    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn connect(cfg: &ClickHouseConfig) -> Result<Self> {
        let pool = Pool::new(cfg.dsn());

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(endpoint = %cfg.endpoint, database = %cfg.database, "ClickHouse store connected");

        Ok(Self::new(pool, cfg.database.clone()))
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Sums stored window snapshots per value and returns the largest totals.
    pub async fn top_values(&self, query: &TopQuery) -> Result<Vec<ValueTotal>> {
        let sql = build_top_query(&self.database, query);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for top values query")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying top values")?;

        let mut totals = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            totals.push(ValueTotal {
                value: row.get("value").context("reading value")?,
                count: row.get("total").context("reading total")?,
            });
        }

        Ok(totals)
    }
}

/// Filter for [`ClickHouseStore::top_values`].
#[derive(Debug, Clone)]
pub struct TopQuery {
    pub dimension: Dimension,
    pub server_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Total count for one dimension value across stored windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueTotal {
    pub value: String,
    pub count: u64,
}

impl Store for ClickHouseStore {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn store(&self, batch: &[AggregateRecord]) -> Result<()> {
        let sql = build_insert(&self.database, batch);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for request_counts insert")?;

        handle
            .execute(sql.as_str())
            .await
            .context("sending request_counts batch")?;

        Ok(())
    }
}

/// Builds one INSERT statement for the whole batch.
fn build_insert(database: &str, batch: &[AggregateRecord]) -> String {
    let mut sql = String::with_capacity(96 + batch.len() * 128);
    let _ = write!(sql, "INSERT INTO {database}.{TABLE} ({COLUMNS}) VALUES ");

    for (idx, r) in batch.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let _ = write!(
            sql,
            "({}, {}, '{}', '{}', '{}', {})",
            quote_datetime(r.created_at),
            quote_datetime(r.updated_at),
            escape_sql(&r.server_id),
            r.dimension.as_str(),
            escape_sql(&r.value),
            r.count,
        );
    }

    sql
}

fn build_top_query(database: &str, query: &TopQuery) -> String {
    let mut sql = format!(
        "SELECT value, sum(count) AS total FROM {database}.{TABLE} WHERE type = '{}'",
        query.dimension.as_str(),
    );

    if let Some(server_id) = &query.server_id {
        let _ = write!(sql, " AND server_id = '{}'", escape_sql(server_id));
    }
    if let Some(since) = query.since {
        let _ = write!(sql, " AND created_at >= {}", quote_datetime(since));
    }

    let _ = write!(
        sql,
        " GROUP BY value ORDER BY total DESC, value ASC LIMIT {}",
        query.limit
    );

    sql
}

fn quote_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", format_datetime(t))
}

fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::ingest::event::Dimension;

    fn record(dimension: Dimension, value: &str, count: u64) -> AggregateRecord {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        AggregateRecord {
            server_id: Arc::from("s1"),
            dimension,
            value: value.to_string(),
            count,
            created_at: t,
            updated_at: t,
        }
    }

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("hello"), "hello");
        assert_eq!(escape_sql("it's"), "it\\'s");
        assert_eq!(escape_sql("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_quote_datetime() {
        let t = Utc.timestamp_millis_opt(0).unwrap();
        assert_eq!(quote_datetime(t), "'1970-01-01 00:00:00.000'");
    }

    #[test]
    fn test_build_insert_single_row() {
        let sql = build_insert("logs", &[record(Dimension::Ip, "10.0.0.1", 2)]);
        assert_eq!(
            sql,
            "INSERT INTO logs.request_counts (created_at, updated_at, server_id, type, value, count) VALUES \
             ('2024-01-01 00:00:01.000', '2024-01-01 00:00:01.000', 's1', 'ip', '10.0.0.1', 2)"
        );
    }

    #[test]
    fn test_build_insert_multi_row_escapes_values() {
        let sql = build_insert(
            "default",
            &[
                record(Dimension::Endpoint, "/a", 2),
                record(Dimension::Endpoint, "/it's", 1),
            ],
        );
        assert!(sql.starts_with("INSERT INTO default.request_counts"));
        assert!(sql.contains("'endpoint', '/a', 2), ("));
        assert!(sql.contains("'/it\\'s', 1)"));
        assert_eq!(sql.matches("'s1'").count(), 2);
    }

    #[test]
    fn test_build_top_query_unfiltered() {
        let sql = build_top_query(
            "default",
            &TopQuery {
                dimension: Dimension::Ip,
                server_id: None,
                since: None,
                limit: 10,
            },
        );
        assert_eq!(
            sql,
            "SELECT value, sum(count) AS total FROM default.request_counts WHERE type = 'ip' \
             GROUP BY value ORDER BY total DESC, value ASC LIMIT 10"
        );
    }

    #[test]
    fn test_build_top_query_filtered() {
        let sql = build_top_query(
            "logs",
            &TopQuery {
                dimension: Dimension::Endpoint,
                server_id: Some("o'brien".to_string()),
                since: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                limit: 3,
            },
        );
        assert!(sql.contains("WHERE type = 'endpoint' AND server_id = 'o\\'brien'"));
        assert!(sql.contains("AND created_at >= '2024-01-01 00:00:00.000'"));
        assert!(sql.ends_with("LIMIT 3"));
    }
}
