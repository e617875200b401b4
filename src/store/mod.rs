pub mod clickhouse;
pub mod http;
pub mod stdout;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::HealthMetrics;
use crate::pipeline::record::AggregateRecord;

use self::clickhouse::ClickHouseStore;
use self::http::HttpStore;
use self::stdout::StdoutStore;

/// Persists batches of aggregate records.
pub trait Store: Send + Sync {
    /// Returns the store's name for logging and metrics.
    fn name(&self) -> &str;

    /// Writes one batch. The batch is never empty.
    fn store(&self, batch: &[AggregateRecord]) -> impl Future<Output = Result<()>> + Send;
}

/// StoreBackend dispatches batches to ClickHouse, HTTP, or stdout.
///
/// Uses enum dispatch rather than trait objects, since `Store` returns
/// `impl Future` and is not object safe.
pub enum StoreBackend {
    ClickHouse(ClickHouseStore),
    Http(HttpStore),
    Stdout(StdoutStore),
}

impl Store for StoreBackend {
    fn name(&self) -> &str {
        match self {
            Self::ClickHouse(s) => s.name(),
            Self::Http(s) => s.name(),
            Self::Stdout(s) => s.name(),
        }
    }

    async fn store(&self, batch: &[AggregateRecord]) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.store(batch).await,
            Self::Http(s) => s.store(batch).await,
            Self::Stdout(s) => s.store(batch).await,
        }
    }
}

/// Writes every batch to each configured backend in turn.
///
/// A failing backend does not stop the others; the combined write fails if
/// any backend failed.
pub struct StoreSet {
    backends: Vec<StoreBackend>,
    health: Option<Arc<HealthMetrics>>,
}

impl StoreSet {
    pub fn new(backends: Vec<StoreBackend>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self { backends, health }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn record_result(&self, store: &str, records: usize, elapsed: f64, ok: bool) {
        let Some(health) = &self.health else {
            return;
        };

        let status = if ok { "ok" } else { "error" };
        health
            .store_batches
            .with_label_values(&[store, status])
            .inc();
        health
            .store_batch_duration
            .with_label_values(&[store])
            .observe(elapsed);
        if ok {
            health
                .store_records
                .with_label_values(&[store])
                .inc_by(records as f64);
        }
    }
}

impl Store for StoreSet {
    fn name(&self) -> &str {
        "stores"
    }

    async fn store(&self, batch: &[AggregateRecord]) -> Result<()> {
        let mut failed = Vec::new();

        for backend in &self.backends {
            let started = Instant::now();
            let result = backend.store(batch).await;
            let elapsed = started.elapsed().as_secs_f64();
            self.record_result(backend.name(), batch.len(), elapsed, result.is_ok());

            if let Err(e) = result {
                tracing::warn!(store = backend.name(), error = ?e, "store write failed");
                failed.push(backend.name().to_string());
            }
        }

        if !failed.is_empty() {
            bail!("store write failed for: {}", failed.join(", "));
        }

        Ok(())
    }
}

/// JSON row shape shared by the HTTP and stdout stores.
#[derive(Debug, Serialize)]
pub struct AggregateRecordJson<'a> {
    pub created_at: String,
    pub updated_at: String,
    pub server_id: &'a str,
    #[serde(rename = "type")]
    pub dimension: &'static str,
    pub value: &'a str,
    pub count: u64,
}

impl<'a> From<&'a AggregateRecord> for AggregateRecordJson<'a> {
    fn from(r: &'a AggregateRecord) -> Self {
        Self {
            created_at: format_datetime(r.created_at),
            updated_at: format_datetime(r.updated_at),
            server_id: &r.server_id,
            dimension: r.dimension.as_str(),
            value: &r.value,
            count: r.count,
        }
    }
}

/// Serializes a batch as newline-delimited JSON.
pub fn to_ndjson(batch: &[AggregateRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(batch.len() * 160);
    for record in batch {
        serde_json::to_writer(&mut buf, &AggregateRecordJson::from(record))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Formats a timestamp as "2006-01-02 15:04:05.000" in UTC.
pub fn format_datetime(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
