use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, StoreConfig};
use crate::health::HealthMetrics;
use crate::ingest::{IngestStats, SourceBackend};
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::pipeline::{self, PipelineHandle};
use crate::store::clickhouse::ClickHouseStore;
use crate::store::http::HttpStore;
use crate::store::stdout::StdoutStore;
use crate::store::{StoreBackend, StoreSet};

/// Agent owns the health server and the running pipeline.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    pipeline: Option<PipelineHandle>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            pipeline: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Starts the health server, opens stores and source, and spawns the
    /// pipeline stages.
    pub async fn start(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            bail!("agent already started");
        }

        // Health comes up first so probes answer while stores connect.
        let addr = self
            .health
            .start()
            .await
            .context("starting health metrics server")?;
        info!(%addr, "health metrics server listening");

        let store = build_store(&self.cfg.store, Some(Arc::clone(&self.health))).await?;
        let source = SourceBackend::connect(&self.cfg.source)
            .await
            .context("opening log source")?;

        self.pipeline = Some(pipeline::spawn(
            &self.cfg.pipeline,
            self.cfg.shared_server_id(),
            source,
            store,
            self.cancel.child_token(),
            Some(Arc::clone(&self.health)),
        ));

        Ok(())
    }

    /// Waits until the pipeline finishes by itself or `shutdown` resolves.
    ///
    /// On shutdown the pipeline is cancelled and its final flushes are awaited
    /// before this returns. The health server is stopped either way.
    pub async fn wait<F>(&mut self, shutdown: F) -> Result<IngestStats>
    where
        F: Future<Output = ()>,
    {
        let handle = self.pipeline.take().context("agent not started")?;

        let join = handle.join();
        tokio::pin!(join);

        let result = tokio::select! {
            result = &mut join => {
                info!("pipeline finished");
                result
            }
            _ = shutdown => {
                info!("shutdown requested, draining pipeline");
                self.cancel.cancel();
                join.await
            }
        };

        match &result {
            Ok(stats) => info!(
                lines = stats.lines,
                parse_errors = stats.parse_errors,
                partial_counts = stats.partial_counts,
                "pipeline stopped",
            ),
            Err(e) => error!(error = ?e, "pipeline stopped with error"),
        }

        self.health.stop();

        result
    }
}

/// Opens every enabled store. ClickHouse migrations run first when enabled.
pub async fn build_store(cfg: &StoreConfig, health: Option<Arc<HealthMetrics>>) -> Result<StoreSet> {
    let mut backends = Vec::new();

    if cfg.clickhouse.enabled {
        let store = ClickHouseStore::connect(&cfg.clickhouse)
            .await
            .context("connecting ClickHouse store")?;

        if cfg.clickhouse.migrations.enabled {
            info!("running ClickHouse migrations");
            ClickHouseMigrator::new(store.pool().clone())
                .up()
                .await
                .context("applying ClickHouse migrations")?;
        }

        backends.push(StoreBackend::ClickHouse(store));
    }

    if cfg.http.enabled {
        let store = HttpStore::new(cfg.http.clone()).context("creating HTTP store")?;
        info!(address = %cfg.http.address, compression = %cfg.http.compression, "HTTP store enabled");
        backends.push(StoreBackend::Http(store));
    }

    if cfg.stdout.enabled {
        info!("stdout store enabled");
        backends.push(StoreBackend::Stdout(StdoutStore::new()));
    }

    let set = StoreSet::new(backends, health);
    if set.is_empty() {
        bail!("no store enabled");
    }

    Ok(set)
}
