pub mod grouper;
pub mod mapper;
pub mod record;
pub mod reducer;
pub mod sink;
pub mod window;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::health::{HealthMetrics, QUEUE_MAP, QUEUE_REDUCE};
use crate::ingest::{IngestStats, Ingestor, LineSource};
use crate::store::Store;

use self::sink::SinkAccumulator;
use self::window::WindowAccumulator;

/// Join handles for the three pipeline stages.
pub struct PipelineHandle {
    ingest: JoinHandle<Result<IngestStats>>,
    window: JoinHandle<()>,
    sink: JoinHandle<()>,
}

impl PipelineHandle {
    /// Waits for every stage to finish.
    ///
    /// The stages stop on their own once the source is exhausted, or after
    /// `cancel` fires and the final flushes complete. The window and sink are
    /// always awaited, even when ingestion failed, so buffered data is flushed
    /// before the error is returned.
    pub async fn join(self) -> Result<IngestStats> {
        let ingest = self.ingest.await.context("ingest task panicked");
        let window = self.window.await.context("window task panicked");
        let sink = self.sink.await.context("sink task panicked");

        window?;
        sink?;
        ingest?
    }
}

/// Wires source, window accumulator, sink accumulator and store together and
/// spawns each stage as its own task.
pub fn spawn<Src, St>(
    cfg: &PipelineConfig,
    server_id: Option<Arc<str>>,
    source: Src,
    store: St,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
) -> PipelineHandle
where
    Src: LineSource + 'static,
    St: Store + 'static,
{
    let (map_tx, map_rx) = mpsc::channel(cfg.map_queue_capacity);
    let (reduce_tx, reduce_rx) = mpsc::channel(cfg.reduce_queue_capacity);

    if let Some(health) = &health {
        health
            .queue_capacity
            .with_label_values(&[QUEUE_MAP])
            .set(cfg.map_queue_capacity as f64);
        health
            .queue_capacity
            .with_label_values(&[QUEUE_REDUCE])
            .set(cfg.reduce_queue_capacity as f64);
    }

    let ingestor = Ingestor::new(
        source,
        server_id,
        cfg.dimensions.clone(),
        map_tx,
        cancel.clone(),
        health.clone(),
    );
    let window = WindowAccumulator::new(
        map_rx,
        reduce_tx,
        cfg.window_interval,
        cfg.shutdown_drain_timeout,
        cancel.clone(),
        health.clone(),
    );
    let sink = SinkAccumulator::new(
        reduce_rx,
        store,
        cfg.sink_interval,
        cfg.shutdown_drain_timeout,
        cancel,
        health,
    );

    tracing::info!(
        window_interval = ?cfg.window_interval,
        sink_interval = ?cfg.sink_interval,
        map_queue = cfg.map_queue_capacity,
        reduce_queue = cfg.reduce_queue_capacity,
        dimensions = ?cfg.dimensions,
        "pipeline started",
    );

    PipelineHandle {
        ingest: tokio::spawn(ingestor.run()),
        window: tokio::spawn(window.run()),
        sink: tokio::spawn(sink.run()),
    }
}
