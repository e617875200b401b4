use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::{HealthMetrics, QUEUE_REDUCE};
use crate::store::Store;

use super::record::AggregateRecord;

/// Buffers aggregate records and writes them to the store once per interval.
///
/// Each non-empty flush is one `store` call. A failed write is logged and the
/// batch discarded; there is no retry. The final write after cancellation is
/// bounded by `drain_timeout`.
pub struct SinkAccumulator<S> {
    rx: mpsc::Receiver<AggregateRecord>,
    store: S,
    interval: Duration,
    drain_timeout: Duration,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
    buffer: Vec<AggregateRecord>,
}

impl<S: Store> SinkAccumulator<S> {
    pub fn new(
        rx: mpsc::Receiver<AggregateRecord>,
        store: S,
        interval: Duration,
        drain_timeout: Duration,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            rx,
            store,
            interval,
            drain_timeout,
            cancel,
            health,
            buffer: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(interval = ?self.interval, store = self.store.name(), "sink accumulator started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                _ = ticker.tick() => {
                    while let Ok(record) = self.rx.try_recv() {
                        self.buffer.push(record);
                    }
                    if let Some(health) = &self.health {
                        health.set_queue_length(QUEUE_REDUCE, self.rx.len());
                    }
                    self.flush(None).await;
                }
                msg = self.rx.recv() => match msg {
                    Some(record) => self.buffer.push(record),
                    None => {
                        info!(buffered = self.buffer.len(), "aggregate queue closed, final store flush");
                        self.flush(None).await;
                        return;
                    }
                },
            }
        }
    }

    /// Keeps receiving until the window task drops its sender or the drain
    /// deadline passes, then flushes once with a fresh deadline for the write.
    async fn shutdown(&mut self) {
        let deadline = Instant::now() + self.drain_timeout;

        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(record)) => self.buffer.push(record),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        buffered = self.buffer.len(),
                        "timed out waiting for window accumulator to finish",
                    );
                    break;
                }
            }
        }

        info!(buffered = self.buffer.len(), "sink accumulator shutting down, final flush");

        self.flush(Some(Instant::now() + self.drain_timeout)).await;
    }

    async fn flush(&mut self, deadline: Option<Instant>) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.buffer);

        let result = match deadline {
            Some(deadline) => match timeout_at(deadline, self.store.store(&batch)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        dropped = batch.len(),
                        store = self.store.name(),
                        "final store write timed out, dropping batch",
                    );
                    if let Some(health) = &self.health {
                        health
                            .drain_losses
                            .with_label_values(&["sink"])
                            .inc_by(batch.len() as f64);
                    }
                    return;
                }
            },
            None => self.store.store(&batch).await,
        };

        match result {
            Ok(()) => {
                info!(count = batch.len(), store = self.store.name(), "stored aggregate batch");
            }
            Err(e) => {
                error!(
                    count = batch.len(),
                    store = self.store.name(),
                    error = ?e,
                    "storing aggregate batch failed, batch discarded",
                );
            }
        }
    }
}
