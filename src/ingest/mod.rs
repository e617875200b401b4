pub mod event;
pub mod parse;
pub mod pubsub;
pub mod reader;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::health::{HealthMetrics, QUEUE_MAP};
use crate::pipeline::mapper::map_event;
use crate::pipeline::record::PartialCount;

use self::event::Dimension;
use self::parse::parse_raw;
use self::pubsub::RedisSource;
use self::reader::ReaderSource;

/// Delivers raw log lines, one per call.
///
/// `next_line` is raced against cancellation, so implementations must be
/// cancel-safe: dropping the future must not lose a line already taken
/// from the underlying transport.
pub trait LineSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Returns the next raw line without its terminator, or `None` once the
    /// source is exhausted. Bytes are passed through undecoded so that a
    /// line that is not UTF-8 fails parsing instead of failing the source.
    fn next_line(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
}

/// Configured line source.
pub enum SourceBackend {
    Stdin(ReaderSource<BufReader<tokio::io::Stdin>>),
    File(ReaderSource<BufReader<tokio::fs::File>>),
    Redis(RedisSource),
}

impl SourceBackend {
    /// Opens the source described by `cfg`.
    pub async fn connect(cfg: &SourceConfig) -> Result<Self> {
        let source = match cfg {
            SourceConfig::Stdin => Self::Stdin(ReaderSource::stdin()),
            SourceConfig::File { path } => Self::File(ReaderSource::open(path).await?),
            SourceConfig::Redis { url, channel } => Self::Redis(
                RedisSource::connect(url, channel)
                    .await
                    .context("opening redis source")?,
            ),
        };

        info!(source = source.name(), "log source opened");

        Ok(source)
    }
}

impl LineSource for SourceBackend {
    fn name(&self) -> &str {
        match self {
            Self::Stdin(s) => s.name(),
            Self::File(s) => s.name(),
            Self::Redis(s) => s.name(),
        }
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Stdin(s) => s.next_line().await,
            Self::File(s) => s.next_line().await,
            Self::Redis(s) => s.next_line().await,
        }
    }
}

/// Counters reported by the ingestion loop when it exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub parse_errors: u64,
    pub partial_counts: u64,
}

/// Pulls lines from a source, parses and maps them, and feeds the window queue.
///
/// Sending blocks while the queue is full, which throttles reads from the
/// source. That is the only backpressure in the pipeline.
pub struct Ingestor<S> {
    source: S,
    server_id: Option<Arc<str>>,
    dimensions: Vec<Dimension>,
    tx: mpsc::Sender<PartialCount>,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: LineSource> Ingestor<S> {
    pub fn new(
        source: S,
        server_id: Option<Arc<str>>,
        dimensions: Vec<Dimension>,
        tx: mpsc::Sender<PartialCount>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            source,
            server_id,
            dimensions,
            tx,
            cancel,
            health,
        }
    }

    /// Runs until the source is exhausted, the token is cancelled, or the
    /// window queue closes. A read error from the source ends the loop with
    /// that error; parse failures never do.
    pub async fn run(mut self) -> Result<IngestStats> {
        let mut stats = IngestStats::default();

        info!(source = self.source.name(), "ingestion started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("ingestion cancelled");
                    break;
                }
                next = self.source.next_line() => next?,
            };

            let Some(line) = next else {
                info!(source = self.source.name(), "source exhausted");
                break;
            };

            if line.trim_ascii().is_empty() {
                continue;
            }

            stats.lines += 1;
            if let Some(health) = &self.health {
                health.lines_received.inc();
            }

            let event = match parse_raw(&line, self.server_id.as_ref()) {
                Ok(event) => event,
                Err(e) => {
                    stats.parse_errors += 1;
                    if let Some(health) = &self.health {
                        health.parse_errors.with_label_values(&[e.reason()]).inc();
                    }
                    warn!(reason = e.reason(), error = %e, "skipping unparseable log line");
                    continue;
                }
            };

            for partial in map_event(&event, &self.dimensions) {
                if !self.send(partial).await {
                    info!(?stats, "window queue closed, ingestion stopping");
                    return Ok(stats);
                }
                stats.partial_counts += 1;
            }
        }

        info!(?stats, "ingestion stopped");

        Ok(stats)
    }

    /// Waits for queue space, then sends. Returns false if the queue closed or
    /// the token was cancelled before space became available.
    async fn send(&mut self, partial: PartialCount) -> bool {
        let permit = tokio::select! {
            biased;
            permit = self.tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
            _ = self.cancel.cancelled() => return false,
        };

        permit.send(partial);

        if let Some(health) = &self.health {
            health.partial_counts.inc();
            health.set_queue_length(QUEUE_MAP, self.tx.max_capacity() - self.tx.capacity());
        }

        true
    }
}
