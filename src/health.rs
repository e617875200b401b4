use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "logagg";

/// Queue label for the mapper to window hand-off.
pub const QUEUE_MAP: &str = "map";
/// Queue label for the window to sink hand-off.
pub const QUEUE_REDUCE: &str = "reduce";

/// Prometheus metrics for pipeline health, served on `/metrics`.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Non-blank lines pulled from the source.
    pub lines_received: Counter,
    /// Lines rejected by the parser, by reason.
    pub parse_errors: CounterVec,
    /// Partial counts handed to the window accumulator.
    pub partial_counts: Counter,
    /// Non-empty window flushes.
    pub window_flushes: Counter,
    /// Partial counts per window flush.
    pub window_batch_size: Histogram,
    /// Aggregate records produced by the reducer.
    pub aggregates: Counter,
    /// Records abandoned during shutdown, by stage.
    pub drain_losses: CounterVec,
    /// Store writes by store and status (ok/error).
    pub store_batches: CounterVec,
    /// Records written per store.
    pub store_records: CounterVec,
    /// Store write latency.
    pub store_batch_duration: HistogramVec,
    /// Current hand-off queue length.
    pub queue_length: GaugeVec,
    /// Configured hand-off queue capacity.
    pub queue_capacity: GaugeVec,
}

impl HealthMetrics {
    /// Creates the registry and registers every metric.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let lines_received = Counter::with_opts(
            Opts::new(
                "lines_received_total",
                "Total non-blank log lines received from the source.",
            )
            .namespace(NAMESPACE),
        )?;
        let parse_errors = CounterVec::new(
            Opts::new(
                "parse_errors_total",
                "Total log lines rejected by the parser, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let partial_counts = Counter::with_opts(
            Opts::new(
                "partial_counts_total",
                "Total partial counts sent to the window accumulator.",
            )
            .namespace(NAMESPACE),
        )?;
        let window_flushes = Counter::with_opts(
            Opts::new("window_flushes_total", "Total non-empty window flushes.")
                .namespace(NAMESPACE),
        )?;
        let window_batch_size = Histogram::with_opts(
            HistogramOpts::new(
                "window_batch_size",
                "Number of partial counts per window flush.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                1.0, 10.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0,
            ]),
        )?;
        let aggregates = Counter::with_opts(
            Opts::new(
                "aggregates_total",
                "Total aggregate records produced by the reducer.",
            )
            .namespace(NAMESPACE),
        )?;
        let drain_losses = CounterVec::new(
            Opts::new(
                "drain_losses_total",
                "Total records abandoned during shutdown drain, by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let store_batches = CounterVec::new(
            Opts::new(
                "store_batches_total",
                "Total batch writes by store and status.",
            )
            .namespace(NAMESPACE),
            &["store", "status"],
        )?;
        let store_records = CounterVec::new(
            Opts::new(
                "store_records_total",
                "Total aggregate records written, by store.",
            )
            .namespace(NAMESPACE),
            &["store"],
        )?;
        let store_batch_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_batch_duration_seconds",
                "Batch write duration by store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["store"],
        )?;
        let queue_length = GaugeVec::new(
            Opts::new("queue_length", "Current number of items in a hand-off queue.")
                .namespace(NAMESPACE),
            &["queue"],
        )?;
        let queue_capacity = GaugeVec::new(
            Opts::new("queue_capacity", "Capacity of a hand-off queue.").namespace(NAMESPACE),
            &["queue"],
        )?;

        registry.register(Box::new(lines_received.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(partial_counts.clone()))?;
        registry.register(Box::new(window_flushes.clone()))?;
        registry.register(Box::new(window_batch_size.clone()))?;
        registry.register(Box::new(aggregates.clone()))?;
        registry.register(Box::new(drain_losses.clone()))?;
        registry.register(Box::new(store_batches.clone()))?;
        registry.register(Box::new(store_records.clone()))?;
        registry.register(Box::new(store_batch_duration.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_received,
            parse_errors,
            partial_counts,
            window_flushes,
            window_batch_size,
            aggregates,
            drain_losses,
            store_batches,
            store_records,
            store_batch_duration,
            queue_length,
            queue_capacity,
        })
    }

    /// Records the current length of a hand-off queue.
    pub fn set_queue_length(&self, queue: &str, len: usize) {
        self.queue_length
            .with_label_values(&[queue])
            .set(len as f64);
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" shorthand binds every interface.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(self));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(health): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    match health.render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
