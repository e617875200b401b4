use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use logagg::config::PipelineConfig;
use logagg::health::HealthMetrics;
use logagg::ingest::event::Dimension;
use logagg::ingest::{IngestStats, LineSource};
use logagg::pipeline::record::AggregateRecord;
use logagg::pipeline::{self, PipelineHandle};
use logagg::store::Store;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const S1_A: &str =
    r#"s1: 10.0.0.1 - - [01/Jan/2024:00:00:00 +0000] "GET /a HTTP/1.1" 200 10 "-" "ua""#;
const S1_A_LATER: &str =
    r#"s1: 10.0.0.1 - - [01/Jan/2024:00:00:01 +0000] "GET /a HTTP/1.1" 200 10 "-" "ua""#;

/// Lines pushed by the test; exhausted once the sender is dropped.
struct ChannelSource(mpsc::UnboundedReceiver<String>);

impl LineSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.0.recv().await.map(String::into_bytes))
    }
}

#[derive(Clone, Default)]
struct RecordingStore(Arc<Mutex<Vec<Vec<AggregateRecord>>>>);

impl RecordingStore {
    fn batches(&self) -> Vec<Vec<AggregateRecord>> {
        self.0.lock().clone()
    }

    fn records(&self) -> Vec<AggregateRecord> {
        self.0.lock().iter().flatten().cloned().collect()
    }
}

impl Store for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    async fn store(&self, batch: &[AggregateRecord]) -> Result<()> {
        self.0.lock().push(batch.to_vec());
        Ok(())
    }
}

struct Harness {
    lines: mpsc::UnboundedSender<String>,
    store: RecordingStore,
    cancel: CancellationToken,
    handle: PipelineHandle,
}

fn start(health: Option<Arc<HealthMetrics>>) -> Harness {
    let cfg = PipelineConfig::default();
    let (lines, rx) = mpsc::unbounded_channel();
    let store = RecordingStore::default();
    let cancel = CancellationToken::new();

    let handle = pipeline::spawn(
        &cfg,
        None,
        ChannelSource(rx),
        store.clone(),
        cancel.clone(),
        health,
    );

    Harness {
        lines,
        store,
        cancel,
        handle,
    }
}

fn find<'a>(records: &'a [AggregateRecord], dimension: Dimension, value: &str) -> &'a AggregateRecord {
    records
        .iter()
        .find(|r| r.dimension == dimension && r.value == value)
        .unwrap_or_else(|| panic!("no record for {dimension}={value}"))
}

#[tokio::test(start_paused = true)]
async fn test_two_lines_one_window_counted_per_dimension() {
    let h = start(None);

    h.lines.send(S1_A.to_string()).expect("send");
    h.lines.send(S1_A_LATER.to_string()).expect("send");

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let batches = h.store.batches();
    assert_eq!(batches.len(), 1);
    let records = &batches[0];
    assert_eq!(records.len(), 2);

    let ip = find(records, Dimension::Ip, "10.0.0.1");
    assert_eq!(&*ip.server_id, "s1");
    assert_eq!(ip.count, 2);
    assert_eq!(ip.created_at, ip.updated_at);

    let endpoint = find(records, Dimension::Endpoint, "/a");
    assert_eq!(endpoint.count, 2);
    assert_eq!(endpoint.created_at, ip.created_at);

    h.cancel.cancel();
    h.handle.join().await.expect("join");
    assert_eq!(h.store.batches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_pipeline_never_writes() {
    let h = start(None);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.store.batches().is_empty());

    h.cancel.cancel();
    let stats = h.handle.join().await.expect("join");
    assert_eq!(stats, IngestStats::default());
    assert!(h.store.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_each_window_is_a_separate_snapshot() {
    let h = start(None);

    h.lines.send(S1_A.to_string()).expect("send");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.lines.send(S1_A_LATER.to_string()).expect("send");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let records = h.store.records();
    let ip: Vec<_> = records
        .iter()
        .filter(|r| r.dimension == Dimension::Ip)
        .collect();
    assert_eq!(ip.len(), 2);
    assert!(ip.iter().all(|r| r.count == 1));
    assert!(ip[0].created_at <= ip[1].created_at);

    h.cancel.cancel();
    h.handle.join().await.expect("join");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_window_flushes_exactly_once() {
    let h = start(None);

    for _ in 0..3 {
        h.lines.send(S1_A.to_string()).expect("send");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.store.batches().is_empty());

    h.cancel.cancel();
    let stats = h.handle.join().await.expect("join");
    assert_eq!(stats.lines, 3);

    let batches = h.store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(find(&batches[0], Dimension::Ip, "10.0.0.1").count, 3);
    assert_eq!(find(&batches[0], Dimension::Endpoint, "/a").count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_source_exhaustion_flushes_and_stops() {
    let h = start(None);

    h.lines.send(S1_A.to_string()).expect("send");
    h.lines.send("not an access log line".to_string()).expect("send");
    h.lines.send(String::new()).expect("send");
    h.lines.send(S1_A_LATER.to_string()).expect("send");
    drop(h.lines);

    let stats = h.handle.join().await.expect("join");
    assert_eq!(
        stats,
        IngestStats {
            lines: 3,
            parse_errors: 1,
            partial_counts: 4,
        }
    );

    let records = h.store.records();
    assert_eq!(records.len(), 2);
    assert_eq!(find(&records, Dimension::Ip, "10.0.0.1").count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_health_metrics_follow_the_pipeline() {
    let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
    let h = start(Some(Arc::clone(&health)));

    h.lines.send(S1_A.to_string()).expect("send");
    h.lines.send("garbage".to_string()).expect("send");
    drop(h.lines);
    h.handle.join().await.expect("join");

    let text = health.render().expect("render");
    assert!(text.contains("logagg_lines_received_total 2"));
    assert!(text.contains("logagg_parse_errors_total{reason=\"malformed\"} 1"));
    assert!(text.contains("logagg_partial_counts_total 2"));
    assert!(text.contains("logagg_aggregates_total 2"));
    assert!(text.contains("logagg_queue_capacity{queue=\"map\"} 1000"));
}
