use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::{HealthMetrics, QUEUE_MAP, QUEUE_REDUCE};

use super::grouper::group_by_key;
use super::record::{AggregateRecord, PartialCount};
use super::reducer::reduce_all;

/// Buffers partial counts and, once per interval, groups and reduces them
/// into aggregate records for the sink.
///
/// The buffer is owned by this loop alone. On cancellation the input queue
/// is closed and drained, then one final flush runs. Forwarding during that
/// flush waits at most `drain_timeout` for queue space; whatever is left is
/// dropped and logged.
pub struct WindowAccumulator {
    rx: mpsc::Receiver<PartialCount>,
    tx: mpsc::Sender<AggregateRecord>,
    interval: Duration,
    drain_timeout: Duration,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
    buffer: Vec<PartialCount>,
}

impl WindowAccumulator {
    pub fn new(
        rx: mpsc::Receiver<PartialCount>,
        tx: mpsc::Sender<AggregateRecord>,
        interval: Duration,
        drain_timeout: Duration,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            rx,
            tx,
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

        debug!(interval = ?self.interval, "window accumulator started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                _ = ticker.tick() => {
                    self.drain_ready();
                    self.record_input_len();
                    self.flush(None).await;
                }
                msg = self.rx.recv() => match msg {
                    Some(partial) => {
                        self.buffer.push(partial);
                        self.record_input_len();
                    }
                    None => {
                        info!(buffered = self.buffer.len(), "partial count queue closed, final window flush");
                        self.flush(None).await;
                        return;
                    }
                },
            }
        }
    }

    /// Moves everything already queued into the buffer without waiting.
    fn drain_ready(&mut self) {
        while let Ok(partial) = self.rx.try_recv() {
            self.buffer.push(partial);
        }
    }

    fn record_input_len(&self) {
        if let Some(health) = &self.health {
            health.set_queue_length(QUEUE_MAP, self.rx.len());
        }
    }

    async fn shutdown(&mut self) {
        let deadline = Instant::now() + self.drain_timeout;

        // Stop producers, then take whatever they managed to enqueue.
        self.rx.close();
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(partial)) => self.buffer.push(partial),
                Ok(None) => break,
                Err(_) => {
                    warn!("timed out draining partial count queue");
                    break;
                }
            }
        }

        info!(buffered = self.buffer.len(), "window accumulator shutting down, final flush");

        self.flush(Some(deadline)).await;
    }

    /// Groups, reduces, and forwards the buffer. A no-op when it is empty.
    ///
    /// `deadline` bounds how long forwarding may wait for queue space. It
    /// is set on entry during shutdown, or as soon as cancellation is seen.
    async fn flush(&mut self, mut deadline: Option<Instant>) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        let partials = batch.len();
        let records = reduce_all(group_by_key(batch), Utc::now());
        let total = records.len();

        if let Some(health) = &self.health {
            health.window_flushes.inc();
            health.window_batch_size.observe(partials as f64);
            health.aggregates.inc_by(total as f64);
        }

        debug!(partials, aggregates = total, "window flushed");

        for (forwarded, record) in records.into_iter().enumerate() {
            let Some(permit) = self.reserve_slot(&mut deadline).await else {
                let dropped = total - forwarded;
                warn!(
                    dropped,
                    forwarded, "could not forward aggregate records before shutdown, dropping",
                );
                if let Some(health) = &self.health {
                    health
                        .drain_losses
                        .with_label_values(&["window"])
                        .inc_by(dropped as f64);
                }
                return;
            };
            permit.send(record);
        }

        if let Some(health) = &self.health {
            health.set_queue_length(QUEUE_REDUCE, self.tx.max_capacity() - self.tx.capacity());
        }
    }

    /// Waits for space in the aggregate queue.
    ///
    /// Returns `None` if the queue is closed or `deadline` passes first.
    async fn reserve_slot(
        &self,
        deadline: &mut Option<Instant>,
    ) -> Option<mpsc::Permit<'_, AggregateRecord>> {
        if let Some(deadline) = *deadline {
            return timeout_at(deadline, self.tx.reserve())
                .await
                .ok()
                .and_then(Result::ok);
        }

        tokio::select! {
            biased;
            permit = self.tx.reserve() => permit.ok(),
            _ = self.cancel.cancelled() => {
                let at = Instant::now() + self.drain_timeout;
                *deadline = Some(at);
                timeout_at(at, self.tx.reserve()).await.ok().and_then(Result::ok)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::event::Dimension;

    fn pc(dimension: Dimension, value: &str) -> PartialCount {
        PartialCount {
            server_id: Arc::from("s1"),
            dimension,
            value: value.to_string(),
            count: 1,
        }
    }

    struct Harness {
        in_tx: mpsc::Sender<PartialCount>,
        out_rx: mpsc::Receiver<AggregateRecord>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_window(out_capacity: usize) -> Harness {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(out_capacity);
        let cancel = CancellationToken::new();
        let window = WindowAccumulator::new(
            in_rx,
            out_tx,
            Duration::from_secs(1),
            Duration::from_secs(5),
            cancel.clone(),
            None,
        );
        Harness {
            in_tx,
            out_rx,
            cancel,
            handle: tokio::spawn(window.run()),
        }
    }

    fn collect(rx: &mut mpsc::Receiver<AggregateRecord>) -> Vec<(Dimension, String, u64)> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push((r.dimension, r.value, r.count));
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_flushes_on_tick() {
        let mut h = spawn_window(16);

        for _ in 0..3 {
            h.in_tx.send(pc(Dimension::Ip, "10.0.0.1")).await.expect("send");
        }
        h.in_tx.send(pc(Dimension::Endpoint, "/a")).await.expect("send");

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(
            collect(&mut h.out_rx),
            vec![
                (Dimension::Ip, "10.0.0.1".to_string(), 3),
                (Dimension::Endpoint, "/a".to_string(), 1),
            ]
        );

        h.cancel.cancel();
        h.handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_empty_tick_forwards_nothing() {
        let mut h = spawn_window(16);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(collect(&mut h.out_rx).is_empty());

        h.cancel.cancel();
        h.handle.await.expect("join");
        assert!(h.out_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_windows_are_independent() {
        let mut h = spawn_window(16);

        h.in_tx.send(pc(Dimension::Ip, "a")).await.expect("send");
        tokio::time::sleep(Duration::from_millis(1100)).await;
        h.in_tx.send(pc(Dimension::Ip, "a")).await.expect("send");
        h.in_tx.send(pc(Dimension::Ip, "a")).await.expect("send");
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(
            collect(&mut h.out_rx),
            vec![
                (Dimension::Ip, "a".to_string(), 1),
                (Dimension::Ip, "a".to_string(), 2),
            ]
        );

        h.cancel.cancel();
        h.handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_final_flush_on_cancel() {
        let mut h = spawn_window(16);

        h.in_tx.send(pc(Dimension::Ip, "a")).await.expect("send");
        h.in_tx.send(pc(Dimension::Ip, "b")).await.expect("send");
        h.in_tx.send(pc(Dimension::Ip, "a")).await.expect("send");
        tokio::time::sleep(Duration::from_millis(300)).await;

        h.cancel.cancel();
        h.handle.await.expect("join");

        assert_eq!(
            collect(&mut h.out_rx),
            vec![
                (Dimension::Ip, "a".to_string(), 2),
                (Dimension::Ip, "b".to_string(), 1),
            ]
        );
        assert!(h.in_tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_final_flush_when_input_closes() {
        let Harness {
            in_tx,
            mut out_rx,
            handle,
            ..
        } = spawn_window(16);

        in_tx.send(pc(Dimension::Endpoint, "/x")).await.expect("send");
        drop(in_tx);

        handle.await.expect("join");
        assert_eq!(
            collect(&mut out_rx),
            vec![(Dimension::Endpoint, "/x".to_string(), 1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_shutdown_gives_up_on_full_queue() {
        // Output capacity 1 with no consumer: only one of three records fits.
        let mut h = spawn_window(1);

        for v in ["a", "b", "c"] {
            h.in_tx.send(pc(Dimension::Ip, v)).await.expect("send");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        h.cancel.cancel();
        h.handle.await.expect("join");

        assert!(started.elapsed() <= Duration::from_secs(5));
        assert_eq!(collect(&mut h.out_rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reports_drained_input_queue() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let window = WindowAccumulator::new(
            in_rx,
            out_tx,
            Duration::from_secs(1),
            Duration::from_secs(5),
            cancel.clone(),
            Some(Arc::clone(&health)),
        );

        // Stale value left by a producer that filled the queue earlier.
        health.set_queue_length(QUEUE_MAP, 40);

        let handle = tokio::spawn(window.run());
        for _ in 0..3 {
            in_tx.send(pc(Dimension::Ip, "a")).await.expect("send");
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let text = health.render().expect("render");
        assert!(text.contains("logagg_queue_length{queue=\"map\"} 0"), "{text}");
        assert_eq!(collect(&mut out_rx), vec![(Dimension::Ip, "a".to_string(), 3)]);

        cancel.cancel();
        handle.await.expect("join");
    }
}
