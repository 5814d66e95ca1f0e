// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Watermark-based reconstruction of a time-ordered stream.
//!
//! Raw payloads enter a bounded inbound queue shared by a set of decoder
//! tasks. Each decoder turns one payload into a persistent queue of records and
//! hands it to the single merge task, which melds it into the frontier. Every
//! tick the merge task emits the frontier's head for as long as the head has
//! aged at least `sla` past its receipt.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::constants::{DEFAULT_SLA, MERGE_TICK};
use crate::pqueue::PersistentHeap;
use crate::record::{decode_batch, line_count, DecodeStats, Record};

#[derive(Debug, Clone)]
pub struct ReorderConfig {
    pub sla: Duration,
    pub tick: Duration,
    pub decoders: usize,
    pub inbound_capacity: usize,
    pub handoff_capacity: usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, usize::from);
        Self {
            sla: DEFAULT_SLA,
            tick: MERGE_TICK,
            // One core is left to the merge task.
            decoders: parallelism.saturating_sub(1).max(1),
            inbound_capacity: 128,
            handoff_capacity: 128,
        }
    }
}

/// Destination of emitted records.
pub trait RecordSink: Send + 'static {
    fn emit(&mut self, record: Record);

    /// Called after each run of emissions.
    fn flush(&mut self) {}
}

impl RecordSink for mpsc::UnboundedSender<Record> {
    fn emit(&mut self, record: Record) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.send(record);
    }
}

/// Writes the raw line of every record, one per line.
pub struct LineSink<W> {
    writer: W,
}

impl<W: io::Write> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: io::Write + Send + 'static> RecordSink for LineSink<W> {
    fn emit(&mut self, record: Record) {
        if let Err(e) = writeln!(self.writer, "{}", record.line) {
            error!("Failed to write record: {e}");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            error!("Failed to flush record output: {e}");
        }
    }
}

/// Running queue of records not yet emitted. Owned by the merge task only.
#[derive(Debug, Default)]
pub struct Frontier {
    queue: PersistentHeap<Record>,
}

impl Frontier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn meld(&mut self, batch: &PersistentHeap<Record>) {
        self.queue = self.queue.meld(batch);
    }

    /// Emits heads received at least `sla` before `now`. Stops at the first
    /// head that is still too young.
    pub fn drain_eligible<S>(&mut self, now: Instant, sla: Duration, sink: &mut S) -> usize
    where
        S: RecordSink + ?Sized,
    {
        let mut emitted = 0;
        while let Some(head) = self.queue.peek() {
            if now.saturating_duration_since(head.received) < sla {
                break;
            }
            let Some((record, rest)) = self.queue.dequeue() else {
                break;
            };
            self.queue = rest;
            sink.emit(record);
            emitted += 1;
        }
        emitted
    }

    /// Emits everything in order regardless of age.
    pub fn drain_all<S>(&mut self, sink: &mut S) -> usize
    where
        S: RecordSink + ?Sized,
    {
        let mut emitted = 0;
        while let Some((record, rest)) = self.queue.dequeue() {
            self.queue = rest;
            sink.emit(record);
            emitted += 1;
        }
        emitted
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub decode: DecodeStats,
    emitted: AtomicU64,
}

impl PipelineStats {
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

pub struct ReorderPipeline {
    inbound: mpsc::Sender<Vec<u8>>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    decoders: Vec<JoinHandle<()>>,
    merger: JoinHandle<()>,
}

impl ReorderPipeline {
    /// Starts the decoder and merge tasks on the current runtime.
    pub fn spawn<S: RecordSink>(config: ReorderConfig, sink: S) -> Self {
        let (inbound, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (handoff, handoff_rx) = mpsc::channel(config.handoff_capacity.max(1));
        let inbound_rx = Arc::new(TokioMutex::new(inbound_rx));
        let stats = Arc::new(PipelineStats::default());
        let seq = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let decoders = (0..config.decoders.max(1))
            .map(|_| {
                tokio::spawn(decode_worker(
                    Arc::clone(&inbound_rx),
                    handoff.clone(),
                    Arc::clone(&seq),
                    Arc::clone(&stats),
                    cancel.clone(),
                ))
            })
            .collect();
        drop(handoff);

        let merger = tokio::spawn(merge_worker(
            handoff_rx,
            sink,
            config.sla,
            config.tick,
            Arc::clone(&stats),
        ));

        debug!(
            "Started reorder pipeline with {} decoders, SLA {:?}",
            config.decoders.max(1),
            config.sla
        );
        Self {
            inbound,
            stats,
            cancel,
            decoders,
            merger,
        }
    }

    /// Bounded intake for raw payloads. Sending waits while decoders are busy.
    pub fn inbound(&self) -> mpsc::Sender<Vec<u8>> {
        self.inbound.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Closes intake, decodes what was already queued, then emits the whole
    /// frontier in order.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for decoder in self.decoders {
            if let Err(e) = decoder.await {
                error!("Decoder task ended abnormally: {e}");
            }
        }
        if let Err(e) = self.merger.await {
            error!("Merge task ended abnormally: {e}");
        }
        info!(
            "Reorder pipeline stopped: {} decoded, {} dropped, {} emitted",
            self.stats.decode.decoded(),
            self.stats.decode.dropped(),
            self.stats.emitted()
        );
    }
}

async fn decode_worker(
    inbound: Arc<TokioMutex<mpsc::Receiver<Vec<u8>>>>,
    handoff: mpsc::Sender<PersistentHeap<Record>>,
    seq: Arc<AtomicU64>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    loop {
        let taken = {
            let mut rx = inbound.lock().await;
            if cancel.is_cancelled() {
                rx.close();
            }
            let payload = tokio::select! {
                payload = rx.recv() => payload,
                () = cancel.cancelled() => {
                    // Closed receivers still yield what was already queued.
                    rx.close();
                    rx.recv().await
                }
            };
            // Reserved while the receiver is held, so sequence numbers follow
            // inbound order whichever decoder takes the payload.
            payload.map(|payload| {
                let first_seq = seq.fetch_add(line_count(&payload), Ordering::Relaxed);
                (payload, first_seq, Instant::now())
            })
        };
        let Some((payload, first_seq, received)) = taken else {
            break;
        };

        let batch = decode_batch(&payload, received, first_seq, &stats.decode);
        if batch.is_empty() {
            continue;
        }
        if handoff.send(batch).await.is_err() {
            break;
        }
    }
}

async fn merge_worker<S: RecordSink>(
    mut handoff: mpsc::Receiver<PersistentHeap<Record>>,
    mut sink: S,
    sla: Duration,
    tick: Duration,
    stats: Arc<PipelineStats>,
) {
    let mut frontier = Frontier::new();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let emitted = frontier.drain_eligible(Instant::now(), sla, &mut sink);
                if emitted > 0 {
                    stats.emitted.fetch_add(emitted as u64, Ordering::Relaxed);
                    sink.flush();
                }
            }
            batch = handoff.recv() => match batch {
                Some(batch) => frontier.meld(&batch),
                None => break,
            },
        }
    }

    // Intake is closed, so nothing older can still arrive.
    let emitted = frontier.drain_all(&mut sink);
    stats.emitted.fetch_add(emitted as u64, Ordering::Relaxed);
    sink.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EmitTime;

    fn record(ts: i64, received: Instant, seq: u64) -> Record {
        Record {
            line: Arc::from(format!("{{\"ts\":{ts}}}")),
            received,
            emitted: EmitTime { secs: ts, nanos: 0 },
            seq,
        }
    }

    fn line(ts: f64, msg: &str) -> String {
        format!("{{\"level\":\"info\",\"ts\":{ts},\"msg\":\"{msg}\"}}\n")
    }

    #[test]
    fn test_frontier_waits_for_sla_then_emits_in_order() {
        let sla = Duration::from_secs(1);
        let received = Instant::now();
        let mut frontier = Frontier::new();
        for (seq, ts) in [5, 1, 3].into_iter().enumerate() {
            frontier.meld(&PersistentHeap::empty().enqueue(record(ts, received, seq as u64)));
        }

        let (mut tx, mut rx) = mpsc::unbounded_channel::<Record>();
        let early = received + Duration::from_millis(999);
        assert_eq!(frontier.drain_eligible(early, sla, &mut tx), 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(frontier.drain_eligible(received + sla, sla, &mut tx), 3);
        let order: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| r.emitted.secs)
            .collect();
        assert_eq!(order, vec![1, 3, 5]);
        assert!(frontier.is_empty());
    }

    #[test]
    fn test_young_head_blocks_emission() {
        let sla = Duration::from_secs(1);
        let old = Instant::now();
        let young = old + Duration::from_millis(900);
        let mut frontier = Frontier::new();
        frontier.meld(&[record(1, young, 0), record(2, old, 1)].into_iter().collect());

        let (mut tx, _rx) = mpsc::unbounded_channel::<Record>();
        assert_eq!(frontier.drain_eligible(old + sla, sla, &mut tx), 0);
        assert_eq!(frontier.len(), 2);
        assert_eq!(frontier.drain_eligible(young + sla, sla, &mut tx), 2);
    }

    #[test]
    fn test_line_sink_writes_one_line_per_record() {
        let now = Instant::now();
        let mut frontier = Frontier::new();
        frontier.meld(&[record(2, now, 0), record(1, now, 1)].into_iter().collect());

        let mut sink = LineSink::new(Vec::new());
        assert_eq!(frontier.drain_all(&mut sink), 2);
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "{\"ts\":1}\n{\"ts\":2}\n");
    }

    #[tokio::test]
    async fn test_pipeline_reorders_across_payloads() {
        let config = ReorderConfig {
            sla: Duration::from_millis(100),
            tick: Duration::from_millis(10),
            decoders: 3,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
        let pipeline = ReorderPipeline::spawn(config, tx);
        let inbound = pipeline.inbound();

        inbound
            .send(format!("{}{}", line(1.5, "b"), line(3.0, "d")).into_bytes())
            .await
            .unwrap();
        inbound.send(line(1.0, "a").into_bytes()).await.unwrap();
        inbound
            .send(format!("{}garbage\n", line(2.0, "c")).into_bytes())
            .await
            .unwrap();

        let mut msgs = Vec::new();
        while msgs.len() < 4 {
            let record = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            msgs.push(record.emitted);
        }
        let secs: Vec<(i64, u32)> = msgs.iter().map(|t| (t.secs, t.nanos)).collect();
        assert_eq!(secs, vec![(1, 0), (1, 500_000_000), (2, 0), (3, 0)]);

        let stats = pipeline.stats();
        pipeline.shutdown().await;
        assert_eq!(stats.decode.decoded(), 4);
        assert_eq!(stats.decode.dropped(), 1);
        assert_eq!(stats.emitted(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_drains_without_waiting_for_sla() {
        let config = ReorderConfig {
            sla: Duration::from_secs(3_600),
            decoders: 2,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
        let pipeline = ReorderPipeline::spawn(config, tx);
        let inbound = pipeline.inbound();
        inbound.send(line(9.0, "late").into_bytes()).await.unwrap();
        inbound.send(line(4.0, "early").into_bytes()).await.unwrap();

        pipeline.shutdown().await;

        let order: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| r.emitted.secs)
            .collect();
        assert_eq!(order, vec![4, 9]);
        assert!(inbound.send(line(1.0, "after").into_bytes()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_equal_timestamps_emit_in_receipt_order() {
        let config = ReorderConfig {
            sla: Duration::from_secs(3_600),
            decoders: 4,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
        let pipeline = ReorderPipeline::spawn(config, tx);
        let inbound = pipeline.inbound();

        let mut n = 0;
        for _ in 0..200 {
            let mut payload = String::new();
            for _ in 0..20 {
                payload.push_str(&line(1.0, &n.to_string()));
                n += 1;
            }
            inbound.send(payload.into_bytes()).await.unwrap();
        }
        pipeline.shutdown().await;

        let order: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| {
                let entry: serde_json::Value = serde_json::from_str(&r.line).unwrap();
                entry["msg"].as_str().unwrap().parse().unwrap()
            })
            .collect();
        assert_eq!(order, (0..4_000).collect::<Vec<_>>());
    }
}
