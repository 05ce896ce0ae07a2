//! The durable relay: ingress queues, publisher pool, delivery accounting.
//!
//! Ingress and egress run independently so a bus outage cannot stop the
//! session from draining the upstream read buffer; records pile up in the
//! durable queues instead. A queue entry is deleted only after the bus
//! producer confirms the publish, so delivery is at-least-once and
//! downstream consumers dedupe on record ids.

mod publisher;
mod queue;

pub use publisher::{compress, BusSink, KafkaSink};
pub use queue::QueueSet;

use crate::config::BusConfig;
use crate::error::{Error, Result};
use chainrelay_core::{Record, RecordKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

const DRAIN_BATCH: usize = 64;
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);
const STATS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Records published per kind, for the session's stats line.
#[derive(Default)]
pub struct DeliveryCounts {
    published: [AtomicU64; 4],
    bytes: AtomicU64,
}

impl DeliveryCounts {
    fn record(&self, kind: RecordKind, bytes: usize) {
        self.published[kind_idx(kind)].fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn published(&self, kind: RecordKind) -> u64 {
        self.published[kind_idx(kind)].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        RecordKind::ALL.iter().map(|k| self.published(*k)).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

fn kind_idx(kind: RecordKind) -> usize {
    match kind {
        RecordKind::Block => 0,
        RecordKind::Tx => 1,
        RecordKind::Row => 2,
        RecordKind::Misc => 3,
    }
}

/// Handle to the running relay. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    queues: Arc<QueueSet>,
    counts: Arc<DeliveryCounts>,
}

impl Relay {
    /// Spawn the per-kind drain tasks and the stats reporter.
    ///
    /// Publish or queue failures are relay-fatal: they go to `errs` and the
    /// caller is expected to cancel `shutdown`.
    pub fn start(
        queues: Arc<QueueSet>,
        sink: Arc<dyn BusSink>,
        bus: &BusConfig,
        publisher_pool: usize,
        errs: mpsc::Sender<Error>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let counts = Arc::new(DeliveryCounts::default());
        for kind in RecordKind::ALL {
            tokio::spawn(drain_loop(
                kind,
                bus.topic(kind),
                Arc::clone(&queues),
                Arc::clone(&sink),
                publisher_pool.max(1),
                Arc::clone(&counts),
                errs.clone(),
                shutdown.clone(),
            ));
        }
        tokio::spawn(stats_loop(
            Arc::clone(&queues),
            Arc::clone(&counts),
            shutdown,
        ));
        Self { queues, counts }
    }

    /// Durably accept a decoded record for publishing.
    pub fn enqueue(&self, record: &Record) -> Result<()> {
        self.queues.enqueue(record.kind, &record.payload)?;
        Ok(())
    }

    pub fn counts(&self) -> Arc<DeliveryCounts> {
        Arc::clone(&self.counts)
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_loop(
    kind: RecordKind,
    topic: String,
    queues: Arc<QueueSet>,
    sink: Arc<dyn BusSink>,
    pool: usize,
    counts: Arc<DeliveryCounts>,
    errs: mpsc::Sender<Error>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(pool));
    loop {
        if *shutdown.borrow() {
            debug!(%kind, "relay drain stopping");
            return;
        }
        let batch = match queues.drain_batch(kind, DRAIN_BATCH) {
            Ok(batch) => batch,
            Err(e) => {
                let _ = errs.try_send(e);
                return;
            }
        };
        if batch.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }
        let failures = Arc::new(AtomicU64::new(0));
        for (seq, payload) in batch {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let queues = Arc::clone(&queues);
            let sink = Arc::clone(&sink);
            let counts = Arc::clone(&counts);
            let errs = errs.clone();
            let topic = topic.clone();
            let failures = Arc::clone(&failures);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = publish_one(kind, &topic, &queues, &*sink, seq, &payload, &counts).await
                {
                    warn!(%kind, seq, error = %e, "publish failed");
                    failures.fetch_add(1, Ordering::Relaxed);
                    // first fatal error wins; a full channel means shutdown
                    // is already on its way
                    let _ = errs.try_send(e);
                }
            });
        }
        // wait for the batch to finish before re-reading the queue; entries
        // still being published are not yet acked and would be re-read
        match permits.acquire_many(pool as u32).await {
            Ok(all) => drop(all),
            Err(_) => return,
        }
        // unacked entries come straight back on the next read; hold off so a
        // down sink does not turn the loop into a busy spin
        if failures.load(Ordering::Relaxed) > 0 {
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

async fn publish_one(
    kind: RecordKind,
    topic: &str,
    queues: &QueueSet,
    sink: &dyn BusSink,
    seq: u64,
    payload: &[u8],
    counts: &DeliveryCounts,
) -> Result<()> {
    let body = compress(payload)?;
    sink.publish(topic, &seq.to_string(), &body).await?;
    queues.ack(kind, seq)?;
    counts.record(kind, body.len());
    metrics::counter!("relay_published_total", "kind" => kind.topic()).increment(1);
    metrics::counter!("relay_publish_bytes_total").increment(body.len() as u64);
    Ok(())
}

async fn stats_loop(
    queues: Arc<QueueSet>,
    counts: Arc<DeliveryCounts>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(STATS_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for kind in RecordKind::ALL {
                    metrics::gauge!("relay_queue_depth", "kind" => kind.topic())
                        .set(queues.depth(kind) as f64);
                }
                debug!(
                    published = counts.total(),
                    bytes = counts.bytes(),
                    "relay delivery totals"
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
