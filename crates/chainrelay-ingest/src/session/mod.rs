//! The upstream ingestion session.
//!
//! One session owns the upstream connection end to end: it reads frames,
//! dispatches them to decode tasks through the backpressure gate,
//! acknowledges progress on a fixed tick, and supervises itself for stalls
//! and memory growth. Exactly one session runs at a time; a second
//! connection attempt is refused while the slot is held.

mod spawner;
mod state;

pub use spawner::TaskSpawner;
pub use state::SessionState;

use crate::config::IngestConfig;
use crate::decode::Decoder;
use crate::error::{Error, Result};
use crate::relay::Relay;
use async_trait::async_trait;
use chainrelay_core::{Envelope, MsgType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const STATS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// One inbound unit from the transport.
pub enum Frame {
    /// A binary event frame.
    Binary(Vec<u8>),
    /// Transport chatter (pings, text) the session only counts as liveness.
    Ignored,
}

/// Transport seam between the session and the network.
///
/// The production implementation wraps a websocket; tests script one.
#[async_trait]
pub trait Feed: Send {
    /// Next frame, or `None` when the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>>;

    /// Send an acknowledgement or request line upstream.
    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn close(&mut self);
}

/// Grants the single session slot.
#[derive(Clone, Default)]
pub struct SessionManager {
    slot: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, failing when a session is already running.
    pub fn try_acquire(&self) -> Result<SessionGuard> {
        if self
            .slot
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(SessionGuard {
                slot: Arc::clone(&self.slot),
            })
        } else {
            Err(Error::SlotOccupied)
        }
    }
}

/// Releases the slot when the session ends, however it ends.
pub struct SessionGuard {
    slot: Arc<AtomicBool>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::SeqCst);
    }
}

/// Build the upstream range-request line for an interactive session.
pub fn range_request(state: &SessionState, start: u32, end: u32) -> Result<String> {
    if !state.interactive() {
        return Err(Error::NotInteractive);
    }
    if start > end {
        return Err(Error::InvalidRange { start, end });
    }
    Ok(format!("{start}-{end}"))
}

/// A running ingestion session.
pub struct Session<F: Feed> {
    feed: F,
    state: Arc<SessionState>,
    decoder: Arc<Decoder>,
    relay: Relay,
    spawner: TaskSpawner,
    cfg: IngestConfig,
    shutdown: watch::Receiver<bool>,
    _guard: SessionGuard,
}

impl<F: Feed> Session<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feed: F,
        guard: SessionGuard,
        state: Arc<SessionState>,
        decoder: Arc<Decoder>,
        relay: Relay,
        cfg: IngestConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let spawner = TaskSpawner::new(cfg.max_in_flight);
        Self {
            feed,
            state,
            decoder,
            relay,
            spawner,
            cfg,
            shutdown,
            _guard: guard,
        }
    }

    /// Ask the upstream for a specific block range. Only valid on an
    /// interactive session, before or during the run loop.
    pub async fn request_range(&mut self, start: u32, end: u32) -> Result<()> {
        let line = range_request(&self.state, start, end)?;
        self.feed.send_text(line).await
    }

    /// Drive the session to completion.
    ///
    /// Returns `Ok(())` on a clean upstream close or external shutdown, and
    /// the terminal error otherwise. In-flight decodes get a bounded drain
    /// and the counters are persisted on every exit path.
    pub async fn run(self) -> Result<()> {
        let Session {
            mut feed,
            state,
            decoder,
            relay,
            spawner,
            cfg,
            mut shutdown,
            _guard,
        } = self;

        // decode tasks report enqueue failures here; first one ends the run
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(8);

        let mut ack = tokio::time::interval(cfg.ack_interval());
        let mut supervise = tokio::time::interval(cfg.supervise_interval());
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        for tick in [&mut ack, &mut supervise, &mut stats] {
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        }

        info!(
            sent = state.sent(),
            confirmed = state.seen(),
            fetch = state.fetch(),
            interactive = state.interactive(),
            "session started"
        );

        let outcome = loop {
            tokio::select! {
                // gated: when the pool is full we stop reading and let the
                // transport's flow control push back on the upstream
                frame = feed.recv(), if spawner.has_capacity() => match frame {
                    Ok(Some(Frame::Binary(bytes))) => {
                        state.touch();
                        state.add_bytes(bytes.len() as u64);
                        metrics::counter!("session_frames_total").increment(1);
                        metrics::counter!("session_bytes_total").increment(bytes.len() as u64);
                        dispatch(bytes, &decoder, &relay, &spawner, &state, &fatal_tx).await;
                    }
                    Ok(Some(Frame::Ignored)) => state.touch(),
                    Ok(None) => {
                        info!("upstream closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
                _ = ack.tick() => {
                    if let Some(watermark) = state.take_ack(cfg.ack_margin) {
                        metrics::gauge!("session_watermark").set(watermark as f64);
                        if let Err(e) = feed.send_text(watermark.to_string()).await {
                            break Err(e);
                        }
                    }
                }
                _ = supervise.tick() => {
                    if let Err(e) = supervise_once(&state, &spawner, &cfg) {
                        break Err(e);
                    }
                }
                _ = stats.tick() => {
                    info!(
                        block = state.sent(),
                        mib = state.bytes() / (1024 * 1024),
                        in_flight = spawner.in_flight(),
                        published = relay.counts().total(),
                        "session stats"
                    );
                }
                Some(e) = fatal_rx.recv() => break Err(e),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown requested");
                        break Ok(());
                    }
                }
            }
        };

        if !spawner.drain(cfg.drain_timeout()).await {
            warn!(
                in_flight = spawner.in_flight(),
                "decode tasks still running at drain deadline"
            );
        }
        if let Err(e) = state.save() {
            warn!(error = %e, "failed to persist session counters");
        }
        feed.close().await;
        outcome
    }
}

/// Route one binary frame.
///
/// Progress markers and schema updates are handled inline so their effects
/// are visible to every later frame; everything else decodes concurrently.
async fn dispatch(
    frame: Vec<u8>,
    decoder: &Arc<Decoder>,
    relay: &Relay,
    spawner: &TaskSpawner,
    state: &Arc<SessionState>,
    fatal: &mpsc::Sender<Error>,
) {
    let kind = match Envelope::parse(&frame) {
        Ok(env) => env.kind(),
        Err(e) => {
            warn!(error = %e, "dropping unparseable frame");
            metrics::counter!("session_frames_dropped_total").increment(1);
            return;
        }
    };
    match kind {
        MsgType::BlockCompleted => match completed_height(&frame) {
            Some(n) => state.record_completed(n),
            None => {
                warn!("block-completed marker without a height");
                metrics::counter!("session_frames_dropped_total").increment(1);
            }
        },
        MsgType::AbiUpdate => match decoder.decode(&frame).await {
            Ok(records) => {
                for record in records {
                    if let Err(e) = relay.enqueue(&record) {
                        let _ = fatal.try_send(e);
                        return;
                    }
                }
            }
            Err(e) => {
                metrics::counter!("decode_errors_total").increment(1);
                warn!(error = %e, "dropping undecodable schema update");
            }
        },
        MsgType::Unknown => {
            metrics::counter!("session_frames_dropped_total").increment(1);
        }
        k if k.is_ignored_signal() => {}
        _ => {
            let decoder = Arc::clone(decoder);
            let relay = relay.clone();
            let fatal = fatal.clone();
            spawner
                .spawn(async move {
                    match decoder.decode(&frame).await {
                        Ok(records) => {
                            for record in records {
                                if let Err(e) = relay.enqueue(&record) {
                                    let _ = fatal.try_send(e);
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            metrics::counter!("decode_errors_total").increment(1);
                            warn!(error = %e, "dropping undecodable frame");
                        }
                    }
                })
                .await;
        }
    }
}

fn completed_height(frame: &[u8]) -> Option<u32> {
    let doc: serde_json::Value = serde_json::from_slice(frame).ok()?;
    let data = doc.get("data")?.as_object()?;
    u32::try_from(crate::decode::uint_field(data, "block_num").ok()?).ok()
}

fn supervise_once(state: &SessionState, spawner: &TaskSpawner, cfg: &IngestConfig) -> Result<()> {
    let idle = state.idle_for();
    if idle > cfg.idle_timeout() && spawner.in_flight() == 0 {
        return Err(Error::IdleTimeout(idle));
    }
    if let Some(rss) = resident_bytes() {
        if rss > cfg.memory_ceiling_bytes {
            return Err(Error::MemoryCeiling {
                rss_bytes: rss,
                ceiling_bytes: cfg.memory_ceiling_bytes,
            });
        }
    }
    if let Err(e) = state.save() {
        warn!(error = %e, "failed to persist session counters");
    }
    Ok(())
}

/// Resident set size from /proc, when available.
fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}
