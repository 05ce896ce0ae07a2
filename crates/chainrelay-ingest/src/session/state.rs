//! Session counters and their JSON persistence.
//!
//! Two watermarks drive acknowledgement: `sent` is the highest block the
//! upstream reader has observed on the wire, `seen` is the highest block
//! whose records have all been accepted durably. The ack tick folds `sent`
//! into `seen` and confirms `seen - margin` upstream, so a crash replays at
//! most one margin's worth of blocks.

use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
// the runtime clock, so supervision follows paused time in tests
use tokio::time::Instant;
use tracing::warn;

const DEFAULT_FETCH: u32 = 100;

/// On-disk form of the counters. Field names are shared with other
/// consumers of the state file and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedCounters {
    #[serde(rename = "confirmed")]
    seen: u32,
    sent: u32,
    fetch: u32,
    interactive: bool,
}

impl Default for PersistedCounters {
    fn default() -> Self {
        Self {
            seen: 0,
            sent: 0,
            fetch: DEFAULT_FETCH,
            interactive: false,
        }
    }
}

/// Live counters for the one active session.
pub struct SessionState {
    seen: AtomicU32,
    sent: AtomicU32,
    fetch: u32,
    interactive: bool,
    bytes: AtomicU64,
    last_activity: Mutex<Instant>,
    path: PathBuf,
}

impl SessionState {
    /// Load counters from the state file, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let persisted = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedCounters>(&bytes) {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state file unparseable, starting fresh");
                    PersistedCounters::default()
                }
            },
            Err(_) => PersistedCounters::default(),
        };
        Self {
            seen: AtomicU32::new(persisted.seen),
            sent: AtomicU32::new(persisted.sent),
            fetch: persisted.fetch,
            interactive: persisted.interactive,
            bytes: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            path,
        }
    }

    /// Write the counters back out.
    pub fn save(&self) -> Result<()> {
        let persisted = PersistedCounters {
            seen: self.seen(),
            sent: self.sent(),
            fetch: self.fetch,
            interactive: self.interactive,
        };
        std::fs::write(&self.path, serde_json::to_vec_pretty(&persisted)?)?;
        Ok(())
    }

    /// Record a block-completed marker from the wire. Monotonic.
    pub fn record_completed(&self, block_num: u32) {
        self.sent.fetch_max(block_num, Ordering::SeqCst);
    }

    /// Fold `sent` into `seen` and return the watermark to confirm
    /// upstream, or `None` when nothing advanced since the last tick.
    pub fn take_ack(&self, margin: u32) -> Option<u32> {
        let sent = self.sent();
        if sent > self.seen.swap(sent, Ordering::SeqCst) {
            Some(sent.saturating_sub(margin))
        } else {
            None
        }
    }

    pub fn seen(&self) -> u32 {
        self.seen.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn fetch(&self) -> u32 {
        self.fetch
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}
