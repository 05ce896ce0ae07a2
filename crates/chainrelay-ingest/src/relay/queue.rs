//! Durable per-kind queues backed by RocksDB.
//!
//! One column family per record kind, keyed by a big-endian sequence number
//! so iteration order is enqueue order. Enqueues are fsync'd; entries are
//! deleted only when the publish stage acks them, giving at-least-once
//! delivery across process restarts.

use crate::error::{Error, Result};
use chainrelay_core::RecordKind;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteOptions,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

fn idx(kind: RecordKind) -> usize {
    match kind {
        RecordKind::Block => 0,
        RecordKind::Tx => 1,
        RecordKind::Row => 2,
        RecordKind::Misc => 3,
    }
}

/// The four durable queues, sharing one database.
pub struct QueueSet {
    db: DBWithThreadMode<MultiThreaded>,
    next_seq: [AtomicU64; 4],
}

impl QueueSet {
    /// Open or create the queue database at the given path, restoring the
    /// per-kind sequence counters from whatever survived the last run.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = RecordKind::ALL
            .iter()
            .map(|kind| ColumnFamilyDescriptor::new(kind.topic(), Options::default()));
        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path, cfs)?;

        let next_seq: [AtomicU64; 4] = Default::default();
        for kind in RecordKind::ALL {
            let cf = db
                .cf_handle(kind.topic())
                .ok_or_else(|| Error::BrokerUnavailable(format!("missing queue {kind}")))?;
            if let Some(Ok((key, _))) = db.iterator_cf(&cf, IteratorMode::End).next() {
                next_seq[idx(kind)].store(decode_seq(&key) + 1, Ordering::SeqCst);
            }
        }
        info!(path = %path.display(), "durable queues open");
        Ok(Self { db, next_seq })
    }

    fn cf(&self, kind: RecordKind) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(kind.topic())
            .ok_or_else(|| Error::BrokerUnavailable(format!("missing queue {kind}")))
    }

    /// Durably append a payload. The write is fsync'd before returning.
    pub fn enqueue(&self, kind: RecordKind, payload: &[u8]) -> Result<u64> {
        let seq = self.next_seq[idx(kind)].fetch_add(1, Ordering::SeqCst);
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(&self.cf(kind)?, seq.to_be_bytes(), payload, &write_opts)
            .map_err(|e| Error::BrokerUnavailable(e.to_string()))?;
        metrics::counter!("relay_enqueued_total", "kind" => kind.topic()).increment(1);
        Ok(seq)
    }

    /// The oldest `max` entries, in sequence order. Entries stay queued
    /// until [`ack`](Self::ack)ed.
    pub fn drain_batch(&self, kind: RecordKind, max: usize) -> Result<Vec<(u64, Vec<u8>)>> {
        let cf = self.cf(kind)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start).take(max) {
            let (key, value) = item.map_err(|e| Error::BrokerUnavailable(e.to_string()))?;
            out.push((decode_seq(&key), value.into_vec()));
        }
        Ok(out)
    }

    /// Remove a published entry.
    pub fn ack(&self, kind: RecordKind, seq: u64) -> Result<()> {
        self.db
            .delete_cf(&self.cf(kind)?, seq.to_be_bytes())
            .map_err(|e| Error::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Approximate number of waiting entries.
    pub fn depth(&self, kind: RecordKind) -> u64 {
        let Ok(cf) = self.cf(kind) else { return 0 };
        self.db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")
            .ok()
            .flatten()
            .unwrap_or(0)
    }
}

fn decode_seq(key: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    let n = key.len().min(8);
    arr[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(arr)
}
