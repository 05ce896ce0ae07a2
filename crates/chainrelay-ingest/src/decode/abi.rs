//! Shared ABI schema store.
//!
//! Read-mostly: every concurrent table-row decode reads, only the serialized
//! ABI-update dispatch path writes. Seeded at startup with the well-known
//! system-contract schemas so rows decoded before any update event still
//! resolve.

use super::abi_codec::Abi;
use crate::error::Result;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Schemas embedded for the system contracts.
pub(crate) const SEED_ABIS: &[(&str, &str)] = &[
    ("eosio", include_str!("abis/eosio.json")),
    ("eosio.msig", include_str!("abis/eosio.msig.json")),
    ("fio.address", include_str!("abis/fio.address.json")),
    ("fio.fee", include_str!("abis/fio.fee.json")),
    ("fio.reqobt", include_str!("abis/fio.reqobt.json")),
    ("fio.token", include_str!("abis/fio.token.json")),
    ("fio.tpid", include_str!("abis/fio.tpid.json")),
    ("fio.treasury", include_str!("abis/fio.treasury.json")),
];

/// Concurrent account → schema map.
pub struct AbiStore {
    inner: RwLock<HashMap<String, Arc<Abi>>>,
}

impl AbiStore {
    /// An empty store. Mostly useful in tests.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// A store seeded with the embedded system-contract schemas.
    pub fn with_defaults() -> Result<Self> {
        let store = Self::new();
        {
            let mut inner = store.inner.write();
            for (account, raw) in SEED_ABIS {
                inner.insert(account.to_string(), Arc::new(Abi::from_json(raw.as_bytes())?));
            }
        }
        Ok(store)
    }

    pub fn get(&self, account: &str) -> Option<Arc<Abi>> {
        self.inner.read().get(account).cloned()
    }

    /// Register (or replace) the schema for an account.
    pub fn put(&self, account: &str, abi: Abi) {
        self.inner.write().insert(account.to_string(), Arc::new(abi));
    }

    /// Parse and register a schema from its JSON bytes. A schema that fails
    /// to parse is logged and skipped rather than evicting the previous one.
    pub fn register_json(&self, account: &str, raw: &[u8]) {
        match Abi::from_json(raw) {
            Ok(abi) => {
                debug!(account, "registered updated abi");
                self.put(account, abi);
            }
            Err(e) => {
                metrics::counter!("decode_quality_faults_total").increment(1);
                warn!(account, error = %e, "ignoring unparseable abi update");
            }
        }
    }

    /// Decode a table-row value that may still be hex-encoded binary.
    ///
    /// On any failure (no schema, bad hex, truncated or unknown-typed row)
    /// the original string passes through unmodified so the record is never
    /// dropped.
    pub fn decode_row(&self, account: &str, table: &str, value: &str) -> Value {
        if value.starts_with('{') {
            return Value::String(value.to_string());
        }
        let Some(abi) = self.get(account) else {
            metrics::counter!("decode_quality_faults_total").increment(1);
            return Value::String(value.to_string());
        };
        let Ok(bytes) = hex::decode(value) else {
            return Value::String(value.to_string());
        };
        match abi.decode_table_row(table, &bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                metrics::counter!("decode_quality_faults_total").increment(1);
                debug!(account, table, error = %e, "table row left undecoded");
                Value::String(value.to_string())
            }
        }
    }
}

impl Default for AbiStore {
    fn default() -> Self {
        Self::new()
    }
}
