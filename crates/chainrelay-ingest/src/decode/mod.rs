//! The decode/transform engine.
//!
//! One pure decoder per event kind, sharing only the [`AbiStore`]. Decoders
//! take the raw frame plus its parsed envelope payload and emit relay-ready
//! [`Record`]s; per-record failures are contained here and never stall the
//! pipeline.

mod account;
pub mod abi;
pub mod abi_codec;
mod block;
mod fixup;
mod table;
mod trace;

pub use abi::AbiStore;
pub use fixup::fixup;

use crate::error::{Error, Result};
use crate::fallback::BlockIdSource;
use chainrelay_core::{Envelope, MsgType, Record};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Frame decoder: routes an envelope to the decoder for its kind.
pub struct Decoder {
    abis: Arc<AbiStore>,
    lookup: Arc<dyn BlockIdSource>,
}

impl Decoder {
    pub fn new(abis: Arc<AbiStore>, lookup: Arc<dyn BlockIdSource>) -> Self {
        Self { abis, lookup }
    }

    pub fn abis(&self) -> &AbiStore {
        &self.abis
    }

    /// Decode one raw frame into zero or more records.
    ///
    /// Control kinds and unknown tags decode to nothing. A block carrying a
    /// new producer schedule decodes to two records.
    pub async fn decode(&self, frame: &[u8]) -> Result<Vec<Record>> {
        let env = Envelope::parse(frame)?;
        let kind = env.kind();
        if kind == MsgType::Unknown || kind.is_ignored_signal() || kind == MsgType::BlockCompleted {
            return Ok(Vec::new());
        }
        let data = env
            .data
            .ok_or_else(|| Error::Malformed(format!("{} frame without data", env.msg_type)))?
            .get()
            .as_bytes();

        let records = match kind {
            MsgType::Block => {
                let (header, schedule) = block::decode_block(data, &*self.lookup).await?;
                match schedule {
                    Some(sched) => vec![header, sched],
                    None => vec![header],
                }
            }
            MsgType::TableRow => vec![table::decode_table(frame, data, &self.abis)?],
            MsgType::TxTrace => vec![trace::decode_trace(data)?],
            MsgType::AbiUpdate => vec![abi_update(data, &self.abis)?],
            MsgType::Permission | MsgType::PermissionLink | MsgType::AccMetadata => {
                vec![account::decode_account(frame, data, env.msg_type)?]
            }
            _ => Vec::new(),
        };
        for record in &records {
            metrics::counter!("decode_records_total", "kind" => record.kind.topic()).increment(1);
        }
        Ok(records)
    }
}

/// ABI-update decoder. Runs inline on the dispatch path so that every later
/// table-row decode for the account observes the new schema.
fn abi_update(data: &[u8], abis: &AbiStore) -> Result<Record> {
    let mut doc: Value = serde_json::from_slice(data)?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| Error::Malformed("abi update is not an object".to_string()))?;
    let block_num = uint32_field(obj, "block_num")?;
    obj.insert("block_num".to_string(), Value::from(block_num));
    let account = str_field(obj, "account")?.to_string();

    let abi_raw = serde_json::to_vec(
        obj.get("abi")
            .ok_or_else(|| Error::Malformed("abi update without schema".to_string()))?,
    )?;
    let id = chainrelay_core::content_id(&abi_raw);
    obj.insert("id".to_string(), Value::from(id.clone()));
    obj.insert("record_type".to_string(), Value::from("abi"));

    abis.register_json(&account, &abi_raw);

    Ok(Record {
        kind: chainrelay_core::RecordKind::Misc,
        id,
        block_num,
        payload: serde_json::to_vec(&doc)?,
    })
}

/// A numeric field that may arrive as a decimal string or a native number.
pub(crate) fn uint_field(map: &Map<String, Value>, key: &str) -> Result<u64> {
    match map.get(key) {
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| Error::Malformed(format!("field {key} is not numeric: {s}"))),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::Malformed(format!("field {key} out of range"))),
        _ => Err(Error::Malformed(format!("missing numeric field {key}"))),
    }
}

/// Like [`uint_field`] but for block heights and other u32 slots. A value
/// past `u32::MAX` is malformed input, not something to wrap around.
pub(crate) fn uint32_field(map: &Map<String, Value>, key: &str) -> Result<u32> {
    let n = uint_field(map, key)?;
    u32::try_from(n).map_err(|_| Error::Malformed(format!("field {key} out of range: {n}")))
}

pub(crate) fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Malformed(format!("missing string field {key}")))
}

/// Coerce a string-or-number field to a native integer in place.
pub(crate) fn coerce_uint(map: &mut Map<String, Value>, key: &str) {
    if let Ok(n) = uint_field(map, key) {
        map.insert(key.to_string(), Value::from(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::NoFallback;
    use chainrelay_core::RecordKind;
    use serde_json::json;

    fn decoder() -> Decoder {
        Decoder::new(Arc::new(AbiStore::new()), Arc::new(NoFallback))
    }

    #[tokio::test]
    async fn control_frames_decode_to_nothing() {
        let d = decoder();
        for tag in ["FORK", "RCVR_PAUSE", "ENCODER_ERROR", "BLOCK_COMPLETED", "WAT"] {
            let frame = format!(r#"{{"msgtype":"{tag}","data":{{}}}}"#);
            assert!(d.decode(frame.as_bytes()).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn abi_update_registers_schema_and_emits_record() {
        let d = decoder();
        let frame = json!({
            "msgtype": "ABI_UPD",
            "data": {
                "block_num": "55",
                "block_timestamp": "2020-01-01T00:00:00.000",
                "account": "test.acct",
                "abi": {
                    "version": "eosio::abi/1.1",
                    "types": [],
                    "structs": [{"name": "row", "base": "", "fields": [{"name": "owner", "type": "name"}]}],
                    "actions": [],
                    "tables": [{"name": "rows", "type": "row"}]
                }
            }
        });
        let records = d.decode(json_bytes(&frame).as_slice()).await.unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.kind, RecordKind::Misc);
        assert_eq!(rec.block_num, 55);
        assert_eq!(rec.id.len(), 64);
        assert!(d.abis().get("test.acct").is_some());

        let payload: Value = serde_json::from_slice(&rec.payload).unwrap();
        assert_eq!(payload["record_type"], json!("abi"));
        assert_eq!(payload["block_num"], json!(55));
    }

    #[tokio::test]
    async fn decode_ids_are_deterministic() {
        let d = decoder();
        let frame = json_bytes(&json!({
            "msgtype": "PERMISSION",
            "data": {"block_num": "9", "block_timestamp": "t", "permission": {}}
        }));
        let a = d.decode(&frame).await.unwrap();
        let b = d.decode(&frame).await.unwrap();
        assert_eq!(a[0].id, b[0].id);
    }

    #[tokio::test]
    async fn unparseable_frame_is_an_error() {
        assert!(decoder().decode(b"not json").await.is_err());
    }

    #[tokio::test]
    async fn oversized_block_num_is_an_error() {
        let frame = json_bytes(&json!({
            "msgtype": "PERMISSION",
            "data": {"block_num": "4294967296", "block_timestamp": "t", "permission": {}}
        }));
        assert!(decoder().decode(&frame).await.is_err());
    }

    fn json_bytes(v: &Value) -> Vec<u8> {
        serde_json::to_vec(v).unwrap()
    }
}
