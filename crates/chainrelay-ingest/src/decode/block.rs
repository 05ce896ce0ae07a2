//! Block decoder.
//!
//! The feed delivers the signed header and transaction list as JSON but no
//! block id. The id is re-derived locally by re-serializing the header into
//! the chain's binary encoding and hashing it; when that fails we fall back
//! to the external lookup, and as a last resort emit a placeholder id so the
//! pipeline never stalls on one block.

use super::{coerce_uint, fixup, str_field, uint32_field, uint_field};
use crate::error::{Error, Result};
use crate::fallback::BlockIdSource;
use crate::wire;
use chainrelay_core::{Record, RecordKind};
use serde_json::{json, Map, Value};
use tracing::{error, warn};

/// A producer entry whose signing key has been rewritten to the legacy form.
struct RepairedProducer {
    name: String,
    key: String,
}

pub(super) async fn decode_block(
    data: &[u8],
    lookup: &dyn BlockIdSource,
) -> Result<(Record, Option<Record>)> {
    let mut doc: Value = serde_json::from_slice(data)?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| Error::Malformed("block payload is not an object".to_string()))?;
    let block_num = uint32_field(obj, "block_num")?;

    let block_time = obj
        .get("block")
        .and_then(|b| b.get("timestamp"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let derived = obj
        .get("block")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Malformed("block payload missing header".to_string()))
        .and_then(parse_header);

    let (id, repaired) = match derived {
        Ok((header, repaired)) => (header.id(), repaired),
        Err(e) => {
            metrics::counter!("decode_quality_faults_total").increment(1);
            warn!(block_num, error = %e, "could not derive block id locally, using fallback");
            match lookup.block_id(block_num).await {
                Ok(id) => (id, Vec::new()),
                Err(e) => {
                    error!(block_num, error = %e, "could not derive a block id");
                    (format!("block-id-error-{block_num}"), Vec::new())
                }
            }
        }
    };

    obj.insert("record_type".to_string(), Value::from("block"));
    obj.insert("id".to_string(), Value::from(id.clone()));
    obj.insert("block_num".to_string(), Value::from(block_num));
    obj.insert("block_time".to_string(), Value::from(block_time.clone()));

    let mut schedule_payload = None;
    if let Some(block) = obj.get_mut("block").and_then(Value::as_object_mut) {
        coerce_uint(block, "confirmed");
        coerce_uint(block, "schedule_version");

        if let Some(np) = block.get_mut("new_producers").and_then(Value::as_object_mut) {
            coerce_uint(np, "version");
            let version = np.get("version").cloned().unwrap_or(Value::Null);
            let producers: Vec<Value> = repaired
                .iter()
                .map(|p| {
                    json!({"producer_name": p.name, "block_signing_key": p.key})
                })
                .collect();
            if !producers.is_empty() {
                np.insert("producers".to_string(), Value::Array(producers.clone()));
            }
            schedule_payload = Some(json!({
                "id": format!("sched-{block_num}-{block_time}"),
                "record_type": "schedule",
                "producers": producers,
                "schedule": version,
                "block_num": block_num,
                "block_time": block_time,
            }));
        }

        if let Some(transactions) = block.get_mut("transactions").and_then(Value::as_array_mut) {
            for trx in transactions {
                if let Some(entry) = trx.as_object_mut() {
                    // a transaction that failed upstream decoding arrives as
                    // a bare hex string; wrap it so the payload stays structured
                    if let Some(s) = entry.get("trx").and_then(Value::as_str).map(str::to_string) {
                        entry.insert("trx".to_string(), json!({ "bytes": s }));
                    }
                    fixup(entry);
                }
            }
        }
    }

    let header_record = Record {
        kind: RecordKind::Block,
        id,
        block_num,
        payload: serde_json::to_vec(&doc)?,
    };
    let schedule_record = match schedule_payload {
        Some(payload) => Some(Record {
            kind: RecordKind::Block,
            id: format!("sched-{block_num}-{block_time}"),
            block_num,
            payload: serde_json::to_vec(&payload)?,
        }),
        None => None,
    };
    Ok((header_record, schedule_record))
}

fn parse_header(block: &Map<String, Value>) -> Result<(wire::BlockHeader, Vec<RepairedProducer>)> {
    let mut repaired = Vec::new();
    let new_producers = match block.get("new_producers") {
        Some(Value::Object(np)) => {
            let version = uint32_field(np, "version")?;
            let mut producers = Vec::new();
            let entries = np
                .get("producers")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for entry in entries {
                let entry = entry
                    .as_object()
                    .ok_or_else(|| Error::Malformed("bad producer entry".to_string()))?;
                let name = str_field(entry, "producer_name")?;
                let key = str_field(entry, "block_signing_key")?;
                match wire::repair_k1_key(key) {
                    Ok((legacy, raw)) => {
                        producers.push(wire::ProducerKey {
                            account: wire::string_to_name(name)?,
                            key: raw,
                        });
                        repaired.push(RepairedProducer {
                            name: name.to_string(),
                            key: legacy,
                        });
                    }
                    Err(e) => {
                        warn!(producer = name, error = %e, "skipping unrepairable signing key");
                    }
                }
            }
            // schedule order is part of the hashed encoding
            producers.sort_by_key(|p| p.account);
            Some(wire::ProducerSchedule { version, producers })
        }
        _ => None,
    };

    let header = wire::BlockHeader {
        timestamp_slot: wire::timestamp_slot(str_field(block, "timestamp")?)?,
        producer: wire::string_to_name(str_field(block, "producer")?)?,
        confirmed: u16::try_from(uint_field(block, "confirmed")?)
            .map_err(|_| Error::Malformed("field confirmed out of range".to_string()))?,
        previous: wire::checksum256(str_field(block, "previous")?)?,
        transaction_mroot: wire::checksum256(str_field(block, "transaction_mroot")?)?,
        action_mroot: wire::checksum256(str_field(block, "action_mroot")?)?,
        schedule_version: uint32_field(block, "schedule_version")?,
        new_producers,
    };
    Ok((header, repaired))
}
