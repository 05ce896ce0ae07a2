//! Table-row decoder.

use super::{uint32_field, AbiStore};
use crate::error::{Error, Result};
use crate::wire::name_to_string;
use chainrelay_core::{content_id, Record, RecordKind};
use serde_json::Value;

pub(super) fn decode_table(frame: &[u8], data: &[u8], abis: &AbiStore) -> Result<Record> {
    let mut doc: Value = serde_json::from_slice(data)?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| Error::Malformed("table row is not an object".to_string()))?;
    let block_num = uint32_field(obj, "block_num")?;
    obj.insert("block_num".to_string(), Value::from(block_num));
    obj.insert("record_type".to_string(), Value::from("table_row"));

    let id = content_id(frame);
    obj.insert("id".to_string(), Value::from(id.clone()));

    let kvo = obj
        .get_mut("kvo")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::Malformed("table row missing kvo".to_string()))?;

    let code = kvo
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let table = kvo
        .get("table")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // a string value means the upstream encoder had no schema; try ours
    if let Some(raw) = kvo.get("value").and_then(Value::as_str).map(str::to_string) {
        kvo.insert("value".to_string(), abis.decode_row(&code, &table, &raw));
    }

    // keys above the 32-bit range are usually packed symbolic names
    kvo.entry("primary_key_name".to_string())
        .or_insert(Value::from(""));
    if let Some(pk) = kvo.get("primary_key").and_then(Value::as_str) {
        if let Ok(n) = pk.parse::<u64>() {
            if n > u64::from(u32::MAX) {
                kvo.insert("primary_key_name".to_string(), Value::from(name_to_string(n)));
            }
        }
    }

    Ok(Record {
        kind: RecordKind::Row,
        id,
        block_num,
        payload: serde_json::to_vec(&doc)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::string_to_name;
    use serde_json::json;

    fn frame_for(data: &Value) -> (Vec<u8>, Vec<u8>) {
        let frame = serde_json::to_vec(&json!({"msgtype": "TBL_ROW", "data": data})).unwrap();
        let data = serde_json::to_vec(data).unwrap();
        (frame, data)
    }

    #[test]
    fn unknown_schema_passes_value_through() {
        let (frame, data) = frame_for(&json!({
            "block_num": "77",
            "block_timestamp": "2020-06-01T12:00:00.500",
            "added": "true",
            "kvo": {
                "code": "nobody.home",
                "scope": "nobody.home",
                "table": "things",
                "primary_key": "12",
                "value": "deadbeef"
            }
        }));
        let rec = decode_table(&frame, &data, &AbiStore::new()).unwrap();
        assert_eq!(rec.kind, RecordKind::Row);
        assert_eq!(rec.block_num, 77);

        let payload: Value = serde_json::from_slice(&rec.payload).unwrap();
        assert_eq!(payload["record_type"], json!("table_row"));
        assert_eq!(payload["kvo"]["value"], json!("deadbeef"));
        assert_eq!(payload["kvo"]["primary_key_name"], json!(""));
    }

    #[test]
    fn registered_schema_decodes_value() {
        let abis = AbiStore::new();
        abis.register_json(
            "test.acct",
            br#"{"version":"eosio::abi/1.1","types":[],
                 "structs":[{"name":"row","base":"","fields":[{"name":"owner","type":"name"}]}],
                 "actions":[],"tables":[{"name":"rows","type":"row"}]}"#,
        );
        let mut value = Vec::new();
        value.extend_from_slice(&string_to_name("dave").unwrap().to_le_bytes());
        let (frame, data) = frame_for(&json!({
            "block_num": "78",
            "kvo": {
                "code": "test.acct",
                "scope": "test.acct",
                "table": "rows",
                "primary_key": "1",
                "value": hex::encode(&value)
            }
        }));
        let rec = decode_table(&frame, &data, &abis).unwrap();
        let payload: Value = serde_json::from_slice(&rec.payload).unwrap();
        assert_eq!(payload["kvo"]["value"], json!({"owner": "dave"}));
    }

    #[test]
    fn wide_primary_key_gains_a_name() {
        let pk = string_to_name("fio.token").unwrap();
        assert!(pk > u64::from(u32::MAX));
        let (frame, data) = frame_for(&json!({
            "block_num": "79",
            "kvo": {
                "code": "c",
                "scope": "s",
                "table": "t",
                "primary_key": pk.to_string(),
                "value": {"already": "structured"}
            }
        }));
        let rec = decode_table(&frame, &data, &AbiStore::new()).unwrap();
        let payload: Value = serde_json::from_slice(&rec.payload).unwrap();
        assert_eq!(payload["kvo"]["primary_key_name"], json!("fio.token"));
    }

    #[test]
    fn missing_kvo_is_an_error() {
        let (frame, data) = frame_for(&json!({"block_num": "80"}));
        assert!(decode_table(&frame, &data, &AbiStore::new()).is_err());
    }

    #[test]
    fn id_is_the_frame_hash() {
        let (frame, data) = frame_for(&json!({
            "block_num": "81",
            "kvo": {"code": "c", "scope": "s", "table": "t", "primary_key": "1", "value": {}}
        }));
        let rec = decode_table(&frame, &data, &AbiStore::new()).unwrap();
        assert_eq!(rec.id, content_id(&frame));
    }
}
