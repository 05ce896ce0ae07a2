//! Account, permission, and metadata decoder.
//!
//! These kinds share one shape: the payload is passed through untouched
//! under `data`, tagged with the originating kind and a content-hash id.

use super::uint32_field;
use crate::error::{Error, Result};
use chainrelay_core::{content_id, Record, RecordKind};
use serde_json::{json, Value};

pub(super) fn decode_account(frame: &[u8], data: &[u8], wire_tag: &str) -> Result<Record> {
    let doc: Value = serde_json::from_slice(data)?;
    let obj = doc
        .as_object()
        .ok_or_else(|| Error::Malformed("account payload is not an object".to_string()))?;
    let block_num = uint32_field(obj, "block_num")?;
    let block_timestamp = obj
        .get("block_timestamp")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let id = content_id(frame);
    let payload = json!({
        "id": id,
        "record_type": wire_tag.to_ascii_lowercase(),
        "block_num": block_num,
        "block_timestamp": block_timestamp,
        "data": doc,
    });

    Ok(Record {
        kind: RecordKind::Misc,
        id,
        block_num,
        payload: serde_json::to_vec(&payload)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_data_through_with_tag() {
        let data = json!({
            "block_num": "321",
            "block_timestamp": "2020-06-01T12:00:00.500",
            "account": "alice",
            "permission": {"perm_name": "active", "parent": "owner"}
        });
        let raw = serde_json::to_vec(&data).unwrap();
        let frame = serde_json::to_vec(&json!({"msgtype": "PERMISSION", "data": data})).unwrap();

        let rec = decode_account(&frame, &raw, "PERMISSION").unwrap();
        assert_eq!(rec.kind, RecordKind::Misc);
        assert_eq!(rec.block_num, 321);
        assert_eq!(rec.id, content_id(&frame));

        let payload: Value = serde_json::from_slice(&rec.payload).unwrap();
        assert_eq!(payload["record_type"], json!("permission"));
        assert_eq!(payload["block_num"], json!(321));
        assert_eq!(payload["data"]["permission"]["perm_name"], json!("active"));
    }

    #[test]
    fn tags_follow_the_wire_kind() {
        let data = json!({"block_num": "1"});
        let raw = serde_json::to_vec(&data).unwrap();
        for (tag, want) in [
            ("PERMISSION_LINK", "permission_link"),
            ("ACC_METADATA", "acc_metadata"),
        ] {
            let rec = decode_account(b"frame", &raw, tag).unwrap();
            let payload: Value = serde_json::from_slice(&rec.payload).unwrap();
            assert_eq!(payload["record_type"], json!(want));
        }
    }
}
