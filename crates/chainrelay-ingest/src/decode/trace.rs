//! Transaction-trace decoder.

use super::{fixup, uint32_field};
use crate::error::{Error, Result};
use chainrelay_core::{Record, RecordKind};
use serde_json::{json, Value};

pub(super) fn decode_trace(data: &[u8]) -> Result<Record> {
    let mut doc: Value = serde_json::from_slice(data)?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| Error::Malformed("trace payload is not an object".to_string()))?;
    let block_num = uint32_field(obj, "block_num")?;
    obj.insert("block_num".to_string(), Value::from(block_num));
    obj.insert("record_type".to_string(), Value::from("trace"));

    // the protocol supplies the trace id; there is nothing better to hash
    let id = obj
        .get("trace")
        .and_then(|t| t.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Malformed("trace missing id".to_string()))?
        .to_string();
    obj.insert("id".to_string(), Value::from(id.clone()));

    if let Some(actions) = obj
        .get_mut("trace")
        .and_then(|t| t.get_mut("action_traces"))
        .and_then(Value::as_array_mut)
    {
        for action in actions {
            let Some(entry) = action.as_object_mut() else {
                continue;
            };
            // act.data (and act.data.owner) can arrive as bare strings when
            // the upstream encoder had no schema; the search index expects
            // objects at both paths
            if let Some(act) = entry.get_mut("act").and_then(Value::as_object_mut) {
                match act.get_mut("data") {
                    Some(Value::String(s)) => {
                        let raw = std::mem::take(s);
                        act.insert("data".to_string(), json!({ "raw": raw }));
                    }
                    Some(Value::Object(data)) => {
                        if let Some(Value::String(owner)) = data.get_mut("owner") {
                            let raw = std::mem::take(owner);
                            data.insert("owner".to_string(), json!({ "data": raw }));
                        }
                    }
                    _ => {}
                }
            }
            fixup(entry);
        }
    }

    Ok(Record {
        kind: RecordKind::Tx,
        id,
        block_num,
        payload: serde_json::to_vec(&doc)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trace_data() -> Value {
        json!({
            "block_num": "500",
            "block_timestamp": "2020-06-01T12:00:00.500",
            "trace": {
                "id": "feedface",
                "status": "executed",
                "elapsed": "250",
                "action_traces": [
                    {
                        "action_ordinal": "1",
                        "elapsed": "100",
                        "act": {
                            "account": "fio.token",
                            "name": "trnsfiopubky",
                            "data": {
                                "amount": "5000000000",
                                "max_fee": "800000000",
                                "owner": "FIO5abc"
                            }
                        },
                        "receipt": {"global_sequence": "424242"}
                    },
                    {
                        "action_ordinal": "2",
                        "act": {"account": "eosio", "name": "odd", "data": "0011aabb"}
                    }
                ]
            }
        })
    }

    #[test]
    fn normalizes_actions() {
        let rec = decode_trace(&serde_json::to_vec(&trace_data()).unwrap()).unwrap();
        assert_eq!(rec.kind, RecordKind::Tx);
        assert_eq!(rec.id, "feedface");
        assert_eq!(rec.block_num, 500);

        let payload: Value = serde_json::from_slice(&rec.payload).unwrap();
        assert_eq!(payload["record_type"], json!("trace"));
        let actions = &payload["trace"]["action_traces"];
        // registered int paths coerced
        assert_eq!(actions[0]["action_ordinal"], json!(1));
        assert_eq!(actions[0]["act"]["data"]["amount"], json!(5000000000u64));
        assert_eq!(actions[0]["act"]["data"]["max_fee"], json!(800000000));
        assert_eq!(actions[0]["receipt"]["global_sequence"], json!(424242));
        // string owner wrapped
        assert_eq!(
            actions[0]["act"]["data"]["owner"],
            json!({"data": "FIO5abc"})
        );
        // string act.data wrapped
        assert_eq!(actions[1]["act"]["data"], json!({"raw": "0011aabb"}));
        // unregistered path untouched
        assert_eq!(payload["trace"]["elapsed"], json!("250"));
    }

    #[test]
    fn missing_trace_id_is_an_error() {
        let data = json!({"block_num": "1", "trace": {"status": "hard_fail"}});
        assert!(decode_trace(&serde_json::to_vec(&data).unwrap()).is_err());
    }
}
