//! ABI schema model and schema-driven binary decoding.
//!
//! Contract tables arrive from the feed as hex-encoded binary when the
//! upstream encoder could not apply a schema itself. Given the contract's
//! ABI we decode those rows into structured JSON: primitives, type aliases,
//! struct inheritance (`base`), arrays (`[]`), optionals (`?`), and binary
//! extensions (`$`).

use crate::error::{Error, Result};
use crate::wire::{legacy_key_string, name_to_string};
use chrono::DateTime;
use ripemd::{Digest as RipemdDigest, Ripemd160};
use serde::Deserialize;
use serde_json::{Map, Value};

/// A contract ABI, as published on chain.
#[derive(Debug, Clone, Deserialize)]
pub struct Abi {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub types: Vec<TypeDef>,
    #[serde(default)]
    pub structs: Vec<StructDef>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

/// A type alias: `new_type_name` decodes as `type`.
#[derive(Debug, Clone, Deserialize)]
pub struct TypeDef {
    pub new_type_name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructDef {
    pub name: String,
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl Abi {
    /// Parse an ABI from its JSON representation.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Decode a binary table row into structured JSON using the schema
    /// registered for `table`.
    pub fn decode_table_row(&self, table: &str, data: &[u8]) -> Result<Value> {
        let def = self
            .tables
            .iter()
            .find(|t| t.name == table)
            .ok_or_else(|| Error::Malformed(format!("no table {table} in abi")))?;
        let type_name = def.type_name.clone();
        let mut cur = Cursor { data, pos: 0 };
        self.decode_type(&type_name, &mut cur)
    }

    fn resolve_alias<'a>(&'a self, mut name: &'a str) -> &'a str {
        // alias chains are short in practice; cap them to stay total
        for _ in 0..8 {
            match self.types.iter().find(|t| t.new_type_name == name) {
                Some(t) => name = &t.type_name,
                None => break,
            }
        }
        name
    }

    fn decode_type(&self, type_name: &str, cur: &mut Cursor) -> Result<Value> {
        let type_name = self.resolve_alias(type_name);
        if let Some(inner) = type_name.strip_suffix("[]") {
            let count = cur.varuint32()?;
            let mut out = Vec::with_capacity(count.min(4096) as usize);
            for _ in 0..count {
                out.push(self.decode_type(inner, cur)?);
            }
            return Ok(Value::Array(out));
        }
        if let Some(inner) = type_name.strip_suffix('?') {
            return if cur.u8()? == 0 {
                Ok(Value::Null)
            } else {
                self.decode_type(inner, cur)
            };
        }
        if let Some(inner) = type_name.strip_suffix('$') {
            return self.decode_type(inner, cur);
        }
        if let Some(value) = decode_primitive(type_name, cur)? {
            return Ok(value);
        }
        let def = self
            .structs
            .iter()
            .find(|s| s.name == type_name)
            .ok_or_else(|| Error::Malformed(format!("unknown abi type {type_name}")))?;
        let mut obj = Map::new();
        self.decode_struct(def, cur, &mut obj)?;
        Ok(Value::Object(obj))
    }

    fn decode_struct(
        &self,
        def: &StructDef,
        cur: &mut Cursor,
        obj: &mut Map<String, Value>,
    ) -> Result<()> {
        if !def.base.is_empty() {
            let base = self
                .structs
                .iter()
                .find(|s| s.name == def.base)
                .ok_or_else(|| Error::Malformed(format!("missing base struct {}", def.base)))?;
            self.decode_struct(base, cur, obj)?;
        }
        for field in &def.fields {
            // binary extension: absent bytes mean the field (and everything
            // after it) was appended to the schema later
            if field.type_name.ends_with('$') && cur.is_empty() {
                break;
            }
            let value = self.decode_type(&field.type_name, cur)?;
            obj.insert(field.name.clone(), value);
        }
        Ok(())
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Malformed(format!(
                "table row truncated at byte {}",
                self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn varuint32(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        let mut shift = 0;
        loop {
            let b = self.u8()?;
            value |= ((b & 0x7f) as u32) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 35 {
                return Err(Error::Malformed("varuint32 overflow".to_string()));
            }
        }
    }
}

fn decode_primitive(type_name: &str, cur: &mut Cursor) -> Result<Option<Value>> {
    let value = match type_name {
        "bool" => Value::from(cur.u8()? != 0),
        "int8" => Value::from(cur.u8()? as i8),
        "uint8" => Value::from(cur.u8()?),
        "int16" => Value::from(cur.u16()? as i16),
        "uint16" => Value::from(cur.u16()?),
        "int32" => Value::from(cur.u32()? as i32),
        "uint32" => Value::from(cur.u32()?),
        "int64" => Value::from(cur.u64()? as i64),
        "uint64" => Value::from(cur.u64()?),
        "int128" | "uint128" | "float128" => Value::from(format!("0x{}", hex::encode(cur.take(16)?))),
        "varuint32" => Value::from(cur.varuint32()?),
        "varint32" => {
            let v = cur.varuint32()?;
            Value::from((v >> 1) as i32 ^ -((v & 1) as i32))
        }
        "float32" => {
            let b = cur.take(4)?;
            Value::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
        }
        "float64" => {
            let b = cur.take(8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            Value::from(f64::from_le_bytes(arr))
        }
        "time_point" => {
            let micros = cur.u64()? as i64;
            let dt = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| Error::Malformed("time_point out of range".to_string()))?;
            Value::from(dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
        }
        "time_point_sec" => {
            let secs = cur.u32()? as i64;
            let dt = DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| Error::Malformed("time_point_sec out of range".to_string()))?;
            Value::from(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        }
        "block_timestamp_type" => {
            let slot = cur.u32()? as i64;
            let millis = 946_684_800_000 + slot * 500;
            let dt = DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| Error::Malformed("block timestamp out of range".to_string()))?;
            Value::from(dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
        }
        "name" | "account_name" => Value::from(name_to_string(cur.u64()?)),
        "bytes" => {
            let len = cur.varuint32()? as usize;
            Value::from(hex::encode(cur.take(len)?))
        }
        "string" => {
            let len = cur.varuint32()? as usize;
            Value::from(String::from_utf8_lossy(cur.take(len)?).into_owned())
        }
        "checksum160" => Value::from(hex::encode(cur.take(20)?)),
        "checksum256" => Value::from(hex::encode(cur.take(32)?)),
        "checksum512" => Value::from(hex::encode(cur.take(64)?)),
        "public_key" => {
            // 1-byte curve discriminant then the compressed point; rendered
            // in the legacy chain-prefixed form
            let _curve = cur.u8()?;
            let raw: [u8; 33] = cur
                .take(33)?
                .try_into()
                .map_err(|_| Error::Malformed("bad public key".to_string()))?;
            Value::from(legacy_key_string(&raw))
        }
        "signature" => {
            let _curve = cur.u8()?;
            let sig = cur.take(65)?;
            let mut hasher = Ripemd160::new();
            hasher.update(sig);
            hasher.update(b"K1");
            let sum = hasher.finalize();
            let mut out = sig.to_vec();
            out.extend_from_slice(&sum[..4]);
            Value::from(format!("SIG_K1_{}", bs58::encode(out).into_string()))
        }
        "symbol" => {
            let raw = cur.u64()?;
            Value::from(format!("{},{}", raw & 0xff, symbol_code(raw >> 8)))
        }
        "symbol_code" => Value::from(symbol_code(cur.u64()?)),
        "asset" => {
            let amount = cur.u64()? as i64;
            let raw = cur.u64()?;
            let precision = (raw & 0xff) as u32;
            if precision > 18 {
                return Err(Error::Malformed(format!(
                    "asset precision {precision} out of range"
                )));
            }
            let code = symbol_code(raw >> 8);
            // sign carried separately so -0.5 does not collapse to 0.5
            let sign = if amount < 0 { "-" } else { "" };
            let magnitude = amount.unsigned_abs();
            if precision == 0 {
                Value::from(format!("{sign}{magnitude} {code}"))
            } else {
                let scale = 10u64.pow(precision);
                Value::from(format!(
                    "{sign}{}.{:0width$} {code}",
                    magnitude / scale,
                    magnitude % scale,
                    width = precision as usize
                ))
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn symbol_code(mut raw: u64) -> String {
    let mut out = String::new();
    while raw > 0 {
        let c = (raw & 0xff) as u8;
        if c == 0 {
            break;
        }
        out.push(c as char);
        raw >>= 8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{put_varuint32, string_to_name};
    use serde_json::json;

    fn test_abi() -> Abi {
        Abi::from_json(
            br#"{
                "version": "eosio::abi/1.1",
                "types": [{"new_type_name": "fee_amount", "type": "uint64"}],
                "structs": [
                    {
                        "name": "row_base",
                        "base": "",
                        "fields": [{"name": "owner", "type": "name"}]
                    },
                    {
                        "name": "fee_row",
                        "base": "row_base",
                        "fields": [
                            {"name": "fee", "type": "fee_amount"},
                            {"name": "note", "type": "string"},
                            {"name": "flags", "type": "uint8[]"},
                            {"name": "alt", "type": "name?"},
                            {"name": "added_later", "type": "uint32$"}
                        ]
                    }
                ],
                "actions": [],
                "tables": [{"name": "fees", "type": "fee_row"}]
            }"#,
        )
        .unwrap()
    }

    fn base_row() -> Vec<u8> {
        let mut row = Vec::new();
        row.extend_from_slice(&string_to_name("alice").unwrap().to_le_bytes());
        row.extend_from_slice(&42u64.to_le_bytes());
        put_varuint32(&mut row, 2);
        row.extend_from_slice(b"hi");
        put_varuint32(&mut row, 3);
        row.extend_from_slice(&[1, 2, 3]);
        row.push(0); // alt: absent
        row
    }

    #[test]
    fn decodes_struct_with_base_alias_array_optional() {
        let mut row = base_row();
        row.extend_from_slice(&7u32.to_le_bytes());
        let out = test_abi().decode_table_row("fees", &row).unwrap();
        assert_eq!(
            out,
            json!({
                "owner": "alice",
                "fee": 42,
                "note": "hi",
                "flags": [1, 2, 3],
                "alt": null,
                "added_later": 7
            })
        );
    }

    #[test]
    fn binary_extension_may_be_absent() {
        let out = test_abi().decode_table_row("fees", &base_row()).unwrap();
        assert_eq!(out["owner"], json!("alice"));
        assert!(out.get("added_later").is_none());
    }

    #[test]
    fn optional_present() {
        let mut row = base_row();
        // rewrite the absent flag to present + a name
        row.pop();
        row.push(1);
        row.extend_from_slice(&string_to_name("bob").unwrap().to_le_bytes());
        let out = test_abi().decode_table_row("fees", &row).unwrap();
        assert_eq!(out["alt"], json!("bob"));
    }

    #[test]
    fn truncated_row_errors() {
        let row = [1u8, 2, 3];
        assert!(test_abi().decode_table_row("fees", &row).is_err());
    }

    #[test]
    fn unknown_table_errors() {
        assert!(test_abi().decode_table_row("nope", &[]).is_err());
    }

    #[test]
    fn asset_formatting() {
        let mut data = Vec::new();
        data.extend_from_slice(&1_234_567_890u64.to_le_bytes());
        let sym: u64 =
            9 | (u64::from(b'F') << 8) | (u64::from(b'I') << 16) | (u64::from(b'O') << 24);
        data.extend_from_slice(&sym.to_le_bytes());
        let mut cur = Cursor { data: &data, pos: 0 };
        let out = decode_primitive("asset", &mut cur).unwrap().unwrap();
        assert_eq!(out, json!("1.234567890 FIO"));
    }

    #[test]
    fn negative_asset_keeps_its_sign() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-5i64 as u64).to_le_bytes());
        let sym: u64 =
            1 | (u64::from(b'F') << 8) | (u64::from(b'I') << 16) | (u64::from(b'O') << 24);
        data.extend_from_slice(&sym.to_le_bytes());
        let mut cur = Cursor { data: &data, pos: 0 };
        let out = decode_primitive("asset", &mut cur).unwrap().unwrap();
        assert_eq!(out, json!("-0.5 FIO"));
    }

    #[test]
    fn zero_precision_asset_has_no_decimal_point() {
        let mut data = Vec::new();
        data.extend_from_slice(&42u64.to_le_bytes());
        let sym: u64 = u64::from(b'V') << 8 | u64::from(b'T') << 16;
        data.extend_from_slice(&sym.to_le_bytes());
        let mut cur = Cursor { data: &data, pos: 0 };
        let out = decode_primitive("asset", &mut cur).unwrap().unwrap();
        assert_eq!(out, json!("42 VT"));
    }

    #[test]
    fn seed_schemas_parse() {
        for (account, raw) in crate::decode::abi::SEED_ABIS {
            assert!(
                Abi::from_json(raw.as_bytes()).is_ok(),
                "seed abi for {account} failed to parse"
            );
        }
    }
}
