//! Chain wire encoding primitives.
//!
//! The upstream feed delivers block headers as JSON, but the chain addresses
//! blocks by the hash of the *binary* header encoding. This module carries
//! just enough of that encoding to re-derive block ids locally: base-32
//! account names, the half-second block timestamp slot, varuint lengths, and
//! the legacy public-key checksum format used in producer schedules.

use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::{Digest, Sha256};

/// Milliseconds between the unix epoch and the chain epoch (2000-01-01 UTC).
const CHAIN_EPOCH_MS: i64 = 946_684_800_000;

/// Block interval in milliseconds.
const BLOCK_INTERVAL_MS: i64 = 500;

const NAME_CHARSET: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

fn char_to_symbol(c: u8) -> Option<u64> {
    match c {
        b'a'..=b'z' => Some((c - b'a') as u64 + 6),
        b'1'..=b'5' => Some((c - b'1') as u64 + 1),
        b'.' => Some(0),
        _ => None,
    }
}

/// Encode an account name string into its compact 64-bit form.
pub fn string_to_name(s: &str) -> Result<u64> {
    if s.len() > 13 {
        return Err(Error::Malformed(format!("name too long: {s}")));
    }
    let mut value: u64 = 0;
    for (i, c) in s.bytes().enumerate() {
        let sym =
            char_to_symbol(c).ok_or_else(|| Error::Malformed(format!("bad name char in {s}")))?;
        if i < 12 {
            value |= (sym & 0x1f) << (64 - 5 * (i + 1));
        } else {
            // 13th char only gets the low 4 bits
            value |= sym & 0x0f;
        }
    }
    Ok(value)
}

/// Decode a compact 64-bit name back into its string form.
pub fn name_to_string(value: u64) -> String {
    let mut chars = [b'.'; 13];
    let mut tmp = value;
    for i in 0..13 {
        let mask = if i == 0 { 0x0f } else { 0x1f };
        chars[12 - i] = NAME_CHARSET[(tmp & mask) as usize];
        tmp >>= if i == 0 { 4 } else { 5 };
    }
    let s: String = chars.iter().map(|&c| c as char).collect();
    s.trim_end_matches('.').to_string()
}

/// Convert a feed timestamp string (e.g. `2020-01-01T00:00:01.500`) into the
/// half-second slot count used by the binary header encoding.
pub fn timestamp_slot(ts: &str) -> Result<u32> {
    let dt = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| Error::Malformed(format!("bad timestamp {ts}: {e}")))?;
    let ms = dt.and_utc().timestamp_millis() - CHAIN_EPOCH_MS;
    if ms < 0 {
        return Err(Error::Malformed(format!("timestamp before chain epoch: {ts}")));
    }
    Ok((ms / BLOCK_INTERVAL_MS) as u32)
}

/// Append a varuint32 (LEB128) to `buf`.
pub fn put_varuint32(buf: &mut Vec<u8>, mut v: u32) {
    loop {
        let mut b = (v & 0x7f) as u8;
        v >>= 7;
        if v > 0 {
            b |= 0x80;
        }
        buf.push(b);
        if v == 0 {
            break;
        }
    }
}

/// Decode a hex string into a fixed 32-byte checksum.
pub fn checksum256(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| Error::Malformed(format!("bad checksum hex: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Malformed("checksum is not 32 bytes".to_string()))?;
    Ok(arr)
}

/// Repair a `PUB_K1_`-prefixed public key whose checksum does not match the
/// legacy format, returning the legacy `FIO...` string plus the raw 33-byte
/// compressed key used in binary encoding.
///
/// Some feed revisions emit schedule keys in the new format with a checksum
/// computed over a suffixed payload; downstream consumers and the header
/// encoding both expect the legacy plain-ripemd form.
pub fn repair_k1_key(pk: &str) -> Result<(String, [u8; 33])> {
    let body = pk
        .strip_prefix("PUB_K1_")
        .ok_or_else(|| Error::Malformed(format!("not a K1 key: {pk}")))?;
    let bin = bs58::decode(body)
        .into_vec()
        .map_err(|e| Error::Malformed(format!("bad key base58: {e}")))?;
    if bin.len() < 37 {
        return Err(Error::Malformed("key material too short".to_string()));
    }
    let key = &bin[..bin.len() - 4];
    let raw: [u8; 33] = key
        .try_into()
        .map_err(|_| Error::Malformed("key is not 33 bytes".to_string()))?;

    Ok((legacy_key_string(&raw), raw))
}

/// Render a compressed public key in the legacy chain-prefixed string form
/// (plain ripemd checksum, no curve suffix).
pub fn legacy_key_string(key: &[u8; 33]) -> String {
    let mut hasher = Ripemd160::new();
    hasher.update(key);
    let sum = hasher.finalize();

    let mut out = Vec::with_capacity(37);
    out.extend_from_slice(key);
    out.extend_from_slice(&sum[..4]);
    format!("FIO{}", bs58::encode(out).into_string())
}

/// A producer key entry in a schedule update, ready for binary encoding.
#[derive(Debug, Clone)]
pub struct ProducerKey {
    pub account: u64,
    pub key: [u8; 33],
}

/// An optional new producer schedule embedded in a header.
#[derive(Debug, Clone)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerKey>,
}

/// The binary-encodable subset of a signed block header.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub timestamp_slot: u32,
    pub producer: u64,
    pub confirmed: u16,
    pub previous: [u8; 32],
    pub transaction_mroot: [u8; 32],
    pub action_mroot: [u8; 32],
    pub schedule_version: u32,
    pub new_producers: Option<ProducerSchedule>,
}

impl BlockHeader {
    /// Block height, derived from the previous-block id.
    pub fn block_num(&self) -> u32 {
        u32::from_be_bytes([
            self.previous[0],
            self.previous[1],
            self.previous[2],
            self.previous[3],
        ])
        .wrapping_add(1)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&self.timestamp_slot.to_le_bytes());
        buf.extend_from_slice(&self.producer.to_le_bytes());
        buf.extend_from_slice(&self.confirmed.to_le_bytes());
        buf.extend_from_slice(&self.previous);
        buf.extend_from_slice(&self.transaction_mroot);
        buf.extend_from_slice(&self.action_mroot);
        buf.extend_from_slice(&self.schedule_version.to_le_bytes());
        match &self.new_producers {
            Some(sched) => {
                buf.push(1);
                buf.extend_from_slice(&sched.version.to_le_bytes());
                put_varuint32(&mut buf, sched.producers.len() as u32);
                for prod in &sched.producers {
                    buf.extend_from_slice(&prod.account.to_le_bytes());
                    // curve type 0 = K1, then the compressed point
                    buf.push(0);
                    buf.extend_from_slice(&prod.key);
                }
            }
            None => buf.push(0),
        }
        // header extensions: none
        put_varuint32(&mut buf, 0);
        buf
    }

    /// The chain's canonical block id: sha-256 of the binary header with the
    /// high four bytes replaced by the block height.
    pub fn id(&self) -> String {
        let mut hashed: [u8; 32] = Sha256::digest(self.serialize()).into();
        hashed[..4].copy_from_slice(&self.block_num().to_be_bytes());
        hex::encode(hashed)
    }
}
