//! The canonical record model shared by the decode engine and the relay.
//!
//! Every inbound frame is a JSON object carrying a `msgtype` tag and an
//! opaque `data` payload. Decoders turn those into [`Record`]s, which the
//! relay partitions by [`RecordKind`] (the bus topic key).

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

/// Declared type of an inbound frame.
///
/// Unrecognized tags map to [`MsgType::Unknown`] and are dropped without
/// error by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Block,
    TableRow,
    TxTrace,
    AbiUpdate,
    Permission,
    PermissionLink,
    AccMetadata,
    BlockCompleted,
    EncoderError,
    ReceiverPause,
    Fork,
    Unknown,
}

impl MsgType {
    /// Parse the wire tag. Unknown tags are not an error.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "BLOCK" => Self::Block,
            "TBL_ROW" => Self::TableRow,
            "TX_TRACE" => Self::TxTrace,
            "ABI_UPD" => Self::AbiUpdate,
            "PERMISSION" => Self::Permission,
            "PERMISSION_LINK" => Self::PermissionLink,
            "ACC_METADATA" => Self::AccMetadata,
            "BLOCK_COMPLETED" => Self::BlockCompleted,
            "ENCODER_ERROR" => Self::EncoderError,
            "RCVR_PAUSE" => Self::ReceiverPause,
            "FORK" => Self::Fork,
            _ => Self::Unknown,
        }
    }

    /// Control messages are acknowledged as received but carry no payload
    /// the pipeline cares about.
    pub fn is_ignored_signal(self) -> bool {
        matches!(
            self,
            Self::EncoderError | Self::ReceiverPause | Self::Fork
        )
    }
}

/// Relay partitioning key: one durable queue and one bus topic per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Block,
    Tx,
    Row,
    Misc,
}

impl RecordKind {
    /// All kinds, in queue declaration order.
    pub const ALL: [RecordKind; 4] = [Self::Block, Self::Tx, Self::Row, Self::Misc];

    /// The bus topic this kind publishes to.
    pub fn topic(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Tx => "tx",
            Self::Row => "row",
            Self::Misc => "misc",
        }
    }

}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.topic())
    }
}

/// Outer wire wrapper around every inbound event.
///
/// The payload is kept as a raw JSON value so dispatch can route on the tag
/// without paying for a full parse of the (often large) body.
#[derive(Debug, Deserialize)]
pub struct Envelope<'a> {
    #[serde(rename = "msgtype")]
    pub msg_type: &'a str,
    #[serde(borrow, default)]
    pub data: Option<&'a RawValue>,
}

impl<'a> Envelope<'a> {
    /// Parse an envelope from a raw binary frame.
    pub fn parse(frame: &'a [u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }

    pub fn kind(&self) -> MsgType {
        MsgType::from_tag(self.msg_type)
    }
}

/// A decoded, relay-ready record.
///
/// `payload` is the fully normalized JSON document the downstream consumers
/// index; `id` is deterministic for identical input bytes so consumers can
/// deduplicate redeliveries.
#[derive(Debug, Clone)]
pub struct Record {
    pub kind: RecordKind,
    pub id: String,
    pub block_num: u32,
    pub payload: Vec<u8>,
}

/// Content hash used as a record identifier: sha-256 over the raw payload,
/// hex encoded.
pub fn content_id(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hex::encode(hasher.finalize())
}
