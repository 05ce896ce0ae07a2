//! Chain change-data-capture daemon.
//!
//! Accepts one upstream feed of blockchain events, decodes and normalizes
//! them into canonical JSON records, and relays the records through durable
//! on-disk queues to a message bus. The three stages are deliberately
//! decoupled: the session applies backpressure to the upstream, the decode
//! engine contains per-record failures, and the relay survives bus outages
//! without losing accepted records.

pub mod config;
pub mod decode;
pub mod error;
pub mod fallback;
pub mod relay;
pub mod session;
pub mod wire;

pub use config::{BusConfig, FileConfig, IngestConfig};
pub use decode::{AbiStore, Decoder};
pub use error::{Error, Result};
pub use fallback::{BlockIdSource, HttpBlockIdSource, NoFallback};
pub use relay::{BusSink, KafkaSink, QueueSet, Relay};
pub use session::{Feed, Frame, Session, SessionManager, SessionState, TaskSpawner};
