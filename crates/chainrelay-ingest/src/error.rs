//! Error types for the ingestion daemon.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the shared core crate.
    #[error(transparent)]
    Core(#[from] chainrelay_core::Error),

    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kafka producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// HTTP client error (block-id fallback lookup).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The single session slot is already occupied.
    #[error("a feed session is already active")]
    SlotOccupied,

    /// No frame received for longer than the idle timeout with nothing in flight.
    #[error("no data received for {0:?} with no work in flight")]
    IdleTimeout(std::time::Duration),

    /// Resident memory exceeded the configured ceiling.
    #[error("resident memory {rss_bytes} exceeds ceiling {ceiling_bytes}, restarting")]
    MemoryCeiling { rss_bytes: u64, ceiling_bytes: u64 },

    /// Feed connection read/write failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The durable queue backing the relay cannot accept writes.
    #[error("durable broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// An interactive range request with `start > end`.
    #[error("invalid block range: {start} > {end}")]
    InvalidRange { start: u32, end: u32 },

    /// Range requests require interactive mode.
    #[error("must be interactive to request blocks")]
    NotInteractive,

    /// A payload did not match the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Block-id fallback lookup failure.
    #[error("block id lookup failed: {0}")]
    Lookup(String),
}
