//! Daemon configuration.
//!
//! Tunables that historical deployments disagreed on (backpressure ceiling,
//! acknowledgement margin, memory ceiling) are carried here rather than as
//! hard-coded constants. Broker credentials load from a TOML file.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Session and relay tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum concurrent decode tasks before the read loop pauses.
    pub max_in_flight: usize,

    /// Safety margin subtracted from the acknowledgement watermark.
    pub ack_margin: u32,

    /// Acknowledgement tick, milliseconds.
    pub ack_interval_ms: u64,

    /// Supervision tick, seconds.
    pub supervise_interval_secs: u64,

    /// Fatal stall threshold: no frames and nothing in flight, seconds.
    pub idle_timeout_secs: u64,

    /// Resident memory ceiling before graceful self-eviction, bytes.
    pub memory_ceiling_bytes: u64,

    /// Concurrent publishers per durable queue.
    pub publisher_pool: usize,

    /// Default requested batch size for a fresh session.
    pub fetch: u32,

    /// Cool-off before process exit after a fatal error, seconds. Gives
    /// upstream rate limiting a chance to reset before the supervisor
    /// restarts us.
    pub exit_delay_secs: u64,

    /// Timeout for the block-id fallback lookup, seconds.
    pub fallback_timeout_secs: u64,

    /// Bounded wait for in-flight decodes at shutdown, seconds.
    pub drain_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16384,
            ack_margin: 100,
            ack_interval_ms: 500,
            supervise_interval_secs: 30,
            idle_timeout_secs: 60,
            memory_ceiling_bytes: 512 * 1024 * 1024,
            publisher_pool: 4,
            fetch: 100,
            exit_delay_secs: 30,
            fallback_timeout_secs: 10,
            drain_timeout_secs: 30,
        }
    }
}

impl IngestConfig {
    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn exit_delay(&self) -> Duration {
        Duration::from_secs(self.exit_delay_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Downstream message-bus connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Comma-separated bootstrap broker list.
    pub brokers: String,

    /// `PLAINTEXT`, `SSL`, `SASL_PLAINTEXT`, or `SASL_SSL`.
    pub security_protocol: Option<String>,

    /// SASL mechanism, e.g. `PLAIN`.
    pub sasl_mechanism: Option<String>,

    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,

    /// Prepended to the per-kind topic names when set.
    pub topic_prefix: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            topic_prefix: None,
        }
    }
}

impl BusConfig {
    /// Full topic name for a kind, with the optional prefix applied.
    pub fn topic(&self, kind: chainrelay_core::RecordKind) -> String {
        match &self.topic_prefix {
            Some(prefix) => format!("{}{}", prefix, kind.topic()),
            None => kind.topic().to_string(),
        }
    }
}

/// Top-level TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub ingest: IngestConfig,
    pub bus: BusConfig,
}

impl FileConfig {
    /// Load from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainrelay_core::RecordKind;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = IngestConfig::default();
        assert_eq!(cfg.max_in_flight, 16384);
        assert_eq!(cfg.ack_margin, 100);
        assert_eq!(cfg.fetch, 100);
        assert_eq!(cfg.ack_interval(), Duration::from_millis(500));
    }

    #[test]
    fn topic_prefix_applies() {
        let mut bus = BusConfig::default();
        assert_eq!(bus.topic(RecordKind::Block), "block");
        bus.topic_prefix = Some("fio.".to_string());
        assert_eq!(bus.topic(RecordKind::Tx), "fio.tx");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[ingest]\nmax_in_flight = 256\n\n[bus]\nbrokers = \"kafka:9092\""
        )
        .unwrap();
        let cfg = FileConfig::load(f.path()).unwrap();
        assert_eq!(cfg.ingest.max_in_flight, 256);
        assert_eq!(cfg.ingest.ack_margin, 100);
        assert_eq!(cfg.bus.brokers, "kafka:9092");
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "not valid toml [").unwrap();
        assert!(matches!(
            FileConfig::load(f.path()),
            Err(Error::Config(_))
        ));
    }
}
