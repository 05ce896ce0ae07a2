//! Message-bus publishing.
//!
//! The bus producer sits behind [`BusSink`] so the relay can be exercised in
//! tests without a broker. The production sink is a Kafka `FutureProducer`
//! with SASL/TLS settings from the TOML config; the client library handles
//! its own retries, so a surfaced send failure here is relay-fatal.

use crate::config::BusConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::io::Write;
use std::time::Duration;

/// Downstream publish target.
#[async_trait]
pub trait BusSink: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

/// Kafka-backed sink.
pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn connect(bus: &BusConfig) -> Result<Self> {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &bus.brokers)
            .set("message.timeout.ms", "30000")
            .set("client.id", "chainrelay-ingest");
        if let Some(protocol) = &bus.security_protocol {
            cfg.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &bus.sasl_mechanism {
            cfg.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &bus.sasl_username {
            cfg.set("sasl.username", username);
        }
        if let Some(password) = &bus.sasl_password {
            cfg.set("sasl.password", password);
        }
        Ok(Self {
            producer: cfg.create()?,
        })
    }
}

#[async_trait]
impl BusSink for KafkaSink {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, Timeout::After(Duration::from_secs(30)))
            .await
            .map(|_| ())
            .map_err(|(e, _)| Error::Kafka(e))
    }
}

/// Gzip a payload for publishing.
pub fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}
