//! Pluggable block-id fallback lookup.
//!
//! When local header re-serialization cannot derive a block id, the decoder
//! asks an external source by block number. The source is behind a trait so
//! tests can run without a node; the production impl queries the chain API
//! over HTTP with a hard timeout and no retries.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// External block-id source, keyed by block height.
#[async_trait]
pub trait BlockIdSource: Send + Sync {
    async fn block_id(&self, block_num: u32) -> Result<String>;
}

/// HTTP lookup against a chain node's `get_block` endpoint.
pub struct HttpBlockIdSource {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct GetBlockResponse {
    id: String,
}

impl HttpBlockIdSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/v1/chain/get_block", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl BlockIdSource for HttpBlockIdSource {
    async fn block_id(&self, block_num: u32) -> Result<String> {
        let resp: GetBlockResponse = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "block_num_or_id": block_num }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if resp.id.is_empty() {
            return Err(Error::Lookup(format!("empty id for block {block_num}")));
        }
        Ok(resp.id)
    }
}

/// A source that always fails. Used when no fallback endpoint is configured.
pub struct NoFallback;

#[async_trait]
impl BlockIdSource for NoFallback {
    async fn block_id(&self, block_num: u32) -> Result<String> {
        Err(Error::Lookup(format!(
            "no fallback source configured for block {block_num}"
        )))
    }
}
