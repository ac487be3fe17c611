/// RPC Client Module
///
/// This module handles all interactions with the blockchain node via JSON-RPC.
/// `BitcoinRpcClient` speaks to a Bitcoin-Core-style node over HTTP; the
/// `ChainReader` wraps any `ChainSource` with the reads the pipeline needs and
/// optional per-call latency reporting.
pub mod types;

#[cfg(test)]
pub mod mock;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;

use types::{BlockHeader, RpcBlock, RpcRequest, RpcResponse};

/// Node error code for an unknown block hash
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// Node error code for a height beyond the tip
const RPC_INVALID_PARAMETER: i64 = -8;

#[derive(Error, Debug)]
pub enum ChainReadError {
    #[error("RPC transport error calling {method}: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("RPC {method} rejected credentials (HTTP 401)")]
    Unauthorized { method: &'static str },

    #[error("RPC {method} returned error {code}: {message}")]
    Rpc { method: &'static str, code: i64, message: String },

    #[error("RPC {method} returned no result")]
    EmptyResult { method: &'static str },

    #[error("Block {0} not found")]
    BlockNotFound(String),

    #[error("No block at height {0}")]
    HeightNotFound(u64),
}

/// Read capabilities consumed from the node
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_best_block_hash(&self) -> Result<String, ChainReadError>;

    /// Block with full transaction detail
    async fn get_block(&self, hash: &str) -> Result<RpcBlock, ChainReadError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, ChainReadError>;
}

pub struct BitcoinRpcClient {
    client: reqwest::Client,
    endpoint: String,
    user: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl BitcoinRpcClient {
    /// Create a new RPC client for the specified endpoint
    pub fn new(
        endpoint: String,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().context("Failed to build HTTP client")?;

        Ok(Self { client, endpoint, user, password, next_id: AtomicU64::new(1) })
    }

    /// Get the endpoint URL this client is connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<T, ChainReadError> {
        let request =
            RpcRequest { jsonrpc: "1.0", id: self.next_id.fetch_add(1, Ordering::Relaxed), method, params };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_ref());
        }

        let response = builder.send().await.map_err(|source| ChainReadError::Transport { method, source })?;

        // The node answers RPC errors with HTTP 500 and a JSON body, so only
        // authentication failures are detected from the status alone.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChainReadError::Unauthorized { method });
        }

        let body: RpcResponse<T> =
            response.json().await.map_err(|source| ChainReadError::Transport { method, source })?;

        if let Some(error) = body.error {
            return Err(ChainReadError::Rpc { method, code: error.code, message: error.message });
        }

        body.result.ok_or(ChainReadError::EmptyResult { method })
    }
}

#[async_trait]
impl ChainSource for BitcoinRpcClient {
    async fn get_best_block_hash(&self) -> Result<String, ChainReadError> {
        self.call("getbestblockhash", json!([])).await
    }

    async fn get_block(&self, hash: &str) -> Result<RpcBlock, ChainReadError> {
        match self.call("getblock", json!([hash, 2])).await {
            Err(ChainReadError::Rpc { code: RPC_INVALID_ADDRESS_OR_KEY, .. }) => {
                Err(ChainReadError::BlockNotFound(hash.to_string()))
            }
            other => other,
        }
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, ChainReadError> {
        match self.call("getblockhash", json!([height])).await {
            Err(ChainReadError::Rpc { code: RPC_INVALID_PARAMETER, .. }) => Err(ChainReadError::HeightNotFound(height)),
            other => other,
        }
    }
}

/// Pure-read view of the chain used by the pipeline.
///
/// No retries happen here; a failed read propagates to the driver.
pub struct ChainReader<C> {
    source: C,
    perf: bool,
}

impl<C: ChainSource> ChainReader<C> {
    pub fn new(source: C, perf: bool) -> Self {
        Self { source, perf }
    }

    /// Current best-chain block
    pub async fn get_chain_tip(&self) -> Result<BlockHeader, ChainReadError> {
        let hash = self.timed("getbestblockhash", self.source.get_best_block_hash()).await?;
        let block = self.get_block(&hash).await?;

        Ok(block.header())
    }

    /// Fetch a single block by hash with every transaction decoded
    pub async fn get_block(&self, hash: &str) -> Result<RpcBlock, ChainReadError> {
        tracing::debug!("Fetching block {}", hash);
        self.timed("getblock", self.source.get_block(hash)).await
    }

    pub async fn get_block_hash_at_height(&self, height: u64) -> Result<String, ChainReadError> {
        self.timed("getblockhash", self.source.get_block_hash(height)).await
    }

    async fn timed<T>(&self, what: &str, call: impl Future<Output = T>) -> T {
        if !self.perf {
            return call.await;
        }

        let started = Instant::now();
        let result = call.await;
        tracing::info!("[perf] {} took {:.1}ms", what, started.elapsed().as_secs_f64() * 1000.0);
        result
    }
}
