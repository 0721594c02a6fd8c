//! # Ethereum JSON-RPC access
//!
//! [`EthereumRpcProvider`] is the seam between the ingestion core and a node. The
//! production implementation, [`EthereumJsonRpcClient`], talks JSON-RPC 2.0 over HTTP
//! and retries failed calls with exponential backoff. Receipt and transaction lookups
//! are sent as JSON-RPC batch requests.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::{
    errors::{BlockchainError, Result},
    types::{BlockNumber, TransactionHash},
    utils::convert_hex_string_to_i64,
};

/// Which block to ask a node for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(BlockNumber),
}

impl BlockTag {
    fn to_param(self) -> String {
        match self {
            Self::Latest => "latest".to_string(),
            Self::Number(number) => number.to_hex(),
        }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BlockTransaction {
    Full(Box<RpcTransaction>),
    Hash(String),
}

impl BlockTransaction {
    #[must_use]
    pub fn hash(&self) -> &str {
        match self {
            Self::Full(tx) => &tx.hash,
            Self::Hash(hash) => hash,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
    pub gas_used: String,
    #[serde(default)]
    pub gas_limit: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub total_difficulty: Option<String>,
    #[serde(default)]
    pub miner: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub state_root: Option<String>,
    #[serde(default)]
    pub receipts_root: Option<String>,
    #[serde(default)]
    pub transactions_root: Option<String>,
    #[serde(default)]
    pub sha3_uncles: Option<String>,
    #[serde(default)]
    pub extra_data: Option<String>,
}

impl RpcBlock {
    pub fn block_number(&self) -> Result<BlockNumber> {
        BlockNumber::from_hex(&self.number)
    }

    pub fn timestamp_secs(&self) -> Result<i64> {
        convert_hex_string_to_i64(&self.timestamp)
    }

    /// Transaction hashes in block order, lower-cased.
    #[must_use]
    pub fn transaction_hashes(&self) -> Vec<TransactionHash> {
        self.transactions
            .iter()
            .map(|tx| TransactionHash::from_trusted(tx.hash().to_ascii_lowercase()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: String,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub transaction_index: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: String,
    pub gas: String,
    #[serde(default)]
    pub gas_price: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub log_index: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: String,
    #[serde(default)]
    pub transaction_index: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub gas_used: String,
    #[serde(default)]
    pub cumulative_gas_used: Option<String>,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl RpcReceipt {
    /// Pre-byzantium receipts carry no status field and are treated as successful.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status.as_deref().map_or(true, |status| status == "0x1")
    }
}

#[async_trait]
pub trait EthereumRpcProvider: Send + Sync {
    /// Returns `None` when the node does not know the block yet.
    async fn get_block(&self, tag: BlockTag) -> Result<Option<RpcBlock>>;

    /// Batched `eth_getTransactionByHash`; output is aligned with `hashes`.
    async fn get_transactions(
        &self,
        hashes: &[TransactionHash],
    ) -> Result<Vec<Option<RpcTransaction>>>;

    /// Batched `eth_getTransactionReceipt`; output is aligned with `hashes`.
    async fn get_transaction_receipts(
        &self,
        hashes: &[TransactionHash],
    ) -> Result<Vec<Option<RpcReceipt>>>;
}

/// A configured node together with the provider used to reach it.
pub struct NodeEndpoint<T> {
    pub url: String,
    pub provider: Arc<T>,
}

impl<T> NodeEndpoint<T> {
    pub fn new(url: impl Into<String>, provider: Arc<T>) -> Self {
        Self {
            url: url.into(),
            provider,
        }
    }
}

impl<T> Clone for NodeEndpoint<T> {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<T> fmt::Debug for NodeEndpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEndpoint").field("url", &self.url).finish()
    }
}

#[derive(Deserialize, Debug)]
pub struct RpcResponse<T> {
    #[serde(default)]
    pub id: Option<u64>,
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Deserialize, Debug)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Serialize, Debug)]
struct RpcRequest<'a> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: Value,
}

pub struct EthereumJsonRpcClient {
    client: Client,
    url: String,
    max_retries: u32,
    timeout: Option<Duration>,
    retry_base_delay: Duration,
    next_id: AtomicU64,
}

impl EthereumJsonRpcClient {
    #[must_use]
    pub fn new(url: String, max_retries: u32) -> Self {
        Self {
            client: Client::new(),
            url,
            max_retries,
            timeout: None,
            retry_base_delay: Duration::from_secs(1),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request<'a>(&self, method: &'a str, params: Value) -> RpcRequest<'a> {
        RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        }
    }

    async fn post_text<B: Serialize + Sync>(&self, body: &B) -> Result<String> {
        let mut builder = self.client.post(&self.url).json(body);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            error!("HTTP request error: {:?}", e);
            BlockchainError::from(e)
        })?;

        response.text().await.map_err(|e| {
            error!("Failed to read response body: {:?}", e);
            BlockchainError::from(e)
        })
    }

    async fn make_rpc_call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<R>> {
        let request = self.request(method, params);
        let text = self.post_text(&request).await?;

        let parsed = serde_json::from_str::<RpcResponse<R>>(&text).map_err(|e| {
            error!("Deserialization error: {:?}\nResponse snippet: {:?}", e, text);
            BlockchainError::from(e)
        })?;

        if let Some(err) = parsed.error {
            return Err(BlockchainError::rpc_response(err.code, err.message));
        }
        Ok(parsed.result)
    }

    async fn make_batch_rpc_call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Option<R>>> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<RpcRequest<'_>> = params
            .into_iter()
            .map(|p| self.request(method, p))
            .collect();
        let order: Vec<u64> = requests.iter().map(|r| r.id).collect();

        let text = self.post_text(&requests).await?;
        let responses = serde_json::from_str::<Vec<RpcResponse<R>>>(&text).map_err(|e| {
            error!("Batch deserialization error: {:?}\nResponse snippet: {:?}", e, text);
            BlockchainError::from(e)
        })?;

        let mut by_id: HashMap<u64, RpcResponse<R>> = responses
            .into_iter()
            .filter_map(|r| r.id.map(|id| (id, r)))
            .collect();

        order
            .into_iter()
            .map(|id| match by_id.remove(&id) {
                Some(RpcResponse {
                    error: Some(err), ..
                }) => Err(BlockchainError::rpc_response(err.code, err.message)),
                Some(response) => Ok(response.result),
                None => Err(BlockchainError::rpc_connection(format!(
                    "Missing response for batch request id {id}"
                ))),
            })
            .collect()
    }

    async fn with_retries<F, Fut, R>(&self, what: &str, mut operation: F) -> Result<R>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<R>> + Send,
    {
        let mut attempts = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempts += 1;
                    if attempts > self.max_retries || !e.is_transient() {
                        warn!(
                            "[rpc] {} on {} failed with error: {:?}. Giving up",
                            what, self.url, e
                        );
                        return Err(e);
                    }
                    let backoff = self.retry_base_delay * 2_u32.pow(attempts - 1);
                    warn!(
                        "[rpc] {} on {} failed with error: {:?}. Retrying in {:?} (Attempt {}/{})",
                        what, self.url, e, backoff, attempts, self.max_retries
                    );
                    sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait]
impl EthereumRpcProvider for EthereumJsonRpcClient {
    async fn get_block(&self, tag: BlockTag) -> Result<Option<RpcBlock>> {
        self.with_retries("eth_getBlockByNumber", || {
            self.make_rpc_call::<RpcBlock>(
                "eth_getBlockByNumber",
                serde_json::json!([tag.to_param(), false]),
            )
        })
        .await
    }

    async fn get_transactions(
        &self,
        hashes: &[TransactionHash],
    ) -> Result<Vec<Option<RpcTransaction>>> {
        self.with_retries("eth_getTransactionByHash", || {
            let params = hashes
                .iter()
                .map(|h| serde_json::json!([h.value()]))
                .collect();
            self.make_batch_rpc_call::<RpcTransaction>("eth_getTransactionByHash", params)
        })
        .await
    }

    async fn get_transaction_receipts(
        &self,
        hashes: &[TransactionHash],
    ) -> Result<Vec<Option<RpcReceipt>>> {
        self.with_retries("eth_getTransactionReceipt", || {
            let params = hashes
                .iter()
                .map(|h| serde_json::json!([h.value()]))
                .collect();
            self.make_batch_rpc_call::<RpcReceipt>("eth_getTransactionReceipt", params)
        })
        .await
    }
}

#[cfg(test)]
mod tests;
