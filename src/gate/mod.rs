//! # Chain Processability Gate
//!
//! Decides whether a block is deep enough in the chain to ingest. Every configured
//! endpoint is polled for its head; the highest head wins. A block is processable
//! when it is at or below that head and either `block_delay` confirmations deep or
//! the chain has produced nothing for `force_processing_delay`.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    errors::{BlockchainError, Result},
    rpc::{BlockTag, EthereumRpcProvider, NodeEndpoint, RpcBlock},
    types::BlockNumber,
};

pub const DEFAULT_FORCE_PROCESSING_DELAY: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Confirmation depth. Never negative.
    pub block_delay: i64,
    pub force_processing_delay: Duration,
}

impl GateConfig {
    #[must_use]
    pub const fn new(block_delay: i64, force_processing_delay: Duration) -> Self {
        Self {
            block_delay: clamp_delay(block_delay),
            force_processing_delay,
        }
    }

    #[must_use]
    pub const fn block_delay(mut self, block_delay: i64) -> Self {
        self.block_delay = clamp_delay(block_delay);
        self
    }

    #[must_use]
    pub const fn force_processing_delay(mut self, delay: Duration) -> Self {
        self.force_processing_delay = delay;
        self
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::new(0, DEFAULT_FORCE_PROCESSING_DELAY)
    }
}

const fn clamp_delay(block_delay: i64) -> i64 {
    if block_delay < 0 {
        0
    } else {
        block_delay
    }
}

/// The processable predicate, free of I/O.
#[must_use]
pub fn is_block_processable(
    target: BlockNumber,
    max_head: BlockNumber,
    head_timestamp: i64,
    now: i64,
    block_delay: i64,
    force_processing_delay: Duration,
) -> bool {
    let force_secs = i64::try_from(force_processing_delay.as_secs()).unwrap_or(i64::MAX);
    let chain_stalled = now.saturating_sub(head_timestamp) > force_secs;
    let sufficiently_ahead =
        max_head.value().saturating_sub(target.value()) >= clamp_delay(block_delay);
    target <= max_head && (sufficiently_ahead || chain_stalled)
}

/// Outcome of one gate pass.
pub struct Processability<T> {
    pub processable: bool,
    pub max_head: BlockNumber,
    /// Body of the target block, present when processable.
    pub block: Option<RpcBlock>,
    /// Endpoints whose head is at or beyond the target, in configuration order.
    pub nodes_with_block: Vec<NodeEndpoint<T>>,
}

impl<T> std::fmt::Debug for Processability<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processability")
            .field("processable", &self.processable)
            .field("max_head", &self.max_head)
            .field("block", &self.block.as_ref().map(|b| &b.number))
            .field("nodes_with_block", &self.nodes_with_block)
            .finish()
    }
}

struct HeadObservation {
    number: BlockNumber,
    timestamp: i64,
}

pub struct ChainGate<T> {
    endpoints: Vec<NodeEndpoint<T>>,
    config: GateConfig,
}

impl<T> ChainGate<T>
where
    T: EthereumRpcProvider + 'static,
{
    pub fn new(endpoints: Vec<NodeEndpoint<T>>, config: GateConfig) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(BlockchainError::configuration(
                "node_endpoints",
                "At least one node endpoint is required",
            ));
        }
        Ok(Self { endpoints, config })
    }

    #[must_use]
    pub fn endpoints(&self) -> &[NodeEndpoint<T>] {
        &self.endpoints
    }

    #[must_use]
    pub const fn config(&self) -> GateConfig {
        self.config
    }

    /// Uses the configured block delay.
    pub async fn check(&self, target: BlockNumber) -> Result<Processability<T>> {
        self.is_processable(target, self.config.block_delay).await
    }

    pub async fn is_processable(
        &self,
        target: BlockNumber,
        block_delay: i64,
    ) -> Result<Processability<T>> {
        self.is_processable_at(target, block_delay, Utc::now().timestamp())
            .await
    }

    /// Same as [`Self::is_processable`] with an explicit wall clock, in unix seconds.
    pub async fn is_processable_at(
        &self,
        target: BlockNumber,
        block_delay: i64,
        now: i64,
    ) -> Result<Processability<T>> {
        let heads = self.poll_heads().await;

        let Some(max) = heads
            .iter()
            .filter_map(|(_, head)| head.as_ref())
            .max_by_key(|head| head.number)
        else {
            return Err(BlockchainError::rpc_connection(
                "No node endpoint reported a chain head",
            ));
        };
        let max_head = max.number;

        let processable = is_block_processable(
            target,
            max_head,
            max.timestamp,
            now,
            block_delay,
            self.config.force_processing_delay,
        );

        let nodes_with_block: Vec<NodeEndpoint<T>> = heads
            .iter()
            .filter(|(_, head)| head.as_ref().is_some_and(|h| h.number >= target))
            .map(|&(endpoint, _)| endpoint.clone())
            .collect();

        debug!(
            "[gate] Block {}: max head {}, {} node(s) have it, processable: {}",
            target,
            max_head,
            nodes_with_block.len(),
            processable
        );

        if !processable {
            return Ok(Processability {
                processable,
                max_head,
                block: None,
                nodes_with_block,
            });
        }

        let block = self.fetch_body(target, &nodes_with_block).await?;
        Ok(Processability {
            processable,
            max_head,
            block: Some(block),
            nodes_with_block,
        })
    }

    async fn poll_heads(&self) -> Vec<(&NodeEndpoint<T>, Option<HeadObservation>)> {
        let polls = self.endpoints.iter().map(|endpoint| async move {
            let observation = match endpoint.provider.get_block(BlockTag::Latest).await {
                Ok(Some(block)) => match (block.block_number(), block.timestamp_secs()) {
                    (Ok(number), Ok(timestamp)) => Some(HeadObservation { number, timestamp }),
                    _ => {
                        warn!("[gate] Malformed head from {}", endpoint.url);
                        None
                    }
                },
                Ok(None) => {
                    warn!("[gate] {} returned no latest block", endpoint.url);
                    None
                }
                Err(e) => {
                    warn!("[gate] Failed to fetch head from {}: {}", endpoint.url, e);
                    None
                }
            };
            (endpoint, observation)
        });
        join_all(polls).await
    }

    async fn fetch_body(
        &self,
        target: BlockNumber,
        nodes_with_block: &[NodeEndpoint<T>],
    ) -> Result<RpcBlock> {
        for endpoint in nodes_with_block {
            match endpoint.provider.get_block(BlockTag::Number(target)).await {
                Ok(Some(block)) => return Ok(block),
                Ok(None) => warn!("[gate] {} does not have block {} yet", endpoint.url, target),
                Err(e) => warn!(
                    "[gate] Failed to fetch block {} from {}: {}",
                    target, endpoint.url, e
                ),
            }
        }
        Err(BlockchainError::block_not_found(format!(
            "{target} (processable, but no endpoint returned its body)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::ScriptedChain;

    const MINUTE: i64 = 60;

    fn gate(chains: &[Arc<ScriptedChain>]) -> ChainGate<ScriptedChain> {
        let endpoints = chains
            .iter()
            .enumerate()
            .map(|(i, chain)| NodeEndpoint::new(format!("ws://node-{i}:8546"), chain.clone()))
            .collect();
        ChainGate::new(endpoints, GateConfig::default()).unwrap()
    }

    #[test]
    fn test_predicate_requires_confirmations() {
        let force = DEFAULT_FORCE_PROCESSING_DELAY;
        let head = BlockNumber::from_trusted(100);
        assert!(is_block_processable(BlockNumber::from_trusted(94), head, 0, 0, 6, force));
        assert!(!is_block_processable(BlockNumber::from_trusted(95), head, 0, 0, 6, force));
        assert!(!is_block_processable(BlockNumber::from_trusted(101), head, 0, 0, 0, force));
    }

    #[test]
    fn test_predicate_forces_stalled_chain() {
        let force = DEFAULT_FORCE_PROCESSING_DELAY;
        let head = BlockNumber::from_trusted(100);
        let stalled_at = 16 * MINUTE;
        assert!(is_block_processable(head, head, 0, stalled_at, 6, force));
        assert!(!is_block_processable(head, head, 0, 14 * MINUTE, 6, force));
        // Stalled or not, the block must exist.
        assert!(!is_block_processable(head + 1, head, 0, stalled_at, 0, force));
    }

    #[test]
    fn test_negative_delay_behaves_like_zero() {
        let force = DEFAULT_FORCE_PROCESSING_DELAY;
        let head = BlockNumber::from_trusted(78);
        for target in [76, 77, 78, 79] {
            let target = BlockNumber::from_trusted(target);
            assert_eq!(
                is_block_processable(target, head, 0, 0, -1, force),
                is_block_processable(target, head, 0, 0, 0, force)
            );
        }
        assert_eq!(GateConfig::new(-5, force).block_delay, 0);
    }

    #[tokio::test]
    async fn test_gate_fetches_body_and_lists_nodes() {
        let ahead = Arc::new(ScriptedChain::with_blocks(1000, 70..=80));
        let behind = Arc::new(ScriptedChain::with_blocks(1000, 70..=75));
        let gate = gate(&[behind, ahead]);

        let result = gate
            .is_processable_at(BlockNumber::from_trusted(78), 2, 1_000)
            .await
            .unwrap();

        assert!(result.processable);
        assert_eq!(result.max_head, BlockNumber::from_trusted(80));
        assert_eq!(result.nodes_with_block.len(), 1);
        assert_eq!(result.nodes_with_block[0].url, "ws://node-1:8546");
        assert_eq!(result.block.unwrap().number, "0x4e");
    }

    #[tokio::test]
    async fn test_gate_not_processable_without_confirmations() {
        let chain = Arc::new(ScriptedChain::with_blocks(1000, 70..=80));
        let gate = gate(&[chain]);
        let now = ScriptedChain::timestamp_of(80);

        let result = gate
            .is_processable_at(BlockNumber::from_trusted(79), 2, now)
            .await
            .unwrap();
        assert!(!result.processable);
        assert!(result.block.is_none());
    }

    #[tokio::test]
    async fn test_gate_falls_back_to_next_endpoint_for_body() {
        let flaky = Arc::new(ScriptedChain::with_blocks(1000, 70..=80));
        flaky.hide_block(78).await;
        let healthy = Arc::new(ScriptedChain::with_blocks(1000, 70..=80));
        let gate = gate(&[flaky, healthy]);

        let result = gate
            .is_processable_at(BlockNumber::from_trusted(78), 0, 0)
            .await
            .unwrap();
        assert_eq!(result.nodes_with_block.len(), 2);
        assert!(result.block.is_some());
    }

    #[tokio::test]
    async fn test_gate_errors_when_no_head_is_known() {
        let down = Arc::new(ScriptedChain::with_blocks(1000, 70..=80));
        down.set_offline(true);
        let gate = gate(&[down]);
        let err = gate
            .is_processable_at(BlockNumber::from_trusted(78), 0, 0)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
