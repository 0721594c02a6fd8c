//! # Consistency Reconciler
//!
//! Walks the chain behind ingestion, one block at a time. For every block the gate
//! allows, the persisted state is compared with what the chain reports now:
//!
//! 1. the block pointer and header exist and carry the chain's current hash
//! 2. the block's transaction index lists exactly the chain's transactions, in order
//! 3. every transaction row is complete and belongs to this block hash
//!
//! Any mismatch reverts the block (see [`revert`]) and ingests it again with a forced
//! rewrite, followed by a full transaction fan-out. Only then does `nextToFinalize`
//! move past the block.

use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    errors::{BlockchainError, Result},
    ingest::{BlockIngestor, TransactionFanout},
    repositories::{
        block::{get_block_header, list_block_transactions},
        chain_cursor::{advance_finalized, next_to_finalize},
        transaction::get_transactions,
    },
    rpc::{EthereumRpcProvider, RpcBlock},
    shard::ShardDirectory,
    store::RetryPolicy,
    types::{BlockNumber, ChainId, LogicalKey, ParsingStatus, PartitionKind, TransactionHash},
};

pub mod revert;

pub use revert::{revert_block, RevertSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    MissingPointer,
    MissingHeader,
    HashMismatch { stored: String, current: String },
    TransactionCountMismatch { stored: usize, expected: usize },
    TransactionOrderMismatch { position: usize },
    IncompleteTransactions { count: usize },
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPointer => f.write_str("no block pointer"),
            Self::MissingHeader => f.write_str("no block header"),
            Self::HashMismatch { stored, current } => {
                write!(f, "stored hash {stored} differs from chain hash {current}")
            }
            Self::TransactionCountMismatch { stored, expected } => {
                write!(f, "{stored} transactions stored, chain has {expected}")
            }
            Self::TransactionOrderMismatch { position } => {
                write!(f, "transaction at position {position} differs from the chain")
            }
            Self::IncompleteTransactions { count } => {
                write!(f, "{count} transactions not complete")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockCheck {
    Consistent,
    RevertNeeded(RevertReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    /// `None` when nothing was finalized in this pass.
    pub processed_block: Option<BlockNumber>,
    pub block_processable: bool,
    pub processed_transactions: Vec<TransactionHash>,
    pub reverted: bool,
    pub next_to_finalize: BlockNumber,
}

impl FinalizeOutcome {
    const fn idle(next_to_finalize: BlockNumber) -> Self {
        Self {
            processed_block: None,
            block_processable: false,
            processed_transactions: Vec::new(),
            reverted: false,
            next_to_finalize,
        }
    }
}

pub struct Finalizer<T> {
    chain_id: ChainId,
    ingestor: Arc<BlockIngestor<T>>,
    fanout: TransactionFanout,
    policy: RetryPolicy,
}

impl<T> Finalizer<T>
where
    T: EthereumRpcProvider + 'static,
{
    pub fn new(ingestor: Arc<BlockIngestor<T>>, fanout: TransactionFanout) -> Self {
        Self {
            chain_id: ingestor.chain_id(),
            ingestor,
            fanout,
            policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn directory(&self) -> &ShardDirectory {
        self.ingestor.directory()
    }

    pub async fn next_to_finalize(&self) -> Result<BlockNumber> {
        next_to_finalize(
            self.directory().store().as_ref(),
            self.chain_id,
            self.ingestor.start_block(),
        )
        .await
    }

    /// Finalizes the block at the chain cursor's `nextToFinalize`.
    pub async fn finalize(&self, block_delay: i64) -> Result<FinalizeOutcome> {
        let block_number = self.next_to_finalize().await?;
        self.finalize_block(block_number, block_delay).await
    }

    /// Checks `block_number`, repairs it if needed and advances the cursor past it.
    ///
    /// Blocks at or beyond `nextToIngest` are never looked at.
    pub async fn finalize_block(
        &self,
        block_number: BlockNumber,
        block_delay: i64,
    ) -> Result<FinalizeOutcome> {
        let current = self.next_to_finalize().await?;
        let next_to_ingest = self.ingestor.next_to_ingest().await?;
        if block_number >= next_to_ingest {
            debug!(
                "[finalize] Block {} not ingested yet (next to ingest {})",
                block_number, next_to_ingest
            );
            return Ok(FinalizeOutcome::idle(current));
        }

        let processability = self
            .ingestor
            .gate()
            .is_processable(block_number, block_delay)
            .await?;
        if !processability.processable {
            debug!("[finalize] Block {} not processable yet", block_number);
            return Ok(FinalizeOutcome::idle(current));
        }
        let block = processability.block.ok_or_else(|| {
            BlockchainError::block_not_found(format!("{block_number} (no body returned)"))
        })?;

        let (reverted, processed_transactions) = match self.check_block(&block).await? {
            BlockCheck::Consistent => (false, block.transaction_hashes()),
            BlockCheck::RevertNeeded(reason) => {
                warn!(
                    "[finalize] Block {} inconsistent ({}), reverting and reprocessing",
                    block_number, reason
                );
                revert_block(
                    self.directory(),
                    self.chain_id,
                    block_number,
                    &block.transaction_hashes(),
                    self.policy,
                )
                .await?;

                let outcome = self
                    .ingestor
                    .persist_block(block, processability.nodes_with_block, true)
                    .await?;
                let (Some(raw), Some(shard)) = (&outcome.raw_block, &outcome.block_shard) else {
                    return Err(BlockchainError::internal(format!(
                        "Reprocessing block {block_number} produced no block"
                    )));
                };
                let report = self
                    .fanout
                    .process_block(raw, shard, &outcome.nodes_with_block)
                    .await?;
                if !report.is_clean() {
                    return Err(BlockchainError::unprocessed(
                        format!("reprocessing block {block_number}"),
                        report.dirty.len(),
                    ));
                }
                (true, report.processed)
            }
        };

        let next_to_finalize = advance_finalized(
            self.directory().store().as_ref(),
            self.chain_id,
            block_number,
            block_number + 1,
        )
        .await?;

        info!(
            "[finalize] Block {} finalized with {} transactions{}",
            block_number,
            processed_transactions.len(),
            if reverted { " after revert" } else { "" }
        );

        Ok(FinalizeOutcome {
            processed_block: Some(block_number),
            block_processable: true,
            processed_transactions,
            reverted,
            next_to_finalize,
        })
    }

    /// Compares the persisted state of `block` with the block itself.
    pub async fn check_block(&self, block: &RpcBlock) -> Result<BlockCheck> {
        let store = self.directory().store().as_ref();
        let block_number = block.block_number()?;
        let block_hash = block.hash.to_ascii_lowercase();
        let key = LogicalKey::block(self.chain_id, block_number);

        // Another process may have reverted the block since it was cached.
        self.directory().invalidate(std::slice::from_ref(&key));
        let Some(shard) = self
            .directory()
            .resolve(PartitionKind::Block, std::slice::from_ref(&key))
            .await?
            .remove(&key)
        else {
            return Ok(BlockCheck::RevertNeeded(RevertReason::MissingPointer));
        };

        let Some(header) = get_block_header(store, &shard, self.chain_id, block_number).await?
        else {
            return Ok(BlockCheck::RevertNeeded(RevertReason::MissingHeader));
        };
        if header.block_hash != block_hash {
            return Ok(BlockCheck::RevertNeeded(RevertReason::HashMismatch {
                stored: header.block_hash,
                current: block_hash,
            }));
        }

        let expected = block.transaction_hashes();
        let index = list_block_transactions(store, &shard, self.chain_id, block_number).await?;
        if index.len() != expected.len() {
            return Ok(BlockCheck::RevertNeeded(
                RevertReason::TransactionCountMismatch {
                    stored: index.len(),
                    expected: expected.len(),
                },
            ));
        }
        if let Some(position) = index
            .iter()
            .zip(&expected)
            .position(|(row, hash)| row.transaction_hash != *hash)
        {
            return Ok(BlockCheck::RevertNeeded(
                RevertReason::TransactionOrderMismatch { position },
            ));
        }

        let incomplete_index = index
            .iter()
            .filter(|row| row.events_parsing_status != ParsingStatus::Complete)
            .count();
        if incomplete_index > 0 {
            return Ok(BlockCheck::RevertNeeded(
                RevertReason::IncompleteTransactions {
                    count: incomplete_index,
                },
            ));
        }

        let keys: Vec<LogicalKey> = expected
            .iter()
            .map(|hash| LogicalKey::transaction(self.chain_id, hash.clone()))
            .collect();
        let shards = self
            .directory()
            .resolve(PartitionKind::Transaction, &keys)
            .await?;
        let locations: Vec<_> = keys
            .iter()
            .zip(&expected)
            .filter_map(|(key, hash)| shards.get(key).map(|s| (s.clone(), hash.clone())))
            .collect();
        let rows = get_transactions(store, &locations).await?;

        let incomplete = expected
            .iter()
            .filter(|hash| {
                rows.get(*hash).map_or(true, |row| {
                    row.events_parsing_status != ParsingStatus::Complete
                        || row.block_hash != block_hash
                })
            })
            .count();
        if incomplete > 0 {
            return Ok(BlockCheck::RevertNeeded(
                RevertReason::IncompleteTransactions { count: incomplete },
            ));
        }

        Ok(BlockCheck::Consistent)
    }
}
