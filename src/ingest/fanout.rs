//! # Transaction Fan-out
//!
//! Splits the transaction list of an ingested block into contiguous batches and runs
//! every batch on its own task. At most `max_concurrent_batches` tasks exist at once;
//! the next one is spawned when a slot frees up. Batches take endpoints from the nodes
//! known to have the block, round-robin.
//!
//! A batch never fails as a whole because one transaction could not be persisted:
//! such hashes end up in [`FanoutReport::dirty`] and their rows carry
//! [`ParsingStatus::Dirty`], which the finalizer later repairs.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::{stream, StreamExt};
use tokio::task;
use tracing::{debug, info, warn};

use crate::{
    errors::{BlockchainError, Result},
    ingest::transfers::TransferPipeline,
    repositories::{
        block::{block_transaction_key, BlockTransactionRow},
        shard_pointer::PointerMarker,
        transaction::{
            transaction_detail_key, transaction_key, transaction_rows, BlockContext,
            TransactionDetailRow, TransactionRow,
        },
    },
    rpc::{EthereumRpcProvider, NodeEndpoint, RpcBlock, RpcReceipt, RpcTransaction},
    shard::ShardDirectory,
    store::{write_with_retries, ItemKey, Put, RetryPolicy},
    types::{ChainId, LogicalKey, ParsingStatus, ShardIdentifier, TransactionHash},
};

pub const DEFAULT_MIN_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 60;
pub const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub write_policy: RetryPolicy,
}

impl FanoutConfig {
    #[must_use]
    pub const fn builder() -> FanoutConfigBuilder {
        FanoutConfigBuilder::new()
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_concurrent_batches: DEFAULT_MAX_CONCURRENT_BATCHES,
            write_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FanoutConfigBuilder {
    min_batch_size: usize,
    max_batch_size: usize,
    max_concurrent_batches: usize,
    write_attempts: u32,
    write_retry_delay: Duration,
}

impl FanoutConfigBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_concurrent_batches: DEFAULT_MAX_CONCURRENT_BATCHES,
            write_attempts: 3,
            write_retry_delay: Duration::from_millis(100),
        }
    }

    #[must_use]
    pub const fn conservative() -> Self {
        Self::new().max_concurrent_batches(1).write_attempts(5)
    }

    #[must_use]
    pub const fn high_throughput() -> Self {
        Self::new().max_concurrent_batches(4)
    }

    #[must_use]
    pub const fn testing() -> Self {
        Self::new()
            .max_concurrent_batches(1)
            .write_attempts(1)
            .write_retry_delay(Duration::from_millis(1))
    }

    #[must_use]
    pub const fn min_batch_size(mut self, min_batch_size: usize) -> Self {
        self.min_batch_size = min_batch_size;
        self
    }

    #[must_use]
    pub const fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    #[must_use]
    pub const fn max_concurrent_batches(mut self, max_concurrent_batches: usize) -> Self {
        self.max_concurrent_batches = max_concurrent_batches;
        self
    }

    #[must_use]
    pub const fn write_attempts(mut self, write_attempts: u32) -> Self {
        self.write_attempts = write_attempts;
        self
    }

    #[must_use]
    pub const fn write_retry_delay(mut self, delay: Duration) -> Self {
        self.write_retry_delay = delay;
        self
    }

    pub fn build(self) -> Result<FanoutConfig> {
        if self.min_batch_size == 0 {
            return Err(BlockchainError::configuration(
                "min_batch_size",
                "Minimum batch size must be greater than 0",
            ));
        }

        if self.max_batch_size < self.min_batch_size {
            return Err(BlockchainError::configuration(
                "max_batch_size",
                "Maximum batch size must not be below the minimum batch size",
            ));
        }

        if self.max_concurrent_batches == 0 {
            return Err(BlockchainError::configuration(
                "max_concurrent_batches",
                "Max concurrent batches must be greater than 0",
            ));
        }

        if self.write_attempts == 0 {
            return Err(BlockchainError::configuration(
                "write_attempts",
                "Write attempts must be greater than 0",
            ));
        }

        Ok(FanoutConfig {
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            max_concurrent_batches: self.max_concurrent_batches,
            write_policy: RetryPolicy {
                max_attempts: self.write_attempts,
                base_delay: self.write_retry_delay,
            },
        })
    }
}

impl Default for FanoutConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Contiguous position ranges covering `0..total` exactly once.
///
/// The batch size is `total / endpoints` clamped to `[min, max]`.
#[must_use]
pub fn plan_batches(
    total: usize,
    endpoints: usize,
    min_batch_size: usize,
    max_batch_size: usize,
) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let size = (total / endpoints.max(1))
        .clamp(min_batch_size.max(1), max_batch_size.max(min_batch_size.max(1)));

    (0..total)
        .step_by(size)
        .map(|start| start..(start + size).min(total))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Hashes fully persisted, in block order.
    pub processed: Vec<TransactionHash>,
    /// Hashes left with the dirty marker, in block order.
    pub dirty: Vec<TransactionHash>,
}

impl FanoutReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.dirty.is_empty()
    }

    fn extend(&mut self, other: Self) {
        self.processed.extend(other.processed);
        self.dirty.extend(other.dirty);
    }
}

#[derive(Clone)]
pub struct TransactionFanout {
    chain_id: ChainId,
    directory: Arc<ShardDirectory>,
    transfers: Arc<TransferPipeline>,
    config: FanoutConfig,
}

impl TransactionFanout {
    pub fn new(
        chain_id: ChainId,
        directory: Arc<ShardDirectory>,
        transfers: Arc<TransferPipeline>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            chain_id,
            directory,
            transfers,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> FanoutConfig {
        self.config
    }

    /// Persists every transaction of `block`. Returns once all batches finished.
    pub async fn process_block<T>(
        &self,
        block: &RpcBlock,
        block_shard: &ShardIdentifier,
        nodes_with_block: &[NodeEndpoint<T>],
    ) -> Result<FanoutReport>
    where
        T: EthereumRpcProvider + 'static,
    {
        let block_number = block.block_number()?;
        let hashes = block.transaction_hashes();
        if hashes.is_empty() {
            return Ok(FanoutReport::default());
        }
        if nodes_with_block.is_empty() {
            return Err(BlockchainError::rpc_connection(format!(
                "No endpoint has block {block_number} for transaction fan-out"
            )));
        }

        let context = BlockContext {
            chain_id: self.chain_id,
            block_number,
            block_hash: block.hash.to_ascii_lowercase(),
            timestamp: block.timestamp_secs()?,
        };
        let batches = plan_batches(
            hashes.len(),
            nodes_with_block.len(),
            self.config.min_batch_size,
            self.config.max_batch_size,
        );
        debug!(
            "[fanout] Block {}: {} transactions in {} batch(es)",
            block_number,
            hashes.len(),
            batches.len()
        );

        let mut batch_hashes = Vec::with_capacity(batches.len());
        let mut jobs = Vec::with_capacity(batches.len());
        for (batch_index, range) in batches.into_iter().enumerate() {
            let items: Vec<(usize, TransactionHash)> =
                range.map(|position| (position, hashes[position].clone())).collect();
            batch_hashes.push(items.iter().map(|(_, hash)| hash.clone()).collect::<Vec<_>>());

            jobs.push(BatchJob {
                fanout: self.clone(),
                endpoint: nodes_with_block[batch_index % nodes_with_block.len()].clone(),
                context: context.clone(),
                block_shard: block_shard.clone(),
                items,
            });
        }

        // `buffered` keeps batch order, so results line up with `batch_hashes`.
        let results: Vec<_> = stream::iter(jobs)
            .map(|job| task::spawn(job.run()))
            .buffered(self.config.max_concurrent_batches.max(1))
            .collect()
            .await;

        let mut report = FanoutReport::default();
        for (result, hashes) in results.into_iter().zip(batch_hashes) {
            match result {
                Ok(Ok(batch)) => report.extend(batch),
                Ok(Err(e)) => {
                    warn!(
                        "[fanout] Batch of {} transactions in block {} failed: {}",
                        hashes.len(),
                        block_number,
                        e
                    );
                    report.dirty.extend(hashes);
                }
                Err(e) => {
                    warn!(
                        "[fanout] Batch task in block {} did not complete: {}",
                        block_number, e
                    );
                    report.dirty.extend(hashes);
                }
            }
        }

        if report.is_clean() {
            info!(
                "[fanout] Block {}: {} transactions persisted",
                block_number,
                report.processed.len()
            );
        } else {
            warn!(
                "[fanout] Block {}: {} transactions persisted, {} dirty",
                block_number,
                report.processed.len(),
                report.dirty.len()
            );
        }
        Ok(report)
    }
}


/// A fetched transaction with its rows built and its shard assigned.
struct Prepared {
    position: usize,
    shard: ShardIdentifier,
    row: TransactionRow,
    detail: TransactionDetailRow,
    receipt: RpcReceipt,
}

struct BatchJob<T> {
    fanout: TransactionFanout,
    endpoint: NodeEndpoint<T>,
    context: BlockContext,
    block_shard: ShardIdentifier,
    items: Vec<(usize, TransactionHash)>,
}

impl<T> BatchJob<T>
where
    T: EthereumRpcProvider + 'static,
{
    /// receipts, then transaction rows, then transfers, then final status rows.
    async fn run(self) -> Result<FanoutReport> {
        let hashes: Vec<TransactionHash> = self.items.iter().map(|(_, h)| h.clone()).collect();
        let mut dirty: HashSet<TransactionHash> = HashSet::new();

        let fetched = tokio::try_join!(
            self.endpoint.provider.get_transactions(&hashes),
            self.endpoint.provider.get_transaction_receipts(&hashes),
        );
        let (transactions, receipts) = match fetched {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    "[fanout] Failed to fetch {} transactions from {}: {}",
                    hashes.len(),
                    self.endpoint.url,
                    e
                );
                dirty.extend(hashes);
                return self.finish(Vec::new(), dirty).await;
            }
        };

        let prepared = self.prepare(&transactions, &receipts, &mut dirty).await;
        let mut prepared = self.write_pending(prepared, &mut dirty).await?;

        for entry in &mut prepared {
            if dirty.contains(&entry.row.transaction_hash) || !entry.receipt.succeeded() {
                continue;
            }
            match self
                .fanout
                .transfers
                .process(
                    &self.context,
                    &entry.row.transaction_hash,
                    &entry.shard,
                    &entry.receipt.logs,
                    entry.position,
                )
                .await
            {
                Ok(count) => entry.row.transfer_count = i64::try_from(count).unwrap_or(i64::MAX),
                Err(e) => mark_dirty(&mut dirty, &entry.row.transaction_hash, &e.to_string()),
            }
        }

        self.finish(prepared, dirty).await
    }

    async fn prepare(
        &self,
        transactions: &[Option<RpcTransaction>],
        receipts: &[Option<RpcReceipt>],
        dirty: &mut HashSet<TransactionHash>,
    ) -> Vec<Prepared> {
        let mut prepared = Vec::with_capacity(self.items.len());

        for (offset, (position, hash)) in self.items.iter().enumerate() {
            let (Some(transaction), Some(receipt)) = (
                transactions.get(offset).and_then(Option::as_ref),
                receipts.get(offset).and_then(Option::as_ref),
            ) else {
                mark_dirty(dirty, hash, "transaction or receipt not returned");
                continue;
            };

            let assignment = match self
                .fanout
                .directory
                .assign(
                    LogicalKey::transaction(self.context.chain_id, hash.clone()),
                    PointerMarker::CreatedInBlock(self.context.block_number),
                    *position,
                )
                .await
            {
                Ok(assignment) => assignment,
                Err(e) => {
                    mark_dirty(dirty, hash, &e.to_string());
                    continue;
                }
            };

            match transaction_rows(&self.context, *position, transaction, receipt) {
                Ok((row, _)) if row.transaction_hash != *hash => {
                    mark_dirty(dirty, hash, "node returned a different transaction");
                }
                Ok((row, detail)) => prepared.push(Prepared {
                    position: *position,
                    shard: assignment.shard().clone(),
                    row,
                    detail,
                    receipt: receipt.clone(),
                }),
                Err(e) => mark_dirty(dirty, hash, &e.to_string()),
            }
        }

        prepared
    }

    /// Writes transaction and detail rows as pending. Rows the store leaves
    /// unprocessed make their transaction dirty.
    async fn write_pending(
        &self,
        prepared: Vec<Prepared>,
        dirty: &mut HashSet<TransactionHash>,
    ) -> Result<Vec<Prepared>> {
        let mut owners: HashMap<ItemKey, TransactionHash> = HashMap::new();
        let mut puts = Vec::with_capacity(prepared.len() * 2);

        for entry in &prepared {
            let hash = &entry.row.transaction_hash;
            let row_key = transaction_key(&entry.shard, hash);
            let detail_key = transaction_detail_key(&entry.shard, hash);
            owners.insert(row_key.clone(), hash.clone());
            owners.insert(detail_key.clone(), hash.clone());
            puts.push(Put::from_row(row_key, &entry.row)?);
            puts.push(Put::from_row(detail_key, &entry.detail)?);
        }

        self.write_owned(puts, &owners, dirty).await?;
        Ok(prepared)
    }

    /// Records the final status of every transaction of the batch, on the
    /// transaction row and on the block's transaction index.
    async fn finish(
        &self,
        prepared: Vec<Prepared>,
        mut dirty: HashSet<TransactionHash>,
    ) -> Result<FanoutReport> {
        let now = Utc::now();
        let status_of = |hash: &TransactionHash, dirty: &HashSet<TransactionHash>| {
            if dirty.contains(hash) {
                ParsingStatus::Dirty
            } else {
                ParsingStatus::Complete
            }
        };

        let mut owners: HashMap<ItemKey, TransactionHash> = HashMap::new();
        let mut puts = Vec::with_capacity(prepared.len() + self.items.len());

        for mut entry in prepared {
            entry.row.events_parsing_status = status_of(&entry.row.transaction_hash, &dirty);
            entry.row.updated_at = now;
            let key = transaction_key(&entry.shard, &entry.row.transaction_hash);
            owners.insert(key.clone(), entry.row.transaction_hash.clone());
            puts.push(Put::from_row(key, &entry.row)?);
        }

        for (position, hash) in &self.items {
            let transaction_index = i64::try_from(*position).unwrap_or(i64::MAX);
            let key = block_transaction_key(
                &self.block_shard,
                self.context.chain_id,
                self.context.block_number,
                transaction_index,
            );
            let row = BlockTransactionRow {
                transaction_hash: hash.clone(),
                transaction_index,
                timestamp: self.context.timestamp,
                events_parsing_status: status_of(hash, &dirty),
                updated_at: now,
            };
            owners.insert(key.clone(), hash.clone());
            puts.push(Put::from_row(key, &row)?);
        }

        self.write_owned(puts, &owners, &mut dirty).await?;

        let (dirty_hashes, processed): (Vec<_>, Vec<_>) = self
            .items
            .iter()
            .map(|(_, hash)| hash.clone())
            .partition(|hash| dirty.contains(hash));
        Ok(FanoutReport {
            processed,
            dirty: dirty_hashes,
        })
    }

    async fn write_owned(
        &self,
        puts: Vec<Put>,
        owners: &HashMap<ItemKey, TransactionHash>,
        dirty: &mut HashSet<TransactionHash>,
    ) -> Result<()> {
        let left = write_with_retries(
            self.fanout.directory.store().as_ref(),
            puts,
            self.fanout.config.write_policy,
        )
        .await?;
        for put in left {
            if let Some(hash) = owners.get(&put.key) {
                if !dirty.contains(hash) {
                    mark_dirty(dirty, hash, "store left the row unprocessed");
                }
            }
        }
        Ok(())
    }
}

fn mark_dirty(dirty: &mut HashSet<TransactionHash>, hash: &TransactionHash, reason: &str) {
    warn!("[fanout] Transaction {} marked dirty: {}", hash, reason);
    dirty.insert(hash.clone());
}
