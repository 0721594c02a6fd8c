use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    errors::{BlockchainError, Result},
    gate::ChainGate,
    repositories::{
        block::{block_rows, get_block_header, write_block},
        chain_cursor::next_to_ingest,
        shard_pointer::PointerMarker,
    },
    rpc::{EthereumRpcProvider, NodeEndpoint, RpcBlock},
    shard::ShardDirectory,
    store::RetryPolicy,
    types::{BlockHash, BlockNumber, ChainId, LogicalKey, PartitionKind, ShardIdentifier},
};

/// What [`BlockIngestor::ingest_block`] did.
pub struct IngestOutcome<T> {
    /// `None` when the block was not processable yet.
    pub processed_block: Option<BlockNumber>,
    pub next_block_to_process: BlockNumber,
    pub raw_block: Option<RpcBlock>,
    pub nodes_with_block: Vec<NodeEndpoint<T>>,
    pub block_shard: Option<ShardIdentifier>,
    /// Whether header and detail rows were (re)written.
    pub rewritten: bool,
}

impl<T> IngestOutcome<T> {
    const fn not_processable(block_number: BlockNumber) -> Self {
        Self {
            processed_block: None,
            next_block_to_process: block_number,
            raw_block: None,
            nodes_with_block: Vec::new(),
            block_shard: None,
            rewritten: false,
        }
    }
}

impl<T> std::fmt::Debug for IngestOutcome<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestOutcome")
            .field("processed_block", &self.processed_block)
            .field("next_block_to_process", &self.next_block_to_process)
            .field("block_shard", &self.block_shard)
            .field("rewritten", &self.rewritten)
            .field("nodes_with_block", &self.nodes_with_block)
            .finish_non_exhaustive()
    }
}

pub struct BlockIngestor<T> {
    chain_id: ChainId,
    start_block: BlockNumber,
    gate: Arc<ChainGate<T>>,
    directory: Arc<ShardDirectory>,
    policy: RetryPolicy,
}

impl<T> BlockIngestor<T>
where
    T: EthereumRpcProvider + 'static,
{
    pub fn new(
        chain_id: ChainId,
        start_block: BlockNumber,
        gate: Arc<ChainGate<T>>,
        directory: Arc<ShardDirectory>,
    ) -> Self {
        Self {
            chain_id,
            start_block,
            gate,
            directory,
            policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    #[must_use]
    pub const fn start_block(&self) -> BlockNumber {
        self.start_block
    }

    #[must_use]
    pub fn gate(&self) -> &ChainGate<T> {
        &self.gate
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<ShardDirectory> {
        &self.directory
    }

    /// Next block the ingestion loop would pick up.
    pub async fn next_to_ingest(&self) -> Result<BlockNumber> {
        next_to_ingest(self.directory.store().as_ref(), self.chain_id, self.start_block).await
    }

    /// Where a freshly started ingestion loop picks up: `nextToIngest`, or the block
    /// before it when that block's pointer was claimed but its header never written.
    pub async fn resume_point(&self) -> Result<BlockNumber> {
        let next = self.next_to_ingest().await?;
        if next <= self.start_block {
            return Ok(next);
        }

        let last = next - 1;
        let key = LogicalKey::block(self.chain_id, last);
        let Some(shard) = self
            .directory
            .resolve(PartitionKind::Block, std::slice::from_ref(&key))
            .await?
            .remove(&key)
        else {
            return Ok(next);
        };
        let header =
            get_block_header(self.directory.store().as_ref(), &shard, self.chain_id, last).await?;
        if header.is_none() {
            warn!("[ingest] Block {} has a pointer but no header, resuming there", last);
            return Ok(last);
        }
        Ok(next)
    }

    /// Ingests `block_number`, or the chain cursor's `nextToIngest` when `None`.
    ///
    /// A block that is not processable yet is not an error; the outcome then carries
    /// no processed block and points back at the same number.
    pub async fn ingest_block(
        &self,
        block_number: Option<BlockNumber>,
        force_rewrite: bool,
    ) -> Result<IngestOutcome<T>> {
        let block_number = match block_number {
            Some(number) => number,
            None => self.next_to_ingest().await?,
        };

        let processability = self.gate.check(block_number).await?;
        if !processability.processable {
            debug!(
                "[ingest] Block {} not processable yet (head {})",
                block_number, processability.max_head
            );
            return Ok(IngestOutcome::not_processable(block_number));
        }
        let block = processability.block.ok_or_else(|| {
            BlockchainError::block_not_found(format!("{block_number} (no body returned)"))
        })?;

        self.persist_block(block, processability.nodes_with_block, force_rewrite)
            .await
    }

    /// Claims the block pointer for `block` and writes its header rows when the block
    /// is new, forked, or `force_rewrite` is set.
    pub async fn persist_block(
        &self,
        block: RpcBlock,
        nodes_with_block: Vec<NodeEndpoint<T>>,
        force_rewrite: bool,
    ) -> Result<IngestOutcome<T>> {
        let block_number = block.block_number()?;
        let block_hash = BlockHash::new(block.hash.clone())?;
        let key = LogicalKey::block(self.chain_id, block_number);
        let ordinal = usize::try_from(block_number.value()).unwrap_or_default();

        let assignment = self
            .directory
            .assign(
                key,
                PointerMarker::BlockHash(block_hash.clone()),
                ordinal,
            )
            .await?;
        let shard = assignment.shard().clone();

        let update_required = if assignment.created || force_rewrite {
            true
        } else {
            let stored = get_block_header(
                self.directory.store().as_ref(),
                &shard,
                self.chain_id,
                block_number,
            )
            .await?;
            match stored {
                Some(header) if header.block_hash == block_hash.value() => false,
                Some(header) => {
                    warn!(
                        "[ingest] Fork at block {}: stored hash {} differs from {}",
                        block_number, header.block_hash, block_hash
                    );
                    true
                }
                None => true,
            }
        };

        if update_required {
            let (header, detail) = block_rows(self.chain_id, &block)?;
            write_block(
                self.directory.store().as_ref(),
                &shard,
                &header,
                &detail,
                self.policy,
            )
            .await?;

            let mut pointer = assignment.pointer;
            if pointer.block_hash() != Some(&block_hash)
                || pointer.transaction_count != header.transaction_count
            {
                pointer.marker = PointerMarker::BlockHash(block_hash);
                pointer.transaction_count = header.transaction_count;
                pointer.updated_at = chrono::Utc::now();
                self.directory.update_pointer(&pointer).await?;
            }

            info!(
                "[ingest] Block {} written to shard {} ({} transactions)",
                block_number, shard, header.transaction_count
            );
        }

        Ok(IngestOutcome {
            processed_block: Some(block_number),
            next_block_to_process: block_number + 1,
            raw_block: Some(block),
            nodes_with_block,
            block_shard: Some(shard),
            rewritten: update_required,
        })
    }
}
