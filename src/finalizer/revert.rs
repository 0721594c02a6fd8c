//! Removal of everything ingestion derived from one block.
//!
//! Deleting an absent row is a no-op, so running the revert twice leaves the same
//! state as running it once. Transaction shard pointers are kept: re-ingestion
//! writes the transaction back into the shard it was first assigned.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::{
    errors::Result,
    ingest::transfers::economy_address_index_keys,
    repositories::{
        block::{delete_block, list_block_transactions},
        transaction::{delete_transaction, get_transactions, list_token_transfers},
    },
    shard::ShardDirectory,
    store::{delete_all, RetryPolicy},
    types::{BlockNumber, ChainId, LogicalKey, PartitionKind, TransactionHash},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertSummary {
    pub block_rows_removed: bool,
    pub transactions_removed: usize,
    pub index_rows_removed: usize,
}

/// Deletes the block's header rows, transaction index, transactions, transfers,
/// economy-address index rows and finally its block pointer.
///
/// `chain_hashes` is the transaction list the chain currently reports for the block;
/// together with the persisted index it bounds which transactions are looked at.
/// A transaction whose row now belongs to another block is left alone.
pub async fn revert_block(
    directory: &ShardDirectory,
    chain_id: ChainId,
    block_number: BlockNumber,
    chain_hashes: &[TransactionHash],
    policy: RetryPolicy,
) -> Result<RevertSummary> {
    let store = directory.store().as_ref();
    let block_key = LogicalKey::block(chain_id, block_number);
    directory.invalidate(std::slice::from_ref(&block_key));

    let block_shard = directory
        .resolve(PartitionKind::Block, std::slice::from_ref(&block_key))
        .await?
        .remove(&block_key);

    let mut seen = HashSet::new();
    let mut hashes = Vec::new();
    if let Some(shard) = &block_shard {
        for row in list_block_transactions(store, shard, chain_id, block_number).await? {
            if seen.insert(row.transaction_hash.clone()) {
                hashes.push(row.transaction_hash);
            }
        }
    }
    for hash in chain_hashes {
        if seen.insert(hash.clone()) {
            hashes.push(hash.clone());
        }
    }

    let transaction_keys: Vec<LogicalKey> = hashes
        .iter()
        .map(|hash| LogicalKey::transaction(chain_id, hash.clone()))
        .collect();
    let transaction_shards = directory
        .resolve(PartitionKind::Transaction, &transaction_keys)
        .await?;
    let locations: Vec<_> = transaction_keys
        .iter()
        .zip(&hashes)
        .filter_map(|(key, hash)| {
            transaction_shards
                .get(key)
                .map(|shard| (shard.clone(), hash.clone()))
        })
        .collect();
    let rows = get_transactions(store, &locations).await?;

    let mut summary = RevertSummary::default();
    for (shard, hash) in &locations {
        if let Some(row) = rows.get(hash) {
            if row.block_number != block_number {
                debug!(
                    "[revert] Keeping {}: it belongs to block {}",
                    hash, row.block_number
                );
                continue;
            }
        }

        let transfers = list_token_transfers(store, shard, hash).await?;
        let index_keys = economy_address_index_keys(directory, &transfers).await?;
        summary.index_rows_removed += index_keys.len();
        delete_all(store, index_keys, policy).await?;

        delete_transaction(store, shard, hash, policy).await?;
        summary.transactions_removed += 1;
    }

    if let Some(shard) = &block_shard {
        delete_block(store, shard, chain_id, block_number, policy).await?;
        summary.block_rows_removed = true;
    }
    directory
        .delete_pointers(std::slice::from_ref(&block_key))
        .await?;

    warn!(
        "[revert] Block {} reverted: {} transactions, {} economy-address rows removed",
        block_number, summary.transactions_removed, summary.index_rows_removed
    );
    Ok(summary)
}
