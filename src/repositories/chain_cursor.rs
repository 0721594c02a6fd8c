//! Per-chain progress pointers.
//!
//! `nextToIngest` is derived from the highest block pointer on record so it can
//! never disagree with what ingestion actually claimed. `nextToFinalize` is stored
//! explicitly and only moves forward through an optimistic conditional write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    errors::{BlockchainError, Result},
    repositories::shard_pointer::highest_block_pointer,
    store::{
        from_item, get_all, Condition, ItemKey, PartitionedStore, Put, PutOutcome, RetryPolicy,
    },
    types::{BlockNumber, ChainId, LogicalKey},
};

pub const CHAIN_CURSORS_TABLE: &str = "chain_cursors";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursorRow {
    pub chain_id: ChainId,
    pub next_to_finalize: BlockNumber,
    pub updated_at: DateTime<Utc>,
}

fn cursor_key(chain_id: ChainId) -> ItemKey {
    ItemKey::single(CHAIN_CURSORS_TABLE, chain_id.to_string())
}

pub async fn get_cursor(
    store: &dyn PartitionedStore,
    chain_id: ChainId,
) -> Result<Option<ChainCursorRow>> {
    let key = cursor_key(chain_id);
    get_all(store, std::slice::from_ref(&key), RetryPolicy::default())
        .await?
        .remove(&key)
        .map(from_item)
        .transpose()
}

/// One past the highest block pointer, but never below `start_block`.
pub async fn next_to_ingest(
    store: &dyn PartitionedStore,
    chain_id: ChainId,
    start_block: BlockNumber,
) -> Result<BlockNumber> {
    let highest = highest_block_pointer(store, chain_id).await?;
    let next = match highest.map(|pointer| pointer.logical_key) {
        Some(LogicalKey::Block { block_number, .. }) => block_number + 1,
        _ => start_block,
    };
    Ok(next.max(start_block))
}

pub async fn next_to_finalize(
    store: &dyn PartitionedStore,
    chain_id: ChainId,
    start_block: BlockNumber,
) -> Result<BlockNumber> {
    Ok(get_cursor(store, chain_id)
        .await?
        .map_or(start_block, |cursor| cursor.next_to_finalize.max(start_block)))
}

/// Moves `nextToFinalize` from `current` to `next`.
///
/// Moving backwards is ignored. Losing the conditional write to a writer that already
/// moved at least as far is success; anything else is a conflict.
pub async fn advance_finalized(
    store: &dyn PartitionedStore,
    chain_id: ChainId,
    current: BlockNumber,
    next: BlockNumber,
) -> Result<BlockNumber> {
    if next <= current {
        return Ok(current);
    }

    let existing = get_cursor(store, chain_id).await?;
    let condition = match existing {
        Some(_) => Condition::AttributeEquals {
            attribute: "next_to_finalize".to_string(),
            value: serde_json::to_value(current)?,
        },
        None => Condition::Absent,
    };
    let row = ChainCursorRow {
        chain_id,
        next_to_finalize: next,
        updated_at: Utc::now(),
    };

    match store
        .conditional_put(Put::from_row(cursor_key(chain_id), &row)?, condition)
        .await?
    {
        PutOutcome::Written => {
            debug!("[cursor] Chain {} next to finalize: {}", chain_id, next);
            Ok(next)
        }
        PutOutcome::ConditionFailed => match get_cursor(store, chain_id).await? {
            Some(cursor) if cursor.next_to_finalize >= next => Ok(cursor.next_to_finalize),
            _ => Err(BlockchainError::store_conflict(format!(
                "{CHAIN_CURSORS_TABLE}/{chain_id}"
            ))),
        },
    }
}
