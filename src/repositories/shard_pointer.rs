use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    errors::Result,
    store::{
        delete_all, from_item, get_all, Condition, ItemKey, PartitionedStore, Put, PutOutcome,
        QueryRequest, RetryPolicy,
    },
    types::{BlockHash, BlockNumber, ChainId, LogicalKey, ShardIdentifier},
};

pub const SHARD_POINTERS_TABLE: &str = "shard_pointers";

/// Discriminator stored next to a shard assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PointerMarker {
    /// Block pointers remember the hash they were written for.
    BlockHash(BlockHash),
    /// Transaction and economy-address pointers remember where they were first seen.
    CreatedInBlock(BlockNumber),
}

/// Durable mapping from a logical key to the shard holding its rows.
///
/// `shard_identifier` never changes once written; `marker` and the counters may.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPointer {
    pub logical_key: LogicalKey,
    pub shard_identifier: ShardIdentifier,
    pub marker: PointerMarker,
    #[serde(default)]
    pub transaction_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ShardPointer {
    #[must_use]
    pub fn new(logical_key: LogicalKey, shard_identifier: ShardIdentifier, marker: PointerMarker) -> Self {
        let now = Utc::now();
        Self {
            logical_key,
            shard_identifier,
            marker,
            transaction_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn block_hash(&self) -> Option<&BlockHash> {
        match &self.marker {
            PointerMarker::BlockHash(hash) => Some(hash),
            PointerMarker::CreatedInBlock(_) => None,
        }
    }
}

/// Block pointers of one chain share a partition so the highest one can be queried.
#[must_use]
pub fn pointer_key(key: &LogicalKey) -> ItemKey {
    match key {
        LogicalKey::Block {
            chain_id,
            block_number,
        } => ItemKey::new(
            SHARD_POINTERS_TABLE,
            format!("block#{chain_id}"),
            block_number.sort_key(),
        ),
        LogicalKey::Transaction {
            chain_id,
            transaction_hash,
        } => ItemKey::single(
            SHARD_POINTERS_TABLE,
            format!("transaction#{chain_id}#{transaction_hash}"),
        ),
        LogicalKey::EconomyAddress {
            chain_id,
            contract_address,
            address,
        } => ItemKey::new(
            SHARD_POINTERS_TABLE,
            format!("economy_address#{chain_id}#{contract_address}"),
            address.value(),
        ),
    }
}

pub async fn get_pointers(
    store: &dyn PartitionedStore,
    keys: &[LogicalKey],
    policy: RetryPolicy,
) -> Result<HashMap<LogicalKey, ShardPointer>> {
    let item_keys: Vec<ItemKey> = keys.iter().map(pointer_key).collect();
    let found = get_all(store, &item_keys, policy).await?;

    keys.iter()
        .zip(item_keys.iter())
        .filter_map(|(logical, item_key)| {
            found
                .get(item_key)
                .map(|item| from_item(item.clone()).map(|pointer| (logical.clone(), pointer)))
        })
        .collect()
}

/// Insert-only-if-absent.
pub async fn insert_pointer(
    store: &dyn PartitionedStore,
    pointer: &ShardPointer,
) -> Result<PutOutcome> {
    store
        .conditional_put(
            Put::from_row(pointer_key(&pointer.logical_key), pointer)?,
            Condition::Absent,
        )
        .await
}

/// Overwrites marker and counters of an existing pointer.
pub async fn update_pointer(
    store: &dyn PartitionedStore,
    pointer: &ShardPointer,
) -> Result<PutOutcome> {
    store
        .conditional_put(
            Put::from_row(pointer_key(&pointer.logical_key), pointer)?,
            Condition::Exists,
        )
        .await
}

pub async fn delete_pointers(
    store: &dyn PartitionedStore,
    keys: &[LogicalKey],
    policy: RetryPolicy,
) -> Result<()> {
    delete_all(store, keys.iter().map(pointer_key).collect(), policy).await
}

/// The block pointer with the greatest block number on record for `chain_id`.
pub async fn highest_block_pointer(
    store: &dyn PartitionedStore,
    chain_id: ChainId,
) -> Result<Option<ShardPointer>> {
    let page = store
        .query(
            QueryRequest::partition(SHARD_POINTERS_TABLE, format!("block#{chain_id}"))
                .descending()
                .limit(1),
        )
        .await?;

    page.items
        .into_iter()
        .next()
        .map(|(_, item)| from_item(item))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn block_pointer(chain: u64, number: i64) -> ShardPointer {
        let chain_id = ChainId::new(chain);
        ShardPointer::new(
            LogicalKey::block(chain_id, BlockNumber::from_trusted(number)),
            ShardIdentifier::new(chain_id, 1),
            PointerMarker::BlockHash(BlockHash::from_trusted(format!("0x{number:064x}"))),
        )
    }

    #[tokio::test]
    async fn test_insert_pointer_only_once() {
        let store = MemoryStore::new();
        let pointer = block_pointer(1000, 78);

        assert_eq!(
            insert_pointer(&store, &pointer).await.unwrap(),
            PutOutcome::Written
        );
        assert_eq!(
            insert_pointer(&store, &pointer).await.unwrap(),
            PutOutcome::ConditionFailed
        );
    }

    #[tokio::test]
    async fn test_update_requires_existing_pointer() {
        let store = MemoryStore::new();
        let pointer = block_pointer(1000, 5);
        assert_eq!(
            update_pointer(&store, &pointer).await.unwrap(),
            PutOutcome::ConditionFailed
        );
    }

    #[tokio::test]
    async fn test_highest_block_pointer_orders_numerically() {
        let store = MemoryStore::new();
        for number in [9, 10, 2] {
            insert_pointer(&store, &block_pointer(1000, number))
                .await
                .unwrap();
        }
        insert_pointer(&store, &block_pointer(2000, 50)).await.unwrap();

        let highest = highest_block_pointer(&store, ChainId::new(1000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            highest.logical_key,
            LogicalKey::block(ChainId::new(1000), BlockNumber::from_trusted(10))
        );
        assert!(highest_block_pointer(&store, ChainId::new(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_get_and_delete_pointers() {
        let store = MemoryStore::new();
        let pointer = block_pointer(1000, 3);
        insert_pointer(&store, &pointer).await.unwrap();

        let missing = LogicalKey::block(ChainId::new(1000), BlockNumber::from_trusted(4));
        let found = get_pointers(
            &store,
            &[pointer.logical_key.clone(), missing.clone()],
            RetryPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&pointer.logical_key], pointer);

        delete_pointers(&store, &[pointer.logical_key.clone(), missing], RetryPolicy::default())
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }
}
