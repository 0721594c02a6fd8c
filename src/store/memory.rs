//! In-process [`PartitionedStore`] used by tests and the `--store memory` dry-run mode.

use std::{
    collections::{BTreeMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    BatchDeleteOutput, BatchGetOutput, BatchWriteOutput, Condition, Item, ItemKey,
    PartitionedStore, Put, PutOutcome, QueryPage, QueryRequest,
};
use crate::errors::{BlockchainError, Result};

#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<ItemKey, Item>>,
    unavailable: AtomicBool,
    /// Partition keys whose writes are always reported back as unprocessed.
    rejected_partitions: RwLock<HashSet<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Rejects batch writes to `partition_key` until [`Self::accept_writes`] is called.
    pub async fn reject_writes(&self, partition_key: impl Into<String>) {
        self.rejected_partitions
            .write()
            .await
            .insert(partition_key.into());
    }

    pub async fn accept_writes(&self, partition_key: &str) {
        self.rejected_partitions.write().await.remove(partition_key);
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Number of items stored in tables whose name starts with `prefix`.
    pub async fn count_in_tables(&self, prefix: &str) -> usize {
        self.items
            .read()
            .await
            .keys()
            .filter(|key| key.table.starts_with(prefix))
            .count()
    }

    /// Direct read for assertions.
    pub async fn get(&self, key: &ItemKey) -> Option<Item> {
        self.items.read().await.get(key).cloned()
    }

    /// Direct overwrite, bypassing fault injection.
    pub async fn insert(&self, key: ItemKey, item: Item) {
        self.items.write().await.insert(key, item);
    }

    /// Snapshot of every stored item, in key order.
    pub async fn dump(&self) -> Vec<(ItemKey, Item)> {
        self.items
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BlockchainError::store_unavailable(
                "memory store marked unavailable",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PartitionedStore for MemoryStore {
    async fn batch_get(&self, keys: &[ItemKey]) -> Result<BatchGetOutput> {
        self.ensure_available()?;
        let items = self.items.read().await;
        let found = keys
            .iter()
            .filter_map(|key| items.get(key).map(|item| (key.clone(), item.clone())))
            .collect();
        Ok(BatchGetOutput {
            items: found,
            unprocessed: Vec::new(),
        })
    }

    async fn conditional_put(&self, put: Put, condition: Condition) -> Result<PutOutcome> {
        self.ensure_available()?;
        let mut items = self.items.write().await;
        let existing = items.get(&put.key);
        let allowed = match (&condition, existing) {
            (Condition::Absent, None) => true,
            (Condition::Absent, Some(_)) => false,
            (Condition::Exists, existing) => existing.is_some(),
            (Condition::AttributeEquals { attribute, value }, Some(item)) => {
                item.get(attribute) == Some(value)
            }
            (Condition::AttributeEquals { .. }, None) => false,
        };
        if !allowed {
            return Ok(PutOutcome::ConditionFailed);
        }
        items.insert(put.key, put.item);
        Ok(PutOutcome::Written)
    }

    async fn batch_write(&self, puts: Vec<Put>) -> Result<BatchWriteOutput> {
        self.ensure_available()?;
        let rejected = self.rejected_partitions.read().await;
        let mut items = self.items.write().await;
        let mut unprocessed = Vec::new();
        for put in puts {
            if rejected.contains(&put.key.partition_key) {
                unprocessed.push(put);
            } else {
                items.insert(put.key, put.item);
            }
        }
        Ok(BatchWriteOutput { unprocessed })
    }

    async fn batch_delete(&self, keys: Vec<ItemKey>) -> Result<BatchDeleteOutput> {
        self.ensure_available()?;
        let mut items = self.items.write().await;
        for key in &keys {
            items.remove(key);
        }
        Ok(BatchDeleteOutput::default())
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryPage> {
        self.ensure_available()?;
        let items = self.items.read().await;
        let mut matching: Vec<(ItemKey, Item)> = items
            .iter()
            .filter(|(key, _)| {
                key.table == request.table
                    && key.partition_key == request.partition_key
                    && request.matches(&key.sort_key)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if request.descending {
            matching.reverse();
        }

        let limit = request.limit.max(1);
        let next_page_token = if matching.len() > limit {
            matching.truncate(limit);
            matching.last().map(|(key, _)| key.sort_key.clone())
        } else {
            None
        };

        Ok(QueryPage {
            items: matching,
            next_page_token,
        })
    }

    async fn check_connection(&self) -> Result<()> {
        self.ensure_available()
    }
}
