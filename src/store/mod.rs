//! # Partitioned Store
//!
//! The ingestion core persists everything through [`PartitionedStore`], a small
//! key/value contract modelled on wide-column stores: items are addressed by
//! `(table, partition key, sort key)`, carry a JSON attribute map, and can be read in
//! batches, written in batches, written conditionally and range-queried within one
//! partition.
//!
//! Batch operations may report an *unprocessed* subset. Callers either retry that
//! subset through the helpers in this module or surface it (the transaction fan-out
//! turns it into dirty transactions).
//!
//! Two backends are provided:
//! - [`postgres::PgStore`] keeps every item in one Postgres table
//! - [`memory::MemoryStore`] keeps items in process, with fault injection for tests

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::warn;

use crate::errors::{BlockchainError, Result};

pub mod memory;
pub mod postgres;

/// Upper bound on keys per batch call, shared by both backends.
pub const MAX_BATCH_ITEMS: usize = 25;

/// Attribute map of one stored item.
pub type Item = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub table: String,
    pub partition_key: String,
    pub sort_key: String,
}

impl ItemKey {
    pub fn new(
        table: impl Into<String>,
        partition_key: impl Into<String>,
        sort_key: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }

    /// Key of a table without a sort dimension.
    pub fn single(table: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self::new(table, partition_key, "")
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.table, self.partition_key, self.sort_key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Put {
    pub key: ItemKey,
    pub item: Item,
}

impl Put {
    /// Serializes a typed row into an item.
    pub fn from_row<T: Serialize>(key: ItemKey, row: &T) -> Result<Self> {
        Ok(Self {
            key,
            item: to_item(row)?,
        })
    }
}

/// Predicate evaluated atomically with a conditional put.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Only write when no item exists under the key.
    Absent,
    /// Only overwrite an existing item.
    Exists,
    /// Only overwrite when the existing item's attribute equals the value.
    AttributeEquals { attribute: String, value: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    ConditionFailed,
}

#[derive(Debug, Default)]
pub struct BatchGetOutput {
    pub items: HashMap<ItemKey, Item>,
    pub unprocessed: Vec<ItemKey>,
}

#[derive(Debug, Default)]
pub struct BatchWriteOutput {
    pub unprocessed: Vec<Put>,
}

#[derive(Debug, Default)]
pub struct BatchDeleteOutput {
    pub unprocessed: Vec<ItemKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKeyCondition {
    All,
    Prefix(String),
    /// Inclusive on both ends.
    Between(String, String),
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub table: String,
    pub partition_key: String,
    pub sort: SortKeyCondition,
    pub limit: usize,
    pub descending: bool,
    /// Sort key of the last item of the previous page.
    pub exclusive_start_key: Option<String>,
}

impl QueryRequest {
    pub fn partition(table: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            partition_key: partition_key.into(),
            sort: SortKeyCondition::All,
            limit: 100,
            descending: false,
            exclusive_start_key: None,
        }
    }

    #[must_use]
    pub fn sort(mut self, sort: SortKeyCondition) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    #[must_use]
    pub fn start_after(mut self, sort_key: Option<String>) -> Self {
        self.exclusive_start_key = sort_key;
        self
    }

    fn matches(&self, sort_key: &str) -> bool {
        let in_range = match &self.sort {
            SortKeyCondition::All => true,
            SortKeyCondition::Prefix(prefix) => sort_key.starts_with(prefix.as_str()),
            SortKeyCondition::Between(low, high) => {
                sort_key >= low.as_str() && sort_key <= high.as_str()
            }
        };
        let after_start = match &self.exclusive_start_key {
            None => true,
            Some(start) if self.descending => sort_key < start.as_str(),
            Some(start) => sort_key > start.as_str(),
        };
        in_range && after_start
    }
}

#[derive(Debug, Default)]
pub struct QueryPage {
    pub items: Vec<(ItemKey, Item)>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait PartitionedStore: Send + Sync {
    async fn batch_get(&self, keys: &[ItemKey]) -> Result<BatchGetOutput>;

    async fn conditional_put(&self, put: Put, condition: Condition) -> Result<PutOutcome>;

    async fn batch_write(&self, puts: Vec<Put>) -> Result<BatchWriteOutput>;

    async fn batch_delete(&self, keys: Vec<ItemKey>) -> Result<BatchDeleteOutput>;

    async fn query(&self, request: QueryRequest) -> Result<QueryPage>;

    async fn check_connection(&self) -> Result<()>;
}

pub fn to_item<T: Serialize>(row: &T) -> Result<Item> {
    match serde_json::to_value(row)? {
        Value::Object(map) => Ok(map),
        other => Err(BlockchainError::serialization(format!(
            "Row must serialize to an object, got {other}"
        ))),
    }
}

pub fn from_item<T: DeserializeOwned>(item: Item) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(item))?)
}

/// Retry policy for unprocessed batch subsets.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2_u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Writes `puts`, retrying unprocessed items; returns whatever is still unprocessed.
pub async fn write_with_retries(
    store: &dyn PartitionedStore,
    puts: Vec<Put>,
    policy: RetryPolicy,
) -> Result<Vec<Put>> {
    let mut pending = puts;
    let mut attempt = 0;
    while !pending.is_empty() {
        let mut unprocessed = Vec::new();
        for chunk in pending.chunks(MAX_BATCH_ITEMS) {
            let output = store.batch_write(chunk.to_vec()).await?;
            unprocessed.extend(output.unprocessed);
        }
        pending = unprocessed;
        attempt += 1;
        if pending.is_empty() || attempt >= policy.max_attempts {
            break;
        }
        warn!(
            "[store] {} items unprocessed by batch write. Retrying in {:?} (Attempt {}/{})",
            pending.len(),
            policy.backoff(attempt),
            attempt,
            policy.max_attempts
        );
        sleep(policy.backoff(attempt)).await;
    }
    Ok(pending)
}

/// Writes `puts` and fails if anything is left unprocessed.
pub async fn write_all(
    store: &dyn PartitionedStore,
    puts: Vec<Put>,
    policy: RetryPolicy,
) -> Result<()> {
    let left = write_with_retries(store, puts, policy).await?;
    if left.is_empty() {
        Ok(())
    } else {
        Err(BlockchainError::unprocessed("batch_write", left.len()))
    }
}

/// Reads every key, retrying unprocessed ones; fails if any stay unprocessed.
pub async fn get_all(
    store: &dyn PartitionedStore,
    keys: &[ItemKey],
    policy: RetryPolicy,
) -> Result<HashMap<ItemKey, Item>> {
    let mut found = HashMap::with_capacity(keys.len());
    let mut pending = keys.to_vec();
    let mut attempt = 0;
    while !pending.is_empty() {
        let mut unprocessed = Vec::new();
        for chunk in pending.chunks(MAX_BATCH_ITEMS) {
            let output = store.batch_get(chunk).await?;
            found.extend(output.items);
            unprocessed.extend(output.unprocessed);
        }
        pending = unprocessed;
        attempt += 1;
        if pending.is_empty() {
            break;
        }
        if attempt >= policy.max_attempts {
            return Err(BlockchainError::unprocessed("batch_get", pending.len()));
        }
        sleep(policy.backoff(attempt)).await;
    }
    Ok(found)
}

/// Deletes every key. Deleting an absent key is a no-op.
pub async fn delete_all(
    store: &dyn PartitionedStore,
    keys: Vec<ItemKey>,
    policy: RetryPolicy,
) -> Result<()> {
    let mut pending = keys;
    let mut attempt = 0;
    while !pending.is_empty() {
        let mut unprocessed = Vec::new();
        for chunk in pending.chunks(MAX_BATCH_ITEMS) {
            let output = store.batch_delete(chunk.to_vec()).await?;
            unprocessed.extend(output.unprocessed);
        }
        pending = unprocessed;
        attempt += 1;
        if pending.is_empty() {
            break;
        }
        if attempt >= policy.max_attempts {
            return Err(BlockchainError::unprocessed("batch_delete", pending.len()));
        }
        sleep(policy.backoff(attempt)).await;
    }
    Ok(())
}

/// Follows page tokens until the partition (or range) is exhausted.
pub async fn query_all(
    store: &dyn PartitionedStore,
    request: QueryRequest,
) -> Result<Vec<(ItemKey, Item)>> {
    let mut items = Vec::new();
    let mut next = request;
    loop {
        let page = store.query(next.clone()).await?;
        items.extend(page.items);
        match page.next_page_token {
            Some(token) => next = next.start_after(Some(token)),
            None => return Ok(items),
        }
    }
}
