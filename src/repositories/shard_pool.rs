use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    errors::Result,
    store::{
        from_item, get_all, query_all, write_all, Condition, ItemKey, PartitionedStore, Put,
        PutOutcome, QueryRequest, RetryPolicy,
    },
    types::{ChainId, PartitionKind, ShardIdentifier},
};

pub const SHARDS_TABLE: &str = "shards";

/// One physical shard that pointers of `kind` may be assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPoolEntry {
    pub kind: PartitionKind,
    pub chain_id: ChainId,
    pub shard_number: u32,
    pub is_available: bool,
    pub created_at: DateTime<Utc>,
}

impl ShardPoolEntry {
    #[must_use]
    pub fn identifier(&self) -> ShardIdentifier {
        ShardIdentifier::new(self.chain_id, self.shard_number)
    }

    fn key(&self) -> ItemKey {
        shard_key(self.kind, self.chain_id, self.shard_number)
    }
}

fn pool_partition(kind: PartitionKind, chain_id: ChainId) -> String {
    format!("{kind}#{chain_id}")
}

fn shard_key(kind: PartitionKind, chain_id: ChainId, shard_number: u32) -> ItemKey {
    ItemKey::new(
        SHARDS_TABLE,
        pool_partition(kind, chain_id),
        format!("{shard_number:010}"),
    )
}

/// Every pool entry of `kind`, ordered by shard number.
pub async fn list_shards(
    store: &dyn PartitionedStore,
    kind: PartitionKind,
    chain_id: ChainId,
) -> Result<Vec<ShardPoolEntry>> {
    query_all(
        store,
        QueryRequest::partition(SHARDS_TABLE, pool_partition(kind, chain_id)),
    )
    .await?
    .into_iter()
    .map(|(_, item)| from_item(item))
    .collect()
}

/// The ranked list the directory round-robins over.
pub async fn available_shards(
    store: &dyn PartitionedStore,
    kind: PartitionKind,
    chain_id: ChainId,
) -> Result<Vec<ShardPoolEntry>> {
    Ok(list_shards(store, kind, chain_id)
        .await?
        .into_iter()
        .filter(|entry| entry.is_available)
        .collect())
}

/// Registers a shard. With `replace_existing`, every other shard of the kind stops
/// receiving new assignments. Adding an already registered shard makes it available.
pub async fn add_shard(
    store: &dyn PartitionedStore,
    kind: PartitionKind,
    chain_id: ChainId,
    shard_number: u32,
    replace_existing: bool,
) -> Result<ShardPoolEntry> {
    let entry = ShardPoolEntry {
        kind,
        chain_id,
        shard_number,
        is_available: true,
        created_at: Utc::now(),
    };

    let outcome = store
        .conditional_put(Put::from_row(entry.key(), &entry)?, Condition::Absent)
        .await?;

    let entry = match outcome {
        PutOutcome::Written => {
            info!("[shard] Registered shard {} for {}", entry.identifier(), kind);
            entry
        }
        PutOutcome::ConditionFailed => {
            let existing = get_all(store, &[entry.key()], RetryPolicy::default()).await?;
            let mut current: ShardPoolEntry = existing
                .into_values()
                .next()
                .map(from_item)
                .transpose()?
                .unwrap_or(entry);
            if !current.is_available {
                current.is_available = true;
                write_all(
                    store,
                    vec![Put::from_row(current.key(), &current)?],
                    RetryPolicy::default(),
                )
                .await?;
            }
            current
        }
    };

    if replace_existing {
        let retired: Vec<Put> = list_shards(store, kind, chain_id)
            .await?
            .into_iter()
            .filter(|other| other.shard_number != shard_number && other.is_available)
            .map(|mut other| {
                other.is_available = false;
                info!("[shard] Retiring shard {} for {}", other.identifier(), kind);
                Put::from_row(other.key(), &other)
            })
            .collect::<Result<_>>()?;
        write_all(store, retired, RetryPolicy::default()).await?;
    }

    Ok(entry)
}
