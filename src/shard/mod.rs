//! # Shard Directory
//!
//! Maps logical keys (block numbers, transaction hashes, economy-address pairs) to the
//! physical shard holding their rows.
//!
//! Pointers are written once with an insert-only-if-absent condition. When two
//! writers race for the same key the store decides the winner; the loser re-reads the
//! row and adopts the winner's shard, so `assign` is idempotent for callers.
//!
//! Resolved pointers and shard pools are cached for a short TTL in bounded LRU maps.
//! Any write that changes
//! a pointer goes through [`ShardDirectory::update_pointer`] or
//! [`ShardDirectory::delete_pointers`], which drop the cached copy.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    errors::{BlockchainError, Result},
    repositories::{
        shard_pointer::{
            delete_pointers, get_pointers, insert_pointer, update_pointer, PointerMarker,
            ShardPointer,
        },
        shard_pool::{available_shards, ShardPoolEntry},
    },
    store::{PartitionedStore, PutOutcome, RetryPolicy},
    types::{ChainId, LogicalKey, PartitionKind, ShardIdentifier},
};

pub mod cache;

use cache::TtlCache;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;
const POOL_CACHE_CAPACITY: usize = 64;

/// Result of [`ShardDirectory::assign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub pointer: ShardPointer,
    /// `false` when the pointer already existed, whether found up front or after
    /// losing the conditional insert.
    pub created: bool,
}

impl Assignment {
    #[must_use]
    pub const fn shard(&self) -> &ShardIdentifier {
        &self.pointer.shard_identifier
    }
}

pub struct ShardDirectory {
    store: Arc<dyn PartitionedStore>,
    cache_ttl: Duration,
    pointers: TtlCache<LogicalKey, ShardPointer>,
    pools: TtlCache<(PartitionKind, ChainId), Vec<ShardPoolEntry>>,
    policy: RetryPolicy,
}

impl ShardDirectory {
    #[must_use]
    pub fn new(store: Arc<dyn PartitionedStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache_ttl,
            pointers: TtlCache::new(cache_ttl, DEFAULT_CACHE_CAPACITY),
            pools: TtlCache::new(cache_ttl, POOL_CACHE_CAPACITY),
            policy: RetryPolicy::default(),
        }
    }

    /// Caps the number of cached pointers.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.pointers = TtlCache::new(self.cache_ttl, capacity);
        self
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn PartitionedStore> {
        &self.store
    }

    /// Shard of every key that has a pointer; keys without one are absent from the map.
    pub async fn resolve(
        &self,
        kind: PartitionKind,
        keys: &[LogicalKey],
    ) -> Result<HashMap<LogicalKey, ShardIdentifier>> {
        Ok(self
            .resolve_pointers(kind, keys)
            .await?
            .into_iter()
            .map(|(key, pointer)| (key, pointer.shard_identifier))
            .collect())
    }

    pub async fn resolve_pointers(
        &self,
        kind: PartitionKind,
        keys: &[LogicalKey],
    ) -> Result<HashMap<LogicalKey, ShardPointer>> {
        if let Some(wrong) = keys.iter().find(|key| key.kind() != kind) {
            return Err(BlockchainError::invalid_format(
                "logical_key",
                &format!("{wrong} is not a {kind} key"),
            ));
        }

        let mut resolved = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();
        for key in keys {
            match self.pointers.get(key) {
                Some(pointer) => {
                    resolved.insert(key.clone(), pointer);
                }
                None => misses.push(key.clone()),
            }
        }

        if !misses.is_empty() {
            let found = get_pointers(self.store.as_ref(), &misses, self.policy).await?;
            for (key, pointer) in found {
                self.pointers.insert(key.clone(), pointer.clone());
                resolved.insert(key, pointer);
            }
        }

        Ok(resolved)
    }

    /// Returns the pointer for `key`, creating it on shard `pool[ordinal % len]` if
    /// none exists.
    pub async fn assign(
        &self,
        key: LogicalKey,
        marker: PointerMarker,
        ordinal: usize,
    ) -> Result<Assignment> {
        let kind = key.kind();
        if let Some(pointer) = self
            .resolve_pointers(kind, std::slice::from_ref(&key))
            .await?
            .remove(&key)
        {
            return Ok(Assignment {
                pointer,
                created: false,
            });
        }

        let pool = self.pool(kind, key.chain_id()).await?;
        let shard = pool[ordinal % pool.len()].identifier();
        let pointer = ShardPointer::new(key.clone(), shard, marker);

        match insert_pointer(self.store.as_ref(), &pointer).await? {
            PutOutcome::Written => {
                debug!("[shard] Assigned {} {} to {}", kind, key, pointer.shard_identifier);
                self.pointers.insert(key, pointer.clone());
                Ok(Assignment {
                    pointer,
                    created: true,
                })
            }
            PutOutcome::ConditionFailed => {
                self.pointers.invalidate(&key);
                let winner = get_pointers(
                    self.store.as_ref(),
                    std::slice::from_ref(&key),
                    self.policy,
                )
                .await?
                .remove(&key)
                .ok_or_else(|| BlockchainError::store_conflict(format!("{kind} pointer {key}")))?;
                debug!(
                    "[shard] Lost assignment race for {} {}, adopting {}",
                    kind, key, winner.shard_identifier
                );
                self.pointers.insert(key, winner.clone());
                Ok(Assignment {
                    pointer: winner,
                    created: false,
                })
            }
        }
    }

    pub fn invalidate(&self, keys: &[LogicalKey]) {
        for key in keys {
            self.pointers.invalidate(key);
        }
    }

    /// Persists a changed marker or counter. The shard assignment itself never changes.
    pub async fn update_pointer(&self, pointer: &ShardPointer) -> Result<()> {
        let outcome = update_pointer(self.store.as_ref(), pointer).await;
        self.invalidate(std::slice::from_ref(&pointer.logical_key));
        match outcome? {
            PutOutcome::Written => Ok(()),
            PutOutcome::ConditionFailed => Err(BlockchainError::store_conflict(format!(
                "{} pointer {} disappeared",
                pointer.logical_key.kind(),
                pointer.logical_key
            ))),
        }
    }

    pub async fn delete_pointers(&self, keys: &[LogicalKey]) -> Result<()> {
        let outcome = delete_pointers(self.store.as_ref(), keys, self.policy).await;
        self.invalidate(keys);
        outcome
    }

    /// The available shards of `kind`, cached like pointers.
    pub async fn pool(&self, kind: PartitionKind, chain_id: ChainId) -> Result<Vec<ShardPoolEntry>> {
        if let Some(pool) = self.pools.get(&(kind, chain_id)) {
            return Ok(pool);
        }

        let pool = available_shards(self.store.as_ref(), kind, chain_id).await?;
        if pool.is_empty() {
            return Err(BlockchainError::shard_pool_empty(kind.as_str(), chain_id.value()));
        }
        info!(
            "[shard] Loaded {} available {} shards for chain {}",
            pool.len(),
            kind,
            chain_id
        );
        self.pools.insert((kind, chain_id), pool.clone());
        Ok(pool)
    }

    /// Forgets cached pools, e.g. after shard administration in the same process.
    pub fn invalidate_pools(&self) {
        self.pools.clear();
    }
}
