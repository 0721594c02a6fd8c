use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    errors::Result,
    store::{from_item, get_all, Condition, ItemKey, PartitionedStore, Put, PutOutcome, RetryPolicy},
    types::{Address, BlockNumber, ChainId},
};

pub const ECONOMIES_TABLE: &str = "economies";

/// A tracked token contract. Aggregate counters are maintained elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Economy {
    pub chain_id: ChainId,
    pub contract_address: Address,
    pub first_seen_block: BlockNumber,
    pub created_at: DateTime<Utc>,
}

#[must_use]
pub fn economy_key(chain_id: ChainId, contract_address: &Address) -> ItemKey {
    ItemKey::single(ECONOMIES_TABLE, format!("{chain_id}#{contract_address}"))
}

/// Creates the economy on first sight of its contract. Returns `true` if this call
/// created it.
pub async fn register_economy(
    store: &dyn PartitionedStore,
    chain_id: ChainId,
    contract_address: &Address,
    first_seen_block: BlockNumber,
) -> Result<bool> {
    let economy = Economy {
        chain_id,
        contract_address: contract_address.clone(),
        first_seen_block,
        created_at: Utc::now(),
    };
    let outcome = store
        .conditional_put(
            Put::from_row(economy_key(chain_id, contract_address), &economy)?,
            Condition::Absent,
        )
        .await?;
    Ok(outcome == PutOutcome::Written)
}

pub async fn get_economy(
    store: &dyn PartitionedStore,
    chain_id: ChainId,
    contract_address: &Address,
) -> Result<Option<Economy>> {
    let key = economy_key(chain_id, contract_address);
    get_all(store, std::slice::from_ref(&key), RetryPolicy::default())
        .await?
        .remove(&key)
        .map(from_item)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_first_sighting_wins() {
        let store = MemoryStore::new();
        let chain = ChainId::new(1000);
        let contract = Address::from_trusted("0xcccc000000000000000000000000000000000002");

        assert!(register_economy(&store, chain, &contract, BlockNumber::from_trusted(78))
            .await
            .unwrap());
        assert!(!register_economy(&store, chain, &contract, BlockNumber::from_trusted(90))
            .await
            .unwrap());

        let economy = get_economy(&store, chain, &contract).await.unwrap().unwrap();
        assert_eq!(economy.first_seen_block, BlockNumber::from_trusted(78));
    }
}
