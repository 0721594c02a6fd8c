use serde::{Deserialize, Serialize};

use crate::{
    errors::Result,
    store::{from_item, query_all, ItemKey, PartitionedStore, QueryRequest},
    types::{Address, BlockNumber, ChainId, ShardIdentifier, TransactionHash},
};

pub const ECONOMY_ADDRESS_TRANSACTIONS_TABLE: &str = "economy_address_transactions";
pub const ECONOMY_ADDRESS_TRANSFERS_TABLE: &str = "economy_address_transfers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// A transaction that touched `address` within an economy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomyAddressTransactionRow {
    pub chain_id: ChainId,
    pub contract_address: Address,
    pub address: Address,
    pub transaction_hash: TransactionHash,
    pub block_number: BlockNumber,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomyAddressTransferRow {
    pub chain_id: ChainId,
    pub contract_address: Address,
    pub address: Address,
    pub counterparty: Address,
    pub direction: TransferDirection,
    pub amount: String,
    pub transaction_hash: TransactionHash,
    pub event_index: i64,
    pub block_number: BlockNumber,
    pub timestamp: i64,
}

fn address_partition(contract_address: &Address, address: &Address) -> String {
    format!("{contract_address}#{address}")
}

/// Rows of one address sort by time, then transaction.
#[must_use]
pub fn address_transaction_key(
    shard: &ShardIdentifier,
    contract_address: &Address,
    address: &Address,
    timestamp: i64,
    hash: &TransactionHash,
) -> ItemKey {
    ItemKey::new(
        shard.table(ECONOMY_ADDRESS_TRANSACTIONS_TABLE),
        address_partition(contract_address, address),
        format!("{timestamp:020}#{hash}"),
    )
}

#[must_use]
pub fn address_transfer_key(
    shard: &ShardIdentifier,
    contract_address: &Address,
    address: &Address,
    timestamp: i64,
    hash: &TransactionHash,
    event_index: i64,
) -> ItemKey {
    ItemKey::new(
        shard.table(ECONOMY_ADDRESS_TRANSFERS_TABLE),
        address_partition(contract_address, address),
        format!("{timestamp:020}#{hash}#{event_index:06}"),
    )
}

pub async fn list_address_transactions(
    store: &dyn PartitionedStore,
    shard: &ShardIdentifier,
    contract_address: &Address,
    address: &Address,
) -> Result<Vec<EconomyAddressTransactionRow>> {
    query_all(
        store,
        QueryRequest::partition(
            shard.table(ECONOMY_ADDRESS_TRANSACTIONS_TABLE),
            address_partition(contract_address, address),
        ),
    )
    .await?
    .into_iter()
    .map(|(_, item)| from_item(item))
    .collect()
}

pub async fn list_address_transfers(
    store: &dyn PartitionedStore,
    shard: &ShardIdentifier,
    contract_address: &Address,
    address: &Address,
) -> Result<Vec<EconomyAddressTransferRow>> {
    query_all(
        store,
        QueryRequest::partition(
            shard.table(ECONOMY_ADDRESS_TRANSFERS_TABLE),
            address_partition(contract_address, address),
        ),
    )
    .await?
    .into_iter()
    .map(|(_, item)| from_item(item))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_sort_by_timestamp() {
        let shard = ShardIdentifier::new(ChainId::new(1000), 1);
        let contract = Address::from_trusted("0xcc");
        let address = Address::from_trusted("0xaa");
        let hash = TransactionHash::from_trusted("0x01");

        let early = address_transfer_key(&shard, &contract, &address, 9, &hash, 0);
        let late = address_transfer_key(&shard, &contract, &address, 10, &hash, 0);
        assert_eq!(early.table, "economy_address_transfers_1000_1");
        assert_eq!(early.partition_key, "0xcc#0xaa");
        assert!(early.sort_key < late.sort_key);

        let tx_key = address_transaction_key(&shard, &contract, &address, 9, &hash);
        assert!(tx_key.sort_key.ends_with("#0x01"));
    }
}
