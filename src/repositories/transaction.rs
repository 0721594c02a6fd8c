use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    decoder::TransferKind,
    errors::Result,
    rpc::{RpcReceipt, RpcTransaction},
    store::{
        delete_all, from_item, get_all, query_all, ItemKey, PartitionedStore, QueryRequest,
        RetryPolicy,
    },
    types::{Address, BlockNumber, ChainId, ParsingStatus, ShardIdentifier, TransactionHash},
    utils::convert_hex_string_to_i64,
};

pub const TRANSACTIONS_TABLE: &str = "transactions";
pub const TRANSACTION_DETAILS_TABLE: &str = "transaction_details";
pub const TOKEN_TRANSFERS_TABLE: &str = "token_transfers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub chain_id: ChainId,
    pub transaction_hash: TransactionHash,
    pub block_number: BlockNumber,
    pub block_hash: String,
    pub transaction_index: i64,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: String,
    pub gas_used: i64,
    pub receipt_status: ReceiptStatus,
    pub contract_address: Option<String>,
    pub timestamp: i64,
    pub transfer_count: i64,
    pub events_parsing_status: ParsingStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDetailRow {
    pub transaction_hash: TransactionHash,
    pub gas: String,
    pub gas_price: Option<String>,
    pub nonce: Option<String>,
    pub input: Option<String>,
    pub cumulative_gas_used: Option<String>,
    pub log_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransferRow {
    pub chain_id: ChainId,
    pub transaction_hash: TransactionHash,
    pub event_index: i64,
    pub kind: TransferKind,
    pub contract_address: Address,
    pub from: Address,
    pub to: Address,
    pub amount: String,
    pub block_number: BlockNumber,
    pub timestamp: i64,
}

#[must_use]
pub fn transaction_key(shard: &ShardIdentifier, hash: &TransactionHash) -> ItemKey {
    ItemKey::single(shard.table(TRANSACTIONS_TABLE), hash.value())
}

#[must_use]
pub fn transaction_detail_key(shard: &ShardIdentifier, hash: &TransactionHash) -> ItemKey {
    ItemKey::single(shard.table(TRANSACTION_DETAILS_TABLE), hash.value())
}

#[must_use]
pub fn token_transfer_key(
    shard: &ShardIdentifier,
    hash: &TransactionHash,
    event_index: i64,
) -> ItemKey {
    ItemKey::new(
        shard.table(TOKEN_TRANSFERS_TABLE),
        hash.value(),
        format!("{event_index:06}"),
    )
}

/// Block-level facts copied onto every transaction row of the block.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub block_hash: String,
    pub timestamp: i64,
}

/// Builds the transaction and detail rows for one fetched transaction and its receipt.
/// The row starts out [`ParsingStatus::Pending`].
pub fn transaction_rows(
    context: &BlockContext,
    position: usize,
    transaction: &RpcTransaction,
    receipt: &RpcReceipt,
) -> Result<(TransactionRow, TransactionDetailRow)> {
    let hash = TransactionHash::from_trusted(transaction.hash.to_ascii_lowercase());
    let transaction_index = match &transaction.transaction_index {
        Some(index) => convert_hex_string_to_i64(index)?,
        None => i64::try_from(position).unwrap_or(i64::MAX),
    };

    let row = TransactionRow {
        chain_id: context.chain_id,
        transaction_hash: hash.clone(),
        block_number: context.block_number,
        block_hash: context.block_hash.clone(),
        transaction_index,
        from: transaction.from.as_ref().map(|a| a.to_ascii_lowercase()),
        to: transaction.to.as_ref().map(|a| a.to_ascii_lowercase()),
        value: transaction.value.clone(),
        gas_used: convert_hex_string_to_i64(&receipt.gas_used)?,
        receipt_status: if receipt.succeeded() {
            ReceiptStatus::Success
        } else {
            ReceiptStatus::Failed
        },
        contract_address: receipt
            .contract_address
            .as_ref()
            .map(|a| a.to_ascii_lowercase()),
        timestamp: context.timestamp,
        transfer_count: 0,
        events_parsing_status: ParsingStatus::Pending,
        updated_at: Utc::now(),
    };

    let detail = TransactionDetailRow {
        transaction_hash: hash,
        gas: transaction.gas.clone(),
        gas_price: transaction.gas_price.clone(),
        nonce: transaction.nonce.clone(),
        input: transaction.input.clone(),
        cumulative_gas_used: receipt.cumulative_gas_used.clone(),
        log_count: i64::try_from(receipt.logs.len()).unwrap_or(i64::MAX),
    };

    Ok((row, detail))
}

/// Reads transaction rows that live in (possibly different) shards.
pub async fn get_transactions(
    store: &dyn PartitionedStore,
    locations: &[(ShardIdentifier, TransactionHash)],
) -> Result<HashMap<TransactionHash, TransactionRow>> {
    let keys: Vec<ItemKey> = locations
        .iter()
        .map(|(shard, hash)| transaction_key(shard, hash))
        .collect();
    let found = get_all(store, &keys, RetryPolicy::default()).await?;

    found
        .into_values()
        .map(|item| from_item::<TransactionRow>(item).map(|row| (row.transaction_hash.clone(), row)))
        .collect()
}

pub async fn list_token_transfers(
    store: &dyn PartitionedStore,
    shard: &ShardIdentifier,
    hash: &TransactionHash,
) -> Result<Vec<TokenTransferRow>> {
    query_all(
        store,
        QueryRequest::partition(shard.table(TOKEN_TRANSFERS_TABLE), hash.value()),
    )
    .await?
    .into_iter()
    .map(|(_, item)| from_item(item))
    .collect()
}

/// Removes the transaction, its detail and its token transfers.
pub async fn delete_transaction(
    store: &dyn PartitionedStore,
    shard: &ShardIdentifier,
    hash: &TransactionHash,
    policy: RetryPolicy,
) -> Result<()> {
    let mut keys = vec![
        transaction_key(shard, hash),
        transaction_detail_key(shard, hash),
    ];
    keys.extend(
        list_token_transfers(store, shard, hash)
            .await?
            .iter()
            .map(|transfer| token_transfer_key(shard, hash, transfer.event_index)),
    );
    delete_all(store, keys, policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{memory::MemoryStore, write_all, Put};

    const HASH: &str = "0x2fd6000000000000000000000000000000000000000000000000000000999b91";

    fn context() -> BlockContext {
        BlockContext {
            chain_id: ChainId::new(1000),
            block_number: BlockNumber::from_trusted(78),
            block_hash: "0xbb".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    fn fetched() -> (RpcTransaction, RpcReceipt) {
        let transaction = serde_json::from_value(serde_json::json!({
            "hash": HASH,
            "transactionIndex": "0x0",
            "from": "0xAAAA000000000000000000000000000000000001",
            "to": null,
            "value": "0x0",
            "gas": "0x5208"
        }))
        .unwrap();
        let receipt = serde_json::from_value(serde_json::json!({
            "transactionHash": HASH,
            "status": "0x0",
            "gasUsed": "0x5208",
            "contractAddress": "0xCCCC000000000000000000000000000000000002",
            "logs": []
        }))
        .unwrap();
        (transaction, receipt)
    }

    #[test]
    fn test_transaction_rows_capture_receipt_outcome() {
        let (transaction, receipt) = fetched();
        let (row, detail) = transaction_rows(&context(), 3, &transaction, &receipt).unwrap();

        assert_eq!(row.transaction_hash.value(), HASH);
        assert_eq!(row.transaction_index, 0);
        assert_eq!(row.gas_used, 21000);
        assert_eq!(row.receipt_status, ReceiptStatus::Failed);
        assert_eq!(
            row.contract_address.as_deref(),
            Some("0xcccc000000000000000000000000000000000002")
        );
        assert_eq!(row.events_parsing_status, ParsingStatus::Pending);
        assert_eq!(detail.log_count, 0);
    }

    #[tokio::test]
    async fn test_delete_transaction_removes_transfers() {
        let store = MemoryStore::new();
        let shard = ShardIdentifier::new(ChainId::new(1000), 2);
        let (transaction, receipt) = fetched();
        let (row, detail) = transaction_rows(&context(), 0, &transaction, &receipt).unwrap();
        let hash = row.transaction_hash.clone();
        let transfer = TokenTransferRow {
            chain_id: ChainId::new(1000),
            transaction_hash: hash.clone(),
            event_index: 4,
            kind: TransferKind::Transfer,
            contract_address: Address::from_trusted("0xcccc000000000000000000000000000000000002"),
            from: Address::from_trusted("0x0000000000000000000000000000000000000000"),
            to: Address::from_trusted("0xaaaa000000000000000000000000000000000001"),
            amount: "0x64".to_string(),
            block_number: BlockNumber::from_trusted(78),
            timestamp: 1_700_000_000,
        };

        write_all(
            &store,
            vec![
                Put::from_row(transaction_key(&shard, &hash), &row).unwrap(),
                Put::from_row(transaction_detail_key(&shard, &hash), &detail).unwrap(),
                Put::from_row(token_transfer_key(&shard, &hash, 4), &transfer).unwrap(),
            ],
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        let found = get_transactions(&store, &[(shard.clone(), hash.clone())])
            .await
            .unwrap();
        assert_eq!(found[&hash], row);
        assert_eq!(
            list_token_transfers(&store, &shard, &hash).await.unwrap(),
            vec![transfer]
        );

        delete_transaction(&store, &shard, &hash, RetryPolicy::default())
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }
}
