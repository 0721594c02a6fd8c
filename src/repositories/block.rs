use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    errors::Result,
    rpc::RpcBlock,
    store::{
        delete_all, from_item, get_all, query_all, write_all, ItemKey, PartitionedStore, Put,
        QueryRequest, RetryPolicy,
    },
    types::{BlockNumber, ChainId, LogicalKey, ParsingStatus, ShardIdentifier, TransactionHash},
    utils::convert_hex_string_to_i64,
};

pub const BLOCKS_TABLE: &str = "blocks";
pub const BLOCK_DETAILS_TABLE: &str = "block_details";
pub const BLOCK_TRANSACTIONS_TABLE: &str = "block_transactions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderRow {
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub block_hash: String,
    pub gas_used: i64,
    pub size: Option<i64>,
    pub timestamp: i64,
    pub transaction_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDetailRow {
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub parent_hash: String,
    pub gas_limit: Option<String>,
    pub difficulty: Option<String>,
    pub total_difficulty: Option<String>,
    pub miner: Option<String>,
    pub nonce: Option<String>,
    pub state_root: Option<String>,
    pub receipts_root: Option<String>,
    pub transactions_root: Option<String>,
    pub sha3_uncles: Option<String>,
    pub extra_data: Option<String>,
}

/// Per-block index of the transactions ingestion wrote, ordered by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransactionRow {
    pub transaction_hash: TransactionHash,
    pub transaction_index: i64,
    pub timestamp: i64,
    pub events_parsing_status: ParsingStatus,
    pub updated_at: DateTime<Utc>,
}

fn block_partition(chain_id: ChainId, block_number: BlockNumber) -> String {
    LogicalKey::block(chain_id, block_number).to_string()
}

#[must_use]
pub fn header_key(shard: &ShardIdentifier, chain_id: ChainId, block_number: BlockNumber) -> ItemKey {
    ItemKey::single(shard.table(BLOCKS_TABLE), block_partition(chain_id, block_number))
}

#[must_use]
pub fn detail_key(shard: &ShardIdentifier, chain_id: ChainId, block_number: BlockNumber) -> ItemKey {
    ItemKey::single(
        shard.table(BLOCK_DETAILS_TABLE),
        block_partition(chain_id, block_number),
    )
}

#[must_use]
pub fn block_transaction_key(
    shard: &ShardIdentifier,
    chain_id: ChainId,
    block_number: BlockNumber,
    transaction_index: i64,
) -> ItemKey {
    ItemKey::new(
        shard.table(BLOCK_TRANSACTIONS_TABLE),
        block_partition(chain_id, block_number),
        format!("{transaction_index:06}"),
    )
}

/// Builds the header and detail rows persisted for `block`.
pub fn block_rows(chain_id: ChainId, block: &RpcBlock) -> Result<(BlockHeaderRow, BlockDetailRow)> {
    let block_number = block.block_number()?;
    let header = BlockHeaderRow {
        chain_id,
        block_number,
        block_hash: block.hash.to_ascii_lowercase(),
        gas_used: convert_hex_string_to_i64(&block.gas_used)?,
        size: block
            .size
            .as_deref()
            .map(convert_hex_string_to_i64)
            .transpose()?,
        timestamp: block.timestamp_secs()?,
        transaction_count: i64::try_from(block.transactions.len()).unwrap_or(i64::MAX),
    };
    let detail = BlockDetailRow {
        chain_id,
        block_number,
        parent_hash: block.parent_hash.to_ascii_lowercase(),
        gas_limit: block.gas_limit.clone(),
        difficulty: block.difficulty.clone(),
        total_difficulty: block.total_difficulty.clone(),
        miner: block.miner.clone(),
        nonce: block.nonce.clone(),
        state_root: block.state_root.clone(),
        receipts_root: block.receipts_root.clone(),
        transactions_root: block.transactions_root.clone(),
        sha3_uncles: block.sha3_uncles.clone(),
        extra_data: block.extra_data.clone(),
    };
    Ok((header, detail))
}

/// Writes (or overwrites) the header and detail rows of a block.
pub async fn write_block(
    store: &dyn PartitionedStore,
    shard: &ShardIdentifier,
    header: &BlockHeaderRow,
    detail: &BlockDetailRow,
    policy: RetryPolicy,
) -> Result<()> {
    let puts = vec![
        Put::from_row(header_key(shard, header.chain_id, header.block_number), header)?,
        Put::from_row(detail_key(shard, detail.chain_id, detail.block_number), detail)?,
    ];
    write_all(store, puts, policy).await
}

pub async fn get_block_header(
    store: &dyn PartitionedStore,
    shard: &ShardIdentifier,
    chain_id: ChainId,
    block_number: BlockNumber,
) -> Result<Option<BlockHeaderRow>> {
    let key = header_key(shard, chain_id, block_number);
    get_all(store, std::slice::from_ref(&key), RetryPolicy::default())
        .await?
        .remove(&key)
        .map(from_item)
        .transpose()
}

pub async fn list_block_transactions(
    store: &dyn PartitionedStore,
    shard: &ShardIdentifier,
    chain_id: ChainId,
    block_number: BlockNumber,
) -> Result<Vec<BlockTransactionRow>> {
    query_all(
        store,
        QueryRequest::partition(
            shard.table(BLOCK_TRANSACTIONS_TABLE),
            block_partition(chain_id, block_number),
        ),
    )
    .await?
    .into_iter()
    .map(|(_, item)| from_item(item))
    .collect()
}

/// Removes header, detail and every transaction index row of the block.
pub async fn delete_block(
    store: &dyn PartitionedStore,
    shard: &ShardIdentifier,
    chain_id: ChainId,
    block_number: BlockNumber,
    policy: RetryPolicy,
) -> Result<()> {
    let mut keys = vec![
        header_key(shard, chain_id, block_number),
        detail_key(shard, chain_id, block_number),
    ];
    keys.extend(
        list_block_transactions(store, shard, chain_id, block_number)
            .await?
            .iter()
            .map(|row| block_transaction_key(shard, chain_id, block_number, row.transaction_index)),
    );
    delete_all(store, keys, policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rpc::BlockTransaction, store::memory::MemoryStore};

    fn sample_block() -> RpcBlock {
        serde_json::from_value(serde_json::json!({
            "number": "0x4e",
            "hash": "0xAB00000000000000000000000000000000000000000000000000000000000001",
            "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000077",
            "timestamp": "0x64",
            "gasUsed": "0x5208",
            "size": "0x2a0",
            "miner": "0x0000000000000000000000000000000000000001",
            "transactions": []
        }))
        .unwrap()
    }

    #[test]
    fn test_block_rows_from_rpc_block() {
        let mut block = sample_block();
        block
            .transactions
            .push(BlockTransaction::Hash("0x01".to_string()));
        let (header, detail) = block_rows(ChainId::new(1000), &block).unwrap();

        assert_eq!(header.block_number, BlockNumber::from_trusted(78));
        assert_eq!(
            header.block_hash,
            "0xab00000000000000000000000000000000000000000000000000000000000001"
        );
        assert_eq!(header.gas_used, 21000);
        assert_eq!(header.size, Some(672));
        assert_eq!(header.timestamp, 100);
        assert_eq!(header.transaction_count, 1);
        assert_eq!(detail.miner.as_deref(), Some("0x0000000000000000000000000000000000000001"));
    }

    #[tokio::test]
    async fn test_write_read_and_delete_block() {
        let store = MemoryStore::new();
        let chain = ChainId::new(1000);
        let shard = ShardIdentifier::new(chain, 1);
        let number = BlockNumber::from_trusted(78);
        let (header, detail) = block_rows(chain, &sample_block()).unwrap();

        write_block(&store, &shard, &header, &detail, RetryPolicy::default())
            .await
            .unwrap();
        let index_row = BlockTransactionRow {
            transaction_hash: TransactionHash::from_trusted("0xaa"),
            transaction_index: 0,
            timestamp: 100,
            events_parsing_status: ParsingStatus::Complete,
            updated_at: Utc::now(),
        };
        write_all(
            &store,
            vec![Put::from_row(block_transaction_key(&shard, chain, number, 0), &index_row).unwrap()],
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        let read = get_block_header(&store, &shard, chain, number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, header);
        assert_eq!(store.count_in_tables("blocks_1000_1").await, 1);

        let listed = list_block_transactions(&store, &shard, chain, number)
            .await
            .unwrap();
        assert_eq!(listed, vec![index_row]);

        delete_block(&store, &shard, chain, number, RetryPolicy::default())
            .await
            .unwrap();
        assert!(store.is_empty().await);

        // Deleting again is a no-op.
        delete_block(&store, &shard, chain, number, RetryPolicy::default())
            .await
            .unwrap();
    }
}
