//! # Test Utilities
//!
//! [`ScriptedChain`] is an in-process [`EthereumRpcProvider`] whose blocks,
//! transactions and receipts are set up by the test, and which can be taken
//! offline, hide blocks or reorganise a height.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::arithmetic_side_effects)]
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    decoder::TRANSFER_TOPIC,
    errors::{BlockchainError, Result},
    repositories::shard_pool::add_shard,
    rpc::{
        BlockTag, BlockTransaction, EthereumRpcProvider, RpcBlock, RpcLog, RpcReceipt,
        RpcTransaction,
    },
    store::memory::MemoryStore,
    types::{ChainId, PartitionKind, TransactionHash},
};

pub const SCENARIO_ENDPOINT: &str = "ws://node:19547";
pub const SCENARIO_TX_HASH: &str =
    "0x2fd6000000000000000000000000000000000000000000000000000000999b91";

const SENDER: &str = "0xaaaa000000000000000000000000000000000001";
const RECIPIENT: &str = "0xbbbb000000000000000000000000000000000003";

pub struct ScriptedChain {
    chain_id: u64,
    blocks: RwLock<BTreeMap<i64, RpcBlock>>,
    transactions: RwLock<HashMap<String, RpcTransaction>>,
    receipts: RwLock<HashMap<String, RpcReceipt>>,
    hidden: RwLock<HashSet<i64>>,
    offline: AtomicBool,
}

impl ScriptedChain {
    /// Empty blocks for every number in `range`, twelve seconds apart.
    pub fn with_blocks(chain_id: u64, range: RangeInclusive<i64>) -> Self {
        let blocks = range.map(|n| (n, Self::empty_block(n, 0))).collect();
        Self {
            chain_id,
            blocks: RwLock::new(blocks),
            transactions: RwLock::new(HashMap::new()),
            receipts: RwLock::new(HashMap::new()),
            hidden: RwLock::new(HashSet::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Hash of block `n`; a reorg bumps `version`.
    pub fn block_hash(n: i64, version: u8) -> String {
        format!("0x{version:02x}{n:062x}")
    }

    pub const fn timestamp_of(n: i64) -> i64 {
        1_700_000_000 + n * 12
    }

    /// Block `n` without transactions.
    pub fn empty_block(n: i64, version: u8) -> RpcBlock {
        RpcBlock {
            number: format!("{n:#x}"),
            hash: Self::block_hash(n, version),
            parent_hash: Self::block_hash(n - 1, 0),
            timestamp: format!("{:#x}", Self::timestamp_of(n)),
            transactions: Vec::new(),
            gas_used: "0x0".to_string(),
            gas_limit: Some("0x1c9c380".to_string()),
            size: Some("0x220".to_string()),
            difficulty: Some("0x0".to_string()),
            total_difficulty: None,
            miner: Some("0x0000000000000000000000000000000000000001".to_string()),
            nonce: Some("0x0000000000000000".to_string()),
            state_root: None,
            receipts_root: None,
            transactions_root: None,
            sha3_uncles: None,
            extra_data: None,
        }
    }

    /// Appends a successful value transfer to block `n`.
    pub async fn add_transaction(&self, n: i64, hash: &str) {
        let hash = hash.to_ascii_lowercase();
        let mut blocks = self.blocks.write().await;
        let block = blocks.get_mut(&n).expect("block exists");
        let position = block.transactions.len();
        block.transactions.push(BlockTransaction::Hash(hash.clone()));

        let transaction = RpcTransaction {
            hash: hash.clone(),
            block_hash: Some(block.hash.clone()),
            block_number: Some(block.number.clone()),
            transaction_index: Some(format!("{position:#x}")),
            from: Some(SENDER.to_string()),
            to: Some(RECIPIENT.to_string()),
            value: "0x1".to_string(),
            gas: "0x5208".to_string(),
            gas_price: Some("0x3b9aca00".to_string()),
            input: Some("0x".to_string()),
            nonce: Some(format!("{position:#x}")),
        };
        let receipt = RpcReceipt {
            transaction_hash: hash.clone(),
            transaction_index: Some(format!("{position:#x}")),
            status: Some("0x1".to_string()),
            gas_used: "0x5208".to_string(),
            cumulative_gas_used: Some(format!("{:#x}", 21_000 * (position + 1))),
            contract_address: None,
            logs: Vec::new(),
        };
        self.transactions.write().await.insert(hash.clone(), transaction);
        self.receipts.write().await.insert(hash, receipt);
    }

    /// Adds an ERC-20 `Transfer` log to the receipt of `hash`.
    pub async fn add_transfer_log(&self, hash: &str, contract: &str, from: &str, to: &str, amount: u64) {
        let word = |address: &str| format!("0x{:0>64}", address.trim_start_matches("0x"));
        let mut receipts = self.receipts.write().await;
        let receipt = receipts
            .get_mut(&hash.to_ascii_lowercase())
            .expect("transaction exists");
        let log_index = receipt.logs.len();
        receipt.logs.push(RpcLog {
            address: contract.to_string(),
            topics: vec![TRANSFER_TOPIC.to_string(), word(from), word(to)],
            data: format!("0x{amount:064x}"),
            log_index: Some(format!("{log_index:#x}")),
        });
    }

    /// Replaces the hash of block `n`, keeping its transactions.
    pub async fn reorg(&self, n: i64, version: u8) {
        let mut blocks = self.blocks.write().await;
        let block = blocks.get_mut(&n).expect("block exists");
        block.hash = Self::block_hash(n, version);
    }

    /// Drops `hash` from block `n`, as if it moved elsewhere after a reorg.
    pub async fn remove_transaction(&self, n: i64, hash: &str) {
        let hash = hash.to_ascii_lowercase();
        let mut blocks = self.blocks.write().await;
        let block = blocks.get_mut(&n).expect("block exists");
        block.transactions.retain(|tx| tx.hash() != hash);
    }

    /// `get_block` by number answers `None` for `n`; the head is unaffected.
    pub async fn hide_block(&self, n: i64) {
        self.hidden.write().await.insert(n);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BlockchainError::rpc_connection("scripted chain is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl EthereumRpcProvider for ScriptedChain {
    async fn get_block(&self, tag: BlockTag) -> Result<Option<RpcBlock>> {
        self.ensure_online()?;
        let blocks = self.blocks.read().await;
        match tag {
            BlockTag::Latest => Ok(blocks.values().next_back().cloned()),
            BlockTag::Number(number) => {
                if self.hidden.read().await.contains(&number.value()) {
                    return Ok(None);
                }
                Ok(blocks.get(&number.value()).cloned())
            }
        }
    }

    async fn get_transactions(
        &self,
        hashes: &[TransactionHash],
    ) -> Result<Vec<Option<RpcTransaction>>> {
        self.ensure_online()?;
        let transactions = self.transactions.read().await;
        Ok(hashes
            .iter()
            .map(|hash| transactions.get(hash.value()).cloned())
            .collect())
    }

    async fn get_transaction_receipts(
        &self,
        hashes: &[TransactionHash],
    ) -> Result<Vec<Option<RpcReceipt>>> {
        self.ensure_online()?;
        let receipts = self.receipts.read().await;
        Ok(hashes
            .iter()
            .map(|hash| receipts.get(hash.value()).cloned())
            .collect())
    }
}

/// Chain 1000 with blocks 70..=80; block 78 carries [`SCENARIO_TX_HASH`].
pub async fn scenario_chain() -> ScriptedChain {
    let chain = ScriptedChain::with_blocks(1000, 70..=80);
    chain.add_transaction(78, SCENARIO_TX_HASH).await;
    chain
}

/// A memory store whose shard pools hold `shards` for every partition kind.
pub async fn test_store(chain_id: ChainId, shards: &[u32]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for kind in PartitionKind::ALL {
        for &number in shards {
            add_shard(store.as_ref(), kind, chain_id, number, false)
                .await
                .unwrap();
        }
    }
    store
}
