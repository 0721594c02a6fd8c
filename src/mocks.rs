//! # Mock Implementations for Testing
//!
//! - [`MockEthereumRpcProvider`] - mockall implementation of [`crate::rpc::EthereumRpcProvider`]

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(dead_code)]

use async_trait::async_trait;
use mockall::mock;

use crate::{
    errors::Result,
    rpc::{BlockTag, EthereumRpcProvider, RpcBlock, RpcReceipt, RpcTransaction},
    types::TransactionHash,
};

mock! {
    /// Mock of the node RPC seam. Expectations return values directly.
    ///
    /// ```rust,ignore
    /// let mut rpc = MockEthereumRpcProvider::new();
    /// rpc.expect_get_block()
    ///     .withf(|tag| *tag == BlockTag::Latest)
    ///     .returning(|_| Ok(None));
    /// ```
    pub EthereumRpcProvider {}

    #[async_trait]
    impl EthereumRpcProvider for EthereumRpcProvider {
        async fn get_block(&self, tag: BlockTag) -> Result<Option<RpcBlock>>;
        async fn get_transactions(
            &self,
            hashes: &[TransactionHash],
        ) -> Result<Vec<Option<RpcTransaction>>>;
        async fn get_transaction_receipts(
            &self,
            hashes: &[TransactionHash],
        ) -> Result<Vec<Option<RpcReceipt>>>;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        decoder::TokenEventDecoder,
        errors::BlockchainError,
        gate::{ChainGate, GateConfig},
        ingest::{FanoutConfigBuilder, TransactionFanout, TransferPipeline},
        rpc::{BlockTransaction, NodeEndpoint},
        shard::{ShardDirectory, DEFAULT_CACHE_TTL},
        store::RetryPolicy,
        test_utils::{test_store, ScriptedChain, SCENARIO_TX_HASH},
        types::{BlockNumber, ChainId, ShardIdentifier},
    };

    const CHAIN: ChainId = ChainId::new(1000);

    fn head(n: i64) -> RpcBlock {
        ScriptedChain::empty_block(n, 0)
    }

    #[tokio::test]
    async fn test_gate_reports_missing_body_as_block_not_found() {
        let mut rpc = MockEthereumRpcProvider::new();
        rpc.expect_get_block()
            .withf(|tag| *tag == BlockTag::Latest)
            .times(1)
            .returning(|_| Ok(Some(head(80))));
        rpc.expect_get_block()
            .withf(|tag| matches!(tag, BlockTag::Number(_)))
            .times(1)
            .returning(|_| Err(BlockchainError::rpc_connection("connection reset")));

        let gate = ChainGate::new(
            vec![NodeEndpoint::new("ws://mock:8546", Arc::new(rpc))],
            GateConfig::default(),
        )
        .unwrap();

        let err = gate
            .is_processable_at(BlockNumber::from_trusted(78), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BlockchainError::BlockNotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_receipt_marks_transaction_dirty() {
        let mut rpc = MockEthereumRpcProvider::new();
        rpc.expect_get_transactions().times(1).returning(|hashes| {
            Ok(hashes
                .iter()
                .map(|hash| {
                    Some(RpcTransaction {
                        hash: hash.value().to_string(),
                        block_hash: None,
                        block_number: None,
                        transaction_index: Some("0x0".to_string()),
                        from: None,
                        to: None,
                        value: "0x0".to_string(),
                        gas: "0x5208".to_string(),
                        gas_price: None,
                        input: None,
                        nonce: None,
                    })
                })
                .collect())
        });
        rpc.expect_get_transaction_receipts()
            .times(1)
            .returning(|hashes| Ok(vec![None; hashes.len()]));

        let store = test_store(CHAIN, &[1]).await;
        let directory = Arc::new(ShardDirectory::new(store.clone(), DEFAULT_CACHE_TTL));
        let transfers = Arc::new(TransferPipeline::new(
            directory.clone(),
            Arc::new(TokenEventDecoder::new()),
            RetryPolicy::default(),
        ));
        let fanout = TransactionFanout::new(
            CHAIN,
            directory,
            transfers,
            FanoutConfigBuilder::testing().build().unwrap(),
        );

        let mut block = head(78);
        block
            .transactions
            .push(BlockTransaction::Hash(SCENARIO_TX_HASH.to_string()));
        let report = fanout
            .process_block(
                &block,
                &ShardIdentifier::new(CHAIN, 1),
                &[NodeEndpoint::new("ws://mock:8546", Arc::new(rpc))],
            )
            .await
            .unwrap();

        assert!(report.processed.is_empty());
        assert_eq!(report.dirty.len(), 1);
        assert_eq!(store.count_in_tables("transactions_").await, 0);
        assert_eq!(store.count_in_tables("block_transactions_").await, 1);
    }
}
