use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    errors::Result,
    indexer::lib::{drive_loop, Cycle, LoopConfig, Scanner},
    rpc::EthereumRpcProvider,
    types::BlockNumber,
};

/// Ingests blocks in increasing order, one at a time, starting at the chain
/// cursor's `nextToIngest`.
///
/// The service keeps the block it is working on and only moves past it once the
/// block and its fan-out went through, so a failed cycle retries the same number.
pub struct IngestService<T> {
    scanner: Arc<Scanner<T>>,
    config: LoopConfig,
    cancel: CancellationToken,
    /// `None` until the first cycle resumes from the store.
    current: Mutex<Option<BlockNumber>>,
}

impl<T> IngestService<T>
where
    T: EthereumRpcProvider + 'static,
{
    pub fn new(scanner: Arc<Scanner<T>>, config: LoopConfig, cancel: CancellationToken) -> Self {
        Self {
            scanner,
            config,
            cancel,
            current: Mutex::new(None),
        }
    }

    pub async fn run(&self) -> Result<()> {
        drive_loop("ingest", self.config, &self.cancel, || self.process_cycle()).await
    }

    /// Ingests the next block if the chain allows it.
    pub async fn process_cycle(&self) -> Result<Cycle> {
        let current = *self.current.lock();
        let next = match current {
            Some(number) => number,
            None => {
                let resumed = self.scanner.ingestor.resume_point().await?;
                *self.current.lock() = Some(resumed);
                resumed
            }
        };
        if self.config.is_past_end(next) {
            return Ok(Cycle::Finished);
        }

        let report = self.scanner.ingest(Some(next)).await?;
        match report.outcome.processed_block {
            Some(block_number) => {
                *self.current.lock() = Some(block_number + 1);
                info!(
                    "[ingest] Block {} ingested, {} transactions stored, {} dirty",
                    block_number,
                    report.fanout.processed.len(),
                    report.fanout.dirty.len()
                );
                Ok(Cycle::Processed(block_number))
            }
            None => {
                debug!("[ingest] Waiting for block {}", next);
                Ok(Cycle::Idle)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        indexer::lib::IndexingConfigBuilder,
        repositories::block::get_block_header,
        rpc::NodeEndpoint,
        store::memory::MemoryStore,
        test_utils::{test_store, ScriptedChain, SCENARIO_ENDPOINT},
        types::{ChainId, LogicalKey, ShardIdentifier},
    };

    const CHAIN: ChainId = ChainId::new(1000);

    async fn service_with_store(
        chain: Arc<ScriptedChain>,
        end_block: Option<i64>,
    ) -> (Arc<MemoryStore>, IngestService<ScriptedChain>) {
        let mut builder = IndexingConfigBuilder::testing()
            .chain_id(CHAIN)
            .node_conn_strings([SCENARIO_ENDPOINT])
            .start_block(1);
        if let Some(end) = end_block {
            builder = builder.end_block(end);
        }
        let config = builder.build().unwrap();
        let store = test_store(CHAIN, &[1]).await;
        let scanner = Scanner::new(
            &config,
            store.clone(),
            vec![NodeEndpoint::new(SCENARIO_ENDPOINT, chain)],
        )
        .unwrap();
        let service = IngestService::new(Arc::new(scanner), config.loop_config(), CancellationToken::new());
        (store, service)
    }

    async fn service(chain: Arc<ScriptedChain>, end_block: Option<i64>) -> IngestService<ScriptedChain> {
        service_with_store(chain, end_block).await.1
    }

    fn block(n: i64) -> BlockNumber {
        BlockNumber::from_trusted(n)
    }

    /// Partition holding a block's header and detail rows.
    fn header_partition(n: i64) -> String {
        LogicalKey::block(CHAIN, block(n)).to_string()
    }

    #[tokio::test]
    async fn test_cycle_processes_blocks_in_order_then_idles() {
        let chain = Arc::new(ScriptedChain::with_blocks(1000, 0..=2));
        let service = service(chain.clone(), None).await;

        assert_eq!(service.process_cycle().await.unwrap(), Cycle::Processed(block(1)));
        assert_eq!(service.process_cycle().await.unwrap(), Cycle::Processed(block(2)));
        assert_eq!(service.process_cycle().await.unwrap(), Cycle::Idle);
    }

    #[tokio::test]
    async fn test_cycle_finishes_after_end_block() {
        let chain = Arc::new(ScriptedChain::with_blocks(1000, 0..=5));
        let service = service(chain, Some(1)).await;

        assert_eq!(service.process_cycle().await.unwrap(), Cycle::Processed(block(1)));
        assert_eq!(service.process_cycle().await.unwrap(), Cycle::Finished);
        service.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_node_does_not_advance() {
        let chain = Arc::new(ScriptedChain::with_blocks(1000, 0..=5));
        let service = service(chain.clone(), None).await;
        chain.set_offline(true);

        assert!(service.process_cycle().await.is_err());
        chain.set_offline(false);
        assert_eq!(service.process_cycle().await.unwrap(), Cycle::Processed(block(1)));
    }

    #[tokio::test]
    async fn test_failed_header_write_retries_same_block() {
        let chain = Arc::new(ScriptedChain::with_blocks(1000, 0..=5));
        let (store, service) = service_with_store(chain, None).await;
        let partition = header_partition(1);

        store.reject_writes(partition.clone()).await;
        let err = service.process_cycle().await.unwrap_err();
        assert!(err.is_transient());

        store.accept_writes(&partition).await;
        assert_eq!(service.process_cycle().await.unwrap(), Cycle::Processed(block(1)));
        assert_eq!(service.process_cycle().await.unwrap(), Cycle::Processed(block(2)));

        let header = get_block_header(store.as_ref(), &ShardIdentifier::new(CHAIN, 1), CHAIN, block(1))
            .await
            .unwrap();
        assert!(header.is_some());
    }

    #[tokio::test]
    async fn test_restart_resumes_at_block_without_header() {
        let chain = Arc::new(ScriptedChain::with_blocks(1000, 0..=5));
        let (store, first_run) = service_with_store(chain.clone(), None).await;
        let partition = header_partition(2);

        assert_eq!(first_run.process_cycle().await.unwrap(), Cycle::Processed(block(1)));
        store.reject_writes(partition.clone()).await;
        assert!(first_run.process_cycle().await.is_err());
        store.accept_writes(&partition).await;

        // A new service over the same store, as after a process restart.
        let config = IndexingConfigBuilder::testing()
            .chain_id(CHAIN)
            .node_conn_strings([SCENARIO_ENDPOINT])
            .start_block(1)
            .build()
            .unwrap();
        let scanner = Scanner::new(&config, store.clone(), vec![NodeEndpoint::new(SCENARIO_ENDPOINT, chain)]).unwrap();
        let second_run = IngestService::new(Arc::new(scanner), config.loop_config(), CancellationToken::new());

        assert_eq!(second_run.process_cycle().await.unwrap(), Cycle::Processed(block(2)));
    }
}
