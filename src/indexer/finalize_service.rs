use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    errors::Result,
    indexer::lib::{drive_loop, Cycle, LoopConfig, Scanner},
    rpc::EthereumRpcProvider,
};

/// Walks `nextToFinalize` behind ingestion, repairing blocks that changed.
pub struct FinalizeService<T> {
    scanner: Arc<Scanner<T>>,
    config: LoopConfig,
    block_delay: i64,
    cancel: CancellationToken,
}

impl<T> FinalizeService<T>
where
    T: EthereumRpcProvider + 'static,
{
    pub const fn new(
        scanner: Arc<Scanner<T>>,
        config: LoopConfig,
        block_delay: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scanner,
            config,
            block_delay,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<()> {
        drive_loop("finalize", self.config, &self.cancel, || self.process_cycle()).await
    }

    pub async fn process_cycle(&self) -> Result<Cycle> {
        let next = self.scanner.finalizer.next_to_finalize().await?;
        if self.config.is_past_end(next) {
            return Ok(Cycle::Finished);
        }

        let outcome = self
            .scanner
            .finalizer
            .finalize_block(next, self.block_delay)
            .await?;
        match outcome.processed_block {
            Some(block_number) => {
                if outcome.reverted {
                    info!(
                        "[finalize] Block {} repaired, {} transactions reprocessed",
                        block_number,
                        outcome.processed_transactions.len()
                    );
                }
                Ok(Cycle::Processed(block_number))
            }
            None => {
                debug!("[finalize] Block {} not ready", next);
                Ok(Cycle::Idle)
            }
        }
    }
}
