use std::{future::Future, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    decoder::TokenEventDecoder,
    errors::{BlockchainError, Result},
    finalizer::Finalizer,
    gate::{ChainGate, GateConfig, DEFAULT_FORCE_PROCESSING_DELAY},
    indexer::{finalize_service::FinalizeService, ingest_service::IngestService},
    ingest::{
        BlockIngestor, FanoutConfig, FanoutConfigBuilder, FanoutReport, IngestOutcome,
        TransactionFanout, TransferPipeline,
    },
    repositories::shard_pool::{add_shard, available_shards},
    router::{self, RouterState},
    rpc::{EthereumJsonRpcClient, EthereumRpcProvider, NodeEndpoint},
    shard::{ShardDirectory, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL},
    store::{memory::MemoryStore, postgres::PgStore, PartitionedStore},
    types::{BlockNumber, ChainId, PartitionKind},
};

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Where rows are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store, lost on exit.
    Memory,
    Postgres { db_conn_string: String },
}

#[derive(Debug, Clone)]
pub struct IndexingConfig {
    pub chain_id: ChainId,
    pub node_conn_strings: Vec<String>,
    pub store: StoreBackend,
    pub start_block: BlockNumber,
    pub end_block: Option<BlockNumber>,
    pub block_delay: i64,
    pub finalize_block_delay: i64,
    pub force_processing_delay: Duration,
    pub max_retries: u8,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub rpc_timeout: u32,
    pub rpc_max_retries: u32,
    pub fanout: FanoutConfig,
    pub shard_cache_ttl: Duration,
    /// Pointers kept in the directory cache.
    pub shard_cache_capacity: usize,
    pub router_endpoint: Option<String>,
    /// Shard registered for every partition kind whose pool is still empty.
    pub bootstrap_shard: Option<u32>,
}

impl IndexingConfig {
    #[must_use]
    pub const fn builder() -> IndexingConfigBuilder {
        IndexingConfigBuilder::new()
    }

    #[must_use]
    pub const fn gate_config(&self) -> GateConfig {
        GateConfig::new(self.block_delay, self.force_processing_delay)
    }

    #[must_use]
    pub const fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            poll_interval: self.poll_interval,
            error_backoff: self.error_backoff,
            max_retries: self.max_retries,
            end_block: self.end_block,
        }
    }
}

pub struct IndexingConfigBuilder {
    chain_id: Option<ChainId>,
    node_conn_strings: Vec<String>,
    store: StoreBackend,
    start_block: i64,
    end_block: Option<i64>,
    block_delay: i64,
    finalize_block_delay: i64,
    force_processing_delay: Duration,
    max_retries: u8,
    poll_interval: Duration,
    error_backoff: Duration,
    rpc_timeout: u32,
    rpc_max_retries: u32,
    fanout: FanoutConfigBuilder,
    shard_cache_ttl: Duration,
    shard_cache_capacity: usize,
    router_endpoint: Option<String>,
    bootstrap_shard: Option<u32>,
}

impl IndexingConfigBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chain_id: None,
            node_conn_strings: Vec::new(),
            store: StoreBackend::Memory,
            start_block: 0,
            end_block: None,
            block_delay: 0,
            finalize_block_delay: 0,
            force_processing_delay: DEFAULT_FORCE_PROCESSING_DELAY,
            max_retries: 10,
            poll_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(1),
            rpc_timeout: 300,
            rpc_max_retries: 5,
            fanout: FanoutConfigBuilder::new(),
            shard_cache_ttl: DEFAULT_CACHE_TTL,
            shard_cache_capacity: DEFAULT_CACHE_CAPACITY,
            router_endpoint: None,
            bootstrap_shard: None,
        }
    }

    #[must_use]
    pub const fn development() -> Self {
        Self::new()
            .max_retries(3)
            .poll_interval(Duration::from_secs(5))
            .rpc_timeout(60)
            .rpc_max_retries(3)
            .fanout(FanoutConfigBuilder::conservative())
    }

    #[must_use]
    pub const fn testing() -> Self {
        Self::new()
            .max_retries(1)
            .poll_interval(Duration::from_millis(20))
            .error_backoff(Duration::from_millis(10))
            .rpc_timeout(30)
            .rpc_max_retries(1)
            .fanout(FanoutConfigBuilder::testing())
    }

    #[must_use]
    pub const fn production() -> Self {
        Self::new()
            .max_retries(10)
            .poll_interval(Duration::from_secs(10))
            .rpc_timeout(300)
            .rpc_max_retries(5)
            .block_delay(2)
            .finalize_block_delay(12)
            .fanout(FanoutConfigBuilder::high_throughput())
    }

    #[must_use]
    pub const fn chain_id(mut self, chain_id: ChainId) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    #[must_use]
    pub fn node_conn_strings<I, S>(mut self, node_conn_strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_conn_strings = node_conn_strings.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn postgres<S: Into<String>>(mut self, db_conn_string: S) -> Self {
        self.store = StoreBackend::Postgres {
            db_conn_string: db_conn_string.into(),
        };
        self
    }

    #[must_use]
    pub fn memory_store(mut self) -> Self {
        self.store = StoreBackend::Memory;
        self
    }

    #[must_use]
    pub const fn start_block(mut self, start_block: i64) -> Self {
        self.start_block = start_block;
        self
    }

    #[must_use]
    pub const fn end_block(mut self, end_block: i64) -> Self {
        self.end_block = Some(end_block);
        self
    }

    #[must_use]
    pub const fn block_delay(mut self, block_delay: i64) -> Self {
        self.block_delay = block_delay;
        self
    }

    #[must_use]
    pub const fn finalize_block_delay(mut self, finalize_block_delay: i64) -> Self {
        self.finalize_block_delay = finalize_block_delay;
        self
    }

    #[must_use]
    pub const fn force_processing_delay(mut self, delay: Duration) -> Self {
        self.force_processing_delay = delay;
        self
    }

    #[must_use]
    pub const fn max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    #[must_use]
    pub const fn rpc_timeout(mut self, rpc_timeout: u32) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    #[must_use]
    pub const fn rpc_max_retries(mut self, rpc_max_retries: u32) -> Self {
        self.rpc_max_retries = rpc_max_retries;
        self
    }

    #[must_use]
    pub const fn fanout(mut self, fanout: FanoutConfigBuilder) -> Self {
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub const fn shard_cache_ttl(mut self, ttl: Duration) -> Self {
        self.shard_cache_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn shard_cache_capacity(mut self, capacity: usize) -> Self {
        self.shard_cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn router_endpoint<S: Into<String>>(mut self, router_endpoint: S) -> Self {
        self.router_endpoint = Some(router_endpoint.into());
        self
    }

    #[must_use]
    pub const fn bootstrap_shard(mut self, shard_number: u32) -> Self {
        self.bootstrap_shard = Some(shard_number);
        self
    }

    pub fn build(self) -> Result<IndexingConfig> {
        let chain_id = self
            .chain_id
            .ok_or_else(|| BlockchainError::configuration("chain_id", "Chain id is required"))?;

        if self.node_conn_strings.is_empty()
            || self.node_conn_strings.iter().any(|url| url.trim().is_empty())
        {
            return Err(BlockchainError::configuration(
                "node_conn_strings",
                "At least one node connection string is required",
            ));
        }

        if let StoreBackend::Postgres { db_conn_string } = &self.store {
            if db_conn_string.trim().is_empty() {
                return Err(BlockchainError::configuration(
                    "db_conn_string",
                    "Database connection string is required",
                ));
            }
        }

        let start_block = BlockNumber::new(self.start_block).map_err(|e| {
            BlockchainError::configuration("start_block", e.to_string())
        })?;

        let end_block = match self.end_block {
            Some(end) if end < self.start_block => {
                return Err(BlockchainError::configuration(
                    "end_block",
                    format!("End block {end} is before start block {}", self.start_block),
                ));
            }
            Some(end) => Some(BlockNumber::from_trusted(end)),
            None => None,
        };

        if self.max_retries == 0 {
            return Err(BlockchainError::configuration(
                "max_retries",
                "Max retries must be greater than 0",
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(BlockchainError::configuration(
                "poll_interval",
                "Poll interval must be greater than 0",
            ));
        }

        if self.shard_cache_capacity == 0 {
            return Err(BlockchainError::configuration(
                "shard_cache_capacity",
                "Shard cache capacity must be greater than 0",
            ));
        }

        if self.rpc_timeout == 0 {
            return Err(BlockchainError::configuration(
                "rpc_timeout",
                "RPC timeout must be greater than 0",
            ));
        }

        Ok(IndexingConfig {
            chain_id,
            node_conn_strings: self.node_conn_strings,
            store: self.store,
            start_block,
            end_block,
            block_delay: self.block_delay,
            finalize_block_delay: self.finalize_block_delay,
            force_processing_delay: self.force_processing_delay,
            max_retries: self.max_retries,
            poll_interval: self.poll_interval,
            error_backoff: self.error_backoff,
            rpc_timeout: self.rpc_timeout,
            rpc_max_retries: self.rpc_max_retries,
            fanout: self.fanout.build()?,
            shard_cache_ttl: self.shard_cache_ttl,
            shard_cache_capacity: self.shard_cache_capacity,
            router_endpoint: self.router_endpoint,
            bootstrap_shard: self.bootstrap_shard,
        })
    }
}

impl Default for IndexingConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pacing shared by the driving loops.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    /// Consecutive non-transient failures tolerated before the loop gives up.
    pub max_retries: u8,
    pub end_block: Option<BlockNumber>,
}

impl LoopConfig {
    fn backoff(&self, failures: u32) -> Duration {
        self.error_backoff
            .saturating_mul(2_u32.saturating_pow(failures.saturating_sub(1)))
            .min(MAX_ERROR_BACKOFF)
    }

    /// Whether `next` lies past the configured end block.
    #[must_use]
    pub fn is_past_end(&self, next: BlockNumber) -> bool {
        self.end_block.is_some_and(|end| next > end)
    }
}

/// Result of one pass of a driving loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Processed(BlockNumber),
    /// Nothing to do yet; wait a poll interval.
    Idle,
    /// The end block was passed.
    Finished,
}

/// Runs `cycle` until it reports [`Cycle::Finished`] or `cancel` fires.
///
/// Cancellation is only observed between cycles and while waiting, so a started
/// block always runs to completion.
pub async fn drive_loop<F, Fut>(
    component: &str,
    config: LoopConfig,
    cancel: &CancellationToken,
    mut cycle: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Cycle>>,
{
    let mut failures: u32 = 0;
    while !cancel.is_cancelled() {
        match cycle().await {
            Ok(Cycle::Processed(_)) => failures = 0,
            Ok(Cycle::Idle) => {
                failures = 0;
                pause(cancel, config.poll_interval).await;
            }
            Ok(Cycle::Finished) => {
                info!("[{}] Reached end block, stopping", component);
                return Ok(());
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                if !e.is_transient() && failures >= u32::from(config.max_retries) {
                    error!(
                        "[{}] Giving up after {} consecutive failures: {}",
                        component, failures, e
                    );
                    return Err(e);
                }
                let backoff = config.backoff(failures);
                warn!(
                    "[{}] Cycle failed (attempt {}), retrying in {:?}: {}",
                    component, failures, backoff, e
                );
                pause(cancel, backoff).await;
            }
        }
    }

    info!("[{}] Process terminating.", component);
    Ok(())
}

async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(duration) => {}
    }
}

/// What one ingestion step did: the block itself and its transaction fan-out.
pub struct IngestReport<T> {
    pub outcome: IngestOutcome<T>,
    pub fanout: FanoutReport,
}

/// The wired-up ingestion core for one chain.
pub struct Scanner<T> {
    pub directory: Arc<ShardDirectory>,
    pub ingestor: Arc<BlockIngestor<T>>,
    pub fanout: TransactionFanout,
    pub finalizer: Finalizer<T>,
}

impl<T> Scanner<T>
where
    T: EthereumRpcProvider + 'static,
{
    pub fn new(
        config: &IndexingConfig,
        store: Arc<dyn PartitionedStore>,
        endpoints: Vec<NodeEndpoint<T>>,
    ) -> Result<Self> {
        let policy = config.fanout.write_policy;
        let directory = Arc::new(
            ShardDirectory::new(store, config.shard_cache_ttl)
                .with_cache_capacity(config.shard_cache_capacity)
                .with_retry_policy(policy),
        );
        let gate = Arc::new(ChainGate::new(endpoints, config.gate_config())?);
        let ingestor = Arc::new(
            BlockIngestor::new(config.chain_id, config.start_block, gate, directory.clone())
                .with_retry_policy(policy),
        );
        let transfers = Arc::new(TransferPipeline::new(
            directory.clone(),
            Arc::new(TokenEventDecoder::new()),
            policy,
        ));
        let fanout = TransactionFanout::new(config.chain_id, directory.clone(), transfers, config.fanout);
        let finalizer = Finalizer::new(ingestor.clone(), fanout.clone()).with_retry_policy(policy);

        Ok(Self {
            directory,
            ingestor,
            fanout,
            finalizer,
        })
    }

    /// Ingests one block and fans out its transactions.
    ///
    /// Fan-out runs even when the header rows were already current, which completes
    /// a block whose transactions were interrupted earlier.
    pub async fn ingest(&self, block_number: Option<BlockNumber>) -> Result<IngestReport<T>> {
        let outcome = self.ingestor.ingest_block(block_number, false).await?;
        let fanout = match (&outcome.raw_block, &outcome.block_shard) {
            (Some(block), Some(shard)) => {
                self.fanout
                    .process_block(block, shard, &outcome.nodes_with_block)
                    .await?
            }
            _ => FanoutReport::default(),
        };
        if !fanout.dirty.is_empty() {
            warn!(
                "[ingest] Block {:?} left {} dirty transactions for the finalizer",
                outcome.processed_block,
                fanout.dirty.len()
            );
        }
        Ok(IngestReport { outcome, fanout })
    }
}

/// Opens the configured store and applies the schema.
pub async fn open_store(config: &IndexingConfig) -> Result<Arc<dyn PartitionedStore>> {
    match &config.store {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres { db_conn_string } => {
            info!("Connecting to DB");
            let store = PgStore::new(db_conn_string).await?;
            info!("Run migrations");
            store.run_migrations().await?;
            Ok(store)
        }
    }
}

/// Registers `config.bootstrap_shard` for every kind that has no available shard.
pub async fn bootstrap_shards(store: &dyn PartitionedStore, config: &IndexingConfig) -> Result<()> {
    let Some(shard_number) = config.bootstrap_shard else {
        return Ok(());
    };
    for kind in PartitionKind::ALL {
        if available_shards(store, kind, config.chain_id).await?.is_empty() {
            add_shard(store, kind, config.chain_id, shard_number, false).await?;
            info!(
                "[shard] Bootstrapped {} shard {}_{}",
                kind, config.chain_id, shard_number
            );
        }
    }
    Ok(())
}

/// JSON-RPC clients for every configured node.
#[must_use]
pub fn json_rpc_endpoints(config: &IndexingConfig) -> Vec<NodeEndpoint<EthereumJsonRpcClient>> {
    config
        .node_conn_strings
        .iter()
        .map(|url| {
            let client = EthereumJsonRpcClient::new(url.clone(), config.rpc_max_retries)
                .with_timeout(Duration::from_secs(config.rpc_timeout.into()));
            NodeEndpoint::new(url.clone(), Arc::new(client))
        })
        .collect()
}

pub async fn start_indexing_services(
    indexing_config: IndexingConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let store = open_store(&indexing_config).await?;
    bootstrap_shards(store.as_ref(), &indexing_config).await?;

    let endpoints = json_rpc_endpoints(&indexing_config);
    let scanner = Arc::new(Scanner::new(&indexing_config, store.clone(), endpoints)?);

    info!("Starting Indexer");
    run_services(&indexing_config, store, scanner, cancel).await
}

/// Runs the router, the ingestion loop and the finalization loop until both loops
/// stop. A loop that fails cancels the others.
pub async fn run_services<T>(
    indexing_config: &IndexingConfig,
    store: Arc<dyn PartitionedStore>,
    scanner: Arc<Scanner<T>>,
    cancel: CancellationToken,
) -> Result<()>
where
    T: EthereumRpcProvider + 'static,
{
    let router_handle = indexing_config.router_endpoint.clone().map(|endpoint| {
        spawn_router_service(
            endpoint,
            RouterState::new(store, scanner.directory.clone()),
            cancel.clone(),
        )
    });

    let loop_config = indexing_config.loop_config();
    let ingest_service = IngestService::new(scanner.clone(), loop_config, cancel.clone());
    let finalize_service = FinalizeService::new(
        scanner,
        loop_config,
        indexing_config.finalize_block_delay,
        cancel.clone(),
    );

    let ingest_handle = spawn_service("ingest", cancel.clone(), async move {
        ingest_service.run().await
    });
    let finalize_handle = spawn_service("finalize", cancel.clone(), async move {
        finalize_service.run().await
    });

    let result = wait_for_thread_completion(vec![ingest_handle, finalize_handle]).await;

    // Bounded runs end here; stop the router too.
    cancel.cancel();
    if let Some(handle) = router_handle {
        wait_for_thread_completion(vec![handle]).await?;
    }

    result
}

fn spawn_service<F>(component: &'static str, cancel: CancellationToken, service: F) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        info!("Starting {} service", component);
        let result = service.await;
        if let Err(e) = &result {
            error!("[{}] unexpected error {}", component, e);
            cancel.cancel();
        }
        result
    })
}

fn spawn_router_service(
    endpoint: String,
    state: RouterState,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        if let Err(e) = router::initialize_router(&endpoint, state, cancel).await {
            error!("[router] unexpected error {}", e);
        }
        info!("[router] shutting down");
        Ok(())
    })
}

/// Waits for every handle; returns the first error after all have finished.
async fn wait_for_thread_completion(handles: Vec<JoinHandle<Result<()>>>) -> Result<()> {
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {
                info!("Thread completed successfully");
            }
            Ok(Err(e)) => {
                error!("Thread completed with an error: {:?}", e);
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!("Thread panicked: {:?}", e);
                first_error.get_or_insert(BlockchainError::internal(format!("Task failed: {e}")));
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{
        test_utils::{scenario_chain, ScriptedChain, SCENARIO_ENDPOINT, SCENARIO_TX_HASH},
        types::{LogicalKey, ShardIdentifier},
    };

    fn base_builder() -> IndexingConfigBuilder {
        IndexingConfigBuilder::testing()
            .chain_id(ChainId::new(1000))
            .node_conn_strings([SCENARIO_ENDPOINT])
    }

    #[test]
    fn test_builder_requires_chain_id() {
        let err = IndexingConfigBuilder::testing()
            .node_conn_strings(["http://localhost:8545"])
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::ConfigurationError { ref parameter, .. } if parameter == "chain_id"
        ));
    }

    #[test]
    fn test_builder_requires_nodes() {
        let err = IndexingConfigBuilder::testing()
            .chain_id(ChainId::new(1))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::ConfigurationError { ref parameter, .. } if parameter == "node_conn_strings"
        ));
    }

    #[test]
    fn test_builder_rejects_end_before_start() {
        assert!(base_builder().start_block(10).end_block(5).build().is_err());
        assert!(base_builder().start_block(-1).build().is_err());
        assert!(base_builder().postgres("  ").build().is_err());
        assert!(base_builder().shard_cache_capacity(0).build().is_err());
    }

    #[test]
    fn test_presets_build() {
        for builder in [
            IndexingConfigBuilder::development(),
            IndexingConfigBuilder::testing(),
            IndexingConfigBuilder::production(),
        ] {
            let config = builder
                .chain_id(ChainId::new(1))
                .node_conn_strings(["http://a", "http://b"])
                .build()
                .unwrap();
            assert_eq!(config.node_conn_strings.len(), 2);
            assert_eq!(config.fanout.min_batch_size, 10);
            assert_eq!(config.fanout.max_batch_size, 60);
        }
    }

    #[test]
    fn test_negative_block_delay_is_clamped_in_gate_config() {
        let config = base_builder().block_delay(-1).build().unwrap();
        assert_eq!(config.gate_config().block_delay, 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = LoopConfig {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            max_retries: 3,
            end_block: None,
        };
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(40), MAX_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_drive_loop_gives_up_on_permanent_errors() {
        let config = base_builder().max_retries(2).build().unwrap().loop_config();
        let calls = AtomicU32::new(0);
        let result = drive_loop("test", config, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<Cycle, _>(BlockchainError::internal("broken")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drive_loop_retries_transient_errors() {
        let config = base_builder().max_retries(1).build().unwrap().loop_config();
        let calls = AtomicU32::new(0);
        let result = drive_loop("test", config, &CancellationToken::new(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(BlockchainError::rpc_connection("reset"))
                } else {
                    Ok(Cycle::Finished)
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_drive_loop_stops_when_cancelled() {
        let config = base_builder().build().unwrap().loop_config();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result = drive_loop("test", config, &cancel, || {
            trigger.cancel();
            async { Ok(Cycle::Idle) }
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_fills_only_empty_pools() {
        let store = MemoryStore::new();
        let config = base_builder().bootstrap_shard(1).build().unwrap();
        add_shard(&store, PartitionKind::Block, config.chain_id, 7, false)
            .await
            .unwrap();

        bootstrap_shards(&store, &config).await.unwrap();
        bootstrap_shards(&store, &config).await.unwrap();

        let blocks = available_shards(&store, PartitionKind::Block, config.chain_id)
            .await
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].shard_number, 7);
        let transactions = available_shards(&store, PartitionKind::Transaction, config.chain_id)
            .await
            .unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].shard_number, 1);
    }

    #[tokio::test]
    async fn test_bounded_run_ingests_and_finalizes_range() {
        let config = base_builder()
            .start_block(76)
            .end_block(79)
            .bootstrap_shard(1)
            .build()
            .unwrap();
        let store = open_store(&config).await.unwrap();
        bootstrap_shards(store.as_ref(), &config).await.unwrap();

        let chain = Arc::new(scenario_chain().await);
        let scanner = Arc::new(
            Scanner::new(
                &config,
                store.clone(),
                vec![NodeEndpoint::new(SCENARIO_ENDPOINT, chain)],
            )
            .unwrap(),
        );

        run_services(&config, store, scanner.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(scanner.ingestor.next_to_ingest().await.unwrap().value(), 80);
        assert_eq!(scanner.finalizer.next_to_finalize().await.unwrap().value(), 80);

        let key = LogicalKey::transaction(
            config.chain_id,
            SCENARIO_TX_HASH.parse().unwrap(),
        );
        let resolved = scanner
            .directory
            .resolve(PartitionKind::Transaction, std::slice::from_ref(&key))
            .await
            .unwrap();
        assert_eq!(resolved.get(&key), Some(&ShardIdentifier::new(config.chain_id, 1)));
    }

    #[tokio::test]
    async fn test_cancelled_run_exits_cleanly() {
        let config = base_builder().bootstrap_shard(1).build().unwrap();
        let store = open_store(&config).await.unwrap();
        bootstrap_shards(store.as_ref(), &config).await.unwrap();
        let chain = Arc::new(ScriptedChain::with_blocks(1000, 0..=3));
        let scanner = Arc::new(
            Scanner::new(&config, store.clone(), vec![NodeEndpoint::new(SCENARIO_ENDPOINT, chain)])
                .unwrap(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        run_services(&config, store, scanner.clone(), cancel).await.unwrap();
        // Every block that was started was finished.
        let next = scanner.ingestor.next_to_ingest().await.unwrap().value();
        assert_eq!(next, 4);
    }
}
