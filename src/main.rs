use std::{env, sync::Arc, time::Duration};

use block_scanner::{
    indexer::lib::{
        bootstrap_shards, json_rpc_endpoints, open_store, start_indexing_services,
        IndexingConfig, IndexingConfigBuilder, Scanner,
    },
    repositories::shard_pool::{add_shard, list_shards},
    shard::ShardDirectory,
    types::{BlockNumber, ChainId, LogicalKey, PartitionKind},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(version, about = "Ingests blocks and transactions into a sharded store", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Chain to scan
    #[arg(long, env = "CHAIN_ID", global = true)]
    chain_id: Option<u64>,

    /// Node endpoints, comma separated
    #[arg(long, env = "NODE_CONNECTION_STRINGS", value_delimiter = ',', global = true)]
    node_conn_strings: Vec<String>,

    /// Store backend
    #[arg(long, value_enum, default_value_t = StoreKind::Postgres, global = true)]
    store: StoreKind,

    #[arg(long, env = "DB_CONNECTION_STRING", global = true)]
    db_conn_string: Option<String>,

    /// Configuration preset the flags are applied on top of
    #[arg(long, value_enum, default_value_t = Preset::Production, global = true)]
    preset: Preset,

    /// Shard registered for every partition kind with an empty pool
    #[arg(long, global = true)]
    bootstrap_shard: Option<u32>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Preset {
    Development,
    Testing,
    Production,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion and finalization services
    Run {
        #[arg(short, long, default_value_t = 0)]
        start: i64,

        /// Stop after this block; the process then exits 0
        #[arg(short, long = "end-block")]
        end: Option<i64>,

        /// Confirmations required before ingesting a block
        #[arg(long)]
        block_delay: Option<i64>,

        /// Confirmations required before finalizing a block
        #[arg(long)]
        finalize_block_delay: Option<i64>,

        /// Seconds after which a stalled chain head no longer holds blocks back
        #[arg(long)]
        force_processing_delay: Option<u64>,

        #[arg(long, env = "ROUTER_ENDPOINT")]
        router_endpoint: Option<String>,
    },
    /// Ingest a single block, `nextToIngest` by default
    Ingest {
        #[arg(short, long)]
        block: Option<i64>,

        #[arg(short, long, default_value_t = 0)]
        start: i64,
    },
    /// Finalize the block at `nextToFinalize`
    Finalize {
        #[arg(long, default_value_t = 0)]
        block_delay: i64,

        #[arg(short, long, default_value_t = 0)]
        start: i64,
    },
    /// Shard pool administration
    Shards {
        #[command(subcommand)]
        command: ShardsCommand,
    },
    /// Print the shard a logical key is stored in
    Resolve {
        #[arg(value_enum)]
        kind: KindArg,

        /// e.g. `1000_78` for a block, `1000_0x…` for a transaction
        key: String,
    },
}

#[derive(Subcommand)]
enum ShardsCommand {
    /// Register a shard
    Add {
        #[arg(long, value_enum)]
        kind: KindArg,

        #[arg(long)]
        number: u32,

        /// Stop assigning new keys to the other shards of this kind
        #[arg(long)]
        replace: bool,
    },
    /// List the shard pool of a kind
    List {
        #[arg(long, value_enum)]
        kind: KindArg,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Block,
    Transaction,
    EconomyAddress,
}

impl From<KindArg> for PartitionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Block => Self::Block,
            KindArg::Transaction => Self::Transaction,
            KindArg::EconomyAddress => Self::EconomyAddress,
        }
    }
}

impl ConnectionArgs {
    fn builder(&self) -> IndexingConfigBuilder {
        let mut builder = match self.preset {
            Preset::Development => IndexingConfigBuilder::development(),
            Preset::Testing => IndexingConfigBuilder::testing(),
            Preset::Production => IndexingConfigBuilder::production(),
        }
        .node_conn_strings(self.node_conn_strings.iter().map(|url| url.trim().to_string()));

        if let Some(chain_id) = self.chain_id {
            builder = builder.chain_id(ChainId::new(chain_id));
        }
        if let Some(shard) = self.bootstrap_shard {
            builder = builder.bootstrap_shard(shard);
        }
        match self.store {
            StoreKind::Memory => builder.memory_store(),
            StoreKind::Postgres => builder.postgres(self.db_conn_string.clone().unwrap_or_default()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if env::var("IS_DEV").is_ok_and(|v| v.parse().unwrap_or(false)) {
        dotenvy::dotenv()?;
    }

    // Initialize tracing subscriber
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let result = execute(cli).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            start,
            end,
            block_delay,
            finalize_block_delay,
            force_processing_delay,
            router_endpoint,
        } => {
            let mut builder = cli.connection.builder().start_block(start);
            if let Some(end) = end {
                builder = builder.end_block(end);
            }
            if let Some(delay) = block_delay {
                builder = builder.block_delay(delay);
            }
            if let Some(delay) = finalize_block_delay {
                builder = builder.finalize_block_delay(delay);
            }
            if let Some(secs) = force_processing_delay {
                builder = builder.force_processing_delay(Duration::from_secs(secs));
            }
            if let Some(endpoint) = router_endpoint {
                builder = builder.router_endpoint(endpoint);
            }
            let config = builder.build().context("Invalid configuration")?;

            let cancel = CancellationToken::new();
            setup_ctrlc_handler(cancel.clone())?;

            start_indexing_services(config, cancel).await?;
            info!("Indexer stopped");
        }
        Command::Ingest { block, start } => {
            let config = cli
                .connection
                .builder()
                .start_block(start)
                .build()
                .context("Invalid configuration")?;
            let block = block.map(BlockNumber::new).transpose()?;
            let scanner = scanner(&config).await?;

            let report = scanner.ingest(block).await?;
            match report.outcome.processed_block {
                Some(number) => info!(
                    "Block {} ingested: {} transactions stored, {} dirty, next block {}",
                    number,
                    report.fanout.processed.len(),
                    report.fanout.dirty.len(),
                    report.outcome.next_block_to_process
                ),
                None => info!(
                    "Block {} is not processable yet",
                    report.outcome.next_block_to_process
                ),
            }
        }
        Command::Finalize { block_delay, start } => {
            let config = cli
                .connection
                .builder()
                .start_block(start)
                .build()
                .context("Invalid configuration")?;
            let scanner = scanner(&config).await?;

            let outcome = scanner.finalizer.finalize(block_delay).await?;
            info!(
                "Finalize: block {:?}, processable {}, reverted {}, {} transactions, next to finalize {}",
                outcome.processed_block,
                outcome.block_processable,
                outcome.reverted,
                outcome.processed_transactions.len(),
                outcome.next_to_finalize
            );
        }
        Command::Shards { command } => {
            let config = admin_config(&cli.connection)?;
            let store = open_store(&config).await?;
            match command {
                ShardsCommand::Add {
                    kind,
                    number,
                    replace,
                } => {
                    let entry =
                        add_shard(store.as_ref(), kind.into(), config.chain_id, number, replace)
                            .await?;
                    println!("{} {} available={}", entry.kind, entry.identifier(), entry.is_available);
                }
                ShardsCommand::List { kind } => {
                    for entry in list_shards(store.as_ref(), kind.into(), config.chain_id).await? {
                        println!("{} {} available={}", entry.kind, entry.identifier(), entry.is_available);
                    }
                }
            }
        }
        Command::Resolve { kind, key } => {
            let config = admin_config(&cli.connection)?;
            let kind = PartitionKind::from(kind);
            let logical_key = LogicalKey::parse(kind, &key)?;
            let store = open_store(&config).await?;
            let directory = ShardDirectory::new(store, config.shard_cache_ttl)
                .with_cache_capacity(config.shard_cache_capacity);

            let resolved = directory
                .resolve(kind, std::slice::from_ref(&logical_key))
                .await?;
            match resolved.get(&logical_key) {
                Some(shard) => println!("{shard}"),
                None => println!("absent"),
            }
        }
    }

    Ok(())
}

/// Admin commands never reach a node, so any placeholder URL satisfies the builder.
fn admin_config(connection: &ConnectionArgs) -> Result<IndexingConfig> {
    let mut builder = connection.builder();
    if connection.node_conn_strings.is_empty() {
        builder = builder.node_conn_strings(["unused"]);
    }
    builder.build().context("Invalid configuration")
}

async fn scanner(
    config: &IndexingConfig,
) -> Result<Scanner<block_scanner::rpc::EthereumJsonRpcClient>> {
    let store = open_store(config).await?;
    bootstrap_shards(store.as_ref(), config).await?;
    Ok(Scanner::new(config, store, json_rpc_endpoints(config))?)
}

fn setup_ctrlc_handler(cancel: CancellationToken) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C");
        info!("Waiting for current processes to finish...");
        cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_with_bounds() {
        let cli = Cli::try_parse_from([
            "block-scanner",
            "--chain-id",
            "1000",
            "--node-conn-strings",
            "ws://node:19547,http://backup:8545",
            "--store",
            "memory",
            "run",
            "--start",
            "70",
            "--end-block",
            "80",
        ])
        .unwrap();
        let builder = cli.connection.builder();
        let config = builder.start_block(70).end_block(80).build().unwrap();
        assert_eq!(config.node_conn_strings, ["ws://node:19547", "http://backup:8545"]);
        assert_eq!(config.end_block, Some(BlockNumber::from_trusted(80)));
        assert!(matches!(cli.command, Command::Run { end: Some(80), .. }));
    }

    #[test]
    fn test_missing_chain_id_is_a_configuration_error() {
        let cli = Cli::try_parse_from([
            "block-scanner",
            "--node-conn-strings",
            "http://localhost:8545",
            "--store",
            "memory",
            "finalize",
        ])
        .unwrap();
        // CHAIN_ID may be set in the environment running the tests.
        if cli.connection.chain_id.is_none() {
            assert!(cli.connection.builder().build().is_err());
        }
    }

    #[test]
    fn test_resolve_subcommand_parses_kind() {
        let cli = Cli::try_parse_from(["block-scanner", "resolve", "economy-address", "1_0xa_0xb"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Resolve {
                kind: KindArg::EconomyAddress,
                ..
            }
        ));
    }
}
