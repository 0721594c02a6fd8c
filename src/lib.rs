//! # Block Scanner
//!
//! Ingestion core for Ethereum-style chains. Blocks, transactions and token transfer
//! events are written to a partitioned key-value store whose physical shards are
//! chosen per logical key and remembered in shard pointers.
//!
//! ## Architecture Overview
//!
//! ### Public API Modules
//! - [`errors`] - Domain-specific error types
//! - [`types`] - Type-safe domain models (`BlockNumber`, `BlockHash`, `LogicalKey`, etc.)
//! - [`indexer`] - Ingestion and finalization services, configuration
//!
//! ### Core
//! - [`shard`] - Shard directory: pointer resolution and assignment with a TTL cache
//! - [`gate`] - Whether a block number is safe to process across all configured nodes
//! - [`ingest`] - Block ingestion and transaction fan-out
//! - [`finalizer`] - Consistency checks, revert and reprocess
//!
//! ### Infrastructure
//! - [`rpc`] - Ethereum JSON-RPC client
//! - [`store`] - Partitioned store contract with Postgres and in-memory backends
//! - [`repositories`] - Row layouts over the store
//! - [`decoder`] - ERC-20 style event decoding
//! - [`router`] - Health check and shard lookup over HTTP
//!
//! ```text
//!   indexer ──> ingest ──> gate ──> rpc
//!      │          │
//!      │          └──> shard ──> repositories ──> store
//!      └──> finalizer ──> ingest, shard
//! ```
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use block_scanner::{
//!     indexer::lib::{bootstrap_shards, json_rpc_endpoints, open_store, IndexingConfig, Scanner},
//!     types::ChainId,
//! };
//!
//! # async fn example() -> eyre::Result<()> {
//! let config = IndexingConfig::builder()
//!     .chain_id(ChainId::new(1000))
//!     .node_conn_strings(["http://localhost:8545"])
//!     .bootstrap_shard(1)
//!     .build()?;
//! let store = open_store(&config).await?;
//! bootstrap_shards(store.as_ref(), &config).await?;
//!
//! let scanner = Scanner::new(&config, store, json_rpc_endpoints(&config))?;
//! let report = scanner.ingest(None).await?;
//! println!("next block: {}", report.outcome.next_block_to_process);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

// Core public modules
pub mod errors;
pub mod indexer;
pub mod types;

pub mod decoder;
pub mod finalizer;
pub mod gate;
pub mod ingest;
pub mod repositories;
pub mod router;
pub mod rpc;
pub mod shard;
pub mod store;
mod utils;

#[cfg(test)]
mod mocks;
#[cfg(test)]
mod test_utils;

pub use errors::{BlockchainError, Result};
pub use types::{Address, BlockHash, BlockNumber, ChainId, LogicalKey, PartitionKind, TransactionHash};
