//! # Ingestion
//!
//! - [`block`] claims the block's shard pointer and writes its header rows
//! - [`fanout`] persists the block's transactions in bounded concurrent batches
//! - [`transfers`] turns decoded token events into transfer and index rows

pub mod block;
pub mod fanout;
pub mod transfers;

pub use block::{BlockIngestor, IngestOutcome};
pub use fanout::{FanoutConfig, FanoutConfigBuilder, FanoutReport, TransactionFanout};
pub use transfers::TransferPipeline;
