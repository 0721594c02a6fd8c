//! # Repository Layer
//!
//! Typed row layouts on top of the [`PartitionedStore`](crate::store::PartitionedStore).
//! Each repository owns the table names and key shapes of its rows so the ingestion
//! code never builds raw [`ItemKey`](crate::store::ItemKey)s.
//!
//! ## Tables
//!
//! Unsharded: `shards`, `shard_pointers`, `economies`, `chain_cursors`.
//!
//! Sharded (physical table is `<base>_<shard identifier>`, e.g. `blocks_1000_1`):
//! - [`block`] - `blocks`, `block_details`, `block_transactions`
//! - [`transaction`] - `transactions`, `transaction_details`, `token_transfers`
//! - [`economy_address`] - `economy_address_transactions`, `economy_address_transfers`

pub mod block;
pub mod chain_cursor;
pub mod economy;
pub mod economy_address;
pub mod shard_pointer;
pub mod shard_pool;
pub mod transaction;
