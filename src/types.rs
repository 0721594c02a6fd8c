use crate::errors::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Identifier of an EVM chain (the numeric `chainId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId(u64);

impl ChainId {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainId {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>().map(Self).map_err(|e| {
            BlockchainError::invalid_format("chain_id", &format!("Invalid chain id '{s}': {e}"))
        })
    }
}

/// A blockchain block number with validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(i64);

impl BlockNumber {
    /// Creates a new `BlockNumber` with validation
    pub fn new(value: i64) -> Result<Self> {
        if value < 0 {
            return Err(BlockchainError::invalid_format(
                "block_number",
                &format!("Block number cannot be negative: {value}"),
            ));
        }
        if value > i64::MAX - 1000 {
            return Err(BlockchainError::invalid_format(
                "block_number",
                &format!("Block number too large: {value}"),
            ));
        }
        Ok(Self(value))
    }

    /// Creates a `BlockNumber` without validation (for trusted sources)
    #[must_use]
    pub const fn from_trusted(value: i64) -> Self {
        Self(value)
    }

    /// Gets the inner value
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Creates a `BlockNumber` from a hex string
    pub fn from_hex(hex: &str) -> Result<Self> {
        let cleaned = hex.strip_prefix("0x").unwrap_or(hex);
        let value = i64::from_str_radix(cleaned, 16).map_err(|e| {
            BlockchainError::invalid_format(
                "block_number",
                &format!("Invalid hex block number '{hex}': {e}"),
            )
        })?;
        Self::new(value)
    }

    /// Hex quantity encoding used by JSON-RPC
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{:x}", self.0)
    }

    /// Zero-padded rendering that sorts lexicographically in numeric order.
    #[must_use]
    pub fn sort_key(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<BlockNumber> for i64 {
    fn from(block_number: BlockNumber) -> Self {
        block_number.0
    }
}

impl FromStr for BlockNumber {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.parse::<i64>().map_err(|e| {
            BlockchainError::invalid_format(
                "block_number",
                &format!("Invalid block number '{s}': {e}"),
            )
        })?;
        Self::new(value)
    }
}

impl Add<i64> for BlockNumber {
    type Output = Self;

    fn add(self, other: i64) -> Self {
        Self::from_trusted(self.0 + other)
    }
}

impl Sub<i64> for BlockNumber {
    type Output = Self;

    fn sub(self, other: i64) -> Self {
        Self::from_trusted(self.0 - other)
    }
}

impl Sub<Self> for BlockNumber {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::from_trusted(self.0 - other.0)
    }
}

fn validate_hex(value: &str, field_name: &str, expected_len: usize, what: &str) -> Result<()> {
    let cleaned = value.strip_prefix("0x").unwrap_or(value);

    if cleaned.len() != expected_len {
        return Err(BlockchainError::invalid_format(
            field_name,
            &format!(
                "{what} must be {expected_len} hex characters (got {}): {value}",
                cleaned.len()
            ),
        ));
    }

    if !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BlockchainError::invalid_format(
            field_name,
            &format!("{what} contains non-hex characters: {value}"),
        ));
    }

    Ok(())
}

macro_rules! hex_newtype {
    ($(#[$meta:meta])* $name:ident, $field:literal, $len:literal, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new value with hex validation; the stored form is lower case.
            pub fn new(value: String) -> Result<Self> {
                validate_hex(&value, $field, $len, $what)?;
                Ok(Self(value.to_ascii_lowercase()))
            }

            /// Creates a value without validation (for trusted sources)
            #[must_use]
            pub fn from_trusted(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn value(&self) -> &str {
                &self.0
            }

            #[must_use]
            pub fn into_value(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = BlockchainError;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s.to_string())
            }
        }
    };
}

hex_newtype!(
    /// A blockchain block hash with hex validation
    BlockHash,
    "block_hash",
    64,
    "Hash"
);

hex_newtype!(
    /// A blockchain transaction hash with hex validation
    TransactionHash,
    "transaction_hash",
    64,
    "Hash"
);

hex_newtype!(
    /// An Ethereum address with format validation
    Address,
    "address",
    40,
    "Address"
);

/// The kinds of logical key that are routed to a physical shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Block,
    Transaction,
    EconomyAddress,
}

impl PartitionKind {
    pub const ALL: [Self; 3] = [Self::Block, Self::Transaction, Self::EconomyAddress];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Transaction => "transaction",
            Self::EconomyAddress => "economy_address",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionKind {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "block" => Ok(Self::Block),
            "transaction" => Ok(Self::Transaction),
            "economy_address" | "economyAddress" => Ok(Self::EconomyAddress),
            other => Err(BlockchainError::invalid_format(
                "partition_kind",
                &format!("Unknown partition kind '{other}'"),
            )),
        }
    }
}

/// Processing state of a derived record.
///
/// Persisted as the integer sentinel `0` (pending), `1` (complete) or `-1` (dirty)
/// so rows stay readable by the query services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum ParsingStatus {
    Pending,
    Complete,
    Dirty,
}

impl From<ParsingStatus> for i8 {
    fn from(status: ParsingStatus) -> Self {
        match status {
            ParsingStatus::Pending => 0,
            ParsingStatus::Complete => 1,
            ParsingStatus::Dirty => -1,
        }
    }
}

impl TryFrom<i8> for ParsingStatus {
    type Error = BlockchainError;

    fn try_from(value: i8) -> Result<Self> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Complete),
            -1 => Ok(Self::Dirty),
            other => Err(BlockchainError::invalid_format(
                "events_parsing_status",
                &format!("Unknown status sentinel {other}"),
            )),
        }
    }
}

/// Name of a physical shard, `<chain id>_<shard number>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardIdentifier(String);

impl ShardIdentifier {
    #[must_use]
    pub fn new(chain_id: ChainId, shard_number: u32) -> Self {
        Self(format!("{chain_id}_{shard_number}"))
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }

    /// Physical table holding `base` rows for this shard, e.g. `transactions_1000_1`.
    #[must_use]
    pub fn table(&self, base: &str) -> String {
        format!("{base}_{}", self.0)
    }
}

impl fmt::Display for ShardIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A domain identifier that needs partition routing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogicalKey {
    Block {
        chain_id: ChainId,
        block_number: BlockNumber,
    },
    Transaction {
        chain_id: ChainId,
        transaction_hash: TransactionHash,
    },
    EconomyAddress {
        chain_id: ChainId,
        contract_address: Address,
        address: Address,
    },
}

impl LogicalKey {
    #[must_use]
    pub const fn block(chain_id: ChainId, block_number: BlockNumber) -> Self {
        Self::Block {
            chain_id,
            block_number,
        }
    }

    #[must_use]
    pub const fn transaction(chain_id: ChainId, transaction_hash: TransactionHash) -> Self {
        Self::Transaction {
            chain_id,
            transaction_hash,
        }
    }

    #[must_use]
    pub const fn economy_address(
        chain_id: ChainId,
        contract_address: Address,
        address: Address,
    ) -> Self {
        Self::EconomyAddress {
            chain_id,
            contract_address,
            address,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PartitionKind {
        match self {
            Self::Block { .. } => PartitionKind::Block,
            Self::Transaction { .. } => PartitionKind::Transaction,
            Self::EconomyAddress { .. } => PartitionKind::EconomyAddress,
        }
    }

    #[must_use]
    pub const fn chain_id(&self) -> ChainId {
        match self {
            Self::Block { chain_id, .. }
            | Self::Transaction { chain_id, .. }
            | Self::EconomyAddress { chain_id, .. } => *chain_id,
        }
    }

    /// Parses the textual form produced by `Display`, given the partition kind.
    pub fn parse(kind: PartitionKind, raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('_').collect();
        let invalid = || {
            BlockchainError::invalid_format(
                "logical_key",
                &format!("Malformed {kind} key '{raw}'"),
            )
        };
        match (kind, parts.as_slice()) {
            (PartitionKind::Block, [chain, number]) => {
                Ok(Self::block(chain.parse()?, number.parse()?))
            }
            (PartitionKind::Transaction, [chain, hash]) => Ok(Self::transaction(
                chain.parse()?,
                TransactionHash::new((*hash).to_string())?,
            )),
            (PartitionKind::EconomyAddress, [chain, contract, address]) => {
                Ok(Self::economy_address(
                    chain.parse()?,
                    Address::new((*contract).to_string())?,
                    Address::new((*address).to_string())?,
                ))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block {
                chain_id,
                block_number,
            } => write!(f, "{chain_id}_{block_number}"),
            Self::Transaction {
                chain_id,
                transaction_hash,
            } => write!(f, "{chain_id}_{transaction_hash}"),
            Self::EconomyAddress {
                chain_id,
                contract_address,
                address,
            } => write!(f, "{chain_id}_{contract_address}_{address}"),
        }
    }
}
