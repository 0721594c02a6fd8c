//! Token event decoding.
//!
//! Recognises the ERC-20 `Transfer(address,address,uint256)` event plus two optional
//! mint events whose topics are configured per deployment. A mint-processed event
//! reads as a transfer from the zero address; a mint-reverted event as a transfer to
//! it. Logs that do not match a known signature, or match one with the wrong shape,
//! are skipped.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    rpc::RpcLog,
    types::Address,
    utils::{convert_hex_string_to_i64, normalize_hex_quantity, topic_to_address},
};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Transfer,
    MintProcessed,
    MintReverted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub kind: TransferKind,
    pub contract_address: Address,
    pub from: Address,
    pub to: Address,
    /// Hex quantity without leading zeros.
    pub amount: String,
    pub event_index: i64,
}

pub trait EventDecoder: Send + Sync {
    fn decode(&self, logs: &[RpcLog]) -> Vec<DecodedTransfer>;
}

#[derive(Debug, Clone, Default)]
pub struct TokenEventDecoder {
    mint_processed_topic: Option<String>,
    mint_reverted_topic: Option<String>,
}

impl TokenEventDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Topic of `MintProcessed(address indexed to, uint256 amount)`.
    #[must_use]
    pub fn mint_processed_topic(mut self, topic: impl Into<String>) -> Self {
        self.mint_processed_topic = Some(topic.into().to_ascii_lowercase());
        self
    }

    /// Topic of `MintReverted(address indexed from, uint256 amount)`.
    #[must_use]
    pub fn mint_reverted_topic(mut self, topic: impl Into<String>) -> Self {
        self.mint_reverted_topic = Some(topic.into().to_ascii_lowercase());
        self
    }

    fn classify(&self, topic0: &str) -> Option<TransferKind> {
        let topic0 = topic0.to_ascii_lowercase();
        if topic0 == TRANSFER_TOPIC {
            Some(TransferKind::Transfer)
        } else if self.mint_processed_topic.as_deref() == Some(topic0.as_str()) {
            Some(TransferKind::MintProcessed)
        } else if self.mint_reverted_topic.as_deref() == Some(topic0.as_str()) {
            Some(TransferKind::MintReverted)
        } else {
            None
        }
    }

    fn decode_log(&self, position: usize, log: &RpcLog) -> Option<DecodedTransfer> {
        let kind = self.classify(log.topics.first()?)?;
        let zero = || Address::from_trusted(ZERO_ADDRESS);
        let indexed = |i: usize| {
            log.topics
                .get(i)
                .and_then(|topic| topic_to_address(topic).ok())
                .map(Address::from_trusted)
        };

        // ERC-721 transfers index the token id as a fourth topic; only the
        // three-topic ERC-20 shape carries an amount in `data`.
        let (from, to) = match kind {
            TransferKind::Transfer if log.topics.len() == 3 => (indexed(1)?, indexed(2)?),
            TransferKind::Transfer => return None,
            TransferKind::MintProcessed => (zero(), indexed(1)?),
            TransferKind::MintReverted => (indexed(1)?, zero()),
        };

        let data = log.data.trim_start_matches("0x");
        if data.len() < 64 || !data[..64].chars().all(|c| c.is_ascii_hexdigit()) {
            debug!("[decoder] Skipping {:?} log with malformed data", kind);
            return None;
        }

        let event_index = log
            .log_index
            .as_deref()
            .and_then(|index| convert_hex_string_to_i64(index).ok())
            .unwrap_or_else(|| i64::try_from(position).unwrap_or(i64::MAX));

        Some(DecodedTransfer {
            kind,
            contract_address: Address::from_trusted(log.address.to_ascii_lowercase()),
            from,
            to,
            amount: normalize_hex_quantity(&data[..64]),
            event_index,
        })
    }
}

impl EventDecoder for TokenEventDecoder {
    fn decode(&self, logs: &[RpcLog]) -> Vec<DecodedTransfer> {
        logs.iter()
            .enumerate()
            .filter_map(|(position, log)| self.decode_log(position, log))
            .collect()
    }
}
