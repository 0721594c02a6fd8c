use crate::errors::{BlockchainError, Result};

pub fn convert_hex_string_to_i64(hex_string: &str) -> Result<i64> {
    let cleaned = hex_string.trim_start_matches("0x");
    i64::from_str_radix(cleaned, 16).map_err(|_| BlockchainError::invalid_hex(hex_string))
}

/// Strips leading zeros from a 32-byte word so `0x000…01` becomes `0x1`.
#[must_use]
pub fn normalize_hex_quantity(hex_string: &str) -> String {
    let trimmed = hex_string.trim_start_matches("0x").trim_start_matches('0');
    if trimmed.is_empty() {
        "0x0".to_string()
    } else {
        format!("0x{}", trimmed.to_ascii_lowercase())
    }
}

/// Extracts the trailing 20-byte address from a 32-byte indexed topic.
pub fn topic_to_address(topic: &str) -> Result<String> {
    let cleaned = topic.trim_start_matches("0x");
    if cleaned.len() != 64 {
        return Err(BlockchainError::invalid_hex(topic));
    }
    Ok(format!("0x{}", cleaned[24..].to_ascii_lowercase()))
}
