use thiserror::Error;

/// Domain-specific error types for the block scanner
#[derive(Error, Debug)]
pub enum BlockchainError {
    /// Errors related to invalid hex format
    #[error("Invalid hex format: {message}")]
    InvalidHexFormat { message: String },

    /// Errors related to RPC connections and requests
    #[error("RPC connection failed: {message}")]
    RpcConnectionFailed { message: String },

    /// Errors when RPC requests timeout
    #[error("RPC request timed out after {timeout_seconds} seconds")]
    RpcTimeout { timeout_seconds: u64 },

    /// Errors reported by the node inside a JSON-RPC response
    #[error("RPC error {code}: {message}")]
    RpcResponse { code: i64, message: String },

    /// Errors when a block is not found
    #[error("Block not found: {block_identifier}")]
    BlockNotFound { block_identifier: String },

    /// The partitioned store could not be reached
    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// A store operation failed for a non-transient reason
    #[error("Store operation failed: {operation}")]
    StoreOperationFailed { operation: String },

    /// A conditional write lost against a concurrent writer
    #[error("Concurrent update of {key}")]
    StoreConflict { key: String },

    /// A batch store operation left items unprocessed after all retries
    #[error("{count} items left unprocessed by {operation}")]
    UnprocessedItems { operation: String, count: usize },

    /// No available shard is configured for a partition kind
    #[error("No available shard for {kind} on chain {chain_id}")]
    ShardPoolEmpty { kind: String, chain_id: u64 },

    /// Row (de)serialization errors
    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    /// Configuration errors
    #[error("Configuration error: {parameter} - {message}")]
    ConfigurationError { parameter: String, message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    NetworkError { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl BlockchainError {
    /// Create an invalid hex format error
    #[must_use]
    pub fn invalid_hex(value: &str) -> Self {
        Self::InvalidHexFormat {
            message: format!("Cannot parse hex value: '{value}'"),
        }
    }

    /// Create an invalid format error
    #[must_use]
    pub fn invalid_format(field_name: &str, message: &str) -> Self {
        Self::InvalidHexFormat {
            message: format!("Invalid {field_name}: {message}"),
        }
    }

    /// Create an RPC connection error
    pub fn rpc_connection(message: impl Into<String>) -> Self {
        Self::RpcConnectionFailed {
            message: message.into(),
        }
    }

    /// Create an RPC timeout error
    #[must_use]
    pub const fn rpc_timeout(timeout_seconds: u64) -> Self {
        Self::RpcTimeout { timeout_seconds }
    }

    /// Create an RPC response error
    pub fn rpc_response(code: i64, message: impl Into<String>) -> Self {
        Self::RpcResponse {
            code,
            message: message.into(),
        }
    }

    /// Create a block not found error
    pub fn block_not_found(block_identifier: impl Into<String>) -> Self {
        Self::BlockNotFound {
            block_identifier: block_identifier.into(),
        }
    }

    /// Create a store unavailable error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create a store operation error
    pub fn store_operation(operation: impl Into<String>) -> Self {
        Self::StoreOperationFailed {
            operation: operation.into(),
        }
    }

    /// Create a store conflict error
    pub fn store_conflict(key: impl Into<String>) -> Self {
        Self::StoreConflict { key: key.into() }
    }

    /// Create an unprocessed items error
    pub fn unprocessed(operation: impl Into<String>, count: usize) -> Self {
        Self::UnprocessedItems {
            operation: operation.into(),
            count,
        }
    }

    /// Create an empty shard pool error
    pub fn shard_pool_empty(kind: impl Into<String>, chain_id: u64) -> Self {
        Self::ShardPoolEmpty {
            kind: kind.into(),
            chain_id,
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether the driving loop should simply retry the operation after a delay.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RpcConnectionFailed { .. }
                | Self::RpcTimeout { .. }
                | Self::RpcResponse { .. }
                | Self::NetworkError { .. }
                | Self::StoreUnavailable { .. }
                | Self::StoreConflict { .. }
                | Self::UnprocessedItems { .. }
                | Self::BlockNotFound { .. }
        )
    }
}

/// Result type alias for blockchain operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Convert from standard database errors
impl From<sqlx::Error> for BlockchainError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                Self::store_operation(format!("Database error: {db_err}"))
            }
            sqlx::Error::PoolClosed => Self::store_unavailable("Connection pool closed"),
            sqlx::Error::PoolTimedOut => Self::store_unavailable("Connection pool timed out"),
            sqlx::Error::Io(e) => Self::store_unavailable(format!("I/O error: {e}")),
            _ => Self::store_operation(format!("SQLx error: {err}")),
        }
    }
}

/// Convert from reqwest errors
impl From<reqwest::Error> for BlockchainError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::rpc_timeout(30)
        } else if err.is_connect() {
            Self::rpc_connection(format!("Connection error: {err}"))
        } else {
            Self::network(format!("Request error: {err}"))
        }
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {err}"))
    }
}

/// Convert from hex parsing errors
impl From<std::num::ParseIntError> for BlockchainError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::invalid_hex(&format!("Parse error: {err}"))
    }
}

impl From<eyre::Report> for BlockchainError {
    fn from(err: eyre::Report) -> Self {
        Self::internal(format!("{err:#}"))
    }
}
