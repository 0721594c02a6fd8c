use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::{
    errors::BlockchainError,
    router::RouterState,
    types::{LogicalKey, PartitionKind, ShardIdentifier},
};

/// Maps domain errors onto HTTP status codes.
pub struct Error(BlockchainError);

impl From<BlockchainError> for Error {
    fn from(err: BlockchainError) -> Self {
        Self(err)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BlockchainError::InvalidHexFormat { .. } => StatusCode::BAD_REQUEST,
            BlockchainError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("Error: {}", self.0)).into_response()
    }
}

pub async fn health(State(state): State<RouterState>) -> (StatusCode, &'static str) {
    // Check store connection here in health check.
    if state.store.check_connection().await.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Store connection failed");
    }
    (StatusCode::OK, "Healthy")
}

#[derive(Debug, Serialize)]
pub struct ShardResolution {
    pub kind: PartitionKind,
    pub key: String,
    pub shard: ShardIdentifier,
}

/// `GET /shards/:kind/:key`, 404 when the key has no pointer.
pub async fn resolve_shard(
    State(state): State<RouterState>,
    Path((kind, key)): Path<(String, String)>,
) -> Result<Response, Error> {
    let kind: PartitionKind = kind.parse()?;
    let logical_key = LogicalKey::parse(kind, &key)?;

    let resolved = state
        .directory
        .resolve(kind, std::slice::from_ref(&logical_key))
        .await?;

    Ok(match resolved.get(&logical_key) {
        Some(shard) => Json(ShardResolution {
            kind,
            key: logical_key.to_string(),
            shard: shard.clone(),
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, format!("No shard for {kind} {key}")).into_response(),
    })
}
