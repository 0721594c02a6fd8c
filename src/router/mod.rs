//! # HTTP Router
//!
//! Health checks for load balancers and a read-only view of the shard directory.
//!
//! ## Endpoints
//!
//! - `GET /` - 200 "Healthy" when the store answers, 500 otherwise
//! - `GET /shards/:kind/:key` - the shard a logical key was assigned to, e.g.
//!   `/shards/block/1000_78` answers `{"kind":"block","key":"1000_78","shard":"1000_1"}`;
//!   404 when the key has no pointer
//!
//! The server stops accepting connections once the cancellation token fires and
//! finishes in-flight requests before returning.

use std::sync::Arc;

use axum::{routing::get, Router};
use eyre::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{shard::ShardDirectory, store::PartitionedStore};

mod handlers;

pub use handlers::ShardResolution;

#[derive(Clone)]
pub struct RouterState {
    store: Arc<dyn PartitionedStore>,
    directory: Arc<ShardDirectory>,
}

impl RouterState {
    pub fn new(store: Arc<dyn PartitionedStore>, directory: Arc<ShardDirectory>) -> Self {
        Self { store, directory }
    }
}

pub fn app(state: RouterState) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/shards/:kind/:key", get(handlers::resolve_shard))
        .with_state(state)
}

pub async fn initialize_router(
    endpoint: &str,
    state: RouterState,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(endpoint)
        .await
        .map_err(|e| eyre::eyre!("Failed to bind router to {}: {}", endpoint, e))?;
    serve(listener, state, cancel).await
}

/// Serves on an already bound listener.
pub async fn serve(listener: TcpListener, state: RouterState, cancel: CancellationToken) -> Result<()> {
    info!(
        "->> LISTENING on {}\n",
        listener
            .local_addr()
            .map_err(|e| eyre::eyre!("Failed to get local address: {}", e))?
    );
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("Shutdown signal received, shutting down router");
        })
        .await?;

    Ok(())
}
