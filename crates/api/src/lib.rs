//! HTTP front door of the signer node.
//!
//! - `POST /v1/chains/:chain_id/signing` submits an intent (202 on acceptance)
//! - `POST /v1/chains/:chain_id/unlocks` signs an escrow unlock synchronously
//! - `GET  /v1/chains/:chain_id/confirmations` exposes the confirmation policy
//! - `GET  /v1/status/:id` returns a cached signature
//! - `GET  /health`

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult, ErrorBody};
pub use state::{AppState, Signer};

/// Create and configure the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_v1 = Router::new()
        .route(
            "/chains/:chain_id/signing",
            post(routes::intents::submit_signing),
        )
        .route(
            "/chains/:chain_id/unlocks",
            post(routes::intents::submit_unlock),
        )
        .route(
            "/chains/:chain_id/confirmations",
            get(routes::status::get_confirmations),
        )
        .route("/status/:id", get(routes::status::get_status));

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/v1", api_v1)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Serve the API on `addr` until `cancel` fires.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("API server stopped");
    Ok(())
}
