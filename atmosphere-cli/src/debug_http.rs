//! Local debug HTTP surface (SPEC_FULL.md "Debug HTTP surface on the CLI
//! only"): read-only `/health`, `/peers`, `/capabilities` for development
//! visibility. No auth, no write endpoints — this is an inspection window,
//! never a control plane, and the core itself never depends on it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use atmosphere_core::Node;

async fn health(State(node): State<Arc<Node>>) -> Json<serde_json::Value> {
    Json(node.health())
}

async fn peers(State(node): State<Arc<Node>>) -> Json<serde_json::Value> {
    Json(node.peers())
}

async fn capabilities(
    State(node): State<Arc<Node>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match node.capabilities() {
        Ok(entries) => Ok(Json(serde_json::to_value(entries).unwrap_or_default())),
        Err(e) => {
            tracing::warn!(error = %e, "debug_http: capabilities query failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Serve the debug surface at `addr` until `shutdown` resolves. Intended to
/// be bound to loopback only; the caller decides the address, this module
/// does not enforce it beyond what `addr` already implies.
pub async fn serve(
    addr: SocketAddr,
    node: Arc<Node>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/peers", get(peers))
        .route("/capabilities", get(capabilities))
        .layer(CorsLayer::permissive())
        .with_state(node);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "debug HTTP surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
