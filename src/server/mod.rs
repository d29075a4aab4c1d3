//! HTTP/WebSocket Server
//!
//! The axum wiring around the protocol core:
//!
//! - `POST /client/negotiate` (and the hub path's `/negotiate`) — issue a
//!   connection id and the transport list
//! - `GET /server` — WebSocket endpoint for the upstream relay endpoint
//! - `GET /client` — WebSocket endpoint for downstream relay clients
//! - `GET <hub path>` — WebSocket endpoint for hub-variant clients
//! - `GET /health` — liveness and connection count

pub mod error;
pub mod negotiate;
pub mod state;
pub mod ws;

pub use error::{ServerError, ServerResult};
pub use state::AppState;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let hub_path = state.config.hub.path.clone();
    let hub_negotiate = format!("{}/negotiate", hub_path.trim_end_matches('/'));

    Router::new()
        .route("/server", get(ws::upstream_handler))
        .route("/client", get(ws::client_handler))
        .route("/client/negotiate", any(negotiate::negotiate))
        .route(&hub_path, get(ws::hub_handler))
        .route(&hub_negotiate, any(negotiate::negotiate))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Start the server
pub async fn serve(state: AppState) -> Result<(), ServerError> {
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("wirehub listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServerError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("wirehub shut down gracefully");
    Ok(())
}

/// Health status body
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    connections: usize,
    uptime_seconds: u64,
    version: String,
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry.connection_count().await,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::util::ServiceExt;

    fn test_app() -> Router {
        build_router(AppState::new(Config::default()))
    }

    #[tokio::test]
    async fn test_negotiate_route() {
        let app = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/client/negotiate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_hub_negotiate_route() {
        let app = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat/negotiate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_get() {
        let app = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/client/negotiate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_route() {
        let app = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ws_endpoints_require_upgrade() {
        let app = test_app();

        // A plain GET without the upgrade headers cannot become a socket.
        for uri in ["/server", "/client", "/chat"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_ne!(response.status(), StatusCode::OK, "{}", uri);
        }
    }
}
