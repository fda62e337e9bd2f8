//! HTTP server

use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, middleware};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info};

use super::{middleware as api_middleware, routes, websocket};
use crate::runtime::Supervisor;

/// Build the full application router
pub fn app(state: routes::AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    let ws_routes = websocket::websocket_routes(state.ws_manager.clone());

    routes::create_routes(state)
        .layer(middleware::from_fn(api_middleware::logging))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .merge(ws_routes)
        .layer(cors)
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
}

/// Serve the API until `shutdown` resolves, then SIGTERM every running app
pub async fn start_server<F>(supervisor: Supervisor, host: &str, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

    let state = routes::AppState::new(supervisor.clone());
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Node manager listening on http://{}", addr);
    info!("  WebSocket: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("Server stopped, terminating running apps");
    supervisor.shutdown().await;
    Ok(())
}
