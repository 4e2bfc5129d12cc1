//! HTTP listener glue.
//!
//! # Responsibilities
//! - Bind one axum server per gateway port
//! - Resolve each request against the live routing table
//! - Wire up the ambient middleware (tracing, timeout, request id)
//!
//! # Design Decisions
//! - The axum router is a catch-all; real routing happens in the
//!   gateway's own registry, which reloads swap without rebinding
//!   listeners

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::gateway::Gateway;
use crate::router::Transport;

/// Per-listener state injected into the catch-all handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub port: u16,
}

/// Build the axum router for one gateway port.
pub fn build_router(gateway: Arc<Gateway>, port: u16) -> Router {
    let config = gateway.config();
    let state = AppState { gateway, port };

    Router::new()
        .route("/", any(dispatch))
        .route("/{*path}", any(dispatch))
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.http_server_options.request_timeout_secs,
        )))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
}

/// Resolve the request against the live table and run its chain.
async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let path = request.uri().path().to_string();

    let mux = state.gateway.mux();
    match mux.resolve(state.port, Transport::Http, &host, &path) {
        Some(handler) => handler.serve(request).await,
        None => mux.handle_404(&host, &path).into_response(),
    }
}

/// Serve every configured port until shutdown.
pub async fn run(gateway: Arc<Gateway>) -> Result<(), std::io::Error> {
    let config = gateway.config();

    let mut ports = vec![config.listen_port];
    if config.control_port() != config.listen_port {
        ports.push(config.control_port());
    }

    let mut servers = Vec::new();
    for port in ports {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let router = build_router(gateway.clone(), port);
        servers.push(tokio::spawn(async move {
            let app = router.into_make_service();
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
            {
                tracing::error!(error = %e, "HTTP server stopped with error");
            }
        }));
    }

    for server in servers {
        let _ = server.await;
    }

    tracing::info!("HTTP server stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Failed to install Ctrl+C handler");
        return;
    }
    tracing::info!("Shutdown signal received");
}
