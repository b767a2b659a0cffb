//! LAN peer-to-peer file transfer hub.
//!
//! Runs the presence registry, transfer store, and relay buffer behind a
//! `/ws` signaling endpoint plus the relay HTTP surface. All state is
//! in-memory; a restart invalidates every transfer.

mod config;
mod error;
mod http;
mod protocol;
mod registry;
mod relay;
mod state;
mod transfers;
mod ws;

use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::{Args, HubConfig};
use state::HubState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hub=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = HubConfig::from(&args);
    let state = HubState::new(config);

    // Periodic sweep of stale relay entries and liveness bookkeeping.
    let sweep_state = state.clone();
    let sweep_interval = args.sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            sweep_state.sweep();
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(http::healthz))
        .route("/api/devices", get(http::list_devices))
        .route("/api/transfers/:deviceId", get(http::transfers_for_device))
        .route("/api/transfer/:transferId/upload", post(http::upload))
        .route("/api/transfer/:transferId/download", get(http::download))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", args.bind_addr, args.port);
    tracing::info!(addr = addr.as_str(), "hub starting");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_websocket(socket, state))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_match_spec_windows() {
        let config = HubConfig::default();
        assert_eq!(config.liveness_secs, 300);
    }
}
