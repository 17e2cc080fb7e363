//! # Webshell Router Module
//!
//! The router is the rendezvous point between hosts (machines running a shell)
//! and viewers (terminal UIs). Hosts and viewers never talk to each other
//! directly. Both dial the same WebSocket endpoint, and the router decides
//! where each event goes using connection metadata alone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐       ┌─────────────────┐       ┌─────────────────┐
//! │  Host           │       │  Router         │       │  Viewers        │
//! │  (instance)     │◄─────►│                 │◄─────►│  (attach, web)  │
//! │                 │       │  - Classifier   │       │                 │
//! │  x-identifier   │       │  - Registry     │       │  x-client-id /  │
//! │                 │       │  - Relay        │       │  sub-protocol   │
//! └─────────────────┘       └─────────────────┘       └─────────────────┘
//! ```
//!
//! ## Connection lifecycle
//!
//! 1. The upgrade request's headers are classified as host or viewer.
//!    Unclassifiable connections are closed right after the upgrade.
//! 2. The connection is registered under its identifier. A later connection
//!    with the same identifier replaces it.
//! 3. One task per connection reads frames in order and hands text frames to
//!    the relay. A second task drains the connection's outbound queue.
//! 4. On close or error the registry entry is removed.
//!
//! ## Example Usage
//!
//! ```bash
//! webshell router --host 0.0.0.0 --port 4000
//! ```

pub mod classify;
pub mod registry;
pub mod relay;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, Frame, OUTBOUND_CAPACITY, ReadyState};
use classify::{Peer, classify};
use registry::Registry;
use relay::Relay;

/// Default upgrade path shared by hosts and viewers
pub const DEFAULT_PATH: &str = "/route";

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Webshell router - pairs shell hosts with terminal viewers"
)]
pub struct Args {
    /// Host to bind the router to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the router
    #[arg(long, env = "PORT", default_value_t = 4000)]
    pub port: u16,

    /// Path of the WebSocket upgrade endpoint
    #[arg(long, default_value = DEFAULT_PATH)]
    pub path: String,
}

/// Starts the router and runs until Ctrl-C.
///
/// # Example
///
/// ```rust,no_run
/// use webshell::router::{Args, run_router_server};
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = Args {
///     host: "0.0.0.0".to_string(),
///     port: 4000,
///     path: "/route".to_string(),
/// };
///
/// run_router_server(args).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_router_server(args: Args) -> Result<()> {
    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Router starting");
    info!("Router listening on ws://{}{}", addr, args.path);

    let relay = Arc::new(Relay::new(Arc::new(Registry::new())));
    let app = app(relay, &args.path);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {:?}", e);
    }

    info!("Router stopped");
    Ok(())
}

/// Serves the relay on an already-bound listener.
pub async fn serve(listener: TcpListener, relay: Arc<Relay>, path: &str) -> Result<()> {
    axum::serve(listener, app(relay, path))
        .await
        .context("Router server failed")
}

/// The axum application exposing the single upgrade route.
pub fn app(relay: Arc<Relay>, path: &str) -> Router {
    Router::new()
        .route(path, get(handle_route_ws))
        .with_state(AppState { relay })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn handle_route_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(peer) = classify(&headers) else {
        warn!("Rejecting connection without an instance or client identifier");
        return ws.on_upgrade(|mut socket| async move {
            let _ = socket.send(Message::Close(None)).await;
        });
    };

    // Browsers only accept the upgrade if the offered protocol is echoed.
    let ws = if peer.via_subprotocol {
        ws.protocols([peer.id.clone()])
    } else {
        ws
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state.relay, peer))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>, peer: Peer) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (handle, mut outbound_rx) = ConnectionHandle::open(OUTBOUND_CAPACITY);

    relay.join(&peer, handle.clone());

    // Task to write queued frames to this connection
    let writer_state = handle.shared_state();
    let writer_id = peer.id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(data) => Message::Binary(data.into()),
                Frame::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_sender.send(message).await.is_err() {
                warn!("Failed to write to {}", writer_id);
                break;
            }
        }
        writer_state.set(ReadyState::Closed);
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                relay.route(peer.role, text.as_str());
            }
            Ok(Message::Binary(data)) => {
                debug!(
                    "Dropping {} byte binary frame from {} {}: no routing metadata",
                    data.len(),
                    peer.role,
                    peer.id
                );
            }
            Ok(Message::Close(_)) => {
                debug!("Close frame received from {} {}", peer.role, peer.id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error for {} {}: {}", peer.role, peer.id, e);
                break;
            }
            _ => {}
        }
    }

    handle.set_state(ReadyState::Closed);
    relay.leave(&peer, &handle);
    writer.abort();
}
