use anyhow::{Context, Result};
use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod proxy;

use peertun_shared::config::Config;
use peertun_shared::peer::{self, PeerHandle};
use peertun_shared::protocol::Role;
use proxy::ClientState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("Failed to load configuration")?;

    let (peer_handle, outbound_rx) = PeerHandle::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);
    let state = ClientState::new(peer_handle.clone());

    tokio::spawn(peer::run(
        config.clone(),
        Role::Client,
        peer_handle,
        outbound_rx,
        event_tx,
    ));
    tokio::spawn(proxy::dispatch(state.clone(), event_rx));

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Peertun Client                                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Session: {:<50} ║", config.session_id);
    println!("║  Browse:  http://localhost:{:<33} ║", config.listen_port);
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let app = Router::new()
        .fallback(any(proxy::proxy_handler))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.listen_port));
    info!(
        "Client listening on {} (session: {})",
        addr, config.session_id
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}
