use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod forwarder;

use forwarder::Forwarder;
use peertun_shared::config::Config;
use peertun_shared::peer::{self, PeerHandle};
use peertun_shared::protocol::Role;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("Failed to load configuration")?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Peertun Host                                                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Session:    {:<47} ║", config.session_id);
    println!(
        "║  Forwarding: http://{}:{:<31} ║",
        config.target_host, config.target_port
    );
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let (peer_handle, outbound_rx) = PeerHandle::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);

    tokio::spawn(peer::run(
        config.clone(),
        Role::Host,
        peer_handle.clone(),
        outbound_rx,
        event_tx,
    ));

    let forwarder = Forwarder::new(peer_handle, &config);
    info!(
        "Host forwarding to {}:{} (session: {})",
        config.target_host, config.target_port, config.session_id
    );

    tokio::select! {
        _ = forwarder.run(event_rx) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    Ok(())
}
