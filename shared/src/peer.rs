//! Peer connection lifecycle.
//!
//! Owns one WebRTC peer connection at a time. Each session gets a fresh
//! signaling link and a fresh peer connection; on close or error both are
//! destroyed and a new attempt starts after [`RESTART_DELAY`]. The restart
//! policy is unconditional — stopping the tunnel means killing the process.
//!
//! The layers above see only [`PeerHandle`] for sending and a stream of
//! [`PeerEvent`]s for everything inbound, so the multiplexer and forwarder
//! can be driven by plain channels in tests.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::chunk::{self, FRAGMENT_SIZE};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{self, Role, TunnelMessage};
use crate::signaling::SignalingLink;

/// Delay before rebuilding the stack after a failed or closed session.
pub const RESTART_DELAY: Duration = Duration::from_secs(2);

const DATA_CHANNEL_LABEL: &str = "tunnel";

/// Negotiation payloads exchanged over the signaling link. Opaque to the
/// link itself; produced and consumed only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: RTCSessionDescription },
    Answer { sdp: RTCSessionDescription },
    Candidate { candidate: RTCIceCandidateInit },
}

/// Events surfaced to the multiplexer / forwarder layer.
#[derive(Debug)]
pub enum PeerEvent {
    /// The data channel is open; sends will now succeed.
    Connected,
    /// One raw frame received from the peer.
    Data(Bytes),
    /// The session died; a restart is scheduled. In-flight requests are
    /// orphaned and must be swept by the layer above.
    Closed,
}

/// Cloneable send surface over the current peer connection.
#[derive(Clone)]
pub struct PeerHandle {
    connected: Arc<AtomicBool>,
    outbound: mpsc::Sender<Bytes>,
}

impl PeerHandle {
    /// Create a handle plus the outbound frame receiver the connection
    /// pump (or a test) drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                connected: Arc::new(AtomicBool::new(false)),
                outbound: tx,
            },
            rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Serialize and send one tunnel message, fragmenting oversized frames.
    ///
    /// Fails fast with [`Error::NotConnected`] while no peer session is
    /// live — requests are never queued for a future connection.
    pub async fn send(&self, message: &TunnelMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let frame = message.to_bytes()?;
        if frame.len() <= FRAGMENT_SIZE {
            self.outbound
                .send(Bytes::from(frame))
                .await
                .map_err(|_| Error::NotConnected)?;
            return Ok(());
        }

        let id = protocol::request_id();
        for fragment in chunk::split(&frame, &id) {
            let bytes = serde_json::to_vec(&fragment)?;
            self.outbound
                .send(Bytes::from(bytes))
                .await
                .map_err(|_| Error::NotConnected)?;
        }
        Ok(())
    }
}

/// Drive the connect/teardown/restart loop forever.
///
/// `outbound` is the receiver half of [`PeerHandle::channel`]; `events`
/// feeds the multiplexer or forwarder.
pub async fn run(
    config: Config,
    role: Role,
    handle: PeerHandle,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<PeerEvent>,
) {
    loop {
        match run_session(&config, role, &handle, &mut outbound, &events).await {
            Ok(()) => info!("Peer disconnected. Restarting in {:?}", RESTART_DELAY),
            Err(e) => warn!("Peer session failed: {}. Restarting in {:?}", e, RESTART_DELAY),
        }

        handle.set_connected(false);
        // Frames accepted in the race window around disconnect belong to the
        // dead session; they must not leak onto the next one.
        while outbound.try_recv().is_ok() {}
        let _ = events.send(PeerEvent::Closed).await;

        tokio::time::sleep(RESTART_DELAY).await;
    }
}

/// One full session: fresh signaling link, fresh peer connection, pump
/// until the connection dies, then tear everything down.
async fn run_session(
    config: &Config,
    role: Role,
    handle: &PeerHandle,
    outbound: &mut mpsc::Receiver<Bytes>,
    events: &mpsc::Sender<PeerEvent>,
) -> Result<()> {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let link = SignalingLink::connect(config.broker_addr(), &config.session_id, role, signal_tx)
        .await?;

    let pc = match new_peer_connection().await {
        Ok(pc) => pc,
        Err(e) => {
            link.close().await;
            return Err(e);
        }
    };

    let result = drive_session(&pc, &link, role, handle, outbound, events, signal_rx).await;

    // Full teardown, even when negotiation failed half-way: a superseded
    // connection must be destroyed before the next attempt starts.
    handle.set_connected(false);
    if let Err(e) = pc.close().await {
        warn!("Error closing peer connection: {}", e);
    }
    link.close().await;
    result
}

/// Negotiate and pump one live connection until it dies.
#[allow(clippy::too_many_arguments)]
async fn drive_session(
    pc: &Arc<RTCPeerConnection>,
    link: &SignalingLink,
    role: Role,
    handle: &PeerHandle,
    outbound: &mut mpsc::Receiver<Bytes>,
    events: &mpsc::Sender<PeerEvent>,
    mut signal_rx: mpsc::UnboundedReceiver<serde_json::Value>,
) -> Result<()> {
    // Anything that ends the session funnels into closed_tx.
    let (closed_tx, mut closed_rx) = mpsc::channel::<()>(1);
    {
        let closed = closed_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let closed = closed.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        let _ = closed.try_send(());
                    }
                    _ => {}
                }
            })
        }));
    }

    // Trickle ICE: every gathered candidate goes straight to the peer.
    {
        let sender = link.sender();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sender = sender.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };
                let payload = SignalPayload::Candidate { candidate: init };
                match serde_json::to_value(&payload) {
                    Ok(value) => {
                        if let Err(e) = sender.send(&value).await {
                            warn!("Failed to publish ICE candidate: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode ICE candidate: {}", e),
                }
            })
        }));
    }

    let (open_tx, mut open_rx) = mpsc::channel::<Arc<RTCDataChannel>>(1);

    // The host drives the offer; the client waits for the channel to arrive.
    match role {
        Role::Host => {
            let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
            wire_data_channel(&dc, open_tx.clone(), events.clone(), closed_tx.clone());

            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            link.send(&serde_json::to_value(SignalPayload::Offer { sdp: offer })?)
                .await?;
        }
        Role::Client => {
            let open_tx = open_tx.clone();
            let events = events.clone();
            let closed = closed_tx.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let open_tx = open_tx.clone();
                let events = events.clone();
                let closed = closed.clone();
                Box::pin(async move {
                    wire_data_channel(&dc, open_tx, events, closed);
                })
            }));
        }
    }

    let mut channel: Option<Arc<RTCDataChannel>> = None;
    loop {
        tokio::select! {
            Some(payload) = signal_rx.recv() => {
                if let Err(e) = handle_signal(pc, link, role, payload).await {
                    warn!("Dropping signaling payload: {}", e);
                }
            }
            Some(dc) = open_rx.recv() => {
                info!("Peer connected. Tunnel is ready");
                channel = Some(dc);
                handle.set_connected(true);
                let _ = events.send(PeerEvent::Connected).await;
            }
            Some(frame) = outbound.recv(), if channel.is_some() => {
                let Some(dc) = channel.as_ref() else { continue };
                if let Err(e) = dc.send(&frame).await {
                    warn!("Data channel send failed: {}", e);
                    break;
                }
            }
            _ = closed_rx.recv() => break,
        }
    }

    Ok(())
}

async fn new_peer_connection() -> Result<Arc<RTCPeerConnection>> {
    let mut media = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_owned()],
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

fn wire_data_channel(
    dc: &Arc<RTCDataChannel>,
    open_tx: mpsc::Sender<Arc<RTCDataChannel>>,
    events: mpsc::Sender<PeerEvent>,
    closed_tx: mpsc::Sender<()>,
) {
    let opened = Arc::clone(dc);
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_tx.send(opened).await;
        })
    }));

    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::Data(message.data)).await;
        })
    }));

    let closed = closed_tx.clone();
    dc.on_close(Box::new(move || {
        let closed = closed.clone();
        Box::pin(async move {
            let _ = closed.try_send(());
        })
    }));

    dc.on_error(Box::new(move |e: webrtc::Error| {
        let closed = closed_tx.clone();
        Box::pin(async move {
            warn!("Data channel error: {}", e);
            let _ = closed.try_send(());
        })
    }));
}

async fn handle_signal(
    pc: &Arc<RTCPeerConnection>,
    link: &SignalingLink,
    role: Role,
    payload: serde_json::Value,
) -> Result<()> {
    let payload: SignalPayload = serde_json::from_value(payload)?;
    match payload {
        SignalPayload::Offer { sdp } => {
            if role != Role::Client {
                return Err(Error::Signaling("Unexpected offer for this role".into()));
            }
            pc.set_remote_description(sdp).await?;
            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer.clone()).await?;
            link.send(&serde_json::to_value(SignalPayload::Answer { sdp: answer })?)
                .await?;
        }
        SignalPayload::Answer { sdp } => {
            if role != Role::Host {
                return Err(Error::Signaling("Unexpected answer for this role".into()));
            }
            pc.set_remote_description(sdp).await?;
        }
        SignalPayload::Candidate { candidate } => {
            pc.add_ice_candidate(candidate).await?;
        }
    }
    Ok(())
}
