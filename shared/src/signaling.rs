//! Signaling link over a public MQTT broker.
//!
//! Host and client rendezvous without a registry: each role subscribes to
//! its own topic and publishes to the counter-role's topic, both derived
//! from the session id. Payloads are opaque JSON owned by the negotiation
//! layer; this module only moves them.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::Role;

/// Topic namespace shared by every tunnel session.
pub const TOPIC_NAMESPACE: &str = "peertun";

/// Inbound topic for `role` within a session.
pub fn topic(session_id: &str, role: Role) -> String {
    format!("{}/{}/{}", TOPIC_NAMESPACE, session_id, role)
}

/// Publishing half of the link, cloneable into async callbacks.
#[derive(Clone)]
pub struct SignalingSender {
    client: AsyncClient,
    topic_outgoing: String,
}

impl SignalingSender {
    /// Publish a signaling payload onto the peer's inbound topic.
    pub async fn send(&self, payload: &serde_json::Value) -> Result<()> {
        let data = serde_json::to_vec(payload)?;
        self.client
            .publish(self.topic_outgoing.as_str(), QoS::AtLeastOnce, false, data)
            .await?;
        Ok(())
    }
}

/// One broker connection, torn down and recreated on every peer restart.
pub struct SignalingLink {
    sender: SignalingSender,
    pump: JoinHandle<()>,
}

impl SignalingLink {
    /// Connect to the broker, subscribe to this role's inbound topic and
    /// forward every parseable payload into `incoming`.
    pub async fn connect(
        broker: (String, u16),
        session_id: &str,
        role: Role,
        incoming: mpsc::UnboundedSender<serde_json::Value>,
    ) -> Result<Self> {
        let (host, port) = broker;
        let client_id = format!("peertun-{}-{:08x}", role, rand::random::<u32>());

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let topic_incoming = topic(session_id, role);
        let topic_outgoing = topic(session_id, role.peer());
        info!("Signaling via {} (session: {})", topic_incoming, session_id);

        let sub_client = client.clone();
        let sub_topic = topic_incoming.clone();
        let pump = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // (Re)subscribe on every connection the broker accepts
                        debug!("Broker connected, subscribing to {}", sub_topic);
                        if let Err(e) = sub_client
                            .subscribe(sub_topic.as_str(), QoS::AtLeastOnce)
                            .await
                        {
                            warn!("Subscribe failed: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic != sub_topic {
                            continue;
                        }
                        match serde_json::from_slice::<serde_json::Value>(&publish.payload) {
                            Ok(payload) => {
                                if incoming.send(payload).is_err() {
                                    // Receiver gone: this link is being torn down
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping malformed signaling payload: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if incoming.is_closed() {
                            break;
                        }
                        warn!("Broker connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            sender: SignalingSender {
                client,
                topic_outgoing,
            },
            pump,
        })
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub async fn send(&self, payload: &serde_json::Value) -> Result<()> {
        self.sender.send(payload).await
    }

    /// Disconnect from the broker and stop the pump task.
    pub async fn close(self) {
        let _ = self.sender.client.disconnect().await;
        self.pump.abort();
    }
}
