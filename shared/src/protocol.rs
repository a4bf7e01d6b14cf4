//! Tunnel wire protocol.
//!
//! Every frame on the data channel is a JSON object with a `type`
//! discriminator. HTTP bodies and body fragments are base64 inside JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chunk::{Fragment, Reassembler};
use crate::error::Result;

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs next to the real server and forwards tunnel requests to it.
    Host,
    /// Runs next to the consumer and exposes the local HTTP listener.
    Client,
}

impl Role {
    /// The counter-role this process rendezvouses with.
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Client,
            Role::Client => Role::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages multiplexed over the data channel.
///
/// For a given `req_id` the client observes `response-start`, zero or more
/// `response-chunk`, then exactly one terminal `response-end` or
/// `response-error`. Ordering is guaranteed by the channel itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TunnelMessage {
    /// Client → host, one per local HTTP request.
    #[serde(rename_all = "camelCase")]
    Request {
        req_id: String,
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// Host → client, once per request, before any body chunk.
    #[serde(rename_all = "camelCase")]
    ResponseStart {
        req_id: String,
        status_code: u16,
        headers: Vec<(String, String)>,
    },
    /// Host → client, one size-bounded fragment of the response body.
    #[serde(rename_all = "camelCase")]
    ResponseChunk { req_id: String, data: String },
    /// Host → client, terminal: the response completed.
    #[serde(rename_all = "camelCase")]
    ResponseEnd { req_id: String },
    /// Host → client, terminal: forwarding itself failed.
    #[serde(rename_all = "camelCase")]
    ResponseError { req_id: String, error: String },
}

impl TunnelMessage {
    /// Correlation id binding this message to its request.
    pub fn req_id(&self) -> &str {
        match self {
            TunnelMessage::Request { req_id, .. }
            | TunnelMessage::ResponseStart { req_id, .. }
            | TunnelMessage::ResponseChunk { req_id, .. }
            | TunnelMessage::ResponseEnd { req_id }
            | TunnelMessage::ResponseError { req_id, .. } => req_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Decode one raw data-channel frame.
///
/// Oversized messages travel as `chunk` fragments; those are buffered in the
/// reassembler until complete. Returns `Ok(None)` while a fragmented message
/// is still partial.
pub fn decode_frame(data: &[u8], reassembler: &mut Reassembler) -> Result<Option<TunnelMessage>> {
    if let Ok(fragment) = serde_json::from_slice::<Fragment>(data) {
        return match reassembler.push(fragment)? {
            Some(whole) => Ok(Some(TunnelMessage::from_bytes(&whole)?)),
            None => Ok(None),
        };
    }
    Ok(Some(TunnelMessage::from_bytes(data)?))
}

/// Fresh collision-resistant correlation id (16 hex chars).
pub fn request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

pub fn to_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn from_base64(data: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(data)?)
}
