//! Local HTTP listener and request multiplexer.
//!
//! Every inbound request gets a fresh correlation id and a pending entry
//! holding its response sink; tunnel messages arriving on the shared data
//! channel are replayed onto the matching sink in channel order. Each
//! request sees exactly one terminal outcome: a completed stream, an error
//! body, or an immediate 503 while the tunnel is down.

use async_stream::stream;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use peertun_shared::chunk::Reassembler;
use peertun_shared::peer::{PeerEvent, PeerHandle};
use peertun_shared::protocol::{self, decode_frame, TunnelMessage};

/// Cap on buffered request bodies; request bodies are not streamed.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

/// Sink half of one in-flight request.
struct PendingResponse {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: mpsc::UnboundedSender<io::Result<Bytes>>,
}

#[derive(Clone)]
pub struct ClientState {
    peer: PeerHandle,
    pending: Arc<DashMap<String, PendingResponse>>,
}

impl ClientState {
    pub fn new(peer: PeerHandle) -> Self {
        Self {
            peer,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Drop every pending sink. Orphaned callers observe their response
    /// stream closing; no terminal tunnel message will ever arrive for them.
    fn clear_pending(&self) -> usize {
        let orphaned = self.pending.len();
        self.pending.clear();
        orphaned
    }
}

/// Proxy one local HTTP request through the tunnel.
pub async fn proxy_handler(State(state): State<ClientState>, req: Request<Body>) -> Response {
    if !state.peer.is_connected() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel not connected yet. Please wait...",
        )
            .into_response();
    }

    let method = req.method().to_string();
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|val| (k.as_str().to_string(), val.to_string()))
        })
        .collect();

    let body_bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE).await {
        Ok(b) => b,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response()
        }
    };

    let req_id = protocol::request_id();
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, mut body_rx) = mpsc::unbounded_channel();
    state.pending.insert(
        req_id.clone(),
        PendingResponse {
            head: Some(head_tx),
            body: body_tx,
        },
    );

    let message = TunnelMessage::Request {
        req_id: req_id.clone(),
        method,
        url,
        headers,
        body: if body_bytes.is_empty() {
            None
        } else {
            Some(protocol::to_base64(&body_bytes))
        },
    };

    if let Err(e) = state.peer.send(&message).await {
        warn!("Failed to send request through tunnel: {}", e);
        state.pending.remove(&req_id);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to send request through tunnel",
        )
            .into_response();
    }

    // Resolved by response-start, or by the sweep on peer loss.
    let head = match head_rx.await {
        Ok(head) => head,
        Err(_) => {
            return (
                StatusCode::BAD_GATEWAY,
                "Tunnel disconnected before a response arrived",
            )
                .into_response()
        }
    };

    let mut builder =
        Response::builder().status(StatusCode::from_u16(head.status).unwrap_or(StatusCode::OK));
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in head.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                headers_mut.append(name, value);
            }
        }
    }

    let body = Body::from_stream(stream! {
        while let Some(chunk) = body_rx.recv().await {
            yield chunk;
        }
    });

    match builder.body(body) {
        Ok(resp) => resp.into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

/// Consume peer events and replay tunnel messages onto pending sinks.
pub async fn dispatch(state: ClientState, mut events: mpsc::Receiver<PeerEvent>) {
    let mut reassembler = Reassembler::new();
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Connected => info!("Connected to host. Ready to browse"),
            PeerEvent::Data(frame) => match decode_frame(&frame, &mut reassembler) {
                Ok(Some(message)) => handle_message(&state, message),
                Ok(None) => {}
                Err(e) => warn!("Dropping invalid tunnel message: {}", e),
            },
            PeerEvent::Closed => {
                reassembler = Reassembler::new();
                let orphaned = state.clear_pending();
                if orphaned > 0 {
                    warn!("Disconnected with {} request(s) in flight", orphaned);
                }
            }
        }
    }
}

fn handle_message(state: &ClientState, message: TunnelMessage) {
    match message {
        TunnelMessage::ResponseStart {
            req_id,
            status_code,
            headers,
        } => {
            if let Some(mut entry) = state.pending.get_mut(&req_id) {
                if let Some(head) = entry.head.take() {
                    let _ = head.send(ResponseHead {
                        status: status_code,
                        headers,
                    });
                }
            }
        }
        TunnelMessage::ResponseChunk { req_id, data } => {
            if let Some(entry) = state.pending.get(&req_id) {
                match protocol::from_base64(&data) {
                    Ok(bytes) => {
                        let _ = entry.body.send(Ok(Bytes::from(bytes)));
                    }
                    Err(e) => warn!("Dropping undecodable chunk for {}: {}", req_id, e),
                }
            }
        }
        TunnelMessage::ResponseEnd { req_id } => {
            // Dropping the entry closes the body stream cleanly.
            state.pending.remove(&req_id);
        }
        TunnelMessage::ResponseError { req_id, error } => {
            if let Some((_, mut entry)) = state.pending.remove(&req_id) {
                warn!("Tunnel error for request {}: {}", req_id, error);
                match entry.head.take() {
                    Some(head) => {
                        let _ = head.send(ResponseHead {
                            status: 500,
                            headers: vec![],
                        });
                        let _ = entry
                            .body
                            .send(Ok(Bytes::from(format!("Tunnel Error: {}", error))));
                    }
                    None => {
                        // Headers already written: abort the stream so the
                        // caller sees a truncated transfer, not a clean end.
                        let _ = entry
                            .body
                            .send(Err(io::Error::other(format!("Tunnel Error: {}", error))));
                    }
                }
            }
        }
        TunnelMessage::Request { req_id, .. } => {
            warn!("Ignoring unexpected request message (reqId {})", req_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peertun_shared::protocol::to_base64;

    fn local_request(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Pull the next outbound request frame and return its correlation id.
    async fn next_req_id(rx: &mut mpsc::Receiver<Bytes>) -> String {
        let frame = rx.recv().await.unwrap();
        let mut reasm = Reassembler::new();
        match decode_frame(&frame, &mut reasm).unwrap() {
            Some(TunnelMessage::Request { req_id, .. }) => req_id,
            other => panic!("expected request frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_fast_when_disconnected() {
        let (peer, _rx) = PeerHandle::channel(8);
        let state = ClientState::new(peer);

        let resp = proxy_handler(
            State(state.clone()),
            local_request("GET", "/hello", Body::empty()),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_streamed_response_round_trip() {
        let (peer, mut out_rx) = PeerHandle::channel(8);
        peer.set_connected(true);
        let state = ClientState::new(peer);

        let task = tokio::spawn(proxy_handler(
            State(state.clone()),
            local_request("GET", "/hello", Body::empty()),
        ));

        let req_id = next_req_id(&mut out_rx).await;
        handle_message(
            &state,
            TunnelMessage::ResponseStart {
                req_id: req_id.clone(),
                status_code: 200,
                headers: vec![("x-test".into(), "1".into())],
            },
        );
        handle_message(
            &state,
            TunnelMessage::ResponseChunk {
                req_id: req_id.clone(),
                data: to_base64(b"wor"),
            },
        );
        handle_message(
            &state,
            TunnelMessage::ResponseChunk {
                req_id: req_id.clone(),
                data: to_base64(b"ld"),
            },
        );
        handle_message(&state, TunnelMessage::ResponseEnd { req_id: req_id.clone() });

        let resp = task.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-test").unwrap(), "1");
        assert_eq!(body_string(resp).await, "world");
        assert!(state.pending.is_empty());

        // late messages for a finished request are ignored
        handle_message(&state, TunnelMessage::ResponseEnd { req_id });
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_forwarding_error_becomes_500() {
        let (peer, mut out_rx) = PeerHandle::channel(8);
        peer.set_connected(true);
        let state = ClientState::new(peer);

        let task = tokio::spawn(proxy_handler(
            State(state.clone()),
            local_request("GET", "/broken", Body::empty()),
        ));

        let req_id = next_req_id(&mut out_rx).await;
        handle_message(
            &state,
            TunnelMessage::ResponseError {
                req_id,
                error: "connection refused".into(),
            },
        );

        let resp = task.await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(resp).await, "Tunnel Error: connection refused");
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate_independently() {
        let (peer, mut out_rx) = PeerHandle::channel(8);
        peer.set_connected(true);
        let state = ClientState::new(peer);

        let slow = tokio::spawn(proxy_handler(
            State(state.clone()),
            local_request("GET", "/slow", Body::empty()),
        ));
        let slow_id = next_req_id(&mut out_rx).await;

        let fast = tokio::spawn(proxy_handler(
            State(state.clone()),
            local_request("GET", "/fast", Body::empty()),
        ));
        let fast_id = next_req_id(&mut out_rx).await;
        assert_ne!(slow_id, fast_id);

        // interleave: fast completes while slow is still streaming
        handle_message(
            &state,
            TunnelMessage::ResponseStart {
                req_id: slow_id.clone(),
                status_code: 200,
                headers: vec![],
            },
        );
        handle_message(
            &state,
            TunnelMessage::ResponseError {
                req_id: fast_id,
                error: "connection refused".into(),
            },
        );
        handle_message(
            &state,
            TunnelMessage::ResponseChunk {
                req_id: slow_id.clone(),
                data: to_base64(b"ok"),
            },
        );
        handle_message(&state, TunnelMessage::ResponseEnd { req_id: slow_id });

        let fast_resp = fast.await.unwrap();
        assert_eq!(fast_resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let slow_resp = slow.await.unwrap();
        assert_eq!(slow_resp.status(), StatusCode::OK);
        assert_eq!(body_string(slow_resp).await, "ok");
    }

    #[tokio::test]
    async fn test_peer_loss_sweeps_pending() {
        let (peer, mut out_rx) = PeerHandle::channel(8);
        peer.set_connected(true);
        let state = ClientState::new(peer);

        let task = tokio::spawn(proxy_handler(
            State(state.clone()),
            local_request("GET", "/orphaned", Body::empty()),
        ));
        let _ = next_req_id(&mut out_rx).await;

        assert_eq!(state.clear_pending(), 1);

        let resp = task.await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(state.pending.is_empty());
    }
}
