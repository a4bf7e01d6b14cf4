//! Request forwarder against the local target server.
//!
//! Each tunnel request is replayed as a real HTTP request; the real
//! response is streamed back as start/chunk/end messages without buffering
//! the body. Every request runs in its own task so a slow target path
//! never blocks the rest of the tunnel.

use anyhow::Context;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use peertun_shared::chunk::{Reassembler, FRAGMENT_SIZE};
use peertun_shared::config::Config;
use peertun_shared::peer::{PeerEvent, PeerHandle};
use peertun_shared::protocol::{self, decode_frame, TunnelMessage};

/// Connection-scoped request headers that must not reach the target.
const STRIPPED_HEADERS: [&str; 2] = ["host", "connection"];

#[derive(Clone)]
pub struct Forwarder {
    peer: PeerHandle,
    http: reqwest::Client,
    target_base: String,
}

impl Forwarder {
    pub fn new(peer: PeerHandle, config: &Config) -> Self {
        Self {
            peer,
            http: reqwest::Client::new(),
            target_base: format!("http://{}:{}", config.target_host, config.target_port),
        }
    }

    /// Consume peer events, spawning one forwarding task per request.
    pub async fn run(self, mut events: mpsc::Receiver<PeerEvent>) {
        let mut reassembler = Reassembler::new();
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Connected => info!("Peer connected. Tunnel is ready"),
                PeerEvent::Data(frame) => match decode_frame(&frame, &mut reassembler) {
                    Ok(Some(TunnelMessage::Request {
                        req_id,
                        method,
                        url,
                        headers,
                        body,
                    })) => {
                        let forwarder = self.clone();
                        tokio::spawn(async move {
                            forwarder.forward(req_id, method, url, headers, body).await;
                        });
                    }
                    Ok(Some(other)) => {
                        warn!("Ignoring unexpected tunnel message (reqId {})", other.req_id());
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping invalid tunnel message: {}", e),
                },
                PeerEvent::Closed => {
                    reassembler = Reassembler::new();
                    info!("Peer disconnected");
                }
            }
        }
    }

    async fn forward(
        &self,
        req_id: String,
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        body: Option<String>,
    ) {
        info!("Forwarding {} {}", method, url);

        match self.proxy_request(&method, &url, headers, body).await {
            Ok(response) => match self.stream_response(&req_id, response).await {
                Ok(status) => info!("Completed {} {} [{}]", method, url, status),
                Err(e) => {
                    // The target (or the tunnel) died mid-response. A
                    // response-error is sent even if response-start already
                    // went out, so the client can abort instead of hanging.
                    warn!("Streaming {} {} failed: {:#}", method, url, e);
                    self.send_error(&req_id, &format!("{:#}", e)).await;
                }
            },
            Err(e) => {
                warn!("Request {} {} failed: {:#}", method, url, e);
                self.send_error(&req_id, &format!("{:#}", e)).await;
            }
        }
    }

    async fn proxy_request(
        &self,
        method: &str,
        url: &str,
        headers: Vec<(String, String)>,
        body: Option<String>,
    ) -> anyhow::Result<reqwest::Response> {
        let method =
            reqwest::Method::from_bytes(method.as_bytes()).context("Invalid request method")?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.target_base, url));

        for (name, value) in &headers {
            if STRIPPED_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(body) = body {
            request = request.body(protocol::from_base64(&body)?);
        }

        Ok(request.send().await?)
    }

    /// Send response-start, stream body chunks, then response-end.
    async fn stream_response(
        &self,
        req_id: &str,
        response: reqwest::Response,
    ) -> anyhow::Result<u16> {
        let status_code = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect();

        // Headers go back before any body is available, preserving
        // streaming semantics across the tunnel.
        self.peer
            .send(&TunnelMessage::ResponseStart {
                req_id: req_id.to_string(),
                status_code,
                headers,
            })
            .await?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Target connection failed mid-body")?;
            for piece in chunk.chunks(FRAGMENT_SIZE) {
                self.peer
                    .send(&TunnelMessage::ResponseChunk {
                        req_id: req_id.to_string(),
                        data: protocol::to_base64(piece),
                    })
                    .await?;
            }
        }

        self.peer
            .send(&TunnelMessage::ResponseEnd {
                req_id: req_id.to_string(),
            })
            .await?;
        Ok(status_code)
    }

    async fn send_error(&self, req_id: &str, error: &str) {
        let message = TunnelMessage::ResponseError {
            req_id: req_id.to_string(),
            error: error.to_string(),
        };
        if let Err(e) = self.peer.send(&message).await {
            warn!("Failed to report tunnel error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One-shot HTTP server returning a canned response; resolves to the
    /// raw request it received.
    async fn canned_target(
        response: &'static str,
        expect_in_request: &'static str,
    ) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if text.contains("\r\n\r\n") && text.contains(expect_in_request) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (port, handle)
    }

    fn forwarder_for_port(port: u16) -> (Forwarder, mpsc::Receiver<Bytes>) {
        let (peer, rx) = PeerHandle::channel(64);
        peer.set_connected(true);
        let config = Config {
            target_port: port,
            ..Config::default()
        };
        (Forwarder::new(peer, &config), rx)
    }

    /// Drain outbound frames until a terminal message arrives.
    async fn collect_messages(rx: &mut mpsc::Receiver<Bytes>) -> Vec<TunnelMessage> {
        let mut reasm = Reassembler::new();
        let mut messages = Vec::new();
        loop {
            let frame = rx.recv().await.expect("outbound channel open");
            if let Some(msg) = decode_frame(&frame, &mut reasm).unwrap() {
                let terminal = matches!(
                    msg,
                    TunnelMessage::ResponseEnd { .. } | TunnelMessage::ResponseError { .. }
                );
                messages.push(msg);
                if terminal {
                    break;
                }
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_round_trip_fidelity() {
        let (port, target) = canned_target(
            "HTTP/1.1 200 OK\r\nx-test: 1\r\ncontent-length: 5\r\n\r\nworld",
            "GET /hello",
        )
        .await;
        let (forwarder, mut rx) = forwarder_for_port(port);

        forwarder
            .forward(
                "r1".into(),
                "GET".into(),
                "/hello".into(),
                vec![
                    ("host".into(), "example.com".into()),
                    ("connection".into(), "keep-alive".into()),
                    ("x-custom".into(), "abc".into()),
                ],
                None,
            )
            .await;

        let messages = collect_messages(&mut rx).await;
        match &messages[0] {
            TunnelMessage::ResponseStart {
                req_id,
                status_code,
                headers,
            } => {
                assert_eq!(req_id, "r1");
                assert_eq!(*status_code, 200);
                assert!(headers.contains(&("x-test".to_string(), "1".to_string())));
            }
            other => panic!("expected response-start, got {:?}", other),
        }

        let mut body = Vec::new();
        for msg in &messages[1..messages.len() - 1] {
            match msg {
                TunnelMessage::ResponseChunk { data, .. } => {
                    body.extend_from_slice(&protocol::from_base64(data).unwrap());
                }
                other => panic!("expected response-chunk, got {:?}", other),
            }
        }
        assert_eq!(body, b"world");
        assert!(matches!(
            messages.last(),
            Some(TunnelMessage::ResponseEnd { req_id }) if req_id == "r1"
        ));

        // the original Host/Connection values never reach the target
        let raw = target.await.unwrap();
        assert!(raw.contains("x-custom: abc"));
        assert!(!raw.contains("example.com"));
        assert!(!raw.contains("keep-alive"));
    }

    #[tokio::test]
    async fn test_request_body_forwarded() {
        let (port, target) = canned_target(
            "HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n",
            "ping",
        )
        .await;
        let (forwarder, mut rx) = forwarder_for_port(port);

        forwarder
            .forward(
                "r2".into(),
                "POST".into(),
                "/submit".into(),
                vec![],
                Some(protocol::to_base64(b"ping")),
            )
            .await;

        let messages = collect_messages(&mut rx).await;
        assert!(matches!(
            &messages[0],
            TunnelMessage::ResponseStart { status_code: 204, .. }
        ));

        let raw = target.await.unwrap();
        assert!(raw.starts_with("POST /submit"));
        assert!(raw.ends_with("ping"));
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_error() {
        // bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (forwarder, mut rx) = forwarder_for_port(port);

        forwarder
            .forward("r3".into(), "GET".into(), "/hello".into(), vec![], None)
            .await;

        let messages = collect_messages(&mut rx).await;
        assert_eq!(messages.len(), 1, "no start/chunk before the error");
        match &messages[0] {
            TunnelMessage::ResponseError { req_id, error } => {
                assert_eq!(req_id, "r3");
                assert!(!error.is_empty());
            }
            other => panic!("expected response-error, got {:?}", other),
        }
    }
}
