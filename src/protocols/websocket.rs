//! WebSocket handler
//!
//! A simulator: it models the handshake, sends and close with short delays
//! and per-URL traffic counters instead of speaking the real protocol. The
//! observable contract is fixed: connect returns 101 with an
//! `Upgrade: websocket` header line, send returns 200 with the bytes-sent
//! counter updated, close returns 200 and releases the registry slot, so a
//! real client can replace the internals without moving the callers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info};

use super::{ProtocolHandler, Registry};
use crate::envelope::{
    status, Protocol, Request, RequestPayload, Response, ResponsePayload, WebSocketStats,
};
use crate::types::EngineError;

/// Modeled handshake latency
const CONNECT_DELAY: Duration = Duration::from_millis(10);
/// Modeled per-message latency
const SEND_DELAY: Duration = Duration::from_millis(1);
/// Modeled close latency
const CLOSE_DELAY: Duration = Duration::from_millis(5);

#[derive(Default)]
struct WsContext {
    subprotocol: String,
    connected: bool,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl WsContext {
    fn stats(&self) -> WebSocketStats {
        WebSocketStats {
            subprotocol: self.subprotocol.clone(),
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}

/// WebSocket handler with a per-URL context registry (one active context
/// per URL)
pub struct WebSocketHandler {
    registry: Registry<String, WsContext>,
}

impl WebSocketHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Registry::new("websocket", capacity),
        }
    }

    /// Model the handshake and mark the per-URL context connected
    pub async fn connect(&self, url: &str, subprotocol: &str) -> Response {
        let entry = match self.registry.get_or_create(url.to_string(), WsContext::default) {
            Ok(e) => e,
            Err(EngineError::RegistryFull(_)) => {
                return Response::failure(
                    Protocol::WebSocket,
                    status::INTERNAL,
                    "Too many WebSocket connections",
                );
            }
            Err(e) => {
                return Response::failure(Protocol::WebSocket, status::INTERNAL, e.to_string())
            }
        };
        let mut ctx = entry.lock().await;

        if ctx.connected {
            let mut resp = Response::success(
                Protocol::WebSocket,
                status::SWITCHING_PROTOCOLS,
                "WebSocket connection already established",
            );
            resp.payload = ResponsePayload::WebSocket(ctx.stats());
            return resp;
        }

        if !subprotocol.is_empty() {
            ctx.subprotocol = subprotocol.to_string();
        }

        sleep(CONNECT_DELAY).await;
        ctx.connected = true;
        info!(url, "WebSocket connection established");

        let mut resp = Response::success(
            Protocol::WebSocket,
            status::SWITCHING_PROTOCOLS,
            "WebSocket connection established",
        );
        resp.set_headers(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade",
        );
        resp.payload = ResponsePayload::WebSocket(ctx.stats());
        resp
    }

    /// Model one outbound message on a connected context
    pub async fn send(&self, url: &str, message: &str) -> Response {
        let Some(entry) = self.registry.get(&url.to_string()) else {
            return Response::failure(Protocol::WebSocket, status::INVALID_STATE, "WebSocket not connected");
        };
        let mut ctx = entry.lock().await;
        if !ctx.connected {
            return Response::failure(Protocol::WebSocket, status::INVALID_STATE, "WebSocket not connected");
        }

        sleep(SEND_DELAY).await;
        ctx.messages_sent += 1;
        ctx.bytes_sent += message.len() as u64;
        debug!(url, bytes = message.len(), "WebSocket send");

        let mut resp = Response::success(
            Protocol::WebSocket,
            status::OK,
            format!("Message sent: {} bytes", message.len()),
        );
        resp.payload = ResponsePayload::WebSocket(ctx.stats());
        resp
    }

    /// Model the close handshake and release the registry slot
    pub async fn close(&self, url: &str) -> Response {
        let key = url.to_string();
        let connected = match self.registry.get(&key) {
            Some(entry) => entry.lock().await.connected,
            None => false,
        };
        if !connected {
            return Response::success(
                Protocol::WebSocket,
                status::OK,
                "WebSocket connection already closed",
            );
        }

        sleep(CLOSE_DELAY).await;
        self.registry.remove(&key);
        info!(url, "WebSocket connection closed");

        Response::success(Protocol::WebSocket, status::OK, "WebSocket connection closed")
    }

    /// Number of URL contexts currently held
    pub fn context_count(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl ProtocolHandler for WebSocketHandler {
    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    async fn execute(&self, request: &Request) -> Response {
        let subprotocol = match &request.payload {
            RequestPayload::WebSocket(ws) => ws.subprotocol.as_str(),
            _ => "",
        };

        match request.method.to_ascii_uppercase().as_str() {
            "CONNECT" => self.connect(&request.url, subprotocol).await,
            "CLOSE" | "DISCONNECT" => self.close(&request.url).await,
            _ => self.send(&request.url, &request.body).await,
        }
    }
}
