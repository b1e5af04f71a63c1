//! Raw TCP handler
//!
//! Maintains a per-(host, port) registry of stream connections. Sockets are
//! owned by registry entries, so every exit path, including DNS failure and
//! readiness timeout, releases the descriptor when the entry drops it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{parse_endpoint_url, resolve_host, ProtocolHandler, Registry};
use crate::envelope::{status, Protocol, Request, Response, ResponsePayload, TcpStats};
use crate::types::EngineError;

/// Hard budget for connection establishment
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Readiness window for receives
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default port when a `tcp://` URL has none
const DEFAULT_PORT: u16 = 80;
/// Receive buffer size, matching the body cap
const RECV_BUF_LEN: usize = crate::envelope::MAX_BODY_LEN;

struct TcpEntry {
    live: bool,
    stream: Option<TcpStream>,
}

impl TcpEntry {
    fn new() -> Self {
        Self {
            live: false,
            stream: None,
        }
    }

    fn fd(&self) -> i32 {
        self.stream.as_ref().map_or(-1, raw_fd)
    }

    /// Drop the socket and clear the live flag; the registry slot remains
    fn close(&mut self) {
        self.live = false;
        self.stream = None;
    }
}

#[cfg(unix)]
fn raw_fd(stream: &TcpStream) -> i32 {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(not(unix))]
fn raw_fd(_stream: &TcpStream) -> i32 {
    -1
}

/// TCP handler with its connection registry
pub struct TcpHandler {
    registry: Registry<(String, u16), TcpEntry>,
}

impl TcpHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Registry::new("tcp", capacity),
        }
    }

    /// Establish a connection to `host:port`.
    ///
    /// Resolution failure maps to 404, the 5-second connect budget to 408,
    /// other I/O errors to 500. Connecting while already live is a no-op
    /// success.
    pub async fn connect(&self, host: &str, port: u16) -> Response {
        let entry = match self
            .registry
            .get_or_create((host.to_string(), port), TcpEntry::new)
        {
            Ok(e) => e,
            Err(EngineError::RegistryFull(_)) => {
                return Response::failure(
                    Protocol::Tcp,
                    status::INTERNAL,
                    "Too many TCP connections",
                );
            }
            Err(e) => return Response::failure(Protocol::Tcp, status::INTERNAL, e.to_string()),
        };
        let mut entry = entry.lock().await;

        if entry.live {
            return Response::success(
                Protocol::Tcp,
                status::OK,
                format!("TCP connection already established to {host}:{port}"),
            )
            .with_payload(ResponsePayload::Tcp(TcpStats {
                socket_fd: entry.fd(),
                ..TcpStats::default()
            }));
        }

        let Some(addr) = resolve_host(host, port).await else {
            return Response::failure(
                Protocol::Tcp,
                status::NOT_FOUND,
                format!("Host not found: {host}"),
            );
        };

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Response::failure(
                    Protocol::Tcp,
                    status::INTERNAL,
                    format!("Connection failed: {e}"),
                );
            }
            Err(_) => {
                return Response::failure(Protocol::Tcp, status::TIMEOUT, "Connection timeout");
            }
        };

        info!(host, port, "TCP connection established");
        let fd = raw_fd(&stream);
        entry.live = true;
        entry.stream = Some(stream);

        Response::success(
            Protocol::Tcp,
            status::OK,
            format!("TCP connection established to {host}:{port}"),
        )
        .with_payload(ResponsePayload::Tcp(TcpStats {
            socket_fd: fd,
            ..TcpStats::default()
        }))
    }

    /// Write `data` once on the live connection to `host:port`
    pub async fn send(&self, host: &str, port: u16, data: &[u8]) -> Response {
        let Some(entry) = self.registry.get(&(host.to_string(), port)) else {
            return Response::failure(Protocol::Tcp, status::INVALID_STATE, "No active TCP connection");
        };
        let mut entry = entry.lock().await;
        if !entry.live {
            return Response::failure(Protocol::Tcp, status::INVALID_STATE, "No active TCP connection");
        }

        let fd = entry.fd();
        let stream = entry.stream.as_mut().expect("live entry without stream");

        match stream.write(data).await {
            Ok(n) => {
                debug!(host, port, bytes = n, "TCP send");
                Response::success(
                    Protocol::Tcp,
                    status::OK,
                    format!("Sent {n} bytes to {host}:{port}"),
                )
                .with_payload(ResponsePayload::Tcp(TcpStats {
                    socket_fd: fd,
                    bytes_sent: n as u64,
                    ..TcpStats::default()
                }))
            }
            Err(e) => {
                entry.close();
                Response::failure(Protocol::Tcp, status::INTERNAL, format!("Send failed: {e}"))
            }
        }
    }

    /// Read whatever arrives within the 1-second readiness window.
    ///
    /// A quiet window is a 204 success; a peer close is a 410 failure and
    /// the registry entry goes not-live.
    pub async fn receive(&self, host: &str, port: u16) -> Response {
        let Some(entry) = self.registry.get(&(host.to_string(), port)) else {
            return Response::failure(Protocol::Tcp, status::INVALID_STATE, "No active TCP connection");
        };
        let mut entry = entry.lock().await;
        if !entry.live {
            return Response::failure(Protocol::Tcp, status::INVALID_STATE, "No active TCP connection");
        }

        let fd = entry.fd();
        let stream = entry.stream.as_mut().expect("live entry without stream");
        let mut buf = vec![0u8; RECV_BUF_LEN];

        match tokio::time::timeout(RECEIVE_TIMEOUT, stream.read(&mut buf)).await {
            Err(_) => {
                // Nothing arrived inside the window
                Response::success(Protocol::Tcp, status::NO_DATA, "No data available")
                    .with_payload(ResponsePayload::Tcp(TcpStats {
                        socket_fd: fd,
                        ..TcpStats::default()
                    }))
            }
            Ok(Ok(0)) => {
                entry.close();
                info!(host, port, "TCP peer closed connection");
                Response::failure(Protocol::Tcp, status::GONE, "Connection closed by peer")
            }
            Ok(Ok(n)) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                let mut resp = Response::success(
                    Protocol::Tcp,
                    status::OK,
                    format!("Received {n} bytes from {host}:{port}"),
                );
                resp.payload = ResponsePayload::Tcp(TcpStats {
                    socket_fd: fd,
                    bytes_received: n as u64,
                    received_data: crate::envelope::truncate_to(data, RECV_BUF_LEN),
                    ..TcpStats::default()
                });
                resp
            }
            Ok(Err(e)) => {
                Response::failure(Protocol::Tcp, status::INTERNAL, format!("Receive failed: {e}"))
            }
        }
    }

    /// Close the live connection; the registry slot is kept for reuse
    pub async fn disconnect(&self, host: &str, port: u16) -> Response {
        let Some(entry) = self.registry.get(&(host.to_string(), port)) else {
            return Response::failure(
                Protocol::Tcp,
                status::INVALID_STATE,
                "No active TCP connection to disconnect",
            );
        };
        let mut entry = entry.lock().await;
        if !entry.live {
            return Response::failure(
                Protocol::Tcp,
                status::INVALID_STATE,
                "No active TCP connection to disconnect",
            );
        }

        entry.close();
        info!(host, port, "TCP connection closed");
        Response::success(
            Protocol::Tcp,
            status::OK,
            format!("TCP connection to {host}:{port} closed successfully"),
        )
    }

    /// Whether the registry entry for `host:port` is currently live
    pub async fn is_live(&self, host: &str, port: u16) -> bool {
        match self.registry.get(&(host.to_string(), port)) {
            Some(entry) => entry.lock().await.live,
            None => false,
        }
    }
}

#[async_trait]
impl ProtocolHandler for TcpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn execute(&self, request: &Request) -> Response {
        let Some((host, port)) = parse_endpoint_url(&request.url, DEFAULT_PORT) else {
            return Response::failure(
                Protocol::Tcp,
                status::INVALID_STATE,
                format!("invalid TCP URL: {}", request.url),
            );
        };

        match request.method.to_ascii_uppercase().as_str() {
            "CONNECT" => self.connect(&host, port).await,
            "RECEIVE" | "RECV" => self.receive(&host, port).await,
            "DISCONNECT" | "CLOSE" => self.disconnect(&host, port).await,
            _ => self.send(&host, port, request.body.as_bytes()).await,
        }
    }
}
