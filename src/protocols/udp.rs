//! UDP handler
//!
//! Maintains a per-(host, port) endpoint registry. An endpoint's socket is
//! created unbound so plain sends pick an ephemeral local port; a receive
//! attempts a best-effort bind to the endpoint port first, tolerating
//! already-bound sockets so send-then-receive flows keep working.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::{parse_endpoint_url, resolve_host, ProtocolHandler, Registry};
use crate::envelope::{status, Protocol, Request, Response, ResponsePayload, UdpStats};
use crate::types::EngineError;

/// Readiness window for receives
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default port when a `udp://` URL has none (DNS)
const DEFAULT_PORT: u16 = 53;
/// Receive buffer size, matching the body cap
const RECV_BUF_LEN: usize = crate::envelope::MAX_BODY_LEN;

struct UdpEntry {
    bound: bool,
    socket: Option<UdpSocket>,
}

impl UdpEntry {
    fn new() -> Self {
        Self {
            bound: false,
            socket: None,
        }
    }

    fn fd(&self) -> i32 {
        self.socket.as_ref().map_or(-1, raw_fd)
    }
}

#[cfg(unix)]
fn raw_fd(socket: &UdpSocket) -> i32 {
    use std::os::unix::io::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(not(unix))]
fn raw_fd(_socket: &UdpSocket) -> i32 {
    -1
}

/// Build a nonblocking datagram socket with `SO_REUSEADDR`
fn new_datagram_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// UDP handler with its endpoint registry
pub struct UdpHandler {
    registry: Registry<(String, u16), UdpEntry>,
}

impl UdpHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Registry::new("udp", capacity),
        }
    }

    /// Create (or reuse) the endpoint socket for `host:port`
    pub async fn create_endpoint(&self, host: &str, port: u16) -> Response {
        let entry = match self
            .registry
            .get_or_create((host.to_string(), port), UdpEntry::new)
        {
            Ok(e) => e,
            Err(EngineError::RegistryFull(_)) => {
                return Response::failure(Protocol::Udp, status::INTERNAL, "Too many UDP endpoints");
            }
            Err(e) => return Response::failure(Protocol::Udp, status::INTERNAL, e.to_string()),
        };
        let mut entry = entry.lock().await;

        if entry.bound {
            return Response::success(
                Protocol::Udp,
                status::OK,
                format!("UDP endpoint already created for {host}:{port}"),
            )
            .with_payload(ResponsePayload::Udp(UdpStats {
                socket_fd: entry.fd(),
                ..UdpStats::default()
            }));
        }

        let socket = match new_datagram_socket() {
            Ok(s) => s,
            Err(e) => {
                return Response::failure(
                    Protocol::Udp,
                    status::INTERNAL,
                    format!("Failed to create UDP socket: {e}"),
                );
            }
        };

        debug!(host, port, "UDP endpoint created");
        let fd = raw_fd(&socket);
        entry.socket = Some(socket);
        entry.bound = true;

        Response::success(
            Protocol::Udp,
            status::OK,
            format!("UDP endpoint created for {host}:{port}"),
        )
        .with_payload(ResponsePayload::Udp(UdpStats {
            socket_fd: fd,
            ..UdpStats::default()
        }))
    }

    /// Send one datagram to `host:port`, auto-creating the endpoint and
    /// resolving the destination name on every call
    pub async fn send(&self, host: &str, port: u16, data: &[u8]) -> Response {
        let needs_create = match self.registry.get(&(host.to_string(), port)) {
            Some(entry) => !entry.lock().await.bound,
            None => true,
        };
        if needs_create {
            let created = self.create_endpoint(host, port).await;
            if !created.success {
                return Response::failure(
                    Protocol::Udp,
                    status::INVALID_STATE,
                    "Failed to create UDP endpoint",
                );
            }
        }
        let entry = self
            .registry
            .get(&(host.to_string(), port))
            .expect("endpoint created above");
        let entry = entry.lock().await;

        let Some(dest) = resolve_host(host, port).await else {
            return Response::failure(
                Protocol::Udp,
                status::NOT_FOUND,
                format!("Host not found: {host}"),
            );
        };

        let socket = entry.socket.as_ref().expect("bound entry without socket");
        match socket.send_to(data, dest).await {
            Ok(n) => {
                debug!(host, port, bytes = n, "UDP send");
                Response::success(
                    Protocol::Udp,
                    status::OK,
                    format!("Sent {n} bytes to {host}:{port} via UDP"),
                )
                .with_payload(ResponsePayload::Udp(UdpStats {
                    socket_fd: entry.fd(),
                    bytes_sent: n as u64,
                    sender_address: host.to_string(),
                    sender_port: port,
                    ..UdpStats::default()
                }))
            }
            Err(e) => {
                Response::failure(Protocol::Udp, status::INTERNAL, format!("UDP send failed: {e}"))
            }
        }
    }

    /// Wait up to one second for a datagram on the endpoint socket.
    ///
    /// Attempts a best-effort local bind to the endpoint port first so a
    /// receive-only endpoint can accept unsolicited traffic; a socket that
    /// already picked an ephemeral port (from a previous send) keeps it.
    pub async fn receive(&self, host: &str, port: u16) -> Response {
        let Some(entry) = self.registry.get(&(host.to_string(), port)) else {
            return Response::failure(Protocol::Udp, status::INVALID_STATE, "No UDP endpoint available");
        };
        let entry = entry.lock().await;
        if !entry.bound {
            return Response::failure(Protocol::Udp, status::INVALID_STATE, "No UDP endpoint available");
        }

        let socket = entry.socket.as_ref().expect("bound entry without socket");
        let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        // Already-bound (EINVAL) or in-use errors are tolerated
        let _ = SockRef::from(socket).bind(&local.into());

        let mut buf = vec![0u8; RECV_BUF_LEN];
        match tokio::time::timeout(RECEIVE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Err(_) => Response::success(Protocol::Udp, status::NO_DATA, "No UDP data available")
                .with_payload(ResponsePayload::Udp(UdpStats {
                    socket_fd: entry.fd(),
                    ..UdpStats::default()
                })),
            Ok(Ok((n, sender))) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                debug!(host, port, bytes = n, sender = %sender, "UDP receive");
                Response::success(
                    Protocol::Udp,
                    status::OK,
                    format!("Received {n} bytes from {sender} via UDP"),
                )
                .with_payload(ResponsePayload::Udp(UdpStats {
                    socket_fd: entry.fd(),
                    bytes_received: n as u64,
                    sender_address: sender.ip().to_string(),
                    sender_port: sender.port(),
                    received_data: crate::envelope::truncate_to(data, RECV_BUF_LEN),
                    ..UdpStats::default()
                }))
            }
            Ok(Err(e)) => Response::failure(
                Protocol::Udp,
                status::INTERNAL,
                format!("UDP receive failed: {e}"),
            ),
        }
    }

    /// Close the endpoint socket; the registry slot is kept for reuse
    pub async fn close_endpoint(&self, host: &str, port: u16) -> Response {
        let Some(entry) = self.registry.get(&(host.to_string(), port)) else {
            return Response::failure(Protocol::Udp, status::INVALID_STATE, "No UDP endpoint to close");
        };
        let mut entry = entry.lock().await;
        if !entry.bound {
            return Response::failure(Protocol::Udp, status::INVALID_STATE, "No UDP endpoint to close");
        }

        entry.socket = None;
        entry.bound = false;
        info!(host, port, "UDP endpoint closed");
        Response::success(
            Protocol::Udp,
            status::OK,
            format!("UDP endpoint for {host}:{port} closed successfully"),
        )
    }
}

#[async_trait]
impl ProtocolHandler for UdpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    async fn execute(&self, request: &Request) -> Response {
        let Some((host, port)) = parse_endpoint_url(&request.url, DEFAULT_PORT) else {
            return Response::failure(
                Protocol::Udp,
                status::INVALID_STATE,
                format!("invalid UDP URL: {}", request.url),
            );
        };

        match request.method.to_ascii_uppercase().as_str() {
            "CREATE" => self.create_endpoint(&host, port).await,
            "RECEIVE" | "RECV" => self.receive(&host, port).await,
            "CLOSE" => self.close_endpoint(&host, port).await,
            _ => self.send(&host, port, request.body.as_bytes()).await,
        }
    }
}
