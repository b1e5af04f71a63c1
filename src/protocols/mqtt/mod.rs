//! MQTT handler
//!
//! Enough of MQTT 3.1.1 for load generation: CONNECT, PUBLISH, SUBSCRIBE,
//! UNSUBSCRIBE, DISCONNECT against a broker, with a per-(host, port,
//! client id) connection registry. QoS 1/2 publishes draw a packet id but
//! acknowledgements are not awaited; any byte received after CONNECT is
//! treated as a successful CONNACK.

pub mod framing;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use self::framing::QoS;
use super::{resolve_host, ProtocolHandler, Registry};
use crate::envelope::{status, MqttStats, Protocol, Request, Response, ResponsePayload};
use crate::types::EngineError;

/// Default broker port
const DEFAULT_PORT: u16 = 1883;
/// Default keep-alive when a generic request does not carry one
const DEFAULT_KEEP_ALIVE_SECONDS: u16 = 60;

struct MqttConn {
    live: bool,
    stream: Option<TcpStream>,
    packet_id: u16,
    keep_alive_seconds: u16,
}

impl MqttConn {
    fn new() -> Self {
        Self {
            live: false,
            stream: None,
            packet_id: 1,
            keep_alive_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
        }
    }

    /// Draw the next packet id. Sixteen-bit counter that wraps from 65535
    /// back to 1; zero is never issued.
    fn next_packet_id(&mut self) -> u16 {
        let id = self.packet_id;
        self.packet_id = if self.packet_id == u16::MAX {
            1
        } else {
            self.packet_id + 1
        };
        id
    }

    fn close(&mut self) {
        self.live = false;
        self.stream = None;
    }
}

/// Parsed `mqtt://host[:port][/client_id]` URL
#[derive(Debug, PartialEq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

/// Parse an MQTT URL. A bare host (no scheme) is accepted; a missing client
/// id gets a generated `loadgen_<n>` one.
pub fn parse_url(url: &str) -> Option<MqttEndpoint> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    if rest.is_empty() {
        return None;
    }

    let (authority, client_id) = match rest.split_once('/') {
        Some((authority, client)) if !client.is_empty() => (authority, client.to_string()),
        Some((authority, _)) => (authority, generated_client_id()),
        None => (rest, generated_client_id()),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()?),
        None => (authority.to_string(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }

    Some(MqttEndpoint {
        host,
        port,
        client_id,
    })
}

fn generated_client_id() -> String {
    format!("loadgen_{}", rand::thread_rng().gen::<u32>())
}

/// MQTT handler with its connection registry
pub struct MqttHandler {
    registry: Registry<(String, u16, String), MqttConn>,
}

impl MqttHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Registry::new("mqtt", capacity),
        }
    }

    /// Connect to a broker and send CONNECT.
    ///
    /// The response is read but not parsed: any byte counts as a successful
    /// CONNACK. Connecting while already live is a no-op success.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive_seconds: u16,
    ) -> Response {
        let key = (host.to_string(), port, client_id.to_string());
        let entry = match self.registry.get_or_create(key, MqttConn::new) {
            Ok(e) => e,
            Err(EngineError::RegistryFull(_)) => {
                return Response::failure(
                    Protocol::Mqtt,
                    status::INTERNAL,
                    "Too many MQTT connections",
                );
            }
            Err(e) => return Response::failure(Protocol::Mqtt, status::INTERNAL, e.to_string()),
        };
        let mut conn = entry.lock().await;

        if conn.live {
            return Response::success(
                Protocol::Mqtt,
                status::OK,
                format!(
                    "MQTT connection already established to {host}:{port} with client ID {client_id}"
                ),
            );
        }

        let Some(addr) = resolve_host(host, port).await else {
            return Response::failure(
                Protocol::Mqtt,
                status::INTERNAL,
                format!("Failed to resolve hostname: {host}"),
            );
        };

        let mut stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                return Response::failure(
                    Protocol::Mqtt,
                    status::INTERNAL,
                    format!("Failed to connect to MQTT broker: {e}"),
                );
            }
        };

        let packet = framing::connect_packet(client_id, username, password, keep_alive_seconds);
        if let Err(e) = stream.write_all(&packet).await {
            return Response::failure(
                Protocol::Mqtt,
                status::INTERNAL,
                format!("Failed to send CONNECT packet: {e}"),
            );
        }

        // Read at least one byte of CONNACK; the return code is not parsed
        let mut connack = [0u8; 4];
        if let Err(e) = stream.read(&mut connack).await {
            return Response::failure(
                Protocol::Mqtt,
                status::INTERNAL,
                format!("Failed to receive CONNACK: {e}"),
            );
        }

        info!(host, port, client_id, "MQTT connection established");
        conn.live = true;
        conn.keep_alive_seconds = keep_alive_seconds;
        conn.stream = Some(stream);

        Response::success(
            Protocol::Mqtt,
            status::OK,
            format!("MQTT connection established to {host}:{port} with client ID {client_id}"),
        )
        .with_payload(ResponsePayload::Mqtt(MqttStats::default()))
    }

    /// Publish one message on a live connection
    pub async fn publish(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        message: &str,
        qos: QoS,
        retain: bool,
    ) -> Response {
        let key = (host.to_string(), port, client_id.to_string());
        let Some(entry) = self.registry.get(&key) else {
            return Response::failure(Protocol::Mqtt, status::INVALID_STATE, "No active MQTT connection");
        };
        let mut conn = entry.lock().await;
        if !conn.live {
            return Response::failure(Protocol::Mqtt, status::INVALID_STATE, "No active MQTT connection");
        }

        let packet_id = conn.next_packet_id();
        let packet = framing::publish_packet(topic, message.as_bytes(), qos, retain, packet_id);

        let stream = conn.stream.as_mut().expect("live connection without stream");
        if let Err(e) = stream.write_all(&packet).await {
            warn!(host, port, client_id, error = %e, "MQTT publish failed, closing");
            conn.close();
            return Response::failure(
                Protocol::Mqtt,
                status::INTERNAL,
                format!("Failed to send PUBLISH packet: {e}"),
            );
        }

        debug!(host, port, topic, qos = qos.level(), "MQTT publish");
        let mut resp = Response::success(
            Protocol::Mqtt,
            status::OK,
            format!("Published message to topic '{topic}' (QoS {}, retain={retain})", qos.level()),
        );
        resp.payload = ResponsePayload::Mqtt(MqttStats {
            message_published: true,
            messages_published_count: 1,
            topic: topic.to_string(),
            last_message: message.to_string(),
            qos: qos.level(),
            retained: retain,
            ..MqttStats::default()
        });
        resp
    }

    /// Record a subscription. Validates the connection is live; no
    /// SUBSCRIBE packet is emitted on the wire.
    pub async fn subscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        qos: QoS,
    ) -> Response {
        let key = (host.to_string(), port, client_id.to_string());
        let Some(entry) = self.registry.get(&key) else {
            return Response::failure(Protocol::Mqtt, status::INVALID_STATE, "No active MQTT connection");
        };
        if !entry.lock().await.live {
            return Response::failure(Protocol::Mqtt, status::INVALID_STATE, "No active MQTT connection");
        }

        let mut resp = Response::success(
            Protocol::Mqtt,
            status::OK,
            format!("Subscribed to topic '{topic}' with QoS {}", qos.level()),
        );
        resp.payload = ResponsePayload::Mqtt(MqttStats {
            topic: topic.to_string(),
            qos: qos.level(),
            ..MqttStats::default()
        });
        resp
    }

    /// Record an unsubscription; live-state validation only, no wire packet
    pub async fn unsubscribe(&self, host: &str, port: u16, client_id: &str, topic: &str) -> Response {
        let key = (host.to_string(), port, client_id.to_string());
        let Some(entry) = self.registry.get(&key) else {
            return Response::failure(Protocol::Mqtt, status::INVALID_STATE, "No active MQTT connection");
        };
        if !entry.lock().await.live {
            return Response::failure(Protocol::Mqtt, status::INVALID_STATE, "No active MQTT connection");
        }

        Response::success(
            Protocol::Mqtt,
            status::OK,
            format!("Unsubscribed from topic '{topic}'"),
        )
    }

    /// Emit DISCONNECT and drop the socket; the registry slot is kept
    pub async fn disconnect(&self, host: &str, port: u16, client_id: &str) -> Response {
        let key = (host.to_string(), port, client_id.to_string());
        let Some(entry) = self.registry.get(&key) else {
            return Response::failure(
                Protocol::Mqtt,
                status::INVALID_STATE,
                "No active MQTT connection to disconnect",
            );
        };
        let mut conn = entry.lock().await;
        if !conn.live {
            return Response::failure(
                Protocol::Mqtt,
                status::INVALID_STATE,
                "No active MQTT connection to disconnect",
            );
        }

        // Best-effort: the socket closes regardless of whether the packet lands
        if let Some(stream) = conn.stream.as_mut() {
            let _ = stream.write_all(&framing::disconnect_packet()).await;
        }
        conn.close();

        info!(host, port, client_id, "MQTT connection closed");
        Response::success(
            Protocol::Mqtt,
            status::OK,
            format!("MQTT connection to {host}:{port} closed successfully"),
        )
    }

    /// Whether the registry entry is currently live
    pub async fn is_live(&self, host: &str, port: u16, client_id: &str) -> bool {
        let key = (host.to_string(), port, client_id.to_string());
        match self.registry.get(&key) {
            Some(entry) => entry.lock().await.live,
            None => false,
        }
    }
}

#[async_trait]
impl ProtocolHandler for MqttHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    /// Generic dispatch for explicitly MQTT-tagged requests. The URL names
    /// broker and client id; the topic rides in a `topic:` header line, QoS
    /// in a `qos:` line, retain in a `retain:` line.
    async fn execute(&self, request: &Request) -> Response {
        let Some(endpoint) = parse_url(&request.url) else {
            return Response::failure(
                Protocol::Mqtt,
                status::INVALID_STATE,
                format!("invalid MQTT URL: {}", request.url),
            );
        };

        let topic = header_value(&request.headers, "topic").unwrap_or_default();
        let qos = QoS::from_level(
            header_value(&request.headers, "qos")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        );
        let retain = header_value(&request.headers, "retain")
            .map(|v| v == "true")
            .unwrap_or(false);

        match request.method.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                self.connect(
                    &endpoint.host,
                    endpoint.port,
                    &endpoint.client_id,
                    None,
                    None,
                    DEFAULT_KEEP_ALIVE_SECONDS,
                )
                .await
            }
            "SUBSCRIBE" => {
                self.subscribe(&endpoint.host, endpoint.port, &endpoint.client_id, &topic, qos)
                    .await
            }
            "UNSUBSCRIBE" => {
                self.unsubscribe(&endpoint.host, endpoint.port, &endpoint.client_id, &topic)
                    .await
            }
            "DISCONNECT" => {
                self.disconnect(&endpoint.host, endpoint.port, &endpoint.client_id)
                    .await
            }
            _ => {
                self.publish(
                    &endpoint.host,
                    endpoint.port,
                    &endpoint.client_id,
                    &topic,
                    &request.body,
                    qos,
                    retain,
                )
                .await
            }
        }
    }
}

/// Pull a `name: value` line out of a headers blob
fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}
