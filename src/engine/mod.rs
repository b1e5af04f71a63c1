//! Request dispatcher
//!
//! The engine owns a bounded request queue drained by a fixed pool of worker
//! tasks, the protocol handler set with their connection registries, and the
//! metrics aggregator. Every handler invocation (queued, synchronous, or
//! through a protocol helper) passes through one timing wrapper, which is
//! the only place metrics are recorded. Handler failures are never retried;
//! the response carries the failure and still counts as one call.

pub mod router;
mod worker;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock;
use crate::config::EngineConfig;
use crate::envelope::{status, Protocol, Request, Response};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::protocols::database::DatabaseHandler;
use crate::protocols::http::HttpHandler;
use crate::protocols::mqtt::{framing::QoS, MqttHandler};
use crate::protocols::tcp::TcpHandler;
use crate::protocols::udp::UdpHandler;
use crate::protocols::websocket::WebSocketHandler;
use crate::protocols::ProtocolHandler;
use crate::types::{EngineError, Result};

/// The protocol handler set, shared by reference between the engine and its
/// workers. Registries live inside their handlers and outlive any request.
pub struct HandlerSet {
    pub http: HttpHandler,
    pub websocket: WebSocketHandler,
    pub database: DatabaseHandler,
    pub tcp: TcpHandler,
    pub udp: UdpHandler,
    pub mqtt: MqttHandler,
}

impl HandlerSet {
    fn new(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            http: HttpHandler::new()?,
            websocket: WebSocketHandler::new(config.websocket_registry_capacity),
            database: DatabaseHandler::new(config.database_registry_capacity),
            tcp: TcpHandler::new(config.tcp_registry_capacity),
            udp: UdpHandler::new(config.udp_registry_capacity),
            mqtt: MqttHandler::new(config.mqtt_registry_capacity),
        })
    }

    /// Map a protocol tag to its handler; tags without one (gRPC, AMQP,
    /// Kafka) return `None`
    pub fn handler_for(&self, protocol: Protocol) -> Option<&dyn ProtocolHandler> {
        match protocol {
            Protocol::Http => Some(&self.http),
            Protocol::WebSocket => Some(&self.websocket),
            Protocol::Database => Some(&self.database),
            Protocol::Tcp => Some(&self.tcp),
            Protocol::Udp => Some(&self.udp),
            Protocol::Mqtt => Some(&self.mqtt),
            Protocol::Grpc | Protocol::Amqp | Protocol::Kafka => None,
        }
    }

    /// Execute a generic request on the handler its tag names
    pub(crate) async fn dispatch(&self, request: &Request) -> Response {
        match self.handler_for(request.protocol) {
            Some(handler) => handler.execute(request).await,
            None => Response::failure(
                request.protocol,
                status::INVALID_STATE,
                format!("no handler for protocol {:?}", request.protocol),
            ),
        }
    }
}

/// The timing wrapper: bracket a handler invocation with clock reads, stamp
/// the span on the response and record the sample. This is the single point
/// where the aggregator is written.
pub(crate) async fn record_timed<F>(metrics: &MetricsAggregator, invocation: F) -> Response
where
    F: Future<Output = Response>,
{
    let start = clock::now_micros();
    let mut response = invocation.await;
    let elapsed = clock::now_micros().saturating_sub(start);
    response.response_time_us = elapsed;
    metrics.record(elapsed, response.success);
    response
}

/// The load-execution engine
pub struct Engine {
    config: EngineConfig,
    queue_tx: mpsc::Sender<Request>,
    handlers: Arc<HandlerSet>,
    metrics: Arc<MetricsAggregator>,
    shutdown_tx: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine and start its worker pool.
    ///
    /// Must run inside a tokio runtime. The queue holds
    /// `2 x max_connections` requests; `worker_count` tasks drain it.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (queue_tx, queue_rx) = mpsc::channel::<Request>(config.queue_capacity());
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handlers = Arc::new(HandlerSet::new(&config)?);
        let metrics = Arc::new(MetricsAggregator::new(config.worker_count));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            workers.push(tokio::spawn(worker::worker_task(
                worker_id,
                Arc::clone(&queue_rx),
                Arc::clone(&handlers),
                Arc::clone(&metrics),
                shutdown_rx.clone(),
            )));
        }

        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity(),
            "engine started"
        );

        Ok(Self {
            config,
            queue_tx,
            handlers,
            metrics,
            shutdown_tx,
            workers: std::sync::Mutex::new(workers),
        })
    }

    /// Engine configuration in effect
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue a request for background execution.
    ///
    /// Never blocks: a full queue is an immediate [`EngineError::QueueFull`].
    /// The response is fire-and-forget; only the metrics sample survives.
    pub fn submit_async(&self, request: Request) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(EngineError::Shutdown);
        }
        match self.queue_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EngineError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::Shutdown),
        }
    }

    /// Execute a request inline on the caller, bypassing the queue
    pub async fn execute_sync(&self, request: &Request) -> Response {
        record_timed(&self.metrics, self.handlers.dispatch(request)).await
    }

    /// Signal shutdown, wake all workers and join them.
    ///
    /// Queued requests that no worker picked up are abandoned; after this
    /// returns no worker task is alive and no further handler runs.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("worker list mutex poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("engine shut down");
    }

    /// Consistent copy of the aggregated metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zero the aggregated metrics
    pub fn reset_metrics(&self) {
        self.metrics.reset();
        debug!("metrics reset");
    }

    // --- TCP helpers ------------------------------------------------------

    pub async fn tcp_connect(&self, host: &str, port: u16) -> Response {
        record_timed(&self.metrics, self.handlers.tcp.connect(host, port)).await
    }

    pub async fn tcp_send(&self, host: &str, port: u16, data: &[u8]) -> Response {
        record_timed(&self.metrics, self.handlers.tcp.send(host, port, data)).await
    }

    pub async fn tcp_receive(&self, host: &str, port: u16) -> Response {
        record_timed(&self.metrics, self.handlers.tcp.receive(host, port)).await
    }

    pub async fn tcp_disconnect(&self, host: &str, port: u16) -> Response {
        record_timed(&self.metrics, self.handlers.tcp.disconnect(host, port)).await
    }

    // --- UDP helpers ------------------------------------------------------

    pub async fn udp_create_endpoint(&self, host: &str, port: u16) -> Response {
        record_timed(&self.metrics, self.handlers.udp.create_endpoint(host, port)).await
    }

    pub async fn udp_send(&self, host: &str, port: u16, data: &[u8]) -> Response {
        record_timed(&self.metrics, self.handlers.udp.send(host, port, data)).await
    }

    pub async fn udp_receive(&self, host: &str, port: u16) -> Response {
        record_timed(&self.metrics, self.handlers.udp.receive(host, port)).await
    }

    pub async fn udp_close_endpoint(&self, host: &str, port: u16) -> Response {
        record_timed(&self.metrics, self.handlers.udp.close_endpoint(host, port)).await
    }

    // --- MQTT helpers -----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn mqtt_connect(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive_seconds: u16,
    ) -> Response {
        record_timed(
            &self.metrics,
            self.handlers
                .mqtt
                .connect(host, port, client_id, username, password, keep_alive_seconds),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mqtt_publish(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        message: &str,
        qos: QoS,
        retain: bool,
    ) -> Response {
        record_timed(
            &self.metrics,
            self.handlers
                .mqtt
                .publish(host, port, client_id, topic, message, qos, retain),
        )
        .await
    }

    pub async fn mqtt_subscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
        qos: QoS,
    ) -> Response {
        record_timed(
            &self.metrics,
            self.handlers.mqtt.subscribe(host, port, client_id, topic, qos),
        )
        .await
    }

    pub async fn mqtt_unsubscribe(
        &self,
        host: &str,
        port: u16,
        client_id: &str,
        topic: &str,
    ) -> Response {
        record_timed(
            &self.metrics,
            self.handlers.mqtt.unsubscribe(host, port, client_id, topic),
        )
        .await
    }

    pub async fn mqtt_disconnect(&self, host: &str, port: u16, client_id: &str) -> Response {
        record_timed(
            &self.metrics,
            self.handlers.mqtt.disconnect(host, port, client_id),
        )
        .await
    }

    // --- WebSocket helpers ------------------------------------------------

    pub async fn websocket_connect(&self, url: &str, subprotocol: &str) -> Response {
        record_timed(&self.metrics, self.handlers.websocket.connect(url, subprotocol)).await
    }

    pub async fn websocket_send(&self, url: &str, message: &str) -> Response {
        record_timed(&self.metrics, self.handlers.websocket.send(url, message)).await
    }

    pub async fn websocket_close(&self, url: &str) -> Response {
        record_timed(&self.metrics, self.handlers.websocket.close(url)).await
    }

    // --- Database helpers -------------------------------------------------

    pub async fn database_connect(&self, connection_string: &str, db_type: &str) -> Response {
        record_timed(
            &self.metrics,
            self.handlers.database.connect(connection_string, db_type),
        )
        .await
    }

    pub async fn database_query(&self, connection_string: &str, query: &str) -> Response {
        record_timed(
            &self.metrics,
            self.handlers.database.query(connection_string, query),
        )
        .await
    }

    pub async fn database_disconnect(&self, connection_string: &str) -> Response {
        record_timed(&self.metrics, self.handlers.database.disconnect(connection_string)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn small_engine(max_connections: usize, worker_count: usize) -> Engine {
        Engine::new(EngineConfig::new(max_connections, worker_count)).unwrap()
    }

    /// Mock HTTP server answering every connection with a canned response
    async fn spawn_http_server(canned: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(canned.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn rejects_non_positive_parameters() {
        assert!(Engine::new(EngineConfig::new(0, 4)).is_err());
        assert!(Engine::new(EngineConfig::new(100, 0)).is_err());
    }

    #[tokio::test]
    async fn http_happy_path_sync() {
        let url = spawn_http_server(
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nhi",
        )
        .await;
        let engine = small_engine(10, 2);

        let request = Request::new("GET", &url).with_timeout_ms(1000);
        let response = engine.execute_sync(&request).await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "hi");
        assert!(response.success);
        assert!(response.response_time_us > 0);

        let snap = engine.metrics();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.successful_requests, 1);
        assert_eq!(snap.min_response_time_us, response.response_time_us);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn async_path_executes_and_records() {
        let url = spawn_http_server(
            "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let engine = small_engine(10, 2);

        for _ in 0..5 {
            engine
                .submit_async(Request::new("GET", &url).with_timeout_ms(1000))
                .unwrap();
        }

        // Let workers drain the queue
        for _ in 0..50 {
            if engine.metrics().total_requests == 5 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let snap = engine.metrics();
        assert_eq!(snap.total_requests, 5);
        assert_eq!(snap.successful_requests, 5);
        engine.shutdown().await;
    }

    /// Silent TCP server: accepts connections and holds them open quietly,
    /// so a receive against it parks the worker for the full 1-second window
    async fn spawn_silent_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    #[tokio::test]
    async fn queue_full_is_reported_immediately() {
        // Capacity 2 x 2 = 4; the single worker parks on a quiet receive
        let engine = small_engine(2, 1);
        let port = spawn_silent_server().await;
        assert!(engine.tcp_connect("127.0.0.1", port).await.success);

        let blocker = Request::new("RECEIVE", &format!("tcp://127.0.0.1:{port}"));
        engine.submit_async(blocker).unwrap();
        // Give the worker time to take the blocker off the queue
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        for _ in 0..4 {
            engine
                .submit_async(Request::new("GET", "http://127.0.0.1:1/"))
                .unwrap();
        }
        let overflow = engine.submit_async(Request::new("GET", "http://127.0.0.1:1/"));
        assert!(matches!(overflow, Err(EngineError::QueueFull)));
    }

    #[tokio::test]
    async fn shutdown_joins_workers_and_rejects_submissions() {
        let engine = small_engine(10, 3);
        engine.shutdown().await;

        let result = engine.submit_async(Request::new("GET", "http://127.0.0.1:1/"));
        assert!(matches!(result, Err(EngineError::Shutdown)));
        assert!(engine.workers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_abandons_queued_requests() {
        let engine = small_engine(4, 1);
        let port = spawn_silent_server().await;
        assert!(engine.tcp_connect("127.0.0.1", port).await.success);
        engine.reset_metrics();

        // Park the worker on a quiet receive, then queue more work
        let blocker = Request::new("RECEIVE", &format!("tcp://127.0.0.1:{port}"));
        engine.submit_async(blocker).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        for _ in 0..3 {
            engine
                .submit_async(Request::new("SEND", "ws://never-connected"))
                .unwrap();
        }

        // The worker exits after its current request; the queued sends are
        // dropped without running, so only the blocker's sample lands.
        engine.shutdown().await;
        assert_eq!(engine.metrics().total_requests, 1);
    }

    #[tokio::test]
    async fn unroutable_protocol_is_a_recorded_failure() {
        let engine = small_engine(10, 1);

        let request = Request::new("CALL", "grpc://service:50051");
        assert_eq!(request.protocol, Protocol::Grpc);

        let response = engine.execute_sync(&request).await;
        assert!(!response.success);
        assert_eq!(response.status_code, status::INVALID_STATE);

        let snap = engine.metrics();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.failed_requests, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn single_worker_preserves_queue_order() {
        // One worker, distinct WebSocket URLs: connects happen in submit
        // order, so the later URL's context cannot exist before the earlier
        // one has been processed.
        let engine = small_engine(10, 1);

        for i in 0..5 {
            engine
                .submit_async(Request::new("CONNECT", &format!("ws://ordered/{i}")))
                .unwrap();
        }
        for _ in 0..50 {
            if engine.metrics().total_requests == 5 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let snap = engine.metrics();
        assert_eq!(snap.total_requests, 5);
        assert_eq!(snap.successful_requests, 5);
        assert_eq!(engine.handlers.websocket.context_count(), 5);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn helper_calls_flow_through_metrics() {
        let engine = small_engine(10, 2);

        let resp = engine.websocket_connect("ws://metrics-check", "").await;
        assert_eq!(resp.status_code, status::SWITCHING_PROTOCOLS);
        assert!(resp.response_time_us > 0);

        let resp = engine.websocket_send("ws://metrics-check", "ping").await;
        assert!(resp.success);

        let resp = engine.websocket_close("ws://metrics-check").await;
        assert!(resp.success);

        let snap = engine.metrics();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successful_requests, 3);

        engine.reset_metrics();
        assert_eq!(engine.metrics().total_requests, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn tcp_helpers_against_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                if let Ok(n) = stream.read(&mut buf).await {
                    let _ = stream.write_all(&buf[..n]).await;
                }
            }
        });

        let engine = small_engine(10, 1);
        assert!(engine.tcp_connect("127.0.0.1", port).await.success);
        assert!(engine.tcp_send("127.0.0.1", port, b"ping").await.success);
        let resp = engine.tcp_receive("127.0.0.1", port).await;
        assert_eq!(resp.status_code, 200);
        assert!(engine.tcp_disconnect("127.0.0.1", port).await.success);

        assert_eq!(engine.metrics().total_requests, 4);
        engine.shutdown().await;
    }
}
