//! Stampede - multi-protocol load generation engine
//!
//! Drives synthetic traffic across HTTP/HTTPS, WebSocket, raw TCP, UDP,
//! MQTT and pluggable database adapters, recording per-request latency and
//! aggregate throughput.
//!
//! ## Architecture
//!
//! - **Engine**: bounded request queue drained by a fixed pool of worker
//!   tasks; every handler invocation is timed and recorded in the metrics
//!   aggregator
//! - **Protocol handlers**: one module per wire protocol, each owning its
//!   connection registry
//! - **Load driver**: offered-load loop that paces submissions against the
//!   engine queue for a fixed duration

pub mod clock;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod loadgen;
pub mod logging;
pub mod metrics;
pub mod protocols;
pub mod types;

pub use config::EngineConfig;
pub use engine::Engine;
pub use envelope::{Protocol, Request, RequestPayload, Response, ResponsePayload};
pub use loadgen::run_load_test;
pub use metrics::MetricsSnapshot;
pub use types::{EngineError, Result};
