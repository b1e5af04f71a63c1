//! Logging bootstrap
//!
//! The engine itself only emits `tracing` events; embedders that want
//! console output without wiring their own subscriber can call [`init`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize a fmt subscriber filtered by `RUST_LOG`, falling back to the
/// given level for this crate (and `info` for everything else).
///
/// Safe to call once per process; later calls are ignored.
pub fn init(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stampede={level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
