//! Worker task loop
//!
//! Each worker repeatedly takes the queue receiver lock, pulls one request,
//! dispatches it through the timing wrapper and records the outcome. The
//! async submission path is fire-and-forget: a worker's response is dropped
//! after the metrics sample is taken.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use super::{record_timed, HandlerSet};
use crate::envelope::Request;
use crate::metrics::MetricsAggregator;

pub(crate) async fn worker_task(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Request>>>,
    handlers: Arc<HandlerSet>,
    metrics: Arc<MetricsAggregator>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");

    loop {
        // Shutdown wins over pending queue items: queued requests that were
        // never picked up are abandoned, not drained.
        let request = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                request = rx.recv() => request,
            }
        };

        let Some(request) = request else {
            break;
        };

        let response = record_timed(&metrics, handlers.dispatch(&request)).await;
        debug!(
            worker_id,
            url = %request.url,
            status = response.status_code,
            elapsed_us = response.response_time_us,
            "request completed"
        );
    }

    debug!(worker_id, "worker stopped");
}
