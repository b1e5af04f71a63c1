//! Load driver
//!
//! Generates offered load: cycles through a request template list and
//! submits into the engine queue at a rate approximating the configured
//! concurrency, until the wall-clock duration budget runs out. Pacing is
//! keyed to absolute wall time (each submission slot is scheduled, not slept
//! relatively), so iteration cost does not erode the offered rate.
//!
//! The driver never waits on results: queue-full rejections are counted and
//! reflected in the summary, handler-level failures only in the metrics.

use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::envelope::Request;
use crate::types::{EngineError, Result};

/// Settling time after the submission loop, letting in-flight workers finish
const DRAIN_PERIOD: Duration = Duration::from_secs(2);

/// Offered-load accounting for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Requests accepted into the queue
    pub submitted: u64,
    /// Requests rejected because the queue was full
    pub rejected: u64,
}

/// Drive load against the engine for `duration`.
///
/// Resets metrics, then cycles through `requests`, pacing submissions at
/// `1_000_000 / concurrent_users` microseconds apart. Completed-rate results
/// are read from [`Engine::metrics`] afterwards; the returned summary covers
/// the offered side only.
pub async fn run_load_test(
    engine: &Engine,
    requests: &[Request],
    concurrent_users: u32,
    duration: Duration,
) -> Result<LoadSummary> {
    if requests.is_empty() {
        return Err(EngineError::Config("request list is empty".into()));
    }
    if concurrent_users == 0 {
        return Err(EngineError::Config("concurrent_users must be positive".into()));
    }

    engine.reset_metrics();

    let pace = Duration::from_micros(1_000_000 / u64::from(concurrent_users));
    let deadline = Instant::now() + duration;
    let mut next_fire = Instant::now();
    let mut summary = LoadSummary::default();

    info!(
        templates = requests.len(),
        concurrent_users,
        duration_s = duration.as_secs_f64(),
        "load test started"
    );

    'driving: loop {
        for request in requests {
            if Instant::now() >= deadline {
                break 'driving;
            }

            match engine.submit_async(request.clone()) {
                Ok(()) => summary.submitted += 1,
                Err(EngineError::QueueFull) => {
                    // Expected under overload; the offered rate simply
                    // exceeded what the workers drained
                    summary.rejected += 1;
                    debug!(rejected = summary.rejected, "queue full, request dropped");
                }
                Err(e) => return Err(e),
            }

            next_fire += pace;
            sleep_until(next_fire).await;
        }
    }

    info!(
        submitted = summary.submitted,
        rejected = summary.rejected,
        "offered load complete, draining in-flight requests"
    );
    sleep(DRAIN_PERIOD).await;

    Ok(summary)
}
