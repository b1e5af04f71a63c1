//! Monotonic microsecond clock
//!
//! All latency spans are `(end - start)` reads of this clock. Wall-clock
//! time is used only for the load driver's duration budget.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds since an arbitrary process-wide epoch.
///
/// Monotonic: never decreases across calls, unaffected by wall-clock
/// adjustments.
pub fn now_micros() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}
