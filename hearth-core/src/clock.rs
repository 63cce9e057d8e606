//! Process-wide monotonic clock in milliseconds.
//!
//! Timers, socket idle checks and `Server::now` all read this clock so their
//! values are comparable across threads.

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the clock was first read.
#[must_use]
pub fn now_millis() -> i64 {
    i64::try_from(EPOCH.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Absolute expiry for a timer `delay_ms` from now.
#[must_use]
pub fn deadline_after(delay_ms: i64) -> i64 {
    now_millis().saturating_add(delay_ms.max(0))
}

/// Time until `deadline`, zero if already passed.
#[must_use]
pub fn until(deadline: i64) -> Duration {
    let ms = deadline.saturating_sub(now_millis()).max(0);
    Duration::from_millis(ms as u64)
}
