//! Logging setup for demos and tests.
//!
//! Worker threads are named `hearth-worker-<id>`, so the subscriber prints
//! thread names instead of module targets.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// Does nothing when `RUST_LOG` is unset or a global subscriber already
/// exists. Returns whether this call installed one.
pub fn init_tracing() -> bool {
    let Ok(filter) = EnvFilter::try_from_default_env() else {
        return false;
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .is_ok()
}
