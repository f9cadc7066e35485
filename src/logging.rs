//! A minimal `tracing` setup helper for binaries and examples embedding this
//! crate, mirroring (at library scale) the `tracing`/`tracing-subscriber`
//! wiring used throughout the reference codebase's services.
//!
//! The run-loop itself never initializes a subscriber — only an application
//! should install one — but it does emit `tracing` events at the
//! interesting transitions: every asynchronous hand-off in `run_loop`'s
//! `dispatch_async`, every memoized-node state transition in `memoized`, and
//! [`crate::scheduler::TokioScheduler::report_failure`]'s `tracing::error!`
//! for an otherwise-uncaught failure. Installing a subscriber is enough to
//! observe all of them.

use tracing_subscriber::EnvFilter;

/// Installs a process-global `tracing` subscriber that writes to stderr,
/// honoring `RUST_LOG` (defaulting to `info`). Intended for examples, tests,
/// and small binaries; larger hosts should build their own subscriber and
/// simply let this crate's spans/events flow into it.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
