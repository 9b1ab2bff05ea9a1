//! Diagnostic tracing for the CLI.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. Lifecycle events
//! are a separate surface (`io/events`): they reach their sinks regardless of
//! the log filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=taskexec=debug taskexec run task.toml
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
