//! Logging setup for binaries that embed the engine.
//!
//! The engine itself only emits `tracing` events and spans: one span per
//! lifecycle operation (`converge.create`, `converge.update`,
//! `converge.read`, `converge.delete`, plus `converge.apply`,
//! `converge.refresh` and `converge.destroy` for state stores) carrying the
//! resource type and id, `debug` events per probe and retry, and
//! `warn`/`error` events when an operation times out or fails.
//!
//! The helpers here install a subscriber that writes to **stderr**, since
//! provider plugins reserve stdout for their handshake.
//!
//! ```bash
//! # Operation outcomes only
//! RUST_LOG=info ./my-provider
//!
//! # Every probe and retry
//! RUST_LOG=hemmer_converge=debug ./my-provider
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// The filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn subscriber(default_level: &str) -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::registry().with(filter(default_level)).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    )
}

/// Install the default subscriber, filtered by `RUST_LOG` (default `info`).
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    subscriber(DEFAULT_FILTER).init();
}

/// Like [`init_logging`], with a different default when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    subscriber(default_level).init();
}

/// Install the default subscriber unless one is already set.
///
/// Returns whether this call installed it.
pub fn try_init_logging() -> bool {
    subscriber(DEFAULT_FILTER).try_init().is_ok()
}
