//! Tracing initialization.
//!
//! Structured logging through `tracing-subscriber` with an `RUST_LOG`-style
//! environment filter. Defaults to `info` when no filter is set.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subscriber. Safe to call more than once; repeated
/// initialization (e.g. across tests) is ignored.
pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
