//! Shared tracing/logging initialization.
//!
//! The broker binary (and any future companion binaries) set up
//! `tracing_subscriber` with an env-filter and optional JSON output through
//! this single entry point.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies (the broker
/// binary passes its configured log level, e.g. `"liaison_broker=info"`).
/// With `log_json` the output is structured JSON lines instead of the
/// human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = if log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
