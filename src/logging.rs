//! Diagnostics for the `arbor` binary.
//!
//! Run and node records go to the ledger; this is only the `tracing` output
//! on stderr, so stdout stays clean JSON.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Reads `RUST_LOG`, defaulting to `warn`.
pub fn init() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr).compact())
    .init();
}
