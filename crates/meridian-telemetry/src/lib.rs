//! Telemetry for Meridian
//!
//! Structured logging via the `tracing` ecosystem. The core emits
//! events with fields everywhere; this crate only wires the
//! subscriber.

use meridian_config::TelemetryConfig;

/// Initialize the global tracing subscriber from configuration
///
/// The filter comes from `RUST_LOG` when set, otherwise from the
/// configured directive. Call once at startup; a second call (e.g.
/// from an embedding host that already installed a subscriber)
/// returns an error rather than panicking.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
