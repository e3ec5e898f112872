//! Logging setup.
//!
//! Environment variables:
//! - `RUST_LOG`: log filter (default: info)
//! - `XMPP_LIGHT_LOG_FORMAT`: `json` for JSON lines, anything else for compact text

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
pub fn init() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_output() {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().compact().with_target(true))
            .try_init()?;
    }

    tracing::debug!("Telemetry initialized");
    Ok(())
}

fn json_output() -> bool {
    std::env::var("XMPP_LIGHT_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"))
}
