/*!
 * Logging setup for FleetLink.
 *
 * `RUST_LOG` always wins over the configured level so operators can raise
 * verbosity for a single transport without touching the config file.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "fleetlink_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, true)
}

/// Initialize the logging system from the `[logging]` config section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.with_target)
}

fn install(filter: &str, with_target: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", filter, e)))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span covering everything done on behalf of one device
///
/// # Arguments
///
/// * `id` - The device id
/// * `family` - The device family tag
pub fn device_span(id: &str, family: &str) -> Span {
    tracing::info_span!("device", id = %id, family = %family)
}

/// Create a span for a single connector operation
///
/// # Arguments
///
/// * `name` - The operation (connect, status, command, ...)
/// * `device` - The device id the operation targets
pub fn operation_span(name: &str, device: &str) -> Span {
    tracing::debug_span!("operation", name = %name, device = %device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // a second subscriber in the same process is refused, not fatal
        let _ = init();
        assert!(init().is_err());
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let result = init_with_filter("fleetlink=notalevel");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_spans() {
        // no subscriber interest means the spans are disabled
        let span = device_span("core-sw1", "cisco");
        let _entered = span.enter();
        let op = operation_span("status", "core-sw1");
        drop(op);
    }
}
