/*!
 * FleetLink Core
 *
 * Shared foundation for the FleetLink connector framework: errors,
 * layered configuration, logging setup, common types and timing helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use serde;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
}

/// FleetLink core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with default logging
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("FleetLink Core {} initialized", VERSION);
    Ok(())
}

/// Library initialization driven by a loaded configuration
pub fn init_with_config(config: &config::Config) -> Result<(), error::Error> {
    logging::init_from_config(&config.logging)?;
    tracing::info!("{}", startup_banner(&config.general));
    Ok(())
}

fn startup_banner(general: &config::GeneralConfig) -> String {
    format!(
        "{} initialized with FleetLink Core {} ({})",
        general.app_name, VERSION, general.environment
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_startup_banner_names_the_application() {
        let mut config = config::Config::default();
        config.general.app_name = "noc-poller".to_string();
        config.general.environment = "staging".to_string();

        let banner = startup_banner(&config.general);
        assert!(banner.starts_with("noc-poller initialized"));
        assert!(banner.contains(VERSION));
        assert!(banner.ends_with("(staging)"));
    }
}
