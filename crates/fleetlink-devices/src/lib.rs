/*!
 * FleetLink Devices
 *
 * Connectors for heterogeneous network infrastructure, the shell, HTTP and
 * framed byte-stream transports they are built on, and the registry that
 * owns one connector per configured device.
 */

#![warn(missing_docs)]

// Re-export core types
pub use fleetlink_core::prelude;

pub mod connector;
pub mod descriptor;
pub mod error;
pub mod families;
pub mod provider;
pub mod registry;
pub mod transport;

pub use connector::{CommandResult, ConnectionState, Connector, StateCell, StatusEnvelope};
pub use descriptor::{load_descriptors, parse_descriptors, DeviceDescriptor, Family, TransportKind};
pub use error::{ConnectorError, ErrorKind, Result};
pub use provider::{ConnectorProvider, FamilyProvider};
pub use registry::{DeviceFilter, DeviceListing, DeviceRegistry, FleetSummary, SharedDeviceRegistry};

/// FleetLink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Load the descriptor file named by `config` and build a registry over
/// the built-in families
pub fn registry_from_config(config: &fleetlink_core::config::Config) -> Result<DeviceRegistry> {
    let descriptors = load_descriptors(&config.devices.file)?;
    let provider = FamilyProvider::new(config.transport.clone());
    DeviceRegistry::build(descriptors, &provider, config.transport.status_concurrency)
}

/// Names of every supported family
pub fn available_families() -> Vec<&'static str> {
    Family::ALL.iter().map(Family::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_core::config::Config;
    use std::io::Write;

    #[test]
    fn test_registry_from_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"devices": [
                {{"id": "sw1", "name": "Access switch", "type": "hp", "host": "10.0.0.3", "username": "manager"}},
                {{"id": "tb", "name": "Platform", "type": "thingsboard", "apiUrl": "https://tb.local", "username": "t@x"}}
            ]}}"#
        )
        .unwrap();

        let mut config = Config::default();
        config.devices.file = file.path().to_string_lossy().into_owned();
        let registry = registry_from_config(&config).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_connector("tb").unwrap().family(), Family::Thingsboard);
    }

    #[test]
    fn test_missing_descriptor_file_is_an_empty_fleet() {
        let mut config = Config::default();
        config.devices.file = "/nonexistent/fleetlink/devices.json".to_string();
        assert!(registry_from_config(&config).unwrap().is_empty());
    }

    #[test]
    fn test_available_families() {
        let families = available_families();
        assert!(families.contains(&"dahua-nvr"));
        assert_eq!(families.len(), Family::ALL.len());
    }
}
