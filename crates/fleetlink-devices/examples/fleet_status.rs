//! Print a status roll-up of every configured device.
//!
//! ```text
//! FLEETLINK__DEVICES__FILE=devices.json cargo run --example fleet_status -- [config.toml] [family]
//! ```
use std::env;

use anyhow::Context;
use fleetlink_core::config::ConfigBuilder;
use fleetlink_devices::{registry_from_config, DeviceFilter, Family, SharedDeviceRegistry};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);

    // Layered configuration: defaults, optional file, FLEETLINK__* environment
    let mut builder = ConfigBuilder::new().with_environment_prefix("FLEETLINK");
    if let Some(path) = args.next() {
        builder = builder.with_config_file(path);
    }
    let config = builder.build().context("loading configuration")?;
    fleetlink_core::init_with_config(&config).context("initializing logging")?;

    let family = args
        .next()
        .map(|tag| tag.parse::<Family>())
        .transpose()
        .context("parsing family filter")?;

    let registry = SharedDeviceRegistry::new(
        registry_from_config(&config).with_context(|| format!("building registry from {}", config.devices.file))?,
    );
    let mut filter = DeviceFilter::new();
    if let Some(family) = family {
        filter = filter.with_family(family);
    }
    for device in registry.registry().list_devices(&filter) {
        info!("{} ({}) {}", device.id, device.family, device.name);
    }

    let summary = registry.registry().summarize(family, None).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    registry.registry().shutdown().await;
    Ok(())
}
