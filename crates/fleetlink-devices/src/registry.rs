/*!
 * Device registry for FleetLink.
 *
 * The registry is built once from descriptors and never changes afterwards.
 * It owns one connector per device, keeps them in descriptor order and
 * answers lookups and fleet-wide status queries.
 */
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, Instrument};

use fleetlink_core::logging::{device_span, operation_span};
use fleetlink_core::types::Id;

use crate::connector::{ConnectionState, Connector, StatusEnvelope};
use crate::descriptor::{DeviceDescriptor, Family};
use crate::error::{ConnectorError, Result};
use crate::provider::ConnectorProvider;

/// Selects devices by free text, family and tag. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Case-insensitive substring over id, name, family and tags
    #[serde(default)]
    pub text: Option<String>,
    /// Exact family
    #[serde(default)]
    pub family: Option<Family>,
    /// Exact tag
    #[serde(default)]
    pub tag: Option<String>,
}

impl DeviceFilter {
    /// Match everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict by free text
    pub fn with_text<S: Into<String>>(mut self, text: S) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Restrict to one family
    pub fn with_family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    /// Restrict to one tag
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Whether `descriptor` passes every criterion
    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        self.text.as_deref().map_or(true, |t| descriptor.matches_text(t))
            && self.family.map_or(true, |f| descriptor.family == f)
            && self.tag.as_deref().map_or(true, |t| descriptor.has_tag(t))
    }
}

/// One line of a device listing; never carries secrets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListing {
    /// Device id
    pub id: Id,
    /// Device name
    pub name: String,
    /// Family tag
    #[serde(rename = "type")]
    pub family: Family,
    /// Host, when configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Connection state at listing time
    #[serde(rename = "status")]
    pub state: ConnectionState,
}

/// Fleet-wide status roll-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    /// Devices queried
    pub total: usize,
    /// Devices that reported `connected`
    pub connected: usize,
    /// Devices that reported `error`
    pub errors: usize,
    /// Every envelope, in registry order
    pub devices: Vec<StatusEnvelope>,
}

impl FleetSummary {
    /// Roll up a set of envelopes
    pub fn from_statuses(devices: Vec<StatusEnvelope>) -> Self {
        let count = |state: ConnectionState| devices.iter().filter(|d| d.state == state).count();
        Self {
            total: devices.len(),
            connected: count(ConnectionState::Connected),
            errors: count(ConnectionState::Error),
            devices,
        }
    }
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    /// Connectors in descriptor order
    connectors: Vec<Arc<dyn Connector>>,
    /// Position of each id in `connectors`
    index: HashMap<Id, usize>,
    /// Devices queried at once by fleet-wide status
    status_concurrency: usize,
}

impl DeviceRegistry {
    /// Build a registry, failing on the first duplicate id or on the first
    /// descriptor its family cannot work with
    pub fn build(
        descriptors: Vec<DeviceDescriptor>,
        provider: &dyn ConnectorProvider,
        status_concurrency: usize,
    ) -> Result<Self> {
        let mut connectors = Vec::with_capacity(descriptors.len());
        let mut index = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let id = descriptor.id.clone();
            if index.contains_key(&id) {
                return Err(ConnectorError::config(format!("Duplicate device id '{}'", id)));
            }
            let connector = provider.build(descriptor)?;
            debug!("Registered device {} ({})", id, connector.family());
            index.insert(id, connectors.len());
            connectors.push(connector);
        }

        info!("Device registry built with {} devices", connectors.len());
        Ok(Self {
            connectors,
            index,
            status_concurrency: status_concurrency.max(1),
        })
    }

    /// A registry with no devices
    pub fn empty() -> Self {
        Self {
            connectors: Vec::new(),
            index: HashMap::new(),
            status_concurrency: 1,
        }
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    /// Whether the registry has no devices
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Every id, in registry order
    pub fn ids(&self) -> Vec<Id> {
        self.connectors.iter().map(|c| c.id().clone()).collect()
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.index.get(id).copied().ok_or_else(|| ConnectorError::NotFound {
            id: id.to_string(),
            known: self.connectors.iter().map(|c| c.id().to_string()).collect(),
        })
    }

    /// The connector for `id`, or `NotFound` listing every known id
    pub fn get_connector(&self, id: &str) -> Result<Arc<dyn Connector>> {
        Ok(self.connectors[self.position(id)?].clone())
    }

    /// The descriptor for `id`
    pub fn descriptor(&self, id: &str) -> Result<&DeviceDescriptor> {
        Ok(self.connectors[self.position(id)?].descriptor())
    }

    fn select(&self, filter: &DeviceFilter) -> Vec<Arc<dyn Connector>> {
        self.connectors
            .iter()
            .filter(|c| filter.matches(c.descriptor()))
            .cloned()
            .collect()
    }

    /// Devices passing `filter`, in registry order
    pub fn list_devices(&self, filter: &DeviceFilter) -> Vec<DeviceListing> {
        self.select(filter)
            .into_iter()
            .map(|c| {
                let descriptor = c.descriptor();
                DeviceListing {
                    id: descriptor.id.clone(),
                    name: descriptor.name.clone(),
                    family: descriptor.family,
                    host: descriptor.host.clone(),
                    tags: descriptor.tags.clone(),
                    state: c.state(),
                }
            })
            .collect()
    }

    /// Fresh status of one device
    pub async fn get_status(&self, id: &str) -> Result<StatusEnvelope> {
        let connector = self.get_connector(id)?;
        Ok(status_of(connector).await)
    }

    /// Status of every device passing the family and tag filters, in
    /// registry order. Failed devices appear as `error` envelopes.
    pub async fn get_all_statuses(&self, family: Option<Family>, tag: Option<&str>) -> Vec<StatusEnvelope> {
        let filter = DeviceFilter {
            text: None,
            family,
            tag: tag.map(str::to_string),
        };
        let selected = self.select(&filter);
        debug!(
            "Collecting status of {} devices, {} at a time",
            selected.len(),
            self.status_concurrency
        );
        stream::iter(selected)
            .map(status_of)
            .buffered(self.status_concurrency)
            .collect()
            .await
    }

    /// Status of the filtered fleet, rolled up
    pub async fn summarize(&self, family: Option<Family>, tag: Option<&str>) -> FleetSummary {
        FleetSummary::from_statuses(self.get_all_statuses(family, tag).await)
    }

    /// Disconnect every device; failures are logged and skipped
    pub async fn shutdown(&self) {
        let mut failed = 0;
        for connector in &self.connectors {
            if let Err(e) = connector
                .disconnect()
                .instrument(operation_span("disconnect", connector.id().as_str()))
                .await
            {
                error!("Failed to disconnect device {}: {}", connector.id(), e);
                failed += 1;
            }
        }
        info!(
            "Disconnected {} devices ({} failed)",
            self.connectors.len() - failed,
            failed
        );
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

/// Status of one connector; a panic inside the connector becomes an error envelope
async fn status_of(connector: Arc<dyn Connector>) -> StatusEnvelope {
    let span = device_span(connector.id().as_str(), connector.family().as_str());
    match AssertUnwindSafe(connector.get_status()).catch_unwind().instrument(span).await {
        Ok(status) => status,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Status collection for {} panicked: {}", connector.id(), reason);
            StatusEnvelope::from_message(connector.descriptor(), format!("status collection panicked: {}", reason))
        }
    }
}

/// A shared device registry that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedDeviceRegistry(Arc<DeviceRegistry>);

impl SharedDeviceRegistry {
    /// Share a built registry
    pub fn new(registry: DeviceRegistry) -> Self {
        Self(Arc::new(registry))
    }

    /// Get a reference to the device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.0
    }
}

impl AsRef<DeviceRegistry> for SharedDeviceRegistry {
    fn as_ref(&self) -> &DeviceRegistry {
        self.registry()
    }
}
