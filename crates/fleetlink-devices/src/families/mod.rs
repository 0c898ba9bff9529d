/*!
 * Device families: thin adapters composing the transports.
 *
 * [`build_connector`] is the single place a family tag is turned into a
 * connector. It validates the parameters each family needs so a bad
 * descriptor fails when the registry is built rather than at first use.
 */
use std::sync::Arc;

use serde_json::Value;

use fleetlink_core::config::TransportConfig;

use crate::connector::{Connector, StateCell};
use crate::descriptor::{DeviceDescriptor, Family};
use crate::error::Result;
use crate::transport::{HttpTransport, ShellDialer, ShellMode, ShellTarget, ShellTransport};

pub mod appliance;
pub mod dahua_dss;
pub mod embedded;
pub mod esxi;
pub mod hiflying;
pub mod openstack;
pub mod proxmox;
pub mod qnap;
pub mod sonoff;
pub mod switch;
pub mod synology;
pub mod thingsboard;
pub mod tuya;

/// What every family constructor gets besides its descriptor
#[derive(Debug, Clone)]
pub struct FamilyContext {
    /// Transport timeouts and policies
    pub transport: TransportConfig,
    /// Opens shell sessions for shell-capable families
    pub dialer: Arc<dyn ShellDialer>,
}

impl FamilyContext {
    /// Bundle a transport configuration with a shell dialer
    pub fn new(transport: TransportConfig, dialer: Arc<dyn ShellDialer>) -> Self {
        Self { transport, dialer }
    }
}

/// Build the connector for `descriptor`'s family
pub fn build_connector(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match descriptor.family {
        Family::Cisco | Family::Hp => Arc::new(switch::SwitchConnector::new(descriptor, ctx)?),
        Family::Fortigate | Family::Mikrotik => Arc::new(appliance::ApplianceConnector::new(descriptor, ctx)?),
        Family::Proxmox => Arc::new(proxmox::ProxmoxConnector::new(descriptor, ctx)?),
        Family::Esxi => Arc::new(esxi::EsxiConnector::new(descriptor, ctx)?),
        Family::Openstack => Arc::new(openstack::OpenstackConnector::new(descriptor, ctx)?),
        Family::Qnap => Arc::new(qnap::QnapConnector::new(descriptor, ctx)?),
        Family::Synology => Arc::new(synology::SynologyConnector::new(descriptor, ctx)?),
        Family::Thingsboard => Arc::new(thingsboard::ThingsboardConnector::new(descriptor, ctx)?),
        Family::Tuya => Arc::new(tuya::TuyaConnector::new(descriptor, ctx)?),
        Family::Sonoff => Arc::new(sonoff::SonoffConnector::new(descriptor, ctx)?),
        Family::Esphome | Family::Espconnect => Arc::new(embedded::EspConnector::new(descriptor, ctx)?),
        Family::DahuaNvr => Arc::new(embedded::DahuaNvrConnector::new(descriptor, ctx)?),
        Family::DahuaDss => Arc::new(dahua_dss::DahuaDssConnector::new(descriptor, ctx)?),
        Family::Hiflying => Arc::new(hiflying::HiflyingConnector::new(descriptor, ctx)?),
    };
    Ok(connector)
}

/// HTTP transport for a descriptor. `extra.acceptInvalidCerts` wins over
/// the configured policy and the family default.
pub(crate) fn http_transport(
    descriptor: &DeviceDescriptor,
    config: &TransportConfig,
    insecure_by_default: bool,
) -> Result<HttpTransport> {
    http_transport_at(descriptor.base_url()?, descriptor, config, insecure_by_default)
}

/// Like [`http_transport`] with a family-chosen base URL
pub(crate) fn http_transport_at(
    base_url: String,
    descriptor: &DeviceDescriptor,
    config: &TransportConfig,
    insecure_by_default: bool,
) -> Result<HttpTransport> {
    let insecure = descriptor
        .extra_bool("acceptInvalidCerts")
        .unwrap_or(config.accept_invalid_certs || insecure_by_default);
    HttpTransport::with_options(base_url, config.http_timeout(), insecure)
}

/// Shell transport for a descriptor, honouring `extra.shellMode` and
/// `extra.pagingCommand`
pub(crate) fn shell_transport(
    descriptor: &DeviceDescriptor,
    ctx: &FamilyContext,
    state: StateCell,
) -> Result<ShellTransport> {
    let target = ShellTarget::from_descriptor(descriptor)?;
    let mut shell = ShellTransport::new(target, ctx.dialer.clone(), state, &ctx.transport)
        .with_mode(ShellMode::from_descriptor(descriptor));
    if let Some(paging) = descriptor.extra_str("pagingCommand") {
        shell = shell.with_paging_command(paging);
    }
    Ok(shell)
}

/// A non-empty string or a number, as text
pub(crate) fn text_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Pretty JSON for `get_config` output
pub(crate) fn pretty(value: &Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
