/*!
 * Connector providers.
 *
 * The registry never constructs connectors itself; it asks a
 * [`ConnectorProvider`]. Production code uses [`FamilyProvider`], tests can
 * hand in anything that maps descriptors to connectors.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use fleetlink_core::config::TransportConfig;

use crate::connector::Connector;
use crate::descriptor::DeviceDescriptor;
use crate::error::Result;
use crate::families::{build_connector, FamilyContext};
use crate::transport::{RusshDialer, ShellDialer};

/// Idle SSH sessions are dropped by russh after this long
const SSH_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Turns descriptors into live connectors
pub trait ConnectorProvider: Send + Sync + Debug {
    /// Build the connector for one descriptor, failing fast on missing parameters
    fn build(&self, descriptor: DeviceDescriptor) -> Result<Arc<dyn Connector>>;
}

/// The built-in families
#[derive(Debug, Clone)]
pub struct FamilyProvider {
    ctx: FamilyContext,
}

impl FamilyProvider {
    /// Provider using SSH over russh for shell-capable families
    pub fn new(transport: TransportConfig) -> Self {
        let dialer = RusshDialer::new().with_inactivity_timeout(SSH_IDLE_TIMEOUT);
        Self::with_dialer(transport, Arc::new(dialer))
    }

    /// Provider with a custom shell dialer
    pub fn with_dialer(transport: TransportConfig, dialer: Arc<dyn ShellDialer>) -> Self {
        Self {
            ctx: FamilyContext::new(transport, dialer),
        }
    }

    /// The context handed to every family
    pub fn context(&self) -> &FamilyContext {
        &self.ctx
    }
}

impl ConnectorProvider for FamilyProvider {
    fn build(&self, descriptor: DeviceDescriptor) -> Result<Arc<dyn Connector>> {
        build_connector(descriptor, &self.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Family;
    use crate::error::ErrorKind;

    #[test]
    fn test_family_provider_builds_and_validates() {
        let provider = FamilyProvider::new(TransportConfig::default());
        let connector = provider
            .build(DeviceDescriptor::new("pve", "cluster", Family::Proxmox).with_host("10.0.0.2").with_api_key("root@pam!t=x"))
            .unwrap();
        assert_eq!(connector.family(), Family::Proxmox);

        let err = provider
            .build(DeviceDescriptor::new("tb", "platform", Family::Thingsboard).with_host("tb.local"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
