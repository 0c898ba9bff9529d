/*!
 * VMware ESXi / vCenter via the vSphere Automation REST API.
 */
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, pretty, FamilyContext};
use crate::transport::http::basic_auth;
use crate::transport::{ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

const SESSION_HEADER: &str = "vmware-api-session-id";

/// Basic credentials exchanged for a session id
struct EsxiAuth {
    username: String,
    password: String,
}

impl std::fmt::Debug for EsxiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsxiAuth").field("username", &self.username).finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for EsxiAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let body = http
            .request(ApiRequest::post("/api/session").header("Authorization", basic_auth(&self.username, &self.password)))
            .await?
            .into_json()?;
        let session = body
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConnectorError::auth("ESXi did not return a session id"))?;
        Ok(Credential::new().with_header(SESSION_HEADER, session).with_token(session))
    }

    async fn logout(&self, http: &HttpTransport, credential: &Credential) -> Result<()> {
        if let Some(session) = credential.token() {
            http.request(ApiRequest::delete("/api/session").header(SESSION_HEADER, session))
                .await?;
        }
        Ok(())
    }
}

/// An ESXi host or vCenter appliance
#[derive(Debug)]
pub struct EsxiConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
}

impl EsxiConnector {
    /// Build a connector; needs `host` or `apiUrl` and `username`.
    /// Self-signed certificates are accepted unless `extra.acceptInvalidCerts` is false.
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let auth = EsxiAuth {
            username: descriptor.require_username()?.to_string(),
            password: descriptor.password_or_empty().to_string(),
        };
        let http = http_transport(&descriptor, &ctx.transport, true)?;
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self { descriptor, api })
    }

    /// Detail record of the first host the endpoint reports
    async fn first_host(&self) -> Result<Value> {
        let hosts = self.api.call_json(ApiRequest::get("/api/vcenter/host")).await?;
        let host_id = hosts
            .as_array()
            .and_then(|list| list.first())
            .and_then(|h| h.get("host"))
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::protocol("No ESXi hosts found"))?;
        debug!("{} reporting host {}", self.descriptor.id, host_id);

        self.api
            .call_json(ApiRequest::get(format!("/api/vcenter/host/{}", host_id)))
            .await
    }
}

#[async_trait]
impl Connector for EsxiConnector {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> ConnectionState {
        self.api.state()
    }

    async fn connect(&self) -> Result<()> {
        self.api.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.api.disconnect().await
    }

    async fn collect_status(&self) -> Result<StatusEnvelope> {
        let host = self.first_host().await?;
        let firmware = host
            .pointer("/product/version")
            .and_then(Value::as_str)
            .map(str::to_string);
        let model = host.get("name").and_then(Value::as_str).map(str::to_string);

        let mut status = StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_model(model)
            .with_firmware(firmware);
        if let Value::Object(map) = host {
            status.details.extend(map);
        }
        Ok(status)
    }

    /// `section` names a vcenter collection (`network`, `datastore`, ...);
    /// without one the host record is returned
    async fn get_config(&self, section: Option<&str>) -> Result<String> {
        let value = match section.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
            Some(section) => {
                self.api
                    .call_json(ApiRequest::get(format!("/api/vcenter/{}", section)))
                    .await?
            }
            None => self.first_host().await?,
        };
        pretty(&value)
    }

    async fn list_children(&self) -> Result<Value> {
        self.api.call_json(ApiRequest::get("/api/vcenter/vm")).await
    }
}
