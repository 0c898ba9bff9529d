/*!
 * Firewalls and routers with both a REST API and an SSH CLI
 * (FortiGate, MikroTik RouterOS).
 *
 * The API is preferred for status. The CLI runs commands and is the status
 * fallback when the API is unreachable.
 */
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connector::{CommandResult, ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::{DeviceDescriptor, Family};
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, pretty, shell_transport, text_field, FamilyContext};
use crate::transport::{ApiRequest, HttpSession, ShellTransport, StaticAuth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Fortigate,
    Mikrotik,
}

impl Dialect {
    fn status_path(self) -> &'static str {
        match self {
            Dialect::Fortigate => "/api/v2/monitor/system/status",
            Dialect::Mikrotik => "/rest/system/resource",
        }
    }

    fn interfaces_path(self) -> &'static str {
        match self {
            Dialect::Fortigate => "/api/v2/cmdb/system/interface",
            Dialect::Mikrotik => "/rest/interface",
        }
    }

    fn status_command(self) -> &'static str {
        match self {
            Dialect::Fortigate => "get system status",
            Dialect::Mikrotik => "/system resource print",
        }
    }

    fn config_command(self, section: Option<&str>) -> String {
        match (self, section) {
            (Dialect::Fortigate, Some(section)) => format!("show {}", section),
            (Dialect::Fortigate, None) => "show full-configuration".to_string(),
            (Dialect::Mikrotik, Some(section)) => format!("/{} export", section.trim_start_matches('/')),
            (Dialect::Mikrotik, None) => "/export".to_string(),
        }
    }

    fn config_path(self, section: Option<&str>) -> String {
        match (self, section) {
            (Dialect::Fortigate, Some(section)) => format!("/api/v2/cmdb/{}", section.trim_start_matches('/')),
            (Dialect::Fortigate, None) => "/api/v2/cmdb/system/global".to_string(),
            (Dialect::Mikrotik, Some(section)) => format!("/rest/{}", section.trim_start_matches('/')),
            (Dialect::Mikrotik, None) => "/rest/system/identity".to_string(),
        }
    }

    fn auth(self, descriptor: &DeviceDescriptor) -> StaticAuth {
        match self {
            Dialect::Fortigate => match descriptor.api_key.as_deref().filter(|k| !k.is_empty()) {
                Some(key) => StaticAuth::bearer(key),
                None => StaticAuth::none(),
            },
            Dialect::Mikrotik => match descriptor.username.as_deref().filter(|u| !u.is_empty()) {
                Some(user) => StaticAuth::basic(user, descriptor.password_or_empty()),
                None => StaticAuth::none(),
            },
        }
    }

    fn status(self, descriptor: &DeviceDescriptor, info: &Value) -> StatusEnvelope {
        let status = StatusEnvelope::new(descriptor, ConnectionState::Connected);
        match self {
            Dialect::Fortigate => {
                let pick = |key: &str| {
                    info.get("results")
                        .and_then(|r| text_field(r, key))
                        .or_else(|| text_field(info, key))
                };
                status
                    .with_firmware(pick("version"))
                    .with_model(pick("model_name").or_else(|| pick("model")))
                    .with_uptime(pick("uptime"))
                    .with_serial(pick("serial"))
                    .with_detail("hostname", pick("hostname").map(Value::from).unwrap_or(Value::Null))
            }
            Dialect::Mikrotik => status
                .with_uptime(text_field(info, "uptime"))
                .with_firmware(text_field(info, "version"))
                .with_model(text_field(info, "board-name"))
                .with_detail("cpu", info.get("cpu-load").cloned().unwrap_or(Value::Null))
                .with_detail("freeMemory", info.get("free-memory").cloned().unwrap_or(Value::Null))
                .with_detail("totalMemory", info.get("total-memory").cloned().unwrap_or(Value::Null)),
        }
    }
}

/// REST-first appliance with an optional SSH side channel
#[derive(Debug)]
pub struct ApplianceConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
    shell: Option<ShellTransport>,
    dialect: Dialect,
    state: StateCell,
}

impl ApplianceConnector {
    /// Build a connector; needs `host` or `apiUrl`. SSH is available when a
    /// username is configured.
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let dialect = match descriptor.family {
            Family::Fortigate => Dialect::Fortigate,
            Family::Mikrotik => Dialect::Mikrotik,
            other => return Err(ConnectorError::config(format!("{} is not an appliance family", other))),
        };
        let state = StateCell::new(descriptor.id.clone());
        let http = http_transport(&descriptor, &ctx.transport, false)?;
        let api = HttpSession::new(http, Arc::new(dialect.auth(&descriptor)), state.clone());
        let shell = match (descriptor.host.is_some(), descriptor.username.is_some()) {
            (true, true) => Some(shell_transport(&descriptor, ctx, state.clone())?),
            _ => None,
        };
        Ok(Self {
            descriptor,
            api,
            shell,
            dialect,
            state,
        })
    }

    fn shell(&self) -> Result<&ShellTransport> {
        self.shell.as_ref().ok_or_else(|| {
            ConnectorError::config(format!(
                "Device '{}' has no SSH credentials (set host and username)",
                self.descriptor.id
            ))
        })
    }

    async fn api_get(&self, path: &str) -> Result<Value> {
        self.api.call_json(ApiRequest::get(path)).await
    }

    /// Mark the outcome of a combined API/SSH attempt
    fn settle<T>(&self, outcome: Result<T>) -> Result<T> {
        match &outcome {
            Ok(_) => self.state.set(ConnectionState::Connected),
            Err(_) => self.state.set(ConnectionState::Error),
        }
        outcome
    }
}

#[async_trait]
impl Connector for ApplianceConnector {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> ConnectionState {
        match &self.shell {
            Some(shell) => shell.state(),
            None => self.state.get(),
        }
    }

    async fn connect(&self) -> Result<()> {
        let api_error = match self.api_get(self.dialect.status_path()).await {
            Ok(_) => return self.settle(Ok(())),
            Err(e) => e,
        };
        match &self.shell {
            Some(shell) => {
                warn!("{} API unreachable ({}), trying SSH", self.descriptor.id, api_error);
                let outcome = shell.connect().await;
                self.settle(outcome)
            }
            None => self.settle(Err(api_error)),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(shell) = &self.shell {
            shell.disconnect().await?;
        }
        self.api.disconnect().await
    }

    async fn collect_status(&self) -> Result<StatusEnvelope> {
        let api_error = match self.api_get(self.dialect.status_path()).await {
            Ok(info) => {
                self.state.set(ConnectionState::Connected);
                return Ok(self.dialect.status(&self.descriptor, &info));
            }
            Err(e) => e,
        };
        let Some(shell) = &self.shell else {
            return self.settle(Err(api_error));
        };

        debug!("{} status via API failed ({}), falling back to SSH", self.descriptor.id, api_error);
        let outcome = shell.exec(self.dialect.status_command(), None).await.map(|raw| {
            StatusEnvelope::new(&self.descriptor, ConnectionState::Connected).with_detail("raw", raw)
        });
        self.settle(outcome)
    }

    async fn execute_command(&self, command: &str) -> Result<CommandResult> {
        Ok(self.shell()?.execute_command(&self.descriptor.id, command).await)
    }

    async fn get_config(&self, section: Option<&str>) -> Result<String> {
        match &self.shell {
            Some(shell) => shell.exec(&self.dialect.config_command(section), None).await,
            None => pretty(&self.api_get(&self.dialect.config_path(section)).await?),
        }
    }

    async fn list_children(&self) -> Result<Value> {
        let interfaces = self.api_get(self.dialect.interfaces_path()).await?;
        Ok(match self.dialect {
            Dialect::Fortigate => interfaces.get("results").cloned().unwrap_or(interfaces),
            Dialect::Mikrotik => interfaces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::families::testing::{context, http_context};
    use crate::transport::http::testing::serve;
    use crate::transport::shell::testing::{ScriptedDialer, ScriptedSession};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn mikrotik_api() -> String {
        async fn resource(headers: HeaderMap) -> impl IntoResponse {
            // admin:secret
            if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Basic YWRtaW46c2VjcmV0") {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            Json(json!({
                "uptime": "3w2d4h",
                "version": "7.14.2 (stable)",
                "board-name": "CCR2004-1G-12S+2XS",
                "cpu-load": 4,
                "free-memory": 3_500_000_000u64,
                "total-memory": 4_294_967_296u64
            }))
            .into_response()
        }
        let app = Router::new()
            .route("/rest/system/resource", get(resource))
            .route("/rest/interface", get(|| async { Json(json!([{"name": "ether1"}, {"name": "sfp1"}])) }));
        format!("http://{}", serve(app).await)
    }

    #[tokio::test]
    async fn test_mikrotik_status_from_rest() {
        let url = mikrotik_api().await;
        let descriptor = DeviceDescriptor::new("mt1", "edge router", Family::Mikrotik)
            .with_api_url(url)
            .with_credentials("admin", "secret");
        let connector = ApplianceConnector::new(descriptor, &http_context()).unwrap();

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.model.as_deref(), Some("CCR2004-1G-12S+2XS"));
        assert_eq!(status.details["cpu"], 4);
        assert_eq!(connector.list_children().await.unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fortigate_falls_back_to_ssh() {
        let dialer = ScriptedDialer::new(|| ScriptedSession {
            exec_replies: vec![(
                "get system status".to_string(),
                "Version: FortiGate-60F v7.2.5\nSerial-Number: FGT60F0000000001".to_string(),
            )],
            ..Default::default()
        });
        let descriptor = DeviceDescriptor::new("fw1", "firewall", Family::Fortigate)
            .with_host("127.0.0.1")
            .with_api_url("http://127.0.0.1:9")
            .with_credentials("admin", "secret")
            .with_api_key("token");
        let connector = ApplianceConnector::new(descriptor, &context(dialer.clone())).unwrap();

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.details["raw"].as_str().unwrap().contains("FortiGate-60F"));
        assert!(connector.test_connection().await);
        assert_eq!(connector.state(), ConnectionState::Connected);

        dialer.kill_last();
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_both_paths_failing_is_error_state() {
        let descriptor = DeviceDescriptor::new("fw2", "firewall", Family::Fortigate)
            .with_host("127.0.0.1")
            .with_api_url("http://127.0.0.1:9")
            .with_credentials("admin", "secret");
        let connector = ApplianceConnector::new(descriptor, &http_context()).unwrap();

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error_message().is_some());
        assert_eq!(connector.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_execute_without_ssh_credentials() {
        let descriptor = DeviceDescriptor::new("fw3", "firewall", Family::Fortigate)
            .with_api_url("http://127.0.0.1:9")
            .with_api_key("token");
        let connector = ApplianceConnector::new(descriptor, &http_context()).unwrap();
        let err = connector.execute_command("get system status").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_config_commands() {
        assert_eq!(Dialect::Mikrotik.config_command(Some("/ip firewall filter")), "/ip firewall filter export");
        assert_eq!(Dialect::Fortigate.config_command(None), "show full-configuration");
        assert_eq!(Dialect::Fortigate.config_path(Some("firewall/policy")), "/api/v2/cmdb/firewall/policy");
    }
}
