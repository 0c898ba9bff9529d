/*!
 * Proxmox VE clusters.
 *
 * Authenticates with an API token (`PVEAPIToken`) when one is configured,
 * otherwise with the ticket + CSRF token pair from `/access/ticket`.
 * Tickets are valid for two hours.
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, pretty, text_field, FamilyContext};
use crate::transport::{ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

const TICKET_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60 - 60);

#[derive(Clone)]
enum ProxmoxAuth {
    Token(String),
    Ticket { username: String, password: String },
}

impl std::fmt::Debug for ProxmoxAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxmoxAuth::Token(_) => f.write_str("ProxmoxAuth::Token"),
            ProxmoxAuth::Ticket { username, .. } => write!(f, "ProxmoxAuth::Ticket({})", username),
        }
    }
}

#[async_trait]
impl Authenticator for ProxmoxAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let (username, password) = match self {
            ProxmoxAuth::Token(token) => {
                return Ok(Credential::new().with_header("Authorization", format!("PVEAPIToken={}", token)))
            }
            ProxmoxAuth::Ticket { username, password } => (username, password),
        };

        let body = http
            .request(
                ApiRequest::post("/api2/json/access/ticket")
                    .json(&json!({ "username": username, "password": password })),
            )
            .await?
            .into_json()?;
        let data = &body["data"];
        let ticket = data["ticket"]
            .as_str()
            .ok_or_else(|| ConnectorError::auth("Proxmox login returned no ticket"))?;
        let csrf = data["CSRFPreventionToken"].as_str().unwrap_or_default();

        Ok(Credential::new()
            .with_header("Cookie", format!("PVEAuthCookie={}", ticket))
            .with_header("CSRFPreventionToken", csrf)
            .with_token(ticket)
            .expires_in(TICKET_LIFETIME))
    }
}

/// A Proxmox VE node or cluster
#[derive(Debug)]
pub struct ProxmoxConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
}

impl ProxmoxConnector {
    /// Build a connector; needs `host` or `apiUrl`, and `apiKey` or `username`
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let auth = match descriptor.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(token) => ProxmoxAuth::Token(token.to_string()),
            None => ProxmoxAuth::Ticket {
                username: descriptor.require_username()?.to_string(),
                password: descriptor.password_or_empty().to_string(),
            },
        };
        let http = http_transport(&descriptor, &ctx.transport, false)?;
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self { descriptor, api })
    }

    /// GET `/api2/json{path}` and unwrap `data`
    async fn get(&self, path: &str) -> Result<Value> {
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        let mut body = self.api.call_json(ApiRequest::get(format!("/api2/json{}", path))).await?;
        Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Connector for ProxmoxConnector {
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
        let nodes = self.get("/nodes").await?;
        let nodes = nodes
            .as_array()
            .ok_or_else(|| ConnectorError::protocol("Proxmox /nodes did not return a list"))?;
        let names: Vec<Value> = nodes.iter().filter_map(|n| n.get("node").cloned()).collect();
        let online = nodes
            .iter()
            .filter(|n| n.get("status").and_then(Value::as_str) == Some("online"))
            .count();
        let version = self.get("/version").await.ok();

        Ok(StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_firmware(version.as_ref().and_then(|v| text_field(v, "version")))
            .with_detail("nodes", nodes.len())
            .with_detail("online", online)
            .with_detail("nodeNames", names))
    }

    async fn get_config(&self, section: Option<&str>) -> Result<String> {
        pretty(&self.get(section.unwrap_or("/nodes")).await?)
    }

    async fn list_children(&self) -> Result<Value> {
        self.get("/cluster/resources?type=vm").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::testing::http_context;
    use crate::transport::http::testing::serve;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn ticket(State(logins): State<Arc<AtomicUsize>>, Json(body): Json<Value>) -> impl IntoResponse {
        if body["password"] != "secret" {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        logins.fetch_add(1, Ordering::SeqCst);
        Json(json!({"data": {"ticket": "PVE:root@pam:ABC", "CSRFPreventionToken": "csrf1"}})).into_response()
    }

    async fn nodes(headers: HeaderMap) -> impl IntoResponse {
        let cookie = headers.get("cookie").and_then(|v| v.to_str().ok()).unwrap_or_default();
        let token = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or_default();
        if cookie != "PVEAuthCookie=PVE:root@pam:ABC" && token != "PVEAPIToken=root@pam!ops=uuid" {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Json(json!({"data": [
            {"node": "pve1", "status": "online"},
            {"node": "pve2", "status": "offline"}
        ]}))
        .into_response()
    }

    async fn server(logins: Arc<AtomicUsize>) -> String {
        let app = Router::new()
            .route("/api2/json/access/ticket", post(ticket))
            .route("/api2/json/nodes", get(nodes))
            .route("/api2/json/version", get(|| async { Json(json!({"data": {"version": "8.1.4"}})) }))
            .with_state(logins);
        format!("http://{}", serve(app).await)
    }

    #[tokio::test]
    async fn test_ticket_login_and_status() {
        let logins = Arc::new(AtomicUsize::new(0));
        let descriptor = DeviceDescriptor::new("pve", "cluster", crate::descriptor::Family::Proxmox)
            .with_api_url(server(logins.clone()).await)
            .with_credentials("root@pam", "secret");
        let connector = ProxmoxConnector::new(descriptor, &http_context()).unwrap();

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.details["nodes"], 2);
        assert_eq!(status.details["online"], 1);
        assert_eq!(status.details["nodeNames"], json!(["pve1", "pve2"]));
        assert_eq!(status.firmware.as_deref(), Some("8.1.4"));

        connector.get_status().await;
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_api_token_skips_ticket() {
        let logins = Arc::new(AtomicUsize::new(0));
        let descriptor = DeviceDescriptor::new("pve", "cluster", crate::descriptor::Family::Proxmox)
            .with_api_url(server(logins.clone()).await)
            .with_api_key("root@pam!ops=uuid");
        let connector = ProxmoxConnector::new(descriptor, &http_context()).unwrap();

        assert!(connector.get_config(None).await.unwrap().contains("pve2"));
        assert_eq!(logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bad_password_is_error_envelope() {
        let descriptor = DeviceDescriptor::new("pve", "cluster", crate::descriptor::Family::Proxmox)
            .with_api_url(server(Arc::new(AtomicUsize::new(0))).await)
            .with_credentials("root@pam", "wrong");
        let connector = ProxmoxConnector::new(descriptor, &http_context()).unwrap();

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error_message().unwrap().contains("Authentication failed"));
        assert_eq!(connector.state(), ConnectionState::Error);
    }
}
