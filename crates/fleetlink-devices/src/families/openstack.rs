/*!
 * OpenStack clouds through Keystone v3.
 *
 * A password login scoped to one project returns the token in the
 * `X-Subject-Token` response header and the service catalog in the body.
 * Nova, Neutron, Cinder and Glance are called on the endpoints the catalog
 * advertises, preferring the public interface.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, http_transport_at, pretty, FamilyContext};
use crate::transport::{ApiBody, ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

const KEYSTONE_PORT: u16 = 5000;

/// Tokens are renewed this long before `expires_at`
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Server actions and the Nova request body each one sends
const SERVER_ACTIONS: [&str; 8] = ["start", "stop", "reboot", "hard-reboot", "pause", "unpause", "suspend", "resume"];

fn action_body(action: &str) -> Option<Value> {
    Some(match action {
        "start" => json!({ "os-start": null }),
        "stop" => json!({ "os-stop": null }),
        "reboot" => json!({ "reboot": { "type": "SOFT" } }),
        "hard-reboot" => json!({ "reboot": { "type": "HARD" } }),
        "pause" => json!({ "pause": null }),
        "unpause" => json!({ "unpause": null }),
        "suspend" => json!({ "suspend": null }),
        "resume" => json!({ "resume": null }),
        _ => return None,
    })
}

/// Catalog services the connector talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Service {
    /// Nova
    Compute,
    /// Neutron
    Network,
    /// Cinder
    Volume,
    /// Glance
    Image,
}

impl Service {
    const ALL: [Service; 4] = [Service::Compute, Service::Network, Service::Volume, Service::Image];

    fn from_catalog_type(kind: &str) -> Option<Self> {
        match kind {
            "compute" => Some(Service::Compute),
            "network" => Some(Service::Network),
            "volumev3" | "volumev2" | "block-storage" => Some(Service::Volume),
            "image" => Some(Service::Image),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Service::Compute => "compute",
            Service::Network => "network",
            Service::Volume => "volume",
            Service::Image => "image",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Service::Compute => "Nova compute",
            Service::Network => "Neutron network",
            Service::Volume => "Cinder volume",
            Service::Image => "Glance image",
        }
    }
}

/// What the last login learned about the project
#[derive(Debug, Clone, Default)]
struct Catalog {
    project_id: Option<String>,
    endpoints: HashMap<Service, String>,
}

impl Catalog {
    /// Read `token.project` and `token.catalog` from a Keystone token body.
    /// The first volume service wins; later entries of other types replace
    /// earlier ones.
    fn from_token(token: &Value) -> Self {
        let mut catalog = Catalog {
            project_id: token.pointer("/project/id").and_then(Value::as_str).map(str::to_string),
            endpoints: HashMap::new(),
        };
        let entries = token.get("catalog").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
        for entry in entries {
            let Some(service) = entry.get("type").and_then(Value::as_str).and_then(Service::from_catalog_type) else {
                continue;
            };
            let endpoints = entry.get("endpoints").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
            let on = |interface: &str| endpoints.iter().find(|e| e.get("interface").and_then(Value::as_str) == Some(interface));
            let Some(url) = on("public")
                .or_else(|| on("internal"))
                .or_else(|| endpoints.first())
                .and_then(|e| e.get("url").and_then(Value::as_str))
            else {
                continue;
            };
            let url = url.trim_end_matches('/').to_string();
            match service {
                Service::Volume => {
                    catalog.endpoints.entry(service).or_insert(url);
                }
                _ => {
                    catalog.endpoints.insert(service, url);
                }
            }
        }
        catalog
    }

    fn services(&self) -> Vec<&'static str> {
        Service::ALL
            .iter()
            .filter(|s| self.endpoints.contains_key(*s))
            .map(|s| s.as_str())
            .collect()
    }
}

struct KeystoneAuth {
    username: String,
    password: String,
    project: String,
    domain: String,
    catalog: Arc<RwLock<Catalog>>,
}

impl std::fmt::Debug for KeystoneAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoneAuth")
            .field("username", &self.username)
            .field("project", &self.project)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl KeystoneAuth {
    fn password_scope(&self) -> Value {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": { "name": self.domain },
                            "password": self.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.project,
                        "domain": { "name": self.domain },
                    }
                }
            }
        })
    }
}

/// Time left until an RFC 3339 `expires_at`, less the renewal margin
fn token_ttl(expires_at: &str) -> Option<Duration> {
    let at = chrono::DateTime::parse_from_rfc3339(expires_at).ok()?;
    let left = (at.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok()?;
    Some(left.checked_sub(EXPIRY_MARGIN).filter(|d| !d.is_zero()).unwrap_or(left))
}

#[async_trait]
impl Authenticator for KeystoneAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let response = http
            .request_full(ApiRequest::post("/v3/auth/tokens").json(&self.password_scope()))
            .await?;
        let token = response
            .header("x-subject-token")
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::auth("Keystone response carried no X-Subject-Token"))?;

        let body = response.into_body().into_json()?;
        let details = body.get("token").cloned().unwrap_or(Value::Null);
        let catalog = Catalog::from_token(&details);
        debug!("Keystone catalog for {} lists {:?}", self.project, catalog.services());
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = catalog;

        let credential = Credential::new().with_header("X-Auth-Token", token.as_str()).with_token(token);
        Ok(match details.get("expires_at").and_then(Value::as_str).and_then(token_ttl) {
            Some(ttl) => credential.expires_in(ttl),
            None => credential,
        })
    }

    async fn logout(&self, http: &HttpTransport, credential: &Credential) -> Result<()> {
        if let Some(token) = credential.token() {
            http.request(
                ApiRequest::delete("/v3/auth/tokens")
                    .header("X-Auth-Token", token)
                    .header("X-Subject-Token", token),
            )
            .await?;
        }
        Ok(())
    }
}

/// One OpenStack project
#[derive(Debug)]
pub struct OpenstackConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
    catalog: Arc<RwLock<Catalog>>,
}

impl OpenstackConnector {
    /// Build a connector; needs `username` and `apiUrl` or `host`
    /// (Keystone on `https://<host>:5000`). `extra.project` and
    /// `extra.domain` default to `admin` and `Default`.
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let catalog = Arc::new(RwLock::new(Catalog::default()));
        let auth = KeystoneAuth {
            username: descriptor.require_username()?.to_string(),
            password: descriptor.password_or_empty().to_string(),
            project: descriptor.extra_str("project").unwrap_or("admin").to_string(),
            domain: descriptor.extra_str("domain").unwrap_or("Default").to_string(),
            catalog: catalog.clone(),
        };
        let http = match descriptor.api_url {
            Some(_) => http_transport(&descriptor, &ctx.transport, false)?,
            None => {
                let keystone = format!(
                    "https://{}:{}",
                    descriptor.require_host()?,
                    descriptor.port.unwrap_or(KEYSTONE_PORT)
                );
                http_transport_at(keystone, &descriptor, &ctx.transport, false)?
            }
        };
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self {
            descriptor,
            api,
            catalog,
        })
    }

    fn catalog(&self) -> Catalog {
        self.catalog.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn endpoint(&self, service: Service) -> Result<String> {
        self.api.ensure_credential().await?;
        self.catalog()
            .endpoints
            .get(&service)
            .cloned()
            .ok_or_else(|| ConnectorError::protocol(format!("{} endpoint not found in service catalog", service.label())))
    }

    /// GET `path` on `service` and unwrap the `key` member
    async fn service_get(&self, service: Service, path: &str, key: &str) -> Result<Value> {
        let url = format!("{}{}", self.endpoint(service).await?, path);
        let mut body = self.api.call_json(ApiRequest::get(url)).await?;
        Ok(body.get_mut(key).map(Value::take).unwrap_or(Value::Null))
    }

    /// Nova servers with details
    pub async fn list_servers(&self) -> Result<Value> {
        self.service_get(Service::Compute, "/servers/detail", "servers").await
    }

    /// One Nova server
    pub async fn server_detail(&self, server_id: &str) -> Result<Value> {
        self.service_get(Service::Compute, &format!("/servers/{}", server_id), "server").await
    }

    /// Run a lifecycle action (`start`, `stop`, `reboot`, `hard-reboot`,
    /// `pause`, `unpause`, `suspend`, `resume`) on a server
    pub async fn server_action(&self, server_id: &str, action: &str) -> Result<Value> {
        let body = action_body(action).ok_or_else(|| {
            ConnectorError::config(format!(
                "Unknown server action: {}. Valid: {}",
                action,
                SERVER_ACTIONS.join(", ")
            ))
        })?;
        let url = format!("{}/servers/{}/action", self.endpoint(Service::Compute).await?, server_id);
        Ok(match self.api.call(ApiRequest::post(url).json(&body)).await? {
            ApiBody::Json(value) if !value.is_null() => value,
            _ => json!({ "success": true }),
        })
    }

    /// Nova flavors
    pub async fn list_flavors(&self) -> Result<Value> {
        self.service_get(Service::Compute, "/flavors/detail", "flavors").await
    }

    /// Nova hypervisors
    pub async fn list_hypervisors(&self) -> Result<Value> {
        self.service_get(Service::Compute, "/os-hypervisors/detail", "hypervisors").await
    }

    /// Glance images
    pub async fn list_images(&self) -> Result<Value> {
        self.service_get(Service::Image, "/v2/images", "images").await
    }

    /// Neutron networks
    pub async fn list_networks(&self) -> Result<Value> {
        self.service_get(Service::Network, "/v2.0/networks", "networks").await
    }

    /// Neutron subnets
    pub async fn list_subnets(&self) -> Result<Value> {
        self.service_get(Service::Network, "/v2.0/subnets", "subnets").await
    }

    /// Neutron routers
    pub async fn list_routers(&self) -> Result<Value> {
        self.service_get(Service::Network, "/v2.0/routers", "routers").await
    }

    /// Neutron floating IPs
    pub async fn list_floating_ips(&self) -> Result<Value> {
        self.service_get(Service::Network, "/v2.0/floatingips", "floatingips").await
    }

    /// Cinder volumes
    pub async fn list_volumes(&self) -> Result<Value> {
        self.service_get(Service::Volume, "/volumes/detail", "volumes").await
    }

    /// Keystone projects visible to the user
    pub async fn list_projects(&self) -> Result<Value> {
        let mut body = self.api.call_json(ApiRequest::get("/v3/projects")).await?;
        Ok(body.get_mut("projects").map(Value::take).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Connector for OpenstackConnector {
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
        self.api.ensure_credential().await?;
        let catalog = self.catalog();
        Ok(StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_detail("keystoneUrl", self.api.http().base_url())
            .with_detail("projectId", catalog.project_id.clone().map(Value::from).unwrap_or(Value::Null))
            .with_detail("services", catalog.services()))
    }

    /// Keystone URL, project and the resolved endpoints
    async fn get_config(&self, _section: Option<&str>) -> Result<String> {
        self.api.ensure_credential().await?;
        let catalog = self.catalog();
        let endpoints: serde_json::Map<String, Value> = Service::ALL
            .iter()
            .filter_map(|s| catalog.endpoints.get(s).map(|url| (s.as_str().to_string(), Value::from(url.as_str()))))
            .collect();
        pretty(&json!({
            "keystoneUrl": self.api.http().base_url(),
            "projectId": catalog.project_id,
            "endpoints": endpoints,
        }))
    }

    async fn list_children(&self) -> Result<Value> {
        self.list_servers().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Family;
    use crate::error::ErrorKind;
    use crate::families::testing::http_context;
    use crate::transport::http::testing::serve;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Keystone {
        base: Mutex<String>,
        logins: AtomicUsize,
        logouts: AtomicUsize,
        revoked: AtomicBool,
        omit_subject_token: AtomicBool,
    }

    impl Keystone {
        fn current(&self) -> String {
            format!("tok-{}", self.logins.load(Ordering::SeqCst))
        }

        fn accepts(&self, headers: &HeaderMap) -> bool {
            let token = headers.get("x-auth-token").and_then(|v| v.to_str().ok());
            !self.revoked.load(Ordering::SeqCst) && token == Some(self.current().as_str())
        }
    }

    async fn tokens(State(k): State<Arc<Keystone>>, Json(body): Json<Value>) -> impl IntoResponse {
        let user = &body["auth"]["identity"]["password"]["user"];
        let scoped = body["auth"]["scope"]["project"]["name"] == "ops";
        if user["name"] != "admin" || user["password"] != "secret" || !scoped {
            return (StatusCode::UNAUTHORIZED, "The request you have made requires authentication.").into_response();
        }
        let n = k.logins.fetch_add(1, Ordering::SeqCst) + 1;
        k.revoked.store(false, Ordering::SeqCst);
        let base = k.base.lock().unwrap().clone();
        let token = json!({
            "token": {
                "expires_at": (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
                "project": { "id": "8c1f", "name": "ops" },
                "catalog": [
                    { "type": "compute", "name": "nova", "endpoints": [
                        { "interface": "internal", "url": "http://10.0.0.1:8774/v2.1" },
                        { "interface": "public", "url": format!("{}/compute/v2.1/", base) }
                    ]},
                    { "type": "network", "name": "neutron", "endpoints": [
                        { "interface": "admin", "url": format!("{}/network", base) }
                    ]},
                    { "type": "identity", "name": "keystone", "endpoints": [] }
                ]
            }
        });
        let mut response = (StatusCode::CREATED, Json(token)).into_response();
        if !k.omit_subject_token.load(Ordering::SeqCst) {
            response.headers_mut().insert("x-subject-token", format!("tok-{}", n).parse().unwrap());
        }
        response
    }

    async fn revoke(State(k): State<Arc<Keystone>>) -> StatusCode {
        k.logouts.fetch_add(1, Ordering::SeqCst);
        StatusCode::NO_CONTENT
    }

    async fn servers(State(k): State<Arc<Keystone>>, headers: HeaderMap) -> impl IntoResponse {
        if !k.accepts(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Json(json!({ "servers": [{ "id": "vm-1", "name": "bastion", "status": "ACTIVE" }] })).into_response()
    }

    async fn action(State(k): State<Arc<Keystone>>, Path(id): Path<String>, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
        if !k.accepts(&headers) {
            return StatusCode::UNAUTHORIZED;
        }
        if id == "vm-1" && body["reboot"]["type"] == "HARD" {
            StatusCode::ACCEPTED
        } else {
            StatusCode::BAD_REQUEST
        }
    }

    async fn networks(State(k): State<Arc<Keystone>>, headers: HeaderMap) -> impl IntoResponse {
        if !k.accepts(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Json(json!({ "networks": [{ "id": "net-1", "name": "provider" }] })).into_response()
    }

    async fn cloud() -> (Arc<Keystone>, String) {
        let state = Arc::new(Keystone::default());
        let app = Router::new()
            .route("/v3/auth/tokens", post(tokens).delete(revoke))
            .route("/compute/v2.1/servers/detail", get(servers))
            .route("/compute/v2.1/servers/:id/action", post(action))
            .route("/network/v2.0/networks", get(networks))
            .with_state(state.clone());
        let url = format!("http://{}", serve(app).await);
        *state.base.lock().unwrap() = url.clone();
        (state, url)
    }

    fn connector(url: String, password: &str) -> OpenstackConnector {
        let descriptor = DeviceDescriptor::new("os", "private cloud", Family::Openstack)
            .with_api_url(url)
            .with_credentials("admin", password)
            .with_extra("project", "ops");
        OpenstackConnector::new(descriptor, &http_context()).unwrap()
    }

    #[tokio::test]
    async fn test_token_header_and_catalog() {
        let (state, url) = cloud().await;
        let connector = connector(url.clone(), "secret");

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.details["projectId"], "8c1f");
        assert_eq!(status.details["services"], json!(["compute", "network"]));
        assert_eq!(status.details["keystoneUrl"], url.as_str());

        let servers = connector.list_children().await.unwrap();
        assert_eq!(servers[0]["name"], "bastion");
        assert_eq!(connector.list_networks().await.unwrap()[0]["id"], "net-1");
        assert_eq!(state.logins.load(Ordering::SeqCst), 1);

        let config: Value = serde_json::from_str(&connector.get_config(None).await.unwrap()).unwrap();
        assert_eq!(config["endpoints"]["compute"], format!("{}/compute/v2.1", url));
    }

    #[tokio::test]
    async fn test_rejected_token_logs_in_again() {
        let (state, url) = cloud().await;
        let connector = connector(url, "secret");
        connector.connect().await.unwrap();

        state.revoked.store(true, Ordering::SeqCst);
        assert_eq!(connector.list_servers().await.unwrap()[0]["id"], "vm-1");
        assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_actions() {
        let (_, url) = cloud().await;
        let connector = connector(url, "secret");

        let done = connector.server_action("vm-1", "hard-reboot").await.unwrap();
        assert_eq!(done, json!({ "success": true }));

        let err = connector.server_action("vm-1", "explode").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("hard-reboot"));
    }

    #[tokio::test]
    async fn test_service_missing_from_catalog() {
        let (_, url) = cloud().await;
        let err = connector(url, "secret").list_volumes().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("Cinder volume endpoint"));
    }

    #[tokio::test]
    async fn test_login_failures() {
        let (state, url) = cloud().await;
        let status = connector(url.clone(), "wrong").get_status().await;
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error_message().unwrap().contains("401"));

        state.omit_subject_token.store(true, Ordering::SeqCst);
        let err = connector(url, "secret").connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert!(err.to_string().contains("X-Subject-Token"));
    }

    #[tokio::test]
    async fn test_disconnect_revokes_token() {
        let (state, url) = cloud().await;
        let connector = connector(url, "secret");
        connector.connect().await.unwrap();
        connector.disconnect().await.unwrap();
        assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_catalog_prefers_public_and_first_volume_service() {
        let catalog = Catalog::from_token(&json!({
            "catalog": [
                { "type": "volumev3", "endpoints": [{ "interface": "public", "url": "https://cinder:8776/v3/" }] },
                { "type": "volumev2", "endpoints": [{ "interface": "public", "url": "https://cinder:8776/v2" }] },
                { "type": "image", "endpoints": [
                    { "interface": "internal", "url": "http://glance-int:9292" },
                    { "interface": "admin", "url": "http://glance-adm:9292" }
                ]},
                { "type": "compute", "endpoints": [] }
            ]
        }));
        assert_eq!(catalog.endpoints[&Service::Volume], "https://cinder:8776/v3");
        assert_eq!(catalog.endpoints[&Service::Image], "http://glance-int:9292");
        assert!(!catalog.endpoints.contains_key(&Service::Compute));
        assert_eq!(catalog.project_id, None);
        assert_eq!(catalog.services(), vec!["volume", "image"]);
    }

    #[test]
    fn test_keystone_port_default() {
        let descriptor = DeviceDescriptor::new("os", "cloud", Family::Openstack)
            .with_host("keystone.local")
            .with_credentials("admin", "x");
        let connector = OpenstackConnector::new(descriptor, &http_context()).unwrap();
        assert_eq!(connector.api.http().base_url(), "https://keystone.local:5000");
    }

    #[test]
    fn test_token_ttl_keeps_a_margin() {
        let in_an_hour = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let ttl = token_ttl(&in_an_hour).unwrap();
        assert!(ttl <= Duration::from_secs(3540) && ttl > Duration::from_secs(3500));
        assert!(token_ttl("2001-01-01T00:00:00Z").is_none());
        assert!(token_ttl("tomorrow").is_none());
    }
}
