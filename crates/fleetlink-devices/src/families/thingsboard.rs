/*!
 * ThingsBoard IoT platform.
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, FamilyContext};
use crate::transport::{ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

/// Seconds until the `exp` claim of a JWT, if it can be read
fn jwt_ttl(token: &str) -> Option<Duration> {
    let payload = token.split('.').nth(1)?;
    let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    let left = exp - chrono::Utc::now().timestamp();
    u64::try_from(left).ok().map(Duration::from_secs)
}

struct ThingsboardAuth {
    username: String,
    password: String,
}

impl std::fmt::Debug for ThingsboardAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThingsboardAuth").field("username", &self.username).finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for ThingsboardAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let body = http
            .request(
                ApiRequest::post("/api/auth/login")
                    .json(&json!({ "username": self.username, "password": self.password })),
            )
            .await?
            .into_json()?;
        let token = body["token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConnectorError::auth("ThingsBoard login returned no token"))?;

        let credential = Credential::new()
            .with_header("X-Authorization", format!("Bearer {}", token))
            .with_token(token);
        Ok(match jwt_ttl(token) {
            Some(ttl) => credential.expires_in(ttl.saturating_sub(Duration::from_secs(30))),
            None => credential,
        })
    }

    async fn logout(&self, http: &HttpTransport, credential: &Credential) -> Result<()> {
        if let Some(token) = credential.token() {
            http.request(ApiRequest::post("/api/auth/logout").header("X-Authorization", format!("Bearer {}", token)))
                .await?;
        }
        Ok(())
    }
}

/// A ThingsBoard tenant
#[derive(Debug)]
pub struct ThingsboardConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
}

impl ThingsboardConnector {
    /// Build a connector; needs `host` or `apiUrl` and `username`
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let auth = ThingsboardAuth {
            username: descriptor.require_username()?.to_string(),
            password: descriptor.password_or_empty().to_string(),
        };
        let http = http_transport(&descriptor, &ctx.transport, false)?;
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self { descriptor, api })
    }
}

#[async_trait]
impl Connector for ThingsboardConnector {
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
        let user = self.api.call_json(ApiRequest::get("/api/auth/user")).await?;
        Ok(StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_detail("email", user.get("email").cloned().unwrap_or(Value::Null))
            .with_detail("authority", user.get("authority").cloned().unwrap_or(Value::Null)))
    }

    async fn list_children(&self) -> Result<Value> {
        let limit = self.descriptor.extra_u64("pageSize").unwrap_or(100).to_string();
        let page = self
            .api
            .call_json(
                ApiRequest::get("/api/tenant/devices")
                    .query("pageSize", limit)
                    .query("page", "0"),
            )
            .await?;
        Ok(page.get("data").cloned().unwrap_or(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Family;
    use crate::families::testing::http_context;
    use crate::transport::http::testing::serve;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn jwt(exp: i64) -> String {
        let claims = URL_SAFE_NO_PAD.encode(json!({"sub": "tenant@thingsboard.org", "exp": exp}).to_string());
        format!("eyJhbGciOiJIUzUxMiJ9.{}.sig", claims)
    }

    #[derive(Default)]
    struct Tb {
        logins: AtomicUsize,
        rejected: AtomicUsize,
    }

    async fn server(state: Arc<Tb>, token: String) -> String {
        let login_token = token.clone();
        let app = Router::new()
            .route(
                "/api/auth/login",
                post(move |State(s): State<Arc<Tb>>| {
                    let token = login_token.clone();
                    async move {
                        s.logins.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"token": token, "refreshToken": "r"}))
                    }
                }),
            )
            .route(
                "/api/auth/user",
                get(move |State(s): State<Arc<Tb>>, headers: HeaderMap| {
                    let expected = format!("Bearer {}", token);
                    async move {
                        if headers.get("x-authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
                            s.rejected.fetch_add(1, Ordering::SeqCst);
                            return StatusCode::UNAUTHORIZED.into_response();
                        }
                        Json(json!({"email": "tenant@thingsboard.org", "authority": "TENANT_ADMIN"})).into_response()
                    }
                }),
            )
            .route(
                "/api/tenant/devices",
                get(|| async { Json(json!({"data": [{"name": "sensor-1"}], "totalPages": 1})) }),
            )
            .with_state(state);
        format!("http://{}", serve(app).await)
    }

    fn connector(url: String) -> ThingsboardConnector {
        let descriptor = DeviceDescriptor::new("tb", "iot platform", Family::Thingsboard)
            .with_api_url(url)
            .with_credentials("tenant@thingsboard.org", "tenant");
        ThingsboardConnector::new(descriptor, &http_context()).unwrap()
    }

    #[tokio::test]
    async fn test_status_uses_jwt_header() {
        let state = Arc::new(Tb::default());
        let exp = chrono::Utc::now().timestamp() + 3600;
        let connector = connector(server(state.clone(), jwt(exp)).await);

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.details["authority"], "TENANT_ADMIN");
        assert_eq!(state.rejected.load(Ordering::SeqCst), 0);

        let children = connector.list_children().await.unwrap();
        assert_eq!(children[0]["name"], "sensor-1");
        assert_eq!(state.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_jwt_logs_in_again() {
        let state = Arc::new(Tb::default());
        let exp = chrono::Utc::now().timestamp() + 10;
        let connector = connector(server(state.clone(), jwt(exp)).await);

        connector.get_status().await;
        connector.get_status().await;
        assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_jwt_ttl() {
        let exp = chrono::Utc::now().timestamp() + 600;
        let ttl = jwt_ttl(&jwt(exp)).unwrap();
        assert!(ttl <= Duration::from_secs(600) && ttl >= Duration::from_secs(590));
        assert!(jwt_ttl("opaque-token").is_none());
        assert!(jwt_ttl(&jwt(0)).is_none());
    }
}
