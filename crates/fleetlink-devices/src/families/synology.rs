/*!
 * Synology DSM NAS appliances.
 */
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, pretty, text_field, FamilyContext};
use crate::transport::{ApiBody, ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

/// DSM error codes meaning the session id is no longer valid
const SESSION_ERRORS: [i64; 3] = [106, 107, 119];

fn error_code(body: &Value) -> Option<i64> {
    body.pointer("/error/code").and_then(Value::as_i64)
}

fn failed(body: &Value) -> bool {
    body.get("success").and_then(Value::as_bool) == Some(false)
}

struct SynologyAuth {
    username: String,
    password: String,
}

impl std::fmt::Debug for SynologyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynologyAuth").field("username", &self.username).finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for SynologyAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let body = http
            .request(
                ApiRequest::get("/webapi/auth.cgi")
                    .query("api", "SYNO.API.Auth")
                    .query("version", "6")
                    .query("method", "login")
                    .query("account", self.username.as_str())
                    .query("passwd", self.password.as_str())
                    .query("session", "MCP")
                    .query("format", "sid"),
            )
            .await?
            .into_json()?;
        let sid = body
            .pointer("/data/sid")
            .and_then(Value::as_str)
            .filter(|sid| !failed(&body) && !sid.is_empty())
            .ok_or_else(|| {
                ConnectorError::auth(format!(
                    "Synology login rejected (error code: {})",
                    error_code(&body).map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
                ))
            })?;
        Ok(Credential::new().with_query("_sid", sid).with_token(sid))
    }

    fn is_expired(&self, outcome: &Result<ApiBody>) -> bool {
        match outcome {
            Err(e) => e.http_status() == Some(401),
            Ok(ApiBody::Json(body)) => failed(body) && error_code(body).is_some_and(|c| SESSION_ERRORS.contains(&c)),
            Ok(ApiBody::Text(_)) => false,
        }
    }

    async fn logout(&self, http: &HttpTransport, credential: &Credential) -> Result<()> {
        if let Some(sid) = credential.token() {
            http.request(
                ApiRequest::get("/webapi/auth.cgi")
                    .query("api", "SYNO.API.Auth")
                    .query("version", "6")
                    .query("method", "logout")
                    .query("session", "MCP")
                    .query("_sid", sid),
            )
            .await?;
        }
        Ok(())
    }
}

/// A Synology NAS
#[derive(Debug)]
pub struct SynologyConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
}

impl SynologyConnector {
    /// Build a connector; needs `host` or `apiUrl` and `username`
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let auth = SynologyAuth {
            username: descriptor.require_username()?.to_string(),
            password: descriptor.password_or_empty().to_string(),
        };
        let http = http_transport(&descriptor, &ctx.transport, false)?;
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self { descriptor, api })
    }

    /// Call one DSM web API method and return its `data`
    async fn dsm(&self, api: &str, version: &str, method: &str, extra: &[(&str, &str)]) -> Result<Value> {
        let mut request = ApiRequest::get("/webapi/entry.cgi")
            .query("api", api)
            .query("version", version)
            .query("method", method);
        for (key, value) in extra {
            request = request.query(*key, *value);
        }
        let mut body = self.api.call_json(request).await?;
        if failed(&body) {
            let code = error_code(&body).map(|c| c.to_string()).unwrap_or_else(|| "unknown".into());
            return Err(ConnectorError::api(None, format!("Synology {} {} failed (code: {})", api, method, code)));
        }
        Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Connector for SynologyConnector {
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
        let info = self.dsm("SYNO.DSM.Info", "2", "getinfo", &[]).await?;
        let mut status = StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_model(text_field(&info, "model"))
            .with_firmware(text_field(&info, "version_string"))
            .with_uptime(text_field(&info, "up_time").or_else(|| text_field(&info, "uptime")))
            .with_serial(text_field(&info, "serial"));
        if let Value::Object(map) = info {
            status.details.extend(map);
        }
        Ok(status)
    }

    async fn get_config(&self, _section: Option<&str>) -> Result<String> {
        pretty(&self.dsm("SYNO.DSM.Info", "2", "getinfo", &[]).await?)
    }

    async fn list_children(&self) -> Result<Value> {
        match self.dsm("SYNO.Storage.CGI.Storage", "1", "load_info", &[]).await {
            Ok(storage) => Ok(storage),
            Err(_) => self.dsm("SYNO.Core.Storage.Volume", "1", "list", &[]).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Family;
    use crate::error::ErrorKind;
    use crate::families::testing::http_context;
    use crate::transport::http::testing::serve;
    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Dsm {
        logins: AtomicUsize,
        logouts: AtomicUsize,
        expire_next: AtomicUsize,
    }

    async fn server(state: Arc<Dsm>) -> String {
        async fn auth(State(s): State<Arc<Dsm>>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
            match q.get("method").map(String::as_str) {
                Some("login") if q.get("passwd").map(String::as_str) == Some("secret") => {
                    let n = s.logins.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({"success": true, "data": {"sid": format!("sid-{}", n)}}))
                }
                Some("logout") => {
                    s.logouts.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"success": true}))
                }
                _ => Json(json!({"success": false, "error": {"code": 400}})),
            }
        }
        async fn entry(State(s): State<Arc<Dsm>>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
            if q.get("_sid").is_none() {
                return Json(json!({"success": false, "error": {"code": 119}}));
            }
            if s.expire_next.load(Ordering::SeqCst) > 0 {
                s.expire_next.fetch_sub(1, Ordering::SeqCst);
                return Json(json!({"success": false, "error": {"code": 106}}));
            }
            match q.get("api").map(String::as_str) {
                Some("SYNO.DSM.Info") => Json(json!({"success": true, "data": {
                    "model": "DS920+", "version_string": "DSM 7.2.1-69057", "up_time": "12:03:44", "serial": "2080PDN123"
                }})),
                _ => Json(json!({"success": false, "error": {"code": 102}})),
            }
        }
        let app = Router::new()
            .route("/webapi/auth.cgi", get(auth))
            .route("/webapi/entry.cgi", get(entry))
            .with_state(state);
        format!("http://{}", serve(app).await)
    }

    fn connector(url: String, password: &str) -> SynologyConnector {
        let descriptor = DeviceDescriptor::new("ds1", "media nas", Family::Synology)
            .with_api_url(url)
            .with_credentials("admin", password);
        SynologyConnector::new(descriptor, &http_context()).unwrap()
    }

    #[tokio::test]
    async fn test_status_and_logout() {
        let state = Arc::new(Dsm::default());
        let connector = connector(server(state.clone()).await, "secret");

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.model.as_deref(), Some("DS920+"));
        assert_eq!(status.firmware.as_deref(), Some("DSM 7.2.1-69057"));
        assert_eq!(status.uptime.as_deref(), Some("12:03:44"));

        connector.disconnect().await.unwrap();
        assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_error_code_relogs_once() {
        let state = Arc::new(Dsm::default());
        let connector = connector(server(state.clone()).await, "secret");
        connector.connect().await.unwrap();
        state.expire_next.store(1, Ordering::SeqCst);

        assert!(connector.get_config(None).await.unwrap().contains("DS920+"));
        assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_session_error_code_is_api_error() {
        let connector = connector(server(Arc::new(Dsm::default())).await, "secret");
        let err = connector.list_children().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().contains("102"));
    }

    #[tokio::test]
    async fn test_rejected_login_reports_code() {
        let connector = connector(server(Arc::new(Dsm::default())).await, "nope");
        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert!(err.to_string().contains("400"));
    }
}
