/*!
 * Dahua DSS Pro / Express video management servers.
 *
 * Everything is a JSON POST answered with `{success, data, code}`. The login
 * token travels in the `X-Subject-Token` header; code `1013` means it is no
 * longer valid.
 */
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, pretty, text_field, FamilyContext};
use crate::transport::{ApiBody, ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

const TOKEN_EXPIRED: &str = "1013";

/// `code` as text; DSS sends it as a string or a number
fn code(body: &Value) -> Option<String> {
    text_field(body, "code")
}

fn succeeded(body: &Value) -> bool {
    body.get("success").and_then(Value::as_bool) == Some(true)
}

struct DssAuth {
    username: String,
    password: String,
}

impl std::fmt::Debug for DssAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DssAuth").field("username", &self.username).finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for DssAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let body = http
            .request(ApiRequest::post("/admin/login").json(&json!({
                "userName": self.username,
                "password": self.password,
                "clientType": "winpc",
            })))
            .await?
            .into_json()?;
        let token = body
            .pointer("/data/token")
            .and_then(Value::as_str)
            .filter(|t| succeeded(&body) && !t.is_empty())
            .ok_or_else(|| {
                ConnectorError::auth(format!(
                    "DSS login failed: {}",
                    code(&body).unwrap_or_else(|| "unknown".into())
                ))
            })?;
        Ok(Credential::new().with_header("X-Subject-Token", token).with_token(token))
    }

    fn is_expired(&self, outcome: &Result<ApiBody>) -> bool {
        match outcome {
            Err(e) => e.http_status() == Some(401),
            Ok(ApiBody::Json(body)) => !succeeded(body) && code(body).as_deref() == Some(TOKEN_EXPIRED),
            Ok(ApiBody::Text(_)) => false,
        }
    }

    async fn logout(&self, http: &HttpTransport, credential: &Credential) -> Result<()> {
        if let Some(token) = credential.token() {
            http.request(ApiRequest::post("/admin/logout").json(&json!({})).header("X-Subject-Token", token))
                .await?;
        }
        Ok(())
    }
}

/// A DSS server and the recorders and cameras it manages
#[derive(Debug)]
pub struct DahuaDssConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
}

impl DahuaDssConnector {
    /// Build a connector; needs `host` or `apiUrl` and `username`
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let auth = DssAuth {
            username: descriptor.require_username()?.to_string(),
            password: descriptor.password_or_empty().to_string(),
        };
        let http = http_transport(&descriptor, &ctx.transport, false)?;
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self { descriptor, api })
    }

    /// POST `body` (an empty object when `None`) and unwrap `data`
    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let request = ApiRequest::post(path).json(&body.unwrap_or_else(|| json!({})));
        let mut reply = self.api.call_json(request).await?;
        if !succeeded(&reply) {
            return Err(ConnectorError::api(
                None,
                format!("DSS API error: {} (code: {})", path, code(&reply).unwrap_or_else(|| "unknown".into())),
            ));
        }
        Ok(reply.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    /// Server version and platform information
    pub async fn server_info(&self) -> Result<Value> {
        self.post("/admin/serverInfo/getServerInfo", None).await
    }

    /// One page of managed devices
    pub async fn list_devices(&self, page: u32, page_size: u32) -> Result<Value> {
        self.post("/device/list", Some(json!({ "pageNum": page, "pageSize": page_size })))
            .await
    }

    /// Details of one managed device
    pub async fn device_info(&self, device_code: &str) -> Result<Value> {
        self.post("/device/info", Some(json!({ "deviceCode": device_code }))).await
    }

    /// One page of channels, optionally of a single device
    pub async fn list_channels(&self, device_code: Option<&str>, page: u32, page_size: u32) -> Result<Value> {
        let mut body = json!({ "pageNum": page, "pageSize": page_size });
        if let Some(device_code) = device_code {
            body["deviceCode"] = device_code.into();
        }
        self.post("/device/channel/list", Some(body)).await
    }

    /// Online state of channels
    pub async fn channel_status(&self, channel_ids: &[&str]) -> Result<Value> {
        self.post("/device/channel/status", Some(json!({ "channelIds": channel_ids })))
            .await
    }

    /// One page of alarms, optionally bounded in time
    pub async fn list_alarms(
        &self,
        start_time: Option<&str>,
        end_time: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<Value> {
        let mut body = json!({ "pageNum": page, "pageSize": page_size });
        if let Some(start) = start_time {
            body["startTime"] = start.into();
        }
        if let Some(end) = end_time {
            body["endTime"] = end.into();
        }
        self.post("/alarm/list", Some(body)).await
    }

    /// The organization tree
    pub async fn list_organizations(&self) -> Result<Value> {
        self.post("/org/list", None).await
    }

    /// Recording state of one channel
    pub async fn record_status(&self, channel_id: &str) -> Result<Value> {
        self.post("/record/status", Some(json!({ "channelId": channel_id }))).await
    }

    /// Online state of devices
    pub async fn device_online_status(&self, device_codes: &[&str]) -> Result<Value> {
        self.post("/device/onlineStatus", Some(json!({ "deviceCodes": device_codes })))
            .await
    }
}

#[async_trait]
impl Connector for DahuaDssConnector {
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
        let info = self.server_info().await?;
        let mut status = StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_firmware(text_field(&info, "version"));
        if let Value::Object(fields) = info {
            status.details.extend(fields);
        }
        Ok(status)
    }

    async fn get_config(&self, _section: Option<&str>) -> Result<String> {
        pretty(&self.server_info().await?)
    }

    async fn list_children(&self) -> Result<Value> {
        self.list_devices(1, 50).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Family;
    use crate::error::ErrorKind;
    use crate::families::testing::http_context;
    use crate::transport::http::testing::serve;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Dss {
        logins: AtomicUsize,
        logouts: AtomicUsize,
        expire_next: AtomicUsize,
    }

    impl Dss {
        fn token_ok(&self, headers: &HeaderMap) -> bool {
            let expected = format!("dss-{}", self.logins.load(Ordering::SeqCst));
            headers.get("x-subject-token").and_then(|v| v.to_str().ok()) == Some(expected.as_str())
        }
    }

    async fn server(state: Arc<Dss>) -> String {
        async fn login(State(s): State<Arc<Dss>>, Json(body): Json<Value>) -> Json<Value> {
            if body["userName"] != "system" || body["password"] != "Admin123" || body["clientType"] != "winpc" {
                return Json(json!({ "success": false, "code": "1002" }));
            }
            let n = s.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({ "success": true, "data": { "token": format!("dss-{}", n) } }))
        }
        async fn logout(State(s): State<Arc<Dss>>) -> Json<Value> {
            s.logouts.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "success": true }))
        }
        async fn server_info(State(s): State<Arc<Dss>>, headers: HeaderMap) -> Json<Value> {
            if !s.token_ok(&headers) {
                return Json(json!({ "success": false, "code": "1013" }));
            }
            Json(json!({ "success": true, "data": { "version": "DSS Pro V8.3.0", "serverName": "vms-01" } }))
        }
        async fn devices(State(s): State<Arc<Dss>>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
            let expire = s
                .expire_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if expire || !s.token_ok(&headers) {
                return Json(json!({ "success": false, "code": 1013 }));
            }
            Json(json!({
                "success": true,
                "data": { "pageNum": body["pageNum"], "pageData": [{ "deviceCode": "1000001", "deviceName": "NVR lobby" }] }
            }))
        }
        async fn organizations() -> Json<Value> {
            Json(json!({ "success": false, "code": "2001" }))
        }
        let app = Router::new()
            .route("/admin/login", post(login))
            .route("/admin/logout", post(logout))
            .route("/admin/serverInfo/getServerInfo", post(server_info))
            .route("/device/list", post(devices))
            .route("/org/list", post(organizations))
            .with_state(state);
        format!("http://{}", serve(app).await)
    }

    fn connector(url: String, password: &str) -> DahuaDssConnector {
        let descriptor = DeviceDescriptor::new("dss", "video platform", Family::DahuaDss)
            .with_api_url(url)
            .with_credentials("system", password);
        DahuaDssConnector::new(descriptor, &http_context()).unwrap()
    }

    #[tokio::test]
    async fn test_status_from_server_info() {
        let state = Arc::new(Dss::default());
        let connector = connector(server(state.clone()).await, "Admin123");

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.firmware.as_deref(), Some("DSS Pro V8.3.0"));
        assert_eq!(status.details["serverName"], "vms-01");

        let devices = connector.list_children().await.unwrap();
        assert_eq!(devices["pageNum"], 1);
        assert_eq!(devices["pageData"][0]["deviceCode"], "1000001");
        assert_eq!(state.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_code_1013_logs_in_again() {
        let state = Arc::new(Dss::default());
        let connector = connector(server(state.clone()).await, "Admin123");
        connector.connect().await.unwrap();
        state.expire_next.store(1, Ordering::SeqCst);

        connector.list_devices(2, 10).await.unwrap();
        assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures() {
        let state = Arc::new(Dss::default());
        let url = server(state.clone()).await;

        let err = connector(url.clone(), "wrong").connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert!(err.to_string().contains("1002"));

        let err = connector(url, "Admin123").list_organizations().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().contains("/org/list (code: 2001)"));
    }

    #[tokio::test]
    async fn test_disconnect_logs_out() {
        let state = Arc::new(Dss::default());
        let connector = connector(server(state.clone()).await, "Admin123");
        connector.connect().await.unwrap();
        connector.disconnect().await.unwrap();
        assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }
}
