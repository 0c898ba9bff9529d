/*!
 * QNAP QTS NAS appliances.
 *
 * The CGI API answers in XML wrapped in CDATA sections. A session id from
 * `authLogin.cgi` is appended to every call as `sid`; an expired sid is
 * signalled in a 200 body by `authPassed` being `0`.
 */
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, pretty, FamilyContext};
use crate::transport::{ApiBody, ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

const SYSINFO_PATH: &str = "/cgi-bin/management/manaRequest.cgi?subfunc=sysinfo&sysinfo=1";

/// Text of `<tag>` with any CDATA wrapper removed
pub(crate) fn xml_field(text: &str, tag: &str) -> Option<String> {
    let tag = regex::escape(tag);
    let pattern = format!(r"(?s)<{0}>\s*(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?\s*</{0}>", tag);
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn session_expired(body: &str) -> bool {
    xml_field(body, "authPassed").as_deref() == Some("0")
}

struct QnapAuth {
    username: String,
    password: String,
}

impl std::fmt::Debug for QnapAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QnapAuth").field("username", &self.username).finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for QnapAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let body = http
            .request(
                ApiRequest::get("/cgi-bin/authLogin.cgi")
                    .query("user", self.username.as_str())
                    .query("pwd", self.password.as_str()),
            )
            .await?
            .into_text();
        let sid = xml_field(&body, "authSid")
            .ok_or_else(|| ConnectorError::auth("QNAP login returned no session id"))?;
        Ok(Credential::new().with_query("sid", sid.clone()).with_token(sid))
    }

    fn is_expired(&self, outcome: &Result<ApiBody>) -> bool {
        match outcome {
            Err(e) => e.http_status() == Some(401),
            Ok(ApiBody::Text(text)) => session_expired(text),
            Ok(ApiBody::Json(_)) => false,
        }
    }

    async fn logout(&self, http: &HttpTransport, credential: &Credential) -> Result<()> {
        if let Some(sid) = credential.token() {
            http.request(ApiRequest::get("/cgi-bin/authLogout.cgi").query("sid", sid))
                .await?;
        }
        Ok(())
    }
}

/// A QNAP NAS
#[derive(Debug)]
pub struct QnapConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
}

impl QnapConnector {
    /// Build a connector; needs `host` or `apiUrl` and `username`
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let auth = QnapAuth {
            username: descriptor.require_username()?.to_string(),
            password: descriptor.password_or_empty().to_string(),
        };
        let http = http_transport(&descriptor, &ctx.transport, false)?;
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self { descriptor, api })
    }

    /// System information from the CGI endpoint, enriched by the v2 JSON API
    /// when the firmware has it
    async fn system_info(&self) -> Result<Map<String, Value>> {
        let xml = self.api.call(ApiRequest::get(SYSINFO_PATH)).await?.into_text();
        let mut info = Map::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                info.insert(key.to_string(), Value::String(value));
            }
        };
        put("model", xml_field(&xml, "modelName"));
        put("hostname", xml_field(&xml, "hostname").or_else(|| xml_field(&xml, "server_name")));
        put(
            "firmware",
            xml_field(&xml, "version").map(|v| match xml_field(&xml, "build") {
                Some(build) => format!("{} build {}", v, build),
                None => v,
            }),
        );
        put("serialNumber", xml_field(&xml, "serial_number"));
        put("cpuUsage", xml_field(&xml, "cpu_usage"));
        put("totalMemory", xml_field(&xml, "total_memory"));
        put("freeMemory", xml_field(&xml, "free_memory"));
        let uptime = match (
            xml_field(&xml, "uptime_day"),
            xml_field(&xml, "uptime_hour"),
            xml_field(&xml, "uptime_min"),
        ) {
            (Some(d), Some(h), Some(m)) => Some(format!("{}d {}h {}m", d, h, m)),
            _ => None,
        };
        put("uptime", uptime);

        match self.api.call(ApiRequest::get("/api/v2/system/info")).await {
            Ok(ApiBody::Json(Value::Object(extra))) => info.extend(extra),
            Ok(_) => {}
            Err(e) => debug!("{} has no v2 system info: {}", self.descriptor.id, e),
        }
        Ok(info)
    }
}

#[async_trait]
impl Connector for QnapConnector {
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
        let info = self.system_info().await?;
        let field = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);
        let mut status = StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_model(field("model"))
            .with_firmware(field("firmware"))
            .with_uptime(field("uptime"))
            .with_serial(field("serialNumber"));
        status.details.extend(info);
        Ok(status)
    }

    async fn get_config(&self, _section: Option<&str>) -> Result<String> {
        pretty(&Value::Object(self.system_info().await?))
    }

    async fn list_children(&self) -> Result<Value> {
        match self.api.call(ApiRequest::get("/api/v2/storage/volumes")).await {
            Ok(ApiBody::Json(volumes)) => Ok(volumes),
            _ => {
                let raw = self
                    .api
                    .call(ApiRequest::get("/cgi-bin/management/manaRequest.cgi?subfunc=smart_info&volume=1"))
                    .await?
                    .into_text();
                Ok(serde_json::json!({ "raw": raw }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Family;
    use crate::families::testing::http_context;
    use crate::transport::http::testing::serve;
    use axum::extract::{Query, State};
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Nas {
        logins: AtomicUsize,
        logouts: AtomicUsize,
        /// Sysinfo calls that answer with authPassed=0 before succeeding
        stale_answers: AtomicUsize,
    }

    fn xml(body: String) -> impl IntoResponse {
        ([(header::CONTENT_TYPE, "text/xml")], body)
    }

    async fn server(state: Arc<Nas>) -> String {
        async fn login(State(s): State<Arc<Nas>>, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
            if q.get("pwd").map(String::as_str) != Some("p@ss word") {
                return xml("<QDocRoot><authPassed><![CDATA[0]]></authPassed></QDocRoot>".into()).into_response();
            }
            let n = s.logins.fetch_add(1, Ordering::SeqCst) + 1;
            xml(format!(
                "<QDocRoot><authPassed><![CDATA[1]]></authPassed><authSid><![CDATA[sid{}]]></authSid></QDocRoot>",
                n
            ))
            .into_response()
        }
        async fn logout(State(s): State<Arc<Nas>>) -> impl IntoResponse {
            s.logouts.fetch_add(1, Ordering::SeqCst);
            xml("<QDocRoot/>".into())
        }
        async fn sysinfo(State(s): State<Arc<Nas>>, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
            if q.get("sid").is_none() {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            let stale = s.stale_answers.load(Ordering::SeqCst);
            if stale > 0 {
                s.stale_answers.fetch_sub(1, Ordering::SeqCst);
                return xml("<QDocRoot><authPassed><![CDATA[0]]></authPassed></QDocRoot>".into()).into_response();
            }
            xml("<QDocRoot><authPassed><![CDATA[1]]></authPassed><func><ownContent>\
                 <modelName><![CDATA[TS-453D]]></modelName><version><![CDATA[5.1.4]]></version>\
                 <build><![CDATA[20231128]]></build><uptime_day><![CDATA[4]]></uptime_day>\
                 <uptime_hour><![CDATA[2]]></uptime_hour><uptime_min><![CDATA[17]]></uptime_min>\
                 <serial_number><![CDATA[Q201ABCDE]]></serial_number></ownContent></func></QDocRoot>"
                .into())
            .into_response()
        }
        let app = Router::new()
            .route("/cgi-bin/authLogin.cgi", get(login))
            .route("/cgi-bin/authLogout.cgi", get(logout))
            .route("/cgi-bin/management/manaRequest.cgi", get(sysinfo))
            .with_state(state);
        format!("http://{}", serve(app).await)
    }

    fn connector(url: String, password: &str) -> QnapConnector {
        let descriptor = DeviceDescriptor::new("nas1", "backup nas", Family::Qnap)
            .with_api_url(url)
            .with_credentials("admin", password);
        QnapConnector::new(descriptor, &http_context()).unwrap()
    }

    #[tokio::test]
    async fn test_status_from_sysinfo_xml() {
        let state = Arc::new(Nas::default());
        let connector = connector(server(state.clone()).await, "p@ss word");

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.model.as_deref(), Some("TS-453D"));
        assert_eq!(status.firmware.as_deref(), Some("5.1.4 build 20231128"));
        assert_eq!(status.uptime.as_deref(), Some("4d 2h 17m"));
        assert_eq!(status.serial_number.as_deref(), Some("Q201ABCDE"));

        connector.disconnect().await.unwrap();
        assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embedded_expiry_relogs_once() {
        let state = Arc::new(Nas::default());
        let connector = connector(server(state.clone()).await, "p@ss word");
        connector.connect().await.unwrap();
        state.stale_answers.store(1, Ordering::SeqCst);

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_expiry_is_auth_failure() {
        let state = Arc::new(Nas::default());
        let connector = connector(server(state.clone()).await, "p@ss word");
        state.stale_answers.store(2, Ordering::SeqCst);

        let err = connector.get_config(None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AuthFailure);
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let connector = connector(server(Arc::new(Nas::default())).await, "wrong");
        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AuthFailure);
        assert_eq!(connector.state(), ConnectionState::Error);
    }

    #[test]
    fn test_xml_field() {
        let body = "<a><authSid><![CDATA[xyz]]></authSid><plain> 7 </plain><empty></empty></a>";
        assert_eq!(xml_field(body, "authSid").as_deref(), Some("xyz"));
        assert_eq!(xml_field(body, "plain").as_deref(), Some("7"));
        assert_eq!(xml_field(body, "empty"), None);
        assert!(session_expired("<authPassed><![CDATA[0]]></authPassed>"));
    }
}
