/*!
 * Tuya IoT cloud.
 *
 * Every request is signed with HMAC-SHA256 over the client id, the access
 * token (once there is one), a millisecond timestamp and a canonical
 * request string. Results come wrapped in `{success, result, msg, code}`.
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, FamilyContext};
use crate::transport::{ApiBody, ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

const DEFAULT_ENDPOINT: &str = "https://openapi.tuyaus.com";

/// Platform code for an invalid or expired access token
const TOKEN_INVALID: i64 = 1010;

/// Tokens are renewed this long before the advertised expiry
const EXPIRY_MARGIN_SECS: u64 = 60;

/// Lifetime to trust for a token advertised as valid for `ttl` seconds
fn token_lifetime(ttl: u64) -> Duration {
    Duration::from_secs(ttl.checked_sub(EXPIRY_MARGIN_SECS).filter(|t| *t > 0).unwrap_or(ttl))
}

fn failure(body: &Value) -> Option<String> {
    if body.get("success").and_then(Value::as_bool) != Some(false) {
        return None;
    }
    let msg = body.get("msg").and_then(Value::as_str).unwrap_or("Unknown error");
    Some(match body.get("code").and_then(Value::as_i64) {
        Some(code) => format!("{} (code {})", msg, code),
        None => msg.to_string(),
    })
}

struct TuyaAuth {
    client_id: String,
    secret: String,
}

impl std::fmt::Debug for TuyaAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TuyaAuth").field("client_id", &self.client_id).finish_non_exhaustive()
    }
}

impl TuyaAuth {
    /// Uppercase hex HMAC-SHA256 over the request
    fn signature(&self, request: &ApiRequest, token: &str, timestamp: &str) -> String {
        let content_hash = hex::encode(hmac_sha256::Hash::hash(request.body_text().as_bytes()));
        let canonical = [
            request.method().as_str(),
            content_hash.as_str(),
            "",
            request.path_and_query().as_str(),
        ]
        .join("\n");
        let payload = format!("{}{}{}{}", self.client_id, token, timestamp, canonical);
        hex::encode_upper(hmac_sha256::HMAC::mac(payload.as_bytes(), self.secret.as_bytes()))
    }

    fn sign_with(&self, request: &mut ApiRequest, token: Option<&str>) {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let sign = self.signature(request, token.unwrap_or(""), &timestamp);
        request.add_header("client_id", self.client_id.as_str());
        request.add_header("sign", sign);
        request.add_header("sign_method", "HMAC-SHA256");
        request.add_header("t", timestamp);
        if let Some(token) = token {
            request.add_header("access_token", token);
        }
    }
}

#[async_trait]
impl Authenticator for TuyaAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let mut request = ApiRequest::get("/v1.0/token?grant_type=1");
        self.sign_with(&mut request, None);
        let body = http.request(request).await?.into_json()?;
        if let Some(message) = failure(&body) {
            return Err(ConnectorError::auth(format!("Tuya token request failed: {}", message)));
        }
        let token = body
            .pointer("/result/access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::protocol("Tuya token response has no access_token"))?;
        let credential = Credential::new().with_token(token);
        // without an advertised lifetime the token lives until code 1010
        Ok(match body.pointer("/result/expire_time").and_then(Value::as_u64).filter(|t| *t > 0) {
            Some(ttl) => credential.expires_in(token_lifetime(ttl)),
            None => credential,
        })
    }

    fn is_expired(&self, outcome: &Result<ApiBody>) -> bool {
        match outcome {
            Err(e) => e.http_status() == Some(401),
            Ok(ApiBody::Json(body)) => {
                body.get("success").and_then(Value::as_bool) == Some(false)
                    && body.get("code").and_then(Value::as_i64) == Some(TOKEN_INVALID)
            }
            Ok(ApiBody::Text(_)) => false,
        }
    }

    fn sign(&self, request: &mut ApiRequest, credential: Option<&Credential>) -> Result<()> {
        self.sign_with(request, credential.and_then(Credential::token));
        Ok(())
    }
}

/// A Tuya cloud project
#[derive(Debug)]
pub struct TuyaConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
}

impl TuyaConnector {
    /// Build a connector; needs `extra.clientId` and `extra.clientSecret`.
    /// The endpoint is `apiUrl`, else `https://<host>`, else the US data center.
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let required = |key: &str| {
            descriptor
                .extra_str(key)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ConnectorError::config(format!("Device '{}' (tuya) requires 'extra.{}'", descriptor.id, key)))
        };
        let auth = TuyaAuth {
            client_id: required("clientId")?,
            secret: required("clientSecret")?,
        };
        let http = if descriptor.api_url.is_none() && descriptor.host.is_none() {
            HttpTransport::new(DEFAULT_ENDPOINT, &ctx.transport)?
        } else {
            http_transport(&descriptor, &ctx.transport, false)?
        };
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self { descriptor, api })
    }

    /// Call and unwrap `result`, turning `success: false` into an API error
    async fn call(&self, request: ApiRequest) -> Result<Value> {
        let mut body = self.api.call_json(request).await?;
        if let Some(message) = failure(&body) {
            return Err(ConnectorError::api(None, format!("Tuya API error: {}", message)));
        }
        Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Connector for TuyaConnector {
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
        Ok(StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_detail("endpoint", self.api.http().base_url()))
    }

    async fn list_children(&self) -> Result<Value> {
        self.call(ApiRequest::get("/v1.0/iot-01/associated-users/devices")).await
    }
}
