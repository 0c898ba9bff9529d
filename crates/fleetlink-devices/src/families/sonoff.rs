/*!
 * Sonoff devices through the eWeLink cloud (API v2).
 *
 * The login body is signed with HMAC-SHA256 under the app secret and sent
 * as `Authorization: Sign <base64>`. Later calls carry the access token as
 * a bearer token. Replies are wrapped in `{error, msg, data}`.
 */
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, FamilyContext};
use crate::transport::{ApiBody, ApiRequest, Authenticator, Credential, HttpSession, HttpTransport};

const DEFAULT_ENDPOINT: &str = "https://as-apia.coolkit.cc";

const DEFAULT_COUNTRY_CODE: &str = "+66";

/// eWeLink codes for an invalid and an expired access token
const TOKEN_ERRORS: [i64; 2] = [401, 402];

fn error_code(body: &Value) -> i64 {
    body.get("error").and_then(Value::as_i64).unwrap_or(0)
}

fn failure(body: &Value) -> Option<String> {
    match error_code(body) {
        0 => None,
        code => Some(match body.get("msg").and_then(Value::as_str).filter(|m| !m.is_empty()) {
            Some(msg) => format!("{} (error {})", msg, code),
            None => format!("error {}", code),
        }),
    }
}

struct EwelinkAuth {
    app_id: String,
    app_secret: String,
    email: String,
    password: String,
    country_code: String,
}

impl std::fmt::Debug for EwelinkAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EwelinkAuth")
            .field("app_id", &self.app_id)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl EwelinkAuth {
    /// Base64 HMAC-SHA256 of `body` under the app secret
    fn sign(&self, body: &str) -> String {
        BASE64.encode(hmac_sha256::HMAC::mac(body.as_bytes(), self.app_secret.as_bytes()))
    }
}

#[async_trait]
impl Authenticator for EwelinkAuth {
    async fn login(&self, http: &HttpTransport) -> Result<Credential> {
        let request = ApiRequest::post("/v2/user/login").json(&json!({
            "email": self.email,
            "password": self.password,
            "countryCode": self.country_code,
        }));
        let signature = self.sign(request.body_text());
        let body = http
            .request(
                request
                    .header("X-CK-Appid", self.app_id.as_str())
                    .header("Authorization", format!("Sign {}", signature)),
            )
            .await?
            .into_json()?;
        if let Some(message) = failure(&body) {
            return Err(ConnectorError::auth(format!("eWeLink auth error: {}", message)));
        }
        let token = body
            .pointer("/data/at")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConnectorError::protocol("eWeLink login reply has no access token"))?;
        Ok(Credential::new()
            .with_header("Authorization", format!("Bearer {}", token))
            .with_header("X-CK-Appid", self.app_id.as_str())
            .with_token(token))
    }

    fn is_expired(&self, outcome: &Result<ApiBody>) -> bool {
        match outcome {
            Err(e) => e.http_status() == Some(401),
            Ok(ApiBody::Json(body)) => TOKEN_ERRORS.contains(&error_code(body)),
            Ok(ApiBody::Text(_)) => false,
        }
    }
}

/// An eWeLink account and the Sonoff devices bound to it
#[derive(Debug)]
pub struct SonoffConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
}

impl SonoffConnector {
    /// Build a connector; needs `username` (the account e-mail),
    /// `extra.appId` and `extra.appSecret`. `extra.countryCode` defaults to
    /// `+66`. The endpoint is `apiUrl`, else `https://<host>`, else the Asia
    /// region.
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let required = |key: &str| {
            descriptor
                .extra_str(key)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ConnectorError::config(format!("Device '{}' (sonoff) requires 'extra.{}'", descriptor.id, key)))
        };
        let auth = EwelinkAuth {
            app_id: required("appId")?,
            app_secret: required("appSecret")?,
            email: descriptor.require_username()?.to_string(),
            password: descriptor.password_or_empty().to_string(),
            country_code: descriptor.extra_str("countryCode").unwrap_or(DEFAULT_COUNTRY_CODE).to_string(),
        };
        let http = if descriptor.api_url.is_none() && descriptor.host.is_none() {
            HttpTransport::new(DEFAULT_ENDPOINT, &ctx.transport)?
        } else {
            http_transport(&descriptor, &ctx.transport, false)?
        };
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        Ok(Self { descriptor, api })
    }

    /// Call and unwrap `data`, turning a non-zero `error` into an API error
    async fn call(&self, request: ApiRequest) -> Result<Value> {
        let mut body = self.api.call_json(request).await?;
        if let Some(message) = failure(&body) {
            return Err(ConnectorError::api(None, format!("eWeLink API error: {}", message)));
        }
        Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    /// Devices bound to the account
    pub async fn list_devices(&self) -> Result<Value> {
        self.call(ApiRequest::get("/v2/device/thing")).await
    }

    /// Current parameters of one device, power readings included
    pub async fn device_status(&self, device_id: &str) -> Result<Value> {
        self.call(
            ApiRequest::get("/v2/device/thing/status")
                .query("type", "1")
                .query("id", device_id),
        )
        .await
    }

    /// Switch a device on or off
    pub async fn set_switch(&self, device_id: &str, on: bool) -> Result<Value> {
        let body = json!({
            "type": 1,
            "id": device_id,
            "params": { "switch": if on { "on" } else { "off" } },
        });
        self.call(ApiRequest::post("/v2/device/thing/status").json(&body)).await
    }
}

#[async_trait]
impl Connector for SonoffConnector {
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
        self.list_devices().await
    }
}
