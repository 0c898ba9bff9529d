/*!
 * HTTP session transport.
 *
 * [`HttpTransport`] is the stateless request primitive: base URL, a mutable
 * default header bag, status and content-type handling. [`HttpSession`]
 * layers the authentication lifecycle on top of it: lazy login, credential
 * attachment, expiry detection and a single re-authenticated retry. Families
 * only supply an [`Authenticator`].
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};

use fleetlink_core::config::TransportConfig;

use crate::connector::{ConnectionState, StateCell};
use crate::error::{ConnectorError, ErrorKind, Result};

/// A parsed response body
#[derive(Debug, Clone, PartialEq)]
pub enum ApiBody {
    /// The response declared a JSON content type
    Json(serde_json::Value),
    /// Anything else, as text
    Text(String),
}

impl ApiBody {
    /// The JSON value, if this is a JSON body
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ApiBody::Json(value) => Some(value),
            ApiBody::Text(_) => None,
        }
    }

    /// The text, if this is a text body
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ApiBody::Json(_) => None,
            ApiBody::Text(text) => Some(text),
        }
    }

    /// JSON value; text bodies are parsed, failing with `Protocol`
    pub fn into_json(self) -> Result<serde_json::Value> {
        match self {
            ApiBody::Json(value) => Ok(value),
            ApiBody::Text(text) => serde_json::from_str(&text)
                .map_err(|e| ConnectorError::protocol(format!("Expected JSON response: {}", e))),
        }
    }

    /// Body as text; JSON bodies are re-serialized
    pub fn into_text(self) -> String {
        match self {
            ApiBody::Json(value) => value.to_string(),
            ApiBody::Text(text) => text,
        }
    }
}

/// A successful response with its status line and headers
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers, names lowercased
    pub headers: BTreeMap<String, String>,
    /// Parsed body
    pub body: ApiBody,
}

impl ApiResponse {
    /// A header value, looked up case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Drop the status line and headers
    pub fn into_body(self) -> ApiBody {
        self.body
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RequestBody {
    Json(String),
    Form(String),
}

/// One HTTP request relative to a transport's base URL. A path that is
/// itself an absolute `http(s)://` URL is sent as is.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<RequestBody>,
}

impl ApiRequest {
    /// A request with an arbitrary method
    pub fn new<S: Into<String>>(method: Method, path: S) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// GET request
    pub fn get<S: Into<String>>(path: S) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST request
    pub fn post<S: Into<String>>(path: S) -> Self {
        Self::new(Method::POST, path)
    }

    /// PUT request
    pub fn put<S: Into<String>>(path: S) -> Self {
        Self::new(Method::PUT, path)
    }

    /// DELETE request
    pub fn delete<S: Into<String>>(path: S) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    pub fn json(mut self, body: &serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body.to_string()));
        self
    }

    /// Attach a URL-encoded form body
    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter())
            .finish();
        self.body = Some(RequestBody::Form(encoded));
        self
    }

    /// Add a query parameter
    pub fn query<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a per-call header, overriding the transport defaults
    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a header in place
    pub fn add_header<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.headers.push((key.into(), value.into()));
    }

    /// HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path with the encoded query string appended
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish();
        let separator = if self.path.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.path, separator, encoded)
    }

    /// The serialized body, empty when there is none
    pub fn body_text(&self) -> &str {
        match &self.body {
            Some(RequestBody::Json(text)) | Some(RequestBody::Form(text)) => text,
            None => "",
        }
    }
}

/// Build a `Basic` authorization header value
pub fn basic_auth(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", username, password)))
}

/// Stateless HTTP primitive bound to one base URL
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    headers: RwLock<BTreeMap<String, String>>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create a transport with the configured timeout and certificate policy
    pub fn new<S: Into<String>>(base_url: S, config: &TransportConfig) -> Result<Self> {
        Self::with_options(base_url, config.http_timeout(), config.accept_invalid_certs)
    }

    /// Create a transport with an explicit timeout and certificate policy
    pub fn with_options<S: Into<String>>(
        base_url: S,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        url::Url::parse(&base_url)
            .map_err(|e| ConnectorError::config(format!("Invalid base URL '{}': {}", base_url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| ConnectorError::config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            client,
            headers: RwLock::new(BTreeMap::new()),
        })
    }

    /// The base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Set a default header sent with every request
    pub fn set_header<K: AsRef<str>, V: Into<String>>(&self, key: K, value: V) {
        let mut headers = self.headers.write().unwrap_or_else(|e| e.into_inner());
        headers.insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Remove a default header
    pub fn remove_header<K: AsRef<str>>(&self, key: K) {
        let mut headers = self.headers.write().unwrap_or_else(|e| e.into_inner());
        headers.remove(&key.as_ref().to_ascii_lowercase());
    }

    /// A default header value
    pub fn header<K: AsRef<str>>(&self, key: K) -> Option<String> {
        let headers = self.headers.read().unwrap_or_else(|e| e.into_inner());
        headers.get(&key.as_ref().to_ascii_lowercase()).cloned()
    }

    fn merged_headers(&self, request: &ApiRequest) -> Result<HeaderMap> {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        merged.insert(CONTENT_TYPE.as_str().to_string(), "application/json".to_string());
        if let Some(RequestBody::Form(_)) = request.body {
            merged.insert(
                CONTENT_TYPE.as_str().to_string(),
                "application/x-www-form-urlencoded".to_string(),
            );
        }
        {
            let defaults = self.headers.read().unwrap_or_else(|e| e.into_inner());
            merged.extend(defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged.extend(
            request
                .headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone())),
        );

        let mut map = HeaderMap::with_capacity(merged.len());
        for (key, value) in merged {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ConnectorError::config(format!("Invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| ConnectorError::config(format!("Invalid value for header '{}': {}", key, e)))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    fn url_for(&self, request: &ApiRequest) -> String {
        let target = request.path_and_query();
        if target.starts_with("http://") || target.starts_with("https://") {
            target
        } else {
            format!("{}{}", self.base_url, target)
        }
    }

    /// Send one request and return only the body.
    ///
    /// Non-2xx responses fail with `Api { status, body }`. Successful
    /// responses are parsed as JSON when the content type says so.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiBody> {
        self.request_full(request).await.map(ApiResponse::into_body)
    }

    /// Send one request, keeping the status code and response headers
    pub async fn request_full(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request);
        let headers = self.merged_headers(&request)?;
        debug!("HTTP {} {}", request.method, request.path);

        let mut builder = self.client.request(request.method.clone(), &url).headers(headers);
        if let Some(RequestBody::Json(body)) | Some(RequestBody::Form(body)) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let is_json = headers
            .get(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.contains("json"));
        let text = response.text().await?;

        if !status.is_success() {
            debug!("HTTP {} {} -> {}", request.method, request.path, status);
            return Err(ConnectorError::api(Some(status.as_u16()), text));
        }

        let body = if !is_json {
            ApiBody::Text(text)
        } else if text.trim().is_empty() {
            ApiBody::Json(serde_json::Value::Null)
        } else {
            let value = serde_json::from_str(&text)
                .map_err(|e| ConnectorError::protocol(format!("Malformed JSON from {}: {}", request.path, e)))?;
            ApiBody::Json(value)
        };
        Ok(ApiResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

/// A credential produced by a login handshake
#[derive(Clone, Default)]
pub struct Credential {
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    token: Option<String>,
    expires_at: Option<Instant>,
    generation: u64,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("headers", &self.headers.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("query", &self.query.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("expires_at", &self.expires_at)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Credential {
    /// An empty credential
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a header to every authenticated request
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Attach a query parameter to every authenticated request
    pub fn with_query<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Keep a raw token for request signing or logout
    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The credential stops being usable after `ttl`
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Instant::now() + ttl);
        self
    }

    /// The raw token, if any
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// A query parameter value
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Which login produced this credential
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the known expiry instant has passed
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn apply(&self, mut request: ApiRequest) -> ApiRequest {
        let mut headers = self.headers.clone();
        headers.append(&mut request.headers);
        request.headers = headers;
        request.query.extend(self.query.iter().cloned());
        request
    }
}

/// Family-specific half of the authentication lifecycle
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Perform the login handshake
    async fn login(&self, http: &HttpTransport) -> Result<Credential>;

    /// Whether an outcome signals an expired or invalid credential
    fn is_expired(&self, outcome: &Result<ApiBody>) -> bool {
        matches!(outcome, Err(e) if e.http_status() == Some(401))
    }

    /// Add per-request signatures after the credential was attached
    fn sign(&self, _request: &mut ApiRequest, _credential: Option<&Credential>) -> Result<()> {
        Ok(())
    }

    /// Invalidate the credential server-side
    async fn logout(&self, _http: &HttpTransport, _credential: &Credential) -> Result<()> {
        Ok(())
    }
}

/// Pre-provisioned headers; "login" just hands them out
#[derive(Clone, Default)]
pub struct StaticAuth {
    headers: Vec<(String, String)>,
}

impl fmt::Debug for StaticAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAuth")
            .field("headers", &self.headers.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

impl StaticAuth {
    /// No credential at all
    pub fn none() -> Self {
        Self::default()
    }

    /// `Authorization: Bearer <token>`
    pub fn bearer<S: AsRef<str>>(token: S) -> Self {
        Self::header("Authorization", format!("Bearer {}", token.as_ref()))
    }

    /// `Authorization: Basic ...`
    pub fn basic(username: &str, password: &str) -> Self {
        Self::header("Authorization", basic_auth(username, password))
    }

    /// Any single header
    pub fn header<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            headers: vec![(key.into(), value.into())],
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn login(&self, _http: &HttpTransport) -> Result<Credential> {
        Ok(self
            .headers
            .iter()
            .fold(Credential::new(), |cred, (k, v)| cred.with_header(k.clone(), v.clone())))
    }
}

/// Authenticated HTTP session: one transport, one authenticator, one credential
#[derive(Debug)]
pub struct HttpSession {
    http: HttpTransport,
    auth: Arc<dyn Authenticator>,
    credential: AsyncRwLock<Option<Credential>>,
    login_lock: Mutex<()>,
    generation: AtomicU64,
    state: StateCell,
}

impl HttpSession {
    /// Bind an authenticator to a transport
    pub fn new(http: HttpTransport, auth: Arc<dyn Authenticator>, state: StateCell) -> Self {
        Self {
            http,
            auth,
            credential: AsyncRwLock::new(None),
            login_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            state,
        }
    }

    /// The underlying transport, for unauthenticated calls
    pub fn http(&self) -> &HttpTransport {
        &self.http
    }

    /// Shared connection state
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Number of successful logins so far
    pub fn logins(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Log in now, replacing any current credential
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        self.login_locked().await.map(|_| ())
    }

    /// Make sure a usable credential exists, logging in if needed
    pub async fn ensure_credential(&self) -> Result<()> {
        self.current_credential().await.map(|_| ())
    }

    /// Best-effort remote logout; local state is always cleared
    pub async fn disconnect(&self) -> Result<()> {
        let previous = self.credential.write().await.take();
        if let Some(credential) = previous {
            if let Err(e) = self.auth.logout(&self.http, &credential).await {
                warn!("Logout from {} failed: {}", self.http.base_url(), e);
            }
        }
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    /// Send an authenticated request, re-authenticating and retrying once
    /// when the response signals an expired credential.
    pub async fn call(&self, request: ApiRequest) -> Result<ApiBody> {
        let credential = self.current_credential().await?;
        let outcome = self.send(request.clone(), &credential).await;
        if !self.auth.is_expired(&outcome) {
            return outcome;
        }

        warn!(
            "Credential for {} rejected, re-authenticating",
            self.http.base_url()
        );
        self.discard(credential.generation).await;
        let credential = self.refresh(Some(credential.generation)).await?;

        let outcome = self.send(request, &credential).await;
        if self.auth.is_expired(&outcome) {
            self.discard(credential.generation).await;
            self.state.set(ConnectionState::Error);
            return Err(ConnectorError::auth(format!(
                "Credential for {} rejected again after re-authentication",
                self.http.base_url()
            )));
        }
        outcome
    }

    /// Call and require a JSON body
    pub async fn call_json(&self, request: ApiRequest) -> Result<serde_json::Value> {
        self.call(request).await?.into_json()
    }

    async fn send(&self, request: ApiRequest, credential: &Credential) -> Result<ApiBody> {
        let mut request = credential.apply(request);
        self.auth.sign(&mut request, Some(credential))?;
        self.http.request(request).await
    }

    async fn current_credential(&self) -> Result<Credential> {
        if let Some(credential) = self.credential.read().await.as_ref() {
            if !credential.is_expired() {
                return Ok(credential.clone());
            }
            debug!("Credential for {} reached its expiry", self.http.base_url());
        }
        self.refresh(None).await
    }

    /// Log in unless another caller already replaced the stale credential
    async fn refresh(&self, stale: Option<u64>) -> Result<Credential> {
        let _guard = self.login_lock.lock().await;
        if let Some(current) = self.credential.read().await.as_ref() {
            if Some(current.generation) != stale && !current.is_expired() {
                return Ok(current.clone());
            }
        }
        self.login_locked().await
    }

    async fn discard(&self, generation: u64) {
        let mut slot = self.credential.write().await;
        if slot.as_ref().is_some_and(|c| c.generation == generation) {
            *slot = None;
        }
    }

    /// Caller holds `login_lock`
    async fn login_locked(&self) -> Result<Credential> {
        match self.auth.login(&self.http).await {
            Ok(mut credential) => {
                credential.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    "Authenticated to {} (login #{})",
                    self.http.base_url(),
                    credential.generation
                );
                *self.credential.write().await = Some(credential.clone());
                self.state.set(ConnectionState::Connected);
                Ok(credential)
            }
            Err(e) => {
                *self.credential.write().await = None;
                self.state.set(ConnectionState::Error);
                Err(match e.kind() {
                    ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::AuthFailure | ErrorKind::Configuration => e,
                    _ => ConnectorError::auth(format!("Login to {} failed: {}", self.http.base_url(), e)),
                })
            }
        }
    }
}
