/*!
 * Embedded HTTP devices: ESPHome and ESPConnect dashboards, Dahua NVRs.
 *
 * None of these keep a session. The credential is a static header and
 * `connect` is a probe request.
 */
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use crate::connector::{ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::{DeviceDescriptor, Family};
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, pretty, FamilyContext};
use crate::transport::{ApiRequest, HttpSession, StaticAuth};

/// An ESPHome or ESPConnect dashboard
#[derive(Debug)]
pub struct EspConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
    state: StateCell,
    probe_path: &'static str,
}

impl EspConnector {
    /// Build a connector; `apiKey` is sent as a bearer token when present
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let probe_path = match descriptor.family {
            Family::Espconnect => "/api/devices",
            _ => "/devices",
        };
        let auth = match descriptor.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => StaticAuth::bearer(key),
            None => StaticAuth::none(),
        };
        let http = http_transport(&descriptor, &ctx.transport, false)?;
        let state = StateCell::new(descriptor.id.clone());
        let api = HttpSession::new(http, Arc::new(auth), state.clone());
        Ok(Self {
            descriptor,
            api,
            state,
            probe_path,
        })
    }

    async fn probe(&self) -> Result<Value> {
        match self.api.call_json(ApiRequest::get(self.probe_path)).await {
            Ok(devices) => {
                self.state.set(ConnectionState::Connected);
                Ok(devices)
            }
            Err(e) => {
                self.state.set(ConnectionState::Error);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Connector for EspConnector {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> Result<()> {
        self.api.connect().await?;
        self.probe().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.api.disconnect().await
    }

    async fn collect_status(&self) -> Result<StatusEnvelope> {
        let devices = self.probe().await?;
        let mut status = StatusEnvelope::new(&self.descriptor, ConnectionState::Connected);
        if let Value::Array(list) = &devices {
            status = status.with_detail("deviceCount", list.len());
        }
        Ok(status)
    }

    async fn list_children(&self) -> Result<Value> {
        self.probe().await
    }
}

/// Parse Dahua CGI `key=value` lines. Lines without `=` or with an empty
/// key are skipped; only the first `=` splits.
pub fn parse_key_values(text: &str) -> Map<String, Value> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), Value::String(value.trim().to_string())))
        })
        .collect()
}

const SYSTEM_INFO: &str = "/cgi-bin/magicBox.cgi?action=getSystemInfo";

/// A Dahua NVR, DVR or IP camera speaking the CGI API
#[derive(Debug)]
pub struct DahuaNvrConnector {
    descriptor: DeviceDescriptor,
    api: HttpSession,
    channel_title: Regex,
}

impl DahuaNvrConnector {
    /// Build a connector; credentials go out as HTTP basic auth
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let auth = StaticAuth::basic(descriptor.username.as_deref().unwrap_or(""), descriptor.password_or_empty());
        let http = http_transport(&descriptor, &ctx.transport, false)?;
        let api = HttpSession::new(http, Arc::new(auth), StateCell::new(descriptor.id.clone()));
        let channel_title = Regex::new(r"^table\.ChannelTitle\[(\d+)\]\.Name$")
            .map_err(|e| ConnectorError::config(format!("Invalid channel pattern: {}", e)))?;
        Ok(Self {
            descriptor,
            api,
            channel_title,
        })
    }

    async fn cgi(&self, path: &str) -> Result<Map<String, Value>> {
        let text = self.api.call(ApiRequest::get(path)).await?.into_text();
        Ok(parse_key_values(&text))
    }

    async fn system_info(&self) -> Result<Map<String, Value>> {
        self.cgi(SYSTEM_INFO).await
    }

    async fn channel_titles(&self) -> Result<Value> {
        let parsed = self
            .cgi("/cgi-bin/configManager.cgi?action=getConfig&name=ChannelTitle")
            .await?;
        let channels: Vec<Value> = parsed
            .iter()
            .filter_map(|(key, name)| {
                let caps = self.channel_title.captures(key)?;
                Some(serde_json::json!({ "channel": &caps[1], "name": name }))
            })
            .collect();
        if channels.is_empty() {
            Ok(Value::Object(parsed))
        } else {
            Ok(Value::Array(channels))
        }
    }
}

#[async_trait]
impl Connector for DahuaNvrConnector {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> ConnectionState {
        self.api.state()
    }

    async fn connect(&self) -> Result<()> {
        self.api.connect().await?;
        self.system_info().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.api.disconnect().await
    }

    async fn collect_status(&self) -> Result<StatusEnvelope> {
        let info = self.system_info().await?;
        let field = |key: &str| info.get(key).and_then(Value::as_str).filter(|v| !v.is_empty()).map(str::to_string);
        let mut status = StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_model(field("deviceType"))
            .with_firmware(field("softwareVersion"))
            .with_serial(field("serialNumber"));
        status.details.extend(info);
        Ok(status)
    }

    async fn get_config(&self, section: Option<&str>) -> Result<String> {
        let values = match section.filter(|s| !s.is_empty()) {
            Some(name) => {
                let request = ApiRequest::get("/cgi-bin/configManager.cgi")
                    .query("action", "getConfig")
                    .query("name", name);
                parse_key_values(&self.api.call(request).await?.into_text())
            }
            None => self.system_info().await?,
        };
        pretty(&Value::Object(values))
    }

    async fn list_children(&self) -> Result<Value> {
        match self.channel_titles().await {
            Ok(channels) => Ok(channels),
            Err(_) => {
                let collect = self.cgi("/cgi-bin/devVideoInput.cgi?action=getCollect").await?;
                Ok(Value::Object(collect))
            }
        }
    }
}
