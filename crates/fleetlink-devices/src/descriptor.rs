/*!
 * Device descriptors and the JSON descriptor source.
 *
 * A descriptor is the immutable, load-time description of one device: which
 * family it belongs to, how to reach it and which credentials to present.
 */
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetlink_core::types::Id;

use crate::error::{ConnectorError, Result};

/// Device family: a vendor or product line with a fixed protocol dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Family {
    /// Cisco IOS switches and routers
    Cisco,
    /// HP / Aruba ProCurve switches
    Hp,
    /// Fortinet FortiGate firewalls
    Fortigate,
    /// MikroTik RouterOS
    Mikrotik,
    /// Proxmox VE clusters
    Proxmox,
    /// VMware ESXi / vCenter
    Esxi,
    /// OpenStack clouds (Keystone v3)
    Openstack,
    /// QNAP NAS
    Qnap,
    /// Synology NAS
    Synology,
    /// ThingsBoard IoT platform
    Thingsboard,
    /// Tuya cloud
    Tuya,
    /// Sonoff devices via the eWeLink cloud
    Sonoff,
    /// ESPHome nodes
    Esphome,
    /// ESP-Connect firmware
    Espconnect,
    /// Dahua network video recorders
    DahuaNvr,
    /// Dahua DSS video management servers
    DahuaDss,
    /// Hi-Flying serial-to-network modules
    Hiflying,
}

impl Family {
    /// Every known family
    pub const ALL: [Family; 17] = [
        Family::Cisco,
        Family::Hp,
        Family::Fortigate,
        Family::Mikrotik,
        Family::Proxmox,
        Family::Esxi,
        Family::Openstack,
        Family::Qnap,
        Family::Synology,
        Family::Thingsboard,
        Family::Tuya,
        Family::Sonoff,
        Family::Esphome,
        Family::Espconnect,
        Family::DahuaNvr,
        Family::DahuaDss,
        Family::Hiflying,
    ];

    /// The tag used in descriptor files
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Cisco => "cisco",
            Family::Hp => "hp",
            Family::Fortigate => "fortigate",
            Family::Mikrotik => "mikrotik",
            Family::Proxmox => "proxmox",
            Family::Esxi => "esxi",
            Family::Openstack => "openstack",
            Family::Qnap => "qnap",
            Family::Synology => "synology",
            Family::Thingsboard => "thingsboard",
            Family::Tuya => "tuya",
            Family::Sonoff => "sonoff",
            Family::Esphome => "esphome",
            Family::Espconnect => "espconnect",
            Family::DahuaNvr => "dahua-nvr",
            Family::DahuaDss => "dahua-dss",
            Family::Hiflying => "hiflying",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        let tag = s.trim().to_ascii_lowercase();
        Family::ALL
            .iter()
            .copied()
            .find(|family| family.as_str() == tag)
            .ok_or_else(|| ConnectorError::config(format!("Unknown device type: {}", s)))
    }
}

/// Transport kind a descriptor declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Interactive command shell over SSH
    Ssh,
    /// HTTP(S) API
    Rest,
    /// Serial line or serial-over-TCP bridge
    Serial,
}

/// One configured device
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Unique id
    pub id: Id,
    /// Human readable name
    pub name: String,
    /// Family tag
    #[serde(rename = "type")]
    pub family: Family,
    /// Declared transports, most preferred first
    #[serde(default)]
    pub transport: Vec<TransportKind>,
    /// Host name or address
    #[serde(default)]
    pub host: Option<String>,
    /// Port override
    #[serde(default)]
    pub port: Option<u16>,
    /// Login user
    #[serde(default)]
    pub username: Option<String>,
    /// Login password
    #[serde(default)]
    pub password: Option<String>,
    /// API key or token
    #[serde(default)]
    pub api_key: Option<String>,
    /// API base URL, defaults to `https://<host>`
    #[serde(default)]
    pub api_url: Option<String>,
    /// Serial device path
    #[serde(default)]
    pub serial_port: Option<String>,
    /// Serial baud rate
    #[serde(default)]
    pub serial_baud: Option<u32>,
    /// Privileged-mode password for network OS shells
    #[serde(default)]
    pub enable_password: Option<String>,
    /// Label of the VPN the device sits behind
    #[serde(default)]
    pub vpn: Option<String>,
    /// Tags used for filtering
    #[serde(default)]
    pub tags: Vec<String>,
    /// Family-specific settings
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "***")
}

impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("family", &self.family)
            .field("transport", &self.transport)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("serial_port", &self.serial_port)
            .field("serial_baud", &self.serial_baud)
            .field("enable_password", &redact(&self.enable_password))
            .field("vpn", &self.vpn)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl DeviceDescriptor {
    /// Minimal descriptor, mostly useful in tests and programmatic setups
    pub fn new<I: Into<Id>, S: Into<String>>(id: I, name: S, family: Family) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            family,
            transport: Vec::new(),
            host: None,
            port: None,
            username: None,
            password: None,
            api_key: None,
            api_url: None,
            serial_port: None,
            serial_baud: None,
            enable_password: None,
            vpn: None,
            tags: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Set the host
    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set username and password
    pub fn with_credentials<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the API key
    pub fn with_api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the API base URL
    pub fn with_api_url<S: Into<String>>(mut self, url: S) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Add a tag
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set one `extra` entry
    pub fn with_extra<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// True if the descriptor carries the tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Case-insensitive substring match over id, name, family and tags
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.id.as_str().to_lowercase().contains(&needle)
            || self.name.to_lowercase().contains(&needle)
            || self.family.as_str().contains(&needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    }

    /// The host, or a configuration error naming the device
    pub fn require_host(&self) -> Result<&str> {
        self.host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| self.missing("host"))
    }

    /// The username, or a configuration error naming the device
    pub fn require_username(&self) -> Result<&str> {
        self.username
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| self.missing("username"))
    }

    /// The password, empty when absent
    pub fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    /// The API key, or a configuration error naming the device
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| self.missing("apiKey"))
    }

    /// The configured API base URL, else `https://<host>`
    pub fn base_url(&self) -> Result<String> {
        match self.api_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Ok(url.trim_end_matches('/').to_string()),
            None => Ok(format!("https://{}", self.require_host()?)),
        }
    }

    /// A string entry from `extra`
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// A numeric entry from `extra`, accepting numeric strings
    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        match self.extra.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// A boolean entry from `extra`, accepting `"true"`/`"false"`
    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        match self.extra.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn missing(&self, field: &str) -> ConnectorError {
        ConnectorError::config(format!(
            "Device '{}' ({}) requires '{}'",
            self.id, self.family, field
        ))
    }
}

#[derive(Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    devices: Vec<serde_json::Value>,
}

/// Replace every `${VAR}` in every string of a JSON document with the
/// variable's value, or the empty string when unset.
pub fn interpolate_env(value: serde_json::Value) -> serde_json::Value {
    let pattern = match Regex::new(r"\$\{(\w+)\}") {
        Ok(pattern) => pattern,
        Err(_) => return value,
    };
    interpolate_with(&pattern, value)
}

fn interpolate_with(pattern: &Regex, value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(s) => Value::String(
            pattern
                .replace_all(&s, |caps: &Captures| std::env::var(&caps[1]).unwrap_or_default())
                .into_owned(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| interpolate_with(pattern, v)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, interpolate_with(pattern, v)))
                .collect(),
        ),
        other => other,
    }
}

/// Parse descriptors from the text of a descriptor file
pub fn parse_descriptors(text: &str) -> Result<Vec<DeviceDescriptor>> {
    let file: DescriptorFile = serde_json::from_str(text)
        .map_err(|e| ConnectorError::config(format!("Invalid descriptor file: {}", e)))?;

    file.devices
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let resolved = interpolate_env(raw);
            serde_json::from_value::<DeviceDescriptor>(resolved)
                .map_err(|e| ConnectorError::config(format!("Invalid device entry #{}: {}", index, e)))
        })
        .collect()
}

/// Load descriptors from a JSON file; a missing file yields an empty fleet
pub fn load_descriptors<P: AsRef<Path>>(path: P) -> Result<Vec<DeviceDescriptor>> {
    let path = path.as_ref();
    if !path.exists() {
        warn!("Devices file not found: {}", path.display());
        return Ok(Vec::new());
    }

    debug!("Loading device descriptors from {}", path.display());
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConnectorError::config(format!("Cannot read {}: {}", path.display(), e)))?;
    let descriptors = parse_descriptors(&text)?;
    info!("Loaded {} device descriptor(s) from {}", descriptors.len(), path.display());
    Ok(descriptors)
}
