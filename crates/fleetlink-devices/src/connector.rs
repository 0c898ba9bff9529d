/*!
 * The connector contract and the uniform result envelopes.
 *
 * Every device family implements [`Connector`]. Optional capabilities have
 * provided implementations that fail with `Unsupported`, and status
 * collection failures are folded into an error envelope by the provided
 * [`Connector::get_status`], so callers never see a status call fail.
 */
use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fleetlink_core::types::{now, Details, Id, Timestamp};
use fleetlink_core::utils::elapsed_millis;

use crate::descriptor::{DeviceDescriptor, Family};
use crate::error::{ConnectorError, Result};

/// Connection state of one connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No live session
    Disconnected,
    /// A live session or a verified credential exists
    Connected,
    /// The last attempt to (re)connect failed
    Error,
    /// Nothing has been tried yet or the state cannot be known
    Unknown,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Error,
            _ => ConnectionState::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Error => 2,
            ConnectionState::Unknown => 3,
        }
    }
}

/// Connection state shared between a family and the transports it owns.
///
/// Cloning yields a handle to the same state.
#[derive(Debug, Clone)]
pub struct StateCell {
    device: Id,
    state: Arc<AtomicU8>,
}

impl StateCell {
    /// A new cell starting out disconnected
    pub fn new(device: Id) -> Self {
        Self {
            device,
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected.as_u8())),
        }
    }

    /// Current state
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Set the state, logging the transition
    pub fn set(&self, new_state: ConnectionState) {
        let old = ConnectionState::from_u8(self.state.swap(new_state.as_u8(), Ordering::SeqCst));
        if old != new_state {
            debug!("Device {} state {:?} -> {:?}", self.device, old, new_state);
        }
    }

    /// The device this cell belongs to
    pub fn device(&self) -> &Id {
        &self.device
    }
}

/// Uniform status report for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEnvelope {
    /// Device id
    pub id: Id,
    /// Device name
    pub name: String,
    /// Family tag
    #[serde(rename = "type")]
    pub family: Family,
    /// Connection state at collection time
    #[serde(rename = "status")]
    pub state: ConnectionState,
    /// Uptime as reported by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    /// Firmware or OS version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// Hardware model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// When the status was collected
    pub last_seen: Timestamp,
    /// Family-specific details
    #[serde(default)]
    pub details: Details,
}

impl StatusEnvelope {
    /// An envelope for `descriptor` in `state`, stamped now
    pub fn new(descriptor: &DeviceDescriptor, state: ConnectionState) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            family: descriptor.family,
            state,
            uptime: None,
            firmware: None,
            model: None,
            serial_number: None,
            last_seen: now(),
            details: Details::new(),
        }
    }

    /// An `error` envelope carrying the failure under `details.error`
    pub fn from_error(descriptor: &DeviceDescriptor, err: &ConnectorError) -> Self {
        Self::from_message(descriptor, err.to_string())
    }

    /// An `error` envelope carrying `message` under `details.error`
    pub fn from_message<S: Into<String>>(descriptor: &DeviceDescriptor, message: S) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = "unknown error".to_string();
        }
        Self::new(descriptor, ConnectionState::Error).with_detail("error", message)
    }

    /// Set the uptime
    pub fn with_uptime<S: Into<String>>(mut self, uptime: Option<S>) -> Self {
        self.uptime = uptime.map(Into::into);
        self
    }

    /// Set the firmware version
    pub fn with_firmware<S: Into<String>>(mut self, firmware: Option<S>) -> Self {
        self.firmware = firmware.map(Into::into);
        self
    }

    /// Set the model
    pub fn with_model<S: Into<String>>(mut self, model: Option<S>) -> Self {
        self.model = model.map(Into::into);
        self
    }

    /// Set the serial number
    pub fn with_serial<S: Into<String>>(mut self, serial: Option<S>) -> Self {
        self.serial_number = serial.map(Into::into);
        self
    }

    /// Add one detail entry
    pub fn with_detail<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// The `details.error` message, if this is an error envelope
    pub fn error_message(&self) -> Option<&str> {
        self.details.get("error").and_then(|v| v.as_str())
    }
}

/// Outcome of one command execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Whether the command ran without error
    pub success: bool,
    /// Device id
    pub device: Id,
    /// The command as given
    pub command: String,
    /// Captured output, trimmed
    pub output: String,
    /// Error text when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Elapsed wall time
    #[serde(default, rename = "executionTime", skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl CommandResult {
    /// Shape a transport outcome into a result, capturing errors
    pub fn capture(device: &Id, command: &str, started: Instant, outcome: Result<String>) -> Self {
        let elapsed = Some(elapsed_millis(started));
        match outcome {
            Ok(output) => Self {
                success: true,
                device: device.clone(),
                command: command.to_string(),
                output: output.trim().to_string(),
                error: None,
                execution_time_ms: elapsed,
            },
            Err(e) => Self {
                success: false,
                device: device.clone(),
                command: command.to_string(),
                output: String::new(),
                error: Some(e.to_string()),
                execution_time_ms: elapsed,
            },
        }
    }
}

/// The contract every device family satisfies
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// The descriptor this connector was built from
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Device id
    fn id(&self) -> &Id {
        &self.descriptor().id
    }

    /// Device family
    fn family(&self) -> Family {
        self.descriptor().family
    }

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Establish the session or credential
    async fn connect(&self) -> Result<()>;

    /// Tear down the session, best effort remotely, always locally
    async fn disconnect(&self) -> Result<()>;

    /// Attempt to connect and report whether it worked
    async fn test_connection(&self) -> bool {
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Connection test for {} failed: {}", self.id(), e);
                false
            }
        }
    }

    /// Gather a fresh status report
    async fn collect_status(&self) -> Result<StatusEnvelope>;

    /// Fresh status report; failures become an `error` envelope
    async fn get_status(&self) -> StatusEnvelope {
        match self.collect_status().await {
            Ok(status) => status,
            Err(e) => {
                debug!("Status collection for {} failed: {}", self.id(), e);
                StatusEnvelope::from_error(self.descriptor(), &e)
            }
        }
    }

    /// Run a command in the device's native CLI dialect
    async fn execute_command(&self, _command: &str) -> Result<CommandResult> {
        Err(ConnectorError::unsupported(self.family().as_str(), "execute_command"))
    }

    /// Fetch configuration text, optionally for one section
    async fn get_config(&self, _section: Option<&str>) -> Result<String> {
        Err(ConnectorError::unsupported(self.family().as_str(), "get_config"))
    }

    /// List child resources (VMs, nodes, platform devices, channels)
    async fn list_children(&self) -> Result<serde_json::Value> {
        Err(ConnectorError::unsupported(self.family().as_str(), "list_children"))
    }
}
