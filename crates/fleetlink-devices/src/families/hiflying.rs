/*!
 * Hi-Flying serial-to-network modules.
 *
 * Management goes through the AT-command port; the transparent serial
 * bridge carries raw bytes to whatever hangs off the UART. Modules with
 * the AT port disabled usually still serve their web page, which is used
 * as a reachability probe.
 */
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use fleetlink_core::types::Details;

use crate::connector::{CommandResult, ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, Result};
use crate::families::{http_transport, pretty, FamilyContext};
use crate::transport::{ApiRequest, FramedTransport, HttpTransport};

const NOT_AVAILABLE: &str = "N/A";

fn port_from(descriptor: &DeviceDescriptor, key: &str) -> Result<Option<u16>> {
    match descriptor.extra_u64(key) {
        None => Ok(None),
        Some(raw) => u16::try_from(raw)
            .map(Some)
            .map_err(|_| ConnectorError::config(format!("Device '{}': extra.{} {} is not a port", descriptor.id, key, raw))),
    }
}

/// A Hi-Flying module (HF2211, Elfin and friends)
#[derive(Debug)]
pub struct HiflyingConnector {
    descriptor: DeviceDescriptor,
    framed: FramedTransport,
    web: HttpTransport,
    state: StateCell,
}

impl HiflyingConnector {
    /// Build a connector from `host` (or the host of `apiUrl`).
    /// `extra.atPort` and `extra.serialPort` override the module defaults.
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let host = match descriptor.host.as_deref().filter(|h| !h.is_empty()) {
            Some(host) => host.to_string(),
            None => descriptor
                .api_url
                .as_deref()
                .and_then(|u| url::Url::parse(u).ok())
                .and_then(|u| u.host_str().map(str::to_string))
                .map_or_else(|| descriptor.require_host().map(str::to_string), Ok)?,
        };

        let mut framed = FramedTransport::new(host.as_str(), &ctx.transport)?;
        if let Some(port) = port_from(&descriptor, "atPort")? {
            framed = framed.with_at_port(port);
        }
        if let Some(port) = port_from(&descriptor, "serialPort")? {
            framed = framed.with_serial_port(port);
        }

        let web = if descriptor.api_url.is_some() {
            http_transport(&descriptor, &ctx.transport, false)?
        } else {
            HttpTransport::new(format!("http://{}", host), &ctx.transport)?
        };

        let state = StateCell::new(descriptor.id.clone());
        Ok(Self {
            descriptor,
            framed,
            web,
            state,
        })
    }

    async fn at(&self, command: &str) -> Result<String> {
        self.framed.send_at(command, None).await
    }

    async fn at_or_na(&self, command: &str) -> String {
        self.at(command).await.unwrap_or_else(|_| NOT_AVAILABLE.to_string())
    }

    /// Firmware is required; the MAC degrades to `N/A`, the module id is optional
    async fn device_info(&self) -> Result<Details> {
        let (firmware, mac, module_id) = tokio::join!(self.at("AT+VER"), self.at_or_na("AT+MAC"), self.at("AT+MID"));
        let mut info = Details::new();
        info.insert("firmware".into(), firmware?.into());
        info.insert("mac".into(), mac.into());
        if let Ok(module_id) = module_id {
            info.insert("moduleId".into(), module_id.into());
        }
        Ok(info)
    }

    async fn web_reachable(&self) -> bool {
        match self.web.request(ApiRequest::get("/")).await {
            Ok(_) => true,
            Err(e) => e.http_status().is_some_and(|status| status < 500),
        }
    }
}

#[async_trait]
impl Connector for HiflyingConnector {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> Result<()> {
        match self.at("AT").await {
            Ok(reply) if reply.is_empty() || reply.to_lowercase().contains("ok") => {
                self.state.set(ConnectionState::Connected);
                return Ok(());
            }
            Ok(reply) => debug!("Unexpected AT probe reply from {}: {}", self.id(), reply),
            Err(e) => debug!("AT probe of {} failed: {}", self.id(), e),
        }

        if self.web_reachable().await {
            self.state.set(ConnectionState::Connected);
            return Ok(());
        }

        self.state.set(ConnectionState::Error);
        Err(ConnectorError::transport(format!(
            "Cannot connect to Hi-Flying device at {} (AT port {} / HTTP)",
            self.framed.host(),
            self.framed.at_port()
        )))
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    async fn collect_status(&self) -> Result<StatusEnvelope> {
        let mut info = match self.device_info().await {
            Ok(info) => info,
            Err(e) => {
                self.state.set(ConnectionState::Error);
                return Err(e);
            }
        };
        self.state.set(ConnectionState::Connected);
        let firmware = info.remove("firmware").and_then(|v| v.as_str().map(str::to_string));
        let mut status = StatusEnvelope::new(&self.descriptor, ConnectionState::Connected)
            .with_firmware(firmware)
            .with_detail("atPort", self.framed.at_port())
            .with_detail("serialPort", self.framed.serial_port());
        status.details.extend(info);
        Ok(status)
    }

    /// `AT...` commands go to the AT port; anything else is written to the
    /// serial bridge, hex-decoded when it looks like hex pairs.
    async fn execute_command(&self, command: &str) -> Result<CommandResult> {
        let started = Instant::now();
        let outcome = if command.trim_start().to_ascii_uppercase().starts_with("AT") {
            self.at(command.trim()).await
        } else {
            self.framed.send_raw(command, None).await
        };
        Ok(CommandResult::capture(self.id(), command, started, outcome))
    }

    async fn get_config(&self, _section: Option<&str>) -> Result<String> {
        let (device, serial, wan, tcp_port, dns) = tokio::join!(
            self.device_info(),
            self.at_or_na("AT+UART"),
            self.at_or_na("AT+WANN"),
            self.at_or_na("AT+NETP"),
            self.at("AT+DNS"),
        );
        let mut network = json!({ "wan": wan, "tcpPort": tcp_port });
        if let (Ok(dns), Value::Object(map)) = (dns, &mut network) {
            map.insert("dns".into(), dns.into());
        }
        pretty(&json!({ "device": device?, "serial": serial, "network": network }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Family;
    use crate::error::ErrorKind;
    use crate::families::testing::http_context;
    use crate::transport::framed::testing::{at_responder, peer};
    use crate::transport::http::testing::serve;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;

    fn connector(at_port: u16) -> HiflyingConnector {
        let descriptor = DeviceDescriptor::new("hf", "boiler bridge", Family::Hiflying)
            .with_host("127.0.0.1")
            .with_extra("atPort", at_port);
        HiflyingConnector::new(descriptor, &http_context()).unwrap()
    }

    async fn module() -> u16 {
        at_responder(vec![
            ("AT", "+ok\r\n"),
            ("AT+VER", "+ok=4.02.10 (2023-01-05 10:00 1M)\r\n"),
            ("AT+MAC", "+ok=ACCF23000001\r\n"),
            ("AT+UART", "+ok=9600,8,1,None,NFC\r\n"),
            ("AT+WANN", "+ok=DHCP,192.168.1.50,255.255.255.0,192.168.1.1\r\n"),
            ("AT+NETP", "+ok=TCP,Server,8899,10.10.100.100\r\n"),
            ("AT+Z", "+ERR=-1\r\n"),
        ])
        .await
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_status_over_at_port() {
        let port = module().await;
        let connector = connector(port);
        assert!(connector.test_connection().await);

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.firmware.as_deref(), Some("4.02.10 (2023-01-05 10:00 1M)"));
        assert_eq!(status.details["mac"], "ACCF23000001");
        assert_eq!(status.details["atPort"], port);
        assert_eq!(status.details["serialPort"], 8899);
        assert!(status.details.get("moduleId").is_none());
    }

    #[tokio::test]
    async fn test_config_degrades_missing_values() {
        let connector = connector(module().await);
        let config: Value = serde_json::from_str(&connector.get_config(None).await.unwrap()).unwrap();
        assert_eq!(config["serial"], "9600,8,1,None,NFC");
        assert_eq!(config["network"]["tcpPort"], "TCP,Server,8899,10.10.100.100");
        assert!(config["network"].get("dns").is_none());
        assert_eq!(config["device"]["mac"], "ACCF23000001");
    }

    #[tokio::test]
    async fn test_execute_at_and_raw_commands() {
        let connector = connector(module().await);
        let ok = connector.execute_command("AT+VER").await.unwrap();
        assert!(ok.success);
        assert!(ok.output.starts_with("4.02.10"));

        let failed = connector.execute_command("AT+Z").await.unwrap();
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("-1"));

        let (serial_port, request) = peer(vec![vec![0x01, 0x03, 0x02, 0x00, 0x17]], Duration::from_millis(50)).await;
        let descriptor = DeviceDescriptor::new("hf", "bridge", Family::Hiflying)
            .with_host("127.0.0.1")
            .with_extra("serialPort", serial_port);
        let bridge = HiflyingConnector::new(descriptor, &http_context()).unwrap();
        let raw = bridge.execute_command("01 03 00 00 00 01 84 0A").await.unwrap();
        assert!(raw.success);
        assert_eq!(raw.output, "01 03 02 00 17");
        assert_eq!(request.await.unwrap(), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[tokio::test]
    async fn test_connect_falls_back_to_web_probe() {
        let app = Router::new().route("/status", get(|| async { "ok" }));
        let url = format!("http://{}", serve(app).await);
        let descriptor = DeviceDescriptor::new("hf", "bridge", Family::Hiflying)
            .with_api_url(url)
            .with_extra("atPort", closed_port().await);
        let connector = HiflyingConnector::new(descriptor, &http_context()).unwrap();

        connector.connect().await.unwrap();
        assert_eq!(connector.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_unreachable_module() {
        let connector = connector(closed_port().await);
        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("Cannot connect to Hi-Flying device at 127.0.0.1"));
        assert_eq!(connector.state(), ConnectionState::Error);

        let status = connector.get_status().await;
        assert_eq!(status.state, ConnectionState::Error);
    }

    #[test]
    fn test_port_out_of_range() {
        let descriptor = DeviceDescriptor::new("hf", "bridge", Family::Hiflying)
            .with_host("10.0.0.5")
            .with_extra("atPort", 70000);
        let err = HiflyingConnector::new(descriptor, &http_context()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
