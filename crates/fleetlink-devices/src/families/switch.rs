/*!
 * Shell-only network switches (Cisco IOS, HP ProCurve/Aruba).
 */
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::debug;

use crate::connector::{CommandResult, ConnectionState, Connector, StateCell, StatusEnvelope};
use crate::descriptor::{DeviceDescriptor, Family};
use crate::error::{ConnectorError, Result};
use crate::families::{shell_transport, FamilyContext};
use crate::transport::ShellTransport;

/// CLI dialect differences between switch vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Cisco,
    Hp,
}

impl Dialect {
    fn status_command(self) -> &'static str {
        match self {
            Dialect::Cisco => "show version",
            Dialect::Hp => "show system",
        }
    }

    fn interfaces_command(self) -> &'static str {
        match self {
            Dialect::Cisco => "show ip interface brief",
            Dialect::Hp => "show interfaces brief",
        }
    }

    fn paging_command(self) -> &'static str {
        match self {
            Dialect::Cisco => "terminal length 0",
            Dialect::Hp => "no page",
        }
    }

    fn config_command(self, section: Option<&str>) -> String {
        match (self, section) {
            (Dialect::Cisco, Some(section)) => format!("show running-config | section {}", section),
            _ => "show running-config".to_string(),
        }
    }
}

/// Patterns pulling status fields out of the status command output
#[derive(Debug)]
struct StatusPatterns {
    uptime: Regex,
    firmware: Vec<Regex>,
    model: Vec<Regex>,
    serial: Regex,
}

impl StatusPatterns {
    fn for_dialect(dialect: Dialect) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ConnectorError::protocol(format!("Bad status pattern: {}", e)))
        };
        Ok(match dialect {
            Dialect::Cisco => Self {
                uptime: compile(r"(?i)uptime is ([^\r\n]+)")?,
                firmware: vec![compile(r"(?i)Version ([^\s,]+)")?],
                model: vec![
                    compile(r"(?im)^(?:cisco|Model number)\s*:\s*([^\r\n]+)")?,
                    compile(r"(?im)^cisco\s+(\S+)")?,
                ],
                serial: compile(r"(?i)(?:System serial number|Processor board ID)\s*:?\s*(\S+)")?,
            },
            Dialect::Hp => Self {
                uptime: compile(r"(?im)Up Time\s*:\s*([^\r\n]+?)(?:\s{2,}|\r?$)")?,
                firmware: vec![
                    compile(r"(?i)Firmware revision\s*:\s*(\S+)")?,
                    compile(r"(?i)Software revision\s*:\s*(\S+)")?,
                ],
                model: vec![compile(r"(?i)System Description\s*:\s*([^\r\n]+)")?],
                serial: compile(r"(?i)Serial Number\s*:\s*(\S+)")?,
            },
        })
    }

    fn first(patterns: &[Regex], text: &str) -> Option<String> {
        patterns
            .iter()
            .find_map(|p| p.captures(text).and_then(|c| c.get(1)))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn apply(&self, status: StatusEnvelope, output: &str) -> StatusEnvelope {
        status
            .with_uptime(Self::first(std::slice::from_ref(&self.uptime), output))
            .with_firmware(Self::first(&self.firmware, output))
            .with_model(Self::first(&self.model, output))
            .with_serial(Self::first(std::slice::from_ref(&self.serial), output))
    }
}

/// Split a tabular `show ... brief` listing into rows of whitespace columns,
/// dropping the header line
fn table_rows(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .skip(1)
        .filter(|line| !line.chars().all(|c| c == '-' || c == ' ' || c == '+'))
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .collect()
}

/// A switch managed entirely over its CLI
#[derive(Debug)]
pub struct SwitchConnector {
    descriptor: DeviceDescriptor,
    shell: ShellTransport,
    dialect: Dialect,
    patterns: StatusPatterns,
}

impl SwitchConnector {
    /// Build a connector; needs `host` and `username`
    pub fn new(descriptor: DeviceDescriptor, ctx: &FamilyContext) -> Result<Self> {
        let dialect = match descriptor.family {
            Family::Cisco => Dialect::Cisco,
            Family::Hp => Dialect::Hp,
            other => return Err(ConnectorError::config(format!("{} is not a switch family", other))),
        };
        let state = StateCell::new(descriptor.id.clone());
        let mut shell = shell_transport(&descriptor, ctx, state)?;
        if descriptor.extra_str("pagingCommand").is_none() {
            shell = shell.with_paging_command(dialect.paging_command());
        }
        Ok(Self {
            patterns: StatusPatterns::for_dialect(dialect)?,
            descriptor,
            shell,
            dialect,
        })
    }

    async fn run(&self, command: &str) -> Result<String> {
        match self.shell.mode() {
            crate::transport::ShellMode::Exec => self.shell.exec(command, None).await,
            crate::transport::ShellMode::Interactive => self.shell.shell(command, None).await,
        }
    }
}

#[async_trait]
impl Connector for SwitchConnector {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> ConnectionState {
        self.shell.state()
    }

    async fn connect(&self) -> Result<()> {
        self.shell.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.shell.disconnect().await
    }

    async fn collect_status(&self) -> Result<StatusEnvelope> {
        let output = self.run(self.dialect.status_command()).await?;
        debug!("{} status output: {} bytes", self.descriptor.id, output.len());
        let status = StatusEnvelope::new(&self.descriptor, ConnectionState::Connected);
        Ok(self.patterns.apply(status, &output))
    }

    async fn execute_command(&self, command: &str) -> Result<CommandResult> {
        Ok(self.shell.execute_command(&self.descriptor.id, command).await)
    }

    async fn get_config(&self, section: Option<&str>) -> Result<String> {
        self.run(&self.dialect.config_command(section)).await
    }

    async fn list_children(&self) -> Result<serde_json::Value> {
        let output = self.run(self.dialect.interfaces_command()).await?;
        let rows = table_rows(&output);
        let interfaces: Vec<_> = match self.dialect {
            Dialect::Cisco => rows
                .into_iter()
                .filter(|cols| cols.len() >= 6)
                .map(|cols| {
                    json!({
                        "interface": cols[0],
                        "address": cols[1],
                        "status": cols[4..cols.len() - 1].join(" "),
                        "protocol": cols[cols.len() - 1],
                    })
                })
                .collect(),
            Dialect::Hp => rows
                .into_iter()
                .filter(|cols| !cols.is_empty())
                .map(|cols| json!({ "interface": cols[0], "columns": &cols[1..] }))
                .collect(),
        };
        debug!("{} listed {} interfaces", self.descriptor.id, interfaces.len());
        Ok(json!({ "interfaces": interfaces }))
    }
}
