/*!
 * Configuration management for FleetLink.
 *
 * Settings are layered: built-in defaults, then an optional file, then
 * environment variables carrying a prefix (`FLEETLINK__TRANSPORT__AT_TIMEOUT_MS`).
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for FleetLink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Transport timing and behaviour
    #[serde(default)]
    pub transport: TransportConfig,

    /// Device descriptor source
    #[serde(default)]
    pub devices: DevicesConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error, `fleetlink_devices=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to print the event target
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

/// Transport configuration
///
/// All durations are expressed in milliseconds so they survive every config
/// source unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bound for one shell command, exec or interactive
    #[serde(default = "default_shell_timeout_ms")]
    pub shell_timeout_ms: u64,

    /// Upper bound spent waiting for the first prompt of an interactive shell
    #[serde(default = "default_prompt_grace_ms")]
    pub prompt_grace_ms: u64,

    /// Bound for one AT command round trip
    #[serde(default = "default_at_timeout_ms")]
    pub at_timeout_ms: u64,

    /// Overall bound for one transparent serial exchange
    #[serde(default = "default_serial_timeout_ms")]
    pub serial_timeout_ms: u64,

    /// Silence after the last received chunk that ends a serial exchange
    #[serde(default = "default_serial_idle_ms")]
    pub serial_idle_ms: u64,

    /// Bound for one HTTP request
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Accept self-signed certificates on every HTTP family
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Number of devices queried at once by fleet-wide status (1 = sequential)
    #[serde(default = "default_status_concurrency")]
    pub status_concurrency: usize,
}

/// Device descriptor source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Path of the JSON descriptor file
    #[serde(default = "default_devices_file")]
    pub file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_with_target(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            shell_timeout_ms: default_shell_timeout_ms(),
            prompt_grace_ms: default_prompt_grace_ms(),
            at_timeout_ms: default_at_timeout_ms(),
            serial_timeout_ms: default_serial_timeout_ms(),
            serial_idle_ms: default_serial_idle_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            accept_invalid_certs: false,
            status_concurrency: default_status_concurrency(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            file: default_devices_file(),
        }
    }
}

impl TransportConfig {
    /// Shell command bound
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_millis(self.shell_timeout_ms)
    }

    /// Interactive prompt grace bound
    pub fn prompt_grace(&self) -> Duration {
        Duration::from_millis(self.prompt_grace_ms)
    }

    /// AT command bound
    pub fn at_timeout(&self) -> Duration {
        Duration::from_millis(self.at_timeout_ms)
    }

    /// Transparent serial overall bound
    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }

    /// Transparent serial inactivity window
    pub fn serial_idle(&self) -> Duration {
        Duration::from_millis(self.serial_idle_ms)
    }

    /// HTTP request bound
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

fn default_app_name() -> String {
    "fleetlink".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

fn default_shell_timeout_ms() -> u64 {
    30_000
}

fn default_prompt_grace_ms() -> u64 {
    500
}

fn default_at_timeout_ms() -> u64 {
    3_000
}

fn default_serial_timeout_ms() -> u64 {
    3_000
}

fn default_serial_idle_ms() -> u64 {
    500
}

fn default_http_timeout_ms() -> u64 {
    15_000
}

fn default_status_concurrency() -> usize {
    1
}

fn default_devices_file() -> String {
    "./devices.json".to_string()
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        if config.transport.status_concurrency == 0 {
            return Err(Error::config("transport.status_concurrency must be at least 1"));
        }

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
