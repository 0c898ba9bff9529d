/*!
 * Error type shared by every connector, transport and the registry.
 */
use std::fmt;

use thiserror::Error;

use fleetlink_core::error::Error as CoreError;

/// Error type for connector operations
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// No completion signal arrived within the bound
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Non-2xx HTTP response, family error code or device-reported error
    #[error("API error{}: {body}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Api {
        /// HTTP status, absent for non-HTTP transports
        status: Option<u16>,
        /// Response body or device error text
        body: String,
    },

    /// Login or re-authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// The family does not implement the operation
    #[error("Operation '{operation}' is not supported by {family} devices")]
    Unsupported {
        /// Family tag
        family: String,
        /// Operation name
        operation: String,
    },

    /// Unknown device id
    #[error("Device '{id}' not found. Known devices: {}", .known.join(", "))]
    NotFound {
        /// The requested id
        id: String,
        /// Every id the registry knows
        known: Vec<String>,
    },

    /// Socket or session level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid descriptor or descriptor source
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A response could not be interpreted
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Coarse classification of a [`ConnectorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ConnectorError::Timeout`]
    Timeout,
    /// See [`ConnectorError::Api`]
    Api,
    /// See [`ConnectorError::AuthFailure`]
    AuthFailure,
    /// See [`ConnectorError::Unsupported`]
    Unsupported,
    /// See [`ConnectorError::NotFound`]
    NotFound,
    /// See [`ConnectorError::Transport`]
    Transport,
    /// See [`ConnectorError::Configuration`]
    Configuration,
    /// See [`ConnectorError::Protocol`]
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Api => "api",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transport => "transport",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

impl ConnectorError {
    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::Timeout(_) => ErrorKind::Timeout,
            ConnectorError::Api { .. } => ErrorKind::Api,
            ConnectorError::AuthFailure(_) => ErrorKind::AuthFailure,
            ConnectorError::Unsupported { .. } => ErrorKind::Unsupported,
            ConnectorError::NotFound { .. } => ErrorKind::NotFound,
            ConnectorError::Transport(_) => ErrorKind::Transport,
            ConnectorError::Configuration(_) => ErrorKind::Configuration,
            ConnectorError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        ConnectorError::Timeout(msg.as_ref().to_string())
    }

    /// Create a new API error
    pub fn api<S: AsRef<str>>(status: Option<u16>, body: S) -> Self {
        ConnectorError::Api {
            status,
            body: body.as_ref().to_string(),
        }
    }

    /// Create a new authentication error
    pub fn auth<S: AsRef<str>>(msg: S) -> Self {
        ConnectorError::AuthFailure(msg.as_ref().to_string())
    }

    /// Create a new unsupported-operation error
    pub fn unsupported<F: AsRef<str>, O: AsRef<str>>(family: F, operation: O) -> Self {
        ConnectorError::Unsupported {
            family: family.as_ref().to_string(),
            operation: operation.as_ref().to_string(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        ConnectorError::Transport(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        ConnectorError::Configuration(msg.as_ref().to_string())
    }

    /// Create a new protocol error
    pub fn protocol<S: AsRef<str>>(msg: S) -> Self {
        ConnectorError::Protocol(msg.as_ref().to_string())
    }

    /// HTTP status of an API error, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ConnectorError::Api { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<CoreError> for ConnectorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => ConnectorError::Timeout(msg),
            CoreError::Config(msg) => ConnectorError::Configuration(msg),
            CoreError::Io(e) => e.into(),
            CoreError::Serialization(msg) => ConnectorError::Protocol(msg),
            other => ConnectorError::Transport(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => ConnectorError::Timeout(err.to_string()),
            _ => ConnectorError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::Protocol(format!("Invalid JSON: {}", err))
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnectorError::Timeout(format!("HTTP request timed out: {}", err))
        } else if let Some(status) = err.status() {
            ConnectorError::api(Some(status.as_u16()), err.to_string())
        } else {
            ConnectorError::Transport(format!("HTTP transport failure: {}", err))
        }
    }
}

impl From<russh::Error> for ConnectorError {
    fn from(err: russh::Error) -> Self {
        ConnectorError::Transport(format!("SSH error: {}", err))
    }
}
