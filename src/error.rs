//! Error types for xstream-native

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XstreamError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or missing request field, raised before any side effect
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Elevation relay rejected the credential
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Elevation relay could not be reached
    #[error("Privilege channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Privileged command exited non-zero
    #[error("{}", format_command_failure(.cmd, .code, .output))]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        output: String,
    },

    /// Core binary fetch or unpack failed
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// A tunnel transition is already in progress
    #[error("Busy: {0}")]
    Busy(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Service registry error
    #[error("Service error: {0}")]
    Service(String),

    /// Not supported
    #[error("Not supported: {0}")]
    NotSupported(String),
}

fn format_command_failure(cmd: &str, code: &Option<i32>, output: &str) -> String {
    match code {
        Some(code) => format!("Command '{}' failed with code {}: {}", cmd, code, output),
        None => format!("Command '{}' failed: {}", cmd, output),
    }
}

impl XstreamError {
    /// Taxonomy name reported to callers of the bridge
    pub fn kind(&self) -> &'static str {
        match self {
            XstreamError::InvalidArgument(_) => "ArgumentError",
            XstreamError::AuthRejected(_) | XstreamError::ChannelUnavailable(_) => "PrivilegeError",
            XstreamError::CommandFailed { .. } => "ExecutionError",
            XstreamError::Transfer(_) => "TransferError",
            XstreamError::Busy(_) => "BusyError",
            XstreamError::InvalidState(_) => "StateError",
            XstreamError::Config(_) | XstreamError::Parse(_) => "ConfigError",
            XstreamError::Service(_) => "ServiceError",
            XstreamError::NotSupported(_) => "NotSupported",
            XstreamError::Io(_) => "IoError",
        }
    }

    /// Whether the caller may reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            XstreamError::CommandFailed { .. } | XstreamError::Transfer(_) | XstreamError::Busy(_)
        )
    }

    /// Captured diagnostic output of a failed command
    pub fn command_output(&self) -> Option<&str> {
        match self {
            XstreamError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for XstreamError {
    fn from(error: serde_json::Error) -> Self {
        XstreamError::Parse(error.to_string())
    }
}

impl From<toml::de::Error> for XstreamError {
    fn from(error: toml::de::Error) -> Self {
        XstreamError::Config(error.to_string())
    }
}

pub type XstreamResult<T> = Result<T, XstreamError>;
