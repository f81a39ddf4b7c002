use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Global error type shared by every crate in the workspace.
///
/// Serialisable so that it can be embedded in status `details` when a
/// device reports why it entered the error state.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HalError {
    /// The message transport is unreachable or the session dropped.
    #[error("Connection Error: {0}")]
    Connection(String),
    /// A malformed topic, command, or configuration value.
    #[error("Validation Error: {0}")]
    Validation(String),
    /// Device initialisation or I/O failure.
    #[error("Hardware Fault on {device}: {details}")]
    Hardware { device: String, details: String },
    /// A sensor read, scan, or command did not complete in time.
    #[error("Timeout in {operation} after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },
    /// A well-formed command that the target refused to execute.
    #[error("Command {command_id} rejected: {reason}")]
    Command { command_id: String, reason: String },
    #[error("Serialization Error: {0}")]
    Serialization(String),
}

impl HalError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn hardware(device: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Hardware {
            device: device.into(),
            details: details.into(),
        }
    }

    pub fn rejected(command_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            command_id: command_id.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, used in status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            HalError::Connection(_) => "connection",
            HalError::Validation(_) => "validation",
            HalError::Hardware { .. } => "hardware",
            HalError::Timeout { .. } => "timeout",
            HalError::Command { .. } => "command",
            HalError::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for HalError {
    fn from(err: serde_json::Error) -> Self {
        HalError::Serialization(err.to_string())
    }
}
