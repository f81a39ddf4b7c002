use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::StatusReport;

/// Device lifecycle.
///
/// `Uninitialized → Initializing → Ready → (Error | Stopped)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Stopped,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Initializing => "initializing",
            Lifecycle::Ready => "ready",
            Lifecycle::Error => "error",
            Lifecycle::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviours a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Sensor,
    Actuator,
}

/// Snapshot returned by `Device::get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub capabilities: Vec<Capability>,
    pub lifecycle: Lifecycle,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl DeviceStatus {
    pub fn is_healthy(&self) -> bool {
        self.lifecycle == Lifecycle::Ready
    }

    pub fn to_report(&self) -> StatusReport {
        StatusReport {
            timestamp: self.last_updated,
            device_id: self.device_id.clone(),
            status: self.lifecycle.as_str().to_string(),
            details: self.details.clone(),
        }
    }
}
