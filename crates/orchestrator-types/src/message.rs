//! Wire messages exchanged over the gateway.
//!
//! Every message is a single JSON object.  Four shapes exist:
//!
//! | Shape | Fields |
//! |---|---|
//! | [`Command`] | `timestamp`, `command_id`, `action`, `parameters`, `priority` |
//! | [`TelemetrySample`] | `timestamp`, `device_id`, `data` |
//! | [`StatusReport`] | `timestamp`, `device_id`, `status`, `details` |
//! | [`EmergencyStop`] | `timestamp`, `command_id`, `action`, `reason`, `obstacle_info` |

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::HalError;

/// Action name carried by every emergency-stop message.
pub const EMERGENCY_STOP_ACTION: &str = "emergency_stop";

/// Component name of the emergency-stop command topic (`<ns>/cmd/estop`).
pub const ESTOP_COMPONENT: &str = "estop";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Emergency,
}

// ────────────────────────────────────────────────────────────────────────────
// Command
// ────────────────────────────────────────────────────────────────────────────

/// A command addressed to one device.
///
/// `action` stays a plain string on the wire; each device kind parses it into
/// its own closed action enum with [`Command::parse_action`], which is where
/// malformed commands are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default)]
    pub priority: Priority,
}

impl Command {
    pub fn new(action: impl Into<String>, parameters: Value) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action: action.into(),
            parameters,
            priority: Priority::Normal,
        }
    }

    /// Build a command from a typed action enum.
    ///
    /// The enum must be adjacently tagged as
    /// `#[serde(tag = "action", content = "parameters")]`.
    pub fn from_action<A: Serialize>(action: &A) -> Result<Self, HalError> {
        let value = serde_json::to_value(action)?;
        let name = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| HalError::validation("action enum must serialise with an `action` tag"))?
            .to_string();
        let parameters = value.get("parameters").cloned().unwrap_or(Value::Null);
        Ok(Self::new(name, parameters))
    }

    pub fn with_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = command_id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Parse this command into the closed action enum `A` of the target
    /// device kind.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] when the action name is unknown to `A`
    /// or the parameters do not match the variant.
    pub fn parse_action<A: DeserializeOwned>(&self) -> Result<A, HalError> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("action".to_string(), Value::String(self.action.clone()));
        let has_parameters = match &self.parameters {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        if has_parameters {
            envelope.insert("parameters".to_string(), self.parameters.clone());
        }
        serde_json::from_value(Value::Object(envelope)).map_err(|e| {
            HalError::validation(format!(
                "command {} has invalid action `{}`: {e}",
                self.command_id, self.action
            ))
        })
    }

    pub fn is_emergency_stop(&self) -> bool {
        self.action == EMERGENCY_STOP_ACTION
    }
}

/// Acknowledgement returned by an actuator for an accepted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub command_id: String,
    pub device_id: String,
    pub accepted: bool,
    pub timestamp: DateTime<Utc>,
    /// Set when the ack was replayed for an already-seen command id.
    #[serde(default)]
    pub duplicate: bool,
}

impl Ack {
    pub fn accepted(command_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            device_id: device_id.into(),
            accepted: true,
            timestamp: Utc::now(),
            duplicate: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry and status
// ────────────────────────────────────────────────────────────────────────────

/// One telemetry sample published on `<ns>/data/<device_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample<T> {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub data: T,
}

impl<T> TelemetrySample<T> {
    pub fn new(device_id: impl Into<String>, data: T) -> Self {
        Self {
            timestamp: Utc::now(),
            device_id: device_id.into(),
            data,
        }
    }
}

/// Status message published on `<ns>/status/<device_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub status: String,
    #[serde(default)]
    pub details: Value,
}

impl StatusReport {
    pub fn new(device_id: impl Into<String>, status: impl Into<String>, details: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            device_id: device_id.into(),
            status: status.into(),
            details,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Emergency stop
// ────────────────────────────────────────────────────────────────────────────

/// What the safety monitor saw when it decided to stop the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleInfo {
    pub distance: f64,
    pub angle: f64,
    pub zone_name: String,
    pub obstacle_count: usize,
}

/// Override command published on `<ns>/cmd/estop`.
///
/// It parses as a regular [`Command`] whose action is `emergency_stop`, so
/// actuators need no special decoding path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStop {
    pub timestamp: DateTime<Utc>,
    pub command_id: String,
    pub action: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstacle_info: Option<ObstacleInfo>,
    #[serde(default = "emergency_priority")]
    pub priority: Priority,
}

fn emergency_priority() -> Priority {
    Priority::Emergency
}

impl EmergencyStop {
    pub fn new(reason: impl Into<String>, obstacle_info: Option<ObstacleInfo>) -> Self {
        Self {
            timestamp: Utc::now(),
            command_id: format!("estop_{}", Uuid::new_v4().simple()),
            action: EMERGENCY_STOP_ACTION.to_string(),
            reason: reason.into(),
            obstacle_info,
            priority: Priority::Emergency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "action", content = "parameters", rename_all = "snake_case")]
    enum TestAction {
        MoveForward { distance: f64 },
        Stop,
    }

    #[test]
    fn parse_action_with_parameters() {
        let cmd = Command::new("move_forward", json!({"distance": 1.5}));
        let action: TestAction = cmd.parse_action().unwrap();
        assert_eq!(action, TestAction::MoveForward { distance: 1.5 });
    }

    #[test]
    fn parse_unit_action_ignores_empty_parameters() {
        let cmd = Command::new("stop", json!({}));
        let action: TestAction = cmd.parse_action().unwrap();
        assert_eq!(action, TestAction::Stop);
    }

    #[test]
    fn unknown_action_is_a_validation_error() {
        let cmd = Command::new("fly", Value::Null);
        let err = cmd.parse_action::<TestAction>().unwrap_err();
        assert!(matches!(err, HalError::Validation(_)));
    }

    #[test]
    fn missing_parameter_is_a_validation_error() {
        let cmd = Command::new("move_forward", json!({"speed": 0.2}));
        assert!(cmd.parse_action::<TestAction>().is_err());
    }

    #[test]
    fn from_action_splits_tag_and_parameters() {
        let cmd = Command::from_action(&TestAction::MoveForward { distance: 2.0 }).unwrap();
        assert_eq!(cmd.action, "move_forward");
        assert_eq!(cmd.parameters, json!({"distance": 2.0}));
        assert_eq!(cmd.priority, Priority::Normal);
    }

    #[test]
    fn command_wire_shape() {
        let raw = r#"{"timestamp":"2024-01-01T00:00:00Z","command_id":"c1","action":"stop","parameters":{}}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.command_id, "c1");
        assert_eq!(cmd.priority, Priority::Normal);
    }

    #[test]
    fn emergency_stop_reads_as_command() {
        let estop = EmergencyStop::new(
            "obstacle_detected",
            Some(ObstacleInfo {
                distance: 0.3,
                angle: 0.0,
                zone_name: "critical_front".to_string(),
                obstacle_count: 1,
            }),
        );
        let json = serde_json::to_string(&estop).unwrap();
        let cmd: Command = serde_json::from_str(&json).unwrap();
        assert!(cmd.is_emergency_stop());
        assert_eq!(cmd.priority, Priority::Emergency);
        assert!(cmd.command_id.starts_with("estop_"));
    }
}
