//! Robot pose and the state record published by the estimator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::normalize_radians;

/// Planar pose in the odometry frame.
///
/// `heading` is in radians, counter-clockwise from +X, kept in `[0, 2π)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
    pub timestamp: DateTime<Utc>,
}

impl Pose {
    pub fn origin() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            heading: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self {
            x,
            y,
            heading: normalize_radians(heading),
            timestamp: Utc::now(),
        }
    }

    pub fn heading_degrees(&self) -> f64 {
        self.heading.to_degrees()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    /// m/s
    pub linear: f64,
    /// rad/s
    pub angular: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    #[default]
    Idle,
    Active,
    EmergencyStop,
    Error,
}

/// Published on `<ns>/status/robot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub pose: Pose,
    pub velocity: Velocity,
    pub status: RobotStatus,
    pub update_count: u64,
    /// True when no encoder data arrived within the staleness window.
    pub odometry_stale: bool,
}

impl Default for RobotState {
    fn default() -> Self {
        Self {
            pose: Pose::origin(),
            velocity: Velocity::default(),
            status: RobotStatus::Idle,
            update_count: 0,
            odometry_stale: true,
        }
    }
}
