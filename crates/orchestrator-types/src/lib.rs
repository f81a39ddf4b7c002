//! `orchestrator-types` – shared vocabulary of the robot HAL.
//!
//! Everything that crosses a crate boundary or travels over the gateway is
//! defined here so that producers and consumers agree on one shape.
//!
//! # Modules
//!
//! - [`message`] – wire messages: commands, telemetry, status, emergency stop.
//! - [`device`] – device lifecycle, capabilities and status snapshots.
//! - [`scan`] – ranging scans, point validity and sector queries.
//! - [`encoder`] – encoder telemetry payload.
//! - [`state`] – pose, velocity and robot state.
//! - [`geometry`] – angle normalisation and angular sectors.
//! - [`config`] – typed configuration and the [`ConfigurationService`] trait.
//! - [`error`] – the workspace-wide [`HalError`].

pub mod config;
pub mod device;
pub mod encoder;
pub mod error;
pub mod geometry;
pub mod message;
pub mod scan;
pub mod state;

pub use config::{
    ConfigurationService, EncoderConfig, EstimatorConfig, GatewayConfig, LidarConfig,
    LogFormat, LoggingConfig, MotorConfig, MotorKind, MotorPins, SafetyConfig, SafetyZone,
    SensorConfig, ServiceConfig, SystemConfig, WheelSide, ZoneAction,
};
pub use device::{Capability, DeviceStatus, Lifecycle};
pub use encoder::{EncoderMode, EncoderReading};
pub use error::HalError;
pub use geometry::{AngularSector, normalize_degrees, normalize_radians};
pub use message::{
    Ack, Command, EMERGENCY_STOP_ACTION, ESTOP_COMPONENT, EmergencyStop, ObstacleInfo, Priority,
    StatusReport, TelemetrySample,
};
pub use scan::{
    ClosestObstacle, Scan, ScanLimits, ScanPoint, ScanReading, ScanStatistics, SectorCounts,
    SectorHit,
};
pub use state::{Pose, RobotState, RobotStatus, Velocity};
