//! `orchestrator-hal` – Hardware Abstraction Layer
//!
//! Turns raw hardware signals into validated telemetry and validated
//! commands into actuator outputs.  The rest of the system only ever sees
//! the [`Device`], [`Commandable`], [`Actuator`] and [`Sensor`] traits, so a
//! simulated backend and a real one are interchangeable.
//!
//! # Modules
//!
//! - [`device`] – capability traits, lifecycle bookkeeping, periodic
//!   telemetry publishing.
//! - [`motor`] – wheel motor state machine with distance targets.
//! - [`encoder`] – edge decoding, debounce and windowed velocity.
//! - [`lidar`] – scan acquisition, validity filtering and sector queries.
//! - [`registry`] – device registry and command router.
//! - [`sim`] – simulated wheel and ranging sensor backends.

pub mod device;
pub mod encoder;
pub mod lidar;
pub mod motor;
pub mod registry;
pub mod sim;

pub use device::{
    Actuator, Commandable, Device, LifecycleCell, Sensor, TaskHandle, period_for, start_publishing,
};
pub use encoder::{Channel, Encoder, EncoderAction, TickWindow};
pub use lidar::{Lidar, ScanSource, sector_counts, spawn_acquisition};
pub use motor::{
    MotionEvent, MotionState, Motor, MotorAction, MotorDriver, MotorTelemetry, WheelFeedback,
    spawn_control_loop,
};
pub use registry::DeviceRegistry;
pub use sim::{SimLidar, SimWheel};
