//! `orchestrator-runtime` – HAL process assembly
//!
//! Wires the gateway, devices, safety monitor and state estimator into one
//! running service and adds the pieces around them.
//!
//! # Modules
//!
//! - [`service`] – [`HalService`][service::HalService]: builds everything
//!   from a [`SystemConfig`][orchestrator_types::SystemConfig], publishes the
//!   heartbeat and tears it all down again.
//! - [`mission`] – [`Mission`][mission::Mission] state machine and the
//!   [`MissionRunner`][mission::MissionRunner] that executes missions over
//!   the gateway.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: log
//!   formatting and optional OTLP span export.

pub mod mission;
pub mod service;
pub mod telemetry;

pub use mission::{
    MISSION_ID, Mission, MissionAction, MissionHandle, MissionRunner, MissionState, MissionStatus,
    MissionStep, StepDispatch,
};
pub use service::{HEARTBEAT_COMPONENT, HalService, spawn_heartbeat};
pub use telemetry::{TracerProviderGuard, init_tracing};
