//! `orchestrator-estimator` – State Estimator
//!
//! Dead-reckons the robot's planar pose from left and right wheel encoder
//! telemetry and publishes it as the system's single source of truth for
//! where the robot is.
//!
//! # Modules
//!
//! - [`odometry`] – [`Odometry`][odometry::Odometry]: differential-drive
//!   integrator, plus [`WheelPairing`][odometry::WheelPairing] which turns
//!   cumulative wheel distances into delta pairs.
//! - [`estimator`] – [`StateEstimator`][estimator::StateEstimator]: the
//!   gateway-facing service around the integrator.

pub mod estimator;
pub mod odometry;

pub use estimator::{
    ESTIMATOR_ID, EstimatorAction, EstimatorHandle, ROBOT_STATE_COMPONENT, StateEstimator,
};
pub use odometry::{Odometry, Side, WheelDeltas, WheelPairing};
