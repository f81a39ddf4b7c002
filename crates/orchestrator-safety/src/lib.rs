//! `orchestrator-safety` – Safety Monitor
//!
//! An independent watcher on the ranging sensor's telemetry.  It knows
//! nothing about motors: when a stop zone is violated, or the sensor goes
//! quiet for too long, it publishes an emergency stop on `<ns>/cmd/estop`
//! and every actuator reacts on its own.
//!
//! # Modules
//!
//! - [`zones`] – default and configured safety zones, per-scan evaluation.
//! - [`watchdog`] – two-level staleness deadline on the scan feed.
//! - [`monitor`] – the [`SafetyMonitor`] itself and its run modes.

pub mod monitor;
pub mod watchdog;
pub mod zones;

pub use monitor::{
    LatchInfo, MONITOR_ID, MonitorHandle, MonitorStatistics, OBSTACLE_REASON, Outcome,
    SafetyMonitor, TIMEOUT_REASON,
};
pub use watchdog::{FeedHealth, ScanWatchdog};
pub use zones::{Evaluation, ZoneHit, ZoneSet, default_zones};
