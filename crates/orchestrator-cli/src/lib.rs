//! `orchestrator-cli` – process entry points
//!
//! Two binaries share this library:
//!
//! - `orchestrator` – the HAL service with an embedded safety monitor.
//! - `safety-monitor` – the safety monitor alone, attached to an external
//!   broker over WebSocket.
//!
//! # Modules
//!
//! - [`config`] – TOML loading with `ORCH_*` environment overrides.
//! - [`signal`] – Ctrl-C as a shutdown watch channel.

pub mod config;
pub mod signal;
