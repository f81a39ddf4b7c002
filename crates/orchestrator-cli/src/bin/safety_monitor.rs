//! `safety-monitor` – the safety monitor as its own process.
//!
//! Connects to the HAL's WebSocket broker, watches the configured ranging
//! sensor and publishes emergency stops.  Runs on a dedicated thread (raised
//! to real-time priority with the `realtime` feature).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use orchestrator_cli::config;
use orchestrator_cli::signal::shutdown_signal;
use orchestrator_gateway::{Gateway, WsTransport};
use orchestrator_runtime::init_tracing;
use orchestrator_safety::{MONITOR_ID, SafetyMonitor};
use orchestrator_types::{HalError, SystemConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "safety-monitor", version)]
#[command(about = "Independent obstacle and sensor-timeout watchdog", long_about = None)]
struct Args {
    /// Configuration file (TOML).  Only `gateway`, `safety` and `logging`
    /// are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    /// WebSocket broker URL; overrides `gateway.broker_url`.
    #[arg(long)]
    broker: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let (mut cfg, _) = match config::load(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = args.log_level {
        cfg.logging.level = level;
    }
    if let Some(broker) = args.broker {
        cfg.gateway.broker_url = Some(broker);
    }
    if cfg.gateway.client_id == orchestrator_types::GatewayConfig::default().client_id {
        cfg.gateway.client_id = MONITOR_ID.to_string();
    }
    if let Err(e) = cfg.validate() {
        eprintln!("{}: {}", "Invalid configuration".red().bold(), e);
        return ExitCode::FAILURE;
    }
    let Some(url) = cfg.gateway.broker_url.clone() else {
        eprintln!("{}: pass --broker or set gateway.broker_url", "No broker".red().bold());
        return ExitCode::FAILURE;
    };

    let _guard = init_tracing("safety-monitor", &cfg.logging.level, cfg.logging.format);
    println!("{} watching {} via {}", "Safety monitor".bold().cyan(), cfg.safety.lidar_device.bold(), url.bold());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start the async runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cfg, url)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: SystemConfig, url: String) -> Result<(), HalError> {
    let mut shutdown = shutdown_signal();
    let gateway = Gateway::new(&cfg.gateway, Arc::new(WsTransport::new(url)));
    if let Err(e) = gateway.connect().await {
        warn!(error = %e, "broker not reachable yet, retrying in the background");
    }

    let monitor = Arc::new(SafetyMonitor::new(cfg.safety, gateway.clone())?);
    let handle = monitor.clone().spawn_dedicated().await?;
    info!(zones = monitor.zones().len(), "safety monitor running");

    let _ = shutdown.wait_for(|stop| *stop).await;

    handle.stop().await;
    gateway.disconnect().await;
    let stats = monitor.statistics();
    println!(
        "{} {} scans, {} emergency stop(s)",
        "  ✓ Safety monitor stopped:".green(),
        stats.scans_received,
        stats.triggers
    );
    Ok(())
}
