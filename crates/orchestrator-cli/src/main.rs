//! `orchestrator` – robot HAL and safety core
//!
//! 1. Loads `orchestrator.toml` (or `--config`), applies `ORCH_*` overrides
//!    and command-line flags, validates.
//! 2. Starts the HAL service: gateway, devices, safety monitor, state
//!    estimator, mission runner, heartbeat.
//! 3. On Ctrl-C publishes an emergency stop and shuts everything down.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use orchestrator_cli::config;
use orchestrator_cli::signal::shutdown_signal;
use orchestrator_runtime::{HalService, init_tracing};
use orchestrator_types::{EmergencyStop, HalError, SystemConfig};
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(name = "orchestrator", version)]
#[command(about = "Robot HAL: device control, safety monitor and state estimation over a message bus", long_about = None)]
struct Args {
    /// Configuration file (TOML).  Defaults to ./orchestrator.toml if present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directive, e.g. `debug` or `orchestrator_hal=trace`.
    #[arg(long)]
    log_level: Option<String>,

    /// Serve the in-process broker over WebSocket on this address.
    #[arg(long)]
    listen: Option<String>,

    /// Connect to an external WebSocket broker instead of running one.
    #[arg(long)]
    broker: Option<String>,

    /// Validate the configuration, print it and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (mut cfg, source) = match config::load(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = args.log_level {
        cfg.logging.level = level;
    }
    if let Some(listen) = args.listen {
        cfg.gateway.listen = Some(listen);
    }
    if let Some(broker) = args.broker {
        cfg.gateway.broker_url = Some(broker);
    }
    if let Err(e) = cfg.validate() {
        eprintln!("{}: {}", "Invalid configuration".red().bold(), e);
        return ExitCode::FAILURE;
    }

    if args.check {
        return match config::render(&cfg) {
            Ok(rendered) => {
                println!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Config error".red().bold(), e);
                ExitCode::FAILURE
            }
        };
    }

    let _guard = init_tracing("orchestrator", &cfg.logging.level, cfg.logging.format);
    print_banner(&cfg, source.as_deref().map(|p| p.display().to_string()));

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start the async runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "orchestrator failed");
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: SystemConfig) -> Result<(), HalError> {
    let mut shutdown = shutdown_signal();
    let service = HalService::start(cfg).await?;

    println!("  {} HAL running with {} device(s).", "✓".green().bold(), service.registry().device_ids().len());
    if let Some(addr) = service.listen_addr() {
        println!("  {} Broker listening on {}", "✓".green().bold(), format!("ws://{addr}").bold());
    }
    println!("  Press {} to stop.\n", "Ctrl-C".bold());

    // Returns once the flag flips; a dropped sender also ends the wait.
    let _ = shutdown.wait_for(|stop| *stop).await;

    let estop = EmergencyStop::new("operator_shutdown", None);
    match service.gateway().publish_emergency_stop(&estop).await {
        Ok(()) => println!("{}", "  ✓ Emergency stop published.".green()),
        Err(e) => warn!(error = %e, "emergency stop not published on shutdown"),
    }
    service.shutdown().await;
    println!("{}", "  ✓ Exiting orchestrator.".green());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner(cfg: &SystemConfig, source: Option<String>) {
    println!();
    println!("{}", r#"   ____            __              __           __"#.bold().cyan());
    println!("{}", r#"  / __ \__________/ /_  ___  _____/ /__________ _/ /_____  _____"#.bold().cyan());
    println!("{}", r#" / / / / ___/ ___/ __ \/ _ \/ ___/ __/ ___/ __ `/ __/ __ \/ ___/"#.bold().cyan());
    println!("{}", r#"/ /_/ / /  / /__/ / / /  __(__  ) /_/ /  / /_/ / /_/ /_/ / /"#.bold().cyan());
    println!("{}", r#"\____/_/   \___/_/ /_/\___/____/\__/_/   \__,_/\__/\____/_/"#.bold().cyan());
    println!();
    println!("  {} {}", "Orchestrator".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Robot HAL & Safety Core");
    println!();
    match source {
        Some(path) => println!("  Config loaded from {}", path.bold()),
        None => println!("  {}", "No config file found, using built-in defaults.".dimmed()),
    }
    println!(
        "  System {} · namespace {} · {} motor(s), {} sensor(s)",
        cfg.service.system_id.bold(),
        cfg.gateway.namespace.bold(),
        cfg.motors.len(),
        cfg.sensors.len()
    );
    let monitor = match (cfg.safety.enabled, cfg.service.embedded_safety_monitor) {
        (false, _) => "disabled".red(),
        (true, true) => "embedded".green(),
        (true, false) => "external".yellow(),
    };
    println!("  Safety monitor: {monitor}");
    println!();
}
