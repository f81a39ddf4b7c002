//! Ctrl-C handling.

use colored::Colorize;
use tokio::sync::watch;
use tracing::warn;

/// Install the Ctrl-C / SIGTERM handler and return a receiver that flips to
/// `true` on the first signal.  A second signal exits immediately.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let installed = ctrlc::set_handler(move || {
        if *tx.borrow() {
            eprintln!("{}", "  ✗ Second interrupt, exiting now.".red().bold());
            std::process::exit(130);
        }
        println!();
        println!("{}", "⚠  Interrupt received – stopping actuators and shutting down …".yellow().bold());
        tx.send_replace(true);
    });
    if let Err(e) = installed {
        warn!(error = %e, "Ctrl-C handler not installed; stop the process with SIGKILL");
    }
    rx
}
