//! Configuration loading – `orchestrator.toml` plus `ORCH_*` overrides.

use std::fs;
use std::path::{Path, PathBuf};

use orchestrator_types::{LogFormat, SystemConfig};

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "orchestrator.toml";

/// Load the effective configuration.
///
/// An explicit `path` must exist.  Without one, [`DEFAULT_CONFIG_FILE`] is
/// used when present and built-in defaults otherwise.  Environment overrides
/// are applied in both cases; the result is not validated yet so that
/// command-line flags can still change it.
pub fn load(path: Option<&Path>) -> Result<(SystemConfig, Option<PathBuf>), String> {
    let (mut cfg, source) = match path {
        Some(path) => match load_from(path)? {
            Some(cfg) => (cfg, Some(path.to_path_buf())),
            None => return Err(format!("Config file {} does not exist", path.display())),
        },
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_FILE);
            match load_from(&path)? {
                Some(cfg) => (cfg, Some(path)),
                None => (SystemConfig::default(), None),
            }
        }
    };
    apply_env_overrides(&mut cfg);
    Ok((cfg, source))
}

/// Parse one TOML file.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<SystemConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: SystemConfig =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;
    Ok(Some(cfg))
}

/// Apply `ORCH_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ORCH_NAMESPACE` | `gateway.namespace` |
/// | `ORCH_CLIENT_ID` | `gateway.client_id` |
/// | `ORCH_BROKER_URL` | `gateway.broker_url` |
/// | `ORCH_LISTEN` | `gateway.listen` |
/// | `ORCH_SYSTEM_ID` | `service.system_id` |
/// | `ORCH_HEARTBEAT_SECS` | `service.heartbeat_interval_secs` |
/// | `ORCH_OBSTACLE_THRESHOLD` | `safety.obstacle_threshold` |
/// | `ORCH_LOG_LEVEL` | `logging.level` |
/// | `ORCH_LOG_FORMAT` | `logging.format` (`json` or `compact`) |
///
/// Unparsable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut SystemConfig) {
    if let Ok(v) = std::env::var("ORCH_NAMESPACE") {
        cfg.gateway.namespace = v;
    }
    if let Ok(v) = std::env::var("ORCH_CLIENT_ID") {
        cfg.gateway.client_id = v;
    }
    if let Ok(v) = std::env::var("ORCH_BROKER_URL") {
        cfg.gateway.broker_url = Some(v).filter(|url| !url.is_empty());
    }
    if let Ok(v) = std::env::var("ORCH_LISTEN") {
        cfg.gateway.listen = Some(v).filter(|addr| !addr.is_empty());
    }
    if let Ok(v) = std::env::var("ORCH_SYSTEM_ID") {
        cfg.service.system_id = v;
    }
    if let Ok(v) = std::env::var("ORCH_HEARTBEAT_SECS")
        && let Ok(secs) = v.parse::<f64>()
    {
        cfg.service.heartbeat_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("ORCH_OBSTACLE_THRESHOLD")
        && let Ok(threshold) = v.parse::<f64>()
    {
        cfg.safety.obstacle_threshold = threshold;
    }
    if let Ok(v) = std::env::var("ORCH_LOG_LEVEL") {
        cfg.logging.level = v;
    }
    if let Ok(v) = std::env::var("ORCH_LOG_FORMAT") {
        match v.to_ascii_lowercase().as_str() {
            "json" => cfg.logging.format = LogFormat::Json,
            "compact" => cfg.logging.format = LogFormat::Compact,
            _ => {}
        }
    }
}

/// Render the effective configuration as TOML.
pub fn render(cfg: &SystemConfig) -> Result<String, String> {
    toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))
}
