//! Strongly-typed configuration.
//!
//! Every struct deserialises with serde defaults for omitted fields and
//! exposes `validate()`, so a bad value turns into a
//! [`HalError::Validation`] at load time instead of a runtime surprise.
//! [`SystemConfig`] implements [`ConfigurationService`], the only way the
//! core obtains configuration.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::encoder::EncoderMode;
use crate::error::HalError;

/// Read-only access to validated configuration.
pub trait ConfigurationService {
    fn get_motor_config(&self, name: &str) -> Result<&MotorConfig, HalError>;
    fn get_sensor_config(&self, name: &str) -> Result<&SensorConfig, HalError>;
    fn get_safety_config(&self) -> &SafetyConfig;
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), HalError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(HalError::validation(format!(
            "{field} = {value} is outside {min}..={max}"
        )))
    }
}

fn check_pin(field: &str, pin: u8) -> Result<(), HalError> {
    if (1..=40).contains(&pin) {
        Ok(())
    } else {
        Err(HalError::validation(format!("{field} = {pin} is not a GPIO pin (1..=40)")))
    }
}

fn check_name(kind: &str, name: &str) -> Result<(), HalError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(HalError::validation(format!(
            "{kind} name `{name}` must be non-empty and use only [A-Za-z0-9_]"
        )))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// System
// ────────────────────────────────────────────────────────────────────────────

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub motors: Vec<MotorConfig>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SystemConfig {
    /// # Errors
    ///
    /// Returns the first [`HalError::Validation`] found.
    pub fn validate(&self) -> Result<(), HalError> {
        self.gateway.validate()?;
        self.safety.validate()?;
        self.estimator.validate()?;
        self.service.validate()?;

        let mut names = HashSet::new();
        for motor in &self.motors {
            motor.validate()?;
            if !names.insert(motor.name.as_str()) {
                return Err(HalError::validation(format!("duplicate device name `{}`", motor.name)));
            }
        }
        for sensor in &self.sensors {
            sensor.validate()?;
            if !names.insert(sensor.name()) {
                return Err(HalError::validation(format!(
                    "duplicate device name `{}`",
                    sensor.name()
                )));
            }
        }
        for motor in &self.motors {
            if let Some(encoder) = &motor.encoder {
                match self.sensors.iter().find(|s| s.name() == encoder) {
                    Some(SensorConfig::Encoder(_)) => {}
                    _ => {
                        return Err(HalError::validation(format!(
                            "motor `{}` references unknown encoder `{encoder}`",
                            motor.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn encoders(&self) -> impl Iterator<Item = &EncoderConfig> {
        self.sensors.iter().filter_map(|s| match s {
            SensorConfig::Encoder(e) => Some(e),
            _ => None,
        })
    }

    pub fn lidars(&self) -> impl Iterator<Item = &LidarConfig> {
        self.sensors.iter().filter_map(|s| match s {
            SensorConfig::Lidar(l) => Some(l),
            _ => None,
        })
    }
}

impl ConfigurationService for SystemConfig {
    fn get_motor_config(&self, name: &str) -> Result<&MotorConfig, HalError> {
        self.motors
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| HalError::validation(format!("no motor named `{name}`")))
    }

    fn get_sensor_config(&self, name: &str) -> Result<&SensorConfig, HalError> {
        self.sensors
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| HalError::validation(format!("no sensor named `{name}`")))
    }

    fn get_safety_config(&self) -> &SafetyConfig {
        &self.safety
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Gateway
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// First topic level, e.g. `orchestrator` in `orchestrator/cmd/left_motor`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// `ws://` URL of an external broker.  `None` runs an in-process broker.
    #[serde(default)]
    pub broker_url: Option<String>,
    /// Address the in-process broker exposes to external clients.
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_delay_secs: f64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_delay_secs: f64,
    #[serde(default = "default_offline_buffer")]
    pub offline_buffer: usize,
}

fn default_namespace() -> String {
    "orchestrator".to_string()
}
fn default_client_id() -> String {
    "orchestrator_hal".to_string()
}
fn default_reconnect_base() -> f64 {
    1.0
}
fn default_reconnect_max() -> f64 {
    300.0
}
fn default_offline_buffer() -> usize {
    1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            client_id: default_client_id(),
            broker_url: None,
            listen: None,
            reconnect_base_delay_secs: default_reconnect_base(),
            reconnect_max_delay_secs: default_reconnect_max(),
            offline_buffer: default_offline_buffer(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), HalError> {
        check_name("namespace", &self.namespace)?;
        check_range("gateway.reconnect_base_delay_secs", self.reconnect_base_delay_secs, 0.001, 3600.0)?;
        check_range(
            "gateway.reconnect_max_delay_secs",
            self.reconnect_max_delay_secs,
            self.reconnect_base_delay_secs,
            86_400.0,
        )?;
        if self.offline_buffer == 0 {
            return Err(HalError::validation("gateway.offline_buffer must be at least 1"));
        }
        Ok(())
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_base_delay_secs)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_max_delay_secs)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Motors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorKind {
    #[default]
    Dc,
    Servo,
    Stepper,
}

/// Which side of a differential drive a motor turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WheelSide {
    Left,
    Right,
}

impl WheelSide {
    /// Wheel direction (`1` forward, `-1` backward) for an in-place turn to
    /// the left.  A right turn is the opposite.
    pub fn rotate_left_direction(self) -> i8 {
        match self {
            WheelSide::Left => -1,
            WheelSide::Right => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorPins {
    pub enable: u8,
    pub direction: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: MotorKind,
    pub pins: MotorPins,
    /// Drive side; when omitted it is taken from a `left`/`right` in the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<WheelSide>,
    /// Name of the encoder sensor that provides wheel feedback.
    #[serde(default)]
    pub encoder: Option<String>,
    /// m/s at 100 % duty.
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    /// m/s².
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    /// Track width used to turn rotation angles into wheel arcs.
    #[serde(default = "default_wheel_base")]
    pub wheel_base: f64,
    /// Remaining distance at which the motor starts decelerating.
    #[serde(default = "default_stopping_margin")]
    pub stopping_margin: f64,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: f64,
    /// Command id window used to drop duplicate deliveries.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

fn default_max_speed() -> f64 {
    1.0
}
fn default_acceleration() -> f64 {
    0.5
}
fn default_wheel_base() -> f64 {
    0.3
}
fn default_stopping_margin() -> f64 {
    0.05
}
fn default_tolerance() -> f64 {
    0.01
}
fn default_command_timeout() -> f64 {
    30.0
}
fn default_dedup_window() -> usize {
    64
}

impl MotorConfig {
    pub fn new(name: impl Into<String>, enable: u8, direction: u8) -> Self {
        Self {
            name: name.into(),
            kind: MotorKind::Dc,
            pins: MotorPins { enable, direction },
            side: None,
            encoder: None,
            max_speed: default_max_speed(),
            acceleration: default_acceleration(),
            wheel_base: default_wheel_base(),
            stopping_margin: default_stopping_margin(),
            tolerance: default_tolerance(),
            command_timeout_secs: default_command_timeout(),
            dedup_window: default_dedup_window(),
        }
    }

    pub fn validate(&self) -> Result<(), HalError> {
        check_name("motor", &self.name)?;
        check_pin("pins.enable", self.pins.enable)?;
        check_pin("pins.direction", self.pins.direction)?;
        if self.pins.enable == self.pins.direction {
            return Err(HalError::validation(format!(
                "motor `{}` uses pin {} twice",
                self.name, self.pins.enable
            )));
        }
        check_range("max_speed", self.max_speed, 0.1, 10.0)?;
        check_range("acceleration", self.acceleration, 0.1, 5.0)?;
        check_range("wheel_base", self.wheel_base, 0.01, 10.0)?;
        check_range("stopping_margin", self.stopping_margin, 0.0, 10.0)?;
        check_range("tolerance", self.tolerance, 0.0001, 1.0)?;
        check_range("command_timeout_secs", self.command_timeout_secs, 0.1, 3600.0)?;
        if self.wheel_side().is_none() {
            return Err(HalError::validation(format!(
                "motor `{}` needs `side = \"left\"` or `side = \"right\"`",
                self.name
            )));
        }
        Ok(())
    }

    /// The configured side, or the one named in the motor name.
    pub fn wheel_side(&self) -> Option<WheelSide> {
        self.side.or_else(|| {
            let name = self.name.to_ascii_lowercase();
            match (name.contains("left"), name.contains("right")) {
                (true, false) => Some(WheelSide::Left),
                (false, true) => Some(WheelSide::Right),
                _ => None,
            }
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout_secs)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SensorConfig {
    Encoder(EncoderConfig),
    Lidar(LidarConfig),
}

impl SensorConfig {
    pub fn name(&self) -> &str {
        match self {
            SensorConfig::Encoder(e) => &e.name,
            SensorConfig::Lidar(l) => &l.name,
        }
    }

    pub fn publish_rate_hz(&self) -> f64 {
        match self {
            SensorConfig::Encoder(e) => e.publish_rate_hz,
            SensorConfig::Lidar(l) => l.publish_rate_hz,
        }
    }

    pub fn validate(&self) -> Result<(), HalError> {
        match self {
            SensorConfig::Encoder(e) => e.validate(),
            SensorConfig::Lidar(l) => l.validate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub name: String,
    pub pin_a: u8,
    /// Second channel; present means quadrature mode.
    #[serde(default)]
    pub pin_b: Option<u8>,
    /// Ticks per wheel revolution.
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    #[serde(default = "default_wheel_diameter")]
    pub wheel_diameter: f64,
    #[serde(default = "default_gear_ratio")]
    pub gear_ratio: f64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: f64,
    #[serde(default = "default_velocity_window_ms")]
    pub velocity_window_ms: f64,
    #[serde(default = "default_encoder_rate")]
    pub publish_rate_hz: f64,
}

fn default_resolution() -> u32 {
    1000
}
fn default_wheel_diameter() -> f64 {
    0.1
}
fn default_gear_ratio() -> f64 {
    1.0
}
fn default_debounce_ms() -> f64 {
    1.0
}
fn default_velocity_window_ms() -> f64 {
    100.0
}
fn default_encoder_rate() -> f64 {
    20.0
}

impl EncoderConfig {
    pub fn new(name: impl Into<String>, pin_a: u8) -> Self {
        Self {
            name: name.into(),
            pin_a,
            pin_b: None,
            resolution: default_resolution(),
            wheel_diameter: default_wheel_diameter(),
            gear_ratio: default_gear_ratio(),
            debounce_ms: default_debounce_ms(),
            velocity_window_ms: default_velocity_window_ms(),
            publish_rate_hz: default_encoder_rate(),
        }
    }

    pub fn mode(&self) -> EncoderMode {
        if self.pin_b.is_some() {
            EncoderMode::Quadrature
        } else {
            EncoderMode::SingleChannel
        }
    }

    /// `(π · wheel_diameter / resolution) / gear_ratio`
    pub fn distance_per_tick(&self) -> f64 {
        (std::f64::consts::PI * self.wheel_diameter / f64::from(self.resolution)) / self.gear_ratio
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_ms / 1000.0)
    }

    pub fn velocity_window(&self) -> Duration {
        Duration::from_secs_f64(self.velocity_window_ms / 1000.0)
    }

    pub fn validate(&self) -> Result<(), HalError> {
        check_name("encoder", &self.name)?;
        check_pin("pin_a", self.pin_a)?;
        if let Some(pin_b) = self.pin_b {
            check_pin("pin_b", pin_b)?;
            if pin_b == self.pin_a {
                return Err(HalError::validation(format!(
                    "encoder `{}` uses pin {} for both channels",
                    self.name, pin_b
                )));
            }
        }
        if self.resolution == 0 {
            return Err(HalError::validation("resolution must be positive"));
        }
        check_range("wheel_diameter", self.wheel_diameter, 0.001, 10.0)?;
        check_range("gear_ratio", self.gear_ratio, 0.001, 1000.0)?;
        check_range("debounce_ms", self.debounce_ms, 0.0, 100.0)?;
        check_range("velocity_window_ms", self.velocity_window_ms, 1.0, 10_000.0)?;
        check_range("publish_rate_hz", self.publish_rate_hz, 0.1, 100.0)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LidarConfig {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_min_range")]
    pub min_range: f64,
    #[serde(default = "default_max_range")]
    pub max_range: f64,
    /// Degrees between points.
    #[serde(default = "default_angle_resolution")]
    pub angle_resolution: f64,
    #[serde(default = "default_scan_frequency")]
    pub scan_frequency_hz: f64,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: u8,
    #[serde(default = "default_lidar_rate")]
    pub publish_rate_hz: f64,
    /// A current scan older than this is reported as unavailable.
    #[serde(default = "default_scan_stale")]
    pub stale_after_secs: f64,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baudrate() -> u32 {
    115_200
}
fn default_min_range() -> f64 {
    0.15
}
fn default_max_range() -> f64 {
    12.0
}
fn default_angle_resolution() -> f64 {
    1.0
}
fn default_scan_frequency() -> f64 {
    10.0
}
fn default_quality_threshold() -> u8 {
    10
}
fn default_lidar_rate() -> f64 {
    10.0
}
fn default_scan_stale() -> f64 {
    1.0
}

impl LidarConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: default_port(),
            baudrate: default_baudrate(),
            min_range: default_min_range(),
            max_range: default_max_range(),
            angle_resolution: default_angle_resolution(),
            scan_frequency_hz: default_scan_frequency(),
            quality_threshold: default_quality_threshold(),
            publish_rate_hz: default_lidar_rate(),
            stale_after_secs: default_scan_stale(),
        }
    }

    pub fn validate(&self) -> Result<(), HalError> {
        check_name("lidar", &self.name)?;
        check_range("min_range", self.min_range, 0.0, 100.0)?;
        check_range("max_range", self.max_range, self.min_range, 100.0)?;
        if self.max_range <= self.min_range {
            return Err(HalError::validation("max_range must exceed min_range"));
        }
        check_range("angle_resolution", self.angle_resolution, 0.01, 45.0)?;
        check_range("scan_frequency_hz", self.scan_frequency_hz, 0.1, 100.0)?;
        check_range("publish_rate_hz", self.publish_rate_hz, 0.1, 100.0)?;
        check_range("stale_after_secs", self.stale_after_secs, 0.01, 60.0)?;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Safety
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneAction {
    Stop,
    #[serde(alias = "slow")]
    Warn,
}

/// Angular sector plus distance threshold watched by the safety monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyZone {
    pub name: String,
    /// Degrees; may be negative to express a sector through zero.
    pub angle_min: f64,
    pub angle_max: f64,
    pub distance_threshold: f64,
    /// 1 is evaluated first.
    pub priority: u32,
    pub action: ZoneAction,
}

impl SafetyZone {
    pub fn validate(&self) -> Result<(), HalError> {
        check_name("safety zone", &self.name)?;
        if !(self.angle_min < self.angle_max) {
            return Err(HalError::validation(format!(
                "zone `{}`: angle_min {} must be below angle_max {}",
                self.name, self.angle_min, self.angle_max
            )));
        }
        if self.angle_max - self.angle_min > 360.0 {
            return Err(HalError::validation(format!(
                "zone `{}` spans more than 360°",
                self.name
            )));
        }
        check_range("distance_threshold", self.distance_threshold, 0.01, 50.0)?;
        if self.priority == 0 {
            return Err(HalError::validation(format!(
                "zone `{}`: priority starts at 1",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ranging sensor whose telemetry the monitor watches.
    #[serde(default = "default_lidar_device")]
    pub lidar_device: String,
    #[serde(default = "default_obstacle_threshold")]
    pub obstacle_threshold: f64,
    /// Latency budget from scan arrival to stop publish.
    #[serde(default = "default_estop_timeout")]
    pub emergency_stop_timeout_secs: f64,
    /// Continuous clear time before a latched stop is released.
    #[serde(default = "default_clear_after")]
    pub clear_after_secs: f64,
    #[serde(default = "default_data_timeout")]
    pub data_timeout_secs: f64,
    #[serde(default = "default_critical_timeout")]
    pub critical_timeout_secs: f64,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: f64,
    /// Replaces the built-in zones when non-empty.
    #[serde(default)]
    pub zones: Vec<SafetyZone>,
}

fn default_true() -> bool {
    true
}
fn default_lidar_device() -> String {
    "lidar".to_string()
}
fn default_obstacle_threshold() -> f64 {
    0.5
}
fn default_estop_timeout() -> f64 {
    0.1
}
fn default_clear_after() -> f64 {
    3.0
}
fn default_data_timeout() -> f64 {
    2.0
}
fn default_critical_timeout() -> f64 {
    5.0
}
fn default_status_interval() -> f64 {
    1.0
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lidar_device: default_lidar_device(),
            obstacle_threshold: default_obstacle_threshold(),
            emergency_stop_timeout_secs: default_estop_timeout(),
            clear_after_secs: default_clear_after(),
            data_timeout_secs: default_data_timeout(),
            critical_timeout_secs: default_critical_timeout(),
            status_interval_secs: default_status_interval(),
            zones: Vec::new(),
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), HalError> {
        check_name("lidar_device", &self.lidar_device)?;
        check_range("obstacle_threshold", self.obstacle_threshold, 0.1, 5.0)?;
        check_range("emergency_stop_timeout_secs", self.emergency_stop_timeout_secs, 0.05, 1.0)?;
        check_range("clear_after_secs", self.clear_after_secs, 0.0, 60.0)?;
        check_range("data_timeout_secs", self.data_timeout_secs, 0.1, 60.0)?;
        check_range(
            "critical_timeout_secs",
            self.critical_timeout_secs,
            self.data_timeout_secs,
            300.0,
        )?;
        check_range("status_interval_secs", self.status_interval_secs, 0.05, 60.0)?;
        let mut names = HashSet::new();
        for zone in &self.zones {
            zone.validate()?;
            if !names.insert(zone.name.as_str()) {
                return Err(HalError::validation(format!("duplicate safety zone `{}`", zone.name)));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Estimator, service, logging
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_wheel_base")]
    pub wheel_base: f64,
    #[serde(default = "default_estimator_rate")]
    pub publish_rate_hz: f64,
    #[serde(default = "default_left_encoder")]
    pub left_encoder: String,
    #[serde(default = "default_right_encoder")]
    pub right_encoder: String,
    #[serde(default = "default_odometry_stale")]
    pub stale_after_secs: f64,
}

fn default_estimator_rate() -> f64 {
    10.0
}
fn default_left_encoder() -> String {
    "left_encoder".to_string()
}
fn default_right_encoder() -> String {
    "right_encoder".to_string()
}
fn default_odometry_stale() -> f64 {
    1.0
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wheel_base: default_wheel_base(),
            publish_rate_hz: default_estimator_rate(),
            left_encoder: default_left_encoder(),
            right_encoder: default_right_encoder(),
            stale_after_secs: default_odometry_stale(),
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), HalError> {
        check_range("estimator.wheel_base", self.wheel_base, 0.01, 10.0)?;
        check_range("estimator.publish_rate_hz", self.publish_rate_hz, 0.1, 100.0)?;
        check_range("estimator.stale_after_secs", self.stale_after_secs, 0.01, 60.0)?;
        check_name("left_encoder", &self.left_encoder)?;
        check_name("right_encoder", &self.right_encoder)?;
        if self.left_encoder == self.right_encoder {
            return Err(HalError::validation("left and right encoder must differ"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_system_id")]
    pub system_id: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: f64,
    /// Run the safety monitor inside the HAL process.
    #[serde(default = "default_true")]
    pub embedded_safety_monitor: bool,
}

fn default_system_id() -> String {
    "hal".to_string()
}
fn default_heartbeat() -> f64 {
    5.0
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            system_id: default_system_id(),
            heartbeat_interval_secs: default_heartbeat(),
            embedded_safety_monitor: true,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), HalError> {
        check_name("service.system_id", &self.system_id)?;
        check_range("service.heartbeat_interval_secs", self.heartbeat_interval_secs, 0.1, 3600.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SAMPLE: &str = r#"
[gateway]
namespace = "orchestrator"

[[motors]]
name = "left_motor"
type = "dc"
encoder = "left_encoder"
pins = { enable = 18, direction = 23 }

[[sensors]]
type = "encoder"
name = "left_encoder"
pin_a = 5
pin_b = 6

[[sensors]]
type = "lidar"
name = "lidar"
port = "/dev/ttyUSB0"

[safety]
obstacle_threshold = 0.5

[[safety.zones]]
name = "critical_front"
angle_min = -45.0
angle_max = 45.0
distance_threshold = 0.5
priority = 1
action = "stop"

[[safety.zones]]
name = "warning_left"
angle_min = 45.0
angle_max = 135.0
distance_threshold = 0.35
priority = 2
action = "slow"
"#;

    fn sample() -> SystemConfig {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn sample_document_parses_and_validates() {
        let cfg = sample();
        cfg.validate().unwrap();
        assert_eq!(cfg.motors[0].max_speed, 1.0);
        assert_eq!(cfg.safety.zones[1].action, ZoneAction::Warn);
        assert_eq!(cfg.encoders().count(), 1);
        assert_eq!(cfg.lidars().count(), 1);
    }

    #[test]
    fn configuration_service_lookups() {
        let cfg = sample();
        assert_eq!(cfg.get_motor_config("left_motor").unwrap().pins.enable, 18);
        assert!(matches!(
            cfg.get_sensor_config("left_encoder").unwrap(),
            SensorConfig::Encoder(_)
        ));
        assert!(cfg.get_sensor_config("camera").is_err());
        assert_eq!(cfg.get_safety_config().zones.len(), 2);
    }

    #[test]
    fn distance_per_tick_matches_wheel_geometry() {
        let enc = EncoderConfig::new("left_encoder", 5);
        assert_relative_eq!(enc.distance_per_tick(), 0.000_314_159, epsilon = 1e-9);
        assert_relative_eq!(enc.distance_per_tick() * 1000.0, 0.314_159, epsilon = 1e-6);
    }

    #[test]
    fn duplicate_device_names_are_rejected() {
        let mut cfg = sample();
        cfg.motors.push(MotorConfig::new("left_encoder", 3, 4));
        assert!(matches!(cfg.validate(), Err(HalError::Validation(_))));
    }

    #[test]
    fn out_of_range_pin_is_rejected() {
        let mut cfg = sample();
        cfg.motors[0].pins.enable = 41;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn motor_speed_limits_are_enforced() {
        let mut motor = MotorConfig::new("left_motor", 1, 2);
        motor.validate().unwrap();
        motor.max_speed = 12.0;
        assert!(motor.validate().is_err());
        motor.max_speed = 2.0;
        motor.acceleration = 0.05;
        assert!(motor.validate().is_err());
    }

    #[test]
    fn wheel_side_comes_from_config_or_name() {
        assert_eq!(MotorConfig::new("left_motor", 1, 2).wheel_side(), Some(WheelSide::Left));
        assert_eq!(MotorConfig::new("RightDrive", 1, 2).wheel_side(), Some(WheelSide::Right));

        let mut motor = MotorConfig::new("drive_a", 1, 2);
        assert!(motor.wheel_side().is_none());
        assert!(matches!(motor.validate(), Err(HalError::Validation(_))));
        motor.side = Some(WheelSide::Right);
        motor.validate().unwrap();

        let parsed: MotorConfig =
            toml::from_str("name = \"drive_b\"\nside = \"left\"\npins = { enable = 5, direction = 6 }\n").unwrap();
        assert_eq!(parsed.wheel_side(), Some(WheelSide::Left));
        assert_eq!(WheelSide::Left.rotate_left_direction(), -WheelSide::Right.rotate_left_direction());
    }

    #[test]
    fn unknown_encoder_reference_is_rejected() {
        let mut cfg = sample();
        cfg.motors[0].encoder = Some("lidar".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_zone_is_rejected() {
        let zone = SafetyZone {
            name: "bad".to_string(),
            angle_min: 90.0,
            angle_max: 10.0,
            distance_threshold: 0.5,
            priority: 1,
            action: ZoneAction::Stop,
        };
        assert!(zone.validate().is_err());
    }

    #[test]
    fn safety_timeouts_have_bounds() {
        let mut safety = SafetyConfig::default();
        safety.emergency_stop_timeout_secs = 2.0;
        assert!(safety.validate().is_err());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: SystemConfig = toml::from_str("").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.gateway.namespace, "orchestrator");
        assert_eq!(cfg.estimator.publish_rate_hz, 10.0);
        assert!(cfg.safety.zones.is_empty());
    }
}
