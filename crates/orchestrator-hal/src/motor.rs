//! Differential-drive wheel motor.
//!
//! ```text
//!   Idle ──move──▶ Accelerating ──▶ Cruising ──margin──▶ Decelerating ──tolerance──▶ Idle
//!     ▲                                                                               │
//!     └──────────────────────────── stop / emergency stop / timeout ◀─────────────────┘
//!   any ──driver fault──▶ Error
//! ```
//!
//! [`Motor::tick`] advances the state machine by `dt`; the control loop
//! started by [`spawn_control_loop`] calls it at 10 Hz and publishes
//! telemetry plus movement outcomes.  The motor talks to hardware only
//! through two seams: [`MotorDriver`] for the direction pin and PWM duty,
//! and [`WheelFeedback`] for travelled distance.  Without feedback the
//! distance is integrated from the commanded speed.
//!
//! Rotations turn the robot in place.  The wheel's [`WheelSide`] decides its
//! direction: on `rotate_left` the left wheel runs backwards and the right
//! wheel forwards, `rotate_right` is the mirror image.  Each wheel covers the
//! arc `angle_rad * wheel_base / 2`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use orchestrator_gateway::Gateway;
use orchestrator_types::{
    Ack, Capability, Command, DeviceStatus, HalError, Lifecycle, MotorConfig, StatusReport,
    TelemetrySample, WheelSide,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::device::{Actuator, Commandable, Device, LifecycleCell, Sensor, TaskHandle, period_for};

/// Control loop rate.
pub const CONTROL_RATE_HZ: f64 = 10.0;

/// Speed fraction used when a move omits `speed`.
pub const DEFAULT_MOVE_FRACTION: f64 = 0.5;

/// Speed fraction used when a rotation omits `speed`.
pub const DEFAULT_ROTATE_FRACTION: f64 = 0.3;

/// Fraction of the cruise speed held while creeping up on the target.
const CRAWL_FRACTION: f64 = 0.2;

/// Direction pin and PWM output of one motor.
pub trait MotorDriver: Send + Sync {
    /// # Errors
    ///
    /// Returns [`HalError::Hardware`] when the pins cannot be claimed.
    fn init(&self) -> Result<(), HalError>;

    fn set_direction(&self, forward: bool) -> Result<(), HalError>;

    /// Duty cycle in percent, `0.0..=100.0`.
    fn set_duty_cycle(&self, duty: f64) -> Result<(), HalError>;

    /// Stop PWM and release the pins.
    fn release(&self);
}

/// Distance feedback for one wheel.
pub trait WheelFeedback: Send + Sync {
    /// Signed distance travelled since start, metres.
    fn distance(&self) -> f64;

    fn ticks(&self) -> i64;

    /// Direction the motor is being driven in, for sensors that cannot
    /// measure it.
    fn set_direction_hint(&self, _direction: i8) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    #[default]
    Idle,
    Accelerating,
    Cruising,
    Decelerating,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "parameters", rename_all = "snake_case")]
pub enum MotorAction {
    MoveForward {
        distance: f64,
        #[serde(default)]
        speed: Option<f64>,
    },
    MoveBackward {
        distance: f64,
        #[serde(default)]
        speed: Option<f64>,
    },
    RotateLeft {
        /// Degrees.
        angle: f64,
        #[serde(default)]
        speed: Option<f64>,
    },
    RotateRight {
        angle: f64,
        #[serde(default)]
        speed: Option<f64>,
    },
    SetSpeed {
        speed: f64,
        #[serde(default)]
        direction: Option<i8>,
    },
    Stop,
    EmergencyStop,
}

/// `data` field of a motor telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorTelemetry {
    pub state: MotionState,
    pub current_speed: f64,
    pub target_speed: f64,
    pub direction: i8,
    pub encoder_count: i64,
    pub distance_traveled: f64,
    pub target_distance: Option<f64>,
    pub duty_cycle: f64,
}

/// Outcome of a [`Motor::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum MotionEvent {
    Completed {
        command_id: Option<String>,
        distance: f64,
    },
    Failed {
        command_id: Option<String>,
        reason: String,
    },
    Fault(HalError),
}

#[derive(Debug, Default)]
struct Motion {
    state: MotionState,
    current_speed: f64,
    target_speed: f64,
    cruise_speed: f64,
    direction: i8,
    target_distance: Option<f64>,
    start_distance: f64,
    open_loop_distance: f64,
    distance_traveled: f64,
    elapsed: Duration,
    command_id: Option<String>,
    duty_cycle: f64,
}

impl Motion {
    fn halt(&mut self) {
        self.current_speed = 0.0;
        self.target_speed = 0.0;
        self.cruise_speed = 0.0;
        self.target_distance = None;
        self.command_id = None;
        self.elapsed = Duration::ZERO;
        self.duty_cycle = 0.0;
        if self.state != MotionState::Error {
            self.state = MotionState::Idle;
        }
    }
}

/// Recently seen command ids and the acks they produced.
#[derive(Debug)]
struct AckLog {
    order: VecDeque<String>,
    acks: HashMap<String, Ack>,
    capacity: usize,
}

impl AckLog {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            acks: HashMap::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn replay(&self, command_id: &str) -> Option<Ack> {
        self.acks.get(command_id).map(|ack| Ack {
            duplicate: true,
            ..ack.clone()
        })
    }

    fn record(&mut self, ack: &Ack) {
        if self.acks.contains_key(&ack.command_id) {
            return;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.acks.remove(&oldest);
        }
        self.order.push_back(ack.command_id.clone());
        self.acks.insert(ack.command_id.clone(), ack.clone());
    }
}

pub struct Motor {
    id: String,
    config: MotorConfig,
    driver: Arc<dyn MotorDriver>,
    feedback: Option<Arc<dyn WheelFeedback>>,
    lifecycle: LifecycleCell,
    motion: Mutex<Motion>,
    acks: Mutex<AckLog>,
}

impl Motor {
    pub fn new(config: MotorConfig, driver: Arc<dyn MotorDriver>) -> Self {
        Self {
            id: config.name.clone(),
            acks: Mutex::new(AckLog::new(config.dedup_window)),
            config,
            driver,
            feedback: None,
            lifecycle: LifecycleCell::default(),
            motion: Mutex::new(Motion {
                direction: 1,
                ..Motion::default()
            }),
        }
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn WheelFeedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    pub fn state(&self) -> MotionState {
        self.motion.lock().state
    }

    fn position(&self, motion: &Motion) -> f64 {
        match &self.feedback {
            Some(fb) => fb.distance(),
            None => motion.open_loop_distance,
        }
    }

    fn duty_for(&self, speed: f64) -> f64 {
        (speed.abs() / self.config.max_speed * 100.0).clamp(0.0, 100.0)
    }

    /// Zero the outputs, mark the device failed and report why.
    fn fault(&self, motion: &mut Motion, err: HalError) -> MotionEvent {
        error!(device = %self.id, error = %err, "motor fault, outputs stopped");
        if let Err(e) = self.driver.set_duty_cycle(0.0) {
            warn!(device = %self.id, error = %e, "zero duty refused after fault");
        }
        motion.state = MotionState::Error;
        motion.halt();
        self.lifecycle.fail(err.clone());
        MotionEvent::Fault(err)
    }

    fn write_duty(&self, motion: &mut Motion, duty: f64) -> Result<(), HalError> {
        self.driver.set_duty_cycle(duty)?;
        motion.duty_cycle = duty;
        Ok(())
    }

    fn begin(
        &self,
        command_id: &str,
        target_distance: Option<f64>,
        fraction: f64,
        direction: i8,
    ) -> Result<(), HalError> {
        if !fraction.is_finite() || fraction <= 0.0 {
            return Err(HalError::validation(format!("speed must be positive, got {fraction}")));
        }
        let cruise = fraction.clamp(0.0, 1.0) * self.config.max_speed;
        let mut m = self.motion.lock();

        if m.direction != direction && m.current_speed > 0.0 {
            // Reversing: drop to zero before flipping the direction pin.
            if let Err(e) = self.write_duty(&mut m, 0.0) {
                let event = self.fault(&mut m, e.clone());
                debug!(device = %self.id, ?event, "reversal failed");
                return Err(e);
            }
            m.current_speed = 0.0;
        }
        if let Err(e) = self.driver.set_direction(direction > 0) {
            self.fault(&mut m, e.clone());
            return Err(e);
        }
        if let Some(fb) = &self.feedback {
            fb.set_direction_hint(direction);
        }

        m.direction = direction;
        m.target_distance = target_distance;
        m.start_distance = self.position(&m);
        m.distance_traveled = 0.0;
        m.elapsed = Duration::ZERO;
        m.cruise_speed = cruise;
        m.target_speed = cruise;
        m.command_id = Some(command_id.to_string());
        m.state = MotionState::Accelerating;
        info!(
            device = %self.id,
            command_id,
            target_distance = ?target_distance,
            speed = cruise,
            direction,
            "movement started"
        );
        Ok(())
    }

    /// Bring the motor to rest.  Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Hardware`] if the driver refuses the zero duty.
    pub fn stop(&self) -> Result<(), HalError> {
        let mut m = self.motion.lock();
        let was_moving = m.state != MotionState::Idle;
        m.halt();
        if let Err(e) = self.driver.set_duty_cycle(0.0) {
            self.fault(&mut m, e.clone());
            return Err(e);
        }
        if was_moving {
            info!(device = %self.id, "motor stopped");
        }
        Ok(())
    }

    /// Wheel direction for an in-place left turn.
    fn rotate_left_direction(&self) -> Result<i8, HalError> {
        self.config
            .wheel_side()
            .map(WheelSide::rotate_left_direction)
            .ok_or_else(|| HalError::validation(format!("motor `{}` has no wheel side", self.id)))
    }

    fn apply(&self, command_id: &str, action: MotorAction) -> Result<(), HalError> {
        let arc = |angle: f64| -> Result<f64, HalError> {
            let angle = positive("angle", angle)?;
            Ok(angle.to_radians() * self.config.wheel_base / 2.0)
        };
        match action {
            MotorAction::MoveForward { distance, speed } => self.begin(
                command_id,
                Some(positive("distance", distance)?),
                speed.unwrap_or(DEFAULT_MOVE_FRACTION),
                1,
            ),
            MotorAction::MoveBackward { distance, speed } => self.begin(
                command_id,
                Some(positive("distance", distance)?),
                speed.unwrap_or(DEFAULT_MOVE_FRACTION),
                -1,
            ),
            MotorAction::RotateLeft { angle, speed } => {
                let direction = self.rotate_left_direction()?;
                self.begin(command_id, Some(arc(angle)?), speed.unwrap_or(DEFAULT_ROTATE_FRACTION), direction)
            }
            MotorAction::RotateRight { angle, speed } => {
                let direction = -self.rotate_left_direction()?;
                self.begin(command_id, Some(arc(angle)?), speed.unwrap_or(DEFAULT_ROTATE_FRACTION), direction)
            }
            MotorAction::SetSpeed { speed, direction } => {
                let direction = direction.unwrap_or(1);
                if direction != 1 && direction != -1 {
                    return Err(HalError::validation(format!(
                        "direction must be 1 or -1, got {direction}"
                    )));
                }
                if speed <= 0.0 {
                    self.stop()
                } else {
                    self.begin(command_id, None, speed, direction)
                }
            }
            MotorAction::Stop => self.stop(),
            MotorAction::EmergencyStop => {
                self.emergency_stop("emergency_stop command");
                Ok(())
            }
        }
    }

    /// Advance the control state machine by `dt`.
    pub fn tick(&self, dt: Duration) -> Option<MotionEvent> {
        let mut m = self.motion.lock();
        if matches!(m.state, MotionState::Idle | MotionState::Error) {
            return None;
        }
        let secs = dt.as_secs_f64();
        m.elapsed += dt;
        m.open_loop_distance += m.current_speed * secs * f64::from(m.direction);
        let position = self.position(&m);
        m.distance_traveled = (position - m.start_distance).abs();

        if let Some(target) = m.target_distance {
            let remaining = target - m.distance_traveled;
            if remaining <= self.config.tolerance {
                let event = MotionEvent::Completed {
                    command_id: m.command_id.clone(),
                    distance: m.distance_traveled,
                };
                m.halt();
                if let Err(e) = self.driver.set_duty_cycle(0.0) {
                    return Some(self.fault(&mut m, e));
                }
                info!(device = %self.id, distance = m.distance_traveled, "movement completed");
                return Some(event);
            }
            if m.elapsed >= self.config.command_timeout() {
                let event = MotionEvent::Failed {
                    command_id: m.command_id.clone(),
                    reason: format!(
                        "timed out after {:.1} s with {:.3} m remaining",
                        m.elapsed.as_secs_f64(),
                        remaining
                    ),
                };
                m.halt();
                if let Err(e) = self.driver.set_duty_cycle(0.0) {
                    return Some(self.fault(&mut m, e));
                }
                warn!(device = %self.id, remaining, "movement timed out");
                return Some(event);
            }
            if remaining <= self.config.stopping_margin {
                m.state = MotionState::Decelerating;
                m.target_speed = m.cruise_speed * CRAWL_FRACTION;
            }
        }

        let step = self.config.acceleration * secs;
        let diff = m.target_speed - m.current_speed;
        m.current_speed += diff.clamp(-step, step);

        if m.state != MotionState::Decelerating || m.target_distance.is_none() {
            m.state = if (m.current_speed - m.target_speed).abs() < 1e-9 {
                MotionState::Cruising
            } else if m.current_speed < m.target_speed {
                MotionState::Accelerating
            } else {
                MotionState::Decelerating
            };
        }

        let duty = self.duty_for(m.current_speed);
        if let Err(e) = self.write_duty(&mut m, duty) {
            return Some(self.fault(&mut m, e));
        }
        None
    }

    pub fn telemetry(&self) -> MotorTelemetry {
        let m = self.motion.lock();
        MotorTelemetry {
            state: m.state,
            current_speed: m.current_speed * f64::from(m.direction),
            target_speed: m.target_speed * f64::from(m.direction),
            direction: m.direction,
            encoder_count: self.feedback.as_ref().map_or(0, |fb| fb.ticks()),
            distance_traveled: m.distance_traveled,
            target_distance: m.target_distance,
            duty_cycle: m.duty_cycle,
        }
    }
}

fn positive(name: &str, value: f64) -> Result<f64, HalError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(HalError::validation(format!("{name} must be positive, got {value}")))
    }
}

impl Device for Motor {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Actuator, Capability::Sensor]
    }

    fn initialize(&self) -> Result<(), HalError> {
        self.lifecycle.set(Lifecycle::Initializing);
        let result = self
            .config
            .validate()
            .map_err(|e| HalError::hardware(&self.id, e.to_string()))
            .and_then(|()| self.driver.init())
            .and_then(|()| self.driver.set_duty_cycle(0.0));
        match result {
            Ok(()) => {
                self.lifecycle.set(Lifecycle::Ready);
                info!(
                    device = %self.id,
                    kind = ?self.config.kind,
                    enable_pin = self.config.pins.enable,
                    direction_pin = self.config.pins.direction,
                    "motor ready"
                );
                Ok(())
            }
            Err(e) => {
                error!(device = %self.id, error = %e, "motor initialisation failed");
                self.motion.lock().state = MotionState::Error;
                self.lifecycle.fail(e.clone());
                Err(e)
            }
        }
    }

    fn shutdown(&self) {
        {
            let mut m = self.motion.lock();
            m.halt();
        }
        if let Err(e) = self.driver.set_duty_cycle(0.0) {
            warn!(device = %self.id, error = %e, "zero duty refused on shutdown");
        }
        self.driver.release();
        self.lifecycle.set(Lifecycle::Stopped);
        info!(device = %self.id, "motor shut down");
    }

    fn get_status(&self) -> DeviceStatus {
        let t = self.telemetry();
        let details = json!({
            "kind": self.config.kind,
            "motion": t.state,
            "current_speed": t.current_speed,
            "duty_cycle": t.duty_cycle,
        });
        self.lifecycle.status(&self.id, self.capabilities(), details)
    }
}

impl Commandable for Motor {
    fn execute_command(&self, command: &Command) -> Result<Ack, HalError> {
        if let Some(ack) = self.acks.lock().replay(&command.command_id) {
            debug!(device = %self.id, command_id = %command.command_id, "duplicate command, replaying ack");
            return Ok(ack);
        }
        if !command.is_emergency_stop() {
            self.lifecycle.ensure_ready(&self.id, &command.command_id)?;
        }
        let action = command.parse_action::<MotorAction>()?;
        self.apply(&command.command_id, action)?;
        let ack = Ack::accepted(&command.command_id, &self.id);
        self.acks.lock().record(&ack);
        Ok(ack)
    }
}

impl Actuator for Motor {
    fn emergency_stop(&self, reason: &str) {
        let mut m = self.motion.lock();
        m.halt();
        if let Err(e) = self.driver.set_duty_cycle(0.0) {
            self.fault(&mut m, e);
        }
        warn!(device = %self.id, reason, "emergency stop");
    }
}

impl Sensor for Motor {
    type Reading = MotorTelemetry;

    fn read_data(&self) -> Result<TelemetrySample<MotorTelemetry>, HalError> {
        Ok(TelemetrySample::new(&self.id, self.telemetry()))
    }
}

/// Run `motor`'s control loop at [`CONTROL_RATE_HZ`], publishing telemetry
/// every tick and a status message for every completed, failed or faulted
/// movement.
pub fn spawn_control_loop(motor: Arc<Motor>, gateway: Gateway) -> TaskHandle {
    let name = format!("control:{}", motor.id());
    TaskHandle::spawn(name, move |mut shutdown| async move {
        let mut ticker = tokio::time::interval(period_for(CONTROL_RATE_HZ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            let dt = now.saturating_duration_since(last);
            last = now;

            if let Some(event) = motor.tick(dt) {
                let report = match event {
                    MotionEvent::Completed { command_id, distance } => StatusReport::new(
                        motor.id(),
                        "movement_completed",
                        json!({ "command_id": command_id, "distance": distance }),
                    ),
                    MotionEvent::Failed { command_id, reason } => StatusReport::new(
                        motor.id(),
                        "movement_failed",
                        json!({ "command_id": command_id, "reason": reason }),
                    ),
                    MotionEvent::Fault(_) => motor.get_status().to_report(),
                };
                if let Err(e) = gateway.publish_status(&report).await {
                    warn!(device = %motor.id(), error = %e, "movement status not published");
                }
            }
            if let Ok(sample) = motor.read_data()
                && let Err(e) = gateway.publish_telemetry(&sample).await
            {
                debug!(device = %motor.id(), error = %e, "motor telemetry not published");
            }
        }
    })
}
