//! Wheel encoder.
//!
//! [`Encoder::on_edge`] is the interrupt-path entry point: it checks for a
//! real transition, debounces per channel, updates the tick count and
//! records `(timestamp, ticks)` in a ring buffer.  Everything derived
//! (distance, velocity, rpm) is computed on read.
//!
//! Direction:
//!
//! * quadrature – an A edge with `A != B`, or a B edge with `A == B`, is a
//!   forward tick;
//! * single channel – every A transition counts one tick in the direction of
//!   an external flag, set by command or by the motor's commanded direction.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::time::Duration;

use orchestrator_types::{
    Ack, Capability, Command, DeviceStatus, EncoderConfig, EncoderMode, EncoderReading, HalError,
    Lifecycle, TelemetrySample,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::{Commandable, Device, LifecycleCell, Sensor};
use crate::motor::WheelFeedback;

/// Samples kept for velocity estimation.
const TICK_WINDOW_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "parameters", rename_all = "snake_case")]
pub enum EncoderAction {
    ResetEncoder,
    SetDirection { direction: i8 },
}

/// Bounded ring buffer of `(timestamp, tick_count)` samples.
#[derive(Debug, Clone)]
pub struct TickWindow {
    samples: VecDeque<(Instant, i64)>,
    capacity: usize,
}

impl TickWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, at: Instant, ticks: i64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, ticks));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Ticks per second over the samples no older than `window` before
    /// `now`.  Zero with fewer than two samples or no elapsed time.
    pub fn rate(&self, now: Instant, window: Duration) -> f64 {
        let cutoff = now.checked_sub(window);
        let mut in_window = self
            .samples
            .iter()
            .filter(|(t, _)| cutoff.is_none_or(|c| *t >= c) && *t <= now);
        let Some(&(first_t, first_ticks)) = in_window.next() else {
            return 0.0;
        };
        let Some(&(last_t, last_ticks)) = in_window.last() else {
            return 0.0;
        };
        let dt = last_t.saturating_duration_since(first_t).as_secs_f64();
        if dt <= 0.0 {
            return 0.0;
        }
        (last_ticks - first_ticks) as f64 / dt
    }
}

#[derive(Debug)]
struct EncoderState {
    level_a: bool,
    level_b: bool,
    accepted_a: Option<Instant>,
    accepted_b: Option<Instant>,
    ticks: i64,
    interrupts: u64,
    direction: i8,
    window: TickWindow,
    last_edge: Option<Instant>,
    resets: u64,
}

impl EncoderState {
    fn new() -> Self {
        Self {
            level_a: false,
            level_b: false,
            accepted_a: None,
            accepted_b: None,
            ticks: 0,
            interrupts: 0,
            direction: 1,
            window: TickWindow::new(TICK_WINDOW_CAPACITY),
            last_edge: None,
            resets: 0,
        }
    }
}

pub struct Encoder {
    id: String,
    config: EncoderConfig,
    mode: EncoderMode,
    distance_per_tick: f64,
    lifecycle: LifecycleCell,
    state: Mutex<EncoderState>,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            id: config.name.clone(),
            mode: config.mode(),
            distance_per_tick: config.distance_per_tick(),
            config,
            lifecycle: LifecycleCell::default(),
            state: Mutex::new(EncoderState::new()),
        }
    }

    pub fn mode(&self) -> EncoderMode {
        self.mode
    }

    pub fn distance_per_tick(&self) -> f64 {
        self.distance_per_tick
    }

    /// Handle one level change on `channel`.  Returns whether the edge was
    /// counted.
    pub fn on_edge(&self, channel: Channel, level: bool, at: Instant) -> bool {
        if channel == Channel::B && self.mode == EncoderMode::SingleChannel {
            return false;
        }
        let debounce = self.config.debounce();
        let mut s = self.state.lock();

        let (previous, accepted) = match channel {
            Channel::A => (s.level_a, s.accepted_a),
            Channel::B => (s.level_b, s.accepted_b),
        };
        if previous == level {
            return false;
        }
        if let Some(last) = accepted
            && at.saturating_duration_since(last) < debounce
        {
            return false;
        }
        match channel {
            Channel::A => {
                s.level_a = level;
                s.accepted_a = Some(at);
            }
            Channel::B => {
                s.level_b = level;
                s.accepted_b = Some(at);
            }
        }

        let delta: i64 = match (self.mode, channel) {
            (EncoderMode::SingleChannel, _) => i64::from(s.direction),
            (EncoderMode::Quadrature, Channel::A) => {
                if s.level_a != s.level_b { 1 } else { -1 }
            }
            (EncoderMode::Quadrature, Channel::B) => {
                if s.level_a == s.level_b { 1 } else { -1 }
            }
        };
        if self.mode == EncoderMode::Quadrature {
            s.direction = if delta > 0 { 1 } else { -1 };
        }
        s.ticks += delta;
        s.interrupts += 1;
        s.last_edge = Some(at);
        let ticks = s.ticks;
        s.window.push(at, ticks);
        true
    }

    /// Add already-decoded ticks, as a simulated wheel does.
    pub fn inject_ticks(&self, delta: i64, at: Instant) {
        if delta == 0 {
            return;
        }
        let mut s = self.state.lock();
        s.ticks += delta;
        s.interrupts += delta.unsigned_abs();
        s.direction = if delta > 0 { 1 } else { -1 };
        s.last_edge = Some(at);
        let ticks = s.ticks;
        s.window.push(at, ticks);
    }

    /// Zero the tick count and velocity history.  Direction is kept.
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.ticks = 0;
        s.interrupts = 0;
        s.window.clear();
        s.last_edge = None;
        s.resets += 1;
        info!(device = %self.id, resets = s.resets, "encoder reset");
    }

    /// Set the single-channel direction flag.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] unless `direction` is `1` or `-1`.
    pub fn set_direction(&self, direction: i8) -> Result<(), HalError> {
        if direction != 1 && direction != -1 {
            return Err(HalError::validation(format!(
                "encoder direction must be 1 or -1, got {direction}"
            )));
        }
        if self.mode == EncoderMode::Quadrature {
            debug!(device = %self.id, "direction flag ignored in quadrature mode");
            return Ok(());
        }
        self.state.lock().direction = direction;
        Ok(())
    }

    /// Reading as of `now`.
    pub fn reading_at(&self, now: Instant) -> EncoderReading {
        let s = self.state.lock();
        let velocity = s.window.rate(now, self.config.velocity_window()) * self.distance_per_tick;
        let circumference = PI * self.config.wheel_diameter;
        let rpm = if velocity.abs() > 1e-3 && circumference > 0.0 {
            velocity.abs() / circumference * 60.0
        } else {
            0.0
        };
        EncoderReading {
            tick_count: s.ticks,
            total_distance: s.ticks as f64 * self.distance_per_tick,
            velocity,
            direction: s.direction,
            rpm,
            distance_per_tick: self.distance_per_tick,
            interrupt_count: s.interrupts,
            mode: self.mode,
            direction_ambiguous: self.mode == EncoderMode::SingleChannel,
            last_edge_age_ms: s
                .last_edge
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            resets: s.resets,
        }
    }
}

impl Device for Encoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Sensor]
    }

    fn initialize(&self) -> Result<(), HalError> {
        self.lifecycle.set(Lifecycle::Initializing);
        if let Err(e) = self.config.validate() {
            let err = HalError::hardware(&self.id, e.to_string());
            self.lifecycle.fail(err.clone());
            return Err(err);
        }
        match self.mode {
            EncoderMode::Quadrature => {
                info!(device = %self.id, pin_a = self.config.pin_a, pin_b = ?self.config.pin_b, "quadrature encoder ready")
            }
            EncoderMode::SingleChannel => {
                info!(device = %self.id, pin_a = self.config.pin_a, "single-channel encoder ready")
            }
        }
        self.lifecycle.set(Lifecycle::Ready);
        Ok(())
    }

    fn shutdown(&self) {
        self.lifecycle.set(Lifecycle::Stopped);
    }

    fn get_status(&self) -> DeviceStatus {
        let s = self.state.lock();
        let details = json!({
            "mode": self.mode,
            "tick_count": s.ticks,
            "interrupt_count": s.interrupts,
        });
        drop(s);
        self.lifecycle.status(&self.id, self.capabilities(), details)
    }
}

impl Sensor for Encoder {
    type Reading = EncoderReading;

    fn read_data(&self) -> Result<TelemetrySample<EncoderReading>, HalError> {
        self.lifecycle.ensure_readable(&self.id)?;
        Ok(TelemetrySample::new(&self.id, self.reading_at(Instant::now())))
    }
}

impl Commandable for Encoder {
    fn execute_command(&self, command: &Command) -> Result<Ack, HalError> {
        self.lifecycle.ensure_ready(&self.id, &command.command_id)?;
        match command.parse_action::<EncoderAction>()? {
            EncoderAction::ResetEncoder => self.reset(),
            EncoderAction::SetDirection { direction } => {
                self.set_direction(direction)?;
                info!(device = %self.id, direction, "encoder direction set");
            }
        }
        Ok(Ack::accepted(&command.command_id, &self.id))
    }
}

impl WheelFeedback for Encoder {
    fn distance(&self) -> f64 {
        self.state.lock().ticks as f64 * self.distance_per_tick
    }

    fn ticks(&self) -> i64 {
        self.state.lock().ticks
    }

    fn set_direction_hint(&self, direction: i8) {
        if self.mode == EncoderMode::SingleChannel
            && let Err(e) = self.set_direction(direction)
        {
            warn!(device = %self.id, error = %e, "ignoring direction hint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn single() -> Encoder {
        let enc = Encoder::new(EncoderConfig::new("left_encoder", 17));
        enc.initialize().unwrap();
        enc
    }

    fn quadrature() -> Encoder {
        let mut cfg = EncoderConfig::new("left_encoder", 17);
        cfg.pin_b = Some(18);
        let enc = Encoder::new(cfg);
        enc.initialize().unwrap();
        enc
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn distance_per_tick_follows_wheel_geometry() {
        let enc = single();
        assert_relative_eq!(enc.distance_per_tick(), PI * 0.1 / 1000.0, epsilon = 1e-12);
    }

    #[test]
    fn single_channel_counts_both_edges_in_flag_direction() {
        let enc = single();
        let t0 = Instant::now();
        assert!(enc.on_edge(Channel::A, true, t0));
        assert!(enc.on_edge(Channel::A, false, t0 + ms(2)));
        enc.set_direction(-1).unwrap();
        assert!(enc.on_edge(Channel::A, true, t0 + ms(4)));
        let r = enc.reading_at(t0 + ms(4));
        assert_eq!(r.tick_count, 1);
        assert!(r.direction_ambiguous);
        assert_eq!(r.interrupt_count, 3);
    }

    #[test]
    fn non_transitions_and_channel_b_are_ignored_in_single_mode() {
        let enc = single();
        let t0 = Instant::now();
        assert!(!enc.on_edge(Channel::A, false, t0));
        assert!(!enc.on_edge(Channel::B, true, t0 + ms(5)));
        assert_eq!(enc.ticks(), 0);
    }

    #[test]
    fn bounces_inside_the_debounce_window_are_rejected() {
        let enc = single();
        let t0 = Instant::now();
        assert!(enc.on_edge(Channel::A, true, t0));
        assert!(!enc.on_edge(Channel::A, false, t0 + Duration::from_micros(300)));
        // The bounce did not change the stored level, so its echo is a non-transition.
        assert!(!enc.on_edge(Channel::A, true, t0 + Duration::from_micros(600)));
        assert!(enc.on_edge(Channel::A, false, t0 + ms(2)));
        assert_eq!(enc.ticks(), 2);
    }

    #[test]
    fn quadrature_phase_sets_direction() {
        let enc = quadrature();
        let t0 = Instant::now();
        // Forward sequence: A rises, B rises, A falls, B falls.
        enc.on_edge(Channel::A, true, t0);
        enc.on_edge(Channel::B, true, t0 + ms(2));
        enc.on_edge(Channel::A, false, t0 + ms(4));
        enc.on_edge(Channel::B, false, t0 + ms(6));
        let r = enc.reading_at(t0 + ms(6));
        assert_eq!(r.tick_count, 4);
        assert_eq!(r.direction, 1);
        assert!(!r.direction_ambiguous);

        // Reverse sequence: B rises first.
        enc.on_edge(Channel::B, true, t0 + ms(8));
        enc.on_edge(Channel::A, true, t0 + ms(10));
        let r = enc.reading_at(t0 + ms(10));
        assert_eq!(r.tick_count, 2);
        assert_eq!(r.direction, -1);
    }

    #[test]
    fn velocity_uses_only_the_sliding_window() {
        let enc = single();
        let t0 = Instant::now();
        let mut level = false;
        for i in 0..=50u64 {
            level = !level;
            enc.on_edge(Channel::A, level, t0 + ms(i * 2));
        }
        // 50 ticks over the last 100 ms → 500 ticks/s.
        let r = enc.reading_at(t0 + ms(100));
        assert_relative_eq!(r.velocity, 500.0 * enc.distance_per_tick(), max_relative = 1e-9);
        assert!(r.rpm > 0.0);

        // Long after the last edge the window is empty.
        let later = enc.reading_at(t0 + ms(1000));
        assert_eq!(later.velocity, 0.0);
        assert_eq!(later.last_edge_age_ms, Some(900));
    }

    #[test]
    fn single_sample_means_zero_velocity() {
        let enc = single();
        let t0 = Instant::now();
        enc.on_edge(Channel::A, true, t0);
        assert_eq!(enc.reading_at(t0).velocity, 0.0);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut window = TickWindow::new(4);
        let t0 = Instant::now();
        for i in 0..10 {
            window.push(t0 + ms(i), i as i64);
        }
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn commands_reset_and_set_direction() {
        let enc = single();
        enc.inject_ticks(120, Instant::now());
        enc.execute_command(&Command::new("reset_encoder", serde_json::Value::Null)).unwrap();
        assert_eq!(enc.ticks(), 0);
        assert_eq!(enc.reading_at(Instant::now()).resets, 1);

        enc.execute_command(&Command::new("set_direction", json!({"direction": -1}))).unwrap();
        enc.on_edge(Channel::A, true, Instant::now());
        assert_eq!(enc.ticks(), -1);

        let bad = enc.execute_command(&Command::new("set_direction", json!({"direction": 3})));
        assert!(matches!(bad, Err(HalError::Validation(_))));
        let unknown = enc.execute_command(&Command::new("spin", serde_json::Value::Null));
        assert!(matches!(unknown, Err(HalError::Validation(_))));
    }

    #[test]
    fn reads_require_ready() {
        let enc = Encoder::new(EncoderConfig::new("e", 17));
        assert!(enc.read_data().is_err());
        enc.initialize().unwrap();
        assert!(enc.read_data().is_ok());
        enc.shutdown();
        assert!(enc.read_data().is_err());
    }
}
