//! Simulated hardware backends for running the full stack without a robot.
//!
//! | Backend | Stands in for |
//! |---|---|
//! | [`SimWheel`] | motor driver (direction pin + PWM) and the wheel it turns; optionally drives an [`Encoder`] |
//! | [`SimLidar`] | serial ranging sensor producing 360-point sweeps |
//!
//! Both carry fault injection hooks so tests can exercise error paths.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orchestrator_types::{AngularSector, HalError, Scan};
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};

use crate::device::{TaskHandle, period_for};
use crate::encoder::Encoder;
use crate::lidar::ScanSource;
use crate::motor::{MotorDriver, WheelFeedback};

// ────────────────────────────────────────────────────────────────────────────
// Wheel
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct WheelState {
    forward: bool,
    duty: f64,
    distance: f64,
    emitted_ticks: i64,
    released: bool,
    fail_init: bool,
    fault: Option<String>,
    stalled: bool,
}

/// A wheel whose speed follows the PWM duty instantly.
pub struct SimWheel {
    id: String,
    max_speed: f64,
    encoder: Option<Arc<Encoder>>,
    state: Mutex<WheelState>,
}

impl SimWheel {
    pub fn new(id: impl Into<String>, max_speed: f64) -> Self {
        Self {
            id: id.into(),
            max_speed,
            encoder: None,
            state: Mutex::new(WheelState {
                forward: true,
                ..WheelState::default()
            }),
        }
    }

    /// Feed travelled distance into `encoder` as ticks.
    pub fn with_encoder(mut self, encoder: Arc<Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn fail_init(&self, fail: bool) {
        self.state.lock().fail_init = fail;
    }

    /// Make every following driver call fail.
    pub fn inject_fault(&self, details: impl Into<String>) {
        self.state.lock().fault = Some(details.into());
    }

    pub fn clear_fault(&self) {
        self.state.lock().fault = None;
    }

    /// A stalled wheel accepts commands but does not turn.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    pub fn duty(&self) -> f64 {
        self.state.lock().duty
    }

    /// Signed ground speed, m/s.
    pub fn speed(&self) -> f64 {
        let s = self.state.lock();
        if s.stalled || s.released {
            return 0.0;
        }
        let sign = if s.forward { 1.0 } else { -1.0 };
        s.duty / 100.0 * self.max_speed * sign
    }

    /// Integrate motion over `dt`.
    pub fn advance(&self, dt: Duration) {
        let speed = self.speed();
        let ticks = {
            let mut s = self.state.lock();
            s.distance += speed * dt.as_secs_f64();
            self.encoder.as_ref().map(|enc| {
                let total = (s.distance / enc.distance_per_tick()).trunc() as i64;
                let delta = total - s.emitted_ticks;
                s.emitted_ticks = total;
                (enc.clone(), delta)
            })
        };
        if let Some((encoder, delta)) = ticks {
            encoder.inject_ticks(delta, Instant::now());
        }
    }

    /// Advance the wheel in real time at `rate_hz` until stopped.
    pub fn spawn(self: Arc<Self>, rate_hz: f64) -> TaskHandle {
        let name = format!("sim:{}", self.id);
        TaskHandle::spawn(name, move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(period_for(rate_hz));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = Instant::now();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                let now = Instant::now();
                self.advance(now.saturating_duration_since(last));
                last = now;
            }
        })
    }

    fn check(&self) -> Result<(), HalError> {
        match &self.state.lock().fault {
            Some(details) => Err(HalError::hardware(&self.id, details.clone())),
            None => Ok(()),
        }
    }
}

impl MotorDriver for SimWheel {
    fn init(&self) -> Result<(), HalError> {
        let mut s = self.state.lock();
        if s.fail_init {
            return Err(HalError::hardware(&self.id, "GPIO setup failed"));
        }
        s.released = false;
        s.duty = 0.0;
        Ok(())
    }

    fn set_direction(&self, forward: bool) -> Result<(), HalError> {
        self.check()?;
        self.state.lock().forward = forward;
        Ok(())
    }

    fn set_duty_cycle(&self, duty: f64) -> Result<(), HalError> {
        self.check()?;
        self.state.lock().duty = duty.clamp(0.0, 100.0);
        Ok(())
    }

    fn release(&self) {
        let mut s = self.state.lock();
        s.duty = 0.0;
        s.released = true;
    }
}

impl WheelFeedback for SimWheel {
    fn distance(&self) -> f64 {
        self.state.lock().distance
    }

    fn ticks(&self) -> i64 {
        match &self.encoder {
            Some(enc) => enc.ticks(),
            None => self.state.lock().emitted_ticks,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Ranging sensor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Obstacle {
    sector: AngularSector,
    distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Backdrop {
    /// A room with two objects and a wall segment plus a little noise.
    Room,
    /// Nothing but free space at a fixed distance.
    Open(f64),
}

#[derive(Debug)]
struct SimLidarState {
    backdrop: Backdrop,
    obstacles: Vec<Obstacle>,
    open: bool,
    fail_open: bool,
    failures_pending: u32,
    sweeps: u64,
}

/// A 360-point, 1° ranging sensor.
pub struct SimLidar {
    state: Mutex<SimLidarState>,
}

impl Default for SimLidar {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLidar {
    /// The default room: objects at 80–100° (0.8 m) and 170–190° (1.5 m), a
    /// wall at 260–280° (2 m) and open space around 5 m elsewhere.
    pub fn new() -> Self {
        Self::with_backdrop(Backdrop::Room)
    }

    /// Empty space at `distance` in every direction, without noise.
    pub fn open_space(distance: f64) -> Self {
        Self::with_backdrop(Backdrop::Open(distance))
    }

    fn with_backdrop(backdrop: Backdrop) -> Self {
        Self {
            state: Mutex::new(SimLidarState {
                backdrop,
                obstacles: Vec::new(),
                open: false,
                fail_open: false,
                failures_pending: 0,
                sweeps: 0,
            }),
        }
    }

    /// Add an object covering `angle_min..=angle_max` (degrees, may wrap).
    pub fn place_obstacle(&self, angle_min: f64, angle_max: f64, distance: f64) {
        self.state.lock().obstacles.push(Obstacle {
            sector: AngularSector::new(angle_min, angle_max),
            distance,
        });
    }

    pub fn clear_obstacles(&self) {
        self.state.lock().obstacles.clear();
    }

    /// Fail the next `n` acquisitions with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures_pending = n;
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    fn backdrop_range(backdrop: Backdrop, angle: f64, sweep: u64) -> f64 {
        match backdrop {
            Backdrop::Open(distance) => distance,
            Backdrop::Room => {
                if (80.0..=100.0).contains(&angle) {
                    0.8 + 0.1 * (angle * 0.1).sin()
                } else if (170.0..=190.0).contains(&angle) {
                    1.5 + 0.2 * (angle * 0.05).cos()
                } else if (260.0..=280.0).contains(&angle) {
                    2.0 + 0.05 * (angle * 0.2).sin()
                } else {
                    let jitter = ((angle as u64 * 7 + sweep * 13) % 100) as f64;
                    5.0 + 2.0 * (angle * 0.02).sin() + 0.1 * (jitter - 50.0) / 50.0
                }
            }
        }
    }
}

impl ScanSource for SimLidar {
    fn open(&self) -> Result<(), HalError> {
        let mut s = self.state.lock();
        if s.fail_open {
            return Err(HalError::hardware("sim_lidar", "serial port unavailable"));
        }
        s.open = true;
        Ok(())
    }

    fn acquire(&self) -> Result<Scan, HalError> {
        let mut s = self.state.lock();
        if !s.open {
            return Err(HalError::Connection("sim lidar port is closed".to_string()));
        }
        if s.failures_pending > 0 {
            s.failures_pending -= 1;
            return Err(HalError::Connection("sim lidar read timed out".to_string()));
        }
        s.sweeps += 1;
        let mut ranges = Vec::with_capacity(360);
        let mut angles = Vec::with_capacity(360);
        let mut quality = Vec::with_capacity(360);
        for i in 0..360u32 {
            let angle = f64::from(i);
            let range = s
                .obstacles
                .iter()
                .filter(|o| o.sector.contains(angle))
                .map(|o| o.distance)
                .fold(Self::backdrop_range(s.backdrop, angle, s.sweeps), f64::min);
            ranges.push(range);
            angles.push(angle);
            quality.push((200.0 - range * 10.0).clamp(0.0, 255.0) as u8);
        }
        Scan::new(Utc::now(), ranges, angles, quality, 0.1)
    }

    fn close(&self) {
        self.state.lock().open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use orchestrator_types::EncoderConfig;

    #[test]
    fn wheel_speed_follows_duty_and_direction() {
        let wheel = SimWheel::new("w", 2.0);
        wheel.set_duty_cycle(50.0).unwrap();
        assert!((wheel.speed() - 1.0).abs() < 1e-12);
        wheel.set_direction(false).unwrap();
        wheel.advance(Duration::from_millis(500));
        assert!((wheel.distance() + 0.5).abs() < 1e-12);
    }

    #[test]
    fn wheel_feeds_whole_ticks_to_its_encoder() {
        let encoder = Arc::new(Encoder::new(EncoderConfig::new("e", 17)));
        encoder.initialize().unwrap();
        let wheel = SimWheel::new("w", 1.0).with_encoder(encoder.clone());
        wheel.set_duty_cycle(100.0).unwrap();
        wheel.advance(Duration::from_millis(100));
        let expected = (0.1 / encoder.distance_per_tick()).trunc() as i64;
        assert_eq!(encoder.ticks(), expected);
        assert!((encoder.distance() - wheel.distance()).abs() <= encoder.distance_per_tick());
    }

    #[test]
    fn faults_and_stalls() {
        let wheel = SimWheel::new("w", 1.0);
        wheel.set_duty_cycle(100.0).unwrap();
        wheel.set_stalled(true);
        wheel.advance(Duration::from_secs(1));
        assert_eq!(wheel.distance(), 0.0);
        wheel.inject_fault("bridge overheated");
        assert!(matches!(wheel.set_duty_cycle(10.0), Err(HalError::Hardware { .. })));
        wheel.clear_fault();
        assert!(wheel.set_duty_cycle(10.0).is_ok());
    }

    #[test]
    fn room_sweep_matches_layout() {
        let lidar = SimLidar::new();
        lidar.open().unwrap();
        let scan = lidar.acquire().unwrap();
        assert_eq!(scan.len(), 360);
        assert!((scan.ranges()[90] - (0.8 + 0.1 * 9.0f64.sin())).abs() < 1e-12);
        assert!(scan.ranges()[0] > 4.0);
        assert!(scan.quality().iter().all(|&q| q > 0));
    }

    #[test]
    fn closed_port_refuses_to_scan() {
        let lidar = SimLidar::new();
        assert!(lidar.acquire().is_err());
        lidar.open().unwrap();
        lidar.close();
        assert!(lidar.acquire().is_err());
    }
}
