//! Differential-drive dead reckoning.
//!
//! Each integration step takes the distance travelled by the left and right
//! wheel since the previous step:
//!
//! ```text
//! d  = (dl + dr) / 2
//! dθ = (dr − dl) / wheel_base
//! x += d · cos θ
//! y += d · sin θ
//! θ  = normalize(θ + dθ)
//! v  = d / Δt,  ω = dθ / Δt      (0 when Δt ≤ 0)
//! ```
//!
//! # Example
//!
//! ```rust
//! use orchestrator_estimator::odometry::Odometry;
//!
//! let mut odom = Odometry::new(0.3);
//! let v = odom.integrate(0.1, 0.1, 0.1);
//! assert!((v.linear - 1.0).abs() < 1e-9);
//! assert!((odom.pose().x - 0.1).abs() < 1e-9);
//! ```

use chrono::Utc;
use orchestrator_types::{Pose, Velocity, normalize_radians};
use tokio::time::Instant;

// ────────────────────────────────────────────────────────────────────────────
// Integrator
// ────────────────────────────────────────────────────────────────────────────

/// Pose integrator for a two-wheeled robot.
#[derive(Debug, Clone)]
pub struct Odometry {
    wheel_base: f64,
    pose: Pose,
    velocity: Velocity,
    update_count: u64,
}

impl Odometry {
    /// `wheel_base` is the distance between the wheel contact points, metres.
    pub fn new(wheel_base: f64) -> Self {
        Self {
            wheel_base,
            pose: Pose::origin(),
            velocity: Velocity::default(),
            update_count: 0,
        }
    }

    pub fn wheel_base(&self) -> f64 {
        self.wheel_base
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn velocity(&self) -> Velocity {
        self.velocity
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Advance the pose by one pair of wheel deltas observed over `dt`
    /// seconds and return the resulting velocity.
    pub fn integrate(&mut self, delta_left: f64, delta_right: f64, dt: f64) -> Velocity {
        let distance = (delta_left + delta_right) / 2.0;
        let dtheta = (delta_right - delta_left) / self.wheel_base;

        let heading = self.pose.heading;
        self.pose.x += distance * heading.cos();
        self.pose.y += distance * heading.sin();
        self.pose.heading = normalize_radians(heading + dtheta);
        self.pose.timestamp = Utc::now();

        self.velocity = if dt > 0.0 {
            Velocity {
                linear: distance / dt,
                angular: dtheta / dt,
            }
        } else {
            Velocity::default()
        };
        self.update_count += 1;
        self.velocity
    }

    /// Back to the origin, at rest.
    pub fn reset(&mut self) {
        self.pose = Pose::origin();
        self.velocity = Velocity::default();
    }

    /// Force the pose; `heading` in radians.
    pub fn set_pose(&mut self, x: f64, y: f64, heading: f64) {
        self.pose = Pose::new(x, y, heading);
    }

    pub fn stop(&mut self) {
        self.velocity = Velocity::default();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Wheel pairing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

/// One integration step ready to be applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelDeltas {
    pub left: f64,
    pub right: f64,
    /// Seconds since the previous step; 0 for the first one.
    pub dt: f64,
}

/// Turns independently arriving cumulative wheel distances into delta
/// pairs.  A pair is produced once both sides have reported since the
/// previous pair.
#[derive(Debug, Clone, Default)]
pub struct WheelPairing {
    latest: [Option<f64>; 2],
    baseline: [f64; 2],
    fresh: [bool; 2],
    resets: [u64; 2],
    last_pair: Option<Instant>,
}

impl WheelPairing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the cumulative distance of one wheel observed at `at`.
    ///
    /// `resets` is the encoder's reset counter.  When it changes the total
    /// restarted from zero, so that side is rebased and only travel since
    /// the last pair is counted.
    pub fn update(
        &mut self,
        side: Side,
        total_distance: f64,
        resets: u64,
        at: Instant,
    ) -> Option<WheelDeltas> {
        let i = side.index();
        if resets != self.resets[i] {
            if let Some(previous) = self.latest[i] {
                self.baseline[i] -= previous;
            }
            self.resets[i] = resets;
        }
        self.latest[i] = Some(total_distance);
        self.fresh[i] = true;
        if !(self.fresh[0] && self.fresh[1]) {
            return None;
        }
        let (Some(left), Some(right)) = (self.latest[0], self.latest[1]) else {
            return None;
        };
        let dt = self
            .last_pair
            .map_or(0.0, |prev| at.saturating_duration_since(prev).as_secs_f64());
        let deltas = WheelDeltas {
            left: left - self.baseline[0],
            right: right - self.baseline[1],
            dt,
        };
        self.baseline = [left, right];
        self.fresh = [false, false];
        self.last_pair = Some(at);
        Some(deltas)
    }

    /// Treat the latest totals as the new zero so past travel is not
    /// integrated again.
    pub fn rebase(&mut self) {
        for i in 0..2 {
            if let Some(total) = self.latest[i] {
                self.baseline[i] = total;
            }
        }
        self.fresh = [false, false];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI, TAU};
    use std::time::Duration;

    #[test]
    fn straight_line() {
        let mut odom = Odometry::new(0.3);
        let v = odom.integrate(0.1, 0.1, 0.1);
        assert_relative_eq!(v.linear, 1.0, epsilon = 1e-12);
        assert_relative_eq!(v.angular, 0.0);
        assert_relative_eq!(odom.pose().x, 0.1, epsilon = 1e-12);
        assert_relative_eq!(odom.pose().y, 0.0);
        assert_relative_eq!(odom.pose().heading, 0.0);
        assert_eq!(odom.update_count(), 1);
    }

    #[test]
    fn turn() {
        let mut odom = Odometry::new(0.3);
        let v = odom.integrate(0.05, 0.15, 0.1);
        assert_relative_eq!(odom.pose().heading, 0.1 / 0.3, epsilon = 1e-12);
        assert_relative_eq!(v.angular, 0.1 / 0.3 / 0.1, epsilon = 1e-9);
        assert_relative_eq!(odom.pose().x, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn heading_wraps_into_range() {
        let mut odom = Odometry::new(0.3);
        // Right turn in place: negative dθ.
        odom.integrate(0.15, -0.15, 0.1);
        let heading = odom.pose().heading;
        assert!((0.0..TAU).contains(&heading));
        assert_relative_eq!(heading, TAU - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn non_positive_dt_zeroes_velocity() {
        let mut odom = Odometry::new(0.3);
        let v = odom.integrate(0.1, 0.2, 0.0);
        assert_eq!(v, Velocity::default());
        let v = odom.integrate(0.1, 0.2, -1.0);
        assert_eq!(v, Velocity::default());
        assert!(odom.pose().x > 0.0);
    }

    #[test]
    fn square_path_returns_home() {
        let wheel_base = 0.3;
        let mut odom = Odometry::new(wheel_base);
        let arc = wheel_base / 2.0 * FRAC_PI_2;
        for _ in 0..4 {
            odom.integrate(1.0, 1.0, 1.0);
            odom.integrate(-arc, arc, 1.0);
        }
        let pose = odom.pose();
        assert!(pose.x.abs() < 1e-9, "x = {}", pose.x);
        assert!(pose.y.abs() < 1e-9, "y = {}", pose.y);
        let heading_error = pose.heading.min(TAU - pose.heading);
        assert!(heading_error < 1e-9, "heading = {}", pose.heading);
    }

    #[test]
    fn reset_and_set_pose() {
        let mut odom = Odometry::new(0.3);
        odom.integrate(0.5, 0.6, 0.5);
        odom.reset();
        assert_relative_eq!(odom.pose().x, 0.0);
        assert_eq!(odom.velocity(), Velocity::default());

        odom.set_pose(1.0, 2.0, -FRAC_PI_2);
        assert_relative_eq!(odom.pose().heading, 1.5 * PI);
        odom.integrate(1.0, 1.0, 1.0);
        assert_relative_eq!(odom.pose().y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn pairing_waits_for_both_sides() {
        let t0 = Instant::now();
        let mut pairing = WheelPairing::new();
        assert!(pairing.update(Side::Left, 0.1, 0, t0).is_none());
        assert!(pairing.update(Side::Left, 0.2, 0, t0).is_none());
        let first = pairing.update(Side::Right, 0.1, 0, t0).unwrap();
        assert_relative_eq!(first.left, 0.2);
        assert_relative_eq!(first.right, 0.1);
        assert_relative_eq!(first.dt, 0.0);

        let t1 = t0 + Duration::from_millis(100);
        assert!(pairing.update(Side::Right, 0.3, 0, t1).is_none());
        let second = pairing.update(Side::Left, 0.25, 0, t1).unwrap();
        assert_relative_eq!(second.left, 0.05, epsilon = 1e-12);
        assert_relative_eq!(second.right, 0.2, epsilon = 1e-12);
        assert_relative_eq!(second.dt, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn rebase_forgets_past_travel() {
        let t0 = Instant::now();
        let mut pairing = WheelPairing::new();
        pairing.update(Side::Left, 1.0, 0, t0);
        pairing.rebase();
        pairing.update(Side::Right, 2.0, 0, t0);
        pairing.rebase();
        pairing.update(Side::Left, 1.5, 0, t0);
        let deltas = pairing.update(Side::Right, 2.5, 0, t0).unwrap();
        assert_relative_eq!(deltas.left, 0.5);
        assert_relative_eq!(deltas.right, 0.5);
    }

    #[test]
    fn encoder_reset_keeps_unpaired_travel() {
        let t0 = Instant::now();
        let mut pairing = WheelPairing::new();
        pairing.update(Side::Left, 2.0, 0, t0);
        pairing.update(Side::Right, 2.0, 0, t0).unwrap();

        // Left rolls 0.1 m, is reset, then rolls another 0.05 m.
        pairing.update(Side::Left, 2.1, 0, t0);
        pairing.update(Side::Left, 0.05, 1, t0);
        let deltas = pairing.update(Side::Right, 2.15, 0, t0).unwrap();
        assert_relative_eq!(deltas.left, 0.15, epsilon = 1e-12);
        assert_relative_eq!(deltas.right, 0.15, epsilon = 1e-12);

        // Going backwards is not a reset.
        pairing.update(Side::Left, 0.0, 1, t0);
        let deltas = pairing.update(Side::Right, 2.1, 0, t0).unwrap();
        assert_relative_eq!(deltas.left, -0.05, epsilon = 1e-12);
        assert_relative_eq!(deltas.right, -0.05, epsilon = 1e-12);
    }
}
