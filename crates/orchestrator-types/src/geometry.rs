//! Angle helpers shared by ranging queries, safety zones and odometry.

use std::f64::consts::TAU;

/// Normalise an angle in degrees into `[0, 360)`.
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid rounds tiny negatives up to exactly 360.0
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Normalise an angle in radians into `[0, 2π)`.
pub fn normalize_radians(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    if wrapped >= TAU { 0.0 } else { wrapped }
}

/// An angular sector in degrees, inclusive at both ends.
///
/// Bounds may be given outside `[0, 360)`; `-45..45` becomes the sector
/// that wraps through zero.  A span of 360° or more covers the full circle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngularSector {
    start: f64,
    end: f64,
    full_circle: bool,
}

impl AngularSector {
    pub fn new(angle_min: f64, angle_max: f64) -> Self {
        Self {
            start: normalize_degrees(angle_min),
            end: normalize_degrees(angle_max),
            full_circle: angle_max - angle_min >= 360.0,
        }
    }

    pub fn contains(&self, angle: f64) -> bool {
        if self.full_circle {
            return true;
        }
        let a = normalize_degrees(angle);
        if self.start <= self.end {
            a >= self.start && a <= self.end
        } else {
            a >= self.start || a <= self.end
        }
    }

    pub fn wraps(&self) -> bool {
        !self.full_circle && self.start > self.end
    }
}
