//! Ranging scans and the telemetry shape that carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HalError;
use crate::geometry::AngularSector;

/// Validity limits applied to individual scan points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanLimits {
    pub min_range: f64,
    pub max_range: f64,
    pub min_quality: u8,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            min_range: 0.15,
            max_range: 12.0,
            min_quality: 0,
        }
    }
}

/// One point of a scan, angle in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPoint {
    pub range: f64,
    pub angle: f64,
    pub quality: u8,
}

/// Closest violating point inside a sector plus the number of points below
/// the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectorHit {
    pub distance: f64,
    pub angle: f64,
    pub count: usize,
}

/// A full 360° sweep stored as parallel arrays of equal length.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub timestamp: DateTime<Utc>,
    ranges: Vec<f64>,
    angles: Vec<f64>,
    quality: Vec<u8>,
    pub scan_duration: f64,
    limits: ScanLimits,
}

impl Scan {
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] when the three arrays differ in
    /// length.
    pub fn new(
        timestamp: DateTime<Utc>,
        ranges: Vec<f64>,
        angles: Vec<f64>,
        quality: Vec<u8>,
        scan_duration: f64,
    ) -> Result<Self, HalError> {
        if ranges.len() != angles.len() || ranges.len() != quality.len() {
            return Err(HalError::validation(format!(
                "scan arrays differ in length: ranges={} angles={} quality={}",
                ranges.len(),
                angles.len(),
                quality.len()
            )));
        }
        Ok(Self {
            timestamp,
            ranges,
            angles,
            quality,
            scan_duration,
            limits: ScanLimits::default(),
        })
    }

    pub fn with_limits(mut self, limits: ScanLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> ScanLimits {
        self.limits
    }

    pub fn ranges(&self) -> &[f64] {
        &self.ranges
    }

    pub fn angles(&self) -> &[f64] {
        &self.angles
    }

    pub fn quality(&self) -> &[u8] {
        &self.quality
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Points that fall within the range and quality limits.
    pub fn valid_points(&self) -> impl Iterator<Item = ScanPoint> + '_ {
        let limits = self.limits;
        self.ranges
            .iter()
            .zip(&self.angles)
            .zip(&self.quality)
            .map(|((&range, &angle), &quality)| ScanPoint { range, angle, quality })
            .filter(move |p| {
                p.range.is_finite()
                    && p.range >= limits.min_range
                    && p.range <= limits.max_range
                    && p.quality >= limits.min_quality
            })
    }

    pub fn valid_point_count(&self) -> usize {
        self.valid_points().count()
    }

    /// Minimum valid range and its angle, `None` when no point is valid.
    pub fn closest_obstacle(&self) -> Option<(f64, f64)> {
        self.valid_points()
            .fold(None, |best: Option<ScanPoint>, p| match best {
                Some(b) if b.range <= p.range => Some(b),
                _ => Some(p),
            })
            .map(|p| (p.range, p.angle))
    }

    /// Whether any valid point inside `sector` is closer than `min_distance`.
    pub fn is_obstacle_detected(&self, min_distance: f64, sector: AngularSector) -> bool {
        self.valid_points()
            .any(|p| p.range < min_distance && sector.contains(p.angle))
    }

    /// All valid `(distance, angle)` pairs inside the sector up to
    /// `max_distance`.
    pub fn obstacles_in_sector(&self, sector: AngularSector, max_distance: f64) -> Vec<(f64, f64)> {
        self.valid_points()
            .filter(|p| p.range <= max_distance && sector.contains(p.angle))
            .map(|p| (p.range, p.angle))
            .collect()
    }

    /// Closest point inside `sector` that is below `threshold`, without
    /// allocating.
    pub fn sector_minimum(&self, sector: AngularSector, threshold: f64) -> Option<SectorHit> {
        let mut hit: Option<SectorHit> = None;
        for p in self.valid_points() {
            if p.range >= threshold || !sector.contains(p.angle) {
                continue;
            }
            match hit.as_mut() {
                Some(h) => {
                    h.count += 1;
                    if p.range < h.distance {
                        h.distance = p.range;
                        h.angle = p.angle;
                    }
                }
                None => {
                    hit = Some(SectorHit {
                        distance: p.range,
                        angle: p.angle,
                        count: 1,
                    })
                }
            }
        }
        hit
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry payload
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosestObstacle {
    pub distance: f64,
    pub angle: f64,
}

/// Obstacle counts within 2 m for the four coarse sectors around the robot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorCounts {
    pub front: usize,
    pub left: usize,
    pub rear: usize,
    pub right: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanStatistics {
    pub scan_count: u64,
    pub attempts: u64,
    pub scan_failures: u64,
    pub communication_errors: u64,
    pub error_rate: f64,
}

/// `data` field of a ranging sensor's telemetry sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReading {
    pub scan_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ranges: Vec<f64>,
    #[serde(default)]
    pub angles: Vec<f64>,
    #[serde(default)]
    pub quality: Vec<u8>,
    #[serde(default)]
    pub limits: Option<ScanLimits>,
    #[serde(default)]
    pub scan_duration: f64,
    #[serde(default)]
    pub closest_obstacle: Option<ClosestObstacle>,
    #[serde(default)]
    pub obstacle_zones: SectorCounts,
    #[serde(default)]
    pub statistics: ScanStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanReading {
    /// A reading that reports no usable scan.
    pub fn unavailable(reason: impl Into<String>, statistics: ScanStatistics) -> Self {
        Self {
            scan_available: false,
            error: Some(reason.into()),
            statistics,
            ..Self::default()
        }
    }

    /// Turn this reading back into the [`Scan`] it carries, moving the
    /// point arrays.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] when no scan is available or the
    /// arrays are inconsistent.
    pub fn into_scan(self) -> Result<Scan, HalError> {
        if !self.scan_available {
            return Err(HalError::validation(
                self.error.unwrap_or_else(|| "scan not available".to_string()),
            ));
        }
        let scan = Scan::new(
            self.scan_timestamp.unwrap_or_else(Utc::now),
            self.ranges,
            self.angles,
            self.quality,
            self.scan_duration,
        )?;
        if scan.is_empty() {
            return Err(HalError::validation("scan has no points"));
        }
        Ok(match self.limits {
            Some(limits) => scan.with_limits(limits),
            None => scan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(points: &[(f64, f64)]) -> Scan {
        let ranges = points.iter().map(|p| p.0).collect();
        let angles = points.iter().map(|p| p.1).collect();
        let quality = vec![100; points.len()];
        Scan::new(Utc::now(), ranges, angles, quality, 0.1).unwrap()
    }

    #[test]
    fn mismatched_arrays_are_rejected() {
        let err = Scan::new(Utc::now(), vec![1.0, 2.0], vec![0.0], vec![10, 10], 0.1).unwrap_err();
        assert!(matches!(err, HalError::Validation(_)));
    }

    #[test]
    fn closest_obstacle_skips_out_of_range_points() {
        let s = scan(&[(0.05, 10.0), (1.2, 20.0), (0.8, 30.0), (50.0, 40.0)]);
        assert_eq!(s.closest_obstacle(), Some((0.8, 30.0)));
    }

    #[test]
    fn low_quality_points_are_ignored() {
        let s = Scan::new(Utc::now(), vec![0.5, 1.0], vec![0.0, 10.0], vec![2, 50], 0.1)
            .unwrap()
            .with_limits(ScanLimits {
                min_quality: 10,
                ..ScanLimits::default()
            });
        assert_eq!(s.closest_obstacle(), Some((1.0, 10.0)));
    }

    #[test]
    fn empty_scan_has_no_closest_obstacle() {
        assert_eq!(scan(&[]).closest_obstacle(), None);
    }

    #[test]
    fn obstacle_detection_wraps_through_zero() {
        let s = scan(&[(0.4, 355.0), (3.0, 0.0)]);
        assert!(s.is_obstacle_detected(0.5, AngularSector::new(-30.0, 30.0)));
        assert!(!s.is_obstacle_detected(0.5, AngularSector::new(60.0, 120.0)));
    }

    #[test]
    fn obstacles_in_sector_filters_distance() {
        let s = scan(&[(0.4, 90.0), (1.9, 100.0), (2.5, 110.0), (0.3, 200.0)]);
        let hits = s.obstacles_in_sector(AngularSector::new(60.0, 120.0), 2.0);
        assert_eq!(hits, vec![(0.4, 90.0), (1.9, 100.0)]);
    }

    #[test]
    fn sector_minimum_counts_points_below_threshold() {
        let s = scan(&[(0.45, 350.0), (0.3, 0.0), (0.9, 10.0), (0.2, 180.0)]);
        let hit = s.sector_minimum(AngularSector::new(-45.0, 45.0), 0.5).unwrap();
        assert_eq!(hit.count, 2);
        assert_eq!(hit.distance, 0.3);
        assert_eq!(hit.angle, 0.0);
    }

    #[test]
    fn unavailable_reading_does_not_yield_a_scan() {
        let reading = ScanReading::unavailable("no data", ScanStatistics::default());
        assert!(reading.into_scan().is_err());
    }
}
