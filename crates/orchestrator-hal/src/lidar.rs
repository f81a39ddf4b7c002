//! 360° ranging sensor.
//!
//! An acquisition task pulls scans from a [`ScanSource`] at the configured
//! scan frequency and keeps the latest good one.  Queries and telemetry only
//! ever look at that scan, and only while it is younger than
//! `stale_after`; a failing source therefore degrades to "no data" rather
//! than to old data.

use std::sync::Arc;
use std::time::Duration;

use orchestrator_types::{
    AngularSector, Capability, ClosestObstacle, DeviceStatus, HalError, LidarConfig, Lifecycle,
    Scan, ScanLimits, ScanReading, ScanStatistics, SectorCounts, TelemetrySample,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::device::{Device, LifecycleCell, Sensor, TaskHandle, period_for};

/// Radius of the coarse sector counts in readings, metres.
pub const SECTOR_COUNT_RANGE: f64 = 2.0;

/// Where scans come from: a serial protocol driver, a replay file, a
/// simulator.
pub trait ScanSource: Send + Sync {
    /// # Errors
    ///
    /// Returns [`HalError::Hardware`] or [`HalError::Connection`] when the
    /// device cannot be opened.
    fn open(&self) -> Result<(), HalError>;

    /// Read one complete sweep.
    fn acquire(&self) -> Result<Scan, HalError>;

    fn close(&self);
}

#[derive(Debug, Default)]
struct LidarState {
    latest: Option<(Scan, Instant)>,
    stats: ScanStatistics,
}

impl LidarState {
    fn update_error_rate(&mut self) {
        let s = &mut self.stats;
        s.error_rate = if s.attempts == 0 {
            0.0
        } else {
            (s.scan_failures + s.communication_errors) as f64 / s.attempts as f64
        };
    }
}

pub struct Lidar {
    id: String,
    config: LidarConfig,
    source: Arc<dyn ScanSource>,
    lifecycle: LifecycleCell,
    state: Mutex<LidarState>,
}

impl Lidar {
    pub fn new(config: LidarConfig, source: Arc<dyn ScanSource>) -> Self {
        Self {
            id: config.name.clone(),
            config,
            source,
            lifecycle: LifecycleCell::default(),
            state: Mutex::new(LidarState::default()),
        }
    }

    pub fn config(&self) -> &LidarConfig {
        &self.config
    }

    pub fn limits(&self) -> ScanLimits {
        ScanLimits {
            min_range: self.config.min_range,
            max_range: self.config.max_range,
            min_quality: self.config.quality_threshold,
        }
    }

    fn stale_after(&self) -> Duration {
        Duration::from_secs_f64(self.config.stale_after_secs)
    }

    /// Pull one scan from the source and keep it if it is usable.
    ///
    /// # Errors
    ///
    /// Propagates the source error, or [`HalError::Validation`] for an empty
    /// scan.  Either way the counters are updated and the previous scan is
    /// kept.
    pub fn acquire_once(&self) -> Result<(), HalError> {
        let result = self.source.acquire().and_then(|scan| {
            if scan.is_empty() {
                Err(HalError::validation("scan has no points"))
            } else {
                Ok(scan.with_limits(self.limits()))
            }
        });

        let mut state = self.state.lock();
        state.stats.attempts += 1;
        let outcome = match result {
            Ok(scan) => {
                state.stats.scan_count += 1;
                state.latest = Some((scan, Instant::now()));
                Ok(())
            }
            Err(e) => {
                match e {
                    HalError::Connection(_) | HalError::Timeout { .. } => {
                        state.stats.communication_errors += 1
                    }
                    _ => state.stats.scan_failures += 1,
                }
                Err(e)
            }
        };
        state.update_error_rate();
        outcome
    }

    /// Run `f` on the latest scan if it is still fresh.
    pub fn with_fresh_scan<R>(&self, f: impl FnOnce(&Scan) -> R) -> Option<R> {
        let state = self.state.lock();
        let (scan, at) = state.latest.as_ref()?;
        (at.elapsed() <= self.stale_after()).then(|| f(scan))
    }

    pub fn current_scan(&self) -> Option<Scan> {
        self.with_fresh_scan(Scan::clone)
    }

    /// `(distance, angle)` of the closest valid point.
    pub fn get_closest_obstacle(&self) -> Option<(f64, f64)> {
        self.with_fresh_scan(Scan::closest_obstacle).flatten()
    }

    pub fn is_obstacle_detected(&self, min_distance: f64, angle_min: f64, angle_max: f64) -> bool {
        let sector = AngularSector::new(angle_min, angle_max);
        self.with_fresh_scan(|scan| scan.is_obstacle_detected(min_distance, sector))
            .unwrap_or(false)
    }

    pub fn get_obstacles_in_zone(&self, angle_min: f64, angle_max: f64, max_distance: f64) -> Vec<(f64, f64)> {
        let sector = AngularSector::new(angle_min, angle_max);
        self.with_fresh_scan(|scan| scan.obstacles_in_sector(sector, max_distance))
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> ScanStatistics {
        self.state.lock().stats.clone()
    }

    /// Telemetry payload for the current scan.
    pub fn reading(&self) -> ScanReading {
        let stats = self.statistics();
        self.with_fresh_scan(|scan| ScanReading {
            scan_available: true,
            scan_timestamp: Some(scan.timestamp),
            ranges: scan.ranges().to_vec(),
            angles: scan.angles().to_vec(),
            quality: scan.quality().to_vec(),
            limits: Some(scan.limits()),
            scan_duration: scan.scan_duration,
            closest_obstacle: scan
                .closest_obstacle()
                .map(|(distance, angle)| ClosestObstacle { distance, angle }),
            obstacle_zones: sector_counts(scan),
            statistics: stats.clone(),
            error: None,
        })
        .unwrap_or_else(|| {
            ScanReading::unavailable(
                format!("no scan within the last {:.1} s", self.config.stale_after_secs),
                stats,
            )
        })
    }
}

/// Valid points within [`SECTOR_COUNT_RANGE`] per coarse sector.
pub fn sector_counts(scan: &Scan) -> SectorCounts {
    let front = AngularSector::new(-30.0, 30.0);
    let left = AngularSector::new(60.0, 120.0);
    let rear = AngularSector::new(150.0, 210.0);
    let right = AngularSector::new(240.0, 300.0);
    let mut counts = SectorCounts::default();
    for p in scan.valid_points().filter(|p| p.range <= SECTOR_COUNT_RANGE) {
        if front.contains(p.angle) {
            counts.front += 1;
        } else if left.contains(p.angle) {
            counts.left += 1;
        } else if rear.contains(p.angle) {
            counts.rear += 1;
        } else if right.contains(p.angle) {
            counts.right += 1;
        }
    }
    counts
}

impl Device for Lidar {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Sensor]
    }

    fn initialize(&self) -> Result<(), HalError> {
        self.lifecycle.set(Lifecycle::Initializing);
        let opened = self
            .config
            .validate()
            .and_then(|()| self.source.open())
            .map_err(|e| match e {
                HalError::Hardware { .. } => e,
                other => HalError::hardware(&self.id, other.to_string()),
            });
        match opened {
            Ok(()) => {
                info!(
                    device = %self.id,
                    port = %self.config.port,
                    baudrate = self.config.baudrate,
                    "ranging sensor ready"
                );
                self.lifecycle.set(Lifecycle::Ready);
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.id, error = %e, "ranging sensor failed to open");
                self.lifecycle.fail(e.clone());
                Err(e)
            }
        }
    }

    fn shutdown(&self) {
        self.source.close();
        self.lifecycle.set(Lifecycle::Stopped);
    }

    fn get_status(&self) -> DeviceStatus {
        let details = json!({
            "port": self.config.port,
            "scan_available": self.with_fresh_scan(|_| ()).is_some(),
            "statistics": self.statistics(),
        });
        self.lifecycle.status(&self.id, self.capabilities(), details)
    }
}

impl Sensor for Lidar {
    type Reading = ScanReading;

    fn read_data(&self) -> Result<TelemetrySample<ScanReading>, HalError> {
        self.lifecycle.ensure_readable(&self.id)?;
        Ok(TelemetrySample::new(&self.id, self.reading()))
    }
}

/// Acquire scans at the configured scan frequency until stopped.
pub fn spawn_acquisition(lidar: Arc<Lidar>) -> TaskHandle {
    let period = period_for(lidar.config().scan_frequency_hz);
    let name = format!("scan:{}", lidar.id());
    TaskHandle::spawn(name, move |mut shutdown| async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failing = false;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if lidar.lifecycle.get() != Lifecycle::Ready {
                continue;
            }
            match lidar.acquire_once() {
                Ok(()) => {
                    if failing {
                        info!(device = %lidar.id(), "scan acquisition recovered");
                        failing = false;
                    }
                }
                Err(e) => {
                    if failing {
                        debug!(device = %lidar.id(), error = %e, "scan failed");
                    } else {
                        warn!(device = %lidar.id(), error = %e, "scan failed");
                        failing = true;
                    }
                }
            }
        }
    })
}
