//! [`SafetyMonitor`] – turns ranging telemetry into emergency stops.
//!
//! The decision logic ([`SafetyMonitor::process_scan`] and
//! [`SafetyMonitor::check_watchdog`]) is synchronous and takes the current
//! time as an argument; the async loop around it only receives messages,
//! ticks, and publishes the resulting [`Outcome`].  An emergency stop is
//! always published before any status report.
//!
//! A trigger latches.  The latch is released only after valid scans have
//! shown every stop zone clear for `clear_after_secs`; an invalid or missing
//! scan restarts that window.

use std::sync::Arc;
use std::time::Duration;

use orchestrator_gateway::{Gateway, Message, QoS, SubscriptionId};
use orchestrator_types::{
    EmergencyStop, HalError, ObstacleInfo, SafetyConfig, Scan, ScanReading, StatusReport,
    TelemetrySample,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::watchdog::{FeedHealth, ScanWatchdog};
use crate::zones::ZoneSet;

/// Device id used for the monitor's own status reports.
pub const MONITOR_ID: &str = "safety_monitor";

/// Reason carried by a zone-triggered emergency stop.
pub const OBSTACLE_REASON: &str = "obstacle_detected";

/// Reason carried by a watchdog-triggered emergency stop.
pub const TIMEOUT_REASON: &str = "sensor_data_timeout";

const WATCHDOG_TICK: Duration = Duration::from_millis(100);

/// Minimum spacing between repeated stops while latched.
const REASSERT_INTERVAL: Duration = Duration::from_secs(1);

const SCAN_QUEUE: usize = 8;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStatistics {
    pub scans_received: u64,
    pub invalid_scans: u64,
    /// Zone violations of any action.
    pub detections: u64,
    pub warnings: u64,
    /// Emergency stops published.
    pub triggers: u64,
    pub watchdog_warnings: u64,
    pub last_processing_ms: f64,
    pub avg_processing_ms: f64,
    pub max_processing_ms: f64,
    /// Scans whose processing exceeded the emergency stop latency budget.
    pub budget_overruns: u64,
}

/// Snapshot of an active latch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatchInfo {
    pub reason: String,
    pub zone_name: Option<String>,
    pub latched_for_secs: f64,
    /// Seconds of continuous clear scans so far.
    pub clear_for_secs: f64,
}

/// What the monitor decided for one scan or watchdog tick.
#[derive(Debug, Default)]
pub struct Outcome {
    pub emergency_stop: Option<EmergencyStop>,
    pub warnings: Vec<ObstacleInfo>,
    /// Set when the feed has just degraded to this level.
    pub feed: Option<FeedHealth>,
    /// Set when the latch was released by this scan.
    pub released: bool,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.emergency_stop.is_none() && self.warnings.is_empty() && self.feed.is_none() && !self.released
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct Latch {
    reason: &'static str,
    zone: Option<String>,
    since: Instant,
    clear_since: Option<Instant>,
    last_assert: Instant,
}

struct MonitorState {
    watchdog: ScanWatchdog,
    latch: Option<Latch>,
    stats: MonitorStatistics,
    total_processing_ms: f64,
}

impl MonitorState {
    fn record_processing(&mut self, elapsed: Duration, budget: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.total_processing_ms += ms;
        let stats = &mut self.stats;
        stats.last_processing_ms = ms;
        stats.max_processing_ms = stats.max_processing_ms.max(ms);
        stats.avg_processing_ms = self.total_processing_ms / stats.scans_received.max(1) as f64;
        if elapsed > budget {
            stats.budget_overruns += 1;
            warn!(processing_ms = ms, budget_ms = budget.as_secs_f64() * 1000.0, "scan processing over budget");
        }
    }

    /// Latch (or re-assert an existing latch) and build the stop to publish.
    fn trigger(
        &mut self,
        reason: &'static str,
        info: Option<ObstacleInfo>,
        now: Instant,
        force: bool,
    ) -> Option<EmergencyStop> {
        let zone = info.as_ref().map(|i| i.zone_name.clone());
        match self.latch.as_mut() {
            Some(latch) => {
                latch.clear_since = None;
                if !force && now.saturating_duration_since(latch.last_assert) < REASSERT_INTERVAL {
                    return None;
                }
                latch.reason = reason;
                latch.zone = zone;
                latch.last_assert = now;
            }
            None => {
                self.latch = Some(Latch {
                    reason,
                    zone,
                    since: now,
                    clear_since: None,
                    last_assert: now,
                });
            }
        }
        self.stats.triggers += 1;
        Some(EmergencyStop::new(reason, info))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Monitor
// ────────────────────────────────────────────────────────────────────────────

/// Watches one ranging sensor and stops the robot when a zone is violated
/// or the sensor goes silent.
pub struct SafetyMonitor {
    config: SafetyConfig,
    zones: ZoneSet,
    gateway: Gateway,
    started: Instant,
    state: Mutex<MonitorState>,
}

impl SafetyMonitor {
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] for an invalid configuration.
    pub fn new(config: SafetyConfig, gateway: Gateway) -> Result<Self, HalError> {
        config.validate()?;
        let zones = ZoneSet::from_config(&config)?;
        let now = Instant::now();
        let watchdog = ScanWatchdog::new(
            Duration::from_secs_f64(config.data_timeout_secs),
            Duration::from_secs_f64(config.critical_timeout_secs),
            now,
        );
        Ok(Self {
            config,
            zones,
            gateway,
            started: now,
            state: Mutex::new(MonitorState {
                watchdog,
                latch: None,
                stats: MonitorStatistics::default(),
                total_processing_ms: 0.0,
            }),
        })
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn zones(&self) -> &ZoneSet {
        &self.zones
    }

    pub fn statistics(&self) -> MonitorStatistics {
        self.state.lock().stats.clone()
    }

    pub fn is_latched(&self) -> bool {
        self.state.lock().latch.is_some()
    }

    pub fn latch(&self, now: Instant) -> Option<LatchInfo> {
        self.state.lock().latch.as_ref().map(|l| LatchInfo {
            reason: l.reason.to_string(),
            zone_name: l.zone.clone(),
            latched_for_secs: now.saturating_duration_since(l.since).as_secs_f64(),
            clear_for_secs: l
                .clear_since
                .map_or(0.0, |c| now.saturating_duration_since(c).as_secs_f64()),
        })
    }

    pub fn feed_health(&self, now: Instant) -> FeedHealth {
        self.state.lock().watchdog.health(now)
    }

    /// Evaluate one scan received at `now`.
    ///
    /// `Err` and scans without a single valid point count as invalid: they
    /// never trigger, never feed the watchdog and restart the clear window of
    /// an active latch.
    pub fn process_scan(&self, scan: Result<Scan, HalError>, now: Instant) -> Outcome {
        self.evaluate_scan(scan, now, std::time::Instant::now())
    }

    /// Processing time is measured from `clock`, which callers start before
    /// decoding.
    fn evaluate_scan(
        &self,
        scan: Result<Scan, HalError>,
        now: Instant,
        clock: std::time::Instant,
    ) -> Outcome {
        let budget = Duration::from_secs_f64(self.config.emergency_stop_timeout_secs);
        let mut outcome = Outcome::default();
        let mut state = self.state.lock();
        state.stats.scans_received += 1;

        let scan = match scan {
            Ok(scan) if scan.valid_point_count() > 0 => scan,
            Ok(_) => {
                state.stats.invalid_scans += 1;
                debug!("scan has no valid points");
                if let Some(latch) = state.latch.as_mut() {
                    latch.clear_since = None;
                }
                state.record_processing(clock.elapsed(), budget);
                return outcome;
            }
            Err(e) => {
                state.stats.invalid_scans += 1;
                debug!(error = %e, "invalid scan");
                if let Some(latch) = state.latch.as_mut() {
                    latch.clear_since = None;
                }
                state.record_processing(clock.elapsed(), budget);
                return outcome;
            }
        };

        if let Some(level) = state.watchdog.feed(now) {
            info!(recovered_from = ?level, "scan feed recovered");
        }

        let eval = self.zones.evaluate(&scan);
        if let Some(stop) = eval.stop {
            state.stats.detections += 1;
            outcome.emergency_stop = state.trigger(OBSTACLE_REASON, Some(stop.obstacle_info()), now, false);
        } else if let Some(latch) = state.latch.as_mut() {
            let clear_since = *latch.clear_since.get_or_insert(now);
            if now.saturating_duration_since(clear_since).as_secs_f64() >= self.config.clear_after_secs {
                state.latch = None;
                outcome.released = true;
            }
        }
        for hit in &eval.warnings {
            state.stats.detections += 1;
            state.stats.warnings += 1;
            outcome.warnings.push(hit.obstacle_info());
        }
        state.record_processing(clock.elapsed(), budget);
        outcome
    }

    /// Check the scan watchdog at `now`.
    pub fn check_watchdog(&self, now: Instant) -> Outcome {
        let mut outcome = Outcome::default();
        let mut state = self.state.lock();
        match state.watchdog.poll(now) {
            Some(FeedHealth::Stale) => {
                state.stats.watchdog_warnings += 1;
                outcome.feed = Some(FeedHealth::Stale);
            }
            Some(FeedHealth::Critical) => {
                outcome.feed = Some(FeedHealth::Critical);
                outcome.emergency_stop = state.trigger(TIMEOUT_REASON, None, now, true);
            }
            _ => {}
        }
        outcome
    }

    /// Status snapshot published on `<ns>/status/safety_monitor`.
    pub fn status_report(&self, now: Instant) -> StatusReport {
        let latch = self.latch(now);
        let (feed, silence, ever_fed, stats) = {
            let state = self.state.lock();
            (
                state.watchdog.health(now),
                state.watchdog.silence(now),
                state.watchdog.ever_fed(),
                state.stats.clone(),
            )
        };
        let status = if latch.is_some() {
            "emergency_stop_active"
        } else if feed != FeedHealth::Healthy {
            "degraded"
        } else {
            "monitoring"
        };
        let zones: Vec<&str> = self.zones.iter().map(|z| z.name.as_str()).collect();
        StatusReport::new(
            MONITOR_ID,
            status,
            json!({
                "uptime_secs": now.saturating_duration_since(self.started).as_secs_f64(),
                "lidar_device": self.config.lidar_device,
                "feed": feed,
                "scan_received": ever_fed,
                "seconds_since_scan": silence.as_secs_f64(),
                "latch": latch,
                "zones": zones,
                "statistics": stats,
            }),
        )
    }

    /// Decode a telemetry message and process it now.  Decoding counts
    /// towards the processing time.
    pub async fn handle_message(&self, msg: &Message) {
        let clock = std::time::Instant::now();
        let scan = msg
            .json::<TelemetrySample<ScanReading>>()
            .and_then(|sample| sample.data.into_scan());
        let outcome = self.evaluate_scan(scan, Instant::now(), clock);
        self.publish(outcome).await;
    }

    async fn publish(&self, outcome: Outcome) {
        if outcome.is_empty() {
            return;
        }
        if let Some(estop) = &outcome.emergency_stop {
            match self.gateway.publish_emergency_stop(estop).await {
                Ok(()) => warn!(
                    reason = %estop.reason,
                    command_id = %estop.command_id,
                    zone = ?estop.obstacle_info.as_ref().map(|i| i.zone_name.as_str()),
                    "emergency stop published"
                ),
                Err(e) => error!(error = %e, reason = %estop.reason, "failed to publish emergency stop"),
            }
        }
        for info in &outcome.warnings {
            debug!(zone = %info.zone_name, distance = info.distance, "obstacle in warning zone");
            self.send_status(StatusReport::new(MONITOR_ID, "obstacle_warning", json!(info)))
                .await;
        }
        if outcome.feed == Some(FeedHealth::Stale) {
            warn!(lidar = %self.config.lidar_device, "scan feed stale");
            self.send_status(StatusReport::new(
                MONITOR_ID,
                "sensor_data_stale",
                json!({
                    "lidar_device": self.config.lidar_device,
                    "timeout_secs": self.config.data_timeout_secs,
                }),
            ))
            .await;
        }
        if outcome.released {
            info!("emergency stop latch released");
            self.send_status(StatusReport::new(
                MONITOR_ID,
                "emergency_stop_cleared",
                json!({ "clear_after_secs": self.config.clear_after_secs }),
            ))
            .await;
        }
    }

    async fn send_status(&self, report: StatusReport) {
        if let Err(e) = self.gateway.publish_status(&report).await {
            warn!(error = %e, status = %report.status, "failed to publish monitor status");
        }
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    async fn subscribe(&self) -> Result<(SubscriptionId, mpsc::Receiver<Message>), HalError> {
        let topic = self.gateway.topics().data(&self.config.lidar_device);
        self.gateway.subscribe_channel(&topic, QoS::AtMostOnce, SCAN_QUEUE).await
    }

    /// Run the monitor as a task on the current runtime.
    ///
    /// The scan subscription is in place when this returns.
    pub async fn spawn(self: Arc<Self>) -> Result<MonitorHandle, HalError> {
        let (subscription, scans) = self.subscribe().await?;
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(self.clone().run(scans, shutdown));
        Ok(MonitorHandle {
            gateway: self.gateway.clone(),
            subscription,
            shutdown: shutdown_tx,
            join: Join::Task(task),
        })
    }

    /// Run the monitor on its own OS thread with a private runtime, so a
    /// busy application runtime cannot delay it.  With the `realtime`
    /// feature the thread also asks for the highest OS priority.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Hardware`] when the thread cannot be spawned.
    pub async fn spawn_dedicated(self: Arc<Self>) -> Result<MonitorHandle, HalError> {
        let (subscription, scans) = self.subscribe().await?;
        let (shutdown_tx, shutdown) = watch::channel(false);
        let monitor = self.clone();
        let spawned = std::thread::Builder::new()
            .name("safety-monitor".to_string())
            .spawn(move || {
                raise_priority();
                match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime.block_on(monitor.run(scans, shutdown)),
                    Err(e) => error!(error = %e, "cannot build safety monitor runtime"),
                }
            });
        match spawned {
            Ok(thread) => Ok(MonitorHandle {
                gateway: self.gateway.clone(),
                subscription,
                shutdown: shutdown_tx,
                join: Join::Thread(thread),
            }),
            Err(e) => {
                self.gateway.unsubscribe(subscription).await;
                Err(HalError::hardware(MONITOR_ID, format!("cannot spawn monitor thread: {e}")))
            }
        }
    }

    async fn run(self: Arc<Self>, mut scans: mpsc::Receiver<Message>, mut shutdown: watch::Receiver<bool>) {
        let now = Instant::now();
        self.state.lock().watchdog = ScanWatchdog::new(
            Duration::from_secs_f64(self.config.data_timeout_secs),
            Duration::from_secs_f64(self.config.critical_timeout_secs),
            now,
        );
        info!(
            lidar = %self.config.lidar_device,
            zones = self.zones.len(),
            threshold = self.config.obstacle_threshold,
            "safety monitor running"
        );

        let mut watchdog_tick = tokio::time::interval(WATCHDOG_TICK);
        watchdog_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_tick =
            tokio::time::interval(Duration::from_secs_f64(self.config.status_interval_secs));
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                msg = scans.recv() => match msg {
                    Some(msg) => self.handle_message(&msg).await,
                    None => {
                        warn!("scan subscription closed");
                        break;
                    }
                },
                _ = watchdog_tick.tick() => {
                    let outcome = self.check_watchdog(Instant::now());
                    self.publish(outcome).await;
                }
                _ = status_tick.tick() => {
                    let report = self.status_report(Instant::now());
                    self.send_status(report).await;
                }
            }
        }
        let stats = self.statistics();
        info!(triggers = stats.triggers, scans = stats.scans_received, "safety monitor stopped");
    }
}

#[cfg(feature = "realtime")]
fn raise_priority() {
    use thread_priority::*;

    match set_current_thread_priority(ThreadPriority::Max) {
        Ok(_) => info!("safety monitor thread priority set to MAX"),
        Err(e) => warn!(
            "failed to raise safety monitor thread priority: {e:?}; \
             on Linux this needs CAP_SYS_NICE or rtkit"
        ),
    }
}

#[cfg(not(feature = "realtime"))]
fn raise_priority() {
    debug!("realtime feature disabled, monitor thread keeps default priority");
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

enum Join {
    Task(JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

/// Owns a running monitor.  Dropping it without [`MonitorHandle::stop`]
/// leaves the monitor running until its subscription closes.
pub struct MonitorHandle {
    gateway: Gateway,
    subscription: SubscriptionId,
    shutdown: watch::Sender<bool>,
    join: Join,
}

impl MonitorHandle {
    pub fn is_dedicated(&self) -> bool {
        matches!(self.join, Join::Thread(_))
    }

    /// Signal the loop, wait for it to finish and drop the subscription.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        match self.join {
            Join::Task(task) => {
                if let Err(e) = task.await {
                    warn!(error = %e, "safety monitor task ended abnormally");
                }
            }
            Join::Thread(thread) => {
                let joined = tokio::task::spawn_blocking(move || thread.join()).await;
                if !matches!(joined, Ok(Ok(()))) {
                    warn!("safety monitor thread ended abnormally");
                }
            }
        }
        self.gateway.unsubscribe(self.subscription).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orchestrator_gateway::LocalBroker;
    use orchestrator_types::{GatewayConfig, ScanLimits};

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    /// A 360-point sweep at 5 m with the given `(angle, range)` overrides.
    fn reading(points: &[(usize, f64)]) -> ScanReading {
        let mut ranges = vec![5.0; 360];
        for &(angle, range) in points {
            ranges[angle] = range;
        }
        ScanReading {
            scan_available: true,
            scan_timestamp: Some(Utc::now()),
            angles: (0..360).map(f64::from).collect(),
            quality: vec![100; 360],
            ranges,
            limits: Some(ScanLimits::default()),
            scan_duration: 0.1,
            ..ScanReading::default()
        }
    }

    fn scan(points: &[(usize, f64)]) -> Result<Scan, HalError> {
        reading(points).into_scan()
    }

    fn offline_monitor() -> SafetyMonitor {
        let gateway = Gateway::new(
            &GatewayConfig::default(),
            Arc::new(LocalBroker::default().transport("safety")),
        );
        SafetyMonitor::new(SafetyConfig::default(), gateway).unwrap()
    }

    async fn connected() -> Result<(Gateway, Gateway), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let config = GatewayConfig::default();
        let monitor_side = Gateway::new(&config, Arc::new(broker.transport("safety")));
        monitor_side.connect().await?;
        let client = Gateway::new(&config, Arc::new(broker.transport("client")));
        client.connect().await?;
        Ok((monitor_side, client))
    }

    #[tokio::test]
    async fn obstacle_in_front_triggers_once_and_latches() {
        let monitor = offline_monitor();
        let t0 = Instant::now();
        let outcome = monitor.process_scan(scan(&[(0, 0.3)]), t0);
        let estop = outcome.emergency_stop.expect("stop expected");
        assert_eq!(estop.reason, OBSTACLE_REASON);
        let info = estop.obstacle_info.expect("obstacle info");
        assert_eq!(info.zone_name, "critical_front");
        assert_eq!(info.obstacle_count, 1);
        assert!(monitor.is_latched());

        // Still blocked shortly after: no flood of repeated stops.
        let outcome = monitor.process_scan(scan(&[(0, 0.3)]), t0 + secs(0.1));
        assert!(outcome.emergency_stop.is_none());
        // Re-asserted after the spacing interval.
        let outcome = monitor.process_scan(scan(&[(0, 0.3)]), t0 + secs(1.2));
        assert!(outcome.emergency_stop.is_some());

        let stats = monitor.statistics();
        assert_eq!(stats.triggers, 2);
        assert_eq!(stats.detections, 3);
        assert_eq!(stats.scans_received, 3);
    }

    #[tokio::test]
    async fn clear_scan_does_not_trigger() {
        let monitor = offline_monitor();
        let outcome = monitor.process_scan(scan(&[(0, 0.6), (180, 0.2)]), Instant::now());
        assert!(outcome.is_empty());
        assert_eq!(monitor.statistics().triggers, 0);
        assert!(!monitor.is_latched());
    }

    #[tokio::test]
    async fn warning_zone_reports_without_stopping() {
        let monitor = offline_monitor();
        let outcome = monitor.process_scan(scan(&[(90, 0.3)]), Instant::now());
        assert!(outcome.emergency_stop.is_none());
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].zone_name, "warning_left");
        assert_eq!(monitor.statistics().warnings, 1);
    }

    #[tokio::test]
    async fn latch_clears_only_after_continuous_clear_scans() {
        let monitor = offline_monitor();
        let t0 = Instant::now();
        monitor.process_scan(scan(&[(10, 0.2)]), t0);

        assert!(!monitor.process_scan(scan(&[]), t0 + secs(1.0)).released);
        assert!(!monitor.process_scan(scan(&[]), t0 + secs(3.5)).released);
        let latch = monitor.latch(t0 + secs(3.5)).unwrap();
        assert!((latch.clear_for_secs - 2.5).abs() < 1e-9);

        let outcome = monitor.process_scan(scan(&[]), t0 + secs(4.0));
        assert!(outcome.released);
        assert!(!monitor.is_latched());
    }

    #[tokio::test]
    async fn invalid_scans_never_clear_the_latch() {
        let monitor = offline_monitor();
        let t0 = Instant::now();
        monitor.process_scan(scan(&[(0, 0.2)]), t0);
        monitor.process_scan(scan(&[]), t0 + secs(0.5));

        // Unavailable readings and sweeps with no valid point restart the window.
        let unavailable = ScanReading::unavailable("timeout", Default::default()).into_scan();
        assert!(!monitor.process_scan(unavailable, t0 + secs(2.0)).released);
        let out_of_range = scan(&(0..360).map(|a| (a, 0.01)).collect::<Vec<_>>());
        assert!(!monitor.process_scan(out_of_range, t0 + secs(3.0)).released);
        assert!(!monitor.process_scan(scan(&[]), t0 + secs(4.0)).released);
        assert!(monitor.is_latched());
        assert_eq!(monitor.statistics().invalid_scans, 2);

        assert!(monitor.process_scan(scan(&[]), t0 + secs(7.0)).released);
    }

    #[tokio::test]
    async fn watchdog_warns_then_stops() {
        let monitor = offline_monitor();
        let t0 = Instant::now();
        assert!(monitor.check_watchdog(t0 + secs(1.0)).is_empty());

        let outcome = monitor.check_watchdog(t0 + secs(2.5));
        assert_eq!(outcome.feed, Some(FeedHealth::Stale));
        assert!(outcome.emergency_stop.is_none());

        let outcome = monitor.check_watchdog(t0 + secs(5.5));
        assert_eq!(outcome.feed, Some(FeedHealth::Critical));
        assert_eq!(outcome.emergency_stop.unwrap().reason, TIMEOUT_REASON);
        assert!(monitor.is_latched());
        assert_eq!(monitor.statistics().watchdog_warnings, 1);

        // Only valid clear scans release it.
        monitor.process_scan(scan(&[]), t0 + secs(6.0));
        assert!(monitor.process_scan(scan(&[]), t0 + secs(9.0)).released);
    }

    #[tokio::test]
    async fn processing_time_is_tracked() {
        let monitor = offline_monitor();
        let now = Instant::now();
        for _ in 0..3 {
            monitor.process_scan(scan(&[]), now);
        }
        let stats = monitor.statistics();
        assert!(stats.max_processing_ms >= stats.last_processing_ms);
        assert!(stats.avg_processing_ms >= 0.0);
        assert_eq!(stats.scans_received, 3);
    }

    #[test]
    fn processing_time_counts_from_the_callers_clock() {
        let monitor = offline_monitor();
        let started = std::time::Instant::now()
            .checked_sub(Duration::from_millis(40))
            .unwrap();
        monitor.evaluate_scan(scan(&[]), Instant::now(), started);
        let stats = monitor.statistics();
        assert!(stats.last_processing_ms >= 40.0, "{}", stats.last_processing_ms);
        assert_eq!(stats.budget_overruns, 0);
    }

    #[tokio::test]
    async fn decoded_message_keeps_every_point() {
        let monitor = offline_monitor();
        let sample = TelemetrySample::new("lidar", reading(&[(0, 0.3)]));
        let msg = Message::new(
            "orchestrator/data/lidar",
            serde_json::to_string(&sample).unwrap(),
            QoS::AtMostOnce,
        );
        monitor.handle_message(&msg).await;

        assert!(monitor.is_latched());
        let stats = monitor.statistics();
        assert_eq!(stats.invalid_scans, 0);
        assert!(stats.last_processing_ms > 0.0);
    }

    #[tokio::test]
    async fn published_scan_produces_estop_on_the_wire() -> Result<(), Box<dyn std::error::Error>> {
        let (gateway, client) = connected().await?;
        let (_, mut estops) = client.subscribe_channel("orchestrator/cmd/estop", QoS::ExactlyOnce, 8).await?;
        let monitor = Arc::new(SafetyMonitor::new(SafetyConfig::default(), gateway)?);
        let handle = monitor.clone().spawn().await?;

        client
            .publish_telemetry(&TelemetrySample::new("lidar", reading(&[(100, 5.0)])))
            .await?;
        client
            .publish_telemetry(&TelemetrySample::new("lidar", reading(&[(355, 0.25)])))
            .await?;

        let msg = tokio::time::timeout(secs(1.0), estops.recv()).await?.ok_or("closed")?;
        assert_eq!(msg.qos, QoS::ExactlyOnce);
        let estop: EmergencyStop = msg.json()?;
        assert_eq!(estop.action, "emergency_stop");
        let info = estop.obstacle_info.ok_or("missing obstacle info")?;
        assert_eq!(info.zone_name, "critical_front");
        assert!((info.distance - 0.25).abs() < 1e-9);
        assert!((info.angle - 355.0).abs() < 1e-9);

        handle.stop().await;
        assert_eq!(monitor.statistics().triggers, 1);
        assert_eq!(monitor.statistics().scans_received, 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_sensor_escalates_on_the_wire() -> Result<(), Box<dyn std::error::Error>> {
        let (gateway, client) = connected().await?;
        let (_, mut estops) = client.subscribe_channel("orchestrator/cmd/estop", QoS::ExactlyOnce, 8).await?;
        let (_, mut status) = client
            .subscribe_channel("orchestrator/status/safety_monitor", QoS::AtLeastOnce, 256)
            .await?;
        let monitor = Arc::new(SafetyMonitor::new(SafetyConfig::default(), gateway)?);
        let handle = monitor.clone().spawn().await?;

        tokio::time::sleep(secs(2.5)).await;
        let mut saw_stale = false;
        while let Ok(msg) = status.try_recv() {
            let report: StatusReport = msg.json()?;
            saw_stale |= report.status == "sensor_data_stale";
        }
        assert!(saw_stale);
        assert!(estops.try_recv().is_err());

        let msg = tokio::time::timeout(secs(5.0), estops.recv()).await?.ok_or("closed")?;
        let estop: EmergencyStop = msg.json()?;
        assert_eq!(estop.reason, TIMEOUT_REASON);
        assert!(monitor.is_latched());

        handle.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dedicated_thread_monitor_stops_the_robot() -> Result<(), Box<dyn std::error::Error>> {
        let (gateway, client) = connected().await?;
        let (_, mut estops) = client.subscribe_channel("orchestrator/cmd/estop", QoS::ExactlyOnce, 8).await?;
        let monitor = Arc::new(SafetyMonitor::new(SafetyConfig::default(), gateway)?);
        let handle = monitor.clone().spawn_dedicated().await?;
        assert!(handle.is_dedicated());

        client
            .publish_telemetry(&TelemetrySample::new("lidar", reading(&[(20, 0.3)])))
            .await?;
        let msg = tokio::time::timeout(secs(2.0), estops.recv()).await?.ok_or("closed")?;
        let estop: EmergencyStop = msg.json()?;
        assert_eq!(estop.reason, OBSTACLE_REASON);

        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn status_report_reflects_latch() {
        let monitor = offline_monitor();
        let now = Instant::now();
        assert_eq!(monitor.status_report(now).status, "monitoring");
        monitor.process_scan(scan(&[(0, 0.2)]), now);
        let report = monitor.status_report(now);
        assert_eq!(report.status, "emergency_stop_active");
        assert_eq!(report.details["latch"]["zone_name"], "critical_front");
        assert_eq!(report.details["statistics"]["triggers"], 1);
        assert_eq!(report.details["zones"].as_array().map(Vec::len), Some(3));
    }
}
