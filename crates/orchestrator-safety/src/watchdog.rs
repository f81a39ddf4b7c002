//! [`ScanWatchdog`] – staleness detection for the ranging feed.
//!
//! The monitor calls [`ScanWatchdog::feed`] for every valid scan and
//! [`ScanWatchdog::poll`] from its periodic tick.  Silence longer than the
//! warning deadline degrades the feed to [`FeedHealth::Stale`]; silence
//! longer than the critical deadline makes it [`FeedHealth::Critical`].
//! `poll` reports each level once per outage so the caller can act on the
//! transition rather than on every tick.
//!
//! Time is passed in explicitly, which keeps the watchdog usable under a
//! paused tokio clock.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health of the scan feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedHealth {
    /// A valid scan arrived within the warning deadline.
    Healthy,
    /// No valid scan for longer than the warning deadline.
    Stale,
    /// No valid scan for longer than the critical deadline.
    Critical,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Two-level deadline on the time since the last valid scan.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use orchestrator_safety::watchdog::{FeedHealth, ScanWatchdog};
/// use tokio::time::Instant;
///
/// let start = Instant::now();
/// let mut wd = ScanWatchdog::new(Duration::from_secs(2), Duration::from_secs(5), start);
/// assert_eq!(wd.poll(start + Duration::from_secs(3)), Some(FeedHealth::Stale));
/// assert_eq!(wd.poll(start + Duration::from_secs(4)), None);
/// ```
#[derive(Debug, Clone)]
pub struct ScanWatchdog {
    last_valid: Instant,
    warn_after: Duration,
    critical_after: Duration,
    reported: FeedHealth,
    ever_fed: bool,
}

impl ScanWatchdog {
    /// Start watching at `now`.  The feed counts as healthy until the first
    /// deadline passes, so a sensor gets the full warning window to come up.
    pub fn new(warn_after: Duration, critical_after: Duration, now: Instant) -> Self {
        Self {
            last_valid: now,
            warn_after,
            critical_after: critical_after.max(warn_after),
            reported: FeedHealth::Healthy,
            ever_fed: false,
        }
    }

    /// Record a valid scan at `now`.
    ///
    /// Returns the level the feed recovered from, if it was degraded.
    pub fn feed(&mut self, now: Instant) -> Option<FeedHealth> {
        self.last_valid = now;
        self.ever_fed = true;
        let previous = std::mem::replace(&mut self.reported, FeedHealth::Healthy);
        (previous != FeedHealth::Healthy).then_some(previous)
    }

    /// Current health at `now`.
    pub fn health(&self, now: Instant) -> FeedHealth {
        let silence = self.silence(now);
        if silence > self.critical_after {
            FeedHealth::Critical
        } else if silence > self.warn_after {
            FeedHealth::Stale
        } else {
            FeedHealth::Healthy
        }
    }

    /// Return the new level when the feed has degraded further since the
    /// last call; `None` otherwise.
    pub fn poll(&mut self, now: Instant) -> Option<FeedHealth> {
        let health = self.health(now);
        if health > self.reported {
            self.reported = health;
            Some(health)
        } else {
            None
        }
    }

    /// Time since the last valid scan (or since start).
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_valid)
    }

    /// Whether any valid scan has been seen.
    pub fn ever_fed(&self) -> bool {
        self.ever_fed
    }
}
