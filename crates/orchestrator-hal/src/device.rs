//! Device capability model.
//!
//! Every piece of hardware is a [`Device`].  Devices that accept commands
//! implement [`Commandable`]; devices that move the robot additionally
//! implement [`Actuator`] and must honour [`Actuator::emergency_stop`]
//! immediately, outside any command queue.  Devices that produce telemetry
//! implement [`Sensor`] and can be sampled periodically with
//! [`start_publishing`].
//!
//! All trait methods take `&self`: devices keep their state behind a short
//! [`parking_lot::Mutex`] so that a command worker, a control loop and a
//! telemetry task can share one `Arc`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestrator_gateway::Gateway;
use orchestrator_types::{
    Ack, Capability, Command, DeviceStatus, HalError, Lifecycle, TelemetrySample,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Common behaviour of every device.
pub trait Device: Send + Sync {
    /// Identifier, unique within the process.
    fn id(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Bring the device to [`Lifecycle::Ready`].
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Hardware`] when the backend cannot be opened; the
    /// device is then left in [`Lifecycle::Error`].
    fn initialize(&self) -> Result<(), HalError>;

    /// Release hardware and move to [`Lifecycle::Stopped`].
    fn shutdown(&self);

    fn get_status(&self) -> DeviceStatus;
}

/// A device that executes [`Command`]s.
pub trait Commandable: Device {
    /// # Errors
    ///
    /// * [`HalError::Validation`] – unknown action or bad parameters.
    /// * [`HalError::Command`] – the device is not ready.
    /// * [`HalError::Hardware`] – the device is in the error state or the
    ///   backend failed while applying the command.
    fn execute_command(&self, command: &Command) -> Result<Ack, HalError>;
}

/// A device that moves the robot.
pub trait Actuator: Commandable {
    /// Stop all motion now.  Never queued, never refused.
    fn emergency_stop(&self, reason: &str);
}

/// A device that produces typed readings.
pub trait Sensor: Device {
    type Reading: Serialize + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns [`HalError::Command`] when the device is not ready.
    fn read_data(&self) -> Result<TelemetrySample<Self::Reading>, HalError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Lifecycle bookkeeping
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct LifecycleState {
    lifecycle: Lifecycle,
    last_updated: DateTime<Utc>,
    last_error: Option<HalError>,
}

/// Lifecycle state shared by the concrete devices.
#[derive(Debug)]
pub struct LifecycleCell {
    inner: Mutex<LifecycleState>,
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self {
            inner: Mutex::new(LifecycleState {
                lifecycle: Lifecycle::Uninitialized,
                last_updated: Utc::now(),
                last_error: None,
            }),
        }
    }
}

impl LifecycleCell {
    pub fn get(&self) -> Lifecycle {
        self.inner.lock().lifecycle
    }

    pub fn set(&self, lifecycle: Lifecycle) {
        let mut state = self.inner.lock();
        state.lifecycle = lifecycle;
        state.last_updated = Utc::now();
        if lifecycle == Lifecycle::Ready {
            state.last_error = None;
        }
    }

    /// Enter [`Lifecycle::Error`] and remember why.
    pub fn fail(&self, error: HalError) {
        let mut state = self.inner.lock();
        state.lifecycle = Lifecycle::Error;
        state.last_updated = Utc::now();
        state.last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<HalError> {
        self.inner.lock().last_error.clone()
    }

    /// Gate for commands: `Error` is a hardware fault, anything else that is
    /// not `Ready` is a refusal.
    pub fn ensure_ready(&self, device_id: &str, command_id: &str) -> Result<(), HalError> {
        match self.get() {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Error => Err(HalError::hardware(
                device_id,
                format!("device is in error state, command {command_id} refused"),
            )),
            other => Err(HalError::rejected(command_id, format!("{device_id} is {other}"))),
        }
    }

    /// Gate for reads.
    pub fn ensure_readable(&self, device_id: &str) -> Result<(), HalError> {
        match self.get() {
            Lifecycle::Ready => Ok(()),
            other => Err(HalError::rejected("read", format!("{device_id} is {other}"))),
        }
    }

    /// Build a status snapshot; `details` must be a JSON object or null.
    pub fn status(&self, device_id: &str, capabilities: &[Capability], details: Value) -> DeviceStatus {
        let state = self.inner.lock();
        let mut details = match details {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let Some(err) = &state.last_error {
            details.insert(
                "error".to_string(),
                json!({ "kind": err.kind(), "message": err.to_string() }),
            );
        }
        DeviceStatus {
            device_id: device_id.to_string(),
            capabilities: capabilities.to_vec(),
            lifecycle: state.lifecycle,
            last_updated: state.last_updated,
            details: Value::Object(details),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Background tasks
// ────────────────────────────────────────────────────────────────────────────

/// A spawned background task with its own shutdown signal.
///
/// Dropping the handle also stops the task, since the task observes the
/// signal's sender going away.
pub struct TaskHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        Self {
            name: name.into(),
            shutdown,
            join: tokio::spawn(task(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the task and wait for it to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.join.await {
            debug!(task = %self.name, error = %e, "task ended abnormally");
        }
    }
}

/// Period for a rate in Hz, clamped to 0.1–100 Hz.
pub fn period_for(rate_hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate_hz.clamp(0.1, 100.0))
}

/// Publish `sensor`'s readings on `<ns>/data/<id>` at `rate_hz`.
///
/// The publish rate is independent of how often the device acquires data;
/// each tick simply samples the latest reading.  Reads that fail (device not
/// ready) are skipped.
pub fn start_publishing<S>(sensor: Arc<S>, gateway: Gateway, rate_hz: f64) -> TaskHandle
where
    S: Sensor + 'static,
{
    let period = period_for(rate_hz);
    let name = format!("publish:{}", sensor.id());
    TaskHandle::spawn(name, move |mut shutdown| async move {
        info!(device = %sensor.id(), period_ms = period.as_millis() as u64, "telemetry publishing started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            match sensor.read_data() {
                Ok(sample) => {
                    if let Err(e) = gateway.publish_telemetry(&sample).await {
                        debug!(device = %sensor.id(), error = %e, "telemetry not published");
                    }
                }
                Err(e) => debug!(device = %sensor.id(), error = %e, "skipping telemetry tick"),
            }
        }
        info!(device = %sensor.id(), "telemetry publishing stopped");
    })
}
