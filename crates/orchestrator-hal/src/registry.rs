//! [`DeviceRegistry`] – device bookkeeping and command routing.
//!
//! The registry owns one entry per device id.  [`DeviceRegistry::start`]
//! wires every commandable device to the gateway:
//!
//! * `<ns>/cmd/<id>` feeds a per-device FIFO worker that executes commands
//!   in arrival order and publishes the ack (or rejection) on
//!   `<ns>/status/<id>`;
//! * `emergency_stop` commands, and anything on `<ns>/cmd/estop`, are handled
//!   inline on the dispatch path and never wait behind queued commands.

use std::sync::Arc;

use orchestrator_gateway::{Gateway, Message, QoS, SubscriptionId};
use orchestrator_types::{
    Ack, Command, DeviceStatus, EmergencyStop, HalError, Lifecycle, StatusReport,
};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::device::{Actuator, Commandable, Device, TaskHandle};

/// Pending commands per device before new ones are refused.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Clone)]
struct Entry {
    device: Arc<dyn Device>,
    commands: Option<Arc<dyn Commandable>>,
    actuator: Option<Arc<dyn Actuator>>,
}

/// Work items for a device's command worker.
enum Inbound {
    Execute(Command),
    /// Result of a command already handled inline.
    Handled(Result<Ack, HalError>, String),
    Malformed(HalError),
}

/// Registered devices plus the tasks that route commands to them.
pub struct DeviceRegistry {
    gateway: Gateway,
    entries: Arc<RwLock<Vec<Entry>>>,
    workers: Mutex<Vec<TaskHandle>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl DeviceRegistry {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            entries: Arc::new(RwLock::new(Vec::new())),
            workers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, entry: Entry) -> Result<(), HalError> {
        let mut entries = self.entries.write();
        let id = entry.device.id();
        if entries.iter().any(|e| e.device.id() == id) {
            return Err(HalError::validation(format!("device id `{id}` is already registered")));
        }
        info!(device = %id, capabilities = ?entry.device.capabilities(), "device registered");
        entries.push(entry);
        Ok(())
    }

    /// Register a device that moves the robot.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] when the id is taken.
    pub fn register_actuator<A: Actuator + 'static>(&self, actuator: Arc<A>) -> Result<(), HalError> {
        self.insert(Entry {
            device: actuator.clone(),
            commands: Some(actuator.clone()),
            actuator: Some(actuator),
        })
    }

    /// Register a device that accepts commands but does not move anything.
    pub fn register_commandable<C: Commandable + 'static>(&self, device: Arc<C>) -> Result<(), HalError> {
        self.insert(Entry {
            device: device.clone(),
            commands: Some(device),
            actuator: None,
        })
    }

    /// Register a telemetry-only device.
    pub fn register_sensor<D: Device + 'static>(&self, device: Arc<D>) -> Result<(), HalError> {
        self.insert(Entry {
            device,
            commands: None,
            actuator: None,
        })
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.device.id().to_string()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Device>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.device.id() == id)
            .map(|e| e.device.clone())
    }

    /// Initialise every device in registration order.  Failures are logged,
    /// reported on the device's status topic and returned; the remaining
    /// devices are still initialised.
    pub async fn initialize_all(&self) -> Vec<(String, HalError)> {
        let devices: Vec<Arc<dyn Device>> = self.entries.read().iter().map(|e| e.device.clone()).collect();
        let mut failures = Vec::new();
        for device in devices {
            if let Err(e) = device.initialize() {
                error!(device = %device.id(), error = %e, "device failed to initialise");
                failures.push((device.id().to_string(), e));
            }
            self.publish_device_status(device.as_ref()).await;
        }
        failures
    }

    /// Subscribe command topics and start one worker per commandable device.
    ///
    /// # Errors
    ///
    /// Returns the gateway error if a subscription cannot be registered.
    pub async fn start(&self) -> Result<(), HalError> {
        let topics = self.gateway.topics().clone();

        let entries = self.entries.clone();
        let estop = self
            .gateway
            .subscribe(&topics.estop(), QoS::ExactlyOnce, move |msg| {
                let reason = msg
                    .json::<EmergencyStop>()
                    .map(|e| e.reason)
                    .unwrap_or_else(|_| "emergency stop".to_string());
                stop_all(&entries.read(), &reason);
                Ok(())
            })
            .await?;
        self.subscriptions.lock().push(estop);

        let routed: Vec<Entry> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.commands.is_some())
            .cloned()
            .collect();
        for entry in routed {
            let Some(target) = entry.commands.clone() else {
                continue;
            };
            let id = entry.device.id().to_string();
            let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

            let worker = spawn_worker(id.clone(), target.clone(), self.gateway.clone(), rx);
            self.workers.lock().push(worker);

            let actuator = entry.actuator.clone();
            let device_id = id.clone();
            let sub = self
                .gateway
                .subscribe(&topics.cmd(&id), QoS::AtLeastOnce, move |msg| {
                    route_command(&device_id, msg, target.as_ref(), actuator.as_deref(), &tx)
                })
                .await?;
            self.subscriptions.lock().push(sub);
        }
        info!(devices = self.entries.read().len(), "command routing started");
        Ok(())
    }

    /// Stop every actuator immediately.
    pub fn emergency_stop_all(&self, reason: &str) {
        stop_all(&self.entries.read(), reason);
    }

    pub fn health(&self) -> Vec<DeviceStatus> {
        self.entries.read().iter().map(|e| e.device.get_status()).collect()
    }

    pub fn all_healthy(&self) -> bool {
        self.health().iter().all(DeviceStatus::is_healthy)
    }

    async fn publish_device_status(&self, device: &dyn Device) {
        let report = device.get_status().to_report();
        if let Err(e) = self.gateway.publish_status(&report).await {
            warn!(device = %device.id(), error = %e, "device status not published");
        }
    }

    /// Unsubscribe, stop the workers, then shut devices down in reverse
    /// registration order.
    pub async fn shutdown(&self) {
        let subs: Vec<SubscriptionId> = self.subscriptions.lock().drain(..).collect();
        for sub in subs {
            self.gateway.unsubscribe(sub).await;
        }
        let workers: Vec<TaskHandle> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.stop().await;
        }
        let devices: Vec<Arc<dyn Device>> = self.entries.read().iter().rev().map(|e| e.device.clone()).collect();
        for device in devices {
            if device.get_status().lifecycle != Lifecycle::Stopped {
                device.shutdown();
            }
            self.publish_device_status(device.as_ref()).await;
        }
        info!("device registry shut down");
    }
}

fn stop_all(entries: &[Entry], reason: &str) {
    for actuator in entries.iter().filter_map(|e| e.actuator.as_ref()) {
        actuator.emergency_stop(reason);
    }
}

/// Dispatch-path handling of one message on `<ns>/cmd/<id>`.
fn route_command(
    device_id: &str,
    msg: &Message,
    target: &dyn Commandable,
    actuator: Option<&dyn Actuator>,
    tx: &mpsc::Sender<Inbound>,
) -> Result<(), HalError> {
    let command = match msg.json::<Command>() {
        Ok(c) => c,
        Err(e) => {
            warn!(device = %device_id, error = %e, "malformed command");
            let _ = tx.try_send(Inbound::Malformed(e.clone()));
            return Err(e);
        }
    };
    if command.is_emergency_stop() {
        if let Some(actuator) = actuator {
            actuator.emergency_stop("emergency_stop command");
        }
        let result = target.execute_command(&command);
        let _ = tx.try_send(Inbound::Handled(result, command.command_id));
        return Ok(());
    }
    tx.try_send(Inbound::Execute(command)).map_err(|e| {
        let err = HalError::Connection(format!("command queue for {device_id} is full or closed"));
        if let mpsc::error::TrySendError::Full(Inbound::Execute(c)) = e {
            warn!(device = %device_id, command_id = %c.command_id, "command dropped, queue full");
        }
        err
    })
}

fn spawn_worker(
    device_id: String,
    target: Arc<dyn Commandable>,
    gateway: Gateway,
    mut rx: mpsc::Receiver<Inbound>,
) -> TaskHandle {
    TaskHandle::spawn(format!("commands:{device_id}"), move |mut shutdown| async move {
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let report = match item {
                Inbound::Execute(command) => {
                    let result = target.execute_command(&command);
                    outcome_report(&device_id, result, &command.command_id)
                }
                Inbound::Handled(result, command_id) => outcome_report(&device_id, result, &command_id),
                Inbound::Malformed(err) => StatusReport::new(
                    &device_id,
                    "command_rejected",
                    json!({ "kind": err.kind(), "error": err.to_string() }),
                ),
            };
            if let Err(e) = gateway.publish_status(&report).await {
                warn!(device = %device_id, error = %e, "command outcome not published");
            }
            if report.status == "command_rejected"
                && report.details["kind"] == "hardware"
                && let Err(e) = gateway.publish_status(&target.get_status().to_report()).await
            {
                warn!(device = %device_id, error = %e, "device status not published");
            }
        }
    })
}

fn outcome_report(device_id: &str, result: Result<Ack, HalError>, command_id: &str) -> StatusReport {
    match result {
        Ok(ack) => {
            info!(device = %device_id, command_id, duplicate = ack.duplicate, "command accepted");
            StatusReport::new(device_id, "command_ack", json!(ack))
        }
        Err(err) => {
            warn!(device = %device_id, command_id, error = %err, "command rejected");
            StatusReport::new(
                device_id,
                "command_rejected",
                json!({
                    "command_id": command_id,
                    "kind": err.kind(),
                    "error": err.to_string(),
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{MotionState, Motor};
    use crate::sim::SimWheel;
    use orchestrator_gateway::{LocalBroker, wait_until};
    use orchestrator_types::{GatewayConfig, MotorConfig};
    use serde_json::Value;
    use std::time::Duration;

    async fn setup() -> Result<(DeviceRegistry, Gateway, Arc<Motor>), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let config = GatewayConfig::default();
        let hal = Gateway::new(&config, Arc::new(broker.transport("hal")));
        hal.connect().await?;
        let client = Gateway::new(&config, Arc::new(broker.transport("client")));
        client.connect().await?;

        let wheel = Arc::new(SimWheel::new("wheel", 1.0));
        let motor = Arc::new(Motor::new(MotorConfig::new("left_motor", 18, 19), wheel.clone()).with_feedback(wheel));
        let registry = DeviceRegistry::new(hal);
        registry.register_actuator(motor.clone())?;
        assert!(registry.initialize_all().await.is_empty());
        registry.start().await?;
        Ok((registry, client, motor))
    }

    async fn next_status(rx: &mut mpsc::Receiver<Message>) -> Result<StatusReport, Box<dyn std::error::Error>> {
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?.ok_or("closed")?;
        Ok(msg.json()?)
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let (registry, _, motor) = setup().await?;
        let err = registry.register_actuator(motor).unwrap_err();
        assert!(matches!(err, HalError::Validation(_)));
        assert_eq!(registry.device_ids(), vec!["left_motor".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn commands_are_executed_and_acked() -> Result<(), Box<dyn std::error::Error>> {
        let (registry, client, motor) = setup().await?;
        let (_, mut status) = client
            .subscribe_channel("orchestrator/status/left_motor", QoS::AtLeastOnce, 16)
            .await?;

        let cmd = Command::new("move_forward", json!({"distance": 0.5})).with_id("c-1");
        client.publish_default("orchestrator/cmd/left_motor", &cmd).await?;

        let report = next_status(&mut status).await?;
        assert_eq!(report.status, "command_ack");
        assert_eq!(report.details["command_id"], "c-1");
        assert_eq!(motor.state(), MotionState::Accelerating);

        // Replaying the same id yields a duplicate ack.
        client.publish_default("orchestrator/cmd/left_motor", &cmd).await?;
        let report = next_status(&mut status).await?;
        assert_eq!(report.details["duplicate"], true);

        registry.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_commands_are_reported() -> Result<(), Box<dyn std::error::Error>> {
        let (registry, client, _) = setup().await?;
        let (_, mut status) = client
            .subscribe_channel("orchestrator/status/left_motor", QoS::AtLeastOnce, 16)
            .await?;

        client
            .publish_default("orchestrator/cmd/left_motor", &json!({"not": "a command"}))
            .await?;
        let report = next_status(&mut status).await?;
        assert_eq!(report.status, "command_rejected");
        assert_eq!(report.details["kind"], "validation");

        client
            .publish_default("orchestrator/cmd/left_motor", &Command::new("warp", Value::Null))
            .await?;
        let report = next_status(&mut status).await?;
        assert_eq!(report.status, "command_rejected");
        registry.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn estop_topic_stops_every_actuator() -> Result<(), Box<dyn std::error::Error>> {
        let (registry, client, motor) = setup().await?;
        motor.execute_command(&Command::new("set_speed", json!({"speed": 0.4})))?;
        motor.tick(Duration::from_millis(100));
        assert_ne!(motor.state(), MotionState::Idle);

        client.publish_emergency_stop(&EmergencyStop::new("test", None)).await?;
        assert!(wait_until(Duration::from_secs(1), || motor.state() == MotionState::Idle).await);
        registry.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_devices() -> Result<(), Box<dyn std::error::Error>> {
        let (registry, _, _) = setup().await?;
        assert!(registry.all_healthy());
        registry.shutdown().await;
        let health = registry.health();
        assert_eq!(health[0].lifecycle, Lifecycle::Stopped);
        Ok(())
    }
}
