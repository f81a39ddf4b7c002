//! [`HalService`] – everything the HAL process runs, built from one
//! [`SystemConfig`].
//!
//! Start-up order:
//!
//! 1. transport and gateway (WebSocket client when `gateway.broker_url` is
//!    set, otherwise an in-process broker, optionally served on
//!    `gateway.listen`);
//! 2. devices on simulated backends, registered and initialised;
//! 3. device tasks (control loops, scan acquisition, telemetry);
//! 4. safety monitor, state estimator, mission runner;
//! 5. heartbeat on `<ns>/status/hal`.
//!
//! [`HalService::shutdown`] unwinds in reverse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use orchestrator_estimator::{EstimatorHandle, StateEstimator};
use orchestrator_gateway::{BrokerServer, Gateway, LocalBroker, Transport, WsTransport};
use orchestrator_hal::{
    DeviceRegistry, Encoder, Lidar, Motor, SimLidar, SimWheel, TaskHandle, spawn_acquisition,
    spawn_control_loop, start_publishing,
};
use orchestrator_safety::{MonitorHandle, SafetyMonitor};
use orchestrator_types::{HalError, StatusReport, SystemConfig};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::mission::{MissionHandle, MissionRunner};

/// Status component of the heartbeat.
pub const HEARTBEAT_COMPONENT: &str = "hal";

/// Rate of the simulated wheel physics.
const SIM_RATE_HZ: f64 = 50.0;

struct BrokerListener {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    addr: SocketAddr,
}

/// The running HAL: gateway, devices and the services around them.
pub struct HalService {
    config: SystemConfig,
    gateway: Gateway,
    broker: Option<LocalBroker>,
    listener: Option<BrokerListener>,
    registry: Arc<DeviceRegistry>,
    wheels: Vec<(String, Arc<SimWheel>)>,
    lidars: Vec<(String, Arc<SimLidar>)>,
    tasks: Vec<TaskHandle>,
    monitor: Option<(Arc<SafetyMonitor>, MonitorHandle)>,
    estimator: Option<(Arc<StateEstimator>, EstimatorHandle)>,
    mission: Option<(Arc<MissionRunner>, MissionHandle)>,
}

impl HalService {
    /// Build and start everything `config` describes.
    ///
    /// An unreachable broker is not fatal: the gateway keeps retrying in the
    /// background and reliable traffic is buffered until it connects.
    ///
    /// # Errors
    ///
    /// * [`HalError::Validation`] for an invalid configuration.
    /// * [`HalError::Connection`] when `gateway.listen` cannot be bound.
    pub async fn start(config: SystemConfig) -> Result<Self, HalError> {
        config.validate()?;
        let started = Instant::now();

        let (transport, broker): (Arc<dyn Transport>, Option<LocalBroker>) = match &config.gateway.broker_url {
            Some(url) => (Arc::new(WsTransport::new(url.clone())), None),
            None => {
                let broker = LocalBroker::default();
                (Arc::new(broker.transport(config.gateway.client_id.clone())), Some(broker))
            }
        };

        let listener = match (&config.gateway.listen, &broker) {
            (Some(addr), Some(broker)) => Some(serve(addr, broker.clone()).await?),
            (Some(_), None) => {
                warn!("gateway.listen is ignored when gateway.broker_url is set");
                None
            }
            _ => None,
        };

        let gateway = Gateway::new(&config.gateway, transport);
        if let Err(e) = gateway.connect().await {
            warn!(error = %e, "broker not reachable yet, retrying in the background");
        }

        let mut service = Self {
            gateway: gateway.clone(),
            broker,
            listener,
            registry: Arc::new(DeviceRegistry::new(gateway.clone())),
            wheels: Vec::new(),
            lidars: Vec::new(),
            tasks: Vec::new(),
            monitor: None,
            estimator: None,
            mission: None,
            config,
        };
        if let Err(e) = service.build().await {
            service.shutdown().await;
            return Err(e);
        }
        info!(
            system_id = %service.config.service.system_id,
            devices = service.registry.device_ids().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "HAL service started"
        );
        Ok(service)
    }

    async fn build(&mut self) -> Result<(), HalError> {
        let config = self.config.clone();

        let mut encoders = Vec::new();
        for enc_config in config.encoders() {
            let encoder = Arc::new(Encoder::new(enc_config.clone()));
            self.registry.register_commandable(encoder.clone())?;
            encoders.push((enc_config.name.clone(), enc_config.publish_rate_hz, encoder));
        }

        let mut lidars = Vec::new();
        for lidar_config in config.lidars() {
            let source = Arc::new(SimLidar::new());
            let lidar = Arc::new(Lidar::new(lidar_config.clone(), source.clone()));
            self.registry.register_sensor(lidar.clone())?;
            self.lidars.push((lidar_config.name.clone(), source));
            lidars.push((lidar_config.publish_rate_hz, lidar));
        }

        let mut motors = Vec::new();
        for motor_config in &config.motors {
            let mut wheel = SimWheel::new(format!("{}_wheel", motor_config.name), motor_config.max_speed);
            let encoder = motor_config
                .encoder
                .as_ref()
                .and_then(|name| encoders.iter().find(|(n, _, _)| n == name))
                .map(|(_, _, e)| e.clone());
            let motor = match encoder {
                Some(encoder) => {
                    wheel = wheel.with_encoder(encoder.clone());
                    let wheel = Arc::new(wheel);
                    self.wheels.push((motor_config.name.clone(), wheel.clone()));
                    Motor::new(motor_config.clone(), wheel).with_feedback(encoder)
                }
                None => {
                    let wheel = Arc::new(wheel);
                    self.wheels.push((motor_config.name.clone(), wheel.clone()));
                    Motor::new(motor_config.clone(), wheel.clone()).with_feedback(wheel)
                }
            };
            let motor = Arc::new(motor);
            self.registry.register_actuator(motor.clone())?;
            motors.push(motor);
        }

        for (device, err) in self.registry.initialize_all().await {
            error!(device = %device, error = %err, "device failed to initialise");
        }
        self.registry.start().await?;

        for (_, wheel) in &self.wheels {
            self.tasks.push(wheel.clone().spawn(SIM_RATE_HZ));
        }
        for motor in motors {
            self.tasks.push(spawn_control_loop(motor, self.gateway.clone()));
        }
        for (_, rate, encoder) in encoders {
            self.tasks.push(start_publishing(encoder, self.gateway.clone(), rate));
        }
        for (rate, lidar) in lidars {
            self.tasks.push(spawn_acquisition(lidar.clone()));
            self.tasks.push(start_publishing(lidar, self.gateway.clone(), rate));
        }

        if config.safety.enabled && config.service.embedded_safety_monitor {
            let monitor = Arc::new(SafetyMonitor::new(config.safety.clone(), self.gateway.clone())?);
            let handle = monitor.clone().spawn_dedicated().await?;
            self.monitor = Some((monitor, handle));
        } else if config.safety.enabled {
            info!("safety monitor expected as a separate process");
        } else {
            warn!("safety monitor disabled");
        }

        if config.estimator.enabled {
            let estimator = Arc::new(StateEstimator::new(config.estimator.clone(), self.gateway.clone())?);
            let handle = estimator.clone().spawn().await?;
            self.estimator = Some((estimator, handle));
        }

        let runner = Arc::new(MissionRunner::new(self.gateway.clone()));
        let handle = runner.clone().spawn().await?;
        self.mission = Some((runner, handle));

        self.tasks.push(spawn_heartbeat(
            self.gateway.clone(),
            self.registry.clone(),
            config.service.system_id.clone(),
            Duration::from_secs_f64(config.service.heartbeat_interval_secs),
        ));
        Ok(())
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The in-process broker, when no external one is configured.
    pub fn broker(&self) -> Option<&LocalBroker> {
        self.broker.as_ref()
    }

    /// Address the WebSocket broker is listening on.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.addr)
    }

    pub fn safety_monitor(&self) -> Option<&Arc<SafetyMonitor>> {
        self.monitor.as_ref().map(|(m, _)| m)
    }

    pub fn estimator(&self) -> Option<&Arc<StateEstimator>> {
        self.estimator.as_ref().map(|(e, _)| e)
    }

    pub fn mission_runner(&self) -> Option<&Arc<MissionRunner>> {
        self.mission.as_ref().map(|(r, _)| r)
    }

    /// Simulated ranging backend of the lidar `name`.
    pub fn sim_lidar(&self, name: &str) -> Option<Arc<SimLidar>> {
        self.lidars.iter().find(|(n, _)| n == name).map(|(_, l)| l.clone())
    }

    /// Simulated wheel driven by the motor `name`.
    pub fn sim_wheel(&self, name: &str) -> Option<Arc<SimWheel>> {
        self.wheels.iter().find(|(n, _)| n == name).map(|(_, w)| w.clone())
    }

    /// Stop everything and disconnect.  Actuators are stopped before the
    /// gateway goes away.
    pub async fn shutdown(mut self) {
        info!("HAL service shutting down");
        if let Some((_, handle)) = self.mission.take() {
            handle.stop().await;
        }
        if let Some((_, handle)) = self.estimator.take() {
            handle.stop().await;
        }
        if let Some((_, handle)) = self.monitor.take() {
            handle.stop().await;
        }
        self.registry.shutdown().await;
        for task in self.tasks.drain(..).rev() {
            task.stop().await;
        }
        self.gateway.disconnect().await;
        if let Some(listener) = self.listener.take() {
            listener.shutdown.send_replace(true);
            if let Err(e) = listener.task.await {
                warn!(error = %e, "broker listener ended abnormally");
            }
        }
        info!("HAL service stopped");
    }
}

async fn serve(addr: &str, broker: LocalBroker) -> Result<BrokerListener, HalError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| HalError::Connection(format!("cannot listen on {addr}: {e}")))?;
    let bound = listener
        .local_addr()
        .map_err(|e| HalError::Connection(format!("cannot listen on {addr}: {e}")))?;
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(BrokerServer::new(broker).serve(listener, rx));
    info!(addr = %bound, "broker listening");
    Ok(BrokerListener {
        shutdown,
        task,
        addr: bound,
    })
}

/// Publish the HAL heartbeat on `<ns>/status/hal` every `interval`.
pub fn spawn_heartbeat(
    gateway: Gateway,
    registry: Arc<DeviceRegistry>,
    system_id: String,
    interval: Duration,
) -> TaskHandle {
    TaskHandle::spawn("heartbeat", move |mut shutdown| async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let devices = registry.health();
            let healthy = devices.iter().all(|d| d.is_healthy());
            let report = StatusReport::new(
                HEARTBEAT_COMPONENT,
                if healthy { "running" } else { "degraded" },
                json!({
                    "system_id": system_id,
                    "uptime_secs": started.elapsed().as_secs_f64(),
                    "devices": devices,
                    "gateway": gateway.status(),
                }),
            );
            if let Err(e) = gateway.publish_status(&report).await {
                warn!(error = %e, "heartbeat not published");
            }
        }
    })
}
