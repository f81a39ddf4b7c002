//! [`StateEstimator`] – the robot's pose as seen through its wheel encoders.
//!
//! Consumes encoder telemetry, integrates it with [`Odometry`], accepts
//! pose and status commands on `<ns>/cmd/state_estimator`, reacts to the
//! emergency stop topic, and republishes [`RobotState`] on
//! `<ns>/status/robot` at a fixed rate whether or not new data arrived.

use std::sync::Arc;
use std::time::Duration;

use orchestrator_gateway::{Gateway, Message, QoS, SubscriptionId};
use orchestrator_types::{
    Ack, Command, EncoderReading, EstimatorConfig, HalError, RobotState, RobotStatus, StatusReport,
    TelemetrySample,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::odometry::{Odometry, Side, WheelPairing};

/// Component id used for commands and command outcomes.
pub const ESTIMATOR_ID: &str = "state_estimator";

/// Component id of the published robot state.
pub const ROBOT_STATE_COMPONENT: &str = "robot";

const INPUT_QUEUE: usize = 32;

/// Commands accepted on `<ns>/cmd/state_estimator`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", content = "parameters", rename_all = "snake_case")]
pub enum EstimatorAction {
    ResetOdometry,
    /// `heading` in degrees.
    SetPosition {
        x: f64,
        y: f64,
        #[serde(default)]
        heading: f64,
    },
    SetStatus {
        status: RobotStatus,
    },
}

struct EstimatorState {
    odometry: Odometry,
    pairing: WheelPairing,
    status: RobotStatus,
    last_encoder: Option<Instant>,
}

pub struct StateEstimator {
    config: EstimatorConfig,
    gateway: Gateway,
    state: Mutex<EstimatorState>,
}

impl StateEstimator {
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] for an invalid configuration.
    pub fn new(config: EstimatorConfig, gateway: Gateway) -> Result<Self, HalError> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(EstimatorState {
                odometry: Odometry::new(config.wheel_base),
                pairing: WheelPairing::new(),
                status: RobotStatus::Idle,
                last_encoder: None,
            }),
            config,
            gateway,
        })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Which wheel `device_id` belongs to, if either.
    pub fn side_of(&self, device_id: &str) -> Option<Side> {
        if device_id == self.config.left_encoder {
            Some(Side::Left)
        } else if device_id == self.config.right_encoder {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Feed one encoder reading observed at `at`.  Returns `true` when it
    /// completed a left/right pair and the pose advanced.
    pub fn on_encoder(&self, side: Side, reading: &EncoderReading, at: Instant) -> bool {
        let mut state = self.state.lock();
        state.last_encoder = Some(at);
        let Some(deltas) = state.pairing.update(side, reading.total_distance, reading.resets, at) else {
            return false;
        };
        let velocity = state.odometry.integrate(deltas.left, deltas.right, deltas.dt);
        if state.status == RobotStatus::EmergencyStop {
            state.odometry.stop();
        }
        debug!(
            dl = deltas.left,
            dr = deltas.right,
            linear = velocity.linear,
            angular = velocity.angular,
            "odometry updated"
        );
        true
    }

    /// # Errors
    ///
    /// Returns [`HalError::Validation`] for an unknown action or bad
    /// parameters.
    pub fn execute(&self, command: &Command) -> Result<Ack, HalError> {
        let action = command.parse_action::<EstimatorAction>()?;
        let mut state = self.state.lock();
        match action {
            EstimatorAction::ResetOdometry => {
                state.odometry.reset();
                state.pairing.rebase();
                info!("odometry reset to origin");
            }
            EstimatorAction::SetPosition { x, y, heading } => {
                if !(x.is_finite() && y.is_finite() && heading.is_finite()) {
                    return Err(HalError::validation("set_position needs finite x, y and heading"));
                }
                state.odometry.set_pose(x, y, heading.to_radians());
                state.pairing.rebase();
                info!(x, y, heading_deg = heading, "pose set");
            }
            EstimatorAction::SetStatus { status } => {
                if status != state.status {
                    info!(from = ?state.status, to = ?status, "robot status changed");
                }
                state.status = status;
            }
        }
        Ok(Ack::accepted(&command.command_id, ESTIMATOR_ID))
    }

    /// Mark the robot stopped; the pose is kept.
    pub fn emergency_stop(&self, reason: &str) {
        let mut state = self.state.lock();
        state.status = RobotStatus::EmergencyStop;
        state.odometry.stop();
        warn!(reason, "robot state: emergency stop");
    }

    pub fn status(&self) -> RobotStatus {
        self.state.lock().status
    }

    /// Current state at `now`, flagged stale when the last encoder sample
    /// is older than `stale_after_secs`.
    pub fn snapshot(&self, now: Instant) -> RobotState {
        let stale_after = Duration::from_secs_f64(self.config.stale_after_secs);
        let state = self.state.lock();
        RobotState {
            pose: state.odometry.pose(),
            velocity: state.odometry.velocity(),
            status: state.status,
            update_count: state.odometry.update_count(),
            odometry_stale: state
                .last_encoder
                .is_none_or(|t| now.saturating_duration_since(t) > stale_after),
        }
    }

    async fn publish_state(&self) {
        let topic = self.gateway.topics().status(ROBOT_STATE_COMPONENT);
        let snapshot = self.snapshot(Instant::now());
        if let Err(e) = self.gateway.publish(&topic, &snapshot, QoS::AtLeastOnce).await {
            debug!(error = %e, "robot state not published");
        }
    }

    async fn handle_command(&self, msg: &Message) {
        let (report, command_id) = match msg.json::<Command>() {
            Ok(command) => {
                let result = self.execute(&command);
                (outcome_report(result, &command.command_id), command.command_id)
            }
            Err(e) => (outcome_report(Err(e), ""), String::new()),
        };
        if report.status == "command_rejected" {
            warn!(command_id = %command_id, details = %report.details, "estimator command rejected");
        }
        if let Err(e) = self.gateway.publish_status(&report).await {
            warn!(error = %e, "command outcome not published");
        }
    }

    fn handle_encoder(&self, side: Side, msg: &Message) {
        match msg.json::<TelemetrySample<EncoderReading>>() {
            Ok(sample) => {
                self.on_encoder(side, &sample.data, Instant::now());
            }
            Err(e) => debug!(topic = %msg.topic, error = %e, "ignoring malformed encoder sample"),
        }
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Subscribe to encoder data, commands and the emergency stop topic and
    /// start the publishing loop.  The robot is marked active.
    pub async fn spawn(self: Arc<Self>) -> Result<EstimatorHandle, HalError> {
        let topics = self.gateway.topics().clone();
        let mut subscriptions = Vec::with_capacity(4);

        let this = self.clone();
        let estop = self
            .gateway
            .subscribe(&topics.estop(), QoS::ExactlyOnce, move |msg| {
                let reason = msg
                    .json::<serde_json::Value>()
                    .ok()
                    .and_then(|v| v["reason"].as_str().map(str::to_string))
                    .unwrap_or_else(|| "emergency_stop".to_string());
                this.emergency_stop(&reason);
                Ok(())
            })
            .await?;
        subscriptions.push(estop);

        let mut receivers = Vec::with_capacity(3);
        for topic in [
            topics.data(&self.config.left_encoder),
            topics.data(&self.config.right_encoder),
            topics.cmd(ESTIMATOR_ID),
        ] {
            let qos = if topic.contains("/cmd/") { QoS::AtLeastOnce } else { QoS::AtMostOnce };
            match self.gateway.subscribe_channel(&topic, qos, INPUT_QUEUE).await {
                Ok((id, rx)) => {
                    subscriptions.push(id);
                    receivers.push(rx);
                }
                Err(e) => {
                    for id in subscriptions {
                        self.gateway.unsubscribe(id).await;
                    }
                    return Err(e);
                }
            }
        }
        let commands = receivers.pop();
        let right = receivers.pop();
        let left = receivers.pop();
        let (Some(left), Some(right), Some(commands)) = (left, right, commands) else {
            return Err(HalError::Connection("estimator subscriptions incomplete".to_string()));
        };

        {
            let mut state = self.state.lock();
            if state.status == RobotStatus::Idle {
                state.status = RobotStatus::Active;
            }
        }
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(self.clone().run(left, right, commands, shutdown));
        Ok(EstimatorHandle {
            gateway: self.gateway.clone(),
            subscriptions,
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(
        self: Arc<Self>,
        mut left: mpsc::Receiver<Message>,
        mut right: mpsc::Receiver<Message>,
        mut commands: mpsc::Receiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            left = %self.config.left_encoder,
            right = %self.config.right_encoder,
            wheel_base = self.config.wheel_base,
            rate_hz = self.config.publish_rate_hz,
            "state estimator running"
        );
        let period = Duration::from_secs_f64(1.0 / self.config.publish_rate_hz.clamp(0.1, 100.0));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(msg) = commands.recv() => self.handle_command(&msg).await,
                Some(msg) = left.recv() => self.handle_encoder(Side::Left, &msg),
                Some(msg) = right.recv() => self.handle_encoder(Side::Right, &msg),
                _ = ticker.tick() => self.publish_state().await,
            }
        }
        info!(updates = self.snapshot(Instant::now()).update_count, "state estimator stopped");
    }
}

fn outcome_report(result: Result<Ack, HalError>, command_id: &str) -> StatusReport {
    match result {
        Ok(ack) => StatusReport::new(ESTIMATOR_ID, "command_ack", json!(ack)),
        Err(err) => StatusReport::new(
            ESTIMATOR_ID,
            "command_rejected",
            json!({
                "command_id": (!command_id.is_empty()).then_some(command_id),
                "kind": err.kind(),
                "error": err.to_string(),
            }),
        ),
    }
}

/// Owns a running estimator.
pub struct EstimatorHandle {
    gateway: Gateway,
    subscriptions: Vec<SubscriptionId>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EstimatorHandle {
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "state estimator task ended abnormally");
        }
        for id in self.subscriptions {
            self.gateway.unsubscribe(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use orchestrator_gateway::LocalBroker;
    use orchestrator_types::{EmergencyStop, EncoderMode, GatewayConfig};
    use serde_json::Value;
    use std::f64::consts::FRAC_PI_2;

    fn reading(total_distance: f64) -> EncoderReading {
        EncoderReading {
            tick_count: (total_distance / 0.001).round() as i64,
            total_distance,
            velocity: 0.0,
            direction: 1,
            rpm: 0.0,
            distance_per_tick: 0.001,
            interrupt_count: 0,
            mode: EncoderMode::Quadrature,
            direction_ambiguous: false,
            last_edge_age_ms: None,
            resets: 0,
        }
    }

    fn offline() -> StateEstimator {
        let gateway = Gateway::new(
            &GatewayConfig::default(),
            Arc::new(LocalBroker::default().transport("estimator")),
        );
        StateEstimator::new(EstimatorConfig::default(), gateway).unwrap()
    }

    #[tokio::test]
    async fn pairs_of_readings_move_the_pose() {
        let est = offline();
        let t0 = Instant::now();
        assert!(!est.on_encoder(Side::Left, &reading(0.0), t0));
        assert!(est.on_encoder(Side::Right, &reading(0.0), t0));

        let t1 = t0 + Duration::from_millis(100);
        est.on_encoder(Side::Left, &reading(0.1), t1);
        assert!(est.on_encoder(Side::Right, &reading(0.1), t1));
        let state = est.snapshot(t1);
        assert_relative_eq!(state.pose.x, 0.1, epsilon = 1e-12);
        assert_relative_eq!(state.velocity.linear, 1.0, epsilon = 1e-9);
        assert_eq!(state.update_count, 2);
        assert!(!state.odometry_stale);
    }

    #[tokio::test]
    async fn state_goes_stale_without_encoder_data() {
        let est = offline();
        let t0 = Instant::now();
        assert!(est.snapshot(t0).odometry_stale);
        est.on_encoder(Side::Left, &reading(0.0), t0);
        assert!(!est.snapshot(t0 + Duration::from_millis(900)).odometry_stale);
        assert!(est.snapshot(t0 + Duration::from_millis(1100)).odometry_stale);
    }

    #[tokio::test]
    async fn set_position_takes_degrees() {
        let est = offline();
        est.execute(&Command::new("set_position", json!({"x": 1.0, "y": -2.0, "heading": 90.0})))
            .unwrap();
        let pose = est.snapshot(Instant::now()).pose;
        assert_relative_eq!(pose.x, 1.0);
        assert_relative_eq!(pose.y, -2.0);
        assert_relative_eq!(pose.heading, FRAC_PI_2, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn reset_does_not_replay_past_travel() {
        let est = offline();
        let t0 = Instant::now();
        est.on_encoder(Side::Left, &reading(2.0), t0);
        est.on_encoder(Side::Right, &reading(2.0), t0);
        est.execute(&Command::new("reset_odometry", Value::Null)).unwrap();
        assert_relative_eq!(est.snapshot(t0).pose.x, 0.0);

        est.on_encoder(Side::Left, &reading(2.5), t0);
        est.on_encoder(Side::Right, &reading(2.5), t0);
        assert_relative_eq!(est.snapshot(t0).pose.x, 0.5, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn encoder_reset_does_not_move_the_pose_back() {
        let est = offline();
        let t0 = Instant::now();
        est.on_encoder(Side::Left, &reading(0.0), t0);
        est.on_encoder(Side::Right, &reading(0.0), t0);
        let t1 = t0 + Duration::from_millis(100);
        est.on_encoder(Side::Left, &reading(2.0), t1);
        est.on_encoder(Side::Right, &reading(2.0), t1);
        assert_relative_eq!(est.snapshot(t1).pose.x, 2.0, epsilon = 1e-12);

        let t2 = t1 + Duration::from_millis(100);
        let restarted = EncoderReading {
            resets: 1,
            ..reading(0.1)
        };
        est.on_encoder(Side::Left, &restarted, t2);
        assert!(est.on_encoder(Side::Right, &reading(2.1), t2));
        let state = est.snapshot(t2);
        assert_relative_eq!(state.pose.x, 2.1, epsilon = 1e-9);
        assert_relative_eq!(state.pose.heading, 0.0, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn status_commands_are_validated() {
        let est = offline();
        est.execute(&Command::new("set_status", json!({"status": "error"}))).unwrap();
        assert_eq!(est.status(), RobotStatus::Error);
        let err = est
            .execute(&Command::new("set_status", json!({"status": "dancing"})))
            .unwrap_err();
        assert!(matches!(err, HalError::Validation(_)));
        assert!(est.execute(&Command::new("teleport", Value::Null)).is_err());
    }

    #[tokio::test]
    async fn emergency_stop_zeroes_velocity_and_keeps_pose() {
        let est = offline();
        let t0 = Instant::now();
        est.on_encoder(Side::Left, &reading(0.0), t0);
        est.on_encoder(Side::Right, &reading(0.0), t0);
        let t1 = t0 + Duration::from_millis(100);
        est.on_encoder(Side::Left, &reading(0.1), t1);
        est.on_encoder(Side::Right, &reading(0.1), t1);

        est.emergency_stop("test");
        let state = est.snapshot(t1);
        assert_eq!(state.status, RobotStatus::EmergencyStop);
        assert_eq!(state.velocity.linear, 0.0);
        assert_relative_eq!(state.pose.x, 0.1, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn runs_over_the_gateway() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LocalBroker::default();
        let config = GatewayConfig::default();
        let side = Gateway::new(&config, Arc::new(broker.transport("estimator")));
        side.connect().await?;
        let client = Gateway::new(&config, Arc::new(broker.transport("client")));
        client.connect().await?;
        let (_, mut robot) = client
            .subscribe_channel("orchestrator/status/robot", QoS::AtLeastOnce, 256)
            .await?;
        let (_, mut acks) = client
            .subscribe_channel("orchestrator/status/state_estimator", QoS::AtLeastOnce, 16)
            .await?;

        let est = Arc::new(StateEstimator::new(EstimatorConfig::default(), side)?);
        let handle = est.clone().spawn().await?;
        assert_eq!(est.status(), RobotStatus::Active);

        for total in [0.0, 0.2] {
            client
                .publish_telemetry(&TelemetrySample::new("left_encoder", reading(total)))
                .await?;
            client
                .publish_telemetry(&TelemetrySample::new("right_encoder", reading(total)))
                .await?;
        }

        let moved = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(msg) = robot.recv().await {
                let state: RobotState = msg.json().ok()?;
                if state.pose.x > 0.19 {
                    return Some(state);
                }
            }
            None
        })
        .await?
        .ok_or("no robot state")?;
        assert!(!moved.odometry_stale);

        let cmd = Command::new("set_position", json!({"x": 0.0, "y": 0.0, "heading": 180.0})).with_id("p-1");
        client.publish_default("orchestrator/cmd/state_estimator", &cmd).await?;
        let ack = tokio::time::timeout(Duration::from_secs(1), acks.recv()).await?.ok_or("closed")?;
        let report: StatusReport = ack.json()?;
        assert_eq!(report.status, "command_ack");
        assert_eq!(report.details["command_id"], "p-1");

        client
            .publish_emergency_stop(&EmergencyStop::new("obstacle_detected", None))
            .await?;
        assert!(orchestrator_gateway::wait_until(Duration::from_secs(1), || {
            est.status() == RobotStatus::EmergencyStop
        })
        .await);

        handle.stop().await;
        Ok(())
    }
}
