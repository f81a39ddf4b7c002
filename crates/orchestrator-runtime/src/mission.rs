//! Mission sequencer.
//!
//! A mission is an ordered list of [`MissionStep`]s executed one at a time:
//! motor commands are published to the target device and the step finishes
//! when the device reports back, wait steps finish when their timer runs out.
//!
//! # States
//!
//! | State         | Reached by                                   | Leaves via                   |
//! |---------------|----------------------------------------------|------------------------------|
//! | `loaded`      | [`Mission::load`]                            | `start`, `stop`              |
//! | `in_progress` | `start`, `resume`                            | `pause`, `stop`, last step, failure |
//! | `paused`      | `pause`                                      | `resume`, `stop`             |
//! | `completed`   | the last step finishing                      | `start` (runs again)         |
//! | `failed`      | a step failing, timing out, emergency stop   | `start`                      |
//! | `stopped`     | `stop`                                       | `start`                      |
//!
//! Anything else is a [`HalError::Validation`].
//!
//! [`Mission`] is the pure state machine; [`MissionRunner`] drives it over
//! the gateway, listening on `<ns>/cmd/mission` and reporting on
//! `<ns>/status/mission`.
//!
//! # Example
//!
//! ```rust
//! use orchestrator_hal::MotorAction;
//! use orchestrator_runtime::mission::{Mission, MissionState, MissionStep, StepDispatch};
//!
//! let mut mission = Mission::load("patrol", vec![
//!     MissionStep::Move {
//!         device: "left_motor".into(),
//!         action: MotorAction::Stop,
//!         timeout_secs: 5.0,
//!     },
//! ]).unwrap();
//! mission.start().unwrap();
//! let Some(StepDispatch::Command { command, .. }) = mission.next_command().unwrap() else {
//!     panic!("expected a command");
//! };
//! assert!(mission.step_completed(&command.command_id).unwrap());
//! assert_eq!(mission.state(), MissionState::Completed);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use orchestrator_gateway::{Gateway, Message, QoS, SubscriptionId, parse_topic};
use orchestrator_hal::MotorAction;
use orchestrator_types::{Ack, Command, EmergencyStop, HalError, StatusReport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Component id for mission commands and status.
pub const MISSION_ID: &str = "mission";

pub const DEFAULT_STEP_TIMEOUT_SECS: f64 = 30.0;

/// Longest wait or step timeout a mission may ask for (one week).
pub const MAX_STEP_SECS: f64 = 7.0 * 24.0 * 3600.0;

const INPUT_QUEUE: usize = 256;

fn default_step_timeout() -> f64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// `secs` as a [`Duration`] within `0..=MAX_STEP_SECS`.
fn step_duration(what: &str, secs: f64) -> Result<Duration, HalError> {
    if !(0.0..=MAX_STEP_SECS).contains(&secs) {
        return Err(HalError::validation(format!("{what} of {secs} s is out of range")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|_| HalError::validation(format!("{what} of {secs} s is out of range")))
}

// ────────────────────────────────────────────────────────────────────────────
// Steps
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionStep {
    /// Send `action` to the motor `device`.
    Move {
        device: String,
        action: MotorAction,
        #[serde(default = "default_step_timeout")]
        timeout_secs: f64,
    },
    Wait { secs: f64 },
}

/// What finishes the step currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The device acknowledged the command.
    Acknowledged,
    /// The device reported `movement_completed` for the command.
    MovementFinished,
    /// The step's timer ran out.
    Elapsed,
}

impl MissionStep {
    fn validate(&self, index: usize) -> Result<(), HalError> {
        let invalid = |why: String| HalError::validation(format!("mission step {}: {why}", index + 1));
        match self {
            MissionStep::Move {
                device,
                action,
                timeout_secs,
            } => {
                if device.is_empty() || !device.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(invalid(format!("`{device}` is not a device name")));
                }
                if !(timeout_secs.is_finite() && *timeout_secs > 0.0) {
                    return Err(invalid(format!("timeout_secs = {timeout_secs} must be positive")));
                }
                if *timeout_secs > MAX_STEP_SECS {
                    return Err(invalid(format!("timeout_secs = {timeout_secs} exceeds {MAX_STEP_SECS} s")));
                }
                let magnitude = match action {
                    MotorAction::MoveForward { distance, .. } | MotorAction::MoveBackward { distance, .. } => {
                        Some(*distance)
                    }
                    MotorAction::RotateLeft { angle, .. } | MotorAction::RotateRight { angle, .. } => Some(*angle),
                    _ => None,
                };
                if let Some(m) = magnitude
                    && !(m.is_finite() && m > 0.0)
                {
                    return Err(invalid(format!("target {m} must be positive")));
                }
                Ok(())
            }
            MissionStep::Wait { secs } => {
                if (0.0..=MAX_STEP_SECS).contains(secs) {
                    Ok(())
                } else {
                    Err(invalid(format!("wait of {secs} s is outside 0..={MAX_STEP_SECS}")))
                }
            }
        }
    }

    fn completion(&self) -> Completion {
        match self {
            MissionStep::Move { action, .. } => match action {
                MotorAction::MoveForward { .. }
                | MotorAction::MoveBackward { .. }
                | MotorAction::RotateLeft { .. }
                | MotorAction::RotateRight { .. } => Completion::MovementFinished,
                MotorAction::SetSpeed { .. } | MotorAction::Stop | MotorAction::EmergencyStop => {
                    Completion::Acknowledged
                }
            },
            MissionStep::Wait { .. } => Completion::Elapsed,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// State machine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionState {
    Loaded,
    InProgress,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl MissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionState::Loaded => "loaded",
            MissionState::InProgress => "in_progress",
            MissionState::Paused => "paused",
            MissionState::Completed => "completed",
            MissionState::Failed => "failed",
            MissionState::Stopped => "stopped",
        }
    }

    /// `in_progress` or `paused`.
    pub fn is_active(&self) -> bool {
        matches!(self, MissionState::InProgress | MissionState::Paused)
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `<ns>/status/mission`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionStatus {
    pub mission_id: String,
    pub status: MissionState,
    /// Index of the step in flight; equals `total_steps` once completed.
    pub current_step: usize,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The step currently in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending {
    /// Command id for device steps, a synthetic id for waits.
    pub token: String,
    pub device: Option<String>,
    pub completion: Completion,
    /// Step timeout, or the wait duration.
    pub timeout: Duration,
}

/// What the runner has to do for the next step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepDispatch {
    Command {
        device: String,
        command: Command,
        timeout: Duration,
    },
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct Mission {
    id: String,
    steps: Vec<MissionStep>,
    state: MissionState,
    current: usize,
    pending: Option<Pending>,
    reason: Option<String>,
    runs: u32,
}

impl Mission {
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] for an empty mission or an invalid
    /// step.
    pub fn load(id: impl Into<String>, steps: Vec<MissionStep>) -> Result<Self, HalError> {
        let id = id.into();
        if id.is_empty() {
            return Err(HalError::validation("mission id must not be empty"));
        }
        if steps.is_empty() {
            return Err(HalError::validation(format!("mission `{id}` has no steps")));
        }
        for (i, step) in steps.iter().enumerate() {
            step.validate(i)?;
        }
        Ok(Self {
            id,
            steps,
            state: MissionState::Loaded,
            current: 0,
            pending: None,
            reason: None,
            runs: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> MissionState {
        self.state
    }

    pub fn current_step(&self) -> usize {
        self.current
    }

    pub fn steps(&self) -> &[MissionStep] {
        &self.steps
    }

    pub fn pending(&self) -> Option<&Pending> {
        self.pending.as_ref()
    }

    fn refuse(&self, op: &str) -> HalError {
        HalError::validation(format!("cannot {op} mission `{}` while {}", self.id, self.state))
    }

    /// Run from the first step.  Allowed from every state except the two
    /// active ones.
    pub fn start(&mut self) -> Result<(), HalError> {
        if self.state.is_active() {
            return Err(self.refuse("start"));
        }
        self.state = MissionState::InProgress;
        self.current = 0;
        self.pending = None;
        self.reason = None;
        self.runs += 1;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), HalError> {
        if self.state != MissionState::InProgress {
            return Err(self.refuse("pause"));
        }
        self.state = MissionState::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), HalError> {
        if self.state != MissionState::Paused {
            return Err(self.refuse("resume"));
        }
        self.state = MissionState::InProgress;
        Ok(())
    }

    /// Stop the mission and return the device that was executing a step, if
    /// any, so the caller can halt it.
    pub fn stop(&mut self) -> Result<Option<String>, HalError> {
        if !(self.state.is_active() || self.state == MissionState::Loaded) {
            return Err(self.refuse("stop"));
        }
        self.state = MissionState::Stopped;
        Ok(self.pending.take().and_then(|p| p.device))
    }

    /// Fail an active mission from outside, e.g. on emergency stop.  Returns
    /// `false` when there was nothing to abort.
    pub fn abort(&mut self, reason: impl Into<String>) -> bool {
        if !self.state.is_active() {
            return false;
        }
        self.state = MissionState::Failed;
        self.reason = Some(reason.into());
        self.pending = None;
        true
    }

    /// Take the next step if the mission is running and nothing is in
    /// flight.
    pub fn next_command(&mut self) -> Result<Option<StepDispatch>, HalError> {
        if self.state != MissionState::InProgress || self.pending.is_some() {
            return Ok(None);
        }
        let Some(step) = self.steps.get(self.current) else {
            return Ok(None);
        };
        let token = format!("{}-r{}-s{}", self.id, self.runs, self.current + 1);
        let completion = step.completion();
        let (dispatch, device, timeout) = match step {
            MissionStep::Move {
                device,
                action,
                timeout_secs,
            } => {
                let timeout = step_duration("timeout", *timeout_secs)?;
                let command = Command::from_action(action)?.with_id(token.clone());
                let dispatch = StepDispatch::Command {
                    device: device.clone(),
                    command,
                    timeout,
                };
                (dispatch, Some(device.clone()), timeout)
            }
            MissionStep::Wait { secs } => {
                let timeout = step_duration("wait", *secs)?;
                (StepDispatch::Wait(timeout), None, timeout)
            }
        };
        self.pending = Some(Pending {
            token,
            device,
            completion,
            timeout,
        });
        Ok(Some(dispatch))
    }

    fn settle(&mut self, op: &str, token: &str) -> Result<bool, HalError> {
        if !self.state.is_active() {
            return Err(self.refuse(op));
        }
        Ok(self.pending.as_ref().is_some_and(|p| p.token == token))
    }

    /// Mark the step identified by `token` done.  A token that is not in
    /// flight returns `Ok(false)`.
    pub fn step_completed(&mut self, token: &str) -> Result<bool, HalError> {
        if !self.settle("complete a step of", token)? {
            return Ok(false);
        }
        self.pending = None;
        self.current += 1;
        if self.current >= self.steps.len() {
            self.state = MissionState::Completed;
        }
        Ok(true)
    }

    pub fn step_failed(&mut self, token: &str, reason: &str) -> Result<bool, HalError> {
        if !self.settle("fail a step of", token)? {
            return Ok(false);
        }
        self.pending = None;
        self.state = MissionState::Failed;
        self.reason = Some(format!("step {}: {reason}", self.current + 1));
        Ok(true)
    }

    pub fn status(&self) -> MissionStatus {
        MissionStatus {
            mission_id: self.id.clone(),
            status: self.state,
            current_step: self.current,
            total_steps: self.steps.len(),
            reason: self.reason.clone(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Runner
// ────────────────────────────────────────────────────────────────────────────

/// Commands accepted on `<ns>/cmd/mission`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "parameters", rename_all = "snake_case")]
pub enum MissionAction {
    LoadMission {
        #[serde(default)]
        mission_id: Option<String>,
        steps: Vec<MissionStep>,
    },
    StartMission,
    PauseMission,
    ResumeMission,
    StopMission,
}

#[derive(Default)]
struct RunnerState {
    mission: Option<Mission>,
    deadline: Option<Instant>,
}

/// Drives one [`Mission`] at a time over the gateway.
pub struct MissionRunner {
    gateway: Gateway,
    state: Mutex<RunnerState>,
}

impl MissionRunner {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            state: Mutex::new(RunnerState::default()),
        }
    }

    pub fn status(&self) -> Option<MissionStatus> {
        self.state.lock().mission.as_ref().map(Mission::status)
    }

    /// Apply one mission command.  Returns the device to halt when a running
    /// step was stopped.
    pub fn apply(&self, action: MissionAction, now: Instant) -> Result<Option<String>, HalError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let MissionAction::LoadMission { mission_id, steps } = action {
            if state.mission.as_ref().is_some_and(|m| m.state().is_active()) {
                return Err(HalError::validation("a mission is already running"));
            }
            let id = mission_id.unwrap_or_else(|| format!("mission_{}", Uuid::new_v4().simple()));
            state.mission = Some(Mission::load(id, steps)?);
            state.deadline = None;
            return Ok(None);
        }
        let mission = state
            .mission
            .as_mut()
            .ok_or_else(|| HalError::validation("no mission loaded"))?;
        let halt = match action {
            MissionAction::StartMission => mission.start().map(|()| None)?,
            MissionAction::PauseMission => mission.pause().map(|()| None)?,
            MissionAction::ResumeMission => {
                mission.resume()?;
                // The step in flight gets its full timeout again.
                state.deadline = mission.pending().map(|p| now + p.timeout);
                return Ok(None);
            }
            MissionAction::StopMission => mission.stop()?,
            MissionAction::LoadMission { .. } => None,
        };
        state.deadline = None;
        Ok(halt)
    }

    async fn publish_status(&self) {
        let Some(status) = self.status() else {
            return;
        };
        let report = StatusReport::new(MISSION_ID, status.status.as_str(), json!(status));
        if let Err(e) = self.gateway.publish_status(&report).await {
            warn!(error = %e, "mission status not published");
        }
    }

    /// Dispatch the next step, if one is due.
    async fn pump(&self) {
        let next = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(mission) = state.mission.as_mut() else {
                return;
            };
            let next = mission.next_command();
            match &next {
                Ok(Some(StepDispatch::Command { timeout, .. })) | Ok(Some(StepDispatch::Wait(timeout))) => {
                    state.deadline = Some(Instant::now() + *timeout);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "mission step could not be built");
                    mission.abort(e.to_string());
                    state.deadline = None;
                }
            }
            next
        };
        let (device, command) = match next {
            Ok(Some(StepDispatch::Command { device, command, .. })) => (device, command),
            Ok(_) => return,
            Err(_) => return self.publish_status().await,
        };
        info!(device = %device, command_id = %command.command_id, action = %command.action, "mission step dispatched");
        let topic = self.gateway.topics().cmd(&device);
        if let Err(e) = self.gateway.publish_default(&topic, &command).await {
            let failed = {
                let mut state = self.state.lock();
                state.deadline = None;
                state
                    .mission
                    .as_mut()
                    .is_some_and(|m| m.step_failed(&command.command_id, &e.to_string()).unwrap_or(false))
            };
            if failed {
                self.publish_status().await;
            }
        }
    }

    async fn halt(&self, device: &str) {
        let topic = self.gateway.topics().cmd(device);
        let stop = Command::new("stop", serde_json::Value::Null);
        if let Err(e) = self.gateway.publish_default(&topic, &stop).await {
            warn!(device, error = %e, "stop for interrupted step not published");
        }
    }

    async fn handle_command(&self, msg: &Message) {
        let command = match msg.json::<Command>() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "malformed mission command");
                return self.publish_outcome(Err(e), "").await;
            }
        };
        let result = command
            .parse_action::<MissionAction>()
            .and_then(|action| self.apply(action, Instant::now()));
        let halt = match result {
            Ok(halt) => {
                self.publish_outcome(Ok(Ack::accepted(&command.command_id, MISSION_ID)), &command.command_id)
                    .await;
                halt
            }
            Err(e) => {
                warn!(command_id = %command.command_id, error = %e, "mission command rejected");
                return self.publish_outcome(Err(e), &command.command_id).await;
            }
        };
        if let Some(device) = halt {
            self.halt(&device).await;
        }
        self.publish_status().await;
        self.pump().await;
    }

    async fn publish_outcome(&self, result: Result<Ack, HalError>, command_id: &str) {
        let report = match result {
            Ok(ack) => StatusReport::new(MISSION_ID, "command_ack", json!(ack)),
            Err(err) => StatusReport::new(
                MISSION_ID,
                "command_rejected",
                json!({
                    "command_id": (!command_id.is_empty()).then_some(command_id),
                    "kind": err.kind(),
                    "error": err.to_string(),
                }),
            ),
        };
        if let Err(e) = self.gateway.publish_status(&report).await {
            warn!(error = %e, "mission command outcome not published");
        }
    }

    /// React to a device status if it settles the step in flight.
    async fn on_device_status(&self, msg: &Message) {
        let Ok(topic) = parse_topic(self.gateway.topics().namespace(), &msg.topic) else {
            return;
        };
        let changed = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let Some(mission) = state.mission.as_mut() else {
                return;
            };
            let Some(pending) = mission.pending().cloned() else {
                return;
            };
            if pending.device.as_deref() != Some(topic.component) {
                return;
            }
            let Ok(report) = msg.json::<StatusReport>() else {
                return;
            };
            if report.details["command_id"].as_str() != Some(pending.token.as_str()) {
                return;
            }
            let settled = match (report.status.as_str(), pending.completion) {
                ("command_ack", Completion::Acknowledged)
                | ("movement_completed", Completion::MovementFinished) => {
                    mission.step_completed(&pending.token)
                }
                ("command_rejected", _) => {
                    let why = report.details["error"].as_str().unwrap_or("command rejected");
                    mission.step_failed(&pending.token, why)
                }
                ("movement_failed", _) => {
                    let why = report.details["reason"].as_str().unwrap_or("movement failed");
                    mission.step_failed(&pending.token, why)
                }
                _ => Ok(false),
            };
            let settled = settled.unwrap_or(false);
            if settled {
                state.deadline = None;
                debug!(token = %pending.token, status = %report.status, "mission step settled");
            }
            settled
        };
        if changed {
            self.publish_status().await;
            self.pump().await;
        }
    }

    async fn on_deadline(&self) {
        let changed = {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.deadline = None;
            let Some(mission) = state.mission.as_mut() else {
                return;
            };
            let Some(pending) = mission.pending().cloned() else {
                return;
            };
            let result = match pending.completion {
                Completion::Elapsed => mission.step_completed(&pending.token),
                _ => {
                    warn!(token = %pending.token, "mission step timed out");
                    let why = format!("timed out after {:.1} s", pending.timeout.as_secs_f64());
                    mission.step_failed(&pending.token, &why)
                }
            };
            result.unwrap_or(false)
        };
        if changed {
            self.publish_status().await;
            self.pump().await;
        }
    }

    async fn on_emergency_stop(&self, msg: &Message) {
        let reason = msg
            .json::<EmergencyStop>()
            .map(|e| e.reason)
            .unwrap_or_else(|_| "emergency_stop".to_string());
        let aborted = {
            let mut state = self.state.lock();
            state.deadline = None;
            state
                .mission
                .as_mut()
                .is_some_and(|m| m.abort(format!("emergency stop: {reason}")))
        };
        if aborted {
            warn!(reason = %reason, "mission aborted by emergency stop");
            self.publish_status().await;
        }
    }

    /// Subscribe to mission commands, device statuses and the emergency stop
    /// topic, and start the runner task.
    pub async fn spawn(self: Arc<Self>) -> Result<MissionHandle, HalError> {
        let topics = self.gateway.topics().clone();
        let mut subscriptions = Vec::with_capacity(3);
        let mut receivers = Vec::with_capacity(3);
        for (pattern, qos) in [
            (topics.estop(), QoS::ExactlyOnce),
            (topics.cmd(MISSION_ID), QoS::AtLeastOnce),
            (format!("{}/status/+", topics.namespace()), QoS::AtLeastOnce),
        ] {
            match self.gateway.subscribe_channel(&pattern, qos, INPUT_QUEUE).await {
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
        let statuses = receivers.pop();
        let commands = receivers.pop();
        let estop = receivers.pop();
        let (Some(estop), Some(commands), Some(statuses)) = (estop, commands, statuses) else {
            return Err(HalError::Connection("mission subscriptions incomplete".to_string()));
        };

        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(self.clone().run(estop, commands, statuses, shutdown));
        Ok(MissionHandle {
            gateway: self.gateway.clone(),
            subscriptions,
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(
        self: Arc<Self>,
        mut estop: mpsc::Receiver<Message>,
        mut commands: mpsc::Receiver<Message>,
        mut statuses: mpsc::Receiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("mission runner started");
        loop {
            let deadline = self.state.lock().deadline;
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(msg) = estop.recv() => self.on_emergency_stop(&msg).await,
                Some(msg) = commands.recv() => self.handle_command(&msg).await,
                Some(msg) = statuses.recv() => self.on_device_status(&msg).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline().await
                }
            }
        }
        info!("mission runner stopped");
    }
}

/// Owns a running [`MissionRunner`].
pub struct MissionHandle {
    gateway: Gateway,
    subscriptions: Vec<SubscriptionId>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MissionHandle {
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "mission runner ended abnormally");
        }
        for id in self.subscriptions {
            self.gateway.unsubscribe(id).await;
        }
    }
}
