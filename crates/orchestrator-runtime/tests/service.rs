use std::sync::Arc;
use std::time::Duration;

use orchestrator_gateway::{Gateway, Message, QoS};
use orchestrator_runtime::{HalService, MissionAction, MissionState, MissionStatus, MissionStep};
use orchestrator_types::{
    Command, EmergencyStop, EncoderConfig, GatewayConfig, LidarConfig, MotorConfig, RobotState,
    RobotStatus, SensorConfig, StatusReport, SystemConfig,
};
use orchestrator_hal::MotorAction;
use serde_json::json;
use tokio::sync::mpsc;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn robot_config() -> SystemConfig {
    let mut left = MotorConfig::new("left_motor", 18, 23);
    left.encoder = Some("left_encoder".to_string());
    let mut right = MotorConfig::new("right_motor", 19, 24);
    right.encoder = Some("right_encoder".to_string());

    let mut config = SystemConfig {
        motors: vec![left, right],
        sensors: vec![
            SensorConfig::Encoder(EncoderConfig::new("left_encoder", 5)),
            SensorConfig::Encoder(EncoderConfig::new("right_encoder", 6)),
            SensorConfig::Lidar(LidarConfig::new("lidar")),
        ],
        ..SystemConfig::default()
    };
    config.service.heartbeat_interval_secs = 0.2;
    config
}

async fn client_of(service: &HalService) -> Result<Gateway, Box<dyn std::error::Error>> {
    let broker = service.broker().ok_or("service should run its own broker")?;
    let client = Gateway::new(&GatewayConfig::default(), Arc::new(broker.transport("test_client")));
    client.connect().await?;
    Ok(client)
}

async fn next_status(
    rx: &mut mpsc::Receiver<Message>,
    within: Duration,
    mut wanted: impl FnMut(&StatusReport) -> bool,
) -> Result<StatusReport, Box<dyn std::error::Error>> {
    let found = tokio::time::timeout(within, async {
        while let Some(msg) = rx.recv().await {
            if let Ok(report) = msg.json::<StatusReport>()
                && wanted(&report)
            {
                return Some(report);
            }
        }
        None
    })
    .await?;
    Ok(found.ok_or("status channel closed")?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drives_a_motor_and_reports_health() -> TestResult {
    let service = HalService::start(robot_config()).await?;
    let client = client_of(&service).await?;
    let (_, mut motor_status) = client
        .subscribe_channel("orchestrator/status/left_motor", QoS::AtLeastOnce, 256)
        .await?;
    let (_, mut heartbeat) = client
        .subscribe_channel("orchestrator/status/hal", QoS::AtLeastOnce, 16)
        .await?;

    let beat = next_status(&mut heartbeat, Duration::from_secs(2), |_| true).await?;
    assert_eq!(beat.status, "running");
    assert_eq!(beat.details["devices"].as_array().map(Vec::len), Some(5));

    let cmd = Command::new("move_forward", json!({"distance": 0.1})).with_id("fwd-1");
    client.publish_default("orchestrator/cmd/left_motor", &cmd).await?;

    let ack = next_status(&mut motor_status, Duration::from_secs(2), |r| r.status.starts_with("command_")).await?;
    assert_eq!(ack.status, "command_ack");
    assert_eq!(ack.details["command_id"], "fwd-1");

    let done = next_status(&mut motor_status, Duration::from_secs(5), |r| {
        r.status == "movement_completed" || r.status == "movement_failed"
    })
    .await?;
    assert_eq!(done.status, "movement_completed");
    assert_eq!(done.details["command_id"], "fwd-1");

    let bad = Command::new("teleport", json!({})).with_id("bad-1");
    client.publish_default("orchestrator/cmd/left_motor", &bad).await?;
    let rejected = next_status(&mut motor_status, Duration::from_secs(2), |r| r.status == "command_rejected").await?;
    assert_eq!(rejected.details["command_id"], "bad-1");

    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn obstacle_triggers_an_emergency_stop() -> TestResult {
    let service = HalService::start(robot_config()).await?;
    let client = client_of(&service).await?;
    let (_, mut estops) = client
        .subscribe_channel("orchestrator/cmd/estop", QoS::ExactlyOnce, 16)
        .await?;

    let lidar = service.sim_lidar("lidar").ok_or("no simulated lidar")?;
    lidar.place_obstacle(-10.0, 10.0, 0.3);

    let msg = tokio::time::timeout(Duration::from_secs(3), estops.recv())
        .await?
        .ok_or("estop channel closed")?;
    let estop: EmergencyStop = msg.json()?;
    assert_eq!(estop.reason, "obstacle_detected");
    let info = estop.obstacle_info.ok_or("missing obstacle info")?;
    assert_eq!(info.zone_name, "critical_front");
    assert!(info.distance < 0.5);

    let estimator = service.estimator().ok_or("estimator not running")?.clone();
    assert!(orchestrator_gateway::wait_until(Duration::from_secs(2), || {
        estimator.status() == RobotStatus::EmergencyStop
    })
    .await);
    let wheel = service.sim_wheel("left_motor").ok_or("no simulated wheel")?;
    assert_eq!(wheel.duty(), 0.0);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mission_drives_both_wheels_and_moves_the_pose() -> TestResult {
    let service = HalService::start(robot_config()).await?;
    let client = client_of(&service).await?;
    let (_, mut mission) = client
        .subscribe_channel("orchestrator/status/mission", QoS::AtLeastOnce, 64)
        .await?;
    let (_, mut robot) = client
        .subscribe_channel("orchestrator/status/robot", QoS::AtLeastOnce, 256)
        .await?;

    let step = |device: &str| MissionStep::Move {
        device: device.to_string(),
        action: MotorAction::MoveForward {
            distance: 0.1,
            speed: None,
        },
        timeout_secs: 5.0,
    };
    let load = MissionAction::LoadMission {
        mission_id: Some("nudge".to_string()),
        steps: vec![step("left_motor"), step("right_motor")],
    };
    client
        .publish_default("orchestrator/cmd/mission", &Command::from_action(&load)?)
        .await?;
    client
        .publish_default(
            "orchestrator/cmd/mission",
            &Command::from_action(&MissionAction::StartMission)?,
        )
        .await?;

    let done = next_status(&mut mission, Duration::from_secs(10), |r| {
        r.status == "completed" || r.status == "failed"
    })
    .await?;
    let status: MissionStatus = serde_json::from_value(done.details)?;
    assert_eq!(status.status, MissionState::Completed, "{:?}", status.reason);

    // Each wheel went 0.1 m on its own: the turns cancel, the travel adds up.
    let moved = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(msg) = robot.recv().await {
            let Ok(state) = msg.json::<RobotState>() else { continue };
            if state.pose.x > 0.05 {
                return Some(state);
            }
        }
        None
    })
    .await?
    .ok_or("robot state channel closed")?;
    assert_eq!(moved.status, RobotStatus::Active);

    service.shutdown().await;
    Ok(())
}
