// Integration tests for a single bot driving a simulated device
mod common;

use common::{connected_bot, wait_until};
use conductor_rs::notify::SubscriberMessage;
use conductor_rs::state::StateError;
use conductor_rs::{BotConfig, BotError, BotEvent, BotState, JobDescriptor, JobState};
use std::time::Duration;

#[tokio::test]
async fn test_connect_publishes_state_updates() {
    let (bot, _conn, notifier) = connected_bot(BotConfig::default(), [0.0; 4]);
    assert_eq!(bot.state(), BotState::Connected);
    let events: Vec<BotEvent> = notifier
        .messages
        .lock()
        .iter()
        .filter_map(|m| match m {
            SubscriberMessage::UpdateState { body } => Some(body.event),
            _ => None,
        })
        .collect();
    assert_eq!(events, vec![BotEvent::Connect, BotEvent::ConnectDone]);

    bot.disconnect().await.unwrap();
    assert_eq!(bot.state(), BotState::Disconnected);
    assert!(matches!(bot.stream_gcode("G28"), Err(BotError::NotConnected)));
}

#[tokio::test]
async fn test_ten_line_job_reaches_done() {
    let (bot, conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    let text: String = (1..=10).map(|i| format!("G1 X{} Y{} F1500\n", i, i)).collect();
    let started = bot.start_job(JobDescriptor::from_text(text)).await.unwrap();
    assert_eq!(started.total_lines, 10);
    assert_eq!(started.state, JobState::Running);

    let mut seen = Vec::new();
    wait_until(|| {
        let status = bot.status();
        seen.push(status.percent_complete);
        status.job.is_some_and(|job| job.state == JobState::Done)
    })
    .await;

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", seen);
    assert!(seen[..seen.len() - 1].iter().all(|&p| p < 100));
    wait_until(|| bot.state() == BotState::Connected).await;
    let status = bot.status();
    assert_eq!(status.percent_complete, 100);
    assert_eq!(status.state, BotState::Connected);
    assert_eq!(conn.history().len(), 10);
}

#[tokio::test]
async fn test_job_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("part.gcode");
    std::fs::write(&path, "G28\n; comment only\nG1 Z5 F1000\n").unwrap();

    let (bot, conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    bot.start_job(JobDescriptor::from_path(&path)).await.unwrap();
    wait_until(|| bot.state() == BotState::Connected && bot.status().percent_complete == 100).await;
    assert_eq!(conn.history(), vec!["G28", "G1 Z5 F1000"]);
}

#[tokio::test]
async fn test_start_job_requires_connected_state() {
    let (bot, _conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    bot.start_job(JobDescriptor::from_text("G4 P200\n")).await.unwrap();
    let err = bot.start_job(JobDescriptor::from_text("G28\n")).await.unwrap_err();
    assert!(matches!(
        err,
        BotError::State(StateError::InvalidTransition { event: BotEvent::Start, .. })
    ));
}

#[tokio::test]
async fn test_process_gcode_returns_reply_with_offset() {
    let config = BotConfig { offset_x: 10.0, ..Default::default() };
    let (bot, conn, _) = connected_bot(config, [0.0; 4]);
    assert_eq!(bot.process_gcode("G1 X5 F1500").await.unwrap(), "ok");
    assert_eq!(conn.history(), vec!["G1 X15 F1500"]);

    let reply = bot.process_gcode("M114").await.unwrap();
    assert!(reply.starts_with("X:15.00"), "unexpected reply {}", reply);
    assert!(matches!(bot.process_gcode("  ").await, Err(BotError::EmptyGcode)));
}

#[tokio::test]
async fn test_stream_gcode_backpressure() {
    let (bot, _conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    for _ in 0..32 {
        assert!(bot.stream_gcode("G4 P300").unwrap());
    }
    assert!(!bot.stream_gcode("G4 P0").unwrap());
}

#[tokio::test]
async fn test_ad_hoc_gcode_during_job_is_bracketed() {
    let (bot, conn, notifier) = connected_bot(BotConfig::default(), [0.0; 4]);
    bot.start_job(JobDescriptor::from_text("G4 P30\nG4 P30\nG4 P30\n")).await.unwrap();
    assert!(bot.stream_gcode("M105").unwrap());
    wait_until(|| bot.status().percent_complete == 100 && bot.state() == BotState::Connected).await;

    assert!(conn.history().contains(&"M105".to_string()));
    let events: Vec<BotEvent> = notifier
        .messages
        .lock()
        .iter()
        .filter_map(|m| match m {
            SubscriberMessage::UpdateState { body } => Some(body.event),
            _ => None,
        })
        .collect();
    let enter = events.iter().position(|e| *e == BotEvent::JobToGcode).unwrap();
    let leave = events.iter().position(|e| *e == BotEvent::JobGcodeDone).unwrap();
    assert!(enter < leave);
}

#[tokio::test]
async fn test_ad_hoc_rejected_while_parking() {
    let (bot, conn, _) = connected_bot(BotConfig::default(), [0.0, 0.0, 50.0, 0.0]);
    bot.park().unwrap();
    assert_eq!(bot.state(), BotState::Parking);
    let err = bot.stream_gcode("G1 X1").unwrap_err();
    assert!(matches!(err, BotError::State(StateError::AdHocNotAllowed(BotState::Parking))));
    wait_until(|| bot.state() == BotState::Parked).await;
    assert!(!conn.history().contains(&"G1 X1".to_string()));
}

#[tokio::test]
async fn test_jog_uses_configured_speed() {
    let (bot, conn, _) = connected_bot(BotConfig::default(), [10.0, 20.0, 5.0, 0.0]);
    bot.jog("x", 5.0, None).unwrap();
    bot.jog("Z", -2.5, Some(300.0)).unwrap();
    wait_until(|| conn.history().len() == 4).await;
    assert_eq!(conn.history(), vec!["M114", "G1 X15 F2000", "M114", "G1 Z2.5 F300"]);
    assert!(matches!(bot.jog("w", 1.0, None), Err(BotError::UnknownAxis(_))));
}

#[tokio::test]
async fn test_update_routine_removes_offsets() {
    let config = BotConfig { offset_x: 10.0, offset_z: 1.0, ..Default::default() };
    let (bot, _conn, _) = connected_bot(config, [15.0, 5.0, 3.0, 1.5]);
    bot.process_gcode("M104 S200").await.unwrap();
    assert!(bot.update_routine().unwrap());
    wait_until(|| bot.status().position.x.is_some()).await;
    wait_until(|| bot.status().sensors.tool_head.temperature.is_some()).await;

    let status = bot.status();
    assert_eq!(status.position.x, Some(5.0));
    assert_eq!(status.position.y, Some(5.0));
    assert_eq!(status.position.z, Some(2.0));
    assert_eq!(status.position.e, Some(1.5));
    assert_eq!(status.sensors.tool_head.setpoint, Some(200.0));
}

#[tokio::test]
async fn test_update_routine_skips_while_busy() {
    let (bot, _conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    bot.start_job(JobDescriptor::from_text("G4 P100\n")).await.unwrap();
    assert!(!bot.update_routine().unwrap());
}

#[tokio::test]
async fn test_pause_resume_and_stop_job() {
    let (bot, conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    let text: String = (0..20).map(|_| "G4 P10\n").collect();
    bot.start_job(JobDescriptor::from_text(text)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(25)).await;

    bot.pause_job().unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let paused_at = conn.history().len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(conn.history().len(), paused_at);
    assert_eq!(bot.status().job.unwrap().state, JobState::Paused);

    bot.resume_job().unwrap();
    wait_until(|| conn.history().len() > paused_at + 1).await;

    bot.stop_job().unwrap();
    wait_until(|| bot.state() == BotState::Connected).await;
    let stopped_at = conn.history().len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(conn.history().len(), stopped_at);
    assert!(stopped_at < 20);
    assert_eq!(bot.status().job.unwrap().state, JobState::Stopped);
}

#[tokio::test]
async fn test_unsupported_instruction_stalls_until_cleared() {
    let (bot, conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    assert!(bot.stream_gcode("M999").unwrap());
    assert!(bot.stream_gcode("G1 X1").unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.history(), vec!["M999"]);
    assert_eq!(bot.queue_len(), 2);

    bot.clear_queue().unwrap();
    assert!(bot.stream_gcode("G1 X2").unwrap());
    wait_until(|| conn.history().len() == 2).await;
    assert_eq!(conn.history(), vec!["M999", "G1 X2"]);
}

#[tokio::test]
async fn test_clear_queue_recovers_stalled_job_line() {
    let (bot, conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    bot.start_job(JobDescriptor::from_text("M999\nG1 X1\n")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(conn.history(), vec!["M999"]);

    bot.clear_queue().unwrap();
    wait_until(|| bot.state() == BotState::Connected).await;
    assert_eq!(conn.history(), vec!["M999", "G1 X1"]);
    assert_eq!(bot.status().job.unwrap().state, JobState::Done);
}

#[tokio::test]
async fn test_job_file_with_latin1_comment_runs_to_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("latin1.gcode");
    std::fs::write(&path, b"G1 X1\n; nozzle 200\xb0C\nG1 X2\nG1 X3\n").unwrap();

    let (bot, conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    let started = bot.start_job(JobDescriptor::from_path(&path)).await.unwrap();
    assert_eq!(started.total_lines, 4);
    wait_until(|| bot.status().job.is_some_and(|job| job.state == JobState::Done)).await;
    wait_until(|| bot.state() == BotState::Connected).await;
    assert_eq!(conn.history(), vec!["G1 X1", "G1 X2", "G1 X3"]);
}

#[tokio::test]
async fn test_late_reply_after_clear_does_not_answer_next_command() {
    let (bot, _conn, _) = connected_bot(BotConfig::default(), [0.0; 4]);
    assert!(bot.stream_gcode("G4 P200").unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    bot.clear_queue().unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(bot.process_gcode("G4 P600").await.unwrap(), "ok");
    assert!(started.elapsed() >= Duration::from_millis(550), "answered after {:?}", started.elapsed());
}
