//! Whole-daemon scenarios against simulated instruments.
//!
//! Every test runs on paused tokio time, so hours of standby take
//! milliseconds and timings are deterministic.

mod common;

use std::io::Write;
use std::time::Duration;

use common::{
    assert_duration_near, count_events, TestStand, TimingTolerance, PLAN, SETTINGS,
};
use standby_daq::controller::{ChamberPhase, ChannelPhase, Health};
use standby_daq::events::{MeasurementKind, Severity};
use standby_daq::interlock::BiasPermission;
use standby_daq::logs::LogPaths;
use standby_daq::{DaqError, ExitStatus, Supervisor};
use tokio::time::{sleep, Instant};

#[tokio::test(start_paused = true)]
async fn test_ramp_then_bias_then_measure() {
    let stand = TestStand::new(PLAN);
    let mut handle = stand.start().await;

    // Chamber still ramping 22 -> 25 °C: no channel leaves 0 V
    sleep(Duration::from_secs(8)).await;
    assert_eq!(handle.chamber_state().phase, ChamberPhase::Ramping);
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::Idle);
    assert_eq!(stand.supply.voltage(0).await, 0.0);
    assert_eq!(handle.interlock()["ch1"], BiasPermission::AwaitingStability);

    // Off the tick grid, so the shutdown below starts between two cycles
    sleep(Duration::from_millis(52_500)).await;
    let chamber = handle.chamber_state();
    assert_eq!(chamber.phase, ChamberPhase::Holding);
    assert!(chamber.stable);
    for (id, output, volts) in [("ch1", 0, 500.0), ("ch2", 1, 300.0)] {
        let state = handle.channel_state(id).unwrap();
        assert_eq!(state.phase, ChannelPhase::Measuring, "{id}");
        assert_eq!(state.health, Health::Healthy, "{id}");
        assert_eq!(stand.supply.voltage(output).await, volts, "{id}");

        let history = stand.supply.voltage_history(output).await;
        assert!(
            history.windows(2).all(|w| w[1] >= w[0] && w[1] - w[0] <= 100.0),
            "{id} ramp not monotonic or too fast: {history:?}"
        );
    }

    handle.shutdown();
    let stopping = Instant::now();
    assert_eq!(handle.wait().await, ExitStatus::Clean);
    // 500 V at the safe rate of 100 V/s: one step now, four on the next ticks
    assert_duration_near(
        stopping.elapsed(),
        Duration::from_millis(3_500),
        TimingTolerance::Exact,
        "shutdown ramp",
    );
    assert_eq!(stand.supply.voltage(0).await, 0.0);
    assert_eq!(stand.supply.voltage(1).await, 0.0);
    assert!(stand.supply.ramp_down_count(0).await >= 1);
    assert_eq!(stand.chamber.setpoint().await, 20.0);

    let ch1: Vec<_> = stand
        .measurements()
        .into_iter()
        .filter(|m| m.channel_id == "ch1")
        .collect();
    assert!(ch1.len() >= 4, "only {} measurements", ch1.len());
    assert!(ch1.iter().all(|m| m.kind == MeasurementKind::Standby));
    assert!(ch1.iter().all(|m| m.voltage == 500.0));
    assert!(ch1
        .iter()
        .all(|m| m.temperature.is_some_and(|t| (t - 25.0).abs() <= 0.5)));
    assert!(ch1.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let events = stand.events();
    assert_eq!(count_events(&events, Severity::Info, "Started chamber and 2 channel"), 1);
    assert_eq!(count_events(&events, Severity::Info, "Supervisor stopped"), 1);
    assert_eq!(count_events(&events, Severity::Error, ""), 0);
    assert!(stand.alerts.events().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_sets_ambient_only_after_channels_reach_zero() {
    let stand = TestStand::new(PLAN);
    let mut handle = stand.start().await;
    sleep(Duration::from_millis(40_500)).await;
    assert_eq!(stand.supply.voltage(0).await, 500.0);

    handle.shutdown();
    sleep(Duration::from_millis(1_500)).await;
    assert!(stand.supply.voltage(0).await > 0.0);
    assert_eq!(stand.chamber.setpoint().await, 25.0);

    assert_eq!(handle.wait().await, ExitStatus::Clean);
    assert_eq!(stand.supply.voltage(0).await, 0.0);
    assert_eq!(stand.supply.voltage(1).await, 0.0);
    assert_eq!(stand.chamber.setpoint().await, 20.0);

    let events = stand.events();
    let position = |needle: &str| {
        events
            .iter()
            .position(|e| e.message.contains(needle))
            .unwrap_or_else(|| panic!("no event containing {needle:?}"))
    };
    let ambient = position("chamber commanded to ambient");
    assert!(position("Channel ch1 at 0 V, output off") < ambient);
    assert!(position("Channel ch2 at 0 V, output off") < ambient);
}

#[tokio::test(start_paused = true)]
async fn test_door_open_trips_all_channels_until_rearmed() {
    let stand = TestStand::new(PLAN);
    let mut handle = stand.start().await;
    sleep(Duration::from_secs(40)).await;
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::Measuring);

    stand.chamber.open_door().await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.chamber_state().phase, ChamberPhase::SafeState);
    assert!(handle.interlock().values().all(BiasPermission::is_denied));
    for state in handle.channel_states() {
        assert_eq!(state.phase, ChannelPhase::TripSafe, "{}", state.id);
        assert_eq!(state.health, Health::Tripped, "{}", state.id);
    }

    // Re-arm is refused while the door is open
    handle.rearm("ch1").await.unwrap();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(stand.supply.voltage(0).await, 0.0);
    assert_eq!(stand.supply.voltage(1).await, 0.0);
    let history = stand.supply.voltage_history(0).await;
    assert!(history
        .windows(2)
        .skip_while(|w| w[1] >= w[0])
        .all(|w| w[0] - w[1] <= 100.0));

    // Door closed and chamber stable again: still no bias without clearance
    stand.chamber.close_door().await;
    sleep(Duration::from_secs(40)).await;
    assert_eq!(handle.chamber_state().phase, ChamberPhase::Holding);
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::TripSafe);
    assert_eq!(stand.supply.voltage(0).await, 0.0);

    handle.rearm("ch1").await.unwrap();
    sleep(Duration::from_secs(15)).await;
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::Measuring);
    assert_eq!(stand.supply.voltage(0).await, 500.0);
    assert_eq!(handle.channel_state("ch2").unwrap().phase, ChannelPhase::TripSafe);
    assert_eq!(stand.supply.voltage(1).await, 0.0);

    handle.shutdown();
    assert_eq!(handle.wait().await, ExitStatus::Clean);

    let events = stand.events();
    assert_eq!(count_events(&events, Severity::Error, "Chamber safe state: chamber door open"), 1);
    assert_eq!(count_events(&events, Severity::Error, "Channel ch1 tripped"), 1);
    assert_eq!(count_events(&events, Severity::Error, "Channel ch2 tripped"), 1);
    assert_eq!(count_events(&events, Severity::Warning, "Re-arm by operator rejected"), 1);
    assert_eq!(count_events(&events, Severity::Info, "re-armed by operator"), 1);

    let alerts = stand.alerts.events().await;
    assert!(alerts.iter().any(|e| e.source == "chamber" && e.message.contains("door open")));
    assert!(alerts.iter().any(|e| e.source == "channel:ch1" && e.message.contains("tripped")));
    assert!(alerts.iter().all(|e| e.severity >= Severity::Error));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_plan_edit_keeps_running_plan() {
    let stand = TestStand::new(PLAN);
    let mut handle = stand.start().await;
    sleep(Duration::from_secs(30)).await;
    let original = handle.plan();
    assert_eq!(original.version, 1);

    let over_range = PLAN.replace("voltage_target = 500.0", "voltage_target = 900.0");
    stand.source.set_toml(&over_range).await;
    sleep(Duration::from_secs(5)).await;
    stand.source.set_toml(&over_range).await;
    sleep(Duration::from_secs(5)).await;
    stand.source.set_toml("[[temperature]\nsetpoint = ").await;
    sleep(Duration::from_secs(5)).await;

    assert_eq!(handle.plan().version, 1);
    assert_eq!(handle.plan().fingerprint, original.fingerprint);
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::Measuring);
    assert_eq!(stand.supply.voltage(0).await, 500.0);
    assert!(stand
        .supply
        .voltage_history(0)
        .await
        .iter()
        .all(|v| *v <= 500.0));

    // A valid edit is picked up without a restart
    let lowered = PLAN.replace("voltage_target = 500.0", "voltage_target = 400.0");
    stand.source.set_toml(&lowered).await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(handle.plan().version, 2);
    assert_eq!(stand.supply.voltage(0).await, 400.0);
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::Measuring);

    handle.shutdown();
    assert_eq!(handle.wait().await, ExitStatus::Clean);

    let events = stand.events();
    assert_eq!(count_events(&events, Severity::Error, "Rejected edit"), 2);
    assert_eq!(count_events(&events, Severity::Error, "keeping plan version 1"), 2);
    assert_eq!(count_events(&events, Severity::Info, "Plan version 2 supersedes version 1"), 1);
    let history = std::fs::read_dir(stand.log_dir().join("configuration_history"))
        .unwrap()
        .count();
    assert_eq!(history, 2);
}

#[tokio::test(start_paused = true)]
async fn test_over_current_trip_rearmed_by_plan_counter() {
    let stand = TestStand::new(PLAN);
    let mut handle = stand.start().await;
    sleep(Duration::from_secs(40)).await;

    stand.supply.set_current_override(0, Some(1e-3)).await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::TripSafe);
    // The other channel is unaffected
    assert_eq!(handle.channel_state("ch2").unwrap().phase, ChannelPhase::Measuring);

    stand.supply.set_current_override(0, None).await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(stand.supply.voltage(0).await, 0.0);
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::TripSafe);

    let rearmed = PLAN.replace("[channels.ch1]", "[channels.ch1]\n    rearm = 1");
    stand.source.set_toml(&rearmed).await;
    sleep(Duration::from_secs(15)).await;
    assert_eq!(handle.plan().rearm_counter("ch1"), 1);
    assert_eq!(handle.channel_state("ch1").unwrap().phase, ChannelPhase::Measuring);
    assert_eq!(stand.supply.voltage(0).await, 500.0);

    handle.shutdown();
    assert_eq!(handle.wait().await, ExitStatus::Clean);

    let events = stand.events();
    assert_eq!(count_events(&events, Severity::Error, "over-current"), 1);
    assert_eq!(count_events(&events, Severity::Info, "re-armed by plan version 2"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_supply_with_shutdown_all_policy() {
    let settings = SETTINGS.replace(
        "alert_threshold = \"error\"",
        "alert_threshold = \"error\"\n    trip_policy = \"shutdown_all\"",
    );
    let stand = TestStand::with_settings(&settings, PLAN);
    let mut handle = stand.start().await;
    sleep(Duration::from_secs(40)).await;

    stand.supply.set_disconnected(true).await;
    let status = tokio::time::timeout(Duration::from_secs(60), handle.wait())
        .await
        .expect("supervisor did not stop after fatal fault");
    assert_eq!(status, ExitStatus::Fault);
    assert_eq!(status.code(), 2);
    assert_eq!(stand.chamber.setpoint().await, 20.0);

    let events = stand.events();
    assert!(count_events(&events, Severity::Fatal, "Controller stopped") >= 1);
    assert_eq!(count_events(&events, Severity::Error, "Initiating full shutdown"), 1);
    assert!(stand
        .alerts
        .events()
        .await
        .iter()
        .any(|e| e.severity == Severity::Fatal));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_supply_isolated_keeps_chamber_running() {
    let stand = TestStand::new(PLAN);
    let mut handle = stand.start().await;
    sleep(Duration::from_secs(40)).await;

    stand.supply.set_disconnected(true).await;
    sleep(Duration::from_secs(30)).await;
    assert_eq!(handle.chamber_state().phase, ChamberPhase::Holding);
    for state in handle.channel_states() {
        assert_eq!(state.health, Health::Tripped, "{}", state.id);
    }

    handle.shutdown();
    assert_eq!(handle.wait().await, ExitStatus::Fault);
    let events = stand.events();
    assert_eq!(count_events(&events, Severity::Fatal, "Controller stopped"), 2);
    assert_eq!(count_events(&events, Severity::Error, "Initiating full shutdown"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_recovers_torn_data_log() {
    let stand = TestStand::new(PLAN);
    let mut handle = stand.start().await;
    sleep(Duration::from_secs(60)).await;
    handle.shutdown();
    assert_eq!(handle.wait().await, ExitStatus::Clean);
    let before = stand.measurements();
    assert!(!before.is_empty());

    // Power loss in the middle of an append
    let path = LogPaths::in_dir(&stand.log_dir()).measurements;
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"REC 0000002a 00ff00ff").unwrap();
    drop(file);

    let mut handle = stand.start().await;
    sleep(Duration::from_secs(30)).await;
    handle.shutdown();
    assert_eq!(handle.wait().await, ExitStatus::Clean);

    let after = stand.measurements();
    assert!(after.len() > before.len());
    assert_eq!(&after[..before.len()], &before[..]);
    let events = stand.events();
    assert_eq!(count_events(&events, Severity::Warning, "torn data log tail"), 1);
    assert_eq!(count_events(&events, Severity::Info, "Supervisor stopped"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_initial_plan_fails_startup() {
    let stand = TestStand::new(&PLAN.replace("voltage_target = 300.0", "voltage_target = 700.0"));
    let result = Supervisor::new(
        stand.settings.clone(),
        stand.instruments(),
        std::sync::Arc::new(stand.alerts.clone()),
    )
    .start(std::sync::Arc::new(stand.source.clone()))
    .await;
    assert!(matches!(result, Err(DaqError::Plan(_))));
    assert_eq!(stand.supply.voltage_history(1).await.len(), 0);

    let events = stand.events();
    assert_eq!(count_events(&events, Severity::Fatal, "Startup failed"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rearm_of_unknown_channel_is_rejected() {
    let stand = TestStand::new(PLAN);
    let mut handle = stand.start().await;
    assert!(matches!(
        handle.rearm("ch9").await,
        Err(DaqError::UnknownChannel(id)) if id == "ch9"
    ));
    handle.shutdown();
    assert_eq!(handle.wait().await, ExitStatus::Clean);
}
