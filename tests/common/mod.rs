//! Common test utilities for standby_daq integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing assertions with appropriate tolerances
//! - A simulated test stand (chamber, supply, alert sink, control source)
//! - Reading back the event and data logs

#![allow(dead_code)] // Not every test file uses every helper

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use standby_daq::alert::CollectingAlertSink;
use standby_daq::events::{Event, Measurement, Severity};
use standby_daq::instrument::mock::{MockChamber, MockPowerSupply};
use standby_daq::instrument::PowerSupply;
use standby_daq::logs::{replay, LogPaths};
use standby_daq::plan::{MemoryControlSource, PlanDocument};
use standby_daq::{Instruments, Settings, Supervisor, SupervisorHandle};

/// Tolerance levels for timing assertions.
///
/// Tests running under `start_paused = true` should use `Exact`.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// Exact match - only for simulated time
    Exact,
    /// 20% tolerance - default for real-time waits
    Normal,
    /// 50% tolerance - for CI environments with variable load
    Relaxed,
}

impl TimingTolerance {
    /// Tolerance factor as a fraction (0.0 to 1.0)
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Exact => 0.0,
            TimingTolerance::Normal => 0.20,
            TimingTolerance::Relaxed => 0.50,
        }
    }
}

/// Assert that a duration is within tolerance of an expected value.
///
/// # Panics
/// Panics if the actual duration is outside the tolerance range.
pub fn assert_duration_near(
    actual: Duration,
    expected: Duration,
    tolerance: TimingTolerance,
    context: &str,
) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);

    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} ±{:.0}%, got {:?} (acceptable range: {:?} to {:?})",
        context,
        expected,
        factor * 100.0,
        actual,
        min,
        max
    );
}

/// Two channels sharing one supply, fast ticks and short dwell times.
pub const SETTINGS: &str = r#"
    [daemon]
    tick_interval = "1s"
    plan_poll_interval = "2s"
    alert_threshold = "error"
    sync_writes = false

    [instrument]
    timeout = "1s"
    max_attempts = 2
    backoff = "100ms"
    max_backoff = "200ms"
    fault_budget = 3

    [chamber]
    tolerance_celsius = 0.5
    dwell = "10s"
    clearance_dwell = "5s"
    ambient_celsius = 20.0

    [[channels]]
    id = "ch1"
    supply = "hv"
    output = 0
    min_voltage = 0.0
    max_voltage = 600.0
    current_limit = 1e-5
    safe_ramp_rate = 100.0

    [[channels]]
    id = "ch2"
    supply = "hv"
    output = 1
    min_voltage = 0.0
    max_voltage = 600.0
    current_limit = 1e-5
    safe_ramp_rate = 100.0
"#;

/// 22 °C to 25 °C, ch1 biased to 500 V, ch2 to 300 V.
pub const PLAN: &str = r#"
    [[temperature]]
    setpoint = 25.0
    ramp_rate = 60.0
    hold = "24h"

    [channels.ch1]
    bias = [{ voltage_target = 500.0, ramp_rate = 100.0, measurement_interval = "10s" }]

    [channels.ch2]
    bias = [{ voltage_target = 300.0, ramp_rate = 100.0, measurement_interval = "10s" }]
"#;

/// Simulated stand: one chamber, one two-output supply.
pub struct TestStand {
    pub chamber: MockChamber,
    pub supply: MockPowerSupply,
    pub alerts: CollectingAlertSink,
    pub source: MemoryControlSource,
    pub settings: Settings,
    pub dir: tempfile::TempDir,
}

impl TestStand {
    pub fn new(plan: &str) -> Self {
        Self::with_settings(SETTINGS, plan)
    }

    pub fn with_settings(settings: &str, plan: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_toml_str(settings).unwrap();
        settings.daemon.log_dir = dir.path().join("log");
        settings.daemon.control_dir = dir.path().join("control");
        Self {
            chamber: MockChamber::with_slew(22.0, 1.0),
            supply: MockPowerSupply::new(),
            alerts: CollectingAlertSink::new(),
            source: MemoryControlSource::new(PlanDocument::from_toml_str(plan).unwrap()),
            settings,
            dir,
        }
    }

    pub fn instruments(&self) -> Instruments {
        let supply: Arc<dyn PowerSupply> = Arc::new(self.supply.clone());
        Instruments {
            chamber: Arc::new(self.chamber.clone()),
            supplies: [("hv".to_string(), supply)].into_iter().collect(),
        }
    }

    pub async fn start(&self) -> SupervisorHandle {
        Supervisor::new(
            self.settings.clone(),
            self.instruments(),
            Arc::new(self.alerts.clone()),
        )
        .start(Arc::new(self.source.clone()))
        .await
        .unwrap()
    }

    pub fn log_dir(&self) -> std::path::PathBuf {
        self.settings.daemon.log_dir.clone()
    }

    /// Event log contents; complete once the supervisor has exited.
    pub fn events(&self) -> Vec<Event> {
        read_events(&self.log_dir())
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        replay(LogPaths::in_dir(&self.log_dir()).measurements).unwrap()
    }
}

pub fn read_events(dir: &Path) -> Vec<Event> {
    replay(LogPaths::in_dir(dir).events).unwrap()
}

/// Events of `severity` whose message contains `needle`.
pub fn count_events(events: &[Event], severity: Severity, needle: &str) -> usize {
    events
        .iter()
        .filter(|e| e.severity == severity && e.message.contains(needle))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_tolerance_factors() {
        assert_eq!(TimingTolerance::Exact.factor(), 0.0);
        assert_eq!(TimingTolerance::Normal.factor(), 0.20);
        assert_eq!(TimingTolerance::Relaxed.factor(), 0.50);
    }

    #[test]
    #[should_panic(expected = "outside tolerance")]
    fn test_assert_duration_near_fails() {
        assert_duration_near(
            Duration::from_millis(130),
            Duration::from_millis(100),
            TimingTolerance::Normal,
            "outside tolerance",
        );
    }
}
