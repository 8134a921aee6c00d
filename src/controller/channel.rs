//! Channel controller: bias and measurement loop of one sensor.
//!
//! ```text
//! Idle ──► BiasRamping ──► Biased ──► Measuring ──► IvSweep ─┐
//!              ▲                          │  ▲               │
//!              └──── target changed ──────┘  └───────────────┘
//!
//! any ──► TripSafe ──(ramp-down done + chamber clear + re-arm)──► BiasRamping
//! ```
//!
//! Every cycle reads back voltage and current, checks the current limit and
//! the interlock, and only then acts on the schedule. A channel never starts
//! biasing from 0 V while the chamber is still settling.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::{step_toward, ChamberState, ChannelPhase, ChannelState, Health};
use crate::config::{ChannelConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{with_retry, RetryPolicy};
use crate::events::{Event, EventReporter, Measurement, MeasurementKind};
use crate::instrument::PowerSupply;
use crate::interlock::{chamber_clear, channel_permission, BiasPermission};
use crate::plan::{BiasStep, IvCurve, Plan};

/// Capacity of a controller's command queue.
const COMMAND_QUEUE: usize = 8;

/// Operator commands for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Clear a trip and resume the schedule
    Rearm {
        /// Who asked, for the event log
        requested_by: String,
    },
}

/// Bias and measurement loop of one channel.
pub struct ChannelController {
    source: String,
    config: ChannelConfig,
    supply: Arc<dyn PowerSupply>,
    tick: Duration,
    retry: RetryPolicy,
    fault_budget: u32,
    plan: watch::Receiver<Arc<Plan>>,
    chamber: watch::Receiver<ChamberState>,
    commands: mpsc::Receiver<ChannelCommand>,
    state_tx: watch::Sender<ChannelState>,
    reporter: EventReporter,

    state: ChannelState,
    /// When the current step first reached its target
    step_reached: Option<Instant>,
    last_measurement: Option<Instant>,
    last_sweep: Option<Instant>,
    sweep_point: u32,
    /// Output has been switched off after reaching 0 V
    output_off: bool,
    consecutive_faults: u32,
}

impl ChannelController {
    /// Create the controller, the receiver of its published state and the
    /// sender for its commands.
    pub fn new(
        config: ChannelConfig,
        supply: Arc<dyn PowerSupply>,
        settings: &Settings,
        plan: watch::Receiver<Arc<Plan>>,
        chamber: watch::Receiver<ChamberState>,
        reporter: EventReporter,
    ) -> (
        Self,
        watch::Receiver<ChannelState>,
        mpsc::Sender<ChannelCommand>,
    ) {
        let (state_tx, state_rx) = watch::channel(ChannelState::initial(&config.id));
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let controller = Self {
            source: format!("channel:{}", config.id),
            state: ChannelState::initial(&config.id),
            config,
            supply,
            tick: settings.daemon.tick_interval,
            retry: RetryPolicy::from(&settings.instrument),
            fault_budget: settings.instrument.fault_budget.max(1),
            plan,
            chamber,
            commands,
            state_tx,
            reporter,
            step_reached: None,
            last_measurement: None,
            last_sweep: None,
            sweep_point: 0,
            output_off: false,
            consecutive_faults: 0,
        };
        (controller, state_rx, command_tx)
    }

    /// Run until `shutdown` turns true, then ramp the output to 0 V.
    ///
    /// Returns `FatalController` once the fault budget is exhausted.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stop = tokio::select! {
                _ = ticker.tick() => *shutdown.borrow(),
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            if stop {
                self.shut_down(&mut ticker).await;
                return Ok(());
            }

            let plan = self.plan.borrow().clone();
            let chamber = self.chamber_snapshot();
            while let Ok(command) = self.commands.try_recv() {
                self.handle(command, &plan, &chamber);
            }

            match self.cycle(&plan, &chamber).await {
                Ok(retries) => {
                    self.consecutive_faults = 0;
                    if self.state.health != Health::Tripped {
                        self.state.health = if retries > 0 {
                            Health::Degraded
                        } else {
                            Health::Healthy
                        };
                    }
                }
                Err(reason) => {
                    self.consecutive_faults += 1;
                    warn!(
                        channel = %self.config.id,
                        faults = self.consecutive_faults,
                        budget = self.fault_budget,
                        %reason,
                        "Channel cycle faulted"
                    );
                    if self.consecutive_faults >= self.fault_budget {
                        return Err(self.give_up(reason).await);
                    }
                }
            }
            self.state_tx.send_replace(self.state.clone());
        }
    }

    /// Latest chamber state; a vanished chamber controller counts as tripped.
    fn chamber_snapshot(&self) -> ChamberState {
        if self.chamber.has_changed().is_err() {
            return ChamberState::lost();
        }
        self.chamber.borrow().clone()
    }

    fn handle(&mut self, command: ChannelCommand, plan: &Plan, chamber: &ChamberState) {
        let ChannelCommand::Rearm { requested_by } = command;
        let rejection = if self.state.phase != ChannelPhase::TripSafe {
            Some("channel is not tripped".to_string())
        } else if self.state.commanded_voltage != 0.0 || !self.output_off {
            Some("ramp-down to 0 V not complete".to_string())
        } else if !chamber_clear(chamber) {
            Some(format!(
                "chamber not clear (door {}, health {})",
                chamber.door, chamber.health
            ))
        } else {
            None
        };

        if let Some(reason) = rejection {
            self.reporter.emit(Event::warning(
                &self.source,
                format!("Re-arm by {requested_by} rejected: {reason}"),
            ));
            return;
        }
        self.state.health = Health::Healthy;
        self.state.phase = ChannelPhase::BiasRamping;
        self.step_reached = None;
        self.clamp_step(plan);
        self.reporter.emit(Event::info(
            &self.source,
            format!("Channel {} re-armed by {requested_by}", self.config.id),
        ));
    }

    /// One control cycle. Returns the retries needed, `Err` marks the cycle
    /// as faulted.
    async fn cycle(&mut self, plan: &Plan, chamber: &ChamberState) -> Result<u32, String> {
        let now = Instant::now();
        let read = self.read_back().await;
        if let Err(reason) = &read {
            self.trip(format!("adapter failure: {reason}"));
        }

        if let Some(current) = self.state.measured_current {
            if current.abs() > self.config.current_limit {
                self.trip(format!(
                    "over-current: {current:.3e} A above the limit of {:.3e} A",
                    self.config.current_limit
                ));
            }
        }

        let permission = channel_permission(chamber, &self.state);
        if let BiasPermission::Denied(reason) = &permission {
            if self.state.phase != ChannelPhase::Idle || self.state.may_be_biased() {
                self.trip(format!("interlock: {reason}"));
            }
        }

        let acted = self.act(plan, chamber, &permission, now).await;
        let retries = read?;
        acted.map(|r| r + retries)
    }

    async fn act(
        &mut self,
        plan: &Plan,
        chamber: &ChamberState,
        permission: &BiasPermission,
        now: Instant,
    ) -> Result<u32, String> {
        self.clamp_step(plan);
        let step = self.current_step(plan);
        // Never lift a channel off 0 V while the chamber is settling
        let hold_at_zero = *permission == BiasPermission::AwaitingStability
            && self.state.commanded_voltage == 0.0;

        match self.state.phase {
            ChannelPhase::TripSafe | ChannelPhase::Finished => {
                self.ramp_to_zero().await.map(|_| 0)
            }
            ChannelPhase::Idle => {
                let Some(step) = step else { return Ok(0) };
                if *permission == BiasPermission::Permitted && not_before_passed(&step) {
                    self.state.phase = ChannelPhase::BiasRamping;
                    self.output_off = false;
                    self.reporter.emit(Event::info(
                        &self.source,
                        format!(
                            "Bias step {}: ramping to {} V at {} V/s",
                            self.state.step_index + 1,
                            step.voltage_target,
                            step.ramp_rate
                        ),
                    ));
                    return self.ramp_toward(step.voltage_target, step.ramp_rate).await;
                }
                Ok(0)
            }
            ChannelPhase::BiasRamping => {
                let (target, rate) = step
                    .as_ref()
                    .map_or((0.0, self.config.safe_ramp_rate), |s| (s.voltage_target, s.ramp_rate));
                if hold_at_zero {
                    return Ok(0);
                }
                let retries = self.ramp_toward(target, rate).await?;
                if self.state.commanded_voltage == target {
                    match step {
                        Some(step) => {
                            self.state.phase = ChannelPhase::Biased;
                            // Returning from an IV sweep keeps the step's clock
                            self.step_reached.get_or_insert(now);
                            self.reporter.emit(Event::info(
                                &self.source,
                                format!(
                                    "Channel {} at {} V, measuring every {:?}",
                                    self.config.id, target, step.measurement_interval
                                ),
                            ));
                        }
                        None => {
                            self.state.phase = ChannelPhase::Idle;
                            self.switch_off().await?;
                        }
                    }
                }
                Ok(retries)
            }
            ChannelPhase::Biased => {
                self.state.phase = ChannelPhase::Measuring;
                self.last_sweep.get_or_insert(now);
                self.record(MeasurementKind::Standby, chamber);
                self.last_measurement = Some(now);
                Ok(0)
            }
            ChannelPhase::Measuring => {
                let Some(step) = step else {
                    self.state.phase = ChannelPhase::BiasRamping;
                    return Ok(0);
                };
                if self.state.commanded_voltage != step.voltage_target {
                    debug!(channel = %self.config.id, "Bias target changed by plan edit");
                    self.state.phase = ChannelPhase::BiasRamping;
                    self.step_reached = None;
                    return Ok(0);
                }
                if self.step_elapsed(&step, now) && self.next_step(plan) {
                    self.state.phase = ChannelPhase::BiasRamping;
                    return Ok(0);
                }
                if let Some(iv) = self.sweep_due(plan, now) {
                    self.state.phase = ChannelPhase::IvSweep;
                    self.sweep_point = 0;
                    self.reporter.emit(Event::info(
                        &self.source,
                        format!(
                            "IV curve: {} points from {} V to {} V",
                            iv.points, iv.start, iv.stop
                        ),
                    ));
                    return self.ramp_toward(iv.point(0), step.ramp_rate).await;
                }
                let due = self
                    .last_measurement
                    .map_or(true, |t| now.duration_since(t) >= step.measurement_interval);
                if due {
                    self.record(MeasurementKind::Standby, chamber);
                    self.last_measurement = Some(now);
                }
                Ok(0)
            }
            ChannelPhase::IvSweep => {
                let rate = step.map_or(self.config.safe_ramp_rate, |s| s.ramp_rate);
                self.sweep(plan, chamber, rate, now).await
            }
        }
    }

    /// Ramp to the current sweep point; once it was commanded on an earlier
    /// cycle the read-back belongs to it, so record it and head for the next.
    async fn sweep(
        &mut self,
        plan: &Plan,
        chamber: &ChamberState,
        rate: f64,
        now: Instant,
    ) -> Result<u32, String> {
        let Some(iv) = plan.channel(&self.config.id).and_then(|c| c.iv_curve.clone()) else {
            self.state.phase = ChannelPhase::BiasRamping;
            return Ok(0);
        };
        if self.state.commanded_voltage == iv.point(self.sweep_point) {
            self.record(MeasurementKind::IvCurve, chamber);
            self.sweep_point += 1;
            if self.sweep_point >= iv.points {
                self.last_sweep = Some(now);
                self.state.phase = ChannelPhase::BiasRamping;
                self.reporter
                    .emit(Event::info(&self.source, "IV curve finished, returning to bias target"));
                return Ok(0);
            }
        }
        self.ramp_toward(iv.point(self.sweep_point), rate).await
    }

    fn sweep_due(&self, plan: &Plan, now: Instant) -> Option<IvCurve> {
        let iv = plan.channel(&self.config.id)?.iv_curve.clone()?;
        let since = self.last_sweep?;
        (now.duration_since(since) >= iv.every).then_some(iv)
    }

    fn current_step(&self, plan: &Plan) -> Option<BiasStep> {
        plan.channel(&self.config.id)?
            .bias
            .get(self.state.step_index)
            .cloned()
    }

    /// Keep the step index valid after a plan edit removed steps.
    fn clamp_step(&mut self, plan: &Plan) {
        let steps = plan.channel(&self.config.id).map_or(0, |c| c.bias.len());
        if steps > 0 && self.state.step_index >= steps {
            self.state.step_index = steps - 1;
            self.step_reached = None;
        }
    }

    fn step_elapsed(&self, step: &BiasStep, now: Instant) -> bool {
        match (step.duration, self.step_reached) {
            (Some(duration), Some(reached)) => now.duration_since(reached) >= duration,
            _ => false,
        }
    }

    /// Move to the next bias step if there is one and it may start.
    fn next_step(&mut self, plan: &Plan) -> bool {
        let next = self.state.step_index + 1;
        let Some(step) = plan.channel(&self.config.id).and_then(|c| c.bias.get(next)) else {
            return false;
        };
        if !not_before_passed(step) {
            return false;
        }
        self.state.step_index = next;
        self.step_reached = None;
        self.reporter.emit(Event::info(
            &self.source,
            format!(
                "Bias step {}: ramping to {} V at {} V/s",
                next + 1,
                step.voltage_target,
                step.ramp_rate
            ),
        ));
        true
    }

    /// Force the safe state. Repeated trips while already safe are silent.
    fn trip(&mut self, reason: String) {
        self.state.health = Health::Tripped;
        if self.state.phase == ChannelPhase::TripSafe || self.state.phase == ChannelPhase::Finished {
            return;
        }
        self.state.phase = ChannelPhase::TripSafe;
        self.reporter.emit(
            Event::error(
                &self.source,
                format!("Channel {} tripped: {reason}", self.config.id),
            )
            .with_context(json!({
                "commanded_voltage": self.state.commanded_voltage,
                "measured_voltage": self.state.measured_voltage,
                "measured_current": self.state.measured_current,
                "safe_ramp_rate": self.config.safe_ramp_rate,
            })),
        );
    }

    /// Ramp toward 0 V at the safe rate and switch the output off there.
    /// Returns true once the output is off.
    async fn ramp_to_zero(&mut self) -> Result<bool, String> {
        if self.state.commanded_voltage != 0.0 {
            if let Err(reason) = self.ramp_toward(0.0, self.config.safe_ramp_rate).await {
                warn!(channel = %self.config.id, %reason, "Safe ramp failed, using hardware ramp-down");
                self.switch_off().await?;
                return Ok(true);
            }
        }
        if self.state.commanded_voltage == 0.0 && !self.output_off {
            self.switch_off().await?;
        }
        Ok(self.output_off)
    }

    async fn ramp_toward(&mut self, target: f64, rate: f64) -> Result<u32, String> {
        let max_step = rate * self.tick.as_secs_f64();
        let next = step_toward(self.state.commanded_voltage, target, max_step);
        if next == self.state.commanded_voltage {
            return Ok(0);
        }
        self.command(next).await
    }

    async fn command(&mut self, volts: f64) -> Result<u32, String> {
        if !self.config.in_safe_range(volts) {
            return Err(format!("refusing to set {volts} V outside the safe range"));
        }
        let supply = Arc::clone(&self.supply);
        let output = self.config.output;
        let done = with_retry(&self.retry, "set_voltage", || supply.set_voltage(output, volts))
            .await
            .map_err(|err| format!("setting {volts} V failed: {err}"))?;
        self.state.commanded_voltage = volts;
        self.output_off = false;
        Ok(done.retries)
    }

    async fn switch_off(&mut self) -> Result<(), String> {
        let supply = Arc::clone(&self.supply);
        let output = self.config.output;
        with_retry(&self.retry, "ramp_down", || supply.ramp_down(output))
            .await
            .map_err(|err| format!("ramp-down failed: {err}"))?;
        self.state.commanded_voltage = 0.0;
        self.output_off = true;
        self.reporter.emit(Event::info(
            &self.source,
            format!("Channel {} at 0 V, output off", self.config.id),
        ));
        Ok(())
    }

    async fn read_back(&mut self) -> Result<u32, String> {
        let supply = Arc::clone(&self.supply);
        let output = self.config.output;
        let voltage = with_retry(&self.retry, "read_voltage", || supply.read_voltage(output)).await;
        let current = with_retry(&self.retry, "read_current", || supply.read_current(output)).await;
        match (voltage, current) {
            (Ok(v), Ok(i)) => {
                self.state.measured_voltage = Some(v.value);
                self.state.measured_current = Some(i.value);
                Ok(v.retries + i.retries)
            }
            (Err(err), _) | (_, Err(err)) => {
                self.state.measured_voltage = None;
                self.state.measured_current = None;
                Err(format!("read-back failed: {err}"))
            }
        }
    }

    fn record(&self, kind: MeasurementKind, chamber: &ChamberState) {
        let (Some(voltage), Some(current)) = (self.state.measured_voltage, self.state.measured_current)
        else {
            return;
        };
        self.reporter.record(Measurement {
            timestamp: Utc::now(),
            channel_id: self.config.id.clone(),
            voltage,
            current,
            temperature: chamber.temperature,
            humidity: chamber.humidity,
            kind,
        });
    }

    async fn shut_down(&mut self, ticker: &mut Interval) {
        self.state.phase = ChannelPhase::Finished;
        self.reporter.emit(Event::info(
            &self.source,
            format!("Shutdown: ramping channel {} to 0 V", self.config.id),
        ));
        loop {
            match self.ramp_to_zero().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(reason) => {
                    self.reporter.emit(Event::error(
                        &self.source,
                        format!("Shutdown ramp-down of channel {} failed: {reason}", self.config.id),
                    ));
                    break;
                }
            }
            self.state_tx.send_replace(self.state.clone());
            ticker.tick().await;
        }
        self.state_tx.send_replace(self.state.clone());
    }

    /// Publish a tripped state, try once more to switch off, and report the
    /// fatal fault.
    async fn give_up(&mut self, reason: String) -> DaqError {
        self.state.phase = ChannelPhase::TripSafe;
        self.state.health = Health::Tripped;
        self.state_tx.send_replace(self.state.clone());

        let supply = Arc::clone(&self.supply);
        let output = self.config.output;
        let once = RetryPolicy {
            max_attempts: 1,
            ..self.retry.clone()
        };
        if let Err(err) = with_retry(&once, "ramp_down", || supply.ramp_down(output)).await {
            warn!(channel = %self.config.id, %err, "Could not ramp down after fatal fault");
        }
        DaqError::FatalController {
            controller: self.source.clone(),
            reason: format!(
                "{reason} ({} consecutive faulted cycles)",
                self.consecutive_faults
            ),
        }
    }
}

fn not_before_passed(step: &BiasStep) -> bool {
    step.not_before.map_or(true, |t| Utc::now() >= t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertHandle;
    use crate::controller::ChamberPhase;
    use crate::events::Severity;
    use crate::instrument::mock::MockPowerSupply;
    use crate::instrument::DoorState;
    use crate::logs::{replay, LogHandle, LogPaths, LogWriter};
    use crate::plan::PlanDocument;
    use tokio::time::sleep;

    const SETTINGS: &str = r#"
        [daemon]
        tick_interval = "1s"

        [instrument]
        timeout = "1s"
        max_attempts = 2
        backoff = "100ms"
        fault_budget = 3

        [[channels]]
        id = "ch1"
        supply = "hv"
        output = 0
        min_voltage = 0.0
        max_voltage = 600.0
        current_limit = 1e-5
        safe_ramp_rate = 50.0
    "#;

    const PLAN: &str = r#"
        [[temperature]]
        setpoint = 25.0
        ramp_rate = 1.0
        hold = "1h"

        [channels.ch1]
        bias = [{ voltage_target = 200.0, ramp_rate = 100.0, measurement_interval = "5s" }]
    "#;

    fn stable_chamber() -> ChamberState {
        ChamberState {
            phase: ChamberPhase::Holding,
            setpoint: Some(25.0),
            commanded: Some(25.0),
            temperature: Some(25.0),
            humidity: None,
            door: DoorState::Closed,
            stable: true,
            health: Health::Healthy,
            step_index: 0,
        }
    }

    struct Harness {
        state: watch::Receiver<ChannelState>,
        commands: mpsc::Sender<ChannelCommand>,
        chamber: watch::Sender<ChamberState>,
        plan: watch::Sender<Arc<Plan>>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<AppResult<()>>,
        log: LogHandle,
        settings: Settings,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn start(supply: &MockPowerSupply, plan: &str, chamber: ChamberState) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let settings = Settings::from_toml_str(SETTINGS).unwrap();
            let (writer, _) = LogWriter::open(dir.path(), false).unwrap();
            let (log, _log_task) = writer.spawn();
            let reporter = EventReporter::new(log.clone(), AlertHandle::disabled(), Severity::Error);
            let plan = Plan::from_document(PlanDocument::from_toml_str(plan).unwrap(), &settings, 1).unwrap();
            let (plan_tx, plan_rx) = watch::channel(Arc::new(plan));
            let (chamber_tx, chamber_rx) = watch::channel(chamber);
            let (controller, state, commands) = ChannelController::new(
                settings.channels[0].clone(),
                Arc::new(supply.clone()),
                &settings,
                plan_rx,
                chamber_rx,
                reporter,
            );
            let (shutdown, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(controller.run(shutdown_rx));
            Self {
                state,
                commands,
                chamber: chamber_tx,
                plan: plan_tx,
                shutdown,
                task,
                log,
                settings,
                dir,
            }
        }

        fn phase(&self) -> ChannelPhase {
            self.state.borrow().phase
        }

        async fn events(&self) -> Vec<Event> {
            self.log.flush().await;
            replay(LogPaths::in_dir(self.dir.path()).events).unwrap()
        }

        async fn measurements(&self) -> Vec<Measurement> {
            self.log.flush().await;
            replay(LogPaths::in_dir(self.dir.path()).measurements).unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramps_to_target_then_measures() {
        let supply = MockPowerSupply::new();
        let h = Harness::start(&supply, PLAN, stable_chamber());

        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.phase(), ChannelPhase::BiasRamping);
        sleep(Duration::from_secs(3)).await;
        assert_eq!(h.phase(), ChannelPhase::Measuring);
        assert_eq!(supply.voltage(0).await, 200.0);

        let history = supply.voltage_history(0).await;
        assert!(history.windows(2).all(|w| w[1] >= w[0] && w[1] - w[0] <= 100.0));

        sleep(Duration::from_secs(11)).await;
        let measurements = h.measurements().await;
        assert!(measurements.len() >= 3);
        assert!(measurements.iter().all(|m| m.voltage == 200.0 && m.kind == MeasurementKind::Standby));
        assert_eq!(measurements[0].temperature, Some(25.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_waits_for_stable_chamber() {
        let supply = MockPowerSupply::new();
        let settling = ChamberState {
            stable: false,
            phase: ChamberPhase::Ramping,
            ..stable_chamber()
        };
        let h = Harness::start(&supply, PLAN, settling);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.phase(), ChannelPhase::Idle);
        assert!(supply.voltage_history(0).await.is_empty());

        h.chamber.send_replace(stable_chamber());
        sleep(Duration::from_secs(5)).await;
        assert_eq!(supply.voltage(0).await, 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_current_trips_and_stays_tripped_without_rearm() {
        let supply = MockPowerSupply::new();
        let h = Harness::start(&supply, PLAN, stable_chamber());
        sleep(Duration::from_secs(6)).await;
        assert_eq!(h.phase(), ChannelPhase::Measuring);

        supply.set_current_override(0, Some(5e-5)).await;
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.phase(), ChannelPhase::TripSafe);
        assert_eq!(h.state.borrow().health, Health::Tripped);

        // 200 V at 50 V/s
        sleep(Duration::from_secs(5)).await;
        assert_eq!(supply.voltage(0).await, 0.0);
        assert_eq!(supply.ramp_down_count(0).await, 1);
        let history = supply.voltage_history(0).await;
        let peak = history.iter().position(|v| *v == 200.0).unwrap();
        assert!(history[peak..].windows(2).all(|w| w[0] - w[1] <= 50.0 + 1e-9));

        // Condition cleared, but no re-arm: stays safe
        supply.set_current_override(0, None).await;
        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.phase(), ChannelPhase::TripSafe);
        assert_eq!(supply.voltage(0).await, 0.0);

        let trips = h
            .events()
            .await
            .into_iter()
            .filter(|e| e.severity == Severity::Error && e.message.contains("over-current"))
            .count();
        assert_eq!(trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_requires_zero_and_clear_chamber() {
        let supply = MockPowerSupply::new();
        let h = Harness::start(&supply, PLAN, stable_chamber());
        sleep(Duration::from_secs(6)).await;

        let open = ChamberState {
            door: DoorState::Open,
            ..stable_chamber()
        };
        h.chamber.send_replace(open);
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.phase(), ChannelPhase::TripSafe);

        // Still ramping down and the door is open
        h.commands
            .send(ChannelCommand::Rearm { requested_by: "test".into() })
            .await
            .unwrap();
        sleep(Duration::from_secs(6)).await;
        assert_eq!(h.phase(), ChannelPhase::TripSafe);

        h.chamber.send_replace(stable_chamber());
        h.commands
            .send(ChannelCommand::Rearm { requested_by: "test".into() })
            .await
            .unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_ne!(h.phase(), ChannelPhase::TripSafe);
        assert_eq!(supply.voltage(0).await, 200.0);
        assert_ne!(h.state.borrow().health, Health::Tripped);

        let warnings = h
            .events()
            .await
            .into_iter()
            .filter(|e| e.severity == Severity::Warning && e.message.contains("rejected"))
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_edit_changes_target() {
        let supply = MockPowerSupply::new();
        let h = Harness::start(&supply, PLAN, stable_chamber());
        sleep(Duration::from_secs(6)).await;

        let edited = PLAN.replace("voltage_target = 200.0", "voltage_target = 300.0");
        let plan = Plan::from_document(PlanDocument::from_toml_str(&edited).unwrap(), &h.settings, 2).unwrap();
        h.plan.send_replace(Arc::new(plan));
        sleep(Duration::from_secs(5)).await;
        assert_eq!(supply.voltage(0).await, 300.0);
        assert_eq!(h.phase(), ChannelPhase::Measuring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iv_curve_sweeps_and_returns() {
        let supply = MockPowerSupply::new();
        let plan = format!(
            "{PLAN}\niv_curve = {{ start = 0.0, stop = 100.0, points = 5, every = \"10s\" }}\n"
        );
        let h = Harness::start(&supply, &plan, stable_chamber());
        sleep(Duration::from_secs(25)).await;

        let iv: Vec<f64> = h
            .measurements()
            .await
            .into_iter()
            .filter(|m| m.kind == MeasurementKind::IvCurve)
            .map(|m| m.voltage)
            .collect();
        assert_eq!(&iv[..5], &[0.0, 25.0, 50.0, 75.0, 100.0]);
        assert_eq!(supply.voltage(0).await, 200.0);

        // Down to the first point and back up at the step's 100 V/s
        let history = supply.voltage_history(0).await;
        assert!(
            history.windows(2).all(|w| (w[1] - w[0]).abs() <= 100.0 + 1e-9),
            "jump above the ramp rate: {history:?}"
        );
    }

    /// 200 V for 20 s, then 100 V open-ended.
    const TWO_STEPS: &str = r#"
        [[temperature]]
        setpoint = 25.0
        ramp_rate = 1.0
        hold = "1h"

        [channels.ch1]
        bias = [
            { voltage_target = 200.0, ramp_rate = 100.0, measurement_interval = "5s", duration = "20s" },
            { voltage_target = 100.0, ramp_rate = 100.0, measurement_interval = "5s" },
        ]
    "#;

    #[tokio::test(start_paused = true)]
    async fn test_step_duration_moves_to_next_step() {
        let supply = MockPowerSupply::new();
        let h = Harness::start(&supply, TWO_STEPS, stable_chamber());

        // 200 V reached after 1 s
        sleep(Duration::from_millis(20_500)).await;
        assert_eq!(h.state.borrow().step_index, 0);
        assert_eq!(supply.voltage(0).await, 200.0);

        sleep(Duration::from_secs(3)).await;
        let state = h.state.borrow().clone();
        assert_eq!(state.step_index, 1);
        assert_eq!(state.phase, ChannelPhase::Measuring);
        assert_eq!(supply.voltage(0).await, 100.0);

        // The open-ended last step stays
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.state.borrow().step_index, 1);
        let events = h.events().await;
        assert_eq!(
            events
                .iter()
                .filter(|e| e.message.starts_with("Bias step 2: ramping to 100 V"))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_iv_sweeps_do_not_restart_step_duration() {
        let supply = MockPowerSupply::new();
        let plan = format!(
            "{TWO_STEPS}\niv_curve = {{ start = 0.0, stop = 100.0, points = 3, every = \"10s\" }}\n"
        );
        let h = Harness::start(&supply, &plan, stable_chamber());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.state.borrow().step_index, 1);

        let measurements = h.measurements().await;
        assert!(measurements.iter().any(|m| m.kind == MeasurementKind::IvCurve));
        assert!(measurements
            .iter()
            .any(|m| m.kind == MeasurementKind::Standby && m.voltage == 100.0));
        let history = supply.voltage_history(0).await;
        assert!(history.windows(2).all(|w| (w[1] - w[0]).abs() <= 100.0 + 1e-9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_before_holds_back_next_bias_step() {
        let supply = MockPowerSupply::new();
        let plan = TWO_STEPS.replace(
            "{ voltage_target = 100.0,",
            "{ not_before = \"2099-01-01T00:00:00Z\", voltage_target = 100.0,",
        );
        let h = Harness::start(&supply, &plan, stable_chamber());

        sleep(Duration::from_secs(40)).await;
        let state = h.state.borrow().clone();
        assert_eq!(state.step_index, 0);
        assert_eq!(state.phase, ChannelPhase::Measuring);
        assert_eq!(supply.voltage(0).await, 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_call_marks_degraded_until_clean_cycle() {
        let supply = MockPowerSupply::new();
        let h = Harness::start(&supply, PLAN, stable_chamber());
        sleep(Duration::from_millis(5_500)).await;
        assert_eq!(h.state.borrow().health, Health::Healthy);

        supply.fail_next(1).await;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.state.borrow().health, Health::Degraded);
        assert_eq!(h.phase(), ChannelPhase::Measuring);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.state.borrow().health, Health::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_supply_is_fatal() {
        let supply = MockPowerSupply::new();
        let h = Harness::start(&supply, PLAN, stable_chamber());
        sleep(Duration::from_secs(6)).await;

        supply.set_disconnected(true).await;
        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(DaqError::FatalController { .. })));
        assert_eq!(h.state.borrow().health, Health::Tripped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ramps_to_zero_before_exit() {
        let supply = MockPowerSupply::new();
        let h = Harness::start(&supply, PLAN, stable_chamber());
        sleep(Duration::from_secs(6)).await;

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
        assert_eq!(supply.voltage(0).await, 0.0);
        assert_eq!(supply.ramp_down_count(0).await, 1);
        assert_eq!(h.state.borrow().phase, ChannelPhase::Finished);
    }
}
