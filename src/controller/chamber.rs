//! Chamber controller: walks the temperature profile.
//!
//! ```text
//! Idle ──► Ramping ──► Holding ──► Ramping (next step) ... ──► Finished
//!   \          \           \                                    /
//!    └──────────┴───────────┴──────────► SafeState ◄───────────┘
//! ```
//!
//! `SafeState` is entered on an open door, a failed read or a temperature
//! outside the configured limits. The chamber is then commanded to ambient
//! and only resumes once conditions have stayed clear for the clearance
//! dwell.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{step_toward, ChamberPhase, ChamberState, Health};
use crate::config::{ChamberConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{with_retry, RetryPolicy};
use crate::events::{Event, EventReporter};
use crate::instrument::{ClimateChamber, DoorState};
use crate::plan::{Plan, TemperatureStep};

const SOURCE: &str = "chamber";

/// Temperature-profile loop of the climate chamber.
pub struct ChamberController {
    chamber: Arc<dyn ClimateChamber>,
    config: ChamberConfig,
    tick: Duration,
    retry: RetryPolicy,
    fault_budget: u32,
    plan: watch::Receiver<Arc<Plan>>,
    state_tx: watch::Sender<ChamberState>,
    reporter: EventReporter,

    state: ChamberState,
    in_band_since: Option<Instant>,
    hold_started: Option<Instant>,
    clear_since: Option<Instant>,
    safe_reason: Option<String>,
    consecutive_faults: u32,
}

impl ChamberController {
    /// Create the controller and the receiver of its published state.
    pub fn new(
        chamber: Arc<dyn ClimateChamber>,
        settings: &Settings,
        plan: watch::Receiver<Arc<Plan>>,
        reporter: EventReporter,
    ) -> (Self, watch::Receiver<ChamberState>) {
        let (state_tx, state_rx) = watch::channel(ChamberState::initial());
        let controller = Self {
            chamber,
            config: settings.chamber.clone(),
            tick: settings.daemon.tick_interval,
            retry: RetryPolicy::from(&settings.instrument),
            fault_budget: settings.instrument.fault_budget.max(1),
            plan,
            state_tx,
            reporter,
            state: ChamberState::initial(),
            in_band_since: None,
            hold_started: None,
            clear_since: None,
            safe_reason: None,
            consecutive_faults: 0,
        };
        (controller, state_rx)
    }

    /// Run until `shutdown` turns true, then command the ambient setpoint.
    /// The supervisor only sends it once every channel is at 0 V.
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
                self.shut_down().await;
                return Ok(());
            }

            let plan = self.plan.borrow().clone();
            match self.cycle(&plan).await {
                Ok(()) => self.consecutive_faults = 0,
                Err(reason) => {
                    self.consecutive_faults += 1;
                    warn!(
                        faults = self.consecutive_faults,
                        budget = self.fault_budget,
                        %reason,
                        "Chamber cycle faulted"
                    );
                    if self.consecutive_faults >= self.fault_budget {
                        return Err(self.give_up(reason).await);
                    }
                }
            }
            self.state_tx.send_replace(self.state.clone());
        }
    }

    /// One control cycle. `Err` marks the cycle as faulted.
    async fn cycle(&mut self, plan: &Plan) -> Result<(), String> {
        let now = Instant::now();
        let chamber = Arc::clone(&self.chamber);
        let mut retries = 0;
        let mut fault = None;

        match with_retry(&self.retry, "read_door_state", || chamber.read_door_state()).await {
            Ok(door) => {
                retries += door.retries;
                self.state.door = door.value;
            }
            Err(err) => {
                self.state.door = DoorState::Unknown;
                fault = Some(format!("door read failed: {err}"));
            }
        }
        match with_retry(&self.retry, "read_temperature", || chamber.read_temperature()).await {
            Ok(temperature) => {
                retries += temperature.retries;
                self.state.temperature = Some(temperature.value);
            }
            Err(err) => {
                self.state.temperature = None;
                fault.get_or_insert(format!("temperature read failed: {err}"));
            }
        }
        // Humidity is informational; a missing reading is not a fault
        if fault.is_none() {
            match with_retry(&self.retry, "read_humidity", || chamber.read_humidity()).await {
                Ok(humidity) => {
                    retries += humidity.retries;
                    self.state.humidity = humidity.value;
                }
                Err(err) => {
                    debug!(%err, "Humidity read failed");
                    self.state.humidity = None;
                }
            }
        }

        let violation = match (&fault, self.state.door, self.state.temperature) {
            (Some(fault), _, _) => Some(fault.clone()),
            (None, DoorState::Open, _) => Some("chamber door open".to_string()),
            (None, _, Some(t)) if t < self.config.min_celsius || t > self.config.max_celsius => {
                Some(format!(
                    "temperature {t:.1} °C outside the limits [{}, {}] °C",
                    self.config.min_celsius, self.config.max_celsius
                ))
            }
            _ => None,
        };
        if let Some(reason) = violation {
            self.enter_safe_state(reason).await?;
            return fault.map_or(Ok(()), Err);
        }

        if self.state.phase == ChamberPhase::SafeState && !self.clearance_elapsed(now) {
            return Ok(());
        }
        self.state.health = if retries > 0 {
            Health::Degraded
        } else {
            Health::Healthy
        };
        self.follow_schedule(plan, now).await
    }

    async fn enter_safe_state(&mut self, reason: String) -> Result<(), String> {
        let entering = self.state.phase != ChamberPhase::SafeState;
        if entering || self.safe_reason.as_deref() != Some(reason.as_str()) {
            self.reporter.emit(
                Event::error(SOURCE, format!("Chamber safe state: {reason}")).with_context(json!({
                    "door": self.state.door,
                    "temperature": self.state.temperature,
                    "setpoint": self.state.setpoint,
                    "ambient": self.config.ambient_celsius,
                })),
            );
        }
        self.state.phase = ChamberPhase::SafeState;
        self.state.health = Health::Tripped;
        self.state.stable = false;
        self.safe_reason = Some(reason);
        self.in_band_since = None;
        self.hold_started = None;
        self.clear_since = None;

        if self.state.commanded != Some(self.config.ambient_celsius) {
            self.command(self.config.ambient_celsius).await?;
        }
        Ok(())
    }

    /// Conditions are clear this cycle; leave SafeState once they have
    /// stayed clear for the clearance dwell.
    fn clearance_elapsed(&mut self, now: Instant) -> bool {
        let since = *self.clear_since.get_or_insert(now);
        if now.duration_since(since) < self.config.clearance_dwell {
            return false;
        }
        self.reporter.emit(Event::info(
            SOURCE,
            format!(
                "Chamber conditions clear for {:?}, resuming schedule",
                self.config.clearance_dwell
            ),
        ));
        self.clear_since = None;
        self.safe_reason = None;
        self.state.phase = if self.state.setpoint.is_some() {
            ChamberPhase::Ramping
        } else {
            ChamberPhase::Idle
        };
        true
    }

    async fn follow_schedule(&mut self, plan: &Plan, now: Instant) -> Result<(), String> {
        let steps = &plan.temperature;
        let Some(last) = steps.len().checked_sub(1) else {
            return Ok(());
        };
        if self.state.step_index > last {
            self.state.step_index = last;
        }
        let index = self.state.step_index;

        match self.state.phase {
            ChamberPhase::Idle => {
                if !not_before_passed(&steps[0]) {
                    return Ok(());
                }
                self.start_step(steps, 0);
            }
            ChamberPhase::Holding | ChamberPhase::Finished
                if self.state.setpoint != Some(steps[index].setpoint) =>
            {
                debug!(step = index + 1, "Setpoint changed by plan edit");
                self.start_step(steps, index);
            }
            ChamberPhase::Holding => {
                let held = self
                    .hold_started
                    .map_or(Duration::ZERO, |t| now.duration_since(t));
                if held >= steps[index].hold {
                    self.advance(steps);
                }
            }
            ChamberPhase::Finished if index < last => self.advance(steps),
            _ => {}
        }

        if self.state.phase == ChamberPhase::Ramping {
            let step = steps[self.state.step_index].clone();
            self.ramp(&step, now).await?;
        }
        Ok(())
    }

    fn start_step(&mut self, steps: &[TemperatureStep], index: usize) {
        self.state.step_index = index;
        self.state.phase = ChamberPhase::Ramping;
        self.state.setpoint = Some(steps[index].setpoint);
        self.state.stable = false;
        self.in_band_since = None;
        self.hold_started = None;
        self.reporter.emit(
            Event::info(
                SOURCE,
                format!(
                    "Temperature step {}: ramping to {} °C at {} °C/min",
                    index + 1,
                    steps[index].setpoint,
                    steps[index].ramp_rate
                ),
            )
            .with_context(json!({ "step": index + 1, "setpoint": steps[index].setpoint })),
        );
    }

    fn advance(&mut self, steps: &[TemperatureStep]) {
        let next = self.state.step_index + 1;
        match steps.get(next) {
            Some(step) if not_before_passed(step) => self.start_step(steps, next),
            // Keep holding until the next step may start
            Some(_) => {}
            None => {
                if self.state.phase != ChamberPhase::Finished {
                    self.state.phase = ChamberPhase::Finished;
                    self.reporter
                        .emit(Event::info(SOURCE, "Temperature schedule finished"));
                }
            }
        }
    }

    async fn ramp(&mut self, step: &TemperatureStep, now: Instant) -> Result<(), String> {
        let from = self
            .state
            .commanded
            .or(self.state.temperature)
            .unwrap_or(step.setpoint);
        let max_step = step.ramp_rate / 60.0 * self.tick.as_secs_f64();
        let next = step_toward(from, step.setpoint, max_step);
        if self.state.commanded != Some(next) {
            self.command(next).await?;
        }

        let in_band = next == step.setpoint
            && self
                .state
                .temperature
                .is_some_and(|t| (t - step.setpoint).abs() <= self.config.tolerance_celsius);
        if !in_band {
            self.in_band_since = None;
            return Ok(());
        }
        let since = *self.in_band_since.get_or_insert(now);
        if now.duration_since(since) >= self.config.dwell {
            self.state.phase = ChamberPhase::Holding;
            self.state.stable = true;
            self.hold_started = Some(now);
            self.reporter.emit(Event::info(
                SOURCE,
                format!(
                    "Chamber stable at {} °C, holding for {:?}",
                    step.setpoint, step.hold
                ),
            ));
        }
        Ok(())
    }

    async fn command(&mut self, celsius: f64) -> Result<(), String> {
        let chamber = Arc::clone(&self.chamber);
        with_retry(&self.retry, "set_temperature", || chamber.set_temperature(celsius))
            .await
            .map_err(|err| format!("setting {celsius} °C failed: {err}"))?;
        self.state.commanded = Some(celsius);
        Ok(())
    }

    async fn shut_down(&mut self) {
        let ambient = self.config.ambient_celsius;
        match self.command(ambient).await {
            Ok(()) => self.reporter.emit(Event::info(
                SOURCE,
                format!("Shutdown: chamber commanded to ambient {ambient} °C"),
            )),
            Err(reason) => self.reporter.emit(Event::error(
                SOURCE,
                format!("Shutdown: could not command ambient setpoint: {reason}"),
            )),
        }
        self.state.stable = false;
        self.state_tx.send_replace(self.state.clone());
    }

    /// Publish a tripped state, try once more to reach ambient, and report
    /// the fatal fault.
    async fn give_up(&mut self, reason: String) -> DaqError {
        self.state.phase = ChamberPhase::SafeState;
        self.state.health = Health::Tripped;
        self.state.stable = false;
        self.state_tx.send_replace(self.state.clone());

        let chamber = Arc::clone(&self.chamber);
        let ambient = self.config.ambient_celsius;
        let once = RetryPolicy {
            max_attempts: 1,
            ..self.retry.clone()
        };
        if let Err(err) = with_retry(&once, "set_temperature", || chamber.set_temperature(ambient)).await
        {
            warn!(%err, "Could not command ambient setpoint after fatal fault");
        }
        DaqError::FatalController {
            controller: SOURCE.to_string(),
            reason: format!(
                "{reason} ({} consecutive faulted cycles)",
                self.consecutive_faults
            ),
        }
    }
}

fn not_before_passed(step: &TemperatureStep) -> bool {
    step.not_before.map_or(true, |t| Utc::now() >= t)
}
