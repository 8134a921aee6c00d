//! Simulated instruments
//!
//! Provides simulated hardware for tests and for `standby-daemon --simulate`.
//! All mock devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep), so they run under paused tokio time in tests.
//!
//! # Available Mocks
//!
//! - `MockChamber` - chamber whose temperature slews toward the setpoint
//! - `MockPowerSupply` - multi-output HV supply with ohmic leakage current
//!
//! Both support fault injection: failing the next N calls, a permanent
//! disconnect, and an artificial call latency.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};

use super::{ClimateChamber, DoorState, InstrumentError, PowerSupply};

/// Shared fault-injection knobs.
#[derive(Debug, Default)]
struct Faults {
    fail_next: u32,
    disconnected: bool,
    latency: Duration,
}

impl Faults {
    fn check(&mut self) -> Result<(), InstrumentError> {
        if self.disconnected {
            return Err(InstrumentError::Disconnected("simulated disconnect".into()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(InstrumentError::Timeout);
        }
        Ok(())
    }
}

// =============================================================================
// MockChamber - Simulated Climate Chamber
// =============================================================================

#[derive(Debug)]
struct ChamberSim {
    setpoint: f64,
    temperature: f64,
    door: DoorState,
    slew_per_sec: f64,
    updated: Instant,
    forced_temperature: Option<f64>,
    humidity: Option<f64>,
    setpoint_history: Vec<f64>,
}

impl ChamberSim {
    fn advance(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.updated).as_secs_f64();
        self.updated = now;
        let max_step = self.slew_per_sec * elapsed;
        let delta = self.setpoint - self.temperature;
        if delta.abs() <= max_step {
            self.temperature = self.setpoint;
        } else {
            self.temperature += max_step.copysign(delta);
        }
    }
}

/// Simulated climate chamber.
///
/// The measured temperature moves toward the commanded setpoint at a fixed
/// slew rate (default 0.5 °C/s), evaluated lazily on every read.
///
/// # Example
///
/// ```rust,ignore
/// let chamber = MockChamber::new(22.0);
/// chamber.set_temperature(25.0).await?;
/// tokio::time::sleep(Duration::from_secs(10)).await;
/// assert_eq!(chamber.read_temperature().await?, 25.0);
/// ```
#[derive(Clone)]
pub struct MockChamber {
    sim: Arc<RwLock<ChamberSim>>,
    faults: Arc<RwLock<Faults>>,
}

impl MockChamber {
    /// Create a chamber at `initial_celsius` with its door closed.
    pub fn new(initial_celsius: f64) -> Self {
        Self::with_slew(initial_celsius, 0.5)
    }

    /// Create a chamber with a custom slew rate in °C per second.
    pub fn with_slew(initial_celsius: f64, slew_per_sec: f64) -> Self {
        Self {
            sim: Arc::new(RwLock::new(ChamberSim {
                setpoint: initial_celsius,
                temperature: initial_celsius,
                door: DoorState::Closed,
                slew_per_sec,
                updated: Instant::now(),
                forced_temperature: None,
                humidity: None,
                setpoint_history: Vec::new(),
            })),
            faults: Arc::new(RwLock::new(Faults::default())),
        }
    }

    /// Open the door.
    pub async fn open_door(&self) {
        self.sim.write().await.door = DoorState::Open;
    }

    /// Close the door.
    pub async fn close_door(&self) {
        self.sim.write().await.door = DoorState::Closed;
    }

    /// Pin the measured temperature regardless of the setpoint.
    pub async fn force_temperature(&self, celsius: Option<f64>) {
        self.sim.write().await.forced_temperature = celsius;
    }

    /// Report `percent` %RH, or no humidity sensor.
    pub async fn set_humidity(&self, percent: Option<f64>) {
        self.sim.write().await.humidity = percent;
    }

    /// Fail the next `count` calls with a timeout.
    pub async fn fail_next(&self, count: u32) {
        self.faults.write().await.fail_next = count;
    }

    /// Fail every call until reconnected.
    pub async fn set_disconnected(&self, disconnected: bool) {
        self.faults.write().await.disconnected = disconnected;
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.faults.write().await.latency = latency;
    }

    /// Last commanded setpoint.
    pub async fn setpoint(&self) -> f64 {
        self.sim.read().await.setpoint
    }

    /// Every setpoint commanded so far, in order.
    pub async fn setpoint_history(&self) -> Vec<f64> {
        self.sim.read().await.setpoint_history.clone()
    }

    async fn gate(&self) -> Result<(), InstrumentError> {
        let latency = self.faults.read().await.latency;
        if !latency.is_zero() {
            sleep(latency).await;
        }
        self.faults.write().await.check()
    }
}

#[async_trait]
impl ClimateChamber for MockChamber {
    async fn set_temperature(&self, celsius: f64) -> Result<(), InstrumentError> {
        self.gate().await?;
        let mut sim = self.sim.write().await;
        sim.advance();
        sim.setpoint = celsius;
        sim.setpoint_history.push(celsius);
        Ok(())
    }

    async fn read_temperature(&self) -> Result<f64, InstrumentError> {
        self.gate().await?;
        let mut sim = self.sim.write().await;
        sim.advance();
        Ok(sim.forced_temperature.unwrap_or(sim.temperature))
    }

    async fn read_door_state(&self) -> Result<DoorState, InstrumentError> {
        self.gate().await?;
        Ok(self.sim.read().await.door)
    }

    async fn read_humidity(&self) -> Result<Option<f64>, InstrumentError> {
        self.gate().await?;
        Ok(self.sim.read().await.humidity)
    }
}

// =============================================================================
// MockPowerSupply - Simulated HV Power Supply
// =============================================================================

#[derive(Debug, Clone, Default)]
struct OutputSim {
    volts: f64,
    current_override: Option<f64>,
    history: Vec<f64>,
    ramp_downs: u32,
}

/// Simulated multi-output high-voltage supply.
///
/// The monitored voltage follows the set value immediately; the monitored
/// current is ohmic leakage `V / leakage_ohms` unless overridden, which is
/// how tests inject over-current.
#[derive(Clone)]
pub struct MockPowerSupply {
    outputs: Arc<RwLock<HashMap<u8, OutputSim>>>,
    leakage_ohms: f64,
    faults: Arc<RwLock<Faults>>,
}

impl Default for MockPowerSupply {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPowerSupply {
    /// Create a supply with 1 GΩ leakage on every output.
    pub fn new() -> Self {
        Self::with_leakage(1.0e9)
    }

    /// Create a supply with `leakage_ohms` on every output.
    pub fn with_leakage(leakage_ohms: f64) -> Self {
        Self {
            outputs: Arc::new(RwLock::new(HashMap::new())),
            leakage_ohms,
            faults: Arc::new(RwLock::new(Faults::default())),
        }
    }

    /// Force the monitored current of `output`, or restore ohmic leakage.
    pub async fn set_current_override(&self, output: u8, amperes: Option<f64>) {
        self.outputs
            .write()
            .await
            .entry(output)
            .or_default()
            .current_override = amperes;
    }

    /// Fail the next `count` calls with a timeout.
    pub async fn fail_next(&self, count: u32) {
        self.faults.write().await.fail_next = count;
    }

    /// Fail every call until reconnected.
    pub async fn set_disconnected(&self, disconnected: bool) {
        self.faults.write().await.disconnected = disconnected;
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.faults.write().await.latency = latency;
    }

    /// Currently set voltage of `output`.
    pub async fn voltage(&self, output: u8) -> f64 {
        self.outputs
            .read()
            .await
            .get(&output)
            .map_or(0.0, |o| o.volts)
    }

    /// Every voltage set on `output` so far, in order.
    pub async fn voltage_history(&self, output: u8) -> Vec<f64> {
        self.outputs
            .read()
            .await
            .get(&output)
            .map(|o| o.history.clone())
            .unwrap_or_default()
    }

    /// Number of hardware ramp-downs issued on `output`.
    pub async fn ramp_down_count(&self, output: u8) -> u32 {
        self.outputs
            .read()
            .await
            .get(&output)
            .map_or(0, |o| o.ramp_downs)
    }

    async fn gate(&self) -> Result<(), InstrumentError> {
        let latency = self.faults.read().await.latency;
        if !latency.is_zero() {
            sleep(latency).await;
        }
        self.faults.write().await.check()
    }
}

#[async_trait]
impl PowerSupply for MockPowerSupply {
    async fn set_voltage(&self, output: u8, volts: f64) -> Result<(), InstrumentError> {
        self.gate().await?;
        let mut outputs = self.outputs.write().await;
        let out = outputs.entry(output).or_default();
        out.volts = volts;
        out.history.push(volts);
        Ok(())
    }

    async fn read_voltage(&self, output: u8) -> Result<f64, InstrumentError> {
        self.gate().await?;
        Ok(self.voltage(output).await)
    }

    async fn read_current(&self, output: u8) -> Result<f64, InstrumentError> {
        self.gate().await?;
        let outputs = self.outputs.read().await;
        let current = outputs.get(&output).map_or(0.0, |o| {
            o.current_override
                .unwrap_or(o.volts / self.leakage_ohms)
        });
        Ok(current)
    }

    async fn ramp_down(&self, output: u8) -> Result<(), InstrumentError> {
        self.gate().await?;
        let mut outputs = self.outputs.write().await;
        let out = outputs.entry(output).or_default();
        out.volts = 0.0;
        out.history.push(0.0);
        out.ramp_downs += 1;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
