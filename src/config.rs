//! Daemon configuration using Figment
//!
//! Strongly-typed settings for the supervisory core. Configuration is
//! layered from:
//! 1. Built-in defaults
//! 2. An optional TOML file (`standby.toml`)
//! 3. Environment variables prefixed with `STANDBY_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! STANDBY_DAEMON__TICK_INTERVAL=500ms
//! STANDBY_DAEMON__TRIP_POLICY=shutdown_all
//! STANDBY_CHAMBER__AMBIENT_CELSIUS=18
//! ```
//!
//! These settings describe the static hardware (which channels exist, their
//! safe voltage ranges and current limits) and the control-loop tuning. The
//! experiment schedule itself lives in the hot-reloadable plan, see
//! [`crate::plan`].

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::events::Severity;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Parsing or merging a provider failed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// The merged settings are inconsistent
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// What happens to the rest of the experiment when one controller dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TripPolicy {
    /// Other controllers keep running independently.
    #[default]
    Isolate,
    /// Ramp every channel down, set the chamber to ambient and exit.
    ShutdownAll,
}

/// Top-level daemon settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Process-level settings
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Timeouts and retry budget for instrument calls
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Chamber stabilization and safety limits
    #[serde(default)]
    pub chamber: ChamberConfig,
    /// Declared sensor channels
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Process-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding the control source (`plan.toml`)
    pub control_dir: PathBuf,
    /// Directory for the event and data logs
    pub log_dir: PathBuf,
    /// Control loop period
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Fallback poll period of the plan store
    #[serde(with = "humantime_serde")]
    pub plan_poll_interval: Duration,
    /// Reaction to a fatal controller fault
    pub trip_policy: TripPolicy,
    /// Minimum severity forwarded to the alert sink
    pub alert_threshold: Severity,
    /// Capacity of the alert queue; overflow falls back to local logging
    pub alert_queue: usize,
    /// fsync after every log append
    pub sync_writes: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            control_dir: PathBuf::from("control"),
            log_dir: PathBuf::from("log"),
            tick_interval: Duration::from_secs(1),
            plan_poll_interval: Duration::from_secs(5),
            trip_policy: TripPolicy::Isolate,
            alert_threshold: Severity::Error,
            alert_queue: 64,
            sync_writes: true,
        }
    }
}

/// Instrument call policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Upper bound of a single adapter call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Attempts per call, including the first
    pub max_attempts: u32,
    /// First retry delay, doubled after each failure
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// Cap of the retry delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Consecutive faulted cycles a controller tolerates before giving up
    pub fault_budget: u32,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            fault_budget: 3,
        }
    }
}

/// Chamber stabilization and safety limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChamberConfig {
    /// Band around the setpoint considered "at temperature"
    pub tolerance_celsius: f64,
    /// Time the temperature must stay in band before holding
    #[serde(with = "humantime_serde")]
    pub dwell: Duration,
    /// Time the door must stay closed (and readings healthy) to leave SafeState
    #[serde(with = "humantime_serde")]
    pub clearance_dwell: Duration,
    /// Setpoint commanded in SafeState and on shutdown
    pub ambient_celsius: f64,
    /// Lowest acceptable measured temperature
    pub min_celsius: f64,
    /// Highest acceptable measured temperature
    pub max_celsius: f64,
}

impl Default for ChamberConfig {
    fn default() -> Self {
        Self {
            tolerance_celsius: 1.0,
            dwell: Duration::from_secs(300),
            clearance_dwell: Duration::from_secs(60),
            ambient_celsius: 20.0,
            min_celsius: -45.0,
            max_celsius: 60.0,
        }
    }
}

/// One sensor channel and the supply output biasing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel name, used by the plan and in the logs
    pub id: String,
    /// Name of the power supply instance handed to the supervisor
    pub supply: String,
    /// Output number on that supply
    pub output: u8,
    /// Lowest voltage a plan may command
    pub min_voltage: f64,
    /// Highest voltage a plan may command
    pub max_voltage: f64,
    /// Absolute current above which the channel trips, in amperes
    pub current_limit: f64,
    /// Ramp rate used when forcing the channel to 0 V, in V/s
    pub safe_ramp_rate: f64,
}

impl ChannelConfig {
    /// True if `volts` lies inside the declared safe range.
    pub fn in_safe_range(&self, volts: f64) -> bool {
        volts.is_finite() && volts >= self.min_voltage && volts <= self.max_voltage
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("STANDBY_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML string, without environment overrides.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(text))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Look up a channel declaration by id.
    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.daemon.tick_interval.is_zero() {
            return invalid("daemon.tick_interval must be positive".into());
        }
        if self.daemon.plan_poll_interval.is_zero() {
            return invalid("daemon.plan_poll_interval must be positive".into());
        }
        if self.instrument.timeout.is_zero() || self.instrument.max_attempts == 0 {
            return invalid("instrument.timeout and instrument.max_attempts must be positive".into());
        }
        let chamber = &self.chamber;
        if !(chamber.tolerance_celsius > 0.0) {
            return invalid("chamber.tolerance_celsius must be positive".into());
        }
        if !(chamber.min_celsius < chamber.max_celsius) {
            return invalid("chamber.min_celsius must be below chamber.max_celsius".into());
        }
        if chamber.ambient_celsius < chamber.min_celsius
            || chamber.ambient_celsius > chamber.max_celsius
        {
            return invalid("chamber.ambient_celsius must lie within the chamber limits".into());
        }

        let mut ids = HashSet::new();
        let mut outputs = HashSet::new();
        for channel in &self.channels {
            if channel.id.trim().is_empty() {
                return invalid("channel id must not be empty".into());
            }
            if !ids.insert(channel.id.as_str()) {
                return invalid(format!("duplicate channel id '{}'", channel.id));
            }
            if !outputs.insert((channel.supply.as_str(), channel.output)) {
                return invalid(format!(
                    "channel '{}' reuses output {} of supply '{}'",
                    channel.id, channel.output, channel.supply
                ));
            }
            if !(channel.min_voltage <= 0.0 && 0.0 <= channel.max_voltage)
                || channel.min_voltage >= channel.max_voltage
            {
                return invalid(format!(
                    "channel '{}': safe range [{}, {}] must contain 0 V",
                    channel.id, channel.min_voltage, channel.max_voltage
                ));
            }
            if !(channel.current_limit > 0.0) || !(channel.safe_ramp_rate > 0.0) {
                return invalid(format!(
                    "channel '{}': current_limit and safe_ramp_rate must be positive",
                    channel.id
                ));
            }
        }
        Ok(())
    }
}
