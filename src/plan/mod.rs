//! Declarative experiment plan.
//!
//! A plan describes the temperature profile of the chamber and, per channel,
//! the bias schedule, an optional periodic IV-curve sweep and the operator's
//! re-arm counter. It is read from a [`ControlSource`] as a [`PlanDocument`],
//! validated against the daemon [`Settings`], and published by the
//! [`PlanStore`] as an immutable, versioned [`Plan`].
//!
//! # Document Format
//!
//! ```toml
//! [[temperature]]
//! setpoint = -20.0
//! ramp_rate = 1.0        # °C per minute
//! hold = "48h"
//!
//! [channels.ch1]
//! rearm = 0
//! bias = [
//!     { voltage_target = 500.0, ramp_rate = 5.0, measurement_interval = "10m", duration = "24h" },
//!     { voltage_target = 600.0, ramp_rate = 5.0, measurement_interval = "10m" },
//! ]
//! iv_curve = { start = 0.0, stop = 600.0, points = 13, every = "24h" }
//! ```
//!
//! Only the last step of a schedule may omit `duration`, and optional
//! `not_before` instants (RFC 3339 strings) must not decrease along a
//! schedule.

pub mod source;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::Settings;

pub use source::{ChangeFeed, ControlSource, FileControlSource, MemoryControlSource, PLAN_FILE};
pub use store::{PlanStore, ReloadOutcome};

/// Reasons a control-source edit is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// The control source could not be read
    #[error("cannot read control source: {0}")]
    Source(String),

    /// The document does not parse
    #[error("malformed plan document: {0}")]
    Malformed(String),

    /// No temperature step given
    #[error("temperature schedule is empty")]
    EmptyTemperatureSchedule,

    /// A channel plan names a channel the settings do not declare
    #[error("plan references unknown channel '{0}'")]
    UnknownChannel(String),

    /// A setpoint or voltage lies outside the hardware limits
    #[error("{location}: {value} {unit} outside the allowed range [{min}, {max}]")]
    OutOfRange {
        /// Offending step
        location: String,
        /// Requested value
        value: f64,
        /// Unit of `value`
        unit: &'static str,
        /// Lower limit
        min: f64,
        /// Upper limit
        max: f64,
    },

    /// A rate, interval or count is zero or negative
    #[error("{location}: {field} must be positive")]
    NonPositive {
        /// Offending step
        location: String,
        /// Offending field
        field: &'static str,
    },

    /// A step other than the last has no duration
    #[error("{location}: only the last step may omit its duration")]
    AmbiguousDuration {
        /// Offending step
        location: String,
    },

    /// `not_before` decreases along a schedule
    #[error("{location}: not_before is earlier than that of the previous step")]
    NonMonotonic {
        /// Offending step
        location: String,
    },

    /// The IV sweep is out of range or has too few points
    #[error("channel '{channel}': invalid IV curve: {reason}")]
    InvalidIvCurve {
        /// Channel id
        channel: String,
        /// What is wrong
        reason: String,
    },
}

/// One entry of the chamber's temperature profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureStep {
    /// Target temperature in °C
    pub setpoint: f64,
    /// Time to hold the setpoint once stable
    #[serde(with = "humantime_serde")]
    pub hold: Duration,
    /// Setpoint slew rate in °C per minute
    pub ramp_rate: f64,
    /// Do not start this step before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

/// One entry of a channel's bias schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasStep {
    /// Bias voltage in volts
    pub voltage_target: f64,
    /// Ramp rate in volts per second
    pub ramp_rate: f64,
    /// Period of standby measurements at the target
    #[serde(with = "humantime_serde")]
    pub measurement_interval: Duration,
    /// How long to stay on this step; open-ended when absent
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    /// Do not start this step before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

/// Periodic IV-curve sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvCurve {
    /// First point in volts
    pub start: f64,
    /// Last point in volts
    pub stop: f64,
    /// Number of evenly spaced points, including both ends
    pub points: u32,
    /// Time between sweeps
    #[serde(with = "humantime_serde")]
    pub every: Duration,
}

impl IvCurve {
    /// Voltage of sweep point `index`.
    pub fn point(&self, index: u32) -> f64 {
        if self.points < 2 {
            return self.start;
        }
        let fraction = f64::from(index.min(self.points - 1)) / f64::from(self.points - 1);
        self.start + (self.stop - self.start) * fraction
    }
}

/// Everything the plan says about one channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelPlan {
    /// Bias schedule, in order
    #[serde(default)]
    pub bias: Vec<BiasStep>,
    /// Periodic IV sweep, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_curve: Option<IvCurve>,
    /// Operator clearance counter; every increment re-arms a tripped channel
    #[serde(default)]
    pub rearm: u64,
}

/// Raw plan as read from the control source, before validation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanDocument {
    /// Chamber temperature profile, in order
    #[serde(default)]
    pub temperature: Vec<TemperatureStep>,
    /// Per-channel plans by channel id
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelPlan>,
}

impl PlanDocument {
    /// Parse a TOML plan document.
    pub fn from_toml_str(text: &str) -> Result<Self, PlanError> {
        toml::from_str(text).map_err(|e| PlanError::Malformed(e.to_string()))
    }

    /// SHA-256 of the canonical JSON form, as lowercase hex.
    ///
    /// Channels are kept in a `BTreeMap`, so equal documents always produce
    /// equal fingerprints regardless of the order in the source.
    pub fn fingerprint(&self) -> Result<String, PlanError> {
        let canonical =
            serde_json::to_vec(self).map_err(|e| PlanError::Malformed(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Check the document against the declared hardware.
    pub fn validate(&self, settings: &Settings) -> Result<(), PlanError> {
        if self.temperature.is_empty() {
            return Err(PlanError::EmptyTemperatureSchedule);
        }

        let chamber = &settings.chamber;
        let mut previous_start = None;
        for (i, step) in self.temperature.iter().enumerate() {
            let location = format!("temperature step {}", i + 1);
            if !(step.setpoint >= chamber.min_celsius && step.setpoint <= chamber.max_celsius) {
                return Err(PlanError::OutOfRange {
                    location,
                    value: step.setpoint,
                    unit: "°C",
                    min: chamber.min_celsius,
                    max: chamber.max_celsius,
                });
            }
            if !(step.ramp_rate > 0.0) {
                return Err(PlanError::NonPositive {
                    location,
                    field: "ramp_rate",
                });
            }
            check_not_before(&mut previous_start, step.not_before, &location)?;
        }

        for (id, plan) in &self.channels {
            let channel = settings
                .channel(id)
                .ok_or_else(|| PlanError::UnknownChannel(id.clone()))?;

            let mut previous_start = None;
            let last = plan.bias.len().saturating_sub(1);
            for (i, step) in plan.bias.iter().enumerate() {
                let location = format!("channel '{id}' bias step {}", i + 1);
                if !channel.in_safe_range(step.voltage_target) {
                    return Err(PlanError::OutOfRange {
                        location,
                        value: step.voltage_target,
                        unit: "V",
                        min: channel.min_voltage,
                        max: channel.max_voltage,
                    });
                }
                if !(step.ramp_rate > 0.0) {
                    return Err(PlanError::NonPositive {
                        location,
                        field: "ramp_rate",
                    });
                }
                if step.measurement_interval.is_zero() {
                    return Err(PlanError::NonPositive {
                        location,
                        field: "measurement_interval",
                    });
                }
                match step.duration {
                    None if i != last => return Err(PlanError::AmbiguousDuration { location }),
                    Some(d) if d.is_zero() => {
                        return Err(PlanError::NonPositive {
                            location,
                            field: "duration",
                        })
                    }
                    _ => {}
                }
                check_not_before(&mut previous_start, step.not_before, &location)?;
            }

            if let Some(iv) = &plan.iv_curve {
                let invalid = |reason: String| PlanError::InvalidIvCurve {
                    channel: id.clone(),
                    reason,
                };
                if iv.points < 2 {
                    return Err(invalid("needs at least 2 points".into()));
                }
                if iv.every.is_zero() {
                    return Err(invalid("'every' must be positive".into()));
                }
                for volts in [iv.start, iv.stop] {
                    if !channel.in_safe_range(volts) {
                        return Err(invalid(format!(
                            "{volts} V outside the safe range [{}, {}]",
                            channel.min_voltage, channel.max_voltage
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_not_before(
    previous: &mut Option<DateTime<Utc>>,
    current: Option<DateTime<Utc>>,
    location: &str,
) -> Result<(), PlanError> {
    if let Some(current) = current {
        if matches!(*previous, Some(prev) if current < prev) {
            return Err(PlanError::NonMonotonic {
                location: location.to_string(),
            });
        }
        *previous = Some(current);
    }
    Ok(())
}

/// Validated, immutable plan snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    /// Increases by one with every accepted change
    pub version: u64,
    /// SHA-256 of the canonical document
    pub fingerprint: String,
    /// When this version was accepted
    pub loaded_at: DateTime<Utc>,
    /// Chamber temperature profile
    pub temperature: Vec<TemperatureStep>,
    /// Per-channel plans by channel id
    pub channels: BTreeMap<String, ChannelPlan>,
}

impl Plan {
    /// Validate `document` and turn it into plan `version`.
    pub fn from_document(
        document: PlanDocument,
        settings: &Settings,
        version: u64,
    ) -> Result<Self, PlanError> {
        document.validate(settings)?;
        let fingerprint = document.fingerprint()?;
        Ok(Self {
            version,
            fingerprint,
            loaded_at: Utc::now(),
            temperature: document.temperature,
            channels: document.channels,
        })
    }

    /// The plan for channel `id`, if it has one.
    pub fn channel(&self, id: &str) -> Option<&ChannelPlan> {
        self.channels.get(id)
    }

    /// Re-arm counter of channel `id` (0 when absent).
    pub fn rearm_counter(&self, id: &str) -> u64 {
        self.channel(id).map_or(0, |c| c.rearm)
    }
}
