//! Control loops and the state snapshots they publish.
//!
//! Each controller exclusively owns its state and publishes a copy on a
//! `watch` channel after every cycle. Nothing else mutates it; the
//! interlock and the supervisor only ever look at snapshots.

pub mod chamber;
pub mod channel;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::instrument::DoorState;

pub use chamber::ChamberController;
pub use channel::{ChannelCommand, ChannelController};

/// Health flag shared by chamber and channel states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Instrument calls succeed first time
    Healthy,
    /// Working, but instrument calls needed retries
    Degraded,
    /// Forced into its safe state; needs clearance
    Tripped,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Tripped => "tripped",
        };
        f.write_str(text)
    }
}

/// Where the chamber is in its temperature profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChamberPhase {
    /// No step started yet
    Idle,
    /// Walking the setpoint toward the step's target
    Ramping,
    /// Settled at the target for the step's hold time
    Holding,
    /// Last step held; the setpoint is kept
    Finished,
    /// Commanded to ambient after a safety violation
    SafeState,
}

/// Where a channel is in its bias schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    /// At 0 V, waiting for a step and a permitting interlock
    Idle,
    /// Ramping toward the step's target
    BiasRamping,
    /// Target reached, first reading pending
    Biased,
    /// Taking standby readings at the target
    Measuring,
    /// Stepping through IV-curve points
    IvSweep,
    /// Tripped: ramping to or held at 0 V until re-armed
    TripSafe,
    /// Ramping to 0 V for shutdown
    Finished,
}

/// Published chamber snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChamberState {
    /// Current phase
    pub phase: ChamberPhase,
    /// Setpoint of the current schedule step
    pub setpoint: Option<f64>,
    /// Setpoint last sent to the chamber
    pub commanded: Option<f64>,
    /// Last temperature read, in °C
    pub temperature: Option<f64>,
    /// Relative humidity in %RH, if the chamber has a sensor
    #[serde(default)]
    pub humidity: Option<f64>,
    /// Last door reading
    pub door: DoorState,
    /// Temperature has settled at the step's setpoint
    pub stable: bool,
    /// Health of the chamber link and conditions
    pub health: Health,
    /// Index of the current temperature step
    pub step_index: usize,
}

impl ChamberState {
    /// State before the first cycle: nothing confirmed yet.
    pub fn initial() -> Self {
        Self {
            phase: ChamberPhase::Idle,
            setpoint: None,
            commanded: None,
            temperature: None,
            humidity: None,
            door: DoorState::Unknown,
            stable: false,
            health: Health::Healthy,
            step_index: 0,
        }
    }

    /// State published for a chamber whose controller is gone.
    pub fn lost() -> Self {
        Self {
            phase: ChamberPhase::SafeState,
            health: Health::Tripped,
            ..Self::initial()
        }
    }
}

/// Published channel snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Channel id from the settings
    pub id: String,
    /// Current phase
    pub phase: ChannelPhase,
    /// Voltage last sent to the supply
    pub commanded_voltage: f64,
    /// Read-back voltage; `None` if the last read failed
    pub measured_voltage: Option<f64>,
    /// Read-back current in amperes; `None` if the last read failed
    pub measured_current: Option<f64>,
    /// Index of the current bias step
    pub step_index: usize,
    /// Health of the channel
    pub health: Health,
}

impl ChannelState {
    /// State before the first cycle: idle at 0 V.
    pub fn initial(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: ChannelPhase::Idle,
            commanded_voltage: 0.0,
            measured_voltage: None,
            measured_current: None,
            step_index: 0,
            health: Health::Healthy,
        }
    }

    /// True unless the channel is known to sit at 0 V.
    pub fn may_be_biased(&self) -> bool {
        self.commanded_voltage != 0.0 || self.measured_voltage.is_some_and(|v| v.abs() > 1.0)
    }
}

/// Move `from` toward `to` by at most `max_step`.
pub(crate) fn step_toward(from: f64, to: f64, max_step: f64) -> f64 {
    let delta = to - from;
    if delta.abs() <= max_step {
        to
    } else {
        from + max_step.copysign(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_toward_never_overshoots() {
        assert_eq!(step_toward(0.0, 10.0, 4.0), 4.0);
        assert_eq!(step_toward(8.0, 10.0, 4.0), 10.0);
        assert_eq!(step_toward(10.0, -2.0, 5.0), 5.0);
        assert_eq!(step_toward(3.0, 3.0, 1.0), 3.0);
    }

    #[test]
    fn test_channel_bias_detection() {
        let mut state = ChannelState::initial("ch1");
        assert!(!state.may_be_biased());
        state.measured_voltage = Some(120.0);
        assert!(state.may_be_biased());
        state.measured_voltage = Some(0.2);
        state.commanded_voltage = 0.0;
        assert!(!state.may_be_biased());
    }
}
