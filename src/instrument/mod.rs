//! Instrument capability traits.
//!
//! The supervisory core never talks to a vendor SDK directly. Chamber and
//! power-supply drivers are handed to the [`Supervisor`](crate::supervisor::Supervisor)
//! as trait objects implementing the capabilities below, so simulated
//! instruments can stand in for the real ones.
//!
//! Every call may fail with an [`InstrumentError`]. The controllers treat all
//! of them as transient and retry with backoff (see
//! [`crate::error_recovery`]); only an exhausted retry budget is escalated.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Transient fault reported by an instrument adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    /// No reply within the retry policy's timeout
    #[error("instrument call timed out")]
    Timeout,

    /// Link to the instrument lost
    #[error("instrument disconnected: {0}")]
    Disconnected(String),

    /// The instrument refused the command
    #[error("instrument rejected command: {0}")]
    Rejected(String),
}

/// Door state as reported by the chamber.
///
/// `Unknown` is never produced by an adapter; the chamber controller
/// publishes it when the door could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorState {
    /// Door open
    Open,
    /// Door closed
    Closed,
    /// Could not be read
    Unknown,
}

impl fmt::Display for DoorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DoorState::Open => "open",
            DoorState::Closed => "closed",
            DoorState::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Capability for climate chambers.
#[async_trait]
pub trait ClimateChamber: Send + Sync {
    /// Command a new temperature setpoint in °C.
    async fn set_temperature(&self, celsius: f64) -> Result<(), InstrumentError>;

    /// Read the measured chamber temperature in °C.
    async fn read_temperature(&self) -> Result<f64, InstrumentError>;

    /// Read whether the chamber door is open.
    async fn read_door_state(&self) -> Result<DoorState, InstrumentError>;

    /// Read the relative humidity in %RH, for chambers with a sensor.
    async fn read_humidity(&self) -> Result<Option<f64>, InstrumentError> {
        Ok(None)
    }
}

/// Capability for multi-output high-voltage power supplies.
///
/// `output` is the supply's own output number, as declared for each channel
/// in the daemon settings.
#[async_trait]
pub trait PowerSupply: Send + Sync {
    /// Set the output voltage in volts.
    async fn set_voltage(&self, output: u8, volts: f64) -> Result<(), InstrumentError>;

    /// Read the monitored output voltage in volts.
    async fn read_voltage(&self, output: u8) -> Result<f64, InstrumentError>;

    /// Read the monitored output current in amperes.
    async fn read_current(&self, output: u8) -> Result<f64, InstrumentError>;

    /// Hardware ramp-down and output off, at the supply's own ramp rate.
    async fn ramp_down(&self, output: u8) -> Result<(), InstrumentError>;
}
