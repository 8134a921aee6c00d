//! Immutable records produced by the control loops.
//!
//! [`Measurement`]s go to the data log only. [`Event`]s go to the event log,
//! are mirrored to `tracing`, and at or above the configured threshold are
//! handed to the alert sink. [`EventReporter`] is the single entry point
//! every component uses to emit them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use tracing::{error, info, warn};

use crate::alert::AlertHandle;
use crate::logs::LogHandle;

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Normal lifecycle step
    Info,
    /// Something was refused or recovered
    Warning,
    /// A safety action was taken
    Error,
    /// A controller or the daemon gave up
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(text)
    }
}

/// Lifecycle or fault event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// How serious it is
    pub severity: Severity,
    /// Emitting component, e.g. `chamber`, `channel:ch1`, `plan`
    pub source: String,
    /// Human-readable description
    pub message: String,
    /// Structured details, `null` if none
    #[serde(default)]
    pub context: JsonValue,
}

impl Event {
    /// Event stamped with the current time and no context.
    pub fn new(severity: Severity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            source: source.into(),
            message: message.into(),
            context: JsonValue::Null,
        }
    }

    /// [`Severity::Info`] event.
    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, source, message)
    }

    /// [`Severity::Warning`] event.
    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, source, message)
    }

    /// [`Severity::Error`] event.
    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, source, message)
    }

    /// [`Severity::Fatal`] event.
    pub fn fatal(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, source, message)
    }

    /// Attach structured context (a JSON object by convention).
    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }
}

/// Why a measurement was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// Periodic reading at the scheduled bias
    Standby,
    /// One point of an IV-curve sweep
    IvCurve,
}

/// One bias reading of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// When the reading was taken
    pub timestamp: DateTime<Utc>,
    /// Channel the reading belongs to
    pub channel_id: String,
    /// Read-back voltage in volts
    pub voltage: f64,
    /// Read-back current in amperes
    pub current: f64,
    /// Chamber temperature at the time of the reading, if known
    pub temperature: Option<f64>,
    /// Chamber relative humidity in %RH, if the chamber reports it
    #[serde(default)]
    pub humidity: Option<f64>,
    /// Standby reading or IV-curve point
    pub kind: MeasurementKind,
}

/// Cloneable sink for events and measurements.
#[derive(Clone)]
pub struct EventReporter {
    log: LogHandle,
    alerts: AlertHandle,
    threshold: Severity,
}

impl EventReporter {
    /// Reporter alerting on events at or above `threshold`.
    pub fn new(log: LogHandle, alerts: AlertHandle, threshold: Severity) -> Self {
        Self {
            log,
            alerts,
            threshold,
        }
    }

    /// Record `event`, trace it, and alert on it if severe enough.
    pub fn emit(&self, event: Event) {
        match event.severity {
            Severity::Info => info!(source = %event.source, context = %event.context, "{}", event.message),
            Severity::Warning => warn!(source = %event.source, context = %event.context, "{}", event.message),
            Severity::Error | Severity::Fatal => {
                error!(source = %event.source, severity = %event.severity, context = %event.context, "{}", event.message)
            }
        }
        if event.severity >= self.threshold {
            self.alerts.dispatch(event.clone());
        }
        self.log.append_event(event);
    }

    /// Append a measurement to the data log.
    pub fn record(&self, measurement: Measurement) {
        self.log.append_measurement(measurement);
    }

    /// The underlying log handle.
    pub fn log(&self) -> &LogHandle {
        &self.log
    }
}
