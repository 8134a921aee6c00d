//! Custom error types for the daemon.
//!
//! This module defines the primary error type, `DaqError`, for the whole
//! supervisory core. Using the `thiserror` crate it gives one consistent way
//! to report failures, from I/O and configuration issues to instrument faults
//! and safety violations.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: semantic or parse problems in the daemon settings.
//! - **`Plan`**: a control-source edit that failed validation. The previous
//!   plan stays in force; these never leave the plan store.
//! - **`Instrument`**: a transient adapter fault (timeout, disconnect). These
//!   are retried with backoff by [`crate::error_recovery`].
//! - **`FatalController`**: a controller exhausted its fault budget. This is
//!   the only class that escalates to the supervisor.
//! - **`Io`** / **`Serialization`**: log storage and control-source access.
//!
//! By using `#[from]`, `DaqError` is created from the underlying error types
//! with the `?` operator.

use thiserror::Error;

use crate::instrument::InstrumentError;
use crate::plan::PlanError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failures of the supervisory core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The plan document was rejected
    #[error("Plan validation error: {0}")]
    Plan(#[from] PlanError),

    /// An adapter call failed
    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    /// A controller exhausted its fault budget
    #[error("Controller '{controller}' failed: {reason}")]
    FatalController {
        /// Event source name of the controller
        controller: String,
        /// Last fault before giving up
        reason: String,
    },

    /// Log or control-source file access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No channel with this id is configured
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    /// The operation needs a cargo feature this build lacks
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The supervisor task has already exited
    #[error("Supervisor is no longer running")]
    SupervisorGone,
}

impl DaqError {
    /// True for errors that must escalate to the supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaqError::FatalController { .. })
    }
}
