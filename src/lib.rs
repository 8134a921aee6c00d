//! Core library of the standby test daemon.
//!
//! The daemon runs weeks-long standby tests of irradiated sensors: a climate
//! chamber walks through a temperature profile while high-voltage supplies
//! bias every sensor channel, and every measurement and event is recorded in
//! append-only, crash-consistent logs.
//!
//! # Architecture
//!
//! ```text
//! ControlSource ─► PlanStore ─watch<Arc<Plan>>─┬─► ChamberController ─► ClimateChamber
//!                                              │          │ watch<ChamberState>
//!                                              │          ▼
//!                                              └─► ChannelController ─► PowerSupply
//!                                                   (one per channel, gated by the interlock)
//!
//! all components ─► EventReporter ─┬─► LogWriter (events.log, measurements.log)
//!                                  └─► AlertDispatcher ─► AlertSink
//! ```
//!
//! The [`supervisor::Supervisor`] wires everything together from injected
//! instrument adapters and owns the process lifetime.

pub mod alert;
pub mod config;
pub mod controller;
pub mod error;
pub mod error_recovery;
pub mod events;
pub mod instrument;
pub mod interlock;
pub mod logs;
pub mod plan;
pub mod supervisor;

pub use config::Settings;
pub use error::{AppResult, DaqError};
pub use supervisor::{ExitStatus, Instruments, Supervisor, SupervisorHandle};
