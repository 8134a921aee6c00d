//! Event and data logs.
//!
//! Both logs are append-only [`RecordLog`] files written by one
//! [`LogWriter`] task. Readers (plotting, reporting) use [`replay`] or the
//! CSV export; there is no update or delete operation.

pub mod export;
pub mod record_log;
pub mod writer;

pub use export::export_measurements_csv;
pub use record_log::{replay, RecordLog, Recovery};
pub use writer::{
    LogHandle, LogPaths, LogRecovery, LogWriter, DATA_LOG_FILE, EVENT_LOG_FILE, LOG_QUEUE,
};
