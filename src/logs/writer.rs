//! Single-writer task owning both record logs.
//!
//! Controllers never touch the files. They send records through a
//! [`LogHandle`]; the writer task drains the queue in batches and applies
//! each batch on the blocking pool, one record at a time, so concurrent
//! appenders can never interleave partial frames.
//!
//! The queue is bounded. When the disk stalls long enough to fill it, new
//! records are dropped with a warning instead of growing memory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::record_log::{RecordLog, Recovery};
use crate::error::AppResult;
use crate::events::{Event, Measurement};

/// File name of the event log inside the log directory.
pub const EVENT_LOG_FILE: &str = "events.log";
/// File name of the data log inside the log directory.
pub const DATA_LOG_FILE: &str = "measurements.log";

/// Records queued for the writer before new ones are dropped.
pub const LOG_QUEUE: usize = 4096;

enum LogCommand {
    Event(Event),
    Measurement(Measurement),
    Flush(oneshot::Sender<()>),
}

/// Cloneable, non-blocking handle to the log writer.
#[derive(Clone, Debug)]
pub struct LogHandle {
    tx: mpsc::Sender<LogCommand>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for LogCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogCommand::Event(_) => f.write_str("LogCommand::Event"),
            LogCommand::Measurement(_) => f.write_str("LogCommand::Measurement"),
            LogCommand::Flush(_) => f.write_str("LogCommand::Flush"),
        }
    }
}

impl LogHandle {
    /// Queue `event` for the event log.
    pub fn append_event(&self, event: Event) {
        self.enqueue(LogCommand::Event(event), "event");
    }

    /// Queue `measurement` for the data log.
    pub fn append_measurement(&self, measurement: Measurement) {
        self.enqueue(LogCommand::Measurement(measurement), "measurement");
    }

    /// Records dropped so far because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, command: LogCommand, what: &str) {
        let closed = match self.tx.try_send(command) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        };
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if closed {
            error!(dropped, "Log writer is gone; {what} dropped");
        } else {
            warn!(dropped, capacity = self.tx.max_capacity(), "Log queue full; {what} dropped");
        }
    }

    /// Wait until everything sent before this call is on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Paths of the two logs under one directory.
#[derive(Debug, Clone)]
pub struct LogPaths {
    /// The event log
    pub events: PathBuf,
    /// The data log
    pub measurements: PathBuf,
}

impl LogPaths {
    /// The standard file names under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            events: dir.join(EVENT_LOG_FILE),
            measurements: dir.join(DATA_LOG_FILE),
        }
    }
}

/// Owner of the event and data logs.
pub struct LogWriter {
    events: RecordLog<Event>,
    measurements: RecordLog<Measurement>,
}

/// Recovery results of both logs, reported once the event log is writable.
#[derive(Debug, Clone, Copy)]
pub struct LogRecovery {
    /// Recovery of the event log
    pub events: Recovery,
    /// Recovery of the data log
    pub measurements: Recovery,
}

impl LogWriter {
    /// Open both logs in `dir`, recovering from any torn tails.
    pub fn open(dir: &Path, sync: bool) -> AppResult<(Self, LogRecovery)> {
        let paths = LogPaths::in_dir(dir);
        let (events, events_recovery) = RecordLog::open(&paths.events, sync)?;
        let (measurements, data_recovery) = RecordLog::open(&paths.measurements, sync)?;
        info!(
            dir = %dir.display(),
            events = events.len(),
            measurements = measurements.len(),
            "Opened logs"
        );
        Ok((
            Self {
                events,
                measurements,
            },
            LogRecovery {
                events: events_recovery,
                measurements: data_recovery,
            },
        ))
    }

    /// Start the writer task with a queue of [`LOG_QUEUE`] records.
    ///
    /// The task ends once every [`LogHandle`] has been dropped.
    pub fn spawn(self) -> (LogHandle, JoinHandle<()>) {
        self.spawn_with_capacity(LOG_QUEUE)
    }

    /// Start the writer task with a queue of `capacity` records.
    pub fn spawn_with_capacity(self, capacity: usize) -> (LogHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        let handle = LogHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (handle, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<LogCommand>) {
        let mut writer = self;
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(command) = rx.try_recv() {
                batch.push(command);
            }
            writer = match tokio::task::spawn_blocking(move || {
                writer.apply(batch);
                writer
            })
            .await
            {
                Ok(writer) => writer,
                Err(err) => {
                    error!(?err, "Log writer thread failed; logging stopped");
                    return;
                }
            };
        }
        if let Err(err) = writer.events.flush().and(writer.measurements.flush()) {
            error!(?err, "Failed to flush logs on close");
        }
        info!("Log writer stopped");
    }

    fn apply(&mut self, batch: Vec<LogCommand>) {
        for command in batch {
            match command {
                LogCommand::Event(event) => {
                    if let Err(err) = self.events.append(&event) {
                        error!(?err, "Failed to append to event log");
                    }
                }
                LogCommand::Measurement(measurement) => {
                    if let Err(err) = self.measurements.append(&measurement) {
                        error!(?err, "Failed to append to data log");
                    }
                }
                LogCommand::Flush(done) => {
                    if let Err(err) = self.events.flush().and(self.measurements.flush()) {
                        error!(?err, "Failed to flush logs");
                    }
                    let _ = done.send(());
                }
            }
        }
    }
}
