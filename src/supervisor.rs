//! Process-level supervision of the control loops.
//!
//! The [`Supervisor`] is handed ready-made instrument adapters and an alert
//! sink, starts the log writer, the alert dispatcher, the plan store and one
//! task per controller, and then watches them:
//!
//! - plan changes are forwarded as re-arm commands when a channel's `rearm`
//!   counter was incremented (schedule edits need no forwarding, the
//!   controllers read the latest plan every cycle);
//! - a controller that exhausts its fault budget is reported as `fatal` and
//!   the configured [`TripPolicy`] decides whether the rest keeps running;
//! - on shutdown every channel ramps to 0 V, the chamber is commanded to
//!   ambient, and the logs are flushed before [`SupervisorHandle::wait`]
//!   returns.

use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{spawn_dispatcher, AlertSink};
use crate::config::{ConfigError, Settings, TripPolicy};
use crate::controller::{
    ChamberController, ChamberState, ChannelCommand, ChannelController, ChannelState,
};
use crate::error::{AppResult, DaqError};
use crate::events::{Event, EventReporter};
use crate::instrument::{ClimateChamber, PowerSupply};
use crate::interlock::{evaluate, InterlockDecision};
use crate::logs::{LogRecovery, LogWriter};
use crate::plan::{ControlSource, Plan, PlanStore};

const SOURCE: &str = "supervisor";

/// Upper bound for delivering queued alerts on exit.
const ALERT_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Already-constructed instrument adapters.
#[derive(Clone)]
pub struct Instruments {
    /// The climate chamber
    pub chamber: Arc<dyn ClimateChamber>,
    /// Power supplies by the name channels refer to in `supply`
    pub supplies: HashMap<String, Arc<dyn PowerSupply>>,
}

/// How the daemon ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Every controller stopped on request
    Clean,
    /// At least one controller failed fatally
    Fault,
}

impl ExitStatus {
    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Fault => 2,
        }
    }
}

/// Builds and starts the daemon's tasks from injected instruments.
pub struct Supervisor {
    settings: Arc<Settings>,
    instruments: Instruments,
    alert_sink: Arc<dyn AlertSink>,
}

impl Supervisor {
    /// Bundle settings, instrument adapters and the alert transport.
    pub fn new(settings: Settings, instruments: Instruments, alert_sink: Arc<dyn AlertSink>) -> Self {
        Self {
            settings: Arc::new(settings),
            instruments,
            alert_sink,
        }
    }

    /// Start every task. Fails if the logs cannot be opened, a channel has no
    /// supply, or the initial plan is invalid.
    pub async fn start(self, source: Arc<dyn ControlSource>) -> AppResult<SupervisorHandle> {
        let settings = self.settings;
        let mut supplies = Vec::with_capacity(settings.channels.len());
        for channel in &settings.channels {
            let supply = self.instruments.supplies.get(&channel.supply).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "channel '{}' refers to unknown supply '{}'",
                    channel.id, channel.supply
                ))
            })?;
            supplies.push((channel.clone(), Arc::clone(supply)));
        }

        let (writer, recovery) =
            LogWriter::open(&settings.daemon.log_dir, settings.daemon.sync_writes)?;
        let (log, log_task) = writer.spawn();
        let (alerts, alert_task) =
            spawn_dispatcher(Arc::clone(&self.alert_sink), settings.daemon.alert_queue);
        let reporter = EventReporter::new(log, alerts, settings.daemon.alert_threshold);
        report_recovery(&reporter, recovery);

        let store = match PlanStore::open(source, Arc::clone(&settings), reporter.clone()).await {
            Ok(store) => store,
            Err(err) => {
                reporter.emit(Event::fatal(SOURCE, format!("Startup failed: {err}")));
                reporter.log().flush().await;
                return Err(err);
            }
        };
        let plan = store.watch();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        // Released by the monitor once every channel is at 0 V
        let (chamber_shutdown, chamber_shutdown_rx) = watch::channel(false);

        let (chamber, chamber_rx) = ChamberController::new(
            Arc::clone(&self.instruments.chamber),
            &settings,
            plan.clone(),
            reporter.clone(),
        );
        let chamber_task = tokio::spawn(chamber.run(chamber_shutdown_rx));

        let mut tasks = JoinSet::new();

        let mut channels = BTreeMap::new();
        let mut channel_commands = BTreeMap::new();
        for (config, supply) in supplies {
            let id = config.id.clone();
            let (controller, state_rx, command_tx) = ChannelController::new(
                config,
                supply,
                &settings,
                plan.clone(),
                chamber_rx.clone(),
                reporter.clone(),
            );
            let rx = shutdown_rx.clone();
            let name = format!("channel:{id}");
            tasks.spawn(async move { (name, controller.run(rx).await) });
            channels.insert(id.clone(), state_rx);
            channel_commands.insert(id, command_tx);
        }

        let store_task = tokio::spawn(store.run(shutdown_rx.clone()));
        let run_id = Uuid::new_v4();
        info!(%run_id, "Supervisor started");
        reporter.emit(
            Event::info(
                SOURCE,
                format!("Started chamber and {} channel controllers", channels.len()),
            )
            .with_context(json!({
                "run_id": run_id,
                "plan_version": plan.borrow().version,
                "channels": channels.keys().collect::<Vec<_>>(),
                "trip_policy": settings.daemon.trip_policy,
            })),
        );

        let monitor = Monitor {
            policy: settings.daemon.trip_policy,
            reporter,
            plan: plan.clone(),
            rearm_counters: channel_commands
                .keys()
                .map(|id| (id.clone(), plan.borrow().rearm_counter(id)))
                .collect(),
            channel_commands: channel_commands.clone(),
            shutdown: Arc::clone(&shutdown_tx),
            shutdown_rx,
            chamber_shutdown,
            faulted: false,
        };
        let task = tokio::spawn(monitor.run(
            Controllers {
                channels: tasks,
                chamber: chamber_task,
            },
            store_task,
            log_task,
            alert_task,
        ));

        Ok(SupervisorHandle {
            shutdown: shutdown_tx,
            task,
            plan,
            chamber: chamber_rx,
            channels,
            channel_commands,
        })
    }
}

fn report_recovery(reporter: &EventReporter, recovery: LogRecovery) {
    for (name, r) in [("event", recovery.events), ("data", recovery.measurements)] {
        if r.discarded_bytes > 0 {
            reporter.emit(
                Event::warning(
                    SOURCE,
                    format!(
                        "Discarded {} bytes of torn {name} log tail, {} records kept",
                        r.discarded_bytes, r.valid_records
                    ),
                )
                .with_context(json!({
                    "log": name,
                    "discarded_bytes": r.discarded_bytes,
                    "valid_records": r.valid_records,
                })),
            );
        }
    }
}

/// Running controller tasks.
struct Controllers {
    channels: JoinSet<(String, AppResult<()>)>,
    chamber: JoinHandle<AppResult<()>>,
}

/// Supervision loop state, owned by its task.
struct Monitor {
    policy: TripPolicy,
    reporter: EventReporter,
    plan: watch::Receiver<Arc<Plan>>,
    rearm_counters: BTreeMap<String, u64>,
    channel_commands: BTreeMap<String, mpsc::Sender<ChannelCommand>>,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    chamber_shutdown: watch::Sender<bool>,
    faulted: bool,
}

impl Monitor {
    async fn run(
        mut self,
        mut controllers: Controllers,
        store_task: JoinHandle<()>,
        log_task: JoinHandle<()>,
        alert_task: JoinHandle<()>,
    ) -> ExitStatus {
        let mut plan_open = true;
        let mut announced = false;
        let mut channels_done = controllers.channels.is_empty();
        let mut chamber_done = false;
        loop {
            let stopping = *self.shutdown_rx.borrow();
            if stopping && !announced {
                announced = true;
                self.reporter.emit(Event::info(
                    SOURCE,
                    "Shutdown requested: ramping channels to 0 V, then chamber to ambient",
                ));
            }
            if stopping && channels_done && !*self.chamber_shutdown.borrow() {
                debug!("Every channel stopped, releasing the chamber");
                self.chamber_shutdown.send_replace(true);
            }
            if channels_done && chamber_done {
                break;
            }
            tokio::select! {
                joined = controllers.channels.join_next(), if !channels_done => match joined {
                    Some(Ok((name, result))) => self.controller_exited(name, result),
                    Some(Err(err)) => self.task_failed("channel task".to_string(), err),
                    None => channels_done = true,
                },
                joined = &mut controllers.chamber, if !chamber_done => {
                    chamber_done = true;
                    match joined {
                        Ok(result) => self.controller_exited("chamber".to_string(), result),
                        Err(err) => self.task_failed("chamber".to_string(), err),
                    }
                }
                changed = self.plan.changed(), if plan_open => {
                    if changed.is_err() {
                        plan_open = false;
                    } else {
                        self.forward_rearms();
                    }
                }
                _ = self.shutdown_rx.changed(), if !announced => {}
            }
        }

        // Every controller has stopped; stop the plan store too
        self.shutdown.send_replace(true);
        if let Err(err) = store_task.await {
            error!(?err, "Plan store task failed");
        }

        let status = if self.faulted {
            ExitStatus::Fault
        } else {
            ExitStatus::Clean
        };
        self.reporter.emit(Event::info(
            SOURCE,
            format!("Supervisor stopped ({status:?})"),
        ));
        self.reporter.log().flush().await;

        // Dropping the last handles lets the writer and dispatcher finish
        drop(self);
        if let Err(err) = log_task.await {
            error!(?err, "Log writer task failed");
        }
        if timeout(ALERT_DRAIN_TIMEOUT, alert_task).await.is_err() {
            warn!("Alert queue not drained before exit");
        }
        info!(?status, "Supervisor exited");
        status
    }

    fn task_failed(&mut self, name: String, err: tokio::task::JoinError) {
        let failure = DaqError::FatalController {
            controller: name.clone(),
            reason: err.to_string(),
        };
        self.controller_exited(name, Err(failure));
    }

    fn controller_exited(&mut self, name: String, result: AppResult<()>) {
        let err = match result {
            Ok(()) => {
                debug!(controller = %name, "Controller stopped");
                return;
            }
            Err(err) => err,
        };
        self.faulted = true;
        self.reporter.emit(
            Event::fatal(&name, format!("Controller stopped: {err}"))
                .with_context(json!({ "trip_policy": self.policy })),
        );
        match self.policy {
            TripPolicy::Isolate => {
                warn!(controller = %name, "Controller isolated, others keep running");
            }
            TripPolicy::ShutdownAll => {
                self.reporter.emit(Event::error(
                    SOURCE,
                    format!("Initiating full shutdown after failure of {name}"),
                ));
                self.shutdown.send_replace(true);
            }
        }
    }

    fn forward_rearms(&mut self) {
        let plan = self.plan.borrow_and_update().clone();
        debug!(version = plan.version, "New plan observed");
        for (id, last) in self.rearm_counters.iter_mut() {
            let counter = plan.rearm_counter(id);
            if counter > *last {
                if let Some(tx) = self.channel_commands.get(id) {
                    let command = ChannelCommand::Rearm {
                        requested_by: format!("plan version {}", plan.version),
                    };
                    if tx.try_send(command).is_err() {
                        warn!(channel = %id, "Re-arm from plan not delivered");
                    }
                }
            }
            *last = counter;
        }
    }
}

/// Control surface of a running supervisor.
pub struct SupervisorHandle {
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<ExitStatus>,
    plan: watch::Receiver<Arc<Plan>>,
    chamber: watch::Receiver<ChamberState>,
    channels: BTreeMap<String, watch::Receiver<ChannelState>>,
    channel_commands: BTreeMap<String, mpsc::Sender<ChannelCommand>>,
}

impl SupervisorHandle {
    /// Operator clearance for a tripped channel.
    pub async fn rearm(&self, channel: &str) -> AppResult<()> {
        let tx = self
            .channel_commands
            .get(channel)
            .ok_or_else(|| DaqError::UnknownChannel(channel.to_string()))?;
        tx.send(ChannelCommand::Rearm {
            requested_by: "operator".to_string(),
        })
        .await
        .map_err(|_| DaqError::SupervisorGone)
    }

    /// Request an orderly shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until every task has stopped and the logs are flushed.
    ///
    /// May be cancelled and called again, but not after it has returned.
    pub async fn wait(&mut self) -> ExitStatus {
        match (&mut self.task).await {
            Ok(status) => status,
            Err(err) => {
                error!(?err, "Supervisor task failed");
                ExitStatus::Fault
            }
        }
    }

    /// The plan currently in force.
    pub fn plan(&self) -> Arc<Plan> {
        self.plan.borrow().clone()
    }

    /// Latest published chamber state.
    pub fn chamber_state(&self) -> ChamberState {
        self.chamber.borrow().clone()
    }

    /// Latest published state of `channel`.
    pub fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.channels.get(channel).map(|rx| rx.borrow().clone())
    }

    /// Latest published state of every channel, ordered by id.
    pub fn channel_states(&self) -> Vec<ChannelState> {
        self.channels.values().map(|rx| rx.borrow().clone()).collect()
    }

    /// Current interlock decision for every channel.
    pub fn interlock(&self) -> InterlockDecision {
        evaluate(&self.chamber_state(), &self.channel_states())
    }
}
