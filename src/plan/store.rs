//! Versioned plan snapshots with hot reload.

use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

use super::{ChangeFeed, ControlSource, Plan, PlanError};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::events::{Event, EventReporter};

/// Directory under the log directory holding copies of accepted plans.
pub const HISTORY_DIR: &str = "configuration_history";

/// Wait after a change notification so a half-saved file is not read.
const SETTLE: Duration = Duration::from_millis(250);

/// Result of one [`PlanStore::reload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Same content as the current plan; nothing published
    Unchanged,
    /// A new plan with this version was published
    Updated(u64),
    /// The edit failed to read or validate; the current plan stays
    Rejected,
}

/// Owner of the current plan.
///
/// Readers get `Arc<Plan>` snapshots from a `watch` channel and never see a
/// partially applied edit.
pub struct PlanStore {
    source: Arc<dyn ControlSource>,
    settings: Arc<Settings>,
    reporter: EventReporter,
    history_dir: PathBuf,
    poll_interval: Duration,
    tx: watch::Sender<Arc<Plan>>,
    last_rejection: Option<String>,
}

impl PlanStore {
    /// Load the initial plan. Fails if it cannot be read or validated.
    pub async fn open(
        source: Arc<dyn ControlSource>,
        settings: Arc<Settings>,
        reporter: EventReporter,
    ) -> AppResult<Self> {
        let document = source.read().await?;
        let plan = Arc::new(Plan::from_document(document, &settings, 1)?);
        let history_dir = settings.daemon.log_dir.join(HISTORY_DIR);

        let store = Self {
            source,
            poll_interval: settings.daemon.plan_poll_interval,
            settings,
            reporter,
            history_dir,
            tx: watch::channel(plan.clone()).0,
            last_rejection: None,
        };
        store.archive(&plan).await;
        store.reporter.emit(
            Event::info(
                "plan",
                format!(
                    "Loaded plan version {} from {}",
                    plan.version,
                    store.source.describe()
                ),
            )
            .with_context(json!({ "version": plan.version, "fingerprint": plan.fingerprint })),
        );
        Ok(store)
    }

    /// The latest validated plan.
    pub fn current(&self) -> Arc<Plan> {
        self.tx.borrow().clone()
    }

    /// Subscribe to newly validated plans.
    pub fn watch(&self) -> watch::Receiver<Arc<Plan>> {
        self.tx.subscribe()
    }

    /// Re-read the control source and publish it if it changed and is valid.
    pub async fn reload(&mut self) -> ReloadOutcome {
        let current = self.current();
        let document = match self.source.read().await {
            Ok(document) => document,
            Err(err) => return self.reject(&current, err),
        };
        let fingerprint = match document.fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(err) => return self.reject(&current, err),
        };
        if fingerprint == current.fingerprint {
            self.last_rejection = None;
            debug!(version = current.version, "Control source unchanged");
            return ReloadOutcome::Unchanged;
        }

        let plan = match Plan::from_document(document, &self.settings, current.version + 1) {
            Ok(plan) => Arc::new(plan),
            Err(err) => return self.reject(&current, err),
        };
        self.last_rejection = None;
        self.archive(&plan).await;
        self.reporter.emit(
            Event::info(
                "plan",
                format!(
                    "Plan version {} supersedes version {}",
                    plan.version, current.version
                ),
            )
            .with_context(json!({
                "previous_version": current.version,
                "previous_fingerprint": current.fingerprint,
                "version": plan.version,
                "fingerprint": plan.fingerprint,
            })),
        );
        let version = plan.version;
        self.tx.send_replace(plan);
        ReloadOutcome::Updated(version)
    }

    /// Reload on change notifications and on every poll interval until
    /// `shutdown` turns true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut feed = self.source.subscribe();
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        info!(
            source = %self.source.describe(),
            notifications = feed.is_some(),
            "Plan store watching control source"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = poll.tick() => {}
                Some(()) = next_change(&mut feed) => {
                    sleep(SETTLE).await;
                }
            }
            self.reload().await;
        }
        debug!("Plan store stopped");
    }

    fn reject(&mut self, current: &Plan, err: PlanError) -> ReloadOutcome {
        let reason = err.to_string();
        // A broken file is seen on every poll; report each distinct problem once
        if self.last_rejection.as_deref() != Some(reason.as_str()) {
            self.reporter.emit(
                Event::error(
                    "plan",
                    format!(
                        "Rejected edit of {}: {reason}; keeping plan version {}",
                        self.source.describe(),
                        current.version
                    ),
                )
                .with_context(json!({ "version": current.version, "reason": reason })),
            );
            self.last_rejection = Some(reason);
        }
        ReloadOutcome::Rejected
    }

    /// Keep a copy of an accepted plan for audit.
    async fn archive(&self, plan: &Plan) {
        let name = format!(
            "{}_v{}_plan.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3f"),
            plan.version
        );
        let path = self.history_dir.join(name);
        let result = async {
            tokio::fs::create_dir_all(&self.history_dir).await?;
            let text = serde_json::to_vec_pretty(plan)?;
            tokio::fs::write(&path, text).await?;
            Ok::<(), DaqError>(())
        }
        .await;
        if let Err(err) = result {
            self.reporter.emit(Event::warning(
                "plan",
                format!("Could not archive plan version {}: {err}", plan.version),
            ));
        }
    }
}

async fn next_change(feed: &mut Option<ChangeFeed>) -> Option<()> {
    match feed {
        Some(feed) => feed.changed().await,
        None => std::future::pending().await,
    }
}
