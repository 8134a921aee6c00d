//! Control sources the plan store reads from.

use async_trait::async_trait;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use super::{PlanDocument, PlanError};

/// Name of the plan file inside the control directory.
pub const PLAN_FILE: &str = "plan.toml";

/// Stream of "the source may have changed" notifications.
///
/// Holds whatever keeps the notifications alive (e.g. a file watcher).
pub struct ChangeFeed {
    rx: mpsc::Receiver<()>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl ChangeFeed {
    /// Feed of the notifications sent on `rx`.
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx, _guard: None }
    }

    #[cfg_attr(not(feature = "hot_reload"), allow(dead_code))]
    fn with_guard(rx: mpsc::Receiver<()>, guard: Box<dyn Any + Send>) -> Self {
        Self {
            rx,
            _guard: Some(guard),
        }
    }

    /// Wait for the next notification. `None` once the feed is closed.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Hot-reloadable origin of the plan document.
#[async_trait]
pub trait ControlSource: Send + Sync {
    /// Human-readable location, used in events.
    fn describe(&self) -> String;

    /// Read and parse the current document.
    async fn read(&self) -> Result<PlanDocument, PlanError>;

    /// Push notifications of changes, if the source supports them.
    ///
    /// Sources without notifications are polled.
    fn subscribe(&self) -> Option<ChangeFeed> {
        None
    }
}

/// `plan.toml` inside a control directory.
#[derive(Debug, Clone)]
pub struct FileControlSource {
    path: PathBuf,
}

impl FileControlSource {
    /// Source reading `plan.toml` in `control_dir`.
    pub fn new(control_dir: impl AsRef<Path>) -> Self {
        Self {
            path: control_dir.as_ref().join(PLAN_FILE),
        }
    }

    /// Full path of the plan file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ControlSource for FileControlSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn read(&self) -> Result<PlanDocument, PlanError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PlanError::Source(format!("{}: {e}", self.path.display())))?;
        PlanDocument::from_toml_str(&text)
    }

    #[cfg(feature = "hot_reload")]
    fn subscribe(&self) -> Option<ChangeFeed> {
        use notify::{RecursiveMode, Watcher};

        // Watch the directory: editors often replace the file instead of
        // writing it in place.
        let dir = self.path.parent()?.to_path_buf();
        let file_name = self.path.file_name()?.to_os_string();
        let (tx, rx) = mpsc::channel(1);

        let handler = move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    // A full queue already holds a pending wake-up
                    let _ = tx.try_send(());
                }
            }
            Err(err) => tracing::warn!(?err, "Control directory watcher error"),
        };

        let mut watcher = match notify::recommended_watcher(handler) {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::warn!(?err, "File watcher unavailable, polling only");
                return None;
            }
        };
        if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            tracing::warn!(?err, dir = %dir.display(), "Cannot watch control directory, polling only");
            return None;
        }
        Some(ChangeFeed::with_guard(rx, Box::new(watcher)))
    }
}

/// In-memory source whose document is replaced programmatically.
///
/// Every [`set`](Self::set) (including an identical document) notifies
/// subscribers, like an editor saving an unchanged file.
#[derive(Clone)]
pub struct MemoryControlSource {
    document: Arc<RwLock<Result<PlanDocument, PlanError>>>,
    subscribers: Arc<std::sync::Mutex<Vec<mpsc::Sender<()>>>>,
}

impl MemoryControlSource {
    /// Source holding `document`.
    pub fn new(document: PlanDocument) -> Self {
        Self {
            document: Arc::new(RwLock::new(Ok(document))),
            subscribers: Arc::default(),
        }
    }

    /// Replace the document.
    pub async fn set(&self, document: PlanDocument) {
        *self.document.write().await = Ok(document);
        self.notify();
    }

    /// Replace the document with TOML text, which may be malformed.
    pub async fn set_toml(&self, text: &str) {
        *self.document.write().await = PlanDocument::from_toml_str(text);
        self.notify();
    }

    fn notify(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                let _ = tx.try_send(());
            }
        }
    }
}

#[async_trait]
impl ControlSource for MemoryControlSource {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn read(&self) -> Result<PlanDocument, PlanError> {
        self.document.read().await.clone()
    }

    fn subscribe(&self) -> Option<ChangeFeed> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().ok()?.push(tx);
        Some(ChangeFeed::new(rx))
    }
}
