//! Out-of-band alerting.
//!
//! The core only knows the [`AlertSink`] capability. Events are queued on a
//! bounded channel and delivered by a dispatcher task, so a slow or failing
//! transport never stalls a control loop: overflow and delivery failures
//! fall back to local logging.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::events::Event;

/// Upper bound for one delivery attempt.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability for notification transports (chat bots, mail, pagers).
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert.
    async fn notify(&self, event: &Event) -> anyhow::Result<()>;
}

/// Sink that only writes alerts to the local log.
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, event: &Event) -> anyhow::Result<()> {
        info!(
            severity = %event.severity,
            source = %event.source,
            "ALERT: {}",
            event.message
        );
        Ok(())
    }
}

/// Sink that keeps every alert in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingAlertSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingAlertSink {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts delivered so far.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for CollectingAlertSink {
    async fn notify(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Fire-and-forget handle to the alert dispatcher.
#[derive(Clone, Debug)]
pub struct AlertHandle {
    tx: Option<mpsc::Sender<Event>>,
}

impl AlertHandle {
    /// A handle that drops every alert (after logging it locally).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue `event` for delivery without waiting.
    pub fn dispatch(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(event) {
            let event = match err {
                mpsc::error::TrySendError::Full(event) => event,
                mpsc::error::TrySendError::Closed(event) => event,
            };
            warn!(
                severity = %event.severity,
                source = %event.source,
                "Alert not delivered (queue unavailable): {}",
                event.message
            );
        }
    }
}

/// Start the dispatcher task for `sink`.
///
/// The task ends once every [`AlertHandle`] is dropped and the queue drained.
pub fn spawn_dispatcher(sink: Arc<dyn AlertSink>, capacity: usize) -> (AlertHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match timeout(NOTIFY_TIMEOUT, sink.notify(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    ?err,
                    source = %event.source,
                    "Alert sink failed; alert kept in local log only: {}",
                    event.message
                ),
                Err(_) => warn!(
                    source = %event.source,
                    "Alert sink timed out; alert kept in local log only: {}",
                    event.message
                ),
            }
        }
    });
    (AlertHandle { tx: Some(tx) }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        async fn notify(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("transport down")
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_order() {
        let sink = CollectingAlertSink::new();
        let (handle, task) = spawn_dispatcher(Arc::new(sink.clone()), 8);
        handle.dispatch(Event::error("chamber", "door open"));
        handle.dispatch(Event::fatal("channel:ch1", "unreachable"));
        drop(handle);
        task.await.unwrap();

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "door open");
        assert_eq!(events[1].message, "unreachable");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failing_sink_does_not_propagate() {
        let (handle, task) = spawn_dispatcher(Arc::new(FailingSink), 1);
        for _ in 0..10 {
            // Overflow and sink errors are absorbed
            handle.dispatch(Event::error("chamber", "door open"));
        }
        drop(handle);
        task.await.unwrap();

        assert!(logs_contain("queue unavailable"));
        assert!(logs_contain("alert kept in local log only"));
    }

    #[test]
    fn test_disabled_handle_is_noop() {
        AlertHandle::disabled().dispatch(Event::fatal("x", "y"));
    }
}
