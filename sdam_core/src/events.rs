//! Events raised by a [`ServerMonitor`](crate::ServerMonitor).
//!
//! Every event is logged through `tracing` before it reaches a subscriber.
//! Subscribers are best effort: an error they return is logged and dropped,
//! and a panic inside one is caught.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::{ConnectionError, ConnectionId, Document, ServerDescription, ServerId};

#[derive(Clone, Debug)]
pub struct ServerHeartbeatStartedEvent {
    pub connection_id: ConnectionId,
    pub awaited: bool,
}

#[derive(Clone, Debug)]
pub struct ServerHeartbeatSucceededEvent {
    pub connection_id: ConnectionId,
    pub duration: Duration,
    pub awaited: bool,
    pub reply: Document,
}

#[derive(Clone, Debug)]
pub struct ServerHeartbeatFailedEvent {
    pub connection_id: ConnectionId,
    pub duration: Duration,
    pub awaited: bool,
    pub error: Arc<ConnectionError>,
}

/// The pair of descriptions on either side of a published change.
#[derive(Clone, Debug)]
pub struct ServerDescriptionChangedEvent {
    pub old_description: Arc<ServerDescription>,
    pub new_description: Arc<ServerDescription>,
}

/// A failure inside the monitor that is not an operational error.
#[derive(Clone, Debug)]
pub struct SdamInformationEvent {
    pub server_id: ServerId,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum SdamEvent {
    ServerMonitorStarted { server_id: ServerId },
    ServerMonitorDisposed { server_id: ServerId },
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
    ServerDescriptionChanged(ServerDescriptionChangedEvent),
    SdamInformation(SdamInformationEvent),
}

/// Receives every [`SdamEvent`] of a monitor.
pub trait EventSubscriber: Send + Sync {
    fn handle(&self, event: &SdamEvent) -> anyhow::Result<()>;
}

impl<F> EventSubscriber for F
where
    F: Fn(&SdamEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &SdamEvent) -> anyhow::Result<()> {
        self(event)
    }
}

pub type DescriptionChangedHandler =
    dyn Fn(&ServerDescriptionChangedEvent) -> anyhow::Result<()> + Send + Sync;

/// Logs events and forwards them to the optional subscriber.
#[derive(Clone, Default)]
pub(crate) struct EventPublisher {
    subscriber: Option<Arc<dyn EventSubscriber>>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("has_subscriber", &self.subscriber.is_some())
            .finish()
    }
}

impl EventPublisher {
    pub(crate) fn new(subscriber: Option<Arc<dyn EventSubscriber>>) -> Self {
        Self { subscriber }
    }

    pub(crate) fn publish(&self, event: SdamEvent) {
        log_event(&event);

        if let Some(subscriber) = &self.subscriber {
            invoke_guarded("event subscriber", || subscriber.handle(&event));
        }
    }
}

fn log_event(event: &SdamEvent) {
    match event {
        SdamEvent::ServerMonitorStarted { server_id } => {
            tracing::debug!(%server_id, "Server monitor started");
        }
        SdamEvent::ServerMonitorDisposed { server_id } => {
            tracing::debug!(%server_id, "Server monitor disposed");
        }
        SdamEvent::ServerHeartbeatStarted(e) => {
            tracing::debug!(connection_id = %e.connection_id, awaited = e.awaited, "Heartbeat started");
        }
        SdamEvent::ServerHeartbeatSucceeded(e) => {
            tracing::debug!(
                connection_id = %e.connection_id,
                duration_ms = e.duration.as_millis() as u64,
                awaited = e.awaited,
                "Heartbeat succeeded"
            );
        }
        SdamEvent::ServerHeartbeatFailed(e) => {
            tracing::warn!(
                connection_id = %e.connection_id,
                duration_ms = e.duration.as_millis() as u64,
                awaited = e.awaited,
                error = %e.error,
                "Heartbeat failed"
            );
        }
        SdamEvent::ServerDescriptionChanged(e) => {
            tracing::info!(
                server_id = %e.new_description.server_id(),
                old_type = ?e.old_description.server_type(),
                new_type = ?e.new_description.server_type(),
                new_state = ?e.new_description.state(),
                reason = e.new_description.reason_changed(),
                "Server description changed"
            );
        }
        SdamEvent::SdamInformation(e) => {
            tracing::error!(server_id = %e.server_id, "{}", e.message);
        }
    }
}

/// The handlers registered through [`ServerMonitor::subscribe`](crate::ServerMonitor::subscribe).
#[derive(Default)]
pub(crate) struct DescriptionChangedSubscribers {
    handlers: RwLock<Vec<Arc<DescriptionChangedHandler>>>,
}

impl DescriptionChangedSubscribers {
    pub(crate) fn subscribe(&self, handler: Arc<DescriptionChangedHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Calls every handler in registration order. The lock is not held while
    /// handlers run, so a handler may subscribe another.
    pub(crate) fn notify(&self, event: &ServerDescriptionChangedEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for handler in handlers {
            invoke_guarded("description changed handler", || handler(event));
        }
    }
}

fn invoke_guarded(kind: &str, f: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Ignoring error returned by {}: {:?}", kind, e),
        Err(_) => tracing::warn!("Ignoring panic raised by {}", kind),
    }
}
