use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex,
};

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    events::{
        DescriptionChangedSubscribers, EventPublisher, EventSubscriber, SdamEvent,
        ServerDescriptionChangedEvent,
    },
    ConnectionFactory, RoundTripTimeMonitor, ServerDescription, ServerId, ServerMonitorError,
    ServerMonitorSettings, ServerMonitorState,
};

use super::{run_server_monitor, server_monitor_actor::ServerMonitorInner, ServerMonitorShared};

/**
Monitors a single server.

[`start`](ServerMonitor::start) spawns the heartbeat loop and the
[`RoundTripTimeMonitor`]. From then on [`description`](ServerMonitor::description)
always returns the latest snapshot, and handlers registered with
[`subscribe`](ServerMonitor::subscribe) are called, in order and one at a
time, whenever the server's state changes in a way that matters for server
selection. Network and command failures never surface as errors from this
type; they show up as a description with a heartbeat exception.

Dropping the monitor disposes it. Use [`shutdown`](ServerMonitor::shutdown)
to also wait for the background tasks to finish; no description change is
delivered after it returns.
*/
pub struct ServerMonitor {
    shared: Arc<ServerMonitorShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMonitor")
            .field("server_id", &self.shared.server_id)
            .field("state", &self.state())
            .field("settings", &self.shared.settings)
            .finish()
    }
}

impl ServerMonitor {
    pub fn new(
        server_id: ServerId,
        connection_factory: Arc<dyn ConnectionFactory>,
        settings: ServerMonitorSettings,
    ) -> Self {
        let round_trip_time_monitor = Arc::new(RoundTripTimeMonitor::new(
            connection_factory.clone(),
            server_id.clone(),
            server_id.end_point.clone(),
            settings.heartbeat_interval(),
        ));
        Self::with_components(server_id, connection_factory, settings, round_trip_time_monitor, None)
    }

    /// Creates a monitor around an existing round trip time monitor, with an
    /// optional subscriber for every [`SdamEvent`].
    pub fn with_components(
        server_id: ServerId,
        connection_factory: Arc<dyn ConnectionFactory>,
        settings: ServerMonitorSettings,
        round_trip_time_monitor: Arc<RoundTripTimeMonitor>,
        event_subscriber: Option<Arc<dyn EventSubscriber>>,
    ) -> Self {
        let base_description = ServerDescription::initial(server_id.clone(), settings.heartbeat_interval());
        let monitor_cancellation = CancellationToken::new();

        let shared = ServerMonitorShared {
            server_id,
            connection_factory,
            settings,
            current_description: ArcSwap::from_pointee(base_description.clone()),
            base_description,
            round_trip_time_monitor,
            subscribers: DescriptionChangedSubscribers::default(),
            events: EventPublisher::new(event_subscriber),
            state: AtomicU8::new(ServerMonitorState::Initial as u8),
            inner: Mutex::new(ServerMonitorInner {
                connection: None,
                more_to_come: false,
                heartbeat_delay: None,
                heartbeat_cancellation: monitor_cancellation.child_token(),
            }),
            monitor_cancellation,
        };

        Self {
            shared: Arc::new(shared),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.shared.server_id
    }

    pub fn settings(&self) -> &ServerMonitorSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> ServerMonitorState {
        ServerMonitorState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// The latest description. Never blocks.
    pub fn description(&self) -> Arc<ServerDescription> {
        self.shared.current_description.load_full()
    }

    pub fn round_trip_time_monitor(&self) -> &Arc<RoundTripTimeMonitor> {
        &self.shared.round_trip_time_monitor
    }

    /// Registers a handler for description changes. Errors returned by the
    /// handler are logged and ignored; so are panics.
    ///
    /// Handlers only see changes that matter for server selection. A failed
    /// first heartbeat leaves the server unknown and disconnected, the same as
    /// the initial description, so it updates [`description`](ServerMonitor::description)
    /// (with the heartbeat exception) without calling any handler.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ServerDescriptionChangedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(Arc::new(handler));
        tracing::trace!(
            server_id = %self.shared.server_id,
            "{} description changed handler(s) registered",
            self.shared.subscribers.len()
        );
    }

    /// Starts monitoring. Must be called from within a tokio runtime.
    ///
    /// Starting an open monitor does nothing; starting a disposed one fails.
    #[instrument(level = "debug", name = "ServerMonitor - Start", skip(self), fields(server_id = %self.shared.server_id))]
    pub fn start(&self) -> Result<(), ServerMonitorError> {
        match self.shared.state.compare_exchange(
            ServerMonitorState::Initial as u8,
            ServerMonitorState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(current) => {
                return match ServerMonitorState::from_u8(current) {
                    ServerMonitorState::Disposed => Err(ServerMonitorError::Disposed),
                    _ => Ok(()),
                };
            }
        }

        let heartbeat = tokio::spawn(run_server_monitor(self.shared.clone()));
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(heartbeat);
        self.shared.round_trip_time_monitor.start();

        self.shared.events.publish(SdamEvent::ServerMonitorStarted {
            server_id: self.shared.server_id.clone(),
        });
        Ok(())
    }

    /// Shortens the current wait between heartbeats, subject to the minimum
    /// heartbeat interval. Does nothing if the loop is not waiting yet.
    pub fn request_heartbeat(&self) -> Result<(), ServerMonitorError> {
        self.ensure_open("request_heartbeat")?;

        let heartbeat_delay = self.shared.lock_inner().heartbeat_delay.clone();
        if let Some(heartbeat_delay) = heartbeat_delay {
            heartbeat_delay.request_early();
        }
        Ok(())
    }

    /// Same as [`request_heartbeat`](ServerMonitor::request_heartbeat).
    pub fn request_immediate_check(&self) -> Result<(), ServerMonitorError> {
        self.request_heartbeat()
    }

    /// Abandons the in-flight check and closes the monitoring connection.
    /// The loop keeps running and opens a new connection on its next cycle.
    #[instrument(level = "debug", name = "ServerMonitor - Cancel Current Check", skip(self), fields(server_id = %self.shared.server_id))]
    pub fn cancel_current_check(&self) -> Result<(), ServerMonitorError> {
        self.ensure_open("cancel_current_check")?;

        let connection = {
            let mut inner = self.shared.lock_inner();
            inner.heartbeat_cancellation.cancel();
            inner.heartbeat_cancellation = self.shared.monitor_cancellation.child_token();
            inner.more_to_come = false;
            inner.connection.take()
        };

        if let Some(connection) = connection {
            tracing::debug!(connection_id = %connection.connection_id(), "Disposing the monitoring connection");
            connection.dispose();
        }
        Ok(())
    }

    /// Stops monitoring and releases the connections. Safe to call more than
    /// once and while a heartbeat is in flight.
    #[instrument(level = "debug", name = "ServerMonitor - Dispose", skip(self), fields(server_id = %self.shared.server_id))]
    pub fn dispose(&self) {
        let previous = self
            .shared
            .state
            .swap(ServerMonitorState::Disposed as u8, Ordering::AcqRel);
        if ServerMonitorState::from_u8(previous) == ServerMonitorState::Disposed {
            return;
        }

        self.shared.monitor_cancellation.cancel();

        let (connection, heartbeat_delay) = {
            let mut inner = self.shared.lock_inner();
            inner.more_to_come = false;
            (inner.connection.take(), inner.heartbeat_delay.take())
        };
        if let Some(connection) = connection {
            connection.dispose();
        }
        if let Some(heartbeat_delay) = heartbeat_delay {
            heartbeat_delay.dispose();
        }
        self.shared.round_trip_time_monitor.dispose();

        self.shared.events.publish(SdamEvent::ServerMonitorDisposed {
            server_id: self.shared.server_id.clone(),
        });
    }

    /// Disposes the monitor and waits for its background tasks to finish.
    pub async fn shutdown(&self) {
        self.dispose();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Heartbeat loop ended abnormally: {}", e);
            }
        }
        self.shared.round_trip_time_monitor.shutdown().await;
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), ServerMonitorError> {
        match self.state() {
            ServerMonitorState::Open => Ok(()),
            state => {
                tracing::warn!("{} called while the server monitor is {:?}", operation, state);
                Err(ServerMonitorError::InvalidState { operation, state })
            }
        }
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}
