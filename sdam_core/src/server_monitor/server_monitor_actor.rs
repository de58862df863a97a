use std::{
    any::Any,
    sync::{atomic::AtomicU8, Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    connection::with_cancellation,
    events::{
        DescriptionChangedSubscribers, EventPublisher, SdamEvent, SdamInformationEvent,
        ServerDescriptionChangedEvent, ServerHeartbeatFailedEvent, ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    AttemptTimer, Cadence, CommandReply, Connection, ConnectionError, ConnectionFactory, ConnectionId,
    HelloCommand, HelloResult, ResponseHandling, RoundTripTimeMonitor, ServerDescription,
    ServerDescriptionChanges, ServerId, ServerMonitorSettings, ServerState, ServerType,
};

/// State shared between a [`ServerMonitor`](crate::ServerMonitor) handle and its heartbeat loop.
pub(crate) struct ServerMonitorShared {
    pub(crate) server_id: ServerId,
    pub(crate) connection_factory: Arc<dyn ConnectionFactory>,
    pub(crate) settings: ServerMonitorSettings,
    /// Template for descriptions built from scratch: unknown, disconnected,
    /// with the monitor's heartbeat interval.
    pub(crate) base_description: ServerDescription,
    pub(crate) current_description: ArcSwap<ServerDescription>,
    pub(crate) round_trip_time_monitor: Arc<RoundTripTimeMonitor>,
    pub(crate) subscribers: DescriptionChangedSubscribers,
    pub(crate) events: EventPublisher,
    pub(crate) state: AtomicU8,
    /// Cancelled once, on dispose.
    pub(crate) monitor_cancellation: CancellationToken,
    pub(crate) inner: Mutex<ServerMonitorInner>,
}

/// Fields touched both by the loop and by callers of the handle.
pub(crate) struct ServerMonitorInner {
    pub(crate) connection: Option<Arc<dyn Connection>>,
    /// The last reply on `connection` announced another one.
    pub(crate) more_to_come: bool,
    pub(crate) heartbeat_delay: Option<Arc<AttemptTimer>>,
    /// Child of the monitor token, replaced on every cancelled check.
    pub(crate) heartbeat_cancellation: CancellationToken,
}

/// What a completed heartbeat tells the loop.
struct HeartbeatOutcome {
    process_another: bool,
}

struct HeartbeatFailure {
    connection_id: ConnectionId,
    duration: Duration,
    awaited: bool,
    error: ConnectionError,
}

impl ServerMonitorShared {
    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ServerMonitorInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `description` unless `cancellation` fired, and notifies
    /// subscribers when it differs from the current one in a way that matters
    /// for server selection. Returns false when the cycle was cancelled.
    fn set_description_if_changed(&self, description: ServerDescription, cancellation: &CancellationToken) -> bool {
        let new_description = Arc::new(description);
        let old_description = {
            let _inner = self.lock_inner();
            if cancellation.is_cancelled() {
                return false;
            }
            self.current_description.swap(new_description.clone())
        };

        if !old_description.sdam_equals(&new_description) {
            self.notify(old_description, new_description);
        }
        true
    }

    /// Stores `description` and notifies unconditionally.
    fn set_description(&self, description: ServerDescription) {
        let new_description = Arc::new(description);
        let old_description = self.current_description.swap(new_description.clone());
        self.notify(old_description, new_description);
    }

    fn notify(&self, old_description: Arc<ServerDescription>, new_description: Arc<ServerDescription>) {
        if self.monitor_cancellation.is_cancelled() {
            tracing::trace!(server_id = %self.server_id, "Monitor disposed, description change not published");
            return;
        }

        let event = ServerDescriptionChangedEvent {
            old_description,
            new_description,
        };
        self.events
            .publish(SdamEvent::ServerDescriptionChanged(event.clone()));
        self.subscribers.notify(&event);
    }

    /// Clears the monitoring connection if it is still `connection`, then disposes it.
    fn discard_connection(&self, connection: &Arc<dyn Connection>) {
        {
            let mut inner = self.lock_inner();
            if is_current_connection(&inner, connection) {
                inner.connection = None;
                inner.more_to_come = false;
            }
        }
        connection.dispose();
    }

    #[instrument(level = "debug", name = "ServerMonitor - Initialize Connection", skip(self, cancellation), fields(server_id = %self.server_id))]
    async fn initialize_connection(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<HelloResult, HeartbeatFailure> {
        let connection = self
            .connection_factory
            .create_connection(&self.server_id, &self.server_id.end_point);
        let connection_id = connection.connection_id();

        self.events
            .publish(SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                connection_id: connection_id.clone(),
                awaited: false,
            }));
        let started = Instant::now();

        let result = match with_cancellation(cancellation, connection.open(cancellation)).await {
            Ok(()) => connection.description().ok_or_else(|| {
                ConnectionError::InvalidReply(
                    "the connection opened without a handshake result".to_string(),
                )
            }),
            Err(e) => Err(e),
        };
        let duration = started.elapsed();

        let failure = |error| HeartbeatFailure {
            connection_id: connection_id.clone(),
            duration,
            awaited: false,
            error,
        };

        let description = match result {
            Ok(description) => description,
            Err(e) => {
                connection.dispose();
                return Err(failure(e));
            }
        };

        {
            let mut inner = self.lock_inner();
            if cancellation.is_cancelled() {
                drop(inner);
                connection.dispose();
                return Err(failure(ConnectionError::Canceled));
            }
            inner.connection = Some(connection.clone());
            inner.more_to_come = false;
        }

        self.round_trip_time_monitor.add_sample(duration);
        self.events
            .publish(SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                connection_id: description.connection_id.clone(),
                duration,
                awaited: false,
                reply: description.hello_result.document().clone(),
            }));

        Ok(description.hello_result)
    }

    /// Sends a hello on the open monitoring connection, or reads the next
    /// streamed reply. Returns the result and whether more replies follow.
    #[instrument(level = "debug", name = "ServerMonitor - Get Hello Result", skip_all, fields(server_id = %self.server_id))]
    async fn get_hello_result(
        &self,
        connection: &Arc<dyn Connection>,
        previous: &ServerDescription,
        cancellation: &CancellationToken,
    ) -> Result<(HelloResult, bool), HeartbeatFailure> {
        let more_to_come = self.lock_inner().more_to_come;
        let hello_ok = previous.hello_ok()
            || connection
                .description()
                .map_or(false, |description| description.hello_result.hello_ok());
        let streaming_topology_version = previous
            .topology_version()
            .filter(|_| self.settings.is_streaming_enabled());
        let awaited = streaming_topology_version.is_some() || more_to_come;
        let connection_id = connection.connection_id();

        self.events
            .publish(SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                connection_id: connection_id.clone(),
                awaited,
            }));
        let started = Instant::now();

        let reply: Result<CommandReply, ConnectionError> = if more_to_come {
            with_cancellation(cancellation, connection.receive_more(cancellation)).await
        } else if let Some(topology_version) = streaming_topology_version {
            connection.set_read_timeout(self.settings.streaming_read_timeout());
            let command = HelloCommand::new(hello_ok)
                .awaitable(topology_version.clone(), self.settings.max_await_time());
            with_cancellation(
                cancellation,
                connection.execute_command(&command.to_document(), command.response_handling(), cancellation),
            )
            .await
        } else {
            let command = HelloCommand::new(hello_ok);
            with_cancellation(
                cancellation,
                connection.execute_command(&command.to_document(), ResponseHandling::Return, cancellation),
            )
            .await
        };
        let duration = started.elapsed();

        let (hello_result, reply_more_to_come) = reply
            .and_then(|reply| {
                let more_to_come = reply.more_to_come;
                HelloResult::from_document(reply.document).map(|hello| (hello, more_to_come))
            })
            .map_err(|error| HeartbeatFailure {
                connection_id: connection_id.clone(),
                duration,
                awaited,
                error,
            })?;

        {
            let mut inner = self.lock_inner();
            if is_current_connection(&inner, connection) {
                inner.more_to_come = reply_more_to_come;
            }
        }
        if !awaited {
            self.round_trip_time_monitor.add_sample(duration);
        }
        self.events
            .publish(SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                connection_id,
                duration,
                awaited,
                reply: hello_result.document().clone(),
            }));

        Ok((hello_result, reply_more_to_come))
    }

    fn description_from_hello(&self, hello_result: &HelloResult) -> ServerDescription {
        let now = SystemTime::now();
        self.base_description.with(ServerDescriptionChanges {
            average_round_trip_time: Some(round_to_millis(self.round_trip_time_monitor.average())),
            canonical_end_point: Some(hello_result.canonical_end_point()),
            election_id: Some(hello_result.election_id()),
            hello_ok: Some(hello_result.hello_ok()),
            last_heartbeat_timestamp: Some(Some(now)),
            last_update_timestamp: Some(now),
            last_write_timestamp: Some(hello_result.last_write_timestamp()),
            logical_session_timeout: Some(hello_result.logical_session_timeout()),
            max_batch_count: Some(hello_result.max_batch_count()),
            max_document_size: Some(hello_result.max_document_size()),
            max_message_size: Some(hello_result.max_message_size()),
            reason_changed: Some("Heartbeat".to_string()),
            replica_set_name: Some(hello_result.set_name().map(str::to_string)),
            server_type: Some(hello_result.server_type()),
            state: Some(ServerState::Connected),
            tags: Some(hello_result.tags().clone()),
            topology_version: Some(hello_result.topology_version().cloned()),
            wire_version_range: Some(Some(hello_result.wire_version_range())),
            ..Default::default()
        })
    }

    fn description_from_error(&self, error: Arc<ConnectionError>) -> ServerDescription {
        let now = SystemTime::now();
        self.base_description.with(ServerDescriptionChanges {
            topology_version: Some(error.topology_version().cloned()),
            heartbeat_exception: Some(Some(error)),
            last_heartbeat_timestamp: Some(Some(now)),
            last_update_timestamp: Some(now),
            reason_changed: Some("Heartbeat".to_string()),
            ..Default::default()
        })
    }
}

/// One heartbeat cycle. Returns `None` when the cycle was cancelled, in which
/// case nothing is published.
#[instrument(level = "debug", name = "ServerMonitor - Heartbeat", skip_all, fields(server_id = %shared.server_id))]
async fn heartbeat(
    shared: Arc<ServerMonitorShared>,
    cancellation: CancellationToken,
) -> Option<HeartbeatOutcome> {
    let previous = shared.current_description.load_full();
    let connection = shared.lock_inner().connection.clone();

    let mut connection_is_streaming = false;
    let result = match &connection {
        None => shared.initialize_connection(&cancellation).await,
        Some(connection) => shared
            .get_hello_result(connection, &previous, &cancellation)
            .await
            .map(|(hello_result, more_to_come)| {
                connection_is_streaming = more_to_come;
                hello_result
            }),
    };

    let (new_description, heartbeat_error) = match result {
        Ok(hello_result) => (shared.description_from_hello(&hello_result), None),
        // Covers both the cancellation error itself and any other failure of
        // a connection that cancel_current_check already disposed.
        Err(_) if cancellation.is_cancelled() => {
            tracing::debug!("Heartbeat cancelled");
            return None;
        }
        Err(failure) => {
            if let Some(connection) = &connection {
                shared.discard_connection(connection);
            }
            shared.round_trip_time_monitor.reset();

            let error = Arc::new(failure.error);
            shared
                .events
                .publish(SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                    connection_id: failure.connection_id,
                    duration: failure.duration,
                    awaited: failure.awaited,
                    error: error.clone(),
                }));
            (shared.description_from_error(error.clone()), Some(error))
        }
    };

    let server_supports_streaming =
        new_description.server_type() != ServerType::Unknown && new_description.topology_version().is_some();
    let transitioned_with_network_error = previous.server_type() != ServerType::Unknown
        && heartbeat_error
            .as_ref()
            .map_or(false, |error| error.is_network_error());

    if !shared.set_description_if_changed(new_description, &cancellation) {
        tracing::debug!("Heartbeat cancelled before its result was published");
        return None;
    }

    let streaming_enabled = shared.settings.is_streaming_enabled();
    let process_another = (streaming_enabled && (server_supports_streaming || connection_is_streaming))
        || transitioned_with_network_error;

    Some(HeartbeatOutcome { process_another })
}

/// The heartbeat loop. Runs until the monitor is disposed.
pub(crate) async fn run_server_monitor(shared: Arc<ServerMonitorShared>) {
    let mut cadence = Cadence::new(shared.settings.heartbeat_interval());

    while !shared.monitor_cancellation.is_cancelled() {
        let cancellation = shared.lock_inner().heartbeat_cancellation.clone();

        let outcome = tokio::spawn(heartbeat(shared.clone(), cancellation)).await;
        let process_another = match outcome {
            Ok(Some(outcome)) => outcome.process_another,
            Ok(None) => false,
            Err(e) if e.is_panic() => {
                report_unexpected_failure(&shared, e.into_panic());
                false
            }
            Err(_) => break,
        };

        if shared.monitor_cancellation.is_cancelled() {
            break;
        }

        if !process_another {
            let delay = AttemptTimer::new(
                cadence.next_tick_delay(),
                shared.settings.min_heartbeat_interval(),
            );
            let delay = Arc::new(delay);
            let previous = {
                let mut inner = shared.lock_inner();
                if shared.monitor_cancellation.is_cancelled() {
                    break;
                }
                inner.heartbeat_delay.replace(delay.clone())
            };
            if let Some(previous) = previous {
                previous.dispose();
            }

            tokio::select! {
                _ = shared.monitor_cancellation.cancelled() => break,
                _ = delay.wait() => {}
            }
        }
    }

    tracing::debug!(server_id = %shared.server_id, "Heartbeat loop stopped");
}

/// Reports a defect in the heartbeat and publishes an unknown description
/// through the shortest possible path.
fn report_unexpected_failure(shared: &ServerMonitorShared, panic: Box<dyn Any + Send>) {
    let message = panic_message(panic.as_ref());

    shared
        .events
        .publish(SdamEvent::SdamInformation(SdamInformationEvent {
            server_id: shared.server_id.clone(),
            message: format!("Unexpected exception in server monitor heartbeat: {}", message),
        }));

    let error = ConnectionError::UnexpectedError(anyhow::anyhow!(message));
    shared.set_description(shared.base_description.with_heartbeat_exception(Arc::new(error)));
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn is_current_connection(inner: &ServerMonitorInner, connection: &Arc<dyn Connection>) -> bool {
    inner.connection.as_ref().map_or(false, |current| {
        std::ptr::eq(
            Arc::as_ptr(current) as *const (),
            Arc::as_ptr(connection) as *const (),
        )
    })
}

fn round_to_millis(duration: Duration) -> Duration {
    let micros = duration.as_micros();
    Duration::from_millis(((micros + 500) / 1000) as u64)
}
