use std::{
    collections::VecDeque,
    fmt, io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use sdam_core::{
    events::{SdamEvent, ServerDescriptionChangedEvent},
    ClusterId, CommandReply, Connection, ConnectionDescription, ConnectionError, ConnectionFactory,
    ConnectionId, Document, EndPoint, HelloResult, ResponseHandling, RoundTripTimeMonitor, ServerId,
    ServerMonitor, ServerMonitorSettings, ServerMonitoringMode,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{subscriber::set_global_default, Subscriber};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt, EnvFilter, Registry};

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(|| {
    let default_filter_level = "debug".to_string();
    let subscriber_name = "test".to_string();
    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::stdout);
        init_subscriber(subscriber);
    } else {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::sink);
        init_subscriber(subscriber);
    }
});

fn get_subscriber<Sink>(name: String, env_filter: String, sink: Sink) -> impl Subscriber + Send + Sync
where
    Sink: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));
    let formatting_layer = BunyanFormattingLayer::new(name, sink);
    Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer)
}

fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    LogTracer::init().expect("Failed to set logger");
    set_global_default(subscriber).expect("Failed to set subscriber");
}

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub fn standalone_hello() -> Document {
    json!({ "ok": 1, "ismaster": true, "maxWireVersion": 17, "minWireVersion": 0 })
}

pub fn primary_hello(counter: i64) -> Document {
    json!({
        "ok": 1,
        "isWritablePrimary": true,
        "helloOk": true,
        "setName": "rs0",
        "topologyVersion": { "processId": "6151f2b1", "counter": counter },
        "minWireVersion": 0,
        "maxWireVersion": 17
    })
}

/// How a scripted connection answers `open`.
#[derive(Clone, Debug)]
pub enum OpenStep {
    Succeed { hello: Document, delay: Duration },
    Fail,
    /// Never completes.
    Pending,
}

/// One answer to `execute_command` or `receive_more`.
#[derive(Clone, Debug)]
pub enum Step {
    Reply {
        document: Document,
        more_to_come: bool,
        delay: Duration,
    },
    NetworkError,
    Panic,
}

impl Step {
    pub fn reply(document: Document) -> Self {
        Step::Reply {
            document,
            more_to_come: false,
            delay: Duration::ZERO,
        }
    }

    pub fn streaming(document: Document) -> Self {
        Step::Reply {
            document,
            more_to_come: true,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionScript {
    pub open: OpenStep,
    pub steps: Vec<Step>,
}

impl ConnectionScript {
    pub fn opens_with(hello: Document) -> Self {
        Self::opens_after(Duration::ZERO, hello)
    }

    pub fn opens_after(delay: Duration, hello: Document) -> Self {
        Self {
            open: OpenStep::Succeed { hello, delay },
            steps: Vec::new(),
        }
    }

    pub fn pending() -> Self {
        Self {
            open: OpenStep::Pending,
            steps: Vec::new(),
        }
    }

    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }
}

/// A connection that plays back a [`ConnectionScript`]. Once the script runs
/// out, every call waits until the connection is cancelled or disposed.
pub struct ScriptedConnection {
    connection_id: ConnectionId,
    end_point: EndPoint,
    open: Mutex<Option<OpenStep>>,
    steps: Mutex<VecDeque<Step>>,
    description: Mutex<Option<ConnectionDescription>>,
    disposed: CancellationToken,
    commands: Mutex<Vec<(Document, ResponseHandling)>>,
    receive_more_calls: AtomicUsize,
    read_timeouts: Mutex<Vec<Duration>>,
}

impl fmt::Debug for ScriptedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedConnection")
            .field("connection_id", &self.connection_id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ScriptedConnection {
    fn new(server_id: &ServerId, end_point: &EndPoint, script: ConnectionScript) -> Self {
        Self {
            connection_id: ConnectionId::new(server_id.clone()),
            end_point: end_point.clone(),
            open: Mutex::new(Some(script.open)),
            steps: Mutex::new(script.steps.into()),
            description: Mutex::new(None),
            disposed: CancellationToken::new(),
            commands: Mutex::new(Vec::new()),
            receive_more_calls: AtomicUsize::new(0),
            read_timeouts: Mutex::new(Vec::new()),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    pub fn commands(&self) -> Vec<(Document, ResponseHandling)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn receive_more_calls(&self) -> usize {
        self.receive_more_calls.load(Ordering::SeqCst)
    }

    pub fn read_timeouts(&self) -> Vec<Duration> {
        self.read_timeouts.lock().unwrap().clone()
    }

    fn network_error(&self, message: &str) -> ConnectionError {
        ConnectionError::network(
            self.end_point.clone(),
            io::Error::new(io::ErrorKind::ConnectionReset, message.to_string()),
        )
    }

    async fn wait_forever(&self, cancellation: &CancellationToken) -> ConnectionError {
        tokio::select! {
            _ = cancellation.cancelled() => ConnectionError::Canceled,
            _ = self.disposed.cancelled() => self.network_error("connection disposed"),
        }
    }

    async fn play_next_step(&self, cancellation: &CancellationToken) -> Result<CommandReply, ConnectionError> {
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None => Err(self.wait_forever(cancellation).await),
            Some(Step::Reply {
                document,
                more_to_come,
                delay,
            }) => {
                tokio::time::sleep(delay).await;
                Ok(CommandReply { document, more_to_come })
            }
            Some(Step::NetworkError) => Err(self.network_error("scripted network error")),
            Some(Step::Panic) => panic!("scripted panic"),
        }
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id.clone()
    }

    fn description(&self) -> Option<ConnectionDescription> {
        self.description.lock().unwrap().clone()
    }

    async fn open(&self, cancellation: &CancellationToken) -> Result<(), ConnectionError> {
        let step = self.open.lock().unwrap().take();
        match step {
            Some(OpenStep::Succeed { hello, delay }) => {
                tokio::time::sleep(delay).await;
                let hello_result = HelloResult::from_document(hello)?;
                *self.description.lock().unwrap() = Some(ConnectionDescription {
                    connection_id: self.connection_id.clone(),
                    hello_result,
                });
                Ok(())
            }
            Some(OpenStep::Fail) => Err(self.network_error("scripted connection refused")),
            Some(OpenStep::Pending) | None => Err(self.wait_forever(cancellation).await),
        }
    }

    async fn execute_command(
        &self,
        command: &Document,
        response_handling: ResponseHandling,
        cancellation: &CancellationToken,
    ) -> Result<CommandReply, ConnectionError> {
        self.commands
            .lock()
            .unwrap()
            .push((command.clone(), response_handling));
        self.play_next_step(cancellation).await
    }

    async fn receive_more(&self, cancellation: &CancellationToken) -> Result<CommandReply, ConnectionError> {
        self.receive_more_calls.fetch_add(1, Ordering::SeqCst);
        self.play_next_step(cancellation).await
    }

    fn set_read_timeout(&self, timeout: Duration) {
        self.read_timeouts.lock().unwrap().push(timeout);
    }

    fn dispose(&self) {
        self.disposed.cancel();
    }
}

/// Hands out scripted connections in order, then connections that never open.
#[derive(Default)]
pub struct ScriptedConnectionFactory {
    scripts: Mutex<VecDeque<ConnectionScript>>,
    created: Mutex<Vec<Arc<ScriptedConnection>>>,
}

impl fmt::Debug for ScriptedConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedConnectionFactory")
            .field("created", &self.created.lock().unwrap().len())
            .finish()
    }
}

impl ScriptedConnectionFactory {
    pub fn new(scripts: Vec<ConnectionScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn connections(&self) -> Vec<Arc<ScriptedConnection>> {
        self.created.lock().unwrap().clone()
    }
}

impl ConnectionFactory for ScriptedConnectionFactory {
    fn create_connection(&self, server_id: &ServerId, end_point: &EndPoint) -> Arc<dyn Connection> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ConnectionScript::pending);
        let connection = Arc::new(ScriptedConnection::new(server_id, end_point, script));
        self.created.lock().unwrap().push(connection.clone());
        connection
    }
}

/// Runs inside the event subscriber, after the event was recorded.
pub type EventHook = Box<dyn Fn(&SdamEvent) + Send + Sync>;

pub struct TestMonitor {
    pub monitor: Arc<ServerMonitor>,
    pub factory: Arc<ScriptedConnectionFactory>,
    pub round_trip_time_factory: Arc<ScriptedConnectionFactory>,
    changes: Arc<Mutex<Vec<ServerDescriptionChangedEvent>>>,
    events: Arc<Mutex<Vec<SdamEvent>>>,
    hook: Arc<Mutex<Option<EventHook>>>,
}

impl TestMonitor {
    pub fn on_event(&self, hook: EventHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    pub fn changes(&self) -> Vec<ServerDescriptionChangedEvent> {
        self.changes.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<SdamEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn heartbeats_succeeded(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SdamEvent::ServerHeartbeatSucceeded(_)))
            .count()
    }

    pub fn heartbeats_failed(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SdamEvent::ServerHeartbeatFailed(_)))
            .count()
    }

    /// Waits, in virtual time, until at least `count` changes were published.
    pub async fn wait_for_changes(&self, count: usize) -> Vec<ServerDescriptionChangedEvent> {
        for _ in 0..600 {
            if self.changes.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.changes()
    }
}

pub fn polling_settings() -> ServerMonitorSettings {
    ServerMonitorSettings::builder()
        .set_heartbeat_interval(HEARTBEAT_INTERVAL)
        .set_server_monitoring_mode(ServerMonitoringMode::Poll)
        .build()
        .unwrap()
}

pub fn streaming_settings() -> ServerMonitorSettings {
    ServerMonitorSettings::builder()
        .set_heartbeat_interval(HEARTBEAT_INTERVAL)
        .set_server_monitoring_mode(ServerMonitoringMode::Stream)
        .build()
        .unwrap()
}

/// Builds a monitor over `scripts`. Its round trip time monitor uses
/// connections that never open, so every sample comes from heartbeats.
pub fn create_monitor(scripts: Vec<ConnectionScript>, settings: ServerMonitorSettings) -> TestMonitor {
    Lazy::force(&TRACING);

    let server_id = ServerId::new(ClusterId::new(), EndPoint::dns("localhost", 27017));
    let factory = Arc::new(ScriptedConnectionFactory::new(scripts));
    let round_trip_time_factory = Arc::new(ScriptedConnectionFactory::default());
    let round_trip_time_monitor = Arc::new(RoundTripTimeMonitor::new(
        round_trip_time_factory.clone(),
        server_id.clone(),
        server_id.end_point.clone(),
        settings.heartbeat_interval(),
    ));

    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded_events = events.clone();
    let hook: Arc<Mutex<Option<EventHook>>> = Arc::new(Mutex::new(None));
    let event_hook = hook.clone();
    let monitor = ServerMonitor::with_components(
        server_id,
        factory.clone(),
        settings,
        round_trip_time_monitor,
        Some(Arc::new(move |event: &SdamEvent| -> anyhow::Result<()> {
            recorded_events.lock().unwrap().push(event.clone());
            if let Some(hook) = event_hook.lock().unwrap().as_ref() {
                hook(event);
            }
            Ok(())
        })),
    );

    let changes = Arc::new(Mutex::new(Vec::new()));
    let recorded_changes = changes.clone();
    monitor.subscribe(move |event| {
        recorded_changes.lock().unwrap().push(event.clone());
        Ok(())
    });

    TestMonitor {
        monitor: Arc::new(monitor),
        factory,
        round_trip_time_factory,
        changes,
        events,
        hook,
    }
}

pub fn disposed_flags(connections: &[Arc<ScriptedConnection>]) -> Vec<bool> {
    connections.iter().map(|connection| connection.is_disposed()).collect()
}
