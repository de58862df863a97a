//! Monitors a simulated replica set member that steps down and back up every
//! few seconds. Run with `RUST_LOG=sdam_core=debug` to see the heartbeats.
use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use sdam_core::{
    ClusterId, CommandReply, Connection, ConnectionDescription, ConnectionError, ConnectionFactory,
    ConnectionId, Document, EndPoint, HelloResult, ResponseHandling, ServerId, ServerMonitor,
    ServerMonitorSettings, ServerMonitoringMode,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let end_point: EndPoint = std::env::var("SDAM_DEMO_ENDPOINT")
        .unwrap_or_else(|_| "localhost:27017".to_string())
        .parse()?;
    let server_id = ServerId::new(ClusterId::new(), end_point);
    let settings = ServerMonitorSettings::builder()
        .set_heartbeat_interval(Duration::from_secs(2))
        .set_server_monitoring_mode(ServerMonitoringMode::Stream)
        .build()?;

    let monitor = ServerMonitor::new(server_id, Arc::new(SimulatedServer::default()), settings);
    monitor.subscribe(|event| {
        println!(
            "{:?} -> {:?} (topology version {:?}, rtt {:?})",
            event.old_description.server_type(),
            event.new_description.server_type(),
            event.new_description.topology_version().map(|version| version.counter),
            event.new_description.average_round_trip_time(),
        );
        Ok(())
    });

    monitor.start()?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    monitor.request_immediate_check()?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    println!("{:#?}", monitor.description());
    monitor.shutdown().await;

    Ok(())
}

fn setup_tracing() {
    // Redirect all `log`'s events to the subscriber
    LogTracer::init().expect("Failed to set logger");
    // Set up tracing
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let formatting_layer = BunyanFormattingLayer::new("sdam-core-demo".into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    set_global_default(subscriber).expect("Failed to set subscriber");
}

/// Every connection talks to the same pretend server.
#[derive(Debug, Default)]
struct SimulatedServer {
    topology_counter: Arc<AtomicI64>,
}

impl ConnectionFactory for SimulatedServer {
    fn create_connection(&self, server_id: &ServerId, _end_point: &EndPoint) -> Arc<dyn Connection> {
        Arc::new(SimulatedConnection {
            connection_id: ConnectionId::new(server_id.clone()),
            topology_counter: self.topology_counter.clone(),
            description: Mutex::new(None),
            disposed: CancellationToken::new(),
        })
    }
}

struct SimulatedConnection {
    connection_id: ConnectionId,
    topology_counter: Arc<AtomicI64>,
    description: Mutex<Option<ConnectionDescription>>,
    disposed: CancellationToken,
}

impl fmt::Debug for SimulatedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedConnection")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl SimulatedConnection {
    /// Odd topology versions are a primary, even ones a secondary.
    fn hello(&self) -> Document {
        let counter = self.topology_counter.load(Ordering::SeqCst);
        json!({
            "ok": 1,
            "helloOk": true,
            "isWritablePrimary": counter % 2 == 1,
            "secondary": counter % 2 == 0,
            "setName": "rs0",
            "topologyVersion": { "processId": "demo", "counter": counter },
            "minWireVersion": 0,
            "maxWireVersion": 17
        })
    }

    async fn pause(&self, duration: Duration, cancellation: &CancellationToken) -> Result<(), ConnectionError> {
        tokio::select! {
            _ = cancellation.cancelled() => Err(ConnectionError::Canceled),
            _ = self.disposed.cancelled() => Err(ConnectionError::Canceled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for SimulatedConnection {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id.clone()
    }

    fn description(&self) -> Option<ConnectionDescription> {
        self.description.lock().ok()?.clone()
    }

    async fn open(&self, cancellation: &CancellationToken) -> Result<(), ConnectionError> {
        self.pause(Duration::from_millis(15), cancellation).await?;
        self.topology_counter.fetch_max(1, Ordering::SeqCst);
        let hello_result = HelloResult::from_document(self.hello())?;
        if let Ok(mut description) = self.description.lock() {
            *description = Some(ConnectionDescription {
                connection_id: self.connection_id.clone(),
                hello_result,
            });
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &Document,
        response_handling: ResponseHandling,
        cancellation: &CancellationToken,
    ) -> Result<CommandReply, ConnectionError> {
        if response_handling == ResponseHandling::ExhaustAllowed && command.get("topologyVersion").is_some() {
            return self.receive_more(cancellation).await;
        }
        self.pause(Duration::from_millis(5), cancellation).await?;
        Ok(CommandReply::new(self.hello()))
    }

    async fn receive_more(&self, cancellation: &CancellationToken) -> Result<CommandReply, ConnectionError> {
        // The server holds the reply until its state changes.
        self.pause(Duration::from_secs(3), cancellation).await?;
        self.topology_counter.fetch_add(1, Ordering::SeqCst);
        Ok(CommandReply::streaming(self.hello()))
    }

    fn set_read_timeout(&self, _timeout: Duration) {}

    fn dispose(&self) {
        self.disposed.cancel();
    }
}
