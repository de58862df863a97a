use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    connection::with_cancellation, Connection, ConnectionError, ConnectionFactory, EndPoint,
    HelloCommand, HelloResult, ResponseHandling, RoundTripTimeEstimator, ServerId,
};

/**
Samples round trip time over a connection of its own.

A streaming heartbeat can wait on the server for a full heartbeat interval,
so it cannot measure latency. This monitor runs a separate loop that sends a
plain hello every `heartbeat_interval` (a fixed delay, no cadence
correction) and folds each round trip into a [`RoundTripTimeEstimator`].
Any failure drops the connection; the next iteration opens a new one and
samples the time it took to open.
*/
pub struct RoundTripTimeMonitor {
    inner: Arc<RoundTripTimeMonitorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct RoundTripTimeMonitorInner {
    server_id: ServerId,
    end_point: EndPoint,
    heartbeat_interval: Duration,
    connection_factory: Arc<dyn ConnectionFactory>,
    estimator: Mutex<RoundTripTimeEstimator>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    cancellation: CancellationToken,
    started: AtomicBool,
}

impl std::fmt::Debug for RoundTripTimeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundTripTimeMonitor")
            .field("server_id", &self.inner.server_id)
            .field("heartbeat_interval", &self.inner.heartbeat_interval)
            .field("average", &self.average())
            .field("started", &self.is_started())
            .field("disposed", &self.inner.cancellation.is_cancelled())
            .finish()
    }
}

impl RoundTripTimeMonitor {
    pub fn new(
        connection_factory: Arc<dyn ConnectionFactory>,
        server_id: ServerId,
        end_point: EndPoint,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RoundTripTimeMonitorInner {
                server_id,
                end_point,
                heartbeat_interval,
                connection_factory,
                estimator: Mutex::new(RoundTripTimeEstimator::default()),
                connection: Mutex::new(None),
                cancellation: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// Starts the sampling loop. Later calls, and calls after disposal, do nothing.
    pub fn start(&self) {
        if self.inner.cancellation.is_cancelled()
            || self
                .inner
                .started
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        let task = tokio::spawn(run_round_trip_time_monitor(self.inner.clone()));
        *self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn average(&self) -> Duration {
        self.inner.estimator().average()
    }

    pub fn add_sample(&self, sample: Duration) {
        self.inner.add_sample(sample);
    }

    pub fn reset(&self) {
        self.inner.estimator().reset();
    }

    /// Stops the loop and closes its connection. Safe to call more than once.
    pub fn dispose(&self) {
        if self.inner.cancellation.is_cancelled() {
            return;
        }
        self.inner.cancellation.cancel();
        self.inner.dispose_connection();
    }

    /// Disposes the monitor and waits for its loop to finish.
    pub async fn shutdown(&self) {
        self.dispose();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for RoundTripTimeMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl RoundTripTimeMonitorInner {
    fn estimator(&self) -> std::sync::MutexGuard<'_, RoundTripTimeEstimator> {
        self.estimator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_sample(&self, sample: Duration) {
        self.estimator().add_sample(sample);
    }

    fn current_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn dispose_connection(&self) {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(connection) = connection {
            connection.dispose();
        }
    }

    #[instrument(level = "trace", name = "RoundTripTimeMonitor - Measure", skip(self), fields(server_id = %self.server_id))]
    async fn measure(&self) -> Result<(), ConnectionError> {
        match self.current_connection() {
            None => {
                let connection = self
                    .connection_factory
                    .create_connection(&self.server_id, &self.end_point);
                {
                    let mut slot = self
                        .connection
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if self.cancellation.is_cancelled() {
                        drop(slot);
                        connection.dispose();
                        return Err(ConnectionError::Canceled);
                    }
                    *slot = Some(connection.clone());
                }

                let started = Instant::now();
                with_cancellation(&self.cancellation, connection.open(&self.cancellation)).await?;
                self.add_sample(started.elapsed());
            }
            Some(connection) => {
                let hello_ok = connection
                    .description()
                    .map_or(false, |description| description.hello_result.hello_ok());
                let command = HelloCommand::new(hello_ok).to_document();

                let started = Instant::now();
                let reply = with_cancellation(
                    &self.cancellation,
                    connection.execute_command(&command, ResponseHandling::Return, &self.cancellation),
                )
                .await?;
                HelloResult::from_document(reply.document)?;
                self.add_sample(started.elapsed());
            }
        }
        Ok(())
    }
}

async fn run_round_trip_time_monitor(inner: Arc<RoundTripTimeMonitorInner>) {
    tracing::debug!(server_id = %inner.server_id, "Round trip time monitor started");

    while !inner.cancellation.is_cancelled() {
        if let Err(e) = inner.measure().await {
            if !e.is_canceled() {
                tracing::debug!(server_id = %inner.server_id, "Round trip time sample failed: {}", e);
            }
            inner.dispose_connection();
        }

        tokio::select! {
            _ = inner.cancellation.cancelled() => break,
            _ = tokio::time::sleep(inner.heartbeat_interval) => {}
        }
    }

    tracing::debug!(server_id = %inner.server_id, "Round trip time monitor stopped");
}
