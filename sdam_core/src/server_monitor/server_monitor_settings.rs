use std::{fmt, sync::Arc, time::Duration};

use tracing::instrument;

use crate::error_chain_fmt;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
/// One day, sent as `maxAwaitTimeMS` when the heartbeat interval is infinite.
pub const INFINITE_MAX_AWAIT_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether heartbeats may use the streaming protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerMonitoringMode {
    Stream,
    Poll,
    /// Stream unless running inside a function-as-a-service host.
    #[default]
    Auto,
}

/// Source of environment variables, swappable in tests.
pub trait EnvironmentVariableProvider: Send + Sync + fmt::Debug {
    fn get_environment_variable(&self, name: &str) -> Option<String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnvironment;

impl EnvironmentVariableProvider for ProcessEnvironment {
    fn get_environment_variable(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

#[derive(Clone, Debug)]
pub struct ServerMonitorSettings {
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    min_heartbeat_interval: Duration,
    server_monitoring_mode: ServerMonitoringMode,
    environment: Arc<dyn EnvironmentVariableProvider>,
}

impl ServerMonitorSettings {
    pub fn builder() -> ServerMonitorSettingsBuilder {
        ServerMonitorSettingsBuilder::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// `Duration::MAX` means heartbeats only happen on request.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn min_heartbeat_interval(&self) -> Duration {
        self.min_heartbeat_interval
    }

    pub fn server_monitoring_mode(&self) -> ServerMonitoringMode {
        self.server_monitoring_mode
    }

    pub fn is_streaming_enabled(&self) -> bool {
        match self.server_monitoring_mode {
            ServerMonitoringMode::Stream => true,
            ServerMonitoringMode::Poll => false,
            ServerMonitoringMode::Auto => !self.is_function_as_a_service(),
        }
    }

    /// Value of `maxAwaitTimeMS` for streaming heartbeats.
    pub fn max_await_time(&self) -> Duration {
        if self.heartbeat_interval == Duration::MAX {
            INFINITE_MAX_AWAIT_TIME
        } else {
            self.heartbeat_interval
        }
    }

    /// Read timeout for streaming heartbeats: the server may hold a reply for
    /// up to the heartbeat interval.
    pub fn streaming_read_timeout(&self) -> Duration {
        self.connect_timeout.saturating_add(self.max_await_time())
    }

    fn is_function_as_a_service(&self) -> bool {
        let env = |name: &str| self.environment.get_environment_variable(name);

        env("AWS_EXECUTION_ENV").map_or(false, |value| value.starts_with("AWS_Lambda_"))
            || env("AWS_LAMBDA_RUNTIME_API").is_some()
            || env("FUNCTIONS_WORKER_RUNTIME").is_some()
            || env("K_SERVICE").is_some()
            || env("FUNCTION_NAME").is_some()
            || env("VERCEL").is_some()
    }
}

impl Default for ServerMonitorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: crate::DEFAULT_HEARTBEAT_INTERVAL,
            min_heartbeat_interval: DEFAULT_MIN_HEARTBEAT_INTERVAL,
            server_monitoring_mode: ServerMonitoringMode::default(),
            environment: Arc::new(ProcessEnvironment),
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerMonitorSettingsBuilder {
    connect_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    min_heartbeat_interval: Option<Duration>,
    server_monitoring_mode: Option<ServerMonitoringMode>,
    environment: Option<Arc<dyn EnvironmentVariableProvider>>,
}

impl ServerMonitorSettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn set_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = Some(heartbeat_interval);
        self
    }

    pub fn set_min_heartbeat_interval(mut self, min_heartbeat_interval: Duration) -> Self {
        self.min_heartbeat_interval = Some(min_heartbeat_interval);
        self
    }

    pub fn set_server_monitoring_mode(mut self, mode: ServerMonitoringMode) -> Self {
        self.server_monitoring_mode = Some(mode);
        self
    }

    pub fn set_environment_variable_provider(
        mut self,
        environment: Arc<dyn EnvironmentVariableProvider>,
    ) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Validates the settings. The builder can be reused as a template.
    #[instrument(level = "debug", name = "Build ServerMonitorSettings", skip(self))]
    pub fn build(&self) -> Result<ServerMonitorSettings, ServerMonitorSettingsError> {
        let defaults = ServerMonitorSettings::default();

        let connect_timeout = self.connect_timeout.unwrap_or(defaults.connect_timeout);
        if connect_timeout.is_zero() {
            tracing::error!("A zero connect timeout would fail every connection attempt");
            return Err(ServerMonitorSettingsError::ZeroDuration("connect_timeout"));
        }

        let heartbeat_interval = self.heartbeat_interval.unwrap_or(defaults.heartbeat_interval);
        if heartbeat_interval.is_zero() {
            return Err(ServerMonitorSettingsError::ZeroDuration("heartbeat_interval"));
        }

        let min_heartbeat_interval = self
            .min_heartbeat_interval
            .unwrap_or(defaults.min_heartbeat_interval);
        if min_heartbeat_interval.is_zero() {
            return Err(ServerMonitorSettingsError::ZeroDuration("min_heartbeat_interval"));
        }

        let settings = ServerMonitorSettings {
            connect_timeout,
            heartbeat_interval,
            min_heartbeat_interval,
            server_monitoring_mode: self
                .server_monitoring_mode
                .unwrap_or(defaults.server_monitoring_mode),
            environment: self.environment.clone().unwrap_or(defaults.environment),
        };

        tracing::trace!("Server monitor settings: {:?}", &settings);

        Ok(settings)
    }
}

#[derive(thiserror::Error)]
pub enum ServerMonitorSettingsError {
    #[error("`{0}` must be greater than zero")]
    ZeroDuration(&'static str),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl fmt::Debug for ServerMonitorSettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        error_chain_fmt(self, f)
    }
}
