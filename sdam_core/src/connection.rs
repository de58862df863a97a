//! The contract the monitor needs from the wire protocol layer.
//!
//! Documents are carried as [`serde_json::Value`]; encoding them on the wire
//! is the connection implementation's business.
use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{error_chain_fmt, ConnectionId, EndPoint, HelloResult, ServerId, TopologyVersion};

pub type Document = Value;

/// How many replies a command may produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseHandling {
    /// Exactly one reply.
    Return,
    /// The server may keep sending replies (`moreToCome`) without new requests.
    ExhaustAllowed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandReply {
    pub document: Document,
    /// The server will send another reply to the same request.
    pub more_to_come: bool,
}

impl CommandReply {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            more_to_come: false,
        }
    }

    pub fn streaming(document: Document) -> Self {
        Self {
            document,
            more_to_come: true,
        }
    }
}

/// What an open connection learned during its handshake.
#[derive(Clone, Debug)]
pub struct ConnectionDescription {
    pub connection_id: ConnectionId,
    pub hello_result: HelloResult,
}

/**
A single connection to a server.

Methods take `&self` because a connection in use by the monitoring loop may
be disposed concurrently by another task; implementations are expected to
make an in-flight `open`/`execute_command`/`receive_more` return promptly
once `dispose` is called or the cancellation token fires. The monitor also
races every call against the token itself, so a connection that ignores it
will not hang the monitor.
*/
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn connection_id(&self) -> ConnectionId;

    /// `None` until [`open`](Connection::open) has succeeded.
    fn description(&self) -> Option<ConnectionDescription>;

    /// Connects and performs the handshake.
    async fn open(&self, cancellation: &CancellationToken) -> Result<(), ConnectionError>;

    async fn execute_command(
        &self,
        command: &Document,
        response_handling: ResponseHandling,
        cancellation: &CancellationToken,
    ) -> Result<CommandReply, ConnectionError>;

    /// Reads the next reply of a command whose last reply had `more_to_come`.
    async fn receive_more(&self, cancellation: &CancellationToken) -> Result<CommandReply, ConnectionError>;

    fn set_read_timeout(&self, timeout: Duration);

    fn dispose(&self);
}

/// Creates unopened connections.
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    fn create_connection(&self, server_id: &ServerId, end_point: &EndPoint) -> Arc<dyn Connection>;
}

/// Races `operation` against `cancellation`, so a connection that ignores the
/// token cannot hold up the caller.
pub(crate) async fn with_cancellation<T, F>(
    cancellation: &CancellationToken,
    operation: F,
) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, ConnectionError>>,
{
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(ConnectionError::Canceled),
        result = operation => result,
    }
}

#[derive(thiserror::Error)]
pub enum ConnectionError {
    #[error("An error occurred while communicating with {end_point}")]
    Network {
        end_point: EndPoint,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("The server replied with an invalid document: {0}")]
    InvalidReply(String),
    #[error("The operation was canceled")]
    Canceled,
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ConnectionError {
    pub fn network(end_point: EndPoint, source: std::io::Error) -> Self {
        ConnectionError::Network { end_point, source }
    }

    /// Connection refused, reset, timed out and friends.
    pub fn is_network_error(&self) -> bool {
        matches!(self, ConnectionError::Network { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectionError::Network { source, .. } if source.kind() == std::io::ErrorKind::TimedOut)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ConnectionError::Canceled)
    }

    /// The topology version the server attached to a command failure.
    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        match self {
            ConnectionError::Command(error) => error.topology_version.as_ref(),
            _ => None,
        }
    }
}

/// A reply with `ok: 0`.
#[derive(thiserror::Error, Clone)]
#[error("Command failed with error {code} ({code_name}): '{message}'")]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub topology_version: Option<TopologyVersion>,
    pub response: Document,
}
impl std::fmt::Debug for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl CommandError {
    pub fn from_response(response: Document) -> Self {
        let code = response
            .get("code")
            .and_then(Value::as_i64)
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or_default();
        let code_name = response
            .get("codeName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = response
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        let topology_version = TopologyVersion::from_document(&response);

        Self {
            code,
            code_name,
            message,
            topology_version,
            response,
        }
    }
}
