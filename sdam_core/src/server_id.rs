use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use url::{Host, Url};
use uuid::Uuid;

use crate::error_chain_fmt;

pub const DEFAULT_PORT: u16 = 27017;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClusterId(Uuid);

impl ClusterId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndPoint {
    Dns { host: String, port: u16 },
    Ip(SocketAddr),
}

impl EndPoint {
    pub fn dns(host: &str, port: u16) -> Self {
        Self::Dns {
            host: host.to_lowercase(),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            EndPoint::Dns { port, .. } => *port,
            EndPoint::Ip(address) => address.port(),
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndPoint::Dns { host, port } => write!(f, "{}:{}", host, port),
            EndPoint::Ip(address) => write!(f, "{}", address),
        }
    }
}

impl From<SocketAddr> for EndPoint {
    fn from(address: SocketAddr) -> Self {
        EndPoint::Ip(address)
    }
}

impl FromStr for EndPoint {
    type Err = EndPointError;

    /// Parses `host`, `host:port`, `a.b.c.d:port` or `[v6]:port`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(EndPointError::Empty);
        }

        let url = Url::parse(&format!("mongodb://{}", trimmed))
            .map_err(|e| EndPointError::Invalid(value.to_string(), e.to_string()))?;
        if !url.username().is_empty()
            || url.password().is_some()
            || !url.path().is_empty()
            || url.query().is_some()
            || url.fragment().is_some()
        {
            return Err(EndPointError::Invalid(
                value.to_string(),
                "only a host and an optional port are allowed".to_string(),
            ));
        }

        let port = url.port().unwrap_or(DEFAULT_PORT);
        match url.host() {
            Some(Host::Ipv6(address)) => Ok(EndPoint::Ip(SocketAddr::new(IpAddr::V6(address), port))),
            Some(Host::Ipv4(address)) => Ok(EndPoint::Ip(SocketAddr::new(IpAddr::V4(address), port))),
            Some(Host::Domain(host)) => match host.parse::<Ipv4Addr>() {
                Ok(address) => Ok(EndPoint::Ip(SocketAddr::new(IpAddr::V4(address), port))),
                Err(_) => Ok(EndPoint::dns(host, port)),
            },
            None => Err(EndPointError::Empty),
        }
    }
}

#[derive(thiserror::Error)]
pub enum EndPointError {
    #[error("An end point must contain a host")]
    Empty,
    #[error("`{0}` is not a valid end point: {1}")]
    Invalid(String, String),
}
impl fmt::Debug for EndPointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Identifies a server within a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub cluster_id: ClusterId,
    pub end_point: EndPoint,
}

impl ServerId {
    pub fn new(cluster_id: ClusterId, end_point: EndPoint) -> Self {
        Self {
            cluster_id,
            end_point,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ClusterId: {}, EndPoint: {} }}", self.cluster_id, self.end_point)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a single connection. `local_value` is unique within the process;
/// `server_value` is the id the server assigned during the handshake, if any.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub server_id: ServerId,
    pub local_value: u64,
    pub server_value: Option<i64>,
}

impl ConnectionId {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            local_value: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            server_value: None,
        }
    }

    pub fn with_server_value(mut self, server_value: i64) -> Self {
        self.server_value = Some(server_value);
        self
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.server_value {
            Some(server_value) => write!(
                f,
                "{{ ServerId: {}, LocalValue: {}, ServerValue: {} }}",
                self.server_id, self.local_value, server_value
            ),
            None => write!(
                f,
                "{{ ServerId: {}, LocalValue: {} }}",
                self.server_id, self.local_value
            ),
        }
    }
}
