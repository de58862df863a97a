use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{
    error_chain_fmt, ConnectionError, EndPoint, ServerId, TopologyVersion, WireVersionRange,
    DEFAULT_MAX_BATCH_COUNT, DEFAULT_MAX_DOCUMENT_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ServerState {
    #[default]
    Disconnected,
    Connected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ServerType {
    #[default]
    Unknown,
    Standalone,
    ShardRouter,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ReplicaSetArbiter,
    ReplicaSetOther,
    ReplicaSetGhost,
    LoadBalanced,
}

impl ServerType {
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            ServerType::ReplicaSetPrimary
                | ServerType::ReplicaSetSecondary
                | ServerType::ReplicaSetArbiter
                | ServerType::ReplicaSetOther
                | ServerType::ReplicaSetGhost
        )
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::ShardRouter
                | ServerType::ReplicaSetPrimary
                | ServerType::LoadBalanced
        )
    }
}

/**
Everything known about a server at one point in time.

Descriptions are immutable. [`with`](ServerDescription::with) returns a new
description in which every field not mentioned in the changes keeps its
current value, except `last_update_timestamp`, which defaults to now.
*/
#[derive(Clone, Debug)]
pub struct ServerDescription {
    server_id: ServerId,
    end_point: EndPoint,
    average_round_trip_time: Duration,
    canonical_end_point: Option<EndPoint>,
    election_id: Option<String>,
    hello_ok: bool,
    heartbeat_exception: Option<Arc<ConnectionError>>,
    heartbeat_interval: Duration,
    last_heartbeat_timestamp: Option<SystemTime>,
    last_update_timestamp: SystemTime,
    last_write_timestamp: Option<SystemTime>,
    logical_session_timeout: Option<Duration>,
    max_batch_count: i32,
    max_document_size: i32,
    max_message_size: i32,
    reason_changed: String,
    replica_set_name: Option<String>,
    server_type: ServerType,
    state: ServerState,
    tags: BTreeMap<String, String>,
    topology_version: Option<TopologyVersion>,
    wire_version_range: Option<WireVersionRange>,
}

/// Field overrides for [`ServerDescription::with`]. `None` keeps the current
/// value; for optional fields `Some(None)` clears it.
#[derive(Clone, Debug, Default)]
pub struct ServerDescriptionChanges {
    pub average_round_trip_time: Option<Duration>,
    pub canonical_end_point: Option<Option<EndPoint>>,
    pub election_id: Option<Option<String>>,
    pub hello_ok: Option<bool>,
    pub heartbeat_exception: Option<Option<Arc<ConnectionError>>>,
    pub heartbeat_interval: Option<Duration>,
    pub last_heartbeat_timestamp: Option<Option<SystemTime>>,
    pub last_update_timestamp: Option<SystemTime>,
    pub last_write_timestamp: Option<Option<SystemTime>>,
    pub logical_session_timeout: Option<Option<Duration>>,
    pub max_batch_count: Option<i32>,
    pub max_document_size: Option<i32>,
    pub max_message_size: Option<i32>,
    pub reason_changed: Option<String>,
    pub replica_set_name: Option<Option<String>>,
    pub server_type: Option<ServerType>,
    pub state: Option<ServerState>,
    pub tags: Option<BTreeMap<String, String>>,
    pub topology_version: Option<Option<TopologyVersion>>,
    pub wire_version_range: Option<Option<WireVersionRange>>,
}

impl ServerDescription {
    /// Creates a disconnected description of unknown type.
    ///
    /// Fails when `end_point` is not the end point of `server_id`.
    pub fn new(server_id: ServerId, end_point: EndPoint) -> Result<Self, ServerDescriptionError> {
        if server_id.end_point != end_point {
            return Err(ServerDescriptionError::EndPointMismatch {
                server_end_point: server_id.end_point,
                end_point,
            });
        }
        Ok(Self::unknown(server_id, end_point))
    }

    /// The description a monitor starts from.
    pub fn initial(server_id: ServerId, heartbeat_interval: Duration) -> Self {
        let end_point = server_id.end_point.clone();
        Self {
            heartbeat_interval,
            ..Self::unknown(server_id, end_point)
        }
    }

    fn unknown(server_id: ServerId, end_point: EndPoint) -> Self {
        Self {
            server_id,
            end_point,
            average_round_trip_time: Duration::ZERO,
            canonical_end_point: None,
            election_id: None,
            hello_ok: false,
            heartbeat_exception: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            last_heartbeat_timestamp: None,
            last_update_timestamp: SystemTime::now(),
            last_write_timestamp: None,
            logical_session_timeout: None,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reason_changed: "InitialDescription".to_string(),
            replica_set_name: None,
            server_type: ServerType::Unknown,
            state: ServerState::Disconnected,
            tags: BTreeMap::new(),
            topology_version: None,
            wire_version_range: None,
        }
    }

    pub fn with(&self, changes: ServerDescriptionChanges) -> Self {
        Self {
            server_id: self.server_id.clone(),
            end_point: self.end_point.clone(),
            average_round_trip_time: changes
                .average_round_trip_time
                .unwrap_or(self.average_round_trip_time),
            canonical_end_point: changes
                .canonical_end_point
                .unwrap_or_else(|| self.canonical_end_point.clone()),
            election_id: changes.election_id.unwrap_or_else(|| self.election_id.clone()),
            hello_ok: changes.hello_ok.unwrap_or(self.hello_ok),
            heartbeat_exception: changes
                .heartbeat_exception
                .unwrap_or_else(|| self.heartbeat_exception.clone()),
            heartbeat_interval: changes.heartbeat_interval.unwrap_or(self.heartbeat_interval),
            last_heartbeat_timestamp: changes
                .last_heartbeat_timestamp
                .unwrap_or(self.last_heartbeat_timestamp),
            last_update_timestamp: changes.last_update_timestamp.unwrap_or_else(SystemTime::now),
            last_write_timestamp: changes.last_write_timestamp.unwrap_or(self.last_write_timestamp),
            logical_session_timeout: changes
                .logical_session_timeout
                .unwrap_or(self.logical_session_timeout),
            max_batch_count: changes.max_batch_count.unwrap_or(self.max_batch_count),
            max_document_size: changes.max_document_size.unwrap_or(self.max_document_size),
            max_message_size: changes.max_message_size.unwrap_or(self.max_message_size),
            reason_changed: changes
                .reason_changed
                .unwrap_or_else(|| self.reason_changed.clone()),
            replica_set_name: changes
                .replica_set_name
                .unwrap_or_else(|| self.replica_set_name.clone()),
            server_type: changes.server_type.unwrap_or(self.server_type),
            state: changes.state.unwrap_or(self.state),
            tags: changes.tags.unwrap_or_else(|| self.tags.clone()),
            topology_version: changes
                .topology_version
                .unwrap_or_else(|| self.topology_version.clone()),
            wire_version_range: changes.wire_version_range.unwrap_or(self.wire_version_range),
        }
    }

    /// Unknown and disconnected, carrying `exception`.
    ///
    /// Kept free of [`with`](Self::with) so it stays usable when reporting
    /// failures of the regular path.
    pub fn with_heartbeat_exception(&self, exception: Arc<ConnectionError>) -> Self {
        let mut description = self.clone();
        description.heartbeat_exception = Some(exception);
        description.last_update_timestamp = SystemTime::now();
        description.server_type = ServerType::Unknown;
        description.state = ServerState::Disconnected;
        description
    }

    /// Equality restricted to the fields that matter for server selection.
    ///
    /// Timestamps, round trip time, heartbeat exception and reason are ignored.
    pub fn sdam_equals(&self, other: &ServerDescription) -> bool {
        self.end_point == other.end_point
            && self.server_type == other.server_type
            && self.state == other.state
            && self.wire_version_range == other.wire_version_range
            && self.canonical_end_point == other.canonical_end_point
            && self.election_id == other.election_id
            && self.logical_session_timeout == other.logical_session_timeout
            && self.replica_set_name == other.replica_set_name
            && self.tags == other.tags
            && self.topology_version == other.topology_version
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn end_point(&self) -> &EndPoint {
        &self.end_point
    }

    pub fn average_round_trip_time(&self) -> Duration {
        self.average_round_trip_time
    }

    pub fn canonical_end_point(&self) -> Option<&EndPoint> {
        self.canonical_end_point.as_ref()
    }

    pub fn election_id(&self) -> Option<&str> {
        self.election_id.as_deref()
    }

    pub fn hello_ok(&self) -> bool {
        self.hello_ok
    }

    pub fn heartbeat_exception(&self) -> Option<&Arc<ConnectionError>> {
        self.heartbeat_exception.as_ref()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn last_heartbeat_timestamp(&self) -> Option<SystemTime> {
        self.last_heartbeat_timestamp
    }

    pub fn last_update_timestamp(&self) -> SystemTime {
        self.last_update_timestamp
    }

    pub fn last_write_timestamp(&self) -> Option<SystemTime> {
        self.last_write_timestamp
    }

    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }

    pub fn max_batch_count(&self) -> i32 {
        self.max_batch_count
    }

    pub fn max_document_size(&self) -> i32 {
        self.max_document_size
    }

    pub fn max_message_size(&self) -> i32 {
        self.max_message_size
    }

    pub fn reason_changed(&self) -> &str {
        &self.reason_changed
    }

    pub fn replica_set_name(&self) -> Option<&str> {
        self.replica_set_name.as_deref()
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        self.topology_version.as_ref()
    }

    pub fn wire_version_range(&self) -> Option<WireVersionRange> {
        self.wire_version_range
    }
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        let exception = |d: &ServerDescription| d.heartbeat_exception.as_ref().map(|e| e.to_string());

        self.sdam_equals(other)
            && self.server_id == other.server_id
            && self.average_round_trip_time == other.average_round_trip_time
            && self.hello_ok == other.hello_ok
            && exception(self) == exception(other)
            && self.heartbeat_interval == other.heartbeat_interval
            && self.last_heartbeat_timestamp == other.last_heartbeat_timestamp
            && self.last_update_timestamp == other.last_update_timestamp
            && self.last_write_timestamp == other.last_write_timestamp
            && self.max_batch_count == other.max_batch_count
            && self.max_document_size == other.max_document_size
            && self.max_message_size == other.max_message_size
            && self.reason_changed == other.reason_changed
    }
}

#[derive(thiserror::Error)]
pub enum ServerDescriptionError {
    #[error("End point {end_point} does not match the server id's end point {server_end_point}")]
    EndPointMismatch {
        server_end_point: EndPoint,
        end_point: EndPoint,
    },
}
impl std::fmt::Debug for ServerDescriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
