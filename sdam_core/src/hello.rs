//! Construction of hello commands and interpretation of their replies.
//!
//! Servers that have not yet confirmed `helloOk` only understand the legacy
//! `isMaster` spelling, so the first heartbeat on a connection always uses it.
use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    CommandError, ConnectionError, Document, EndPoint, ResponseHandling, ServerType,
    TopologyVersion,
};

pub const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 4 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48_000_000;
pub const DEFAULT_MAX_BATCH_COUNT: i32 = 1000;

/// A heartbeat command. Awaitable commands ask the server to hold the reply
/// until its topology version changes or `max_await_time` passes, and to keep
/// streaming further replies on the same connection.
#[derive(Clone, Debug, PartialEq)]
pub struct HelloCommand {
    hello_ok: bool,
    awaitable: Option<(TopologyVersion, Duration)>,
}

impl HelloCommand {
    pub fn new(hello_ok: bool) -> Self {
        Self {
            hello_ok,
            awaitable: None,
        }
    }

    pub fn awaitable(mut self, topology_version: TopologyVersion, max_await_time: Duration) -> Self {
        self.awaitable = Some((topology_version, max_await_time));
        self
    }

    pub fn response_handling(&self) -> ResponseHandling {
        if self.awaitable.is_some() {
            ResponseHandling::ExhaustAllowed
        } else {
            ResponseHandling::Return
        }
    }

    pub fn to_document(&self) -> Document {
        let mut command = Map::new();
        let name = if self.hello_ok { "hello" } else { "isMaster" };
        command.insert(name.to_string(), json!(1));
        command.insert("helloOk".to_string(), json!(true));
        if let Some((topology_version, max_await_time)) = &self.awaitable {
            command.insert(
                "topologyVersion".to_string(),
                json!({
                    "processId": topology_version.process_id,
                    "counter": topology_version.counter,
                }),
            );
            command.insert(
                "maxAwaitTimeMS".to_string(),
                json!(u64::try_from(max_await_time.as_millis()).unwrap_or(u64::MAX)),
            );
        }
        Value::Object(command)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WireVersionRange {
    pub min: i32,
    pub max: i32,
}

impl WireVersionRange {
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LastWrite {
    last_write_date: Option<Value>,
}

/// The interesting parts of a hello reply. The full reply stays available
/// through [`HelloResult::document`].
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HelloResult {
    #[serde(rename = "ismaster")]
    is_master: Option<bool>,
    is_writable_primary: Option<bool>,
    secondary: bool,
    arbiter_only: bool,
    hidden: bool,
    #[serde(rename = "isreplicaset")]
    is_replica_set: bool,
    set_name: Option<String>,
    msg: Option<String>,
    me: Option<String>,
    election_id: Option<Value>,
    hello_ok: bool,
    tags: BTreeMap<String, String>,
    topology_version: Option<TopologyVersion>,
    min_wire_version: i32,
    max_wire_version: i32,
    max_bson_object_size: Option<i32>,
    max_message_size_bytes: Option<i32>,
    max_write_batch_size: Option<i32>,
    logical_session_timeout_minutes: Option<i64>,
    last_write: Option<LastWrite>,
    connection_id: Option<i64>,
    #[serde(skip)]
    document: Document,
}

impl HelloResult {
    /// Interprets a reply document. `ok: 0` replies become a [`CommandError`].
    pub fn from_document(document: Document) -> Result<Self, ConnectionError> {
        if !is_ok(&document) {
            return Err(CommandError::from_response(document).into());
        }
        let mut result = serde_json::from_value::<HelloResult>(document.clone())
            .map_err(|e| ConnectionError::InvalidReply(e.to_string()))?;
        result.document = document;
        Ok(result)
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn server_type(&self) -> ServerType {
        if self.is_replica_set {
            return ServerType::ReplicaSetGhost;
        }
        if self.set_name.is_some() {
            return if self.is_writable_primary() {
                ServerType::ReplicaSetPrimary
            } else if self.hidden {
                ServerType::ReplicaSetOther
            } else if self.secondary {
                ServerType::ReplicaSetSecondary
            } else if self.arbiter_only {
                ServerType::ReplicaSetArbiter
            } else {
                ServerType::ReplicaSetOther
            };
        }
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::ShardRouter;
        }
        ServerType::Standalone
    }

    pub fn is_writable_primary(&self) -> bool {
        self.is_writable_primary.or(self.is_master).unwrap_or(false)
    }

    pub fn hello_ok(&self) -> bool {
        self.hello_ok
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The server's own view of its address, if it reported a parsable one.
    pub fn canonical_end_point(&self) -> Option<EndPoint> {
        self.me.as_deref().and_then(|me| me.parse().ok())
    }

    pub fn election_id(&self) -> Option<String> {
        match self.election_id.as_ref()? {
            Value::Null => None,
            Value::String(id) => Some(id.clone()),
            Value::Object(object) => match object.get("$oid") {
                Some(Value::String(id)) => Some(id.clone()),
                _ => Some(Value::Object(object.clone()).to_string()),
            },
            other => Some(other.to_string()),
        }
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        self.topology_version.as_ref()
    }

    pub fn wire_version_range(&self) -> WireVersionRange {
        WireVersionRange::new(self.min_wire_version, self.max_wire_version)
    }

    pub fn max_document_size(&self) -> i32 {
        self.max_bson_object_size.unwrap_or(DEFAULT_MAX_DOCUMENT_SIZE)
    }

    pub fn max_message_size(&self) -> i32 {
        self.max_message_size_bytes
            .unwrap_or_else(|| DEFAULT_MAX_MESSAGE_SIZE.max(self.max_document_size() + 1024))
    }

    pub fn max_batch_count(&self) -> i32 {
        self.max_write_batch_size.unwrap_or(DEFAULT_MAX_BATCH_COUNT)
    }

    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout_minutes
            .and_then(|minutes| u64::try_from(minutes).ok())
            .map(|minutes| Duration::from_secs(minutes * 60))
    }

    pub fn last_write_timestamp(&self) -> Option<SystemTime> {
        let date = self.last_write.as_ref()?.last_write_date.as_ref()?;
        let millis = match date {
            Value::Object(object) => object.get("$date").and_then(Value::as_i64),
            other => other.as_i64(),
        }?;
        let millis = u64::try_from(millis).ok()?;
        UNIX_EPOCH.checked_add(Duration::from_millis(millis))
    }

    pub fn server_connection_id(&self) -> Option<i64> {
        self.connection_id
    }
}

/// True when the reply's `ok` field is `1` or `true`.
pub fn is_ok(document: &Document) -> bool {
    match document.get("ok") {
        Some(Value::Bool(ok)) => *ok,
        Some(Value::Number(ok)) => ok.as_f64() == Some(1.0),
        _ => false,
    }
}
