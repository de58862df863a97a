use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Freshness token reported by a server: the identity of the server process
/// plus a counter the process increments whenever its state changes.
///
/// Two versions are only comparable when they come from the same process.
/// This type deliberately does not implement [`PartialOrd`]: see
/// [`TopologyVersion::compare`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub process_id: String,
    pub counter: i64,
}

impl TopologyVersion {
    pub fn new(process_id: impl Into<String>, counter: i64) -> Self {
        Self {
            process_id: process_id.into(),
            counter,
        }
    }

    /// Reads a `topologyVersion` sub-document. Returns `None` when it is
    /// absent or malformed.
    pub fn from_document(document: &Value) -> Option<Self> {
        document
            .get("topologyVersion")
            .filter(|value| !value.is_null())
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /**
    Compares a locally held version against one from a server response.

    When either side is missing, or the process ids differ, the response is
    treated as newer and `Less` is returned. Otherwise the counters decide.
    Swapping the arguments of two versions from different processes also
    returns `Less`, so this is not a total order.

    ```rust
    use std::cmp::Ordering;
    use sdam_core::TopologyVersion;

    let a = TopologyVersion::new("a", 5);
    let b = TopologyVersion::new("b", 1);
    assert_eq!(TopologyVersion::compare(Some(&a), Some(&b)), Ordering::Less);
    assert_eq!(TopologyVersion::compare(Some(&b), Some(&a)), Ordering::Less);
    ```
    */
    pub fn compare(local: Option<&TopologyVersion>, response: Option<&TopologyVersion>) -> Ordering {
        match (local, response) {
            (Some(local), Some(response)) if local.process_id == response.process_id => {
                local.counter.cmp(&response.counter)
            }
            _ => Ordering::Less,
        }
    }

    /// True when `local` is strictly newer than `response`.
    pub fn is_fresher_than(local: Option<&TopologyVersion>, response: Option<&TopologyVersion>) -> bool {
        Self::compare(local, response) == Ordering::Greater
    }

    /// True when `local` is older than or equal to `response`.
    pub fn is_stale_or_equal(local: Option<&TopologyVersion>, response: Option<&TopologyVersion>) -> bool {
        Self::compare(local, response) != Ordering::Greater
    }

    /// True when `local` is strictly older than `response`.
    pub fn is_staler_than(local: Option<&TopologyVersion>, response: Option<&TopologyVersion>) -> bool {
        Self::compare(local, response) == Ordering::Less
    }
}

impl std::fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ processId: {}, counter: {} }}", self.process_id, self.counter)
    }
}
