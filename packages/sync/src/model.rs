//! Wire model shared with the collaboration server.
//!
//! Field names follow the JSON the server emits on the event stream and
//! accepts on the heartbeat side channel. Collections the server leaves out
//! (or sends as `null`) deserialize as empty.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Treat an explicit `null` like a missing field
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Session-local client identifier, generated once per session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(id[..9].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user present on the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Exclusive editing claim on one region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub path: String,
    pub user: User,
}

/// Batch invalidation of leases
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Release {
    #[serde(default, deserialize_with = "nullable")]
    pub paths: Vec<String>,
}

/// Declared set of regions carrying annotations
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnnotationInfo {
    #[serde(default)]
    pub count: u32,
    #[serde(default, deserialize_with = "nullable")]
    pub components: Vec<String>,
}

/// A change notification for the document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Update {
    /// Exact paths touched by the change
    #[serde(rename = "paths", default, deserialize_with = "nullable")]
    pub direct_paths: Vec<String>,

    /// Paths whose nearest resolvable region must be refreshed
    #[serde(rename = "refreshPaths", default, deserialize_with = "nullable")]
    pub resolve_paths: Vec<String>,

    /// Server clock value, only meaningful for ordering
    #[serde(default)]
    pub time: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<AnnotationInfo>,
}

/// One inbound event-stream message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, deserialize_with = "nullable")]
    pub leases: Vec<Lease>,

    #[serde(default, deserialize_with = "nullable")]
    pub releases: Vec<Release>,

    #[serde(default, deserialize_with = "nullable")]
    pub updates: Vec<Update>,

    #[serde(default, deserialize_with = "nullable")]
    pub user_enter: Vec<User>,

    #[serde(default, deserialize_with = "nullable")]
    pub user_exit: Vec<String>,

    /// Marks an authoritative full snapshot sent on connection setup
    #[serde(default, deserialize_with = "nullable")]
    pub setup: bool,
}

impl Message {
    pub fn is_incremental(&self) -> bool {
        !self.setup
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Heartbeat, lease and release request posted on the side channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub uid: ClientId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_path: Option<String>,

    #[serde(default)]
    pub release: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default, deserialize_with = "nullable")]
    pub rejected: bool,
}

/// Best-effort notice sent while the page unloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingSignal {
    pub uid: ClientId,
    pub page_path: String,
}
