use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced by registry operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    /// The cluster rejected the request or no endpoint could serve it.
    #[error("registry cluster error: {0}")]
    Cluster(String),

    /// The requested key does not exist.
    #[error("registry key not found: {0}")]
    KeyNotFound(String),

    /// The request exceeded its deadline.
    #[error("registry request timed out: {0}")]
    Timeout(String),

    /// The request was cancelled before completion.
    #[error("registry request cancelled: {0}")]
    Cancelled(String),

    /// A stored document could not be decoded.
    #[error("invalid registry document: {0}")]
    Decode(#[from] serde_json::Error),

    /// The transport to the registry failed.
    #[error("registry transport error: {0}")]
    Transport(String),
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// A node in the registry's hierarchical key space. Directory nodes carry
/// children; leaf nodes carry a value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryNode {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<RegistryNode>,
    #[serde(default, rename = "modifiedIndex")]
    pub modified_index: u64,
    #[serde(default, rename = "createdIndex")]
    pub created_index: u64,
}

impl RegistryNode {
    /// Last path segment of this node's key.
    pub fn tail_segment(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }

    /// Find a direct child whose key ends in the given segment.
    pub fn child(&self, segment: &str) -> Option<&RegistryNode> {
        self.nodes.iter().find(|n| n.tail_segment() == segment)
    }
}

/// Mutation kinds emitted by the registry watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegistryAction {
    Set,
    Update,
    Create,
    CompareAndSwap,
    Delete,
    Expire,
    CompareAndDelete,
    /// The initial read is reported as `get`; never seen on a watch stream.
    Get,
}

impl RegistryAction {
    /// Actions that create or replace a key. The changed node describes the
    /// new state.
    pub fn is_upsert(self) -> bool {
        matches!(
            self,
            RegistryAction::Set
                | RegistryAction::Update
                | RegistryAction::Create
                | RegistryAction::CompareAndSwap
        )
    }

    /// Actions that remove a key. The previous node describes what was lost.
    pub fn is_delete(self) -> bool {
        matches!(
            self,
            RegistryAction::Delete | RegistryAction::Expire | RegistryAction::CompareAndDelete
        )
    }

    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            RegistryAction::Set => "set",
            RegistryAction::Update => "update",
            RegistryAction::Create => "create",
            RegistryAction::CompareAndSwap => "compareAndSwap",
            RegistryAction::Delete => "delete",
            RegistryAction::Expire => "expire",
            RegistryAction::CompareAndDelete => "compareAndDelete",
            RegistryAction::Get => "get",
        }
    }
}

/// One mutation observed on the watch stream.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEvent {
    pub action: RegistryAction,
    #[serde(default)]
    pub node: Option<RegistryNode>,
    #[serde(default, rename = "prevNode")]
    pub prev_node: Option<RegistryNode>,
    /// Cluster index at the time of the event, used to resume watching.
    #[serde(skip)]
    pub index: u64,
}

/// Response to a read or write, together with the cluster index observed.
#[derive(Debug, Clone)]
pub struct RegistryResponse {
    pub node: RegistryNode,
    pub index: u64,
}

/// Options for write operations.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Time-to-live for the key, if any.
    pub ttl: Option<std::time::Duration>,
    /// Refresh the TTL of an existing key without notifying watchers of a
    /// value change.
    pub refresh: bool,
    /// Require the key to exist (`Some(true)`) or not exist (`Some(false)`).
    pub prev_exist: Option<bool>,
}

/// Typed view of the hierarchical service registry. Only the get / set /
/// watch semantics the gateway relies on are part of the port; everything
/// else about the store is an implementation detail of the adapter.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Read a key. With `recursive`, the whole subtree is returned.
    async fn get(&self, key: &str, recursive: bool) -> RegistryResult<RegistryResponse>;

    /// Write a key.
    async fn set(&self, key: &str, value: &str, options: SetOptions)
    -> RegistryResult<RegistryResponse>;

    /// Open a recursive watch on a subtree, delivering events after the
    /// given index.
    async fn watch(&self, key: &str, after_index: u64) -> RegistryResult<Box<dyn RegistryWatcher>>;
}

/// A long-lived stream of registry events. Implementations track their own
/// resume index so that transient errors never lose the caller's position.
#[async_trait]
pub trait RegistryWatcher: Send {
    /// Wait for the next event.
    async fn next(&mut self) -> RegistryResult<RegistryEvent>;
}
