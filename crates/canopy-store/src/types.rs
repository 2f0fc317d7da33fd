//! Node, watch and connection types shared by every store implementation.

use serde::Deserialize;
use serde::Serialize;

use crate::error::StoreError;

/// Lifetime and naming behaviour of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Survives the creating session.
    Persistent,
    /// Deleted automatically when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a store-assigned sequence suffix appended to the name.
    EphemeralSequential,
}

impl NodeKind {
    /// Returns true if the node is bound to the creating session.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, NodeKind::Ephemeral | NodeKind::EphemeralSequential)
    }

    /// Returns true if the store appends a sequence suffix.
    pub fn is_sequential(&self) -> bool {
        matches!(self, NodeKind::EphemeralSequential)
    }
}

/// Node metadata returned alongside reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Data version, incremented on every write. Starts at 0.
    pub version: u32,
    /// Session owning the node if it is ephemeral.
    pub ephemeral_owner: Option<u64>,
    /// Number of direct children.
    pub num_children: u32,
}

/// Payload and version of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub stat: Stat,
}

impl NodeData {
    /// Current data version.
    pub fn version(&self) -> u32 {
        self.stat.version
    }
}

/// Scope of a watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchMode {
    /// Fires on creation, deletion or data change of the path itself.
    Node,
    /// Fires on any change at the path or anywhere beneath it.
    Subtree,
}

/// What happened to the node that triggered a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Deleted,
    DataChanged,
}

/// Notification delivered once per watch registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path of the node that changed (may be below the watched path).
    pub path: String,
    pub kind: ChangeKind,
}

/// Connection state of a session as seen by the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// First connection established.
    Connected,
    /// Connection interrupted; the session and its ephemeral nodes may still exist.
    Suspended,
    /// The session expired; all its ephemeral nodes are gone.
    Lost,
    /// Connection restored, possibly with a fresh session after `Lost`.
    Reconnected,
    /// Closed by the owner.
    Closed,
}

impl ConnectionState {
    /// Returns true when operations can be issued.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

/// Validate an absolute, normalized store path.
pub fn validate_path(path: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if !path.starts_with('/') {
        return Err(invalid("must be absolute"));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(invalid("must not end with '/'"));
    }
    if path.contains("//") {
        return Err(invalid("empty segment"));
    }
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(invalid("relative segment"));
    }
    Ok(())
}

/// Parent of a path, or `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Returns true if `path` equals `ancestor` or lies beneath it.
pub fn is_at_or_below(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" || path == ancestor {
        return true;
    }
    path.len() > ancestor.len() && path.starts_with(ancestor) && path.as_bytes()[ancestor.len()] == b'/'
}
