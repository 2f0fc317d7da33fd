//! Error kinds reported by a coordination store session.

use thiserror::Error;

/// Errors returned by [`crate::CoordinationStore`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The node (or, for `create`, its parent) does not exist.
    #[error("node '{path}' does not exist")]
    NoNode { path: String },
    /// A node already exists at the path.
    #[error("node '{path}' already exists")]
    NodeExists { path: String },
    /// The expected version did not match the node's current version.
    #[error("version mismatch on '{path}': expected {expected}, actual {actual}")]
    VersionMismatch { path: String, expected: u32, actual: u32 },
    /// The node still has children and cannot be deleted.
    #[error("node '{path}' has children")]
    NotEmpty { path: String },
    /// Ephemeral nodes cannot have children.
    #[error("cannot create children under ephemeral node '{path}'")]
    NoChildrenForEphemerals { path: String },
    /// The path is not a valid absolute store path.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    /// The connection is currently unavailable; the operation was not applied.
    #[error("connection lost")]
    ConnectionLost,
    /// The session expired; every ephemeral node it owned is gone.
    #[error("session {session_id} expired")]
    SessionExpired { session_id: u64 },
    /// The session was closed by its owner.
    #[error("session closed")]
    Closed,
}

impl StoreError {
    /// Returns true for failures that may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionLost)
    }

    /// Returns true when the session backing the store is gone for good.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, StoreError::SessionExpired { .. } | StoreError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_display() {
        let err = StoreError::VersionMismatch {
            path: "/canopy/counters/c".to_string(),
            expected: 3,
            actual: 4,
        };
        assert_eq!(err.to_string(), "version mismatch on '/canopy/counters/c': expected 3, actual 4");
    }

    #[test]
    fn only_connection_loss_is_transient() {
        assert!(StoreError::ConnectionLost.is_transient());
        assert!(!StoreError::Closed.is_transient());
        assert!(!StoreError::NoNode { path: "/a".into() }.is_transient());
        assert!(StoreError::SessionExpired { session_id: 7 }.is_session_fatal());
    }
}
