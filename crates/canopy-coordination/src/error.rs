//! Error types for coordination primitives.

use canopy_store::StoreError;
use snafu::Snafu;

/// Errors from coordination primitives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The store stayed unreachable for the whole retry budget.
    #[snafu(display("connection lost during {operation} after {attempts} attempts"))]
    ConnectionLost {
        /// Description of the operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A caller-specified time budget was exceeded.
    #[snafu(display("operation timed out: {operation}"))]
    Timeout {
        /// Description of the operation.
        operation: String,
    },

    /// Optimistic concurrency kept failing past the retry bound.
    #[snafu(display("contention on '{path}': gave up after {attempts} attempts"))]
    Contention {
        /// Node that kept changing underneath us.
        path: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A counter update would leave the signed 64-bit range.
    #[snafu(display("counter at '{path}' would overflow: {value} + {delta}"))]
    Overflow {
        /// Counter node.
        path: String,
        /// Value before the update.
        value: i64,
        /// Rejected delta.
        delta: i64,
    },

    /// A version-guarded update lost against a concurrent writer.
    #[snafu(display("version mismatch on '{path}'"))]
    VersionMismatch {
        /// Node whose version moved.
        path: String,
    },

    /// A node required by the operation does not exist.
    #[snafu(display("node '{path}' does not exist"))]
    NoNode {
        /// Missing node.
        path: String,
    },

    /// A node the operation meant to create already exists.
    #[snafu(display("node '{path}' already exists"))]
    NodeExists {
        /// Existing node.
        path: String,
    },

    /// The session expired; every ephemeral node of this process is gone.
    #[snafu(display("session {session_id} expired, cluster state must be rebuilt"))]
    SessionExpired {
        /// Expired session.
        session_id: u64,
    },

    /// The coordination client was closed.
    #[snafu(display("coordination client is closed"))]
    Closed,

    /// The operation requires cluster membership.
    #[snafu(display("not a cluster member: {reason}"))]
    NotMember {
        /// Why membership is missing.
        reason: String,
    },

    /// Data in the store is corrupted or unparseable.
    #[snafu(display("corrupted data at '{path}': {reason}"))]
    CorruptedData {
        /// Node holding the bad payload.
        path: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// JSON serialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },

    /// Any other store failure.
    #[snafu(display("store error: {source}"))]
    Store {
        /// The underlying error.
        source: StoreError,
    },
}

impl CoordinationError {
    /// Returns true if the local process can no longer rely on its cluster state.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, CoordinationError::SessionExpired { .. } | CoordinationError::Closed)
    }

    /// Returns true for precondition failures on a missing node.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode { .. })
    }

    /// Returns true for precondition failures on an existing node.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordinationError::NodeExists { .. })
    }

    /// Returns true for lost version races.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, CoordinationError::VersionMismatch { .. })
    }
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::NoNode { path } => CoordinationError::NoNode { path },
            StoreError::NodeExists { path } => CoordinationError::NodeExists { path },
            StoreError::VersionMismatch { path, .. } => CoordinationError::VersionMismatch { path },
            StoreError::ConnectionLost => CoordinationError::ConnectionLost {
                operation: "store operation".to_string(),
                attempts: 1,
            },
            StoreError::SessionExpired { session_id } => CoordinationError::SessionExpired { session_id },
            StoreError::Closed => CoordinationError::Closed,
            other => CoordinationError::Store { source: other },
        }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(source: serde_json::Error) -> Self {
        CoordinationError::Serialization { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_taxonomy() {
        let err: CoordinationError = StoreError::VersionMismatch {
            path: "/c".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(err.is_version_mismatch());

        let err: CoordinationError = StoreError::SessionExpired { session_id: 9 }.into();
        assert!(err.is_session_fatal());
        assert_eq!(err.to_string(), "session 9 expired, cluster state must be rebuilt");

        let err: CoordinationError = StoreError::NotEmpty { path: "/p".into() }.into();
        assert!(matches!(err, CoordinationError::Store {
            source: StoreError::NotEmpty { .. }
        }));
    }

    #[test]
    fn contention_display() {
        let err = CoordinationError::Contention {
            path: "/canopy/counters/hits".into(),
            attempts: 100,
        };
        assert_eq!(err.to_string(), "contention on '/canopy/counters/hits': gave up after 100 attempts");

        let err = CoordinationError::Overflow {
            path: "/canopy/counters/hits".into(),
            value: i64::MAX,
            delta: 1,
        };
        assert_eq!(err.to_string(), format!("counter at '/canopy/counters/hits' would overflow: {} + 1", i64::MAX));
    }
}
