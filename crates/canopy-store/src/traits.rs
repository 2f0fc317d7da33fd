//! The coordination store capability consumed by the coordination engine.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::types::ConnectionState;
use crate::types::NodeData;
use crate::types::NodeKind;
use crate::types::Stat;
use crate::types::WatchMode;
use crate::watch::Watch;

/// Hierarchical, watch-capable coordination store session.
///
/// One instance represents one process's session. Operations on the same
/// path issued through the same instance are applied in issue order.
/// Conflicting writers are arbitrated by node versions, never by locks held
/// in the caller.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node. Returns the actual path, which differs from `path` for
    /// sequential nodes.
    async fn create(&self, path: &str, data: Vec<u8>, kind: NodeKind) -> Result<String, StoreError>;

    /// Read a node's payload and version.
    async fn read(&self, path: &str) -> Result<NodeData, StoreError>;

    /// Overwrite a node's payload. With `expected_version` the write only
    /// applies if the node is still at that version. Returns the new version.
    async fn write(&self, path: &str, data: Vec<u8>, expected_version: Option<u32>) -> Result<u32, StoreError>;

    /// Delete a node, optionally guarded by version.
    async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<(), StoreError>;

    /// Names of the direct children of a node, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Metadata of a node, or `None` if it does not exist.
    async fn exists(&self, path: &str) -> Result<Option<Stat>, StoreError>;

    /// Register a one-shot watch on a node or subtree. The path does not have
    /// to exist yet.
    async fn watch(&self, path: &str, mode: WatchMode) -> Result<Watch, StoreError>;

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Stream of connection-state transitions.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;

    /// Identifier of the current session.
    fn session_id(&self) -> u64;

    /// End the session, removing every ephemeral node it owns.
    async fn close(&self) -> Result<(), StoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: CoordinationStore + ?Sized> CoordinationStore for std::sync::Arc<T> {
    async fn create(&self, path: &str, data: Vec<u8>, kind: NodeKind) -> Result<String, StoreError> {
        (**self).create(path, data, kind).await
    }

    async fn read(&self, path: &str) -> Result<NodeData, StoreError> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, data: Vec<u8>, expected_version: Option<u32>) -> Result<u32, StoreError> {
        (**self).write(path, data, expected_version).await
    }

    async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<(), StoreError> {
        (**self).delete(path, expected_version).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        (**self).children(path).await
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, StoreError> {
        (**self).exists(path).await
    }

    async fn watch(&self, path: &str, mode: WatchMode) -> Result<Watch, StoreError> {
        (**self).watch(path, mode).await
    }

    fn connection_state(&self) -> ConnectionState {
        (**self).connection_state()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        (**self).connection_events()
    }

    fn session_id(&self) -> u64 {
        (**self).session_id()
    }

    async fn close(&self) -> Result<(), StoreError> {
        (**self).close().await
    }
}
