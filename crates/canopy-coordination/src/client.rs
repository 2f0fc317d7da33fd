//! Coordination client: the store session plus namespace and retry policy.
//!
//! Every primitive goes through this adapter. Each store call is wrapped in
//! the client's [`RetryPolicy`], so transient connection failures are
//! absorbed here and only exhausted budgets reach the primitives.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use canopy_store::ConnectionState;
use canopy_store::CoordinationStore;
use canopy_store::NodeData;
use canopy_store::NodeKind;
use canopy_store::Stat;
use canopy_store::StoreError;
use canopy_store::Watch;
use canopy_store::WatchMode;
use canopy_store::join_path;
use canopy_store::node_name;
use canopy_store::parent_path;
use canopy_store::validate_path;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;

use crate::constants::MAX_CREATE_PARENT_ATTEMPTS;
use crate::error::CoordinationError;
use crate::paths::PathNamespace;
use crate::retry::RetryPolicy;
use crate::subscription::Subscription;

/// Shared handle used by every primitive of one process.
pub struct CoordinationClient<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    namespace: PathNamespace,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl<S: CoordinationStore + ?Sized + 'static> CoordinationClient<S> {
    pub fn new(store: Arc<S>, namespace: PathNamespace, retry: RetryPolicy) -> Self {
        Self {
            store,
            namespace,
            retry,
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn namespace(&self) -> &PathNamespace {
        &self.namespace
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.store.connection_state()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.store.connection_events()
    }

    pub fn session_id(&self) -> u64 {
        self.store.session_id()
    }

    /// Make sure the persistent layout under the namespace root exists.
    pub async fn open(&self) -> Result<(), CoordinationError> {
        for path in self.namespace.layout() {
            self.ensure_path(&path).await?;
        }
        info!(root = self.namespace.root(), session_id = self.session_id(), "coordination client opened");
        Ok(())
    }

    /// End the session. Every ephemeral node it owns disappears. Idempotent.
    pub async fn close(&self) -> Result<(), CoordinationError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.store.close().await {
            Ok(()) | Err(StoreError::Closed) => {
                info!(session_id = self.session_id(), "coordination client closed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_open(&self) -> Result<(), CoordinationError> {
        if self.is_closed() {
            return Err(CoordinationError::Closed);
        }
        Ok(())
    }

    async fn retrying<T, F, Fut>(&self, operation: String, op: F) -> Result<T, CoordinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.ensure_open()?;
        self.retry.run(&operation, Some(self.store.connection_events()), op).await
    }

    pub async fn create(&self, path: &str, data: Vec<u8>, kind: NodeKind) -> Result<String, CoordinationError> {
        let store = &self.store;
        let data = &data;
        self.retrying(format!("create {path}"), move || store.create(path, data.clone(), kind)).await
    }

    /// Create a node, creating missing persistent ancestors first.
    pub async fn create_with_parents(
        &self,
        path: &str,
        data: Vec<u8>,
        kind: NodeKind,
    ) -> Result<String, CoordinationError> {
        let mut attempt: u32 = 0;
        loop {
            match self.create(path, data.clone(), kind).await {
                Err(err) if err.is_no_node() && attempt < MAX_CREATE_PARENT_ATTEMPTS => {
                    attempt += 1;
                    if let Some(parent) = parent_path(path) {
                        debug!(path, parent, attempt, "creating missing ancestors");
                        self.ensure_path(parent).await?;
                    }
                }
                other => return other,
            }
        }
    }

    /// Sequential create that survives lost replies.
    ///
    /// The last segment of `prefix_path` must be unique to this call (it
    /// carries a fresh id). Every retry first looks for a child starting
    /// with that segment and adopts it, so a create that was applied but
    /// whose reply was lost never leaves a second node behind. Missing
    /// ancestors are created as in [`Self::create_with_parents`].
    pub async fn create_protected(
        &self,
        prefix_path: &str,
        data: Vec<u8>,
        kind: NodeKind,
    ) -> Result<String, CoordinationError> {
        let parent = parent_path(prefix_path).ok_or_else(|| StoreError::InvalidPath {
            path: prefix_path.to_string(),
            reason: "protected create needs a parent".to_string(),
        })?;
        let marker = node_name(prefix_path);
        let store = &self.store;
        let data = &data;
        let attempted = AtomicBool::new(false);
        let attempted = &attempted;
        let mut parent_attempts: u32 = 0;
        loop {
            let created = self
                .retrying(format!("create {prefix_path}"), move || async move {
                    if attempted.swap(true, Ordering::AcqRel) {
                        match store.children(parent).await {
                            Ok(children) => {
                                if let Some(existing) = children.iter().find(|child| child.starts_with(marker)) {
                                    debug!(parent, node = %existing, "adopting node from an earlier attempt");
                                    return Ok(join_path(parent, existing));
                                }
                            }
                            Err(StoreError::NoNode { .. }) => {}
                            Err(err) => return Err(err),
                        }
                    }
                    store.create(prefix_path, data.clone(), kind).await
                })
                .await;
            match created {
                Err(err) if err.is_no_node() && parent_attempts < MAX_CREATE_PARENT_ATTEMPTS => {
                    parent_attempts += 1;
                    debug!(path = prefix_path, parent, attempt = parent_attempts, "creating missing ancestors");
                    self.ensure_path(parent).await?;
                }
                other => return other,
            }
        }
    }

    /// Create every missing node along `path` as an empty persistent node.
    pub async fn ensure_path(&self, path: &str) -> Result<(), CoordinationError> {
        validate_path(path)?;
        if self.exists(path).await?.is_some() {
            return Ok(());
        }
        let mut current = String::with_capacity(path.len());
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, Vec::new(), NodeKind::Persistent).await {
                Ok(_) => {}
                Err(err) if err.is_node_exists() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn read(&self, path: &str) -> Result<NodeData, CoordinationError> {
        let store = &self.store;
        self.retrying(format!("read {path}"), move || store.read(path)).await
    }

    /// Read a node, mapping a missing node to `None`.
    pub async fn read_opt(&self, path: &str) -> Result<Option<NodeData>, CoordinationError> {
        match self.read(path).await {
            Ok(node) => Ok(Some(node)),
            Err(err) if err.is_no_node() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn write(&self, path: &str, data: Vec<u8>, expected_version: Option<u32>) -> Result<u32, CoordinationError> {
        let store = &self.store;
        let data = &data;
        self.retrying(format!("write {path}"), move || store.write(path, data.clone(), expected_version))
            .await
    }

    pub async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<(), CoordinationError> {
        let store = &self.store;
        self.retrying(format!("delete {path}"), move || store.delete(path, expected_version)).await
    }

    /// Delete a node if present. Returns whether this call removed it.
    pub async fn delete_if_exists(&self, path: &str, expected_version: Option<u32>) -> Result<bool, CoordinationError> {
        match self.delete(path, expected_version).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_no_node() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let store = &self.store;
        self.retrying(format!("list {path}"), move || store.children(path)).await
    }

    /// Children of a node, or nothing if the node does not exist.
    pub async fn children_or_empty(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        match self.children(path).await {
            Ok(children) => Ok(children),
            Err(err) if err.is_no_node() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<Option<Stat>, CoordinationError> {
        let store = &self.store;
        self.retrying(format!("exists {path}"), move || store.exists(path)).await
    }

    /// Register a one-shot watch.
    pub async fn watch(&self, path: &str, mode: WatchMode) -> Result<Watch, CoordinationError> {
        let store = &self.store;
        self.retrying(format!("watch {path}"), move || store.watch(path, mode)).await
    }

    /// Continuous change stream on `path`.
    ///
    /// The first watch is registered before this returns, so every change
    /// after the call is observed (possibly coalesced with others).
    pub async fn subscribe(self: &Arc<Self>, path: &str, mode: WatchMode) -> Result<Subscription, CoordinationError> {
        let first = self.watch(path, mode).await?;
        Ok(Subscription::spawn(Arc::clone(self), path.to_string(), mode, first))
    }
}

impl<S: CoordinationStore + ?Sized> std::fmt::Debug for CoordinationClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("root", &self.namespace.root())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
