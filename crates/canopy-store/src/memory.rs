//! In-process coordination store.
//!
//! [`InMemoryEnsemble`] holds a single node tree shared by any number of
//! [`InMemorySession`]s, each standing in for one process's session. It
//! implements the full [`CoordinationStore`] contract: ephemeral and
//! sequential nodes, versioned writes, one-shot node/subtree watches and
//! connection-state transitions. Sessions can be suspended, expired,
//! recovered and fed transient failures, which makes the ensemble the test
//! bed for every primitive built on top of it.
//!
//! # Example
//!
//! ```ignore
//! let ensemble = InMemoryEnsemble::new();
//! let a = ensemble.connect();
//! let b = ensemble.connect();
//!
//! a.create("/members", vec![], NodeKind::Persistent).await?;
//! a.create("/members/a", vec![], NodeKind::Ephemeral).await?;
//!
//! let watch = b.watch("/members", WatchMode::Subtree).await?;
//! a.expire();
//! assert_eq!(watch.fired().await?.kind, ChangeKind::Deleted);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::CoordinationStore;
use crate::types::ChangeEvent;
use crate::types::ChangeKind;
use crate::types::ConnectionState;
use crate::types::NodeData;
use crate::types::NodeKind;
use crate::types::Stat;
use crate::types::WatchMode;
use crate::types::is_at_or_below;
use crate::types::parent_path;
use crate::types::validate_path;
use crate::watch::Watch;
use crate::watch::WatchSender;

/// Capacity of each session's connection-event channel.
const CONNECTION_EVENT_CAPACITY: usize = 64;

/// Width of the zero-padded suffix appended to sequential nodes.
const SEQUENCE_WIDTH: usize = 10;

struct NodeEntry {
    data: Vec<u8>,
    version: u32,
    kind: NodeKind,
    owner: Option<u64>,
    /// Next suffix handed to a sequential child of this node.
    next_sequence: u64,
}

struct WatchRegistration {
    session_id: u64,
    path: String,
    mode: WatchMode,
    tx: WatchSender,
}

impl WatchRegistration {
    fn matches(&self, event: &ChangeEvent) -> bool {
        match self.mode {
            WatchMode::Node => event.path == self.path,
            WatchMode::Subtree => is_at_or_below(&event.path, &self.path),
        }
    }
}

type Fired = Vec<(WatchSender, Result<ChangeEvent, StoreError>)>;

struct Tree {
    nodes: BTreeMap<String, NodeEntry>,
    watches: Vec<WatchRegistration>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), NodeEntry {
            data: Vec::new(),
            version: 0,
            kind: NodeKind::Persistent,
            owner: None,
            next_sequence: 0,
        });
        Self {
            nodes,
            watches: Vec::new(),
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, path: &str, entry: &NodeEntry) -> Stat {
        Stat {
            version: entry.version,
            ephemeral_owner: entry.owner,
            num_children: self.child_names(path).len() as u32,
        }
    }

    /// Remove and return every live registration matching one of `events`.
    fn take_fired(&mut self, events: &[ChangeEvent]) -> Fired {
        let mut fired = Vec::new();
        let mut kept = Vec::with_capacity(self.watches.len());
        for registration in self.watches.drain(..) {
            if registration.tx.is_closed() {
                continue;
            }
            match events.iter().find(|event| registration.matches(event)) {
                Some(event) => fired.push((registration.tx, Ok(event.clone()))),
                None => kept.push(registration),
            }
        }
        self.watches = kept;
        fired
    }

    /// Drop a session's ephemeral nodes and watches.
    fn end_session(&mut self, session_id: u64, reason: StoreError) -> Fired {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        let events: Vec<ChangeEvent> = owned
            .into_iter()
            .map(|path| {
                self.nodes.remove(&path);
                ChangeEvent {
                    path,
                    kind: ChangeKind::Deleted,
                }
            })
            .collect();

        let mut fired = Vec::new();
        let (own, others): (Vec<_>, Vec<_>) =
            self.watches.drain(..).partition(|registration| registration.session_id == session_id);
        self.watches = others;
        for registration in own {
            fired.push((registration.tx, Err(reason.clone())));
        }
        fired.extend(self.take_fired(&events));
        fired
    }
}

fn deliver(fired: Fired) {
    for (tx, result) in fired {
        // Receiver may have been dropped; that is an unregistration.
        let _ = tx.send(result);
    }
}

struct EnsembleInner {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
}

/// Shared node tree backing a set of simulated sessions.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self {
            inner: Arc::new(EnsembleInner {
                tree: Mutex::new(Tree::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }
}

impl InMemoryEnsemble {
    /// Create an empty ensemble containing only the root node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against this ensemble.
    pub fn connect(&self) -> Arc<InMemorySession> {
        let session_id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        debug!(session_id, "in-memory session connected");
        Arc::new(InMemorySession {
            ensemble: self.inner.clone(),
            session_id: AtomicU64::new(session_id),
            state: Mutex::new(ConnectionState::Connected),
            events,
            fail_next: AtomicU32::new(0),
            lose_replies: AtomicU32::new(0),
        })
    }

    /// Every path at or below `prefix`, in order.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let tree = self.inner.tree.lock();
        tree.nodes.keys().filter(|path| is_at_or_below(path, prefix)).cloned().collect()
    }

    /// Number of registered watches that are still live.
    pub fn live_watch_count(&self) -> usize {
        let tree = self.inner.tree.lock();
        tree.watches.iter().filter(|registration| !registration.tx.is_closed()).count()
    }
}

/// One simulated process session.
pub struct InMemorySession {
    ensemble: Arc<EnsembleInner>,
    session_id: AtomicU64,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionState>,
    fail_next: AtomicU32,
    lose_replies: AtomicU32,
}

impl InMemorySession {
    /// Interrupt the connection. The session and its ephemeral nodes survive;
    /// operations fail with [`StoreError::ConnectionLost`] until `resume`.
    pub fn suspend(&self) {
        if self.transition(|state| state.is_connected(), ConnectionState::Suspended) {
            debug!(session_id = self.session_id(), "in-memory session suspended");
        }
    }

    /// Restore a suspended connection with the same session.
    pub fn resume(&self) {
        if self.transition(|state| state == ConnectionState::Suspended, ConnectionState::Reconnected) {
            debug!(session_id = self.session_id(), "in-memory session resumed");
        }
    }

    /// Expire the session: its ephemeral nodes are deleted and its watches
    /// fail with [`StoreError::SessionExpired`].
    pub fn expire(&self) {
        let session_id = self.session_id();
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Lost | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Lost;
        }
        let fired = self.ensemble.tree.lock().end_session(session_id, StoreError::SessionExpired { session_id });
        deliver(fired);
        debug!(session_id, "in-memory session expired");
        let _ = self.events.send(ConnectionState::Lost);
    }

    /// Re-establish a connection after expiry or suspension. An expired
    /// session is replaced with a fresh one.
    pub fn recover(&self) {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Lost => {
                let fresh = self.ensemble.next_session.fetch_add(1, Ordering::SeqCst);
                self.session_id.store(fresh, Ordering::SeqCst);
                *state = ConnectionState::Reconnected;
                debug!(session_id = fresh, "in-memory session recovered with new session");
            }
            ConnectionState::Suspended => {
                *state = ConnectionState::Reconnected;
            }
            _ => return,
        }
        drop(state);
        let _ = self.events.send(ConnectionState::Reconnected);
    }

    /// Make the next `count` operations fail with [`StoreError::ConnectionLost`]
    /// without changing the connection state.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` creates, writes or deletes, then report
    /// [`StoreError::ConnectionLost`] as if the reply had been lost.
    pub fn lose_next_replies(&self, count: u32) {
        self.lose_replies.store(count, Ordering::SeqCst);
    }

    /// Reply to an applied mutation, unless a lost reply was injected.
    fn reply<T>(&self, value: T) -> Result<T, StoreError> {
        let lost = self
            .lose_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            debug!(session_id = self.session_id(), "in-memory reply dropped after apply");
            return Err(StoreError::ConnectionLost);
        }
        Ok(value)
    }

    fn transition(&self, allowed: impl Fn(ConnectionState) -> bool, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if !allowed(*state) {
            return false;
        }
        *state = next;
        drop(state);
        let _ = self.events.send(next);
        true
    }

    /// Admission check run before every operation.
    fn admit(&self) -> Result<u64, StoreError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::ConnectionLost);
        }
        match *self.state.lock() {
            ConnectionState::Connected | ConnectionState::Reconnected => Ok(self.session_id()),
            ConnectionState::Suspended => Err(StoreError::ConnectionLost),
            ConnectionState::Lost => Err(StoreError::SessionExpired {
                session_id: self.session_id(),
            }),
            ConnectionState::Closed => Err(StoreError::Closed),
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemorySession {
    async fn create(&self, path: &str, data: Vec<u8>, kind: NodeKind) -> Result<String, StoreError> {
        let session_id = self.admit()?;
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| StoreError::InvalidPath {
            path: path.to_string(),
            reason: "cannot create the root".to_string(),
        })?;

        let mut tree = self.ensemble.tree.lock();
        let parent_entry = tree.nodes.get_mut(parent).ok_or_else(|| StoreError::NoNode {
            path: parent.to_string(),
        })?;
        if parent_entry.kind.is_ephemeral() {
            return Err(StoreError::NoChildrenForEphemerals {
                path: parent.to_string(),
            });
        }
        let actual = if kind.is_sequential() {
            let sequence = parent_entry.next_sequence;
            parent_entry.next_sequence += 1;
            format!("{path}{sequence:0width$}", width = SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };
        if tree.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists { path: actual });
        }
        tree.nodes.insert(actual.clone(), NodeEntry {
            data,
            version: 0,
            kind,
            owner: kind.is_ephemeral().then_some(session_id),
            next_sequence: 0,
        });
        let fired = tree.take_fired(&[ChangeEvent {
            path: actual.clone(),
            kind: ChangeKind::Created,
        }]);
        drop(tree);
        deliver(fired);
        self.reply(actual)
    }

    async fn read(&self, path: &str) -> Result<NodeData, StoreError> {
        self.admit()?;
        validate_path(path)?;
        let tree = self.ensemble.tree.lock();
        let entry = tree.nodes.get(path).ok_or_else(|| StoreError::NoNode { path: path.to_string() })?;
        Ok(NodeData {
            data: entry.data.clone(),
            stat: tree.stat(path, entry),
        })
    }

    async fn write(&self, path: &str, data: Vec<u8>, expected_version: Option<u32>) -> Result<u32, StoreError> {
        self.admit()?;
        validate_path(path)?;
        let mut tree = self.ensemble.tree.lock();
        let entry = tree.nodes.get_mut(path).ok_or_else(|| StoreError::NoNode { path: path.to_string() })?;
        if let Some(expected) = expected_version
            && expected != entry.version
        {
            return Err(StoreError::VersionMismatch {
                path: path.to_string(),
                expected,
                actual: entry.version,
            });
        }
        entry.data = data;
        entry.version = entry.version.wrapping_add(1);
        let version = entry.version;
        let fired = tree.take_fired(&[ChangeEvent {
            path: path.to_string(),
            kind: ChangeKind::DataChanged,
        }]);
        drop(tree);
        deliver(fired);
        self.reply(version)
    }

    async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<(), StoreError> {
        self.admit()?;
        validate_path(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: "cannot delete the root".to_string(),
            });
        }
        let mut tree = self.ensemble.tree.lock();
        let entry = tree.nodes.get(path).ok_or_else(|| StoreError::NoNode { path: path.to_string() })?;
        if let Some(expected) = expected_version
            && expected != entry.version
        {
            return Err(StoreError::VersionMismatch {
                path: path.to_string(),
                expected,
                actual: entry.version,
            });
        }
        if !tree.child_names(path).is_empty() {
            return Err(StoreError::NotEmpty { path: path.to_string() });
        }
        tree.nodes.remove(path);
        let fired = tree.take_fired(&[ChangeEvent {
            path: path.to_string(),
            kind: ChangeKind::Deleted,
        }]);
        drop(tree);
        deliver(fired);
        self.reply(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.admit()?;
        validate_path(path)?;
        let tree = self.ensemble.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode { path: path.to_string() });
        }
        Ok(tree.child_names(path))
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, StoreError> {
        self.admit()?;
        validate_path(path)?;
        let tree = self.ensemble.tree.lock();
        Ok(tree.nodes.get(path).map(|entry| tree.stat(path, entry)))
    }

    async fn watch(&self, path: &str, mode: WatchMode) -> Result<Watch, StoreError> {
        let session_id = self.admit()?;
        validate_path(path)?;
        let (tx, watch) = Watch::channel(path, mode);
        self.ensemble.tree.lock().watches.push(WatchRegistration {
            session_id,
            path: path.to_string(),
            mode,
            tx,
        });
        Ok(watch)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), StoreError> {
        let session_id = self.session_id();
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return Ok(());
            }
            *state = ConnectionState::Closed;
        }
        let fired = self.ensemble.tree.lock().end_session(session_id, StoreError::Closed);
        deliver(fired);
        debug!(session_id, "in-memory session closed");
        let _ = self.events.send(ConnectionState::Closed);
        Ok(())
    }
}
