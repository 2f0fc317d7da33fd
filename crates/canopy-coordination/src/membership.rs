//! Cluster membership registry.
//!
//! Each process registers an ephemeral node under the cluster nodes path.
//! The registry keeps a local view of the member set, diffs it against the
//! store after every change notification, and reports joins and departures
//! of other nodes to subscribers and listeners.
//!
//! While the connection is suspended the view is frozen and no events are
//! emitted. After the session is lost the registry re-registers this node
//! on reconnect and rebuilds the view, emitting the net difference.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use canopy_store::ChangeEvent;
use canopy_store::ConnectionState;
use canopy_store::CoordinationStore;
use canopy_store::NodeKind;
use canopy_store::WatchMode;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::CoordinationClient;
use crate::constants::MEMBERSHIP_EVENT_CAPACITY;
use crate::error::CoordinationError;
use crate::paths::unescape_segment;
use crate::subscription::Subscription;
use crate::types::now_unix_ms;

/// Payload stored in a membership node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub joined_at_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// How a suspended connection is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLossPolicy {
    /// Only an expired session forces re-registration; suspension just
    /// freezes the view.
    #[default]
    Expired,
    /// Suspension is handled like expiry: on reconnect this node
    /// re-registers and the view is rebuilt.
    Suspended,
}

impl SessionLossPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLossPolicy::Expired => "expired",
            SessionLossPolicy::Suspended => "suspended",
        }
    }
}

impl FromStr for SessionLossPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "expired" | "lost" => Ok(SessionLossPolicy::Expired),
            "suspended" => Ok(SessionLossPolicy::Suspended),
            other => Err(format!("unknown session loss policy '{other}', expected 'expired' or 'suspended'")),
        }
    }
}

impl fmt::Display for SessionLossPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the local registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipState {
    Joining,
    Active,
    /// Connection interrupted; the view is frozen.
    Suspended,
    Leaving,
    Left,
}

/// Change in the member set, reported for nodes other than this one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

impl MembershipEvent {
    pub fn node_id(&self) -> &str {
        match self {
            MembershipEvent::Joined(id) | MembershipEvent::Left(id) => id,
        }
    }
}

/// Callback interface for membership changes.
///
/// Callbacks run on the registry's task. A panicking listener is logged and
/// does not affect other listeners or the registry.
pub trait NodeListener: Send + Sync {
    fn node_added(&self, node_id: &str);
    fn node_left(&self, node_id: &str);
}

struct RegistryInner<S: CoordinationStore + ?Sized> {
    client: Arc<CoordinationClient<S>>,
    node_id: String,
    metadata: BTreeMap<String, String>,
    policy: SessionLossPolicy,
    state: watch::Sender<MembershipState>,
    view: RwLock<BTreeSet<String>>,
    events: broadcast::Sender<MembershipEvent>,
    listeners: RwLock<Vec<Arc<dyn NodeListener>>>,
}

/// Membership of one process in the cluster.
pub struct MembershipRegistry<S: CoordinationStore + ?Sized + 'static> {
    inner: Arc<RegistryInner<S>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<S: CoordinationStore + ?Sized + 'static> MembershipRegistry<S> {
    pub fn new(client: Arc<CoordinationClient<S>>, node_id: impl Into<String>, policy: SessionLossPolicy) -> Self {
        Self::with_metadata(client, node_id, policy, BTreeMap::new())
    }

    /// Registry whose membership node also carries `metadata`.
    pub fn with_metadata(
        client: Arc<CoordinationClient<S>>,
        node_id: impl Into<String>,
        policy: SessionLossPolicy,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let (state, _) = watch::channel(MembershipState::Left);
        let (events, _) = broadcast::channel(MEMBERSHIP_EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                client,
                node_id: node_id.into(),
                metadata,
                policy,
                state,
                view: RwLock::new(BTreeSet::new()),
                events,
                listeners: RwLock::new(Vec::new()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn policy(&self) -> SessionLossPolicy {
        self.inner.policy
    }

    pub fn state(&self) -> MembershipState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == MembershipState::Active
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<MembershipState> {
        self.inner.state.subscribe()
    }

    /// Current member set, including this node once it has joined.
    pub fn nodes(&self) -> Vec<String> {
        self.inner.view.read().iter().cloned().collect()
    }

    /// Stream of join and leave events for other nodes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn NodeListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Payload of a member's node, or `None` if it is not registered.
    pub async fn node_info(&self, node_id: &str) -> Result<Option<NodeInfo>, CoordinationError> {
        let path = self.inner.client.namespace().node_path(node_id);
        match self.inner.client.read_opt(&path).await? {
            None => Ok(None),
            Some(node) => serde_json::from_slice(&node.data).map(Some).map_err(|e| CoordinationError::CorruptedData {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Register this node and start tracking the member set.
    ///
    /// Returns once the node is registered and the initial view is loaded.
    /// The initial view produces no events. Joining twice is a no-op.
    pub async fn join(&self) -> Result<(), CoordinationError> {
        match self.state() {
            MembershipState::Joining | MembershipState::Active | MembershipState::Suspended => return Ok(()),
            MembershipState::Leaving | MembershipState::Left => {}
        }
        self.inner.set_state(MembershipState::Joining);
        match self.start().await {
            Ok(()) => {
                info!(node_id = %self.inner.node_id, members = self.inner.view.read().len(), "joined cluster");
                Ok(())
            }
            Err(err) => {
                self.inner.set_state(MembershipState::Left);
                Err(err)
            }
        }
    }

    async fn start(&self) -> Result<(), CoordinationError> {
        let connection = self.inner.client.connection_events();
        self.inner.register_self().await?;
        let nodes_path = self.inner.client.namespace().nodes_path();
        let loaded = async {
            let subscription = self.inner.client.subscribe(&nodes_path, WatchMode::Subtree).await?;
            let members = self.inner.list_members().await?;
            Ok::<_, CoordinationError>((subscription, members))
        }
        .await;
        let (subscription, members) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                let own = self.inner.client.namespace().node_path(&self.inner.node_id);
                if let Err(cleanup) = self.inner.client.delete_if_exists(&own, None).await {
                    debug!(node_id = %self.inner.node_id, error = %cleanup, "could not remove node after failed join");
                }
                return Err(err);
            }
        };
        *self.inner.view.write() = members;
        self.inner.set_state(MembershipState::Active);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.inner).run(subscription, connection, cancel.clone()));
        if let Some((previous, _)) = self.task.lock().replace((cancel, handle)) {
            previous.cancel();
        }
        Ok(())
    }

    /// Deregister this node. After this returns no further events are
    /// emitted. Leaving twice is a no-op.
    pub async fn leave(&self) -> Result<(), CoordinationError> {
        if self.state() == MembershipState::Left {
            return Ok(());
        }
        self.inner.set_state(MembershipState::Leaving);
        let task = self.task.lock().take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = handle.await;
        }
        let path = self.inner.client.namespace().node_path(&self.inner.node_id);
        let result = match self.inner.client.delete_if_exists(&path, None).await {
            Ok(_) => Ok(()),
            // The node went away with the session.
            Err(err) if err.is_session_fatal() => Ok(()),
            Err(err) => Err(err),
        };
        self.inner.view.write().clear();
        self.inner.set_state(MembershipState::Left);
        info!(node_id = %self.inner.node_id, "left cluster");
        result
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for MembershipRegistry<S> {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.task.get_mut().take() {
            cancel.cancel();
        }
    }
}

impl<S: CoordinationStore + ?Sized + 'static> RegistryInner<S> {
    fn set_state(&self, next: MembershipState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(node_id = %self.node_id, ?previous, ?next, "membership state changed");
        }
    }

    fn state(&self) -> MembershipState {
        *self.state.borrow()
    }

    /// Create this process's ephemeral node. A node left over from the same
    /// session counts as registered.
    async fn register_self(&self) -> Result<(), CoordinationError> {
        let path = self.client.namespace().node_path(&self.node_id);
        let info = NodeInfo {
            node_id: self.node_id.clone(),
            joined_at_ms: now_unix_ms(),
            metadata: self.metadata.clone(),
        };
        let payload = serde_json::to_vec(&info)?;
        for _ in 0..3 {
            match self.client.create_with_parents(&path, payload.clone(), NodeKind::Ephemeral).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_node_exists() => match self.client.exists(&path).await? {
                    Some(stat) if stat.ephemeral_owner == Some(self.client.session_id()) => return Ok(()),
                    Some(_) => return Err(CoordinationError::NodeExists { path }),
                    None => continue,
                },
                Err(err) => return Err(err),
            }
        }
        Err(CoordinationError::Contention { path, attempts: 3 })
    }

    async fn list_members(&self) -> Result<BTreeSet<String>, CoordinationError> {
        let nodes_path = self.client.namespace().nodes_path();
        let names = self.client.children_or_empty(&nodes_path).await?;
        Ok(names
            .iter()
            .filter_map(|name| {
                let id = unescape_segment(name);
                if id.is_none() {
                    warn!(name = %name, "ignoring unparseable membership node");
                }
                id
            })
            .collect())
    }

    /// Reload the member set and report the difference to the previous view.
    async fn sync(&self) -> Result<(), CoordinationError> {
        let current = self.list_members().await?;
        let (joined, left) = {
            let mut view = self.view.write();
            let joined: Vec<String> = current.difference(&view).cloned().collect();
            let left: Vec<String> = view.difference(&current).cloned().collect();
            *view = current;
            (joined, left)
        };
        for id in joined {
            self.emit(MembershipEvent::Joined(id));
        }
        for id in left {
            self.emit(MembershipEvent::Left(id));
        }
        Ok(())
    }

    fn emit(&self, event: MembershipEvent) {
        if event.node_id() == self.node_id {
            return;
        }
        info!(node_id = %self.node_id, ?event, "membership changed");
        let _ = self.events.send(event.clone());
        let listeners: Vec<Arc<dyn NodeListener>> = self.listeners.read().clone();
        for listener in listeners {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match &event {
                MembershipEvent::Joined(id) => listener.node_added(id),
                MembershipEvent::Left(id) => listener.node_left(id),
            }));
            if outcome.is_err() {
                warn!(node_id = %self.node_id, ?event, "node listener panicked");
            }
        }
    }

    /// Re-register if needed, watch again and rebuild the view.
    async fn resync(self: &Arc<Self>, reregister: bool) -> Result<Subscription, CoordinationError> {
        if reregister {
            self.register_self().await?;
        }
        let nodes_path = self.client.namespace().nodes_path();
        let subscription = self.client.subscribe(&nodes_path, WatchMode::Subtree).await?;
        self.sync().await?;
        self.set_state(MembershipState::Active);
        Ok(subscription)
    }

    async fn run(
        self: Arc<Self>,
        subscription: Subscription,
        mut connection: broadcast::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        let mut subscription = Some(subscription);
        let mut session_lost = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = next_change(&mut subscription) => match change {
                    Some(change) => {
                        if self.state() == MembershipState::Active
                            && let Err(err) = self.sync().await
                        {
                            warn!(node_id = %self.node_id, path = %change.path, error = %err, "membership sync failed");
                        }
                    }
                    None => {
                        subscription = None;
                        if self.client.connection_state().is_connected() && self.state() == MembershipState::Active {
                            subscription = self.try_resync(false).await;
                        }
                    }
                },
                transition = connection.recv() => match transition {
                    Ok(ConnectionState::Suspended) => {
                        self.set_state(MembershipState::Suspended);
                        if self.policy == SessionLossPolicy::Suspended {
                            session_lost = true;
                        }
                    }
                    Ok(ConnectionState::Lost) => {
                        warn!(node_id = %self.node_id, "coordination session lost, membership will be rebuilt");
                        self.set_state(MembershipState::Suspended);
                        session_lost = true;
                        subscription = None;
                    }
                    Ok(ConnectionState::Connected | ConnectionState::Reconnected) => {
                        if let Some(fresh) = self.try_resync(session_lost).await {
                            subscription = Some(fresh);
                            session_lost = false;
                        }
                    }
                    Ok(ConnectionState::Closed) | Err(RecvError::Closed) => {
                        self.view.write().clear();
                        self.set_state(MembershipState::Left);
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(node_id = %self.node_id, skipped, "missed connection transitions");
                        if self.client.connection_state().is_connected()
                            && let Some(fresh) = self.try_resync(true).await
                        {
                            subscription = Some(fresh);
                            session_lost = false;
                        }
                    }
                },
            }
        }
        debug!(node_id = %self.node_id, "membership task stopped");
    }

    async fn try_resync(self: &Arc<Self>, reregister: bool) -> Option<Subscription> {
        match self.resync(reregister).await {
            Ok(subscription) => {
                info!(node_id = %self.node_id, reregister, "membership view rebuilt");
                Some(subscription)
            }
            Err(err) => {
                warn!(node_id = %self.node_id, error = %err, "membership rebuild failed, waiting for next transition");
                None
            }
        }
    }
}

async fn next_change(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use canopy_store::InMemoryEnsemble;
    use canopy_store::InMemorySession;

    use super::*;
    use crate::paths::PathNamespace;
    use crate::retry::RetryConfig;
    use crate::retry::RetryPolicy;

    fn registry(ensemble: &InMemoryEnsemble, id: &str) -> MembershipRegistry<InMemorySession> {
        let retry = RetryPolicy::new(&RetryConfig {
            initial_sleep_ms: 5,
            max_retries: 2,
            max_sleep_ms: 20,
        });
        let client = Arc::new(CoordinationClient::new(ensemble.connect(), PathNamespace::new("canopy").unwrap(), retry));
        MembershipRegistry::new(client, id, SessionLossPolicy::Expired)
    }

    async fn next_event(rx: &mut broadcast::Receiver<MembershipEvent>) -> MembershipEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn loss_policy_parses() {
        assert_eq!("expired".parse::<SessionLossPolicy>().unwrap(), SessionLossPolicy::Expired);
        assert_eq!("Suspended".parse::<SessionLossPolicy>().unwrap(), SessionLossPolicy::Suspended);
        assert!("sometimes".parse::<SessionLossPolicy>().is_err());
    }

    #[tokio::test]
    async fn join_sees_existing_members_without_events() {
        let ensemble = InMemoryEnsemble::new();
        let a = registry(&ensemble, "a");
        a.join().await.unwrap();
        assert!(a.is_active());
        assert_eq!(a.nodes(), vec!["a".to_string()]);

        let b = registry(&ensemble, "b");
        let mut b_events = b.subscribe_events();
        b.join().await.unwrap();
        assert_eq!(b.nodes(), vec!["a".to_string(), "b".to_string()]);
        assert!(b_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn joins_and_leaves_are_reported() {
        let ensemble = InMemoryEnsemble::new();
        let a = registry(&ensemble, "a");
        a.join().await.unwrap();
        let mut events = a.subscribe_events();

        let b = registry(&ensemble, "b");
        b.join().await.unwrap();
        assert_eq!(next_event(&mut events).await, MembershipEvent::Joined("b".into()));

        b.leave().await.unwrap();
        assert_eq!(next_event(&mut events).await, MembershipEvent::Left("b".into()));
        assert_eq!(b.state(), MembershipState::Left);
        assert_eq!(a.nodes(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_node_id_is_rejected() {
        let ensemble = InMemoryEnsemble::new();
        let first = registry(&ensemble, "same");
        first.join().await.unwrap();
        let second = registry(&ensemble, "same");
        assert!(second.join().await.unwrap_err().is_node_exists());
        assert_eq!(second.state(), MembershipState::Left);
    }

    struct Counting(AtomicUsize);

    impl NodeListener for Counting {
        fn node_added(&self, _node_id: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn node_left(&self, _node_id: &str) {}
    }

    struct Panicking;

    impl NodeListener for Panicking {
        fn node_added(&self, _node_id: &str) {
            panic!("listener failure");
        }

        fn node_left(&self, _node_id: &str) {}
    }

    #[tokio::test]
    async fn panicking_listener_is_isolated() {
        let ensemble = InMemoryEnsemble::new();
        let a = registry(&ensemble, "a");
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        a.add_listener(Arc::new(Panicking));
        a.add_listener(counting.clone());
        a.join().await.unwrap();
        let mut events = a.subscribe_events();

        let b = registry(&ensemble, "b");
        b.join().await.unwrap();
        next_event(&mut events).await;
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert!(a.is_active());
    }
}
