//! Cluster manager: one process's entry point to every coordination primitive.

use std::sync::Arc;
use std::time::Duration;

use canopy_coordination::AsyncMap;
use canopy_coordination::AsyncMultiMap;
use canopy_coordination::CoordinationClient;
use canopy_coordination::CoordinationError;
use canopy_coordination::DistributedCounter;
use canopy_coordination::LockGuard;
use canopy_coordination::LockManager;
use canopy_coordination::MembershipEvent;
use canopy_coordination::MembershipRegistry;
use canopy_coordination::MembershipState;
use canopy_coordination::NodeInfo;
use canopy_coordination::NodeListener;
use canopy_coordination::RetryPolicy;
use canopy_store::ConnectionState;
use canopy_store::CoordinationStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ClusterConfig;
use crate::config::ConfigError;

/// Ties a store session, a configuration and a node identity together.
pub struct ClusterManager<S: CoordinationStore + ?Sized + 'static> {
    config: ClusterConfig,
    node_id: String,
    client: Arc<CoordinationClient<S>>,
    membership: MembershipRegistry<S>,
    locks: LockManager<S>,
}

impl<S: CoordinationStore + ?Sized + 'static> ClusterManager<S> {
    /// Build a manager over an established store session. The node id comes
    /// from the configuration or is a fresh UUID.
    pub fn new(store: Arc<S>, config: ClusterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let namespace = config.namespace()?;
        let node_id = config.node_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let retry = RetryPolicy::new(&config.retry).with_attempt_timeout(config.connection_timeout());
        let client = Arc::new(CoordinationClient::new(store, namespace, retry));
        let membership = MembershipRegistry::new(Arc::clone(&client), node_id.clone(), config.session_loss_policy);
        let locks = LockManager::new(Arc::clone(&client), node_id.clone());
        Ok(Self {
            config,
            node_id,
            client,
            membership,
            locks,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<CoordinationClient<S>> {
        &self.client
    }

    pub fn membership(&self) -> &MembershipRegistry<S> {
        &self.membership
    }

    /// Prepare the namespace layout and register this node.
    pub async fn join(&self) -> Result<(), CoordinationError> {
        self.client.open().await?;
        self.membership.join().await?;
        info!(node_id = %self.node_id, hosts = %self.config.hosts, root = %self.client.namespace().root(), "cluster manager joined");
        Ok(())
    }

    /// Deregister and close the session. Locks held through this manager
    /// are released by the session ending.
    pub async fn leave(&self) -> Result<(), CoordinationError> {
        self.membership.leave().await?;
        self.client.close().await?;
        info!(node_id = %self.node_id, "cluster manager left");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.membership.is_active()
    }

    pub fn nodes(&self) -> Vec<String> {
        self.membership.nodes()
    }

    pub async fn node_info(&self, node_id: &str) -> Result<Option<NodeInfo>, CoordinationError> {
        self.membership.node_info(node_id).await
    }

    pub fn node_listener(&self, listener: Arc<dyn NodeListener>) {
        self.membership.add_listener(listener);
    }

    pub fn membership_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership.subscribe_events()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.client.connection_events()
    }

    fn ensure_member(&self) -> Result<(), CoordinationError> {
        match self.membership.state() {
            MembershipState::Active | MembershipState::Suspended | MembershipState::Joining => Ok(()),
            state => Err(CoordinationError::NotMember {
                reason: format!("node {} is {state:?}", self.node_id),
            }),
        }
    }

    pub fn async_map<K, V>(&self, name: &str) -> AsyncMap<S, K, V>
    where
        K: Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        AsyncMap::new(Arc::clone(&self.client), name)
    }

    pub fn async_multimap<K, V>(&self, name: &str) -> AsyncMultiMap<S, K, V>
    where
        K: Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        AsyncMultiMap::new(Arc::clone(&self.client), name)
    }

    /// Acquire a cluster-wide lock, waiting at most `timeout`.
    pub async fn lock_with_timeout(&self, name: &str, timeout: Duration) -> Result<LockGuard<S>, CoordinationError> {
        self.ensure_member()?;
        self.locks.acquire(name, timeout).await
    }

    pub fn counter(&self, name: &str) -> DistributedCounter<S> {
        DistributedCounter::new(Arc::clone(&self.client), name)
    }
}
