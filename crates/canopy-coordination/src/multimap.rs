//! Cluster-wide multimap: each key maps to a set of values.
//!
//! A key is a persistent node (named by the key hash, payload = serialized
//! key) whose children are the values (named by the value hash, payload =
//! serialized value). Values may be persistent or ephemeral; ephemeral
//! values vanish with the session that added them, which is how event-bus
//! style subscriber registries clean up after crashed processes.

use std::marker::PhantomData;
use std::sync::Arc;

use canopy_store::CoordinationStore;
use canopy_store::NodeKind;
use canopy_store::StoreError;
use canopy_store::WatchMode;
use canopy_store::join_path;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::client::CoordinationClient;
use crate::constants::MAX_CAS_RETRIES;
use crate::error::CoordinationError;
use crate::paths::hash_segment;

/// Lifetime of an added value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntryLifetime {
    #[default]
    Persistent,
    /// Removed automatically when the adding session ends.
    Ephemeral,
}

impl EntryLifetime {
    fn node_kind(self) -> NodeKind {
        match self {
            EntryLifetime::Persistent => NodeKind::Persistent,
            EntryLifetime::Ephemeral => NodeKind::Ephemeral,
        }
    }
}

/// Multimap shared by every process using the same name.
pub struct AsyncMultiMap<S, K, V>
where
    S: CoordinationStore + ?Sized + 'static,
{
    client: Arc<CoordinationClient<S>>,
    name: String,
    path: String,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> AsyncMultiMap<S, K, V>
where
    S: CoordinationStore + ?Sized + 'static,
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(client: Arc<CoordinationClient<S>>, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = client.namespace().multimap_path(&name);
        Self {
            client,
            name,
            path,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key_path(&self, key: &K) -> Result<(String, Vec<u8>), CoordinationError> {
        let key_bytes = serde_json::to_vec(key)?;
        let path = self.client.namespace().multimap_key_path(&self.name, &key_bytes);
        Ok((path, key_bytes))
    }

    /// Add a persistent value. Returns false if it was already present.
    pub async fn add(&self, key: &K, value: &V) -> Result<bool, CoordinationError> {
        self.add_with(key, value, EntryLifetime::Persistent).await
    }

    /// Add a value owned by this session.
    pub async fn add_ephemeral(&self, key: &K, value: &V) -> Result<bool, CoordinationError> {
        self.add_with(key, value, EntryLifetime::Ephemeral).await
    }

    pub async fn add_with(&self, key: &K, value: &V, lifetime: EntryLifetime) -> Result<bool, CoordinationError> {
        let (key_path, key_bytes) = self.key_path(key)?;
        let value_bytes = serde_json::to_vec(value)?;
        let value_path = join_path(&key_path, &hash_segment(&value_bytes));
        for _ in 0..MAX_CAS_RETRIES {
            match self.client.create_with_parents(&key_path, key_bytes.clone(), NodeKind::Persistent).await {
                Ok(_) => {}
                Err(err) if err.is_node_exists() => {}
                Err(err) => return Err(err),
            }
            match self.client.create(&value_path, value_bytes.clone(), lifetime.node_kind()).await {
                Ok(_) => return Ok(true),
                Err(err) if err.is_node_exists() => return Ok(false),
                // Key node was pruned between the two creates.
                Err(err) if err.is_no_node() => debug!(multimap = %self.name, "key node vanished, retrying add"),
                Err(err) => return Err(err),
            }
        }
        Err(CoordinationError::Contention {
            path: value_path,
            attempts: MAX_CAS_RETRIES,
        })
    }

    /// Remove one value. Returns whether it was present.
    pub async fn remove(&self, key: &K, value: &V) -> Result<bool, CoordinationError> {
        let (key_path, _) = self.key_path(key)?;
        let value_bytes = serde_json::to_vec(value)?;
        let removed = self
            .client
            .delete_if_exists(&join_path(&key_path, &hash_segment(&value_bytes)), None)
            .await?;
        self.prune_key(&key_path).await?;
        Ok(removed)
    }

    /// Remove `value` under every key. Returns the number of removals.
    pub async fn remove_all_for_value(&self, value: &V) -> Result<usize, CoordinationError> {
        let value_hash = hash_segment(&serde_json::to_vec(value)?);
        let mut removed = 0;
        for key_hash in self.client.children_or_empty(&self.path).await? {
            let key_path = join_path(&self.path, &key_hash);
            if self.client.delete_if_exists(&join_path(&key_path, &value_hash), None).await? {
                removed += 1;
                self.prune_key(&key_path).await?;
            }
        }
        Ok(removed)
    }

    /// Drop the key node if it has no values left. Losing to a concurrent
    /// add or remove is fine.
    async fn prune_key(&self, key_path: &str) -> Result<(), CoordinationError> {
        match self.client.delete(key_path, None).await {
            Ok(()) => Ok(()),
            Err(CoordinationError::Store {
                source: StoreError::NotEmpty { .. },
            }) => Ok(()),
            Err(err) if err.is_no_node() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Every value currently stored under `key`.
    pub async fn get(&self, key: &K) -> Result<Vec<V>, CoordinationError> {
        let (key_path, _) = self.key_path(key)?;
        load_values(&self.client, &key_path).await
    }

    pub async fn contains(&self, key: &K, value: &V) -> Result<bool, CoordinationError> {
        let (key_path, _) = self.key_path(key)?;
        let value_bytes = serde_json::to_vec(value)?;
        Ok(self.client.exists(&join_path(&key_path, &hash_segment(&value_bytes))).await?.is_some())
    }

    /// Every key with at least one value.
    pub async fn keys(&self) -> Result<Vec<K>, CoordinationError> {
        let mut keys = Vec::new();
        for key_hash in self.client.children_or_empty(&self.path).await? {
            let key_path = join_path(&self.path, &key_hash);
            let Some(stat) = self.client.exists(&key_path).await? else {
                continue;
            };
            if stat.num_children == 0 {
                continue;
            }
            let Some(node) = self.client.read_opt(&key_path).await? else {
                continue;
            };
            keys.push(decode(&key_path, &node.data)?);
        }
        Ok(keys)
    }

    /// Live view of the values under `key`, refreshed on every change.
    pub async fn track(&self, key: &K) -> Result<SubscriberTracker<V>, CoordinationError>
    where
        V: Clone,
    {
        let (key_path, _) = self.key_path(key)?;
        let mut subscription = self.client.subscribe(&key_path, WatchMode::Subtree).await?;
        let initial = load_values::<S, V>(&self.client, &key_path).await?;
        let (tx, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let client = Arc::clone(&self.client);
        let multimap = self.name.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = token.cancelled() => break,
                    change = subscription.next() => change,
                };
                if change.is_none() {
                    debug!(multimap = %multimap, key = %key_path, "tracker stream ended");
                    break;
                }
                match load_values::<S, V>(&client, &key_path).await {
                    Ok(values) => {
                        if tx.send(values).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(multimap = %multimap, key = %key_path, error = %err, "tracker refresh failed"),
                }
            }
        });
        Ok(SubscriberTracker { rx, cancel })
    }
}

async fn load_values<S, V>(client: &CoordinationClient<S>, key_path: &str) -> Result<Vec<V>, CoordinationError>
where
    S: CoordinationStore + ?Sized + 'static,
    V: DeserializeOwned,
{
    let mut values = Vec::new();
    for child in client.children_or_empty(key_path).await? {
        let value_path = join_path(key_path, &child);
        if let Some(node) = client.read_opt(&value_path).await? {
            values.push(decode(&value_path, &node.data)?);
        }
    }
    Ok(values)
}

fn decode<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T, CoordinationError> {
    serde_json::from_slice(data).map_err(|e| CoordinationError::CorruptedData {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Continuously refreshed snapshot of one multimap key.
pub struct SubscriberTracker<V> {
    rx: watch::Receiver<Vec<V>>,
    cancel: CancellationToken,
}

impl<V: Clone> SubscriberTracker<V> {
    /// Latest known values.
    pub fn current(&self) -> Vec<V> {
        self.rx.borrow().clone()
    }

    /// Wait for the next refresh. Returns false once tracking has stopped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl<V> Drop for SubscriberTracker<V> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use canopy_store::InMemoryEnsemble;
    use canopy_store::InMemorySession;

    use super::*;
    use crate::paths::PathNamespace;
    use crate::retry::RetryPolicy;

    fn client(session: Arc<InMemorySession>) -> Arc<CoordinationClient<InMemorySession>> {
        Arc::new(CoordinationClient::new(
            session,
            PathNamespace::new("canopy").unwrap(),
            RetryPolicy::no_retry(),
        ))
    }

    #[tokio::test]
    async fn values_form_a_set() {
        let ensemble = InMemoryEnsemble::new();
        let mm: AsyncMultiMap<_, String, String> = AsyncMultiMap::new(client(ensemble.connect()), "subs");
        let k = "topic".to_string();
        assert!(mm.add(&k, &"n1".to_string()).await.unwrap());
        assert!(!mm.add(&k, &"n1".to_string()).await.unwrap());
        assert!(mm.add(&k, &"n2".to_string()).await.unwrap());
        let mut values = mm.get(&k).await.unwrap();
        values.sort();
        assert_eq!(values, vec!["n1", "n2"]);
        assert!(mm.contains(&k, &"n2".to_string()).await.unwrap());

        assert!(mm.remove(&k, &"n1".to_string()).await.unwrap());
        assert!(!mm.remove(&k, &"n1".to_string()).await.unwrap());
        assert_eq!(mm.keys().await.unwrap(), vec!["topic".to_string()]);
        assert!(mm.remove(&k, &"n2".to_string()).await.unwrap());
        assert!(mm.get(&k).await.unwrap().is_empty());
        assert!(mm.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_all_for_value_spans_keys() {
        let ensemble = InMemoryEnsemble::new();
        let mm: AsyncMultiMap<_, String, String> = AsyncMultiMap::new(client(ensemble.connect()), "subs");
        for key in ["a", "b", "c"] {
            mm.add(&key.to_string(), &"node-1".to_string()).await.unwrap();
        }
        mm.add(&"a".to_string(), &"node-2".to_string()).await.unwrap();
        assert_eq!(mm.remove_all_for_value(&"node-1".to_string()).await.unwrap(), 3);
        assert_eq!(mm.keys().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn ephemeral_values_follow_their_session() {
        let ensemble = InMemoryEnsemble::new();
        let owner = ensemble.connect();
        let theirs: AsyncMultiMap<_, String, String> = AsyncMultiMap::new(client(Arc::clone(&owner)), "subs");
        let ours: AsyncMultiMap<_, String, String> = AsyncMultiMap::new(client(ensemble.connect()), "subs");
        let k = "topic".to_string();
        theirs.add_ephemeral(&k, &"theirs".to_string()).await.unwrap();
        ours.add(&k, &"ours".to_string()).await.unwrap();

        let mut tracker = ours.track(&k).await.unwrap();
        assert_eq!(tracker.current().len(), 2);
        owner.expire();
        assert!(tokio::time::timeout(Duration::from_secs(5), tracker.changed()).await.unwrap());
        assert_eq!(tracker.current(), vec!["ours".to_string()]);
    }
}
