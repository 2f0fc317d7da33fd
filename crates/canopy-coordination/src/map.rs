//! Cluster-wide key/value map.
//!
//! Each entry is one persistent node under the map's directory, named by
//! the hash of the serialized key. The payload carries the key, the value
//! and an optional expiry, so listing the directory is enough to rebuild
//! keys and values. Conditional operations use version-guarded writes and
//! deletes; losing a race just means retrying against the fresh state.
//!
//! Expired entries are invisible to readers and removed lazily on access or
//! by [`AsyncMap::purge_expired`].

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use canopy_store::CoordinationStore;
use canopy_store::NodeKind;
use canopy_store::join_path;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::client::CoordinationClient;
use crate::constants::MAX_CAS_RETRIES;
use crate::error::CoordinationError;
use crate::retry::cas_backoff;
use crate::types::now_unix_ms;

#[derive(Serialize)]
struct EntryRef<'a, K, V> {
    key: &'a K,
    value: &'a V,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

#[derive(Deserialize)]
struct StoredEntry<K, V> {
    key: K,
    value: V,
    #[serde(default)]
    expires_at_ms: Option<u64>,
}

impl<K, V> StoredEntry<K, V> {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|deadline| deadline <= now_ms)
    }
}

enum Loaded<K, V> {
    Live(StoredEntry<K, V>, u32),
    Expired,
    Missing,
}

/// Result of a bulk removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearOutcome {
    pub removed: usize,
    pub failed: usize,
}

/// Map shared by every process using the same name.
pub struct AsyncMap<S, K, V>
where
    S: CoordinationStore + ?Sized + 'static,
{
    client: Arc<CoordinationClient<S>>,
    name: String,
    path: String,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> AsyncMap<S, K, V>
where
    S: CoordinationStore + ?Sized + 'static,
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(client: Arc<CoordinationClient<S>>, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = client.namespace().map_path(&name);
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

    fn entry_path(&self, key: &K) -> Result<String, CoordinationError> {
        let key_bytes = serde_json::to_vec(key)?;
        Ok(self.client.namespace().map_entry_path(&self.name, &key_bytes))
    }

    fn encode(key: &K, value: &V, ttl: Option<Duration>) -> Result<Vec<u8>, CoordinationError> {
        let expires_at_ms = ttl.map(|ttl| now_unix_ms().saturating_add(ttl.as_millis() as u64));
        Ok(serde_json::to_vec(&EntryRef {
            key,
            value,
            expires_at_ms,
        })?)
    }

    /// Read and decode an entry, deleting it if it has expired.
    async fn load(&self, path: &str) -> Result<Loaded<K, V>, CoordinationError> {
        let Some(node) = self.client.read_opt(path).await? else {
            return Ok(Loaded::Missing);
        };
        let entry: StoredEntry<K, V> =
            serde_json::from_slice(&node.data).map_err(|e| CoordinationError::CorruptedData {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        if entry.is_expired(now_unix_ms()) {
            match self.client.delete(path, Some(node.version())).await {
                Ok(()) => debug!(map = %self.name, path, "removed expired entry"),
                Err(err) if err.is_no_node() || err.is_version_mismatch() => {}
                Err(err) => return Err(err),
            }
            return Ok(Loaded::Expired);
        }
        Ok(Loaded::Live(entry, node.version()))
    }

    async fn load_live(&self, path: &str) -> Result<Option<(StoredEntry<K, V>, u32)>, CoordinationError> {
        match self.load(path).await? {
            Loaded::Live(entry, version) => Ok(Some((entry, version))),
            Loaded::Expired | Loaded::Missing => Ok(None),
        }
    }

    fn contention(&self, path: &str, attempts: u32) -> CoordinationError {
        CoordinationError::Contention {
            path: path.to_string(),
            attempts,
        }
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>, CoordinationError> {
        let path = self.entry_path(key)?;
        Ok(self.load_live(&path).await?.map(|(entry, _)| entry.value))
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool, CoordinationError> {
        let path = self.entry_path(key)?;
        Ok(self.load_live(&path).await?.is_some())
    }

    /// Insert or overwrite.
    pub async fn put(&self, key: &K, value: &V) -> Result<(), CoordinationError> {
        self.put_entry(key, value, None).await
    }

    /// Insert or overwrite; the entry disappears after `ttl`.
    pub async fn put_with_ttl(&self, key: &K, value: &V, ttl: Duration) -> Result<(), CoordinationError> {
        self.put_entry(key, value, Some(ttl)).await
    }

    async fn put_entry(&self, key: &K, value: &V, ttl: Option<Duration>) -> Result<(), CoordinationError> {
        let path = self.entry_path(key)?;
        let payload = Self::encode(key, value, ttl)?;
        for attempt in 0..MAX_CAS_RETRIES {
            match self.client.write(&path, payload.clone(), None).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_no_node() => {}
                Err(err) => return Err(err),
            }
            match self.client.create_with_parents(&path, payload.clone(), NodeKind::Persistent).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_node_exists() => cas_backoff(attempt + 1).await,
                Err(err) => return Err(err),
            }
        }
        Err(self.contention(&path, MAX_CAS_RETRIES))
    }

    /// Insert only if absent. Returns the existing value otherwise.
    pub async fn put_if_absent(&self, key: &K, value: &V) -> Result<Option<V>, CoordinationError> {
        self.put_if_absent_entry(key, value, None).await
    }

    pub async fn put_if_absent_with_ttl(&self, key: &K, value: &V, ttl: Duration) -> Result<Option<V>, CoordinationError> {
        self.put_if_absent_entry(key, value, Some(ttl)).await
    }

    async fn put_if_absent_entry(
        &self,
        key: &K,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<Option<V>, CoordinationError> {
        let path = self.entry_path(key)?;
        let payload = Self::encode(key, value, ttl)?;
        for _ in 0..MAX_CAS_RETRIES {
            match self.client.create_with_parents(&path, payload.clone(), NodeKind::Persistent).await {
                Ok(_) => return Ok(None),
                Err(err) if err.is_node_exists() => {}
                Err(err) => return Err(err),
            }
            // An expired or concurrently removed entry counts as absent; try again.
            if let Some((existing, _)) = self.load_live(&path).await? {
                return Ok(Some(existing.value));
            }
        }
        Err(self.contention(&path, MAX_CAS_RETRIES))
    }

    /// Remove an entry, returning its previous value.
    pub async fn remove(&self, key: &K) -> Result<Option<V>, CoordinationError> {
        let path = self.entry_path(key)?;
        for attempt in 0..MAX_CAS_RETRIES {
            let Some((entry, version)) = self.load_live(&path).await? else {
                return Ok(None);
            };
            match self.client.delete(&path, Some(version)).await {
                Ok(()) => return Ok(Some(entry.value)),
                Err(err) if err.is_no_node() => return Ok(None),
                Err(err) if err.is_version_mismatch() => cas_backoff(attempt + 1).await,
                Err(err) => return Err(err),
            }
        }
        Err(self.contention(&path, MAX_CAS_RETRIES))
    }

    /// Remove the entry only if it currently maps to `value`.
    pub async fn remove_if_present(&self, key: &K, value: &V) -> Result<bool, CoordinationError>
    where
        V: PartialEq,
    {
        let path = self.entry_path(key)?;
        for attempt in 0..MAX_CAS_RETRIES {
            let Some((entry, version)) = self.load_live(&path).await? else {
                return Ok(false);
            };
            if entry.value != *value {
                return Ok(false);
            }
            match self.client.delete(&path, Some(version)).await {
                Ok(()) => return Ok(true),
                Err(err) if err.is_no_node() => return Ok(false),
                Err(err) if err.is_version_mismatch() => cas_backoff(attempt + 1).await,
                Err(err) => return Err(err),
            }
        }
        Err(self.contention(&path, MAX_CAS_RETRIES))
    }

    /// Overwrite an existing entry. Returns the previous value, or `None`
    /// without writing if the key is absent.
    pub async fn replace(&self, key: &K, value: &V) -> Result<Option<V>, CoordinationError> {
        let path = self.entry_path(key)?;
        let payload = Self::encode(key, value, None)?;
        for attempt in 0..MAX_CAS_RETRIES {
            let Some((entry, version)) = self.load_live(&path).await? else {
                return Ok(None);
            };
            match self.client.write(&path, payload.clone(), Some(version)).await {
                Ok(_) => return Ok(Some(entry.value)),
                Err(err) if err.is_no_node() => return Ok(None),
                Err(err) if err.is_version_mismatch() => cas_backoff(attempt + 1).await,
                Err(err) => return Err(err),
            }
        }
        Err(self.contention(&path, MAX_CAS_RETRIES))
    }

    /// Overwrite only if the entry currently maps to `expected`.
    pub async fn replace_if_present(&self, key: &K, expected: &V, value: &V) -> Result<bool, CoordinationError>
    where
        V: PartialEq,
    {
        let path = self.entry_path(key)?;
        let payload = Self::encode(key, value, None)?;
        for attempt in 0..MAX_CAS_RETRIES {
            let Some((entry, version)) = self.load_live(&path).await? else {
                return Ok(false);
            };
            if entry.value != *expected {
                return Ok(false);
            }
            match self.client.write(&path, payload.clone(), Some(version)).await {
                Ok(_) => return Ok(true),
                Err(err) if err.is_no_node() => return Ok(false),
                Err(err) if err.is_version_mismatch() => cas_backoff(attempt + 1).await,
                Err(err) => return Err(err),
            }
        }
        Err(self.contention(&path, MAX_CAS_RETRIES))
    }

    /// Every live entry. Entries removed while listing are skipped.
    pub async fn entries(&self) -> Result<Vec<(K, V)>, CoordinationError> {
        let mut entries = Vec::new();
        for child in self.client.children_or_empty(&self.path).await? {
            if let Some((entry, _)) = self.load_live(&join_path(&self.path, &child)).await? {
                entries.push((entry.key, entry.value));
            }
        }
        Ok(entries)
    }

    pub async fn keys(&self) -> Result<Vec<K>, CoordinationError> {
        Ok(self.entries().await?.into_iter().map(|(k, _)| k).collect())
    }

    pub async fn values(&self) -> Result<Vec<V>, CoordinationError> {
        Ok(self.entries().await?.into_iter().map(|(_, v)| v).collect())
    }

    /// Number of live entries.
    pub async fn size(&self) -> Result<usize, CoordinationError> {
        Ok(self.entries().await?.len())
    }

    /// Remove every entry. Not atomic: entries added concurrently may
    /// survive, and individual failures are counted rather than aborting.
    pub async fn clear(&self) -> Result<ClearOutcome, CoordinationError> {
        let mut outcome = ClearOutcome::default();
        for child in self.client.children_or_empty(&self.path).await? {
            match self.client.delete_if_exists(&join_path(&self.path, &child), None).await {
                Ok(true) => outcome.removed += 1,
                Ok(false) => {}
                Err(err) if err.is_session_fatal() => return Err(err),
                Err(err) => {
                    warn!(map = %self.name, entry = %child, error = %err, "failed to remove map entry");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Delete every expired entry. Returns how many were found expired.
    pub async fn purge_expired(&self) -> Result<usize, CoordinationError> {
        let mut purged = 0;
        for child in self.client.children_or_empty(&self.path).await? {
            match self.load(&join_path(&self.path, &child)).await {
                Ok(Loaded::Expired) => purged += 1,
                Ok(Loaded::Live(..) | Loaded::Missing) => {}
                Err(CoordinationError::CorruptedData { path, reason }) => {
                    warn!(map = %self.name, path = %path, reason = %reason, "skipping unreadable map entry");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(purged)
    }

    /// Periodically purge expired entries until the returned token is
    /// cancelled.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, interval: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let map = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match map.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(map = %map.name, purged, "expired entries purged"),
                        Err(err) if err.is_session_fatal() => {
                            warn!(map = %map.name, error = %err, "stopping expiry sweeper");
                            break;
                        }
                        Err(err) => warn!(map = %map.name, error = %err, "expiry sweep failed"),
                    },
                }
            }
        });
        cancel
    }
}

#[cfg(test)]
mod tests {
    use canopy_store::InMemoryEnsemble;
    use canopy_store::InMemorySession;

    use super::*;
    use crate::paths::PathNamespace;
    use crate::retry::RetryPolicy;

    fn map(ensemble: &InMemoryEnsemble, name: &str) -> AsyncMap<InMemorySession, String, u32> {
        let client = Arc::new(CoordinationClient::new(
            ensemble.connect(),
            PathNamespace::new("canopy").unwrap(),
            RetryPolicy::no_retry(),
        ));
        AsyncMap::new(client, name)
    }

    #[tokio::test]
    async fn put_get_remove() {
        let ensemble = InMemoryEnsemble::new();
        let m = map(&ensemble, "m");
        let k = "a/b".to_string();
        assert_eq!(m.get(&k).await.unwrap(), None);
        m.put(&k, &1).await.unwrap();
        m.put(&k, &2).await.unwrap();
        assert_eq!(m.get(&k).await.unwrap(), Some(2));
        assert_eq!(m.remove(&k).await.unwrap(), Some(2));
        assert_eq!(m.remove(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn conditional_operations() {
        let ensemble = InMemoryEnsemble::new();
        let m = map(&ensemble, "m");
        let k = "k".to_string();
        assert_eq!(m.put_if_absent(&k, &1).await.unwrap(), None);
        assert_eq!(m.put_if_absent(&k, &2).await.unwrap(), Some(1));
        assert!(!m.replace_if_present(&k, &5, &6).await.unwrap());
        assert!(m.replace_if_present(&k, &1, &3).await.unwrap());
        assert_eq!(m.replace(&k, &4).await.unwrap(), Some(3));
        assert!(!m.remove_if_present(&k, &3).await.unwrap());
        assert!(m.remove_if_present(&k, &4).await.unwrap());
        assert_eq!(m.replace(&k, &9).await.unwrap(), None);
        assert!(!m.contains_key(&k).await.unwrap());
    }

    #[tokio::test]
    async fn listing_and_clear() {
        let ensemble = InMemoryEnsemble::new();
        let m = map(&ensemble, "m");
        for (i, key) in ["x", "y", "z"].iter().enumerate() {
            m.put(&key.to_string(), &(i as u32)).await.unwrap();
        }
        assert_eq!(m.size().await.unwrap(), 3);
        let mut keys = m.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["x", "y", "z"]);
        let mut values = m.values().await.unwrap();
        values.sort();
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(m.clear().await.unwrap(), ClearOutcome { removed: 3, failed: 0 });
        assert_eq!(m.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_purged() {
        let ensemble = InMemoryEnsemble::new();
        let m = map(&ensemble, "ttl");
        m.put_with_ttl(&"gone".to_string(), &1, Duration::ZERO).await.unwrap();
        m.put_with_ttl(&"kept".to_string(), &2, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(m.purge_expired().await.unwrap(), 1);
        assert_eq!(m.get(&"gone".to_string()).await.unwrap(), None);
        assert_eq!(m.get(&"kept".to_string()).await.unwrap(), Some(2));

        m.put_with_ttl(&"again".to_string(), &3, Duration::ZERO).await.unwrap();
        assert_eq!(m.put_if_absent(&"again".to_string(), &4).await.unwrap(), None);
        assert_eq!(m.get(&"again".to_string()).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn maps_are_isolated_by_name() {
        let ensemble = InMemoryEnsemble::new();
        let a = map(&ensemble, "a");
        let b = map(&ensemble, "b");
        a.put(&"k".to_string(), &1).await.unwrap();
        assert_eq!(b.get(&"k".to_string()).await.unwrap(), None);
        assert_eq!(map(&ensemble, "a").get(&"k".to_string()).await.unwrap(), Some(1));
    }
}
