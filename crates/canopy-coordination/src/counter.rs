//! Named distributed counter.
//!
//! The value lives in one persistent node as a decimal string. Updates are
//! read-modify-write loops guarded by the node version, so concurrent
//! increments from any number of processes are never lost. A counter that
//! was never written reads as 0 and is created on first update. An addition
//! that would leave the `i64` range fails and leaves the value untouched.

use std::sync::Arc;

use canopy_store::CoordinationStore;
use canopy_store::NodeKind;
use tracing::debug;

use crate::client::CoordinationClient;
use crate::constants::MAX_CAS_RETRIES;
use crate::error::CoordinationError;
use crate::retry::cas_backoff;

/// Signed 64-bit counter shared by every process using the same name.
pub struct DistributedCounter<S: CoordinationStore + ?Sized + 'static> {
    client: Arc<CoordinationClient<S>>,
    name: String,
    path: String,
}

enum Step {
    Apply(i64),
    Keep,
    Overflow { delta: i64 },
}

fn add(current: i64, delta: i64) -> Step {
    match current.checked_add(delta) {
        Some(new) => Step::Apply(new),
        None => Step::Overflow { delta },
    }
}

impl<S: CoordinationStore + ?Sized + 'static> DistributedCounter<S> {
    pub fn new(client: Arc<CoordinationClient<S>>, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = client.namespace().counter_path(&name);
        Self { client, name, path }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> Result<i64, CoordinationError> {
        match self.client.read_opt(&self.path).await? {
            None => Ok(0),
            Some(node) => self.decode(&node.data),
        }
    }

    pub async fn increment_and_get(&self) -> Result<i64, CoordinationError> {
        self.add_and_get(1).await
    }

    pub async fn get_and_increment(&self) -> Result<i64, CoordinationError> {
        self.get_and_add(1).await
    }

    pub async fn decrement_and_get(&self) -> Result<i64, CoordinationError> {
        self.add_and_get(-1).await
    }

    pub async fn add_and_get(&self, delta: i64) -> Result<i64, CoordinationError> {
        let (_, new) = self.modify(|current| add(current, delta)).await?;
        Ok(new)
    }

    pub async fn get_and_add(&self, delta: i64) -> Result<i64, CoordinationError> {
        let (old, _) = self.modify(|current| add(current, delta)).await?;
        Ok(old)
    }

    /// Set to `new` only if the current value equals `expected`.
    pub async fn compare_and_set(&self, expected: i64, new: i64) -> Result<bool, CoordinationError> {
        let (old, _) = self
            .modify(|current| if current == expected { Step::Apply(new) } else { Step::Keep })
            .await?;
        Ok(old == expected)
    }

    /// Versioned read-modify-write. Returns the value before and after.
    async fn modify(&self, step: impl Fn(i64) -> Step) -> Result<(i64, i64), CoordinationError> {
        let mut attempt: u32 = 0;
        loop {
            match self.client.read_opt(&self.path).await? {
                None => match step(0) {
                    Step::Keep => return Ok((0, 0)),
                    Step::Overflow { delta } => return Err(self.overflow(0, delta)),
                    Step::Apply(new) => {
                        match self
                            .client
                            .create_with_parents(&self.path, encode(new), NodeKind::Persistent)
                            .await
                        {
                            Ok(_) => return Ok((0, new)),
                            Err(err) if err.is_node_exists() => {}
                            Err(err) => return Err(err),
                        }
                    }
                },
                Some(node) => {
                    let current = self.decode(&node.data)?;
                    match step(current) {
                        Step::Keep => return Ok((current, current)),
                        Step::Overflow { delta } => return Err(self.overflow(current, delta)),
                        Step::Apply(new) => {
                            match self.client.write(&self.path, encode(new), Some(node.version())).await {
                                Ok(_) => return Ok((current, new)),
                                Err(err) if err.is_version_mismatch() => {}
                                Err(err) => return Err(err),
                            }
                        }
                    }
                }
            }

            attempt += 1;
            if attempt >= MAX_CAS_RETRIES {
                return Err(CoordinationError::Contention {
                    path: self.path.clone(),
                    attempts: attempt,
                });
            }
            debug!(counter = %self.name, attempt, "counter update conflicted, retrying");
            cas_backoff(attempt).await;
        }
    }

    fn overflow(&self, value: i64, delta: i64) -> CoordinationError {
        CoordinationError::Overflow {
            path: self.path.clone(),
            value,
            delta,
        }
    }

    fn decode(&self, data: &[u8]) -> Result<i64, CoordinationError> {
        let text = std::str::from_utf8(data).map_err(|e| CoordinationError::CorruptedData {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        text.trim().parse().map_err(|e: std::num::ParseIntError| CoordinationError::CorruptedData {
            path: self.path.clone(),
            reason: format!("counter value '{text}' is not an integer: {e}"),
        })
    }
}

fn encode(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}
