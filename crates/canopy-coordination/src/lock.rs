//! Fair, session-scoped distributed lock.
//!
//! Every contender creates an ephemeral sequential ticket under the lock's
//! queue node. The ticket with the lowest sequence holds the lock; every
//! other contender watches only its immediate predecessor, so a release
//! wakes exactly one waiter. Tickets are ephemeral, so a crashed holder's
//! lock is released when its session ends.
//!
//! Ticket names are `ticket-<attempt id>-<sequence>`. The attempt id is
//! fresh for every acquisition, which lets a retried create find and adopt
//! a ticket whose creation reply was lost instead of queueing twice.
//!
//! The ticket sequence doubles as a fencing token: sequences assigned under
//! one queue node strictly increase.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use canopy_store::CoordinationStore;
use canopy_store::NodeKind;
use canopy_store::WatchMode;
use canopy_store::join_path;
use canopy_store::node_name;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::client::CoordinationClient;
use crate::constants::LOCK_TICKET_PREFIX;
use crate::error::CoordinationError;
use crate::types::FencingToken;
use crate::types::now_unix_ms;

/// Payload stored in a lock ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketInfo {
    pub owner_id: String,
    pub created_at_ms: u64,
}

/// One entry of a lock queue, in acquisition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTicket {
    /// Child name, e.g. `ticket-9f1c…-0000000004`.
    pub name: String,
    pub sequence: u64,
}

/// Parse `ticket-<attempt id>-<sequence>`, or the bare `ticket-<sequence>`.
fn parse_ticket(name: &str) -> Option<LockTicket> {
    let rest = name.strip_prefix(LOCK_TICKET_PREFIX)?;
    let digits = match rest.rsplit_once('-') {
        Some((attempt_id, digits)) if !attempt_id.is_empty() => digits,
        Some(_) => return None,
        None => rest,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let sequence = digits.parse().ok()?;
    Some(LockTicket {
        name: name.to_string(),
        sequence,
    })
}

/// Acquires named locks on behalf of one owner.
pub struct LockManager<S: CoordinationStore + ?Sized + 'static> {
    client: Arc<CoordinationClient<S>>,
    owner_id: String,
}

impl<S: CoordinationStore + ?Sized + 'static> LockManager<S> {
    pub fn new(client: Arc<CoordinationClient<S>>, owner_id: impl Into<String>) -> Self {
        Self {
            client,
            owner_id: owner_id.into(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Acquire `name`, waiting at most `timeout`.
    ///
    /// On timeout or any other failure the ticket created by this call is
    /// removed before returning, so an abandoned attempt never blocks later
    /// contenders.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard<S>, CoordinationError> {
        let deadline = Instant::now() + timeout;
        let namespace = self.client.namespace();
        let lock_path = namespace.lock_path(name);
        let payload = serde_json::to_vec(&TicketInfo {
            owner_id: self.owner_id.clone(),
            created_at_ms: now_unix_ms(),
        })?;

        let attempt_id = Uuid::new_v4().simple().to_string();
        let prefix = format!("{}{attempt_id}-", namespace.lock_ticket_prefix(name));
        let ticket_path = match self.client.create_protected(&prefix, payload, NodeKind::EphemeralSequential).await {
            Ok(path) => path,
            Err(err) => {
                if matches!(err, CoordinationError::ConnectionLost { .. }) {
                    self.remove_unacknowledged(name, &lock_path, node_name(&prefix)).await;
                }
                return Err(err);
            }
        };
        let Some(ticket) = parse_ticket(node_name(&ticket_path)) else {
            let _ = self.client.delete_if_exists(&ticket_path, None).await;
            return Err(CoordinationError::CorruptedData {
                path: ticket_path,
                reason: "store returned a ticket without a sequence suffix".to_string(),
            });
        };
        debug!(lock = name, ticket = %ticket.name, owner = %self.owner_id, "lock ticket created");

        match self.wait_for_turn(name, &lock_path, &ticket, deadline).await {
            Ok(()) => {
                debug!(lock = name, fencing_token = ticket.sequence, owner = %self.owner_id, "lock acquired");
                Ok(LockGuard {
                    client: Arc::clone(&self.client),
                    name: name.to_string(),
                    ticket_path,
                    fencing_token: FencingToken::new(ticket.sequence),
                    released: false,
                })
            }
            Err(err) => {
                if !err.is_session_fatal()
                    && let Err(cleanup) = self.client.delete_if_exists(&ticket_path, None).await
                {
                    warn!(lock = name, ticket = %ticket_path, error = %cleanup, "failed to remove abandoned lock ticket");
                }
                Err(err)
            }
        }
    }

    /// Best-effort removal of a ticket that may have been created by an
    /// attempt whose reply never arrived.
    async fn remove_unacknowledged(&self, name: &str, lock_path: &str, marker: &str) {
        let children = match self.client.children_or_empty(lock_path).await {
            Ok(children) => children,
            Err(err) => {
                warn!(lock = name, error = %err, "could not check for an unacknowledged lock ticket");
                return;
            }
        };
        for child in children.iter().filter(|child| child.starts_with(marker)) {
            let path = join_path(lock_path, child);
            if let Err(err) = self.client.delete_if_exists(&path, None).await {
                warn!(lock = name, ticket = %path, error = %err, "failed to remove unacknowledged lock ticket");
            }
        }
    }

    /// Acquire `name` only if it is free right now.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard<S>>, CoordinationError> {
        match self.acquire(name, Duration::ZERO).await {
            Ok(guard) => Ok(Some(guard)),
            Err(CoordinationError::Timeout { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Current queue of `name`, holder first.
    pub async fn queue(&self, name: &str) -> Result<Vec<LockTicket>, CoordinationError> {
        let lock_path = self.client.namespace().lock_path(name);
        self.tickets(&lock_path).await
    }

    async fn tickets(&self, lock_path: &str) -> Result<Vec<LockTicket>, CoordinationError> {
        let mut tickets: Vec<LockTicket> = self
            .client
            .children_or_empty(lock_path)
            .await?
            .iter()
            .filter_map(|name| parse_ticket(name))
            .collect();
        tickets.sort_by_key(|ticket| ticket.sequence);
        Ok(tickets)
    }

    async fn wait_for_turn(
        &self,
        name: &str,
        lock_path: &str,
        ticket: &LockTicket,
        deadline: Instant,
    ) -> Result<(), CoordinationError> {
        // The first look is unbounded so a zero timeout still sees a free lock.
        let mut tickets = self.tickets(lock_path).await?;
        loop {
            let Some(position) = tickets.iter().position(|t| t.sequence == ticket.sequence) else {
                // Our ticket vanished, which only happens when the session ended.
                return Err(CoordinationError::NoNode {
                    path: join_path(lock_path, &ticket.name),
                });
            };
            if position == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(timeout_error(name));
            }

            let predecessor = join_path(lock_path, &tickets[position - 1].name);
            let watch = before_deadline(name, deadline, self.client.watch(&predecessor, WatchMode::Node)).await?;
            if before_deadline(name, deadline, self.client.exists(&predecessor)).await?.is_some() {
                tokio::select! {
                    fired = watch.fired() => {
                        let event = fired?;
                        debug!(lock = name, predecessor = %event.path, kind = ?event.kind, "lock predecessor changed");
                    }
                    _ = tokio::time::sleep_until(deadline) => return Err(timeout_error(name)),
                }
            }
            tickets = before_deadline(name, deadline, self.tickets(lock_path)).await?;
        }
    }
}

/// Run a store call, giving up with a lock timeout once `deadline` passes.
async fn before_deadline<T>(
    name: &str,
    deadline: Instant,
    call: impl Future<Output = Result<T, CoordinationError>>,
) -> Result<T, CoordinationError> {
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(name)),
    }
}

fn timeout_error(name: &str) -> CoordinationError {
    CoordinationError::Timeout {
        operation: format!("acquire lock '{name}'"),
    }
}

/// Held lock. Released explicitly with [`LockGuard::release`] or, best
/// effort, when dropped.
pub struct LockGuard<S: CoordinationStore + ?Sized + 'static> {
    client: Arc<CoordinationClient<S>>,
    name: String,
    ticket_path: String,
    fencing_token: FencingToken,
    released: bool,
}

impl<S: CoordinationStore + ?Sized + 'static> LockGuard<S> {
    /// Include this token in every operation protected by the lock.
    pub fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ticket_path(&self) -> &str {
        &self.ticket_path
    }

    /// Whether the ticket still exists. False after session loss.
    pub async fn is_held(&self) -> Result<bool, CoordinationError> {
        Ok(self.client.exists(&self.ticket_path).await?.is_some())
    }

    /// Release the lock. A ticket already removed by session loss counts
    /// as released.
    pub async fn release(mut self) -> Result<(), CoordinationError> {
        self.released = true;
        match self.client.delete_if_exists(&self.ticket_path, None).await {
            Ok(_) => {
                debug!(lock = %self.name, fencing_token = self.fencing_token.value(), "lock released");
                Ok(())
            }
            Err(err) if err.is_session_fatal() => {
                debug!(lock = %self.name, error = %err, "lock ticket already gone with session");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.name, "lock dropped outside a runtime, ticket stays until session ends");
            return;
        };
        let client = Arc::clone(&self.client);
        let ticket_path = std::mem::take(&mut self.ticket_path);
        let token = self.fencing_token.value();
        handle.spawn(async move {
            match client.delete_if_exists(&ticket_path, None).await {
                Ok(_) => debug!(ticket = %ticket_path, fencing_token = token, "lock released on drop"),
                Err(e) => debug!(ticket = %ticket_path, error = %e, "lock release on drop failed"),
            }
        });
    }
}

impl<S: CoordinationStore + ?Sized + 'static> std::fmt::Debug for LockGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("ticket_path", &self.ticket_path)
            .field("fencing_token", &self.fencing_token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use canopy_store::InMemoryEnsemble;
    use canopy_store::InMemorySession;

    use super::*;
    use crate::paths::PathNamespace;
    use crate::retry::RetryPolicy;

    fn manager(ensemble: &InMemoryEnsemble, owner: &str) -> LockManager<InMemorySession> {
        let client = Arc::new(CoordinationClient::new(
            ensemble.connect(),
            PathNamespace::new("canopy").unwrap(),
            RetryPolicy::no_retry(),
        ));
        LockManager::new(client, owner)
    }

    #[test]
    fn ticket_names_parse() {
        assert_eq!(parse_ticket("ticket-0000000012").unwrap().sequence, 12);
        let ticket = parse_ticket("ticket-3f2a9c0d1e7b4c5a8f6e2d1c0b9a8f7e-0000000007").unwrap();
        assert_eq!(ticket.sequence, 7);
        assert_eq!(ticket.name, "ticket-3f2a9c0d1e7b4c5a8f6e2d1c0b9a8f7e-0000000007");
        assert!(parse_ticket("ticket-").is_none());
        assert!(parse_ticket("ticket--0000000001").is_none());
        assert!(parse_ticket("ticket-abc-").is_none());
        assert!(parse_ticket("ticket-abc-12x").is_none());
        assert!(parse_ticket("other").is_none());
    }

    #[tokio::test]
    async fn uncontended_acquire_and_release() {
        let ensemble = InMemoryEnsemble::new();
        let locks = manager(&ensemble, "a");
        let guard = locks.acquire("jobs", Duration::from_secs(1)).await.unwrap();
        assert!(guard.is_held().await.unwrap());
        assert_eq!(locks.queue("jobs").await.unwrap().len(), 1);
        guard.release().await.unwrap();
        assert!(locks.queue("jobs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unacknowledged_ticket_is_removed_when_create_fails() {
        let ensemble = InMemoryEnsemble::new();
        let session = ensemble.connect();
        let locks = LockManager::new(
            Arc::new(CoordinationClient::new(
                Arc::clone(&session),
                PathNamespace::new("canopy").unwrap(),
                RetryPolicy::no_retry(),
            )),
            "a",
        );
        locks.acquire("jobs", Duration::from_secs(1)).await.unwrap().release().await.unwrap();

        session.lose_next_replies(1);
        let err = locks.acquire("jobs", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CoordinationError::ConnectionLost { attempts: 1, .. }), "unexpected error: {err}");
        assert!(locks.queue("jobs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fencing_tokens_increase() {
        let ensemble = InMemoryEnsemble::new();
        let locks = manager(&ensemble, "a");
        let first = locks.acquire("jobs", Duration::from_secs(1)).await.unwrap();
        let first_token = first.fencing_token();
        first.release().await.unwrap();
        let second = locks.acquire("jobs", Duration::from_secs(1)).await.unwrap();
        assert!(second.fencing_token() > first_token);
    }

    #[tokio::test]
    async fn try_acquire_does_not_wait() {
        let ensemble = InMemoryEnsemble::new();
        let a = manager(&ensemble, "a");
        let b = manager(&ensemble, "b");
        let held = a.acquire("jobs", Duration::from_secs(1)).await.unwrap();
        assert!(b.try_acquire("jobs").await.unwrap().is_none());
        assert_eq!(b.queue("jobs").await.unwrap().len(), 1);
        held.release().await.unwrap();
        assert!(b.try_acquire("jobs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_holder_releases_lock() {
        let ensemble = InMemoryEnsemble::new();
        let holder_session = ensemble.connect();
        let holder = LockManager::new(
            Arc::new(CoordinationClient::new(
                Arc::clone(&holder_session),
                PathNamespace::new("canopy").unwrap(),
                RetryPolicy::no_retry(),
            )),
            "holder",
        );
        let waiter = manager(&ensemble, "waiter");
        let guard = holder.acquire("jobs", Duration::from_secs(1)).await.unwrap();

        let waiting = tokio::spawn(async move { waiter.acquire("jobs", Duration::from_secs(5)).await.map(|g| g.fencing_token()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        holder_session.expire();
        let token = waiting.await.unwrap().unwrap();
        assert!(token > guard.fencing_token());
        assert!(!guard.is_held().await.is_ok_and(|held| held));
        guard.release().await.unwrap();
    }
}
