//! Continuous change stream built from one-shot watches.

use std::sync::Arc;

use canopy_store::ChangeEvent;
use canopy_store::CoordinationStore;
use canopy_store::Watch;
use canopy_store::WatchMode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::CoordinationClient;
use crate::constants::SUBSCRIPTION_CAPACITY;

/// Stream of change events on a path or subtree.
///
/// A background task re-registers the one-shot watch after every firing and
/// before delivering the event, so state read in response to an event is
/// never older than the watch covering the next change. Changes landing
/// between the firing and the re-registration are coalesced into the
/// delivered event, so consumers should re-read state after each event
/// rather than treat events as a complete log. The stream ends when
/// the session expires, the client closes, the retry budget is spent, or
/// the subscription is cancelled or dropped.
pub struct Subscription {
    rx: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn<S>(client: Arc<CoordinationClient<S>>, path: String, mode: WatchMode, first: Watch) -> Self
    where
        S: CoordinationStore + ?Sized + 'static,
    {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(client, path, mode, first, tx, cancel.clone()));
        Self { rx, cancel, task }
    }

    /// Next change, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward<S>(
    client: Arc<CoordinationClient<S>>,
    path: String,
    mode: WatchMode,
    first: Watch,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) where
    S: CoordinationStore + ?Sized + 'static,
{
    let mut watch = first;
    loop {
        let fired = tokio::select! {
            _ = cancel.cancelled() => break,
            fired = watch.fired() => fired,
        };
        let event = match fired {
            Ok(event) => event,
            Err(err) => {
                debug!(path = %path, error = %err, "subscription watch failed");
                break;
            }
        };
        // Re-arm before delivering: the consumer re-reads state on delivery,
        // and that read must not run ahead of the next registration.
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = client.watch(&path, mode) => next,
        };
        match next {
            Ok(next) => {
                watch = next;
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(path = %path, error = %err, "subscription could not re-register watch");
                // Still hand over the change; the stream ends right after.
                let _ = tx.send(event).await;
                break;
            }
        }
    }
    debug!(path = %path, "subscription ended");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use canopy_store::ChangeKind;
    use canopy_store::InMemoryEnsemble;
    use canopy_store::NodeKind;

    use super::*;
    use crate::paths::PathNamespace;
    use crate::retry::RetryConfig;
    use crate::retry::RetryPolicy;

    #[tokio::test]
    async fn delivers_successive_changes() {
        let ensemble = InMemoryEnsemble::new();
        let client = Arc::new(CoordinationClient::new(
            ensemble.connect(),
            PathNamespace::new("canopy").unwrap(),
            RetryPolicy::no_retry(),
        ));
        client.ensure_path("/watched").await.unwrap();
        let mut sub = client.subscribe("/watched", WatchMode::Subtree).await.unwrap();

        client.create("/watched/a", Vec::new(), NodeKind::Persistent).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), sub.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Created);

        client.delete("/watched/a", None).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), sub.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
        assert_eq!(event.path, "/watched/a");
    }

    #[tokio::test]
    async fn change_right_after_delivery_is_observed_despite_rearm_failure() {
        let ensemble = InMemoryEnsemble::new();
        let reader_session = ensemble.connect();
        let reader = Arc::new(CoordinationClient::new(
            Arc::clone(&reader_session),
            PathNamespace::new("canopy").unwrap(),
            RetryPolicy::new(&RetryConfig {
                initial_sleep_ms: 5,
                max_retries: 3,
                max_sleep_ms: 20,
            }),
        ));
        let writer = CoordinationClient::new(ensemble.connect(), PathNamespace::new("canopy").unwrap(), RetryPolicy::no_retry());
        writer.ensure_path("/watched").await.unwrap();
        let mut sub = reader.subscribe("/watched", WatchMode::Subtree).await.unwrap();

        // The first re-registration attempt fails and is retried after a backoff.
        reader_session.fail_next(1);
        writer.create("/watched/a", Vec::new(), NodeKind::Persistent).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), sub.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Created);

        writer.delete("/watched/a", None).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), sub.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn ends_on_session_expiry() {
        let ensemble = InMemoryEnsemble::new();
        let session = ensemble.connect();
        let client = Arc::new(CoordinationClient::new(
            Arc::clone(&session),
            PathNamespace::new("canopy").unwrap(),
            RetryPolicy::no_retry(),
        ));
        let mut sub = client.subscribe("/anything", WatchMode::Node).await.unwrap();
        session.expire();
        let next = tokio::time::timeout(Duration::from_secs(5), sub.next()).await.unwrap();
        assert!(next.is_none());
    }
}
