//! One-shot watch handles.

use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::types::ChangeEvent;
use crate::types::WatchMode;

/// Sending half held by the store for a single registration.
pub type WatchSender = oneshot::Sender<Result<ChangeEvent, StoreError>>;

/// A one-shot watch registration.
///
/// Resolves at most once: with the next change under the watched path, or
/// with the error that ended the session. Dropping the handle unregisters the
/// watch; the store prunes it on its next dispatch.
#[derive(Debug)]
pub struct Watch {
    path: String,
    mode: WatchMode,
    rx: oneshot::Receiver<Result<ChangeEvent, StoreError>>,
}

impl Watch {
    /// Create a registration pair for `path`.
    pub fn channel(path: impl Into<String>, mode: WatchMode) -> (WatchSender, Watch) {
        let (tx, rx) = oneshot::channel();
        (tx, Watch {
            path: path.into(),
            mode,
            rx,
        })
    }

    /// Watched path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Watch scope.
    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Wait for the watch to fire.
    ///
    /// A registration dropped by the store without an event (store shut down)
    /// reports [`StoreError::Closed`].
    pub async fn fired(self) -> Result<ChangeEvent, StoreError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;

    #[tokio::test]
    async fn fires_once_with_event() {
        let (tx, watch) = Watch::channel("/a", WatchMode::Node);
        assert_eq!(watch.path(), "/a");
        tx.send(Ok(ChangeEvent {
            path: "/a".to_string(),
            kind: ChangeKind::Deleted,
        }))
        .unwrap();
        let event = watch.fired().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn dropped_sender_reports_closed() {
        let (tx, watch) = Watch::channel("/a", WatchMode::Subtree);
        drop(tx);
        assert_eq!(watch.fired().await, Err(StoreError::Closed));
    }
}
