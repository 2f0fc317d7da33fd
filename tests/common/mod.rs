//! Shared helpers for multi-process scenarios on an in-memory ensemble.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use canopy::ClusterConfig;
use canopy::ClusterManager;
use canopy::coordination::MembershipEvent;
use canopy::coordination::RetryConfig;
use canopy::coordination::SessionLossPolicy;
use canopy::store::InMemoryEnsemble;
use canopy::store::InMemorySession;
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One simulated process: its session controls and its cluster manager.
pub struct TestNode {
    pub session: Arc<InMemorySession>,
    pub manager: Arc<ClusterManager<InMemorySession>>,
}

impl TestNode {
    pub fn id(&self) -> &str {
        self.manager.node_id()
    }
}

/// Configuration with short retry sleeps so failure paths finish quickly.
pub fn fast_config(node_id: &str, policy: SessionLossPolicy) -> ClusterConfig {
    ClusterConfig {
        node_id: Some(node_id.to_string()),
        session_loss_policy: policy,
        retry: RetryConfig {
            initial_sleep_ms: 5,
            max_retries: 3,
            max_sleep_ms: 20,
        },
        ..ClusterConfig::default()
    }
}

pub fn new_node(ensemble: &InMemoryEnsemble, node_id: &str, policy: SessionLossPolicy) -> TestNode {
    let session = ensemble.connect();
    let manager = ClusterManager::new(Arc::clone(&session), fast_config(node_id, policy)).unwrap();
    TestNode {
        session,
        manager: Arc::new(manager),
    }
}

pub async fn start_node(ensemble: &InMemoryEnsemble, node_id: &str) -> TestNode {
    let node = new_node(ensemble, node_id, SessionLossPolicy::Expired);
    node.manager.join().await.unwrap();
    node
}

pub async fn next_event(rx: &mut broadcast::Receiver<MembershipEvent>) -> MembershipEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for membership event")
        .expect("membership event stream closed")
}

/// Poll `condition` until it holds or the event timeout passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
