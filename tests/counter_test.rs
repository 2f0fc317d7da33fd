//! Counter consistency under concurrent clients.

mod common;

use std::sync::Arc;

use canopy::store::InMemoryEnsemble;
use common::start_node;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_never_lost() {
    let ensemble = InMemoryEnsemble::new();
    let mut nodes = Vec::new();
    for i in 0..10 {
        nodes.push(start_node(&ensemble, &format!("c{i}")).await);
    }

    let mut tasks = Vec::new();
    for node in &nodes {
        let manager = Arc::clone(&node.manager);
        tasks.push(tokio::spawn(async move {
            let counter = manager.counter("hits");
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(counter.increment_and_get().await.unwrap());
            }
            seen
        }));
    }

    let mut observed = Vec::new();
    for task in tasks {
        observed.extend(task.await.unwrap());
    }
    observed.sort_unstable();
    assert_eq!(observed, (1..=50).collect::<Vec<i64>>());
    assert_eq!(nodes[0].manager.counter("hits").get().await.unwrap(), 50);
}

#[tokio::test]
async fn compare_and_set_has_one_winner() {
    let ensemble = InMemoryEnsemble::new();
    let a = start_node(&ensemble, "a").await;
    let b = start_node(&ensemble, "b").await;
    a.manager.counter("epoch").add_and_get(7).await.unwrap();

    let counter_a = a.manager.counter("epoch");
    let counter_b = b.manager.counter("epoch");
    let (first, second) = tokio::join!(
        counter_a.compare_and_set(7, 8),
        counter_b.compare_and_set(7, 9),
    );
    assert!(first.unwrap() ^ second.unwrap());
    let value = a.manager.counter("epoch").get().await.unwrap();
    assert!(value == 8 || value == 9);
}

#[tokio::test]
async fn counter_survives_writer_session_loss() {
    let ensemble = InMemoryEnsemble::new();
    let a = start_node(&ensemble, "a").await;
    let b = start_node(&ensemble, "b").await;
    a.manager.counter("durable").add_and_get(3).await.unwrap();
    a.session.expire();
    assert_eq!(b.manager.counter("durable").get().await.unwrap(), 3);
}
