//! Shared maps and multimaps seen from several processes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use canopy::store::InMemoryEnsemble;
use common::EVENT_TIMEOUT;
use common::start_node;

#[tokio::test]
async fn writes_are_visible_to_other_processes() {
    let ensemble = InMemoryEnsemble::new();
    let a = start_node(&ensemble, "a").await;
    let b = start_node(&ensemble, "b").await;

    let writer = a.manager.async_map::<String, u32>("sessions");
    let reader = b.manager.async_map::<String, u32>("sessions");
    writer.put(&"alice".to_string(), &1).await.unwrap();
    writer.put(&"bob/../x".to_string(), &2).await.unwrap();

    assert_eq!(reader.get(&"alice".to_string()).await.unwrap(), Some(1));
    assert_eq!(reader.get(&"bob/../x".to_string()).await.unwrap(), Some(2));
    let mut keys = reader.keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["alice".to_string(), "bob/../x".to_string()]);

    assert_eq!(reader.remove(&"alice".to_string()).await.unwrap(), Some(1));
    assert_eq!(writer.get(&"alice".to_string()).await.unwrap(), None);
    assert_eq!(writer.size().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_if_absent_has_exactly_one_winner() {
    let ensemble = InMemoryEnsemble::new();
    let mut nodes = Vec::new();
    for i in 0..6 {
        nodes.push(start_node(&ensemble, &format!("n{i}")).await);
    }

    let tasks: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let manager = Arc::clone(&node.manager);
            tokio::spawn(async move {
                let map = manager.async_map::<String, u32>("leader");
                map.put_if_absent(&"slot".to_string(), &(i as u32)).await.unwrap()
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut reported = Vec::new();
    for (i, task) in tasks.into_iter().enumerate() {
        match task.await.unwrap() {
            None => winners.push(i as u32),
            Some(existing) => reported.push(existing),
        }
    }
    assert_eq!(winners.len(), 1, "winners: {winners:?}");
    assert!(reported.iter().all(|v| *v == winners[0]));
    let stored = nodes[0].manager.async_map::<String, u32>("leader").get(&"slot".to_string()).await.unwrap();
    assert_eq!(stored, Some(winners[0]));
}

#[tokio::test]
async fn expired_entries_read_as_absent_everywhere() {
    let ensemble = InMemoryEnsemble::new();
    let a = start_node(&ensemble, "a").await;
    let b = start_node(&ensemble, "b").await;

    let writer = a.manager.async_map::<String, String>("cache");
    writer
        .put_with_ttl(&"token".to_string(), &"abc".to_string(), Duration::from_millis(30))
        .await
        .unwrap();
    writer.put(&"config".to_string(), &"v1".to_string()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let reader = b.manager.async_map::<String, String>("cache");
    assert_eq!(reader.get(&"token".to_string()).await.unwrap(), None);
    assert_eq!(reader.entries().await.unwrap(), vec![("config".to_string(), "v1".to_string())]);
    assert_eq!(
        reader.put_if_absent(&"token".to_string(), &"def".to_string()).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn ephemeral_values_vanish_with_their_session() {
    let ensemble = InMemoryEnsemble::new();
    let a = start_node(&ensemble, "a").await;
    let b = start_node(&ensemble, "b").await;

    let subs_a = a.manager.async_multimap::<String, String>("subs");
    let subs_b = b.manager.async_multimap::<String, String>("subs");
    let topic = "orders".to_string();
    assert!(subs_a.add_ephemeral(&topic, &"a".to_string()).await.unwrap());
    assert!(subs_b.add_ephemeral(&topic, &"b".to_string()).await.unwrap());
    assert!(subs_b.add(&topic, &"archive".to_string()).await.unwrap());

    let mut tracker = subs_b.track(&topic).await.unwrap();
    let mut initial = tracker.current();
    initial.sort();
    assert_eq!(initial, vec!["a".to_string(), "archive".to_string(), "b".to_string()]);

    a.session.expire();
    let refreshed = tokio::time::timeout(EVENT_TIMEOUT, async {
        while tracker.changed().await {
            if !tracker.current().contains(&"a".to_string()) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(refreshed);

    let mut values = subs_b.get(&topic).await.unwrap();
    values.sort();
    assert_eq!(values, vec!["archive".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn remove_all_for_value_clears_every_key() {
    let ensemble = InMemoryEnsemble::new();
    let a = start_node(&ensemble, "a").await;
    let routes = a.manager.async_multimap::<String, String>("routes");

    for key in ["east", "west", "north"] {
        routes.add(&key.to_string(), &"gw-1".to_string()).await.unwrap();
    }
    routes.add(&"east".to_string(), &"gw-2".to_string()).await.unwrap();
    assert!(!routes.add(&"east".to_string(), &"gw-2".to_string()).await.unwrap());

    assert_eq!(routes.remove_all_for_value(&"gw-1".to_string()).await.unwrap(), 3);
    assert_eq!(routes.keys().await.unwrap(), vec!["east".to_string()]);
    assert_eq!(routes.get(&"east".to_string()).await.unwrap(), vec!["gw-2".to_string()]);
    assert!(!routes.contains(&"west".to_string(), &"gw-1".to_string()).await.unwrap());
}

#[tokio::test]
async fn tracker_keeps_up_when_rearm_is_retried() {
    let ensemble = InMemoryEnsemble::new();
    let a = start_node(&ensemble, "a").await;
    let b = start_node(&ensemble, "b").await;
    let topic = "alerts".to_string();
    let writer = a.manager.async_multimap::<String, String>("subs");
    let mut tracker = b.manager.async_multimap::<String, String>("subs").track(&topic).await.unwrap();

    b.session.fail_next(1);
    writer.add(&topic, &"first".to_string()).await.unwrap();
    writer.add(&topic, &"second".to_string()).await.unwrap();

    let caught_up = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            if tracker.current().len() == 2 {
                return true;
            }
            if !tracker.changed().await {
                return false;
            }
        }
    })
    .await
    .unwrap();
    assert!(caught_up);
}
