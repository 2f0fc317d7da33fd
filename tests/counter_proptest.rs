//! Property: interleaved counter updates from several clients sum exactly.

use std::sync::Arc;

use canopy::coordination::CoordinationClient;
use canopy::coordination::DistributedCounter;
use canopy::coordination::PathNamespace;
use canopy::coordination::RetryPolicy;
use canopy::store::InMemoryEnsemble;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn updates_from_all_clients_are_applied(
        deltas in prop::collection::vec((0usize..3, -1000i64..1000), 1..40)
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread().worker_threads(3).enable_all().build().unwrap();
        let total = rt.block_on(async {
            let ensemble = InMemoryEnsemble::new();
            let counters: Vec<Arc<DistributedCounter<_>>> = (0..3)
                .map(|_| {
                    let client = Arc::new(CoordinationClient::new(
                        ensemble.connect(),
                        PathNamespace::new("canopy").unwrap(),
                        RetryPolicy::no_retry(),
                    ));
                    Arc::new(DistributedCounter::new(client, "prop"))
                })
                .collect();

            let tasks: Vec<_> = deltas
                .iter()
                .map(|&(client, delta)| {
                    let counter = Arc::clone(&counters[client]);
                    tokio::spawn(async move { counter.add_and_get(delta).await.unwrap() })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
            counters[0].get().await.unwrap()
        });
        prop_assert_eq!(total, deltas.iter().map(|(_, d)| d).sum::<i64>());
    }
}
