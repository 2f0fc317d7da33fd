//! canopy: cluster membership and shared state over a coordination store.
//!
//! Processes join a cluster by registering an ephemeral node, observe each
//! other through membership events, and share locks, counters, maps and
//! multimaps whose state lives entirely in the store.
//!
//! ```ignore
//! let ensemble = InMemoryEnsemble::new();
//! let manager = ClusterManager::new(ensemble.connect(), ClusterConfig::default())?;
//! manager.join().await?;
//! let hits = manager.counter("hits").increment_and_get().await?;
//! ```

pub mod cluster_manager;
pub mod config;
pub mod logging;

pub use canopy_coordination as coordination;
pub use canopy_store as store;
pub use cluster_manager::ClusterManager;
pub use config::ClusterConfig;
pub use config::ConfigError;
