//! Cluster coordination primitives over a hierarchical coordination store.
//!
//! All primitives share one [`CoordinationClient`], which owns the store
//! session, the [`PathNamespace`] and the [`RetryPolicy`]. State lives
//! entirely in the store; nothing here holds authoritative data in memory.
//!
//! ## Primitives
//!
//! - [`MembershipRegistry`]: ephemeral node per process, join/leave events
//! - [`LockManager`]: fair lock queue with fencing tokens
//! - [`DistributedCounter`]: version-guarded 64-bit counter
//! - [`AsyncMap`]: key/value map with conditional operations and TTL
//! - [`AsyncMultiMap`]: key to value-set map with ephemeral values

mod client;
pub mod constants;
mod counter;
mod error;
mod lock;
mod map;
mod membership;
mod multimap;
mod paths;
mod retry;
mod subscription;
mod types;

pub use client::CoordinationClient;
pub use counter::DistributedCounter;
pub use error::CoordinationError;
pub use lock::LockGuard;
pub use lock::LockManager;
pub use lock::LockTicket;
pub use lock::TicketInfo;
pub use map::AsyncMap;
pub use map::ClearOutcome;
pub use membership::MembershipEvent;
pub use membership::MembershipRegistry;
pub use membership::MembershipState;
pub use membership::NodeInfo;
pub use membership::NodeListener;
pub use membership::SessionLossPolicy;
pub use multimap::AsyncMultiMap;
pub use multimap::EntryLifetime;
pub use multimap::SubscriberTracker;
pub use paths::PathNamespace;
pub use paths::escape_segment;
pub use paths::hash_segment;
pub use paths::unescape_segment;
pub use retry::BackoffResult;
pub use retry::RetryConfig;
pub use retry::RetryPolicy;
pub use retry::compute_backoff_with_jitter;
pub use subscription::Subscription;
pub use types::FencingToken;
pub use types::now_unix_ms;
