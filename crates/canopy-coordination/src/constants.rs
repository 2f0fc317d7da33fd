//! Fixed limits and layout names for coordination primitives.
//!
//! The layout names are part of the compatibility surface: every process
//! sharing a root must derive identical paths from them.

/// Default namespace root when none is configured.
pub const DEFAULT_ROOT_PATH: &str = "canopy";

/// Subpath holding one ephemeral node per live process.
pub const CLUSTER_NODES_PATH: &str = "cluster/nodes";
/// Subpath holding one subtree per async map.
pub const ASYNC_MAP_PATH: &str = "asyncMap";
/// Subpath holding one subtree per async multimap.
pub const ASYNC_MULTI_MAP_PATH: &str = "asyncMultiMap";
/// Subpath holding one ticket queue per lock name.
pub const LOCKS_PATH: &str = "locks";
/// Subpath holding one node per counter.
pub const COUNTERS_PATH: &str = "counters";
/// Name prefix of sequential lock tickets.
pub const LOCK_TICKET_PREFIX: &str = "ticket-";

/// Maximum CAS attempts before an optimistic loop reports contention.
pub const MAX_CAS_RETRIES: u32 = 100;
/// First backoff after a CAS conflict.
pub const CAS_RETRY_INITIAL_BACKOFF_MS: u64 = 1;
/// Backoff ceiling for CAS conflicts.
pub const CAS_RETRY_MAX_BACKOFF_MS: u64 = 64;

/// Default first sleep of the transient-failure retry policy.
pub const DEFAULT_RETRY_INITIAL_SLEEP_MS: u64 = 1_000;
/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_MAX_RETRIES: u32 = 3;
/// Default ceiling of the transient-failure backoff.
pub const DEFAULT_RETRY_MAX_SLEEP_MS: u64 = 10_000;

/// Attempts made by `create_with_parents` when a parent disappears concurrently.
pub const MAX_CREATE_PARENT_ATTEMPTS: u32 = 5;

/// Buffered membership events per subscriber before it lags.
pub const MEMBERSHIP_EVENT_CAPACITY: usize = 256;
/// Buffered change events per subscription.
pub const SUBSCRIPTION_CAPACITY: usize = 64;

const _: () = assert!(MAX_CAS_RETRIES > 0);
const _: () = assert!(CAS_RETRY_INITIAL_BACKOFF_MS > 0);
const _: () = assert!(CAS_RETRY_INITIAL_BACKOFF_MS <= CAS_RETRY_MAX_BACKOFF_MS);
const _: () = assert!(DEFAULT_RETRY_INITIAL_SLEEP_MS <= DEFAULT_RETRY_MAX_SLEEP_MS);
const _: () = assert!(MAX_CREATE_PARENT_ATTEMPTS > 0);
