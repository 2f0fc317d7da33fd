//! Coordination store capability for canopy.
//!
//! Defines the contract the coordination engine consumes from a
//! hierarchical store with ephemeral nodes, sequential nodes, versioned
//! writes and one-shot watches ([`CoordinationStore`]), together with
//! [`InMemoryEnsemble`], an in-process implementation of that contract.
//!
//! Paths are absolute, `/`-separated and never end with `/` (except the
//! root itself). Versions start at 0 for a fresh node and increase by one on
//! every write.

mod error;
mod memory;
mod traits;
mod types;
mod watch;

pub use error::StoreError;
pub use memory::InMemoryEnsemble;
pub use memory::InMemorySession;
pub use traits::CoordinationStore;
pub use types::ChangeEvent;
pub use types::ChangeKind;
pub use types::ConnectionState;
pub use types::NodeData;
pub use types::NodeKind;
pub use types::Stat;
pub use types::WatchMode;
pub use types::is_at_or_below;
pub use types::join_path;
pub use types::node_name;
pub use types::parent_path;
pub use types::validate_path;
pub use watch::Watch;
pub use watch::WatchSender;
