//! Deterministic mapping from logical names to store paths.
//!
//! Every process sharing a root derives the same layout:
//!
//! ```text
//! /<root>/cluster/nodes/<node-id>
//! /<root>/asyncMap/<map>/<key-hash>
//! /<root>/asyncMultiMap/<map>/<key-hash>/<value-hash>
//! /<root>/locks/<lock>/ticket-<attempt id>-<sequence>
//! /<root>/counters/<counter>
//! ```
//!
//! Logical names are percent-escaped into a single path segment. Keys and
//! values are hashed with BLAKE3 over their serialized bytes, so arbitrary
//! user keys never produce invalid or nested paths.

use canopy_store::join_path;
use canopy_store::validate_path;

use crate::constants::ASYNC_MAP_PATH;
use crate::constants::ASYNC_MULTI_MAP_PATH;
use crate::constants::CLUSTER_NODES_PATH;
use crate::constants::COUNTERS_PATH;
use crate::constants::LOCK_TICKET_PREFIX;
use crate::constants::LOCKS_PATH;
use crate::error::CoordinationError;

/// Path layout rooted at a configurable prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNamespace {
    root: String,
}

impl PathNamespace {
    /// Create a namespace under `root`. Leading and trailing slashes are
    /// ignored, so `"canopy"`, `"/canopy"` and `"/canopy/"` are equivalent.
    pub fn new(root: &str) -> Result<Self, CoordinationError> {
        let trimmed = root.trim_matches('/');
        if trimmed.is_empty() {
            return Err(CoordinationError::CorruptedData {
                path: root.to_string(),
                reason: "namespace root must not be empty".to_string(),
            });
        }
        let root = format!("/{trimmed}");
        validate_path(&root)?;
        Ok(Self { root })
    }

    /// Absolute root path.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Persistent structural nodes that `open` makes sure exist.
    pub fn layout(&self) -> Vec<String> {
        vec![
            self.root.clone(),
            self.nodes_path(),
            self.maps_path(),
            self.multimaps_path(),
            self.locks_path(),
            self.counters_path(),
        ]
    }

    pub fn nodes_path(&self) -> String {
        join_path(&self.root, CLUSTER_NODES_PATH)
    }

    /// Membership node of one process.
    pub fn node_path(&self, node_id: &str) -> String {
        join_path(&self.nodes_path(), &escape_segment(node_id))
    }

    pub fn maps_path(&self) -> String {
        join_path(&self.root, ASYNC_MAP_PATH)
    }

    pub fn map_path(&self, map_name: &str) -> String {
        join_path(&self.maps_path(), &escape_segment(map_name))
    }

    /// Entry node for a serialized key.
    pub fn map_entry_path(&self, map_name: &str, key: &[u8]) -> String {
        join_path(&self.map_path(map_name), &hash_segment(key))
    }

    pub fn multimaps_path(&self) -> String {
        join_path(&self.root, ASYNC_MULTI_MAP_PATH)
    }

    pub fn multimap_path(&self, map_name: &str) -> String {
        join_path(&self.multimaps_path(), &escape_segment(map_name))
    }

    /// Key node for a serialized key; its children are the values.
    pub fn multimap_key_path(&self, map_name: &str, key: &[u8]) -> String {
        join_path(&self.multimap_path(map_name), &hash_segment(key))
    }

    pub fn multimap_value_path(&self, map_name: &str, key: &[u8], value: &[u8]) -> String {
        join_path(&self.multimap_key_path(map_name, key), &hash_segment(value))
    }

    pub fn locks_path(&self) -> String {
        join_path(&self.root, LOCKS_PATH)
    }

    /// Queue node of one lock name.
    pub fn lock_path(&self, lock_name: &str) -> String {
        join_path(&self.locks_path(), &escape_segment(lock_name))
    }

    /// Path passed to a sequential create to obtain a ticket.
    pub fn lock_ticket_prefix(&self, lock_name: &str) -> String {
        join_path(&self.lock_path(lock_name), LOCK_TICKET_PREFIX)
    }

    pub fn counters_path(&self) -> String {
        join_path(&self.root, COUNTERS_PATH)
    }

    pub fn counter_path(&self, counter_name: &str) -> String {
        join_path(&self.counters_path(), &escape_segment(counter_name))
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.')
}

/// Escape a logical name into one valid, injective path segment.
///
/// Bytes outside `[A-Za-z0-9._-]` become `%XX`. The segments `.` and `..`
/// are fully escaped and the empty name maps to a lone `%`, which no other
/// input can produce.
pub fn escape_segment(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let dots_only = name.bytes().all(|b| b == b'.') && name.len() <= 2;
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if is_unreserved(byte) && !(dots_only && byte == b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Invert [`escape_segment`]. Returns `None` for input it cannot produce.
pub fn unescape_segment(segment: &str) -> Option<String> {
    if segment == "%" {
        return Some(String::new());
    }
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Stable hash segment for serialized keys and values.
pub fn hash_segment(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
