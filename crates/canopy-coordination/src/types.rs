//! Small types shared by several primitives.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Fencing token handed to a lock holder.
///
/// Tokens for the same lock name strictly increase across successive
/// holders. A protected resource should reject requests carrying a token
/// lower than the highest it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);

impl FencingToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current Unix timestamp in milliseconds, or 0 if the clock is before the epoch.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fencing_tokens_order() {
        assert!(FencingToken::new(3) < FencingToken::new(4));
        assert_eq!(FencingToken(7).to_string(), "7");
        assert!(now_unix_ms() > 0);
    }
}
