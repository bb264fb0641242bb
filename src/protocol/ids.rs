//! Type-safe wrapper for protocol request identifiers.
//!
//! The relay mints an id for every proxied request; the newtype keeps those
//! ids from being confused with other strings at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a proxied HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Mint a fresh id for a locally constructed request (replay copies).
    pub fn generate() -> Self {
        RequestId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s)
    }
}
