//! Type-safe ID wrappers.
//!
//! These newtypes prevent accidentally mixing up a forward's registry id
//! with a per-connection session id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier of an active forward
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardId(pub String);

impl ForwardId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        ForwardId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ForwardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ForwardId {
    fn from(s: String) -> Self {
        ForwardId(s)
    }
}

impl From<&str> for ForwardId {
    fn from(s: &str) -> Self {
        ForwardId(s.to_string())
    }
}

/// Identifier of one bridged local connection, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}
