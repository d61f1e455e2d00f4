//! Access control for mapped GPU memory.
//!
//! A mapping remembers the principal that created it. Later lookups by
//! handle consult an [`AccessPolicy`] with the mapping's owner and the
//! requesting principal; a refused lookup looks exactly like an unknown
//! handle.

use std::fmt;

/// Identity of a requester (effective user id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Principal(pub u32);

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={}", self.0)
    }
}

/// Decides whether `requester` may use a mapping created by `owner`.
pub trait AccessPolicy: Send + Sync {
    /// Returns true if access is permitted.
    fn permits(&self, owner: Principal, requester: Principal) -> bool;
}

/// Only the principal that mapped the memory may use it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SameOwner;

impl AccessPolicy for SameOwner {
    fn permits(&self, owner: Principal, requester: Principal) -> bool {
        owner == requester
    }
}
