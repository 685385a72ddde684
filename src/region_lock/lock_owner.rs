use std::fmt;

use uuid::Uuid;

/// Opaque identity a caller presents with every lock and unlock call.
/// Ownership is tracked by this token, not by guard objects: whoever locked
/// under an owner must unlock under the same owner. That contract is
/// cooperative, the manager does not enforce it, and it also means the
/// manager will not protect an owner from its own overlapping locks.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LockOwner(Uuid);

impl LockOwner {
    pub fn new() -> LockOwner {
        LockOwner(Uuid::new_v4())
    }
}

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_simple())
    }
}
