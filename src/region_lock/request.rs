//! Request and response types passed between callers and the granter task.

use tokio::sync::oneshot::Sender;

use super::{LockOwner, Region};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    Read,
    Write,
}

/// What an ungrantable request does once it reaches the head of the queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitPolicy {
    /// Hold the head position until a release makes the grant possible.
    Block,
    /// Answer `NotGranted` immediately so the queue keeps moving.
    Immediate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockOutcome {
    Granted,
    NotGranted,
    Closed,
}

#[derive(Debug)]
pub enum GranterRequest {
    Lock(LockRequest),
    Unlock(UnlockRequest),
    /// Withdraw a queued lock request after a client side timeout. If the
    /// grant won the race this behaves as an unlock instead, so neither a
    /// queue entry nor a lock can leak.
    Retract { request_id: u64 },
    Close { response: Sender<()> },
}

#[derive(Debug)]
pub struct LockRequest {
    pub request_id: u64,
    pub owner: LockOwner,
    pub region: Region,
    pub mode: LockMode,
    pub wait: WaitPolicy,
    pub response: Sender<LockOutcome>,
}

#[derive(Debug)]
pub struct UnlockRequest {
    pub owner: LockOwner,
    pub region: Region,
    pub mode: LockMode,
    pub response: Sender<()>,
}
