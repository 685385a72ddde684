//! Caller facing lock handles. A `RegionRwLock` is the read/write pair for
//! one exact region; the handles are cheap clones that all funnel into the
//! same granter task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use super::request::{
    GranterRequest, LockMode, LockOutcome, LockRequest, UnlockRequest, WaitPolicy,
};
use super::{LockOwner, Region, RegionLockError};

#[derive(Clone)]
pub struct RegionRwLock {
    read: RegionLock,
    write: RegionLock,
}

impl RegionRwLock {
    pub(super) fn new(
        region: Region,
        request_queue: UnboundedSender<GranterRequest>,
        closed: Arc<AtomicBool>,
        next_request_id: Arc<AtomicU64>,
    ) -> RegionRwLock {
        RegionRwLock {
            read: RegionLock {
                mode: LockMode::Read,
                region,
                request_queue: request_queue.clone(),
                closed: closed.clone(),
                next_request_id: next_request_id.clone(),
            },
            write: RegionLock {
                mode: LockMode::Write,
                region,
                request_queue,
                closed,
                next_request_id,
            },
        }
    }

    pub fn read(&self) -> &RegionLock {
        &self.read
    }

    pub fn write(&self) -> &RegionLock {
        &self.write
    }

    pub fn region(&self) -> Region {
        self.read.region
    }
}

/// One side (read or write) of a region's lock pair.
#[derive(Clone)]
pub struct RegionLock {
    mode: LockMode,
    region: Region,
    request_queue: UnboundedSender<GranterRequest>,
    closed: Arc<AtomicBool>,
    next_request_id: Arc<AtomicU64>,
}

impl RegionLock {
    /// Wait in line until the lock is granted. Fails only when the manager
    /// closes first. Dropping the returned future before it resolves is the
    /// cooperative way to cancel the wait; the granter rolls back a grant
    /// whose caller has gone away.
    pub async fn lock(&self, owner: &LockOwner) -> Result<(), RegionLockError> {
        let (_, receiver) = self.send_lock(owner, WaitPolicy::Block)?;
        match receiver.await {
            Ok(LockOutcome::Granted) => Ok(()),
            Ok(LockOutcome::Closed) => Err(RegionLockError::Closed),
            // Blocking requests are never answered NotGranted; a vanished
            // granter means the manager is gone entirely
            Ok(LockOutcome::NotGranted) | Err(_) => Err(RegionLockError::GranterGone),
        }
    }

    /// Take the lock only if it is free once our turn in the queue comes up.
    /// Never jumps a blocked head, so a `try_lock` behind a waiting writer
    /// still waits for that writer's verdict before being answered. Always
    /// `false` after close.
    pub async fn try_lock(&self, owner: &LockOwner) -> Result<bool, RegionLockError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let (_, receiver) = match self.send_lock(owner, WaitPolicy::Immediate) {
            Ok(s) => s,
            Err(RegionLockError::Closed) => return Ok(false),
            Err(e) => return Err(e),
        };
        match receiver.await {
            Ok(LockOutcome::Granted) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Wait at most `timeout` for the lock. On timeout the queued request is
    /// withdrawn so no orphaned entry can be granted to nobody later, and the
    /// result is plain `false` — distinct from the `Closed` error.
    pub async fn try_lock_for(
        &self,
        owner: &LockOwner,
        timeout: Duration,
    ) -> Result<bool, RegionLockError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let (request_id, receiver) = match self.send_lock(owner, WaitPolicy::Block) {
            Ok(s) => s,
            Err(RegionLockError::Closed) => return Ok(false),
            Err(e) => return Err(e),
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(LockOutcome::Granted)) => Ok(true),
            Ok(_) => Ok(false),
            Err(_elapsed) => {
                let _ = self
                    .request_queue
                    .send(GranterRequest::Retract { request_id });
                Ok(false)
            }
        }
    }

    /// Release a lock previously granted to `owner`. Must run under the same
    /// owner that locked; that contract is cooperative. Completes even after
    /// the manager closes, so teardown can never wedge on its own locks.
    pub async fn unlock(&self, owner: &LockOwner) -> Result<(), RegionLockError> {
        let (response, receiver) = oneshot::channel();
        self.request_queue
            .send(GranterRequest::Unlock(UnlockRequest {
                owner: *owner,
                region: self.region,
                mode: self.mode,
                response,
            }))
            .map_err(|_| RegionLockError::GranterGone)?;
        receiver.await.map_err(|_| RegionLockError::GranterGone)
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    fn send_lock(
        &self,
        owner: &LockOwner,
        wait: WaitPolicy,
    ) -> Result<(u64, oneshot::Receiver<LockOutcome>), RegionLockError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegionLockError::Closed);
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (response, receiver) = oneshot::channel();
        self.request_queue
            .send(GranterRequest::Lock(LockRequest {
                request_id,
                owner: *owner,
                region: self.region,
                mode: self.mode,
                wait,
                response,
            }))
            .map_err(|_| RegionLockError::GranterGone)?;
        Ok((request_id, receiver))
    }
}
