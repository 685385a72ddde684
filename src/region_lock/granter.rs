//! The granter task is the only place lock state lives and the only place
//! grant decisions are made. One granter per managed resource; running the
//! bookkeeping in a single task gives one strict, total order over all
//! callers and leaves nothing for them to deadlock on.
//!
//! Requests are served strictly in arrival order. When the head of the queue
//! cannot be granted nothing behind it is considered until a release changes
//! the picture; later arrivals never jump a blocked head. Deterministic and
//! starvation free, at the cost of some idle concurrency.

use std::collections::VecDeque;

use tokio::sync::mpsc::UnboundedReceiver;

use super::request::{GranterRequest, LockMode, LockOutcome, LockRequest, WaitPolicy};
use super::{LockOwner, Region};

/// An active holder. The request id ties a grant back to its request so a
/// raced retract can still release it.
#[derive(Debug)]
struct Holder {
    request_id: u64,
    owner: LockOwner,
    region: Region,
}

pub struct LockGranter {
    receive_queue: UnboundedReceiver<GranterRequest>,
    /// Pending lock requests in strict arrival order.
    pending: VecDeque<LockRequest>,
    /// Active holders sorted by region start for the overlap scans.
    readers: Vec<Holder>,
    writers: Vec<Holder>,
    closed: bool,
}

impl LockGranter {
    pub fn new(receive_queue: UnboundedReceiver<GranterRequest>) -> LockGranter {
        LockGranter {
            receive_queue,
            pending: VecDeque::new(),
            readers: Vec::new(),
            writers: Vec::new(),
            closed: false,
        }
    }

    /// Runs until every sender handle is gone. Close only stops grants;
    /// releases keep flowing so holders can always tear down.
    pub async fn start(&mut self) {
        while let Some(request) = self.receive_queue.recv().await {
            match request {
                GranterRequest::Lock(lock) => {
                    if self.closed {
                        let _ = lock.response.send(LockOutcome::Closed);
                    } else {
                        self.pending.push_back(lock);
                    }
                }
                GranterRequest::Unlock(unlock) => {
                    self.release(unlock.owner, unlock.region, unlock.mode);
                    let _ = unlock.response.send(());
                }
                GranterRequest::Retract { request_id } => {
                    self.retract(request_id);
                }
                GranterRequest::Close { response } => {
                    self.closed = true;
                    for lock in self.pending.drain(..) {
                        let _ = lock.response.send(LockOutcome::Closed);
                    }
                    let _ = response.send(());
                }
            }

            self.grant_from_head();
        }
        debug!("Lock granter shutting down");
    }

    /// Work the queue from the front, stopping at the first request that has
    /// to wait.
    fn grant_from_head(&mut self) {
        while let Some(head) = self.pending.front() {
            if self.grantable(head) {
                let lock = match self.pending.pop_front() {
                    Some(s) => s,
                    None => break,
                };
                let request_id = lock.request_id;
                let holder = Holder {
                    request_id,
                    owner: lock.owner,
                    region: lock.region,
                };
                match lock.mode {
                    LockMode::Read => Self::insert_sorted(&mut self.readers, holder),
                    LockMode::Write => Self::insert_sorted(&mut self.writers, holder),
                }
                if lock.response.send(LockOutcome::Granted).is_err() {
                    // The caller stopped waiting, roll the grant back
                    self.release_by_id(request_id);
                }
            } else if head.wait == WaitPolicy::Immediate {
                if let Some(lock) = self.pending.pop_front() {
                    let _ = lock.response.send(LockOutcome::NotGranted);
                }
            } else {
                break;
            }
        }
    }

    /// A write is grantable iff no other owner holds an overlapping lock of
    /// either kind. A read only conflicts with other owners' writes. Holders
    /// belonging to the requesting owner never conflict, which is what allows
    /// nested acquisition by one caller.
    fn grantable(&self, request: &LockRequest) -> bool {
        if Self::overlapped_by_other(&self.writers, request) {
            return false;
        }
        match request.mode {
            LockMode::Read => true,
            LockMode::Write => !Self::overlapped_by_other(&self.readers, request),
        }
    }

    fn overlapped_by_other(holders: &[Holder], request: &LockRequest) -> bool {
        for holder in holders {
            if holder.region.first() > request.region.last() {
                // Sorted by start, nothing further along can overlap
                break;
            }
            if holder.owner != request.owner && holder.region.overlaps(&request.region) {
                return true;
            }
        }
        false
    }

    fn insert_sorted(holders: &mut Vec<Holder>, holder: Holder) {
        let idx = holders.partition_point(|h| h.region.first() < holder.region.first());
        holders.insert(idx, holder);
    }

    fn release(&mut self, owner: LockOwner, region: Region, mode: LockMode) {
        let holders = match mode {
            LockMode::Read => &mut self.readers,
            LockMode::Write => &mut self.writers,
        };
        match holders
            .iter()
            .position(|h| h.owner == owner && h.region == region)
        {
            Some(idx) => {
                holders.remove(idx);
            }
            None => {
                warn!(
                    "Release of a {:?} lock on {} that {} does not hold",
                    mode, region, owner
                );
            }
        }
    }

    fn retract(&mut self, request_id: u64) {
        if let Some(idx) = self
            .pending
            .iter()
            .position(|r| r.request_id == request_id)
        {
            self.pending.remove(idx);
            return;
        }
        // The grant won the race against the timeout
        self.release_by_id(request_id);
    }

    fn release_by_id(&mut self, request_id: u64) {
        if let Some(idx) = self.readers.iter().position(|h| h.request_id == request_id) {
            self.readers.remove(idx);
            return;
        }
        if let Some(idx) = self.writers.iter().position(|h| h.request_id == request_id) {
            self.writers.remove(idx);
        }
    }
}
