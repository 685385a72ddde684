//! Fairness ordered reader/writer locks over arbitrary, possibly overlapping
//! integer ranges of one shared resource. One manager instance guards one
//! resource; anything range addressed can lean on it — heap files do, and an
//! in memory index can use the exact same type.
//!
//! All lock state lives in a single spawned granter task and callers only
//! ever talk to it over a request channel. That yields one strict, fair,
//! first come first served grant order and leaves no shared bookkeeping to
//! lock around.

mod granter;
mod lock_owner;
mod region;
mod region_lock;
mod request;

pub use lock_owner::LockOwner;
pub use region::{Region, RegionError};
pub use region_lock::{RegionLock, RegionRwLock};
pub use request::{LockMode, LockOutcome};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use moka::future::Cache;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::constants::MAX_LOCK_CACHE;
use granter::LockGranter;
use request::GranterRequest;

#[derive(Clone)]
pub struct RegionLockManager {
    /// Identifies the resource this manager guards in logs and errors.
    resource_key: Uuid,
    request_queue: UnboundedSender<GranterRequest>,
    lock_cache: Cache<Region, RegionRwLock>,
    closed: Arc<AtomicBool>,
    next_request_id: Arc<AtomicU64>,
}

impl RegionLockManager {
    pub fn new() -> RegionLockManager {
        let (request_queue, receive_queue) = mpsc::unbounded_channel();

        let mut granter = LockGranter::new(receive_queue);
        tokio::spawn(async move {
            granter.start().await;
        });

        RegionLockManager {
            resource_key: Uuid::new_v4(),
            request_queue,
            lock_cache: Cache::new(MAX_LOCK_CACHE),
            closed: Arc::new(AtomicBool::new(false)),
            next_request_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the read/write lock pair for an exact region. Pairs are cached so
    /// repeated gets for the same region stay cheap.
    pub async fn get(&self, region: Region) -> Result<RegionRwLock, RegionLockError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegionLockError::Closed);
        }

        let request_queue = self.request_queue.clone();
        let closed = self.closed.clone();
        let next_request_id = self.next_request_id.clone();
        Ok(self
            .lock_cache
            .get_or_insert_with(region, async move {
                RegionRwLock::new(region, request_queue, closed, next_request_id)
            })
            .await)
    }

    /// Stop granting. Queued and future lock requests fail closed, `get`
    /// fails closed, releases keep working so current holders can tear down.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), RegionLockError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Closing region lock manager {}", self.resource_key);

        let (response, receiver) = oneshot::channel();
        self.request_queue
            .send(GranterRequest::Close { response })
            .map_err(|_| RegionLockError::GranterGone)?;
        receiver.await.map_err(|_| RegionLockError::GranterGone)
    }

    pub fn resource_key(&self) -> Uuid {
        self.resource_key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for RegionLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum RegionLockError {
    #[error("Lock manager is closed")]
    Closed,
    #[error("Lock granter is no longer running")]
    GranterGone,
    #[error(transparent)]
    RegionError(#[from] RegionError),
}
