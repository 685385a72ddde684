//! A persistent heap of variable length records in a single paged file.
//!
//! Composition of the three layers: a `HeapManager` decides which pages a
//! record gets, a `RegionLockManager` serializes access to those pages, and
//! this module does the actual page I/O through a pool of file handles. Every
//! record is addressed by the `PersistenceId` naming its first page.
//!
//! Concurrency contract: each operation holds at most one region lock at any
//! moment, under a fresh owner. A multi page record is found by peeking at
//! its first page, releasing, then locking the whole span and revalidating.
//! Never waiting for a lock while holding one keeps the strict FIFO granter
//! deadlock free. Close waits for in flight operations to finish before
//! tearing anything down.

mod handle_pool;
mod header;

pub use header::{HeapFileHeader, HeapHeaderError};

use std::convert::TryFrom;
use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::Stream;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

use crate::constants::{DEFAULT_PAGE_SIZE, FIRST_PAGE_HEADER_SIZE};
use crate::heap_manager::{HeapConfig, HeapManager};
use crate::page_formats::{PageFlags, PageOffset, PageRange};
use crate::region_lock::{LockOwner, Region, RegionError, RegionLockError, RegionLockManager};
use handle_pool::HandlePool;

/// Stable handle to a stored record: the offset of its first page. Valid
/// until the record is removed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PersistenceId(pub PageOffset);

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record@{}", self.0)
    }
}

/// Creation time tuning. `page_size` and `alignment_padding_size` are baked
/// into the file header; the heap knobs apply to every open.
#[derive(Clone, Copy, Debug)]
pub struct HeapFileConfig {
    pub page_size: usize,
    pub alignment_padding_size: usize,
    pub heap: HeapConfig,
}

impl HeapFileConfig {
    /// Pad the page area out to a page boundary so every page lines up with
    /// the device blocks underneath.
    pub fn block_device() -> HeapFileConfig {
        HeapFileConfig {
            page_size: DEFAULT_PAGE_SIZE,
            alignment_padding_size: DEFAULT_PAGE_SIZE - HeapFileHeader::ENCODED_SIZE,
            heap: HeapConfig::default(),
        }
    }

    /// No padding, pages start right after the header. Suits backing stores
    /// where alignment buys nothing, such as memory backed filesystems.
    pub fn contiguous_memory() -> HeapFileConfig {
        HeapFileConfig {
            page_size: DEFAULT_PAGE_SIZE,
            alignment_padding_size: 0,
            heap: HeapConfig::default(),
        }
    }
}

impl Default for HeapFileConfig {
    fn default() -> Self {
        Self::block_device()
    }
}

pub struct HeapFile {
    header: HeapFileHeader,
    heap: Mutex<HeapManager>,
    region_locks: RegionLockManager,
    handles: HandlePool,
    gate: OpGate,
}

impl HeapFile {
    /// Create a new, empty heap file. Fails if `path` already exists.
    pub async fn create(path: &Path, config: HeapFileConfig) -> Result<HeapFile, HeapFileError> {
        let header = HeapFileHeader::new(config.page_size, config.alignment_padding_size)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        let mut buffer =
            BytesMut::with_capacity(HeapFileHeader::ENCODED_SIZE + header.alignment_padding_size);
        header.serialize(&mut buffer);
        buffer.resize(
            HeapFileHeader::ENCODED_SIZE + header.alignment_padding_size,
            0,
        );
        file.write_all(&buffer).await?;
        file.sync_all().await?;

        debug!(
            "Created heap file {} with page size {}",
            path.display(),
            header.page_size
        );

        Ok(HeapFile {
            header,
            heap: Mutex::new(HeapManager::new(config.heap)),
            region_locks: RegionLockManager::new(),
            handles: HandlePool::new(path),
            gate: OpGate::new(),
        })
    }

    pub async fn create_for_block_device(path: &Path) -> Result<HeapFile, HeapFileError> {
        Self::create(path, HeapFileConfig::block_device()).await
    }

    pub async fn create_for_contiguous_memory(path: &Path) -> Result<HeapFile, HeapFileError> {
        Self::create(path, HeapFileConfig::contiguous_memory()).await
    }

    /// Open an existing heap file. The on disk header wins over `config` for
    /// page geometry; only the heap tuning knobs of `config` apply.
    ///
    /// Free space is rebuilt by one linear scan of the page flags. Deleted
    /// pages and never written pages become free extents; everything else
    /// stays allocated. No record payloads are validated here, a damaged
    /// record surfaces when it is read.
    pub async fn open(path: &Path, config: HeapFileConfig) -> Result<HeapFile, HeapFileError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path).await?;

        let mut header_bytes = [0u8; HeapFileHeader::ENCODED_SIZE];
        file.read_exact(&mut header_bytes).await?;
        let header = HeapFileHeader::parse(&mut &header_bytes[..])?;

        let file_len = file.metadata().await?.len();
        let page_size = u64::try_from(header.page_size)?;
        let page_count =
            usize::try_from(file_len.saturating_sub(header.page_area_offset()) / page_size)?;

        let mut builder = HeapManager::subtractive_builder(config.heap);
        file.seek(SeekFrom::Start(header.page_area_offset())).await?;
        let mut page = vec![0u8; header.page_size];
        for i in 0..page_count {
            file.read_exact(&mut page).await?;
            let flags = PageFlags::from_bits_truncate(page[0]);
            let length = {
                let mut length_bytes = &page[1..FIRST_PAGE_HEADER_SIZE];
                length_bytes.get_u32()
            };
            // A zero flag byte with a zero length is a page that was
            // allocated but never reached by a write
            if flags.contains(PageFlags::DELETED) || (flags.is_empty() && length == 0) {
                builder.mark_area_free(PageRange::new(PageOffset(i), PageOffset(i)));
            }
        }
        let heap = builder.build(page_count);

        debug!(
            "Opened heap file {} with {} pages, {} free",
            path.display(),
            heap.size(),
            heap.free_space()
        );

        Ok(HeapFile {
            header,
            heap: Mutex::new(heap),
            region_locks: RegionLockManager::new(),
            handles: HandlePool::new(path),
            gate: OpGate::new(),
        })
    }

    /// Store a record and return the id it will answer to. With `flush` the
    /// data is on stable storage when this returns; without it the write sits
    /// in the OS cache.
    pub async fn add_record(&self, data: Bytes, flush: bool) -> Result<PersistenceId, HeapFileError> {
        let _ticket = self.gate.begin()?;

        if data.is_empty() {
            return Err(HeapFileError::RecordEmpty);
        }
        if u32::try_from(data.len()).is_err() {
            return Err(HeapFileError::RecordTooLarge(data.len()));
        }

        let pages_needed = self.header.pages_for_record(data.len());
        let span = {
            let mut heap = self.heap.lock().await;
            let full = heap
                .allocate(pages_needed, true)
                .ok_or(HeapFileError::OutOfSpace(pages_needed))?;
            // An over-allocated tail goes straight back so the record's page
            // count can always be recomputed from its length
            if full.length() > pages_needed {
                let span = PageRange::from_length(full.first, pages_needed);
                heap.free(PageRange::new(span.end(), full.last));
                span
            } else {
                full
            }
        };

        let owner = LockOwner::new();
        let lock = self.region_locks.get(self.page_region(span)?).await?;
        lock.write().lock(&owner).await?;
        let written = self.write_record(span, &data, flush).await;
        lock.write().unlock(&owner).await?;

        if let Err(e) = written {
            self.heap.lock().await.free(span);
            return Err(e);
        }
        Ok(PersistenceId(span.first))
    }

    /// Read a record and run `action` over its payload while no writer can
    /// touch it. The payload slice is only valid inside `action`; to keep the
    /// bytes, copy them out (or return the `Bytes` via `action`).
    pub async fn use_record<T, F>(&self, id: PersistenceId, action: F) -> Result<T, HeapFileError>
    where
        F: FnOnce(&[u8]) -> T,
    {
        let _ticket = self.gate.begin()?;
        self.check_bounds(id).await?;

        let owner = LockOwner::new();
        let read = self.read_record(&owner, id.0).await;

        match Self::map_unwritten(read, id)? {
            PageRead::Record { payload, .. } => Ok(action(&payload)),
            PageRead::Deleted => Err(HeapFileError::InvalidReference(id, "record was removed")),
            PageRead::Continuation => Err(HeapFileError::InvalidReference(
                id,
                "points into the middle of a record",
            )),
            PageRead::Blank => Err(HeapFileError::InvalidReference(id, "page was never written")),
        }
    }

    /// Remove a record and hand its pages back to the allocator. The id is
    /// dead afterwards; later reads of it fail with `InvalidReference`.
    pub async fn remove_record(&self, id: PersistenceId) -> Result<(), HeapFileError> {
        let _ticket = self.gate.begin()?;
        self.check_bounds(id).await?;

        let owner = LockOwner::new();
        let span = self.remove_locked(&owner, id).await?;
        self.heap.lock().await.free(span);
        debug!("Removed {} spanning {}", id, span);
        Ok(())
    }

    /// Every live record in first page order. The scan is lazy: pages are
    /// only read as the stream is polled, and records added behind the cursor
    /// while it runs will be seen. Each polled step checks the close gate, so
    /// an abandoned stream never holds the file open; a closed file ends the
    /// stream with `Closed`.
    pub fn all_records(
        &self,
    ) -> impl Stream<Item = Result<(PersistenceId, Bytes), HeapFileError>> + '_ {
        try_stream! {
            let mut offset = PageOffset(0);
            loop {
                let ticket = self.gate.begin()?;
                let total = { self.heap.lock().await.size() };
                if offset.0 >= total {
                    break;
                }

                let owner = LockOwner::new();
                let read = self.read_record(&owner, offset).await;

                let page = match read {
                    Ok(p) => p,
                    // Allocated tail pages the file does not reach yet
                    Err(HeapFileError::IoError(ref e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break;
                    }
                    Err(e) => Err(e)?,
                };
                drop(ticket);

                match page {
                    PageRead::Record { payload, span } => {
                        let id = PersistenceId(offset);
                        offset = span.end();
                        yield (id, payload);
                    }
                    PageRead::Deleted | PageRead::Continuation | PageRead::Blank => {
                        offset = offset.next();
                    }
                }
            }
        }
    }

    /// Shut the file down. New operations fail `Closed` immediately, in
    /// flight ones are waited out, then the lock manager closes and the idle
    /// handles drop. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), HeapFileError> {
        if !self.gate.close_and_drain().await {
            return Ok(());
        }
        self.region_locks.close().await?;
        self.handles.clear();
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size
    }

    /// Pages currently under management, free or not.
    pub async fn page_count(&self) -> usize {
        self.heap.lock().await.size()
    }

    pub async fn free_page_count(&self) -> usize {
        self.heap.lock().await.free_space()
    }

    async fn check_bounds(&self, id: PersistenceId) -> Result<(), HeapFileError> {
        let total = self.heap.lock().await.size();
        if id.0 .0 >= total {
            return Err(HeapFileError::InvalidReference(
                id,
                "beyond the end of the heap",
            ));
        }
        Ok(())
    }

    /// Read the record starting at `first`, taking and releasing its own
    /// read locks. Starts with a lock on the first page; when that page says
    /// the record is longer, the lock is released and retaken over the whole
    /// span, and the first page is read again in case the record changed in
    /// the gap.
    async fn read_record(
        &self,
        owner: &LockOwner,
        first: PageOffset,
    ) -> Result<PageRead, HeapFileError> {
        let mut handle = self.handles.acquire().await?;
        let mut page = vec![0u8; self.header.page_size];

        let mut locked_span = PageRange::new(first, first);
        loop {
            let lock = self.region_locks.get(self.page_region(locked_span)?).await?;
            lock.read().lock(owner).await?;
            let step = self
                .read_span(handle.file(), first, locked_span, &mut page)
                .await;
            lock.read().unlock(owner).await?;

            match step? {
                SpanStep::Done(read) => return Ok(read),
                SpanStep::Widen(span) => locked_span = span,
            }
        }
    }

    /// One attempt at reading the record under a held lock over
    /// `locked_span`.
    async fn read_span(
        &self,
        file: &mut tokio::fs::File,
        first: PageOffset,
        locked_span: PageRange,
        page: &mut [u8],
    ) -> Result<SpanStep<PageRead>, HeapFileError> {
        self.read_page(file, first, page).await?;

        let flags = PageFlags::from_bits_truncate(page[0]);
        if flags.contains(PageFlags::DELETED) {
            return Ok(SpanStep::Done(PageRead::Deleted));
        }
        if flags.contains(PageFlags::CONTINUATION) {
            return Ok(SpanStep::Done(PageRead::Continuation));
        }

        let length = {
            let mut length_bytes = &page[1..FIRST_PAGE_HEADER_SIZE];
            length_bytes.get_u32() as usize
        };
        if length == 0 {
            return Ok(SpanStep::Done(PageRead::Blank));
        }

        let span = PageRange::from_length(first, self.header.pages_for_record(length));
        if span.last > locked_span.last {
            return Ok(SpanStep::Widen(span));
        }

        let first_take = length.min(self.header.first_page_capacity());
        let mut payload = BytesMut::with_capacity(length);
        payload.put_slice(&page[FIRST_PAGE_HEADER_SIZE..FIRST_PAGE_HEADER_SIZE + first_take]);

        let mut remaining = length - first_take;
        let mut offset = first.next();
        while offset <= span.last {
            self.read_page(file, offset, page).await?;

            let flags = PageFlags::from_bits_truncate(page[0]);
            if flags != PageFlags::CONTINUATION {
                return Err(HeapFileError::InvalidReference(
                    PersistenceId(first),
                    "record is torn, a continuation page is missing",
                ));
            }

            let take = remaining.min(self.header.continuation_page_capacity());
            payload.put_slice(&page[1..1 + take]);
            remaining -= take;
            offset = offset.next();
        }

        Ok(SpanStep::Done(PageRead::Record {
            payload: payload.freeze(),
            span,
        }))
    }

    /// Validate the record at `id` and flag its whole span deleted, under a
    /// write lock over the full span. Same widen and revalidate dance as
    /// reading: the span is only known after the first page is read.
    async fn remove_locked(
        &self,
        owner: &LockOwner,
        id: PersistenceId,
    ) -> Result<PageRange, HeapFileError> {
        let mut handle = self.handles.acquire().await?;
        let mut page = vec![0u8; self.header.page_size];

        let mut locked_span = PageRange::new(id.0, id.0);
        loop {
            let lock = self.region_locks.get(self.page_region(locked_span)?).await?;
            lock.write().lock(owner).await?;
            let step = self
                .remove_span(handle.file(), id, locked_span, &mut page)
                .await;
            lock.write().unlock(owner).await?;

            match step? {
                SpanStep::Done(span) => return Ok(span),
                SpanStep::Widen(span) => locked_span = span,
            }
        }
    }

    async fn remove_span(
        &self,
        file: &mut tokio::fs::File,
        id: PersistenceId,
        locked_span: PageRange,
        page: &mut [u8],
    ) -> Result<SpanStep<PageRange>, HeapFileError> {
        let read = self.read_page(file, id.0, page).await;
        Self::map_unwritten(read, id)?;

        let flags = PageFlags::from_bits_truncate(page[0]);
        if flags.contains(PageFlags::DELETED) {
            return Err(HeapFileError::InvalidReference(id, "record was removed"));
        }
        if flags.contains(PageFlags::CONTINUATION) {
            return Err(HeapFileError::InvalidReference(
                id,
                "points into the middle of a record",
            ));
        }
        let length = {
            let mut length_bytes = &page[1..FIRST_PAGE_HEADER_SIZE];
            length_bytes.get_u32() as usize
        };
        if length == 0 {
            return Err(HeapFileError::InvalidReference(id, "page was never written"));
        }

        let span = PageRange::from_length(id.0, self.header.pages_for_record(length));
        if span.last > locked_span.last {
            return Ok(SpanStep::Widen(span));
        }

        self.mark_deleted(file, span).await?;
        Ok(SpanStep::Done(span))
    }

    async fn write_record(
        &self,
        span: PageRange,
        payload: &[u8],
        flush: bool,
    ) -> Result<(), HeapFileError> {
        let mut handle = self.handles.acquire().await?;
        let file = handle.file();
        file.seek(SeekFrom::Start(self.page_seek(span.first)?)).await?;

        // Pages are laid out contiguously so one seek covers the whole span
        let mut page = BytesMut::with_capacity(self.header.page_size);
        page.put_u8(PageFlags::empty().bits());
        page.put_u32(payload.len() as u32);
        let first_take = payload.len().min(self.header.first_page_capacity());
        page.put_slice(&payload[..first_take]);
        page.resize(self.header.page_size, 0);
        file.write_all(&page).await?;

        let mut written = first_take;
        while written < payload.len() {
            let take = (payload.len() - written).min(self.header.continuation_page_capacity());
            page.clear();
            page.put_u8(PageFlags::CONTINUATION.bits());
            page.put_slice(&payload[written..written + take]);
            page.resize(self.header.page_size, 0);
            file.write_all(&page).await?;
            written += take;
        }

        if flush {
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Only the flag bytes change; record length and payload stay on disk
    /// until the pages are reused.
    async fn mark_deleted(
        &self,
        file: &mut tokio::fs::File,
        span: PageRange,
    ) -> Result<(), HeapFileError> {
        file.seek(SeekFrom::Start(self.page_seek(span.first)?)).await?;
        file.write_all(&[PageFlags::DELETED.bits()]).await?;

        let mut offset = span.first.next();
        while offset <= span.last {
            file.seek(SeekFrom::Start(self.page_seek(offset)?)).await?;
            file.write_all(&[(PageFlags::DELETED | PageFlags::CONTINUATION).bits()])
                .await?;
            offset = offset.next();
        }

        file.sync_data().await?;
        Ok(())
    }

    async fn read_page(
        &self,
        file: &mut tokio::fs::File,
        page: PageOffset,
        buffer: &mut [u8],
    ) -> Result<(), HeapFileError> {
        file.seek(SeekFrom::Start(self.page_seek(page)?)).await?;
        file.read_exact(buffer).await?;
        Ok(())
    }

    /// Absolute file offset of a page.
    fn page_seek(&self, page: PageOffset) -> Result<u64, HeapFileError> {
        let index = u64::try_from(page.0)?;
        let size = u64::try_from(self.header.page_size)?;
        Ok(self.header.page_area_offset() + index * size)
    }

    fn page_region(&self, range: PageRange) -> Result<Region, HeapFileError> {
        let first = u64::try_from(range.first.0)?;
        let last = u64::try_from(range.last.0)?;
        Ok(Region::new(first, last)?)
    }

    /// A read off the end of the file means the page was allocated but never
    /// written, which callers with an id in hand see as a bad reference.
    fn map_unwritten<T>(
        result: Result<T, HeapFileError>,
        id: PersistenceId,
    ) -> Result<T, HeapFileError> {
        match result {
            Err(HeapFileError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Err(HeapFileError::InvalidReference(id, "page was never written"))
            }
            other => other,
        }
    }
}

/// What one page turned out to hold.
enum PageRead {
    Record { payload: Bytes, span: PageRange },
    Deleted,
    Continuation,
    Blank,
}

/// Outcome of one locked attempt at a record whose span was guessed from an
/// earlier peek. `Widen` means the guess was too small and the attempt must
/// be redone under a lock covering the given span.
enum SpanStep<T> {
    Done(T),
    Widen(PageRange),
}

/// Counts operations in flight so close can wait for them. `begin` hands out
/// a ticket that counts until dropped; after `close_and_drain` no new tickets
/// are issued.
struct OpGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl OpGate {
    fn new() -> OpGate {
        OpGate {
            inner: Arc::new(GateInner {
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    fn begin(&self) -> Result<OpTicket, HeapFileError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HeapFileError::Closed);
        }
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        // Close may have landed between the check and the increment
        if self.inner.closed.load(Ordering::Acquire) {
            if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.inner.drained.notify_waiters();
            }
            return Err(HeapFileError::Closed);
        }
        Ok(OpTicket {
            inner: self.inner.clone(),
        })
    }

    /// Returns false when the gate was already closed.
    async fn close_and_drain(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }
        true
    }
}

struct OpTicket {
    inner: Arc<GateInner>,
}

impl Drop for OpTicket {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

#[derive(Debug, Error)]
pub enum HeapFileError {
    #[error("Heap file is closed")]
    Closed,
    #[error(transparent)]
    ConversionError(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    HeaderError(#[from] HeapHeaderError),
    #[error("Invalid record reference {0}: {1}")]
    InvalidReference(PersistenceId, &'static str),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("No space for an allocation of {0} pages")]
    OutOfSpace(usize),
    #[error("Records must not be empty")]
    RecordEmpty,
    #[error("Record of {0} bytes exceeds the maximum record size")]
    RecordTooLarge(usize),
    #[error(transparent)]
    RegionError(#[from] RegionError),
    #[error(transparent)]
    RegionLockError(#[from] RegionLockError),
}
