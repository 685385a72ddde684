//! System wide settings for the on disk format and resource limits.

/// Version tag written as the first four bytes of every heap file. Files
/// carrying any other value are rejected at open.
pub const FORMAT_VERSION: u32 = 0x0000_0001;

/// Default page size. Every page is read and written whole.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Bytes consumed on a record's first page by the flag byte plus the
/// big endian u32 record length.
pub const FIRST_PAGE_HEADER_SIZE: usize = 5;

/// Bytes consumed on a continuation page by the flag byte.
pub const CONTINUATION_PAGE_HEADER_SIZE: usize = 1;

/// How many idle file handles a heap file keeps around for reuse. Handles
/// checked out past this count are simply closed on return.
pub const MAX_IDLE_HANDLE_COUNT: usize = 16;

/// Number of read/write lock pairs each lock manager caches.
pub const MAX_LOCK_CACHE: usize = 1000;
