#![forbid(unsafe_code)]

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate log;

//Application Imports/Exports
pub mod constants;
pub mod heap_file;
pub mod heap_manager;
pub mod page_formats;
pub mod region_lock;

pub use heap_file::{HeapFile, HeapFileConfig, HeapFileError, PersistenceId};
pub use heap_manager::{HeapConfig, HeapManager};
pub use region_lock::{LockOwner, Region, RegionLockError, RegionLockManager};
