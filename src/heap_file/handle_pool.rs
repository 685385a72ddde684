//! Every in flight operation checks out its own file handle so concurrent
//! callers never fight over one seek position. Handles go back to the pool
//! when the checkout drops. Correctness across handles comes from the region
//! locks above this layer, never from the file API itself.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs::{File, OpenOptions};

use crate::constants::MAX_IDLE_HANDLE_COUNT;

pub struct HandlePool {
    path: PathBuf,
    idle: Arc<Mutex<Vec<File>>>,
}

impl HandlePool {
    pub fn new(path: &Path) -> HandlePool {
        HandlePool {
            path: path.to_path_buf(),
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Check out an idle handle, opening a fresh one when the pool is empty.
    pub async fn acquire(&self) -> Result<PooledHandle, std::io::Error> {
        let existing = match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            // A poisoned pool just means we open fresh handles from here on
            Err(_) => None,
        };

        let file = match existing {
            Some(s) => s,
            None => {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&self.path)
                    .await?
            }
        };

        Ok(PooledHandle {
            file: Some(file),
            idle: self.idle.clone(),
        })
    }

    /// Drop every idle handle. Checked out handles close on their own once
    /// the operations holding them finish.
    pub fn clear(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }

    pub fn idle_count(&self) -> usize {
        match self.idle.lock() {
            Ok(idle) => idle.len(),
            Err(_) => 0,
        }
    }
}

/// A checked out file handle. Dropping it returns the handle to the pool.
pub struct PooledHandle {
    file: Option<File>,
    idle: Arc<Mutex<Vec<File>>>,
}

impl PooledHandle {
    pub fn file(&mut self) -> &mut File {
        // The Option only exists so Drop can move the handle back out
        self.file.as_mut().expect("handle taken before drop")
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Ok(mut idle) = self.idle.lock() {
                if idle.len() < MAX_IDLE_HANDLE_COUNT {
                    idle.push(file);
                }
            }
        }
    }
}
