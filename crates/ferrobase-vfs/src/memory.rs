//! In-memory backend for tests.
//!
//! A shared `Vec<u8>` behind a mutex; clones of a handle observe the
//! same bytes, which lets tests hold an inspection handle while the log
//! owns the working one. Flush calls are counted so durability protocols
//! can be asserted on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ferrobase_error::{FerroError, Result};

use crate::traits::FileIo;

#[derive(Debug, Default)]
struct Storage {
    data: Vec<u8>,
}

/// In-memory file. Cloning shares the underlying storage.
#[derive(Clone)]
pub struct MemFileIo {
    storage: Arc<Mutex<Storage>>,
    flushes: Arc<AtomicU64>,
    durable_writes: bool,
}

impl MemFileIo {
    /// Create an empty in-memory file that requires explicit flushes.
    pub fn new() -> Self {
        Self::with_size(0)
    }

    /// Create a zero-filled in-memory file of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self {
            storage: Arc::new(Mutex::new(Storage {
                data: vec![0; size],
            })),
            flushes: Arc::new(AtomicU64::new(0)),
            durable_writes: false,
        }
    }

    /// Mark writes as inherently durable (models the pmem backend).
    #[must_use]
    pub fn durable(mut self) -> Self {
        self.durable_writes = true;
        self
    }

    /// Number of `flush_data_only` calls so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Copy of the current file contents.
    pub fn contents(&self) -> Vec<u8> {
        self.storage.lock().expect("mem file poisoned").data.clone()
    }
}

impl Default for MemFileIo {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIo for MemFileIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let storage = self.storage.lock().expect("mem file poisoned");
        let offset = usize::try_from(offset).map_err(|_| FerroError::internal("offset overflow"))?;
        let end = offset + buf.len();
        if end > storage.data.len() {
            return Err(FerroError::ShortRead {
                path: "<memory>".into(),
                expected: buf.len(),
                actual: storage.data.len().saturating_sub(offset),
            });
        }
        buf.copy_from_slice(&storage.data[offset..end]);
        Ok(())
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut storage = self.storage.lock().expect("mem file poisoned");
        let offset = usize::try_from(offset).map_err(|_| FerroError::internal("offset overflow"))?;
        let end = offset + buf.len();
        if end > storage.data.len() {
            storage.data.resize(end, 0);
        }
        storage.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush_data_only(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn writes_are_durable(&self) -> bool {
        self.durable_writes
    }

    fn size(&self) -> Result<u64> {
        Ok(self.storage.lock().expect("mem file poisoned").data.len() as u64)
    }
}
