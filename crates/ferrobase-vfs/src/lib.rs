//! Durable file backends for the FerroBase redo log.
//!
//! [`FileIo`] is the uniform contract over random-access reads,
//! positional writes, and data-only flushes. Three backends implement
//! it: conventional fd I/O ([`OsFileIo`]), a persistent-memory mapping
//! ([`PmemFileIo`], Linux only), and an in-memory file for tests
//! ([`MemFileIo`]). [`LogFile`] pairs a path with whichever backend the
//! open-time pmem probe selects.

pub mod memory;
pub mod os;
pub mod pmem;
pub mod traits;

use std::path::{Path, PathBuf};

use ferrobase_error::{FerroError, Result};
use tracing::info;

pub use memory::MemFileIo;
pub use os::OsFileIo;
#[cfg(target_os = "linux")]
pub use pmem::PmemFileIo;
pub use traits::{FileIo, FlushMethod};

/// A log file: a path plus the backend chosen when it was opened.
pub struct LogFile {
    path: PathBuf,
    io: Option<Box<dyn FileIo>>,
}

impl LogFile {
    /// Create a closed handle for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: None,
        }
    }

    /// Create an already-open handle over an explicit backend.
    ///
    /// Used by tests to substitute [`MemFileIo`].
    pub fn from_io(path: impl Into<PathBuf>, io: Box<dyn FileIo>) -> Self {
        Self {
            path: path.into(),
            io: Some(io),
        }
    }

    /// Open the file, probing for persistent memory first.
    pub fn open(&mut self, read_only: bool, flush_method: FlushMethod) -> Result<()> {
        debug_assert!(self.io.is_none(), "LogFile::open on an open file");

        #[cfg(target_os = "linux")]
        if let Some(pmem) = PmemFileIo::try_open(&self.path, read_only)? {
            info!(path = %self.path.display(), "opened log file on persistent memory");
            self.io = Some(Box::new(pmem));
            return Ok(());
        }

        let os = OsFileIo::open(&self.path, read_only, flush_method)?;
        self.io = Some(Box::new(os));
        Ok(())
    }

    /// Whether the file is open.
    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Close the file.
    pub fn close(&mut self) -> Result<()> {
        self.io = None;
        Ok(())
    }

    /// Path this handle refers to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self) -> Result<&dyn FileIo> {
        self.io
            .as_deref()
            .ok_or_else(|| FerroError::internal(format!("log file {:?} is not open", self.path)))
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.io()?.read(buf, offset)
    }

    /// Write `buf` at `offset`.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.io()?.write(buf, offset)
    }

    /// Flush file data (not metadata) to stable storage.
    pub fn flush_data_only(&self) -> Result<()> {
        self.io()?.flush_data_only()
    }

    /// Whether writes are durable without an explicit flush.
    pub fn writes_are_durable(&self) -> bool {
        self.io.as_deref().is_some_and(|io| io.writes_are_durable())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.io()?.size()
    }
}
