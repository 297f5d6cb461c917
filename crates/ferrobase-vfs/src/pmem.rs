//! Persistent-memory backend.
//!
//! Maps the file with `MAP_SHARED_VALIDATE | MAP_SYNC`; the mapping
//! succeeds only on filesystems backed by DAX-capable persistent memory,
//! which doubles as the one-shot "is pmem" probe. Writes are store
//! sequences followed by a persistence barrier, so
//! [`FileIo::writes_are_durable`] reports true and
//! [`FileIo::flush_data_only`] is a no-op.

#![cfg(target_os = "linux")]

use std::fs::OpenOptions;
use std::path::Path;
use std::ptr;

use ferrobase_error::{FerroError, Result};
use tracing::debug;

use crate::traits::FileIo;

/// Memory-mapped persistent-memory file.
pub struct PmemFileIo {
    base: *mut u8,
    len: usize,
}

// The mapping is owned exclusively by this value; offsets are bounds
// checked and concurrent callers never overlap writes (the log layers
// serialize regions).
unsafe impl Send for PmemFileIo {}
unsafe impl Sync for PmemFileIo {}

impl PmemFileIo {
    /// Try to map `path` as persistent memory.
    ///
    /// Returns `Ok(None)` when the kernel refuses `MAP_SYNC`, i.e. the
    /// file does not live on persistent memory; the caller falls back to
    /// the fd backend.
    pub fn try_open(path: &Path, read_only: bool) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|_| FerroError::CannotOpen {
                path: path.to_path_buf(),
            })?;
        let len = usize::try_from(file.metadata().map_err(FerroError::Io)?.len())
            .map_err(|_| FerroError::internal("file size exceeds address space"))?;
        if len == 0 {
            return Ok(None);
        }

        let prot = if read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        // SAFETY: mapping a file we own for its full length; the fd may
        // be closed after mmap without invalidating the mapping.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC,
                std::os::fd::AsRawFd::as_raw_fd(&file),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            debug!(path = %path.display(), "MAP_SYNC refused; not persistent memory");
            return Ok(None);
        }

        Ok(Some(Self {
            base: base.cast::<u8>(),
            len,
        }))
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| FerroError::internal("pmem range overflow"))?;
        if end > self.len as u64 {
            return Err(FerroError::internal(format!(
                "pmem access [{offset}, {end}) outside mapping of {} bytes",
                self.len
            )));
        }
        Ok(())
    }

    /// Persistence barrier for `[offset, offset + len)`.
    ///
    /// `msync` on the containing pages orders the preceding stores to
    /// media; on a `MAP_SYNC` mapping this is the portable equivalent of
    /// a cache-line flush + fence sequence.
    fn persist(&self, offset: u64, len: usize) -> Result<()> {
        let page = 4096_u64;
        let start = offset & !(page - 1);
        let end = (offset + len as u64 + page - 1) & !(page - 1);
        let end = end.min(self.len as u64);
        // SAFETY: the range is within the mapping and page-aligned.
        let rc = unsafe {
            libc::msync(
                self.base.add(start as usize).cast::<libc::c_void>(),
                (end - start) as usize,
                libc::MS_SYNC,
            )
        };
        if rc != 0 {
            return Err(FerroError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for PmemFileIo {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region returned by mmap.
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.len);
        }
    }
}

impl FileIo for PmemFileIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: bounds checked above; source and destination never
        // overlap (buf is ordinary heap/stack memory).
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset as usize), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: bounds checked above.
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.base.add(offset as usize), buf.len());
        }
        self.persist(offset, buf.len())
    }

    fn flush_data_only(&self) -> Result<()> {
        Ok(())
    }

    fn writes_are_durable(&self) -> bool {
        true
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Regular filesystems refuse MAP_SYNC, which is exactly the probe
    // contract: try_open reports "not pmem" instead of failing.
    #[test]
    fn probe_declines_on_regular_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("probe.bin");
        std::fs::write(&path, vec![0_u8; 4096]).expect("create");

        let probed = PmemFileIo::try_open(&path, false).expect("probe");
        if let Some(io) = probed {
            // Some CI filesystems (e.g. DAX-enabled tmpfs) do accept
            // MAP_SYNC; exercise the contract in that case.
            assert!(io.writes_are_durable());
            io.write(b"pmem", 0).expect("write");
            let mut buf = [0_u8; 4];
            io.read(&mut buf, 0).expect("read");
            assert_eq!(&buf, b"pmem");
        }
    }

    #[test]
    fn empty_file_is_not_pmem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, []).expect("create");
        assert!(PmemFileIo::try_open(&path, false)
            .expect("probe")
            .is_none());
    }
}
