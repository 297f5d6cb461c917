//! Conventional file-descriptor backend.
//!
//! Positional I/O through `FileExt`, with the durability mode fixed at
//! open time: `O_DSYNC` makes every write durable on return, otherwise
//! durability requires [`FileIo::flush_data_only`] (`fdatasync`).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use ferrobase_error::{FerroError, Result};

use crate::traits::{FileIo, FlushMethod};

/// File-descriptor backend over a regular file.
#[derive(Debug)]
pub struct OsFileIo {
    file: File,
    path: PathBuf,
    durable_writes: bool,
    skip_flush: bool,
}

impl OsFileIo {
    /// Open `path` with the given flush method.
    pub fn open(path: &Path, read_only: bool, flush_method: FlushMethod) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(!read_only);
        if !read_only && flush_method == FlushMethod::ODsync {
            options.custom_flags(libc::O_DSYNC);
        }
        let file = options.open(path).map_err(|_| FerroError::CannotOpen {
            path: path.to_path_buf(),
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            durable_writes: !read_only && flush_method == FlushMethod::ODsync,
            skip_flush: flush_method == FlushMethod::Nosync,
        })
    }
}

impl FileIo for OsFileIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut total = 0_usize;
        while total < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[total..], offset + total as u64)
                .map_err(FerroError::Io)?;
            if n == 0 {
                return Err(FerroError::ShortRead {
                    path: self.path.clone(),
                    expected: buf.len(),
                    actual: total,
                });
            }
            total += n;
        }
        Ok(())
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut total = 0_usize;
        while total < buf.len() {
            let n = self
                .file
                .write_at(&buf[total..], offset + total as u64)
                .map_err(FerroError::Io)?;
            if n == 0 {
                return Err(FerroError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write_at returned 0",
                )));
            }
            total += n;
        }
        Ok(())
    }

    fn flush_data_only(&self) -> Result<()> {
        if self.skip_flush {
            return Ok(());
        }
        self.file.sync_data().map_err(FerroError::Io)
    }

    fn writes_are_durable(&self) -> bool {
        self.durable_writes
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata().map_err(FerroError::Io)?.len())
    }
}
