//! The redo log file pair.
//!
//! `ib_logfile0` (the main file) carries the 512-byte file header
//! followed by appended `FILE_CHECKPOINT` and `FILE_ID` records; it
//! grows monotonically within a run. `ib_logdata` (the circular data
//! file) carries the framed block stream and has no header.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ferrobase_error::{FerroError, Result};
use ferrobase_vfs::LogFile;
use tracing::{error, info};

use crate::block::{
    CheckpointRecord, FileHeader, FileIdRecord, CHECKPOINT_RECORD_SIZE, FILE_HEADER_SIZE,
};
use crate::config::RedoConfig;
use crate::data_file::{checkpoint_coordinates, CircularDataFile};
use crate::metrics::LogMetrics;
use crate::Lsn;

/// Main log file name.
pub const LOG_FILE_NAME: &str = "ib_logfile0";
/// Circular data file name.
pub const LOG_DATA_FILE_NAME: &str = "ib_logdata";

/// Abort the process on an in-service I/O failure.
///
/// Once the subsystem is live, a failed log write or flush means the
/// durability contract cannot be maintained; there is nothing sensible
/// to unwind to.
pub(crate) fn fatal_io(path: &Path, op: &str, err: &FerroError) -> ! {
    error!(path = %path.display(), op, %err, "fatal redo log I/O failure");
    std::process::abort();
}

struct MainFile {
    file: LogFile,
    /// Append offset: the file's current end.
    tail: u64,
}

impl std::fmt::Debug for LogFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFiles").finish_non_exhaustive()
    }
}

/// The open main + data file pair.
pub struct LogFiles {
    main: Mutex<MainFile>,
    data: CircularDataFile,
    key_version: u32,
}

impl LogFiles {
    /// Materialize fresh log files on disk.
    ///
    /// Creates `ib_logdata` at the configured size and an empty
    /// `ib_logfile0`; contents are written by
    /// [`LogFiles::initialize`].
    pub fn create(cfg: &RedoConfig) -> Result<()> {
        create_log_file(&cfg.data_file_path(), cfg.log_file_size)?;
        create_log_file(&cfg.main_file_path(), 0)
    }

    /// Open both files from disk.
    ///
    /// Validates the main-file header; anything but the physical format
    /// is rejected. The data file position is left at its initial state
    /// (recovery, which would re-derive it, is outside this crate).
    pub fn open(cfg: &RedoConfig) -> Result<Self> {
        let mut main = LogFile::new(cfg.main_file_path());
        main.open(false, cfg.flush_method)?;
        let mut data = LogFile::new(cfg.data_file_path());
        data.open(false, cfg.flush_method)?;

        let mut header_block = [0_u8; FILE_HEADER_SIZE];
        main.read(&mut header_block, 0)?;
        let header = FileHeader::decode(&header_block)?;

        let data_size = data.size()?;
        if header.file_size != data_size {
            return Err(FerroError::corrupt_block(format!(
                "header says the data file is {} bytes but it is {data_size}",
                header.file_size
            )));
        }

        let tail = main.size()?;
        Ok(Self {
            main: Mutex::new(MainFile { file: main, tail }),
            data: CircularDataFile::new(data, data_size),
            key_version: header.key_version,
        })
    }

    /// Assemble a pair from already-open files (tests substitute
    /// in-memory backends here). The pair still needs
    /// [`LogFiles::initialize`].
    pub fn from_parts(main: LogFile, data: LogFile, data_size: u64, key_version: u32) -> Self {
        Self {
            main: Mutex::new(MainFile { file: main, tail: 0 }),
            data: CircularDataFile::new(data, data_size),
            key_version,
        }
    }

    /// Write the initial main-file contents: the file header, a
    /// `FILE_ID` record per known tablespace, and an initial checkpoint
    /// at `start_lsn` referencing data-file offset 0 with sequence
    /// bit 1.
    pub fn initialize(&self, start_lsn: Lsn, file_ops: &[FileIdRecord]) -> Result<()> {
        let header = FileHeader::for_new_log(self.data.size(), self.key_version);

        let mut buf = Vec::with_capacity(FILE_HEADER_SIZE + 64 * file_ops.len());
        buf.extend_from_slice(&header.encode());
        for op in file_ops {
            op.encode(&mut buf);
        }
        buf.extend_from_slice(
            &CheckpointRecord {
                lsn: start_lsn,
                offset: 0,
                sequence_bit: 1,
            }
            .encode(),
        );

        let mut main = self.main.lock().expect("main file poisoned");
        main.file.write(&buf, 0)?;
        if !main.file.writes_are_durable() {
            main.file.flush_data_only()?;
        }
        main.tail = buf.len() as u64;
        Ok(())
    }

    /// The circular data file.
    pub fn data(&self) -> &CircularDataFile {
        &self.data
    }

    /// Encryption key version from the header (0 when unencrypted).
    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    /// Whether data file writes are durable without an explicit flush.
    pub fn data_writes_are_durable(&self) -> bool {
        self.data.writes_are_durable()
    }

    /// Write a block region to the data file. Fatal on failure.
    ///
    /// Returns the number of physical writes issued.
    pub fn data_write(&self, rewritten: u64, pad: u64, buf: &[u8]) -> usize {
        self.data
            .append_region(rewritten, pad, buf)
            .unwrap_or_else(|err| fatal_io(Path::new(LOG_DATA_FILE_NAME), "write", &err))
    }

    /// Flush the data file, maintaining the pending-flush gauges.
    /// Fatal on failure.
    pub fn data_flush(&self, metrics: &LogMetrics) {
        metrics.flush_started();
        if let Err(err) = self.data.flush_data_only() {
            fatal_io(Path::new(LOG_DATA_FILE_NAME), "flush_data_only", &err);
        }
        metrics.flush_completed();
    }

    /// Durably append a 19-byte checkpoint record for `lsn` to the main
    /// file.
    pub fn append_checkpoint_durable(&self, lsn: Lsn) -> Result<()> {
        let (offset, sequence_bit) = checkpoint_coordinates(lsn, self.data.size());
        let record = CheckpointRecord {
            lsn,
            offset,
            sequence_bit,
        };
        self.main_append_durable(&record.encode())
    }

    /// Durably append encoded file-operation records to the main file.
    pub fn append_file_operations_durable(&self, records: &[u8]) -> Result<()> {
        self.main_append_durable(records)
    }

    fn main_append_durable(&self, buf: &[u8]) -> Result<()> {
        let mut main = self.main.lock().expect("main file poisoned");
        main.file.write(buf, main.tail)?;
        if !main.file.writes_are_durable() {
            main.file.flush_data_only()?;
        }
        main.tail += buf.len() as u64;
        Ok(())
    }

    /// Read from the main file.
    pub fn main_read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.main.lock().expect("main file poisoned").file.read(buf, offset)
    }

    /// Current main-file append offset.
    pub fn main_tail(&self) -> u64 {
        self.main.lock().expect("main file poisoned").tail
    }

    /// Offset and size of the last record in the main file, assuming it
    /// is a checkpoint record. Convenience for inspection.
    pub fn last_checkpoint_record(&self) -> Result<CheckpointRecord> {
        let tail = self.main_tail();
        if tail < CHECKPOINT_RECORD_SIZE as u64 {
            return Err(FerroError::CorruptCheckpoint { offset: tail });
        }
        let offset = tail - CHECKPOINT_RECORD_SIZE as u64;
        let mut buf = [0_u8; CHECKPOINT_RECORD_SIZE];
        self.main_read(&mut buf, offset)?;
        CheckpointRecord::decode(&buf, offset)
    }

    /// Close both files.
    pub fn close(&mut self) -> Result<()> {
        self.main.lock().expect("main file poisoned").file.close()?;
        self.data.close()
    }
}

/// Create a log file of `size` bytes, replacing any existing one.
fn create_log_file(path: &Path, size: u64) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).map_err(FerroError::Io)?;
    }

    let file = fs::File::create(path).map_err(|_| FerroError::CannotOpen {
        path: path.to_path_buf(),
    })?;

    info!(path = %path.display(), size, "setting log file size");
    if let Err(err) = file.set_len(size) {
        drop(file);
        let _ = fs::remove_file(path);
        if err.raw_os_error() == Some(libc_enospc()) {
            return Err(FerroError::OutOfSpace {
                path: path.to_path_buf(),
            });
        }
        return Err(FerroError::Io(err));
    }

    file.sync_all().map_err(FerroError::Io)?;
    Ok(())
}

// ENOSPC without pulling libc into this crate's dependency set.
const fn libc_enospc() -> i32 {
    28
}

/// Full path of a redo log file inside `log_dir`.
pub fn log_file_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(name)
}

// Materialization helper used by [`LogSystem::create`]: memory-backed
// pair for tests.
#[cfg(test)]
pub(crate) fn mem_log_files(data_size: u64) -> (LogFiles, ferrobase_vfs::MemFileIo, ferrobase_vfs::MemFileIo) {
    use ferrobase_vfs::MemFileIo;

    let main_io = MemFileIo::new();
    let data_io = MemFileIo::with_size(data_size as usize);
    let main_peek = main_io.clone();
    let data_peek = data_io.clone();
    let files = LogFiles::from_parts(
        LogFile::from_io(LOG_FILE_NAME, Box::new(main_io)),
        LogFile::from_io(LOG_DATA_FILE_NAME, Box::new(data_io)),
        data_size,
        0,
    );
    (files, main_peek, data_peek)
}

// ===========================================================================
// Tests
// ===========================================================================
