//! Redo log configuration.

use std::path::PathBuf;

use ferrobase_error::{FerroError, Result};
use ferrobase_vfs::FlushMethod;

use crate::block::BLOCK_SIZE;

/// Configuration for the redo log subsystem.
#[derive(Debug, Clone)]
pub struct RedoConfig {
    /// Directory holding `ib_logfile0` and `ib_logdata`.
    pub log_dir: PathBuf,

    /// Size of one half of the log buffer, in bytes.
    ///
    /// Minimum `16 * 512` and `4 * page_size`. The allocation is double
    /// this: one half accepts appends while the other is written out.
    pub log_buffer_size: usize,

    /// Size of the circular data file, in bytes. The bottom 9 bits must
    /// be zero and the value must fit the 47-bit checkpoint offset
    /// field.
    pub log_file_size: u64,

    /// Alignment granularity for log I/O, chosen to avoid device-level
    /// read-modify-write when a partial region is re-written. Must be a
    /// power of two ≥ 512.
    pub log_write_ahead_size: usize,

    /// How file writes reach stable storage.
    pub flush_method: FlushMethod,

    /// Whether log blocks are encrypted (reserves a 4-byte key-version
    /// slot in each block; a `LogCipher` must be supplied).
    pub encrypt_log: bool,

    /// Number of concurrent server threads; participates in the
    /// checkpoint capacity reservation.
    pub thread_concurrency: u32,

    /// Page size of the owning engine; used for buffer sizing and the
    /// per-thread capacity reservation.
    pub page_size: usize,
}

impl Default for RedoConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            log_buffer_size: 16 * 1024 * 1024,
            log_file_size: 96 * 1024 * 1024,
            log_write_ahead_size: 8192,
            flush_method: FlushMethod::Buffered,
            encrypt_log: false,
            thread_concurrency: 0,
            page_size: 4096,
        }
    }
}

impl RedoConfig {
    /// Check option values against their documented constraints.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < BLOCK_SIZE {
            return Err(FerroError::ConfigInvalid {
                option: "page_size",
                value: self.page_size.to_string(),
                detail: "must be a power of two of at least 512",
            });
        }
        if self.log_buffer_size < 16 * BLOCK_SIZE || self.log_buffer_size < 4 * self.page_size {
            return Err(FerroError::ConfigInvalid {
                option: "log_buffer_size",
                value: self.log_buffer_size.to_string(),
                detail: "must be at least 16 log blocks and 4 pages",
            });
        }
        if self.log_file_size & 0x1ff != 0 {
            return Err(FerroError::ConfigInvalid {
                option: "log_file_size",
                value: self.log_file_size.to_string(),
                detail: "the bottom 9 bits must be zero",
            });
        }
        if self.log_file_size == 0 || self.log_file_size >= 1 << 47 {
            return Err(FerroError::ConfigInvalid {
                option: "log_file_size",
                value: self.log_file_size.to_string(),
                detail: "must be nonzero and below 2^47",
            });
        }
        if !self.log_write_ahead_size.is_power_of_two() || self.log_write_ahead_size < BLOCK_SIZE {
            return Err(FerroError::ConfigInvalid {
                option: "log_write_ahead_size",
                value: self.log_write_ahead_size.to_string(),
                detail: "must be a power of two of at least 512",
            });
        }
        Ok(())
    }

    /// Path of the main log file.
    pub fn main_file_path(&self) -> PathBuf {
        self.log_dir.join(crate::files::LOG_FILE_NAME)
    }

    /// Path of the circular data file.
    pub fn data_file_path(&self) -> PathBuf {
        self.log_dir.join(crate::files::LOG_DATA_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RedoConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_small_buffer() {
        let cfg = RedoConfig {
            log_buffer_size: 8 * BLOCK_SIZE,
            ..RedoConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(FerroError::ConfigInvalid {
                option: "log_buffer_size",
                ..
            })
        ));
    }

    #[test]
    fn rejects_unaligned_file_size() {
        let cfg = RedoConfig {
            log_file_size: 1024 * 1024 + 100,
            ..RedoConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversize_file() {
        let cfg = RedoConfig {
            log_file_size: 1 << 47,
            ..RedoConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_odd_write_ahead() {
        let cfg = RedoConfig {
            log_write_ahead_size: 3000,
            ..RedoConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn file_paths_join_log_dir() {
        let cfg = RedoConfig {
            log_dir: PathBuf::from("/var/lib/ferrobase"),
            ..RedoConfig::default()
        };
        assert_eq!(
            cfg.main_file_path(),
            PathBuf::from("/var/lib/ferrobase/ib_logfile0")
        );
        assert_eq!(
            cfg.data_file_path(),
            PathBuf::from("/var/lib/ferrobase/ib_logdata")
        );
    }
}
