use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for FerroBase redo log operations.
///
/// Structured variants for the recoverable cases; everything that can
/// break the durability contract after the subsystem is initialized is
/// classified as fatal by [`FerroError::is_fatal`].
#[derive(Error, Debug)]
pub enum FerroError {
    // === Configuration errors ===
    /// Log file too small for the configured thread concurrency.
    #[error(
        "log file size {file_size} is too small for thread_concurrency={thread_concurrency}; \
         the log should be bigger than 200 KiB per concurrent thread"
    )]
    ConfigTooSmall {
        file_size: u64,
        thread_concurrency: u32,
    },

    /// A configuration option holds an invalid value.
    #[error("invalid configuration: {option} = {value}: {detail}")]
    ConfigInvalid {
        option: &'static str,
        value: String,
        detail: &'static str,
    },

    // === I/O errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Out of disk space while materializing a log file.
    #[error("out of space creating log file '{path}'")]
    OutOfSpace { path: PathBuf },

    /// Cannot open a log file.
    #[error("unable to open log file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// Short read (fewer bytes than expected).
    #[error("short read on '{path}': expected {expected} bytes, got {actual}")]
    ShortRead {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    // === Format errors ===
    /// The main log file carries a format tag this build does not write.
    #[error("unsupported redo log format {format:#010x} (expected {expected:#010x})")]
    UnsupportedFormat { format: u32, expected: u32 },

    /// A log block failed checksum or header validation.
    #[error("corrupt log block: {detail}")]
    CorruptBlock { detail: String },

    /// A checkpoint record failed checksum validation.
    #[error("corrupt checkpoint record at offset {offset}")]
    CorruptCheckpoint { offset: u64 },

    // === Runtime conditions ===
    /// Checkpoint age reached the log capacity; crash recovery may be
    /// compromised because upstream pacing is broken.
    #[error("checkpoint age {age} exceeds the log capacity {capacity}")]
    CheckpointOverrun { age: u64, capacity: u64 },

    /// Encryption was requested but no cipher was supplied.
    #[error("encrypt_log is set but no log cipher was configured")]
    CipherMissing,

    // === Internal errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl FerroError {
    /// Whether this error breaks the durability contract.
    ///
    /// Fatal errors abort the process when raised on the in-service
    /// write path; everything else propagates to the caller.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ShortRead { .. } | Self::Internal(_)
        )
    }

    /// Whether this error can be fixed by changing the configuration.
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::ConfigTooSmall { .. } | Self::ConfigInvalid { .. } | Self::CipherMissing
        )
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corrupt-block error.
    pub fn corrupt_block(detail: impl Into<String>) -> Self {
        Self::CorruptBlock {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `FerroError`.
pub type Result<T> = std::result::Result<T, FerroError>;
