//! Redo log subsystem of the FerroBase storage engine.
//!
//! Every page modification goes through a [`MiniTransaction`], and
//! `MiniTransaction::commit` appends the mtr's record group to the redo
//! log. The log must be durable up to a page's newest-modification LSN
//! before that page may be evicted, and up to a transaction's commit
//! LSN before the transaction may be reported as committed.
//!
//! The subsystem couples four things: the in-memory dual-half log
//! buffer ([`buffer`]), the group-committed write/flush pipeline to the
//! circular data file ([`system`], [`data_file`]), the checkpoint
//! engine that keeps the circular log from overrunning unflushed dirty
//! pages ([`checkpoint`]), and the shutdown sequencer ([`shutdown`]).
//!
//! The buffer pool, page cleaner, and recovery are external; they reach
//! the log only through [`LogSystem`] methods and the seam traits
//! defined here.

pub mod block;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod data_file;
pub mod files;
pub mod group_commit;
pub mod metrics;
pub mod mtr;
pub mod shutdown;
pub mod system;

pub use block::{BlockFormat, CheckpointRecord, FileHeader, FileIdRecord, FORMAT_PHYSICAL};
pub use config::RedoConfig;
pub use data_file::CircularDataFile;
pub use files::LogFiles;
pub use metrics::{LogMetrics, LogMetricsSnapshot};
pub use mtr::MiniTransaction;
pub use shutdown::{ShutdownActors, ShutdownMode, ShutdownPhase};
pub use system::{capacity_for, Capacity, LogSystem, LogSystemOptions};

/// Log sequence number: a byte offset into the conceptual unbounded log
/// stream. 0 means "no LSN"; real LSNs start at 1 and only ever grow.
pub type Lsn = u64;

/// Largest representable LSN; used as the "flush everything" target.
pub const LSN_MAX: Lsn = u64::MAX;

/// Identifier of a buffer pool page, opaque to the log.
pub type PageId = u64;

/// The buffer pool surface the log subsystem calls into.
///
/// The flush list and page cleaner live outside this crate; the log
/// only queries the oldest unflushed modification, inserts dirtied
/// pages in LSN order, and requests preflushes when checkpoint ages
/// grow.
pub trait BufferPool: Send + Sync {
    /// Oldest modification LSN over all dirty pages, or `None` when the
    /// pool holds no dirty pages.
    fn oldest_modification(&self) -> Option<Lsn>;

    /// Record that `page` was modified in `[start_lsn, end_lsn]`.
    ///
    /// Called while the log's flush-order mutex is held, so insertions
    /// arrive in LSN order.
    fn insert_flush_list(&self, page: PageId, start_lsn: Lsn, end_lsn: Lsn);

    /// Flush dirty pages until the oldest modification reaches at least
    /// `new_oldest` (or everything, for [`LSN_MAX`]).
    ///
    /// Returns false when a flush batch of the same type was already
    /// running and this request could not start.
    fn preflush(&self, new_oldest: Lsn) -> bool;

    /// Number of in-flight buffer pool page I/Os.
    fn pending_io(&self) -> usize;

    /// Whether the page cleaner thread is still active.
    fn cleaner_is_active(&self) -> bool;
}

/// Observer notified when the durable LSN advances past a commit.
pub trait CommitObserver: Send + Sync {
    /// `flushed_to_disk_lsn` has reached `lsn`.
    fn on_flushed(&self, lsn: Lsn);
}

/// Observer that ignores all notifications.
pub struct NoopObserver;

impl CommitObserver for NoopObserver {
    fn on_flushed(&self, _lsn: Lsn) {}
}

/// In-place block encryption, supplied by the caller when `encrypt_log`
/// is set. Key management stays outside the log subsystem; the log only
/// stamps the key version into the file header and block framing.
pub trait LogCipher: Send + Sync {
    /// Encrypt `blocks` (a whole number of 512-byte blocks) in place.
    /// `start_lsn` identifies the first block.
    fn encrypt_blocks(&self, start_lsn: Lsn, blocks: &mut [u8]);

    /// Key version to stamp into the file header.
    fn key_version(&self) -> u32;
}
