use ferrobase_error::Result;

/// How file writes reach stable storage.
///
/// Selected by the `file_flush_method` configuration option and applied
/// when a log file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMethod {
    /// Buffered writes; durability requires an explicit
    /// [`FileIo::flush_data_only`] call.
    #[default]
    Buffered,
    /// Open with `O_DSYNC`: every write is durable when it returns.
    ODsync,
    /// Buffered writes and flushes are skipped entirely. Crash
    /// durability is forfeited; useful only for benchmarks.
    Nosync,
}

/// Random-access durable file backend.
///
/// Abstracts conventional buffered I/O and persistent-memory mappings
/// behind one contract so the log core never branches on the backend.
/// All methods take `&self`: backends carry their own interior state and
/// handles are shared across the writer and flusher paths.
pub trait FileIo: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    ///
    /// Reading past the end of the file is a [`ShortRead`] error; the
    /// log knows the size of every region it asks for.
    ///
    /// [`ShortRead`]: ferrobase_error::FerroError::ShortRead
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write `buf` starting at byte offset `offset`.
    fn write(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Flush file data (not metadata) to stable storage.
    ///
    /// `fdatasync` semantics. A no-op for backends whose writes are
    /// inherently durable.
    fn flush_data_only(&self) -> Result<()>;

    /// Whether writes reach stable storage without an explicit flush.
    ///
    /// When true, callers may skip [`FileIo::flush_data_only`].
    fn writes_are_durable(&self) -> bool;

    /// Current file size in bytes.
    fn size(&self) -> Result<u64>;
}
