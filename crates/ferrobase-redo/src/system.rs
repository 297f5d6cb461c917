//! The log system handle.
//!
//! [`LogSystem`] owns the log buffer, the LSN cursors, the checkpoint
//! state, and the file pair; all cross-module access goes through its
//! methods. There is no process-global instance: callers construct one
//! and share it behind an `Arc`.
//!
//! Lock order, never reversed: log mutex → flush-order mutex →
//! write lock → flush lock → data-file mutex. The log mutex is never
//! held across an I/O call; the writer releases it before the block
//! write and re-acquires it only to publish cursors.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ferrobase_error::{FerroError, Result};
use ferrobase_vfs::LogFile;
use tracing::{debug, error, info, warn};

use crate::block::{BlockFormat, FileIdRecord, BLOCK_SIZE};
use crate::buffer::{LogBuffer, BUF_WRITE_MARGIN};
use crate::config::RedoConfig;
use crate::files::LogFiles;
use crate::group_commit::{Acquire, GroupCommitLock};
use crate::metrics::LogMetrics;
use crate::{BufferPool, CommitObserver, LogCipher, Lsn, NoopObserver};

/// Minimum spacing between repeats of a throttled warning.
pub(crate) const WARN_INTERVAL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Capacity thresholds
// ---------------------------------------------------------------------------

/// Checkpoint-age and modified-age thresholds, derived once from the
/// data file size. Reads need no lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Hard capacity: exceeding this checkpoint age risks overwriting
    /// log that crash recovery still needs.
    pub log_capacity: u64,
    /// Modified age beyond which an asynchronous preflush is requested.
    pub max_modified_age_async: u64,
    /// Modified age beyond which dirty pages are preflushed
    /// synchronously.
    pub max_modified_age_sync: u64,
    /// Checkpoint age beyond which a checkpoint write is initiated.
    pub max_checkpoint_age_async: u64,
    /// Maximum allowed checkpoint age when a new step starts.
    pub max_checkpoint_age: u64,
}

/// Derive capacity thresholds from the data file size.
///
/// A slice of the file is reserved per concurrent thread so a single
/// query step can always append its log; if the reservation eats half
/// the capacity the configuration is rejected.
pub fn capacity_for(file_size: u64, thread_concurrency: u32, page_size: usize) -> Result<Capacity> {
    let smallest_capacity = file_size - file_size / 10;

    let per_thread = 4 * page_size as u64;
    let extra = 8 * page_size as u64;
    let reserved = per_thread * (10 + u64::from(thread_concurrency)) + extra;
    if reserved >= smallest_capacity / 2 {
        return Err(FerroError::ConfigTooSmall {
            file_size,
            thread_concurrency,
        });
    }

    let margin = smallest_capacity - reserved;
    let margin = margin - margin / 10;

    Ok(Capacity {
        log_capacity: smallest_capacity,
        max_modified_age_async: margin - margin / 8,
        max_modified_age_sync: margin - margin / 16,
        max_checkpoint_age_async: margin - margin / 32,
        max_checkpoint_age: margin,
    })
}

// ---------------------------------------------------------------------------
// Mutex-protected state
// ---------------------------------------------------------------------------

/// Checkpoint bookkeeping, guarded by the log mutex.
pub(crate) struct CheckpointState {
    pub last_checkpoint_lsn: Lsn,
    pub next_checkpoint_lsn: Lsn,
    pub next_checkpoint_no: u64,
    pub n_pending_checkpoint_writes: usize,
}

/// One-shot-per-interval warning state.
pub(crate) struct WarnThrottle {
    last: Option<Instant>,
}

impl WarnThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    /// Whether the warning may fire now; arms the throttle if so.
    pub(crate) fn should_fire(&mut self) -> bool {
        match self.last {
            Some(at) if at.elapsed() < WARN_INTERVAL => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}

/// Everything the log mutex guards.
pub(crate) struct LogInner {
    /// Next byte of the log stream to be assigned.
    pub lsn: Lsn,
    pub buffer: LogBuffer,
    /// Last byte handed to the writer.
    pub write_lsn: Lsn,
    /// Block-aligned end of the last data-file write.
    pub high_water_lsn: Lsn,
    pub ckpt: CheckpointState,
    pub age_warning: WarnThrottle,
    pub margin_warning: WarnThrottle,
}

struct PrintoutState {
    last_time: Instant,
    last_log_ios: u64,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Pluggable collaborators handed to the log system at construction.
pub struct LogSystemOptions {
    /// Notified when the durable LSN advances.
    pub observer: Box<dyn CommitObserver>,
    /// Block cipher; required iff `encrypt_log` is configured.
    pub cipher: Option<Box<dyn LogCipher>>,
}

impl Default for LogSystemOptions {
    fn default() -> Self {
        Self {
            observer: Box::new(NoopObserver),
            cipher: None,
        }
    }
}

// ---------------------------------------------------------------------------
// LogSystem
// ---------------------------------------------------------------------------

impl std::fmt::Debug for LogSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSystem").finish_non_exhaustive()
    }
}

/// The redo log subsystem.
pub struct LogSystem {
    pub(crate) inner: Mutex<LogInner>,
    /// Serializes flush-list insertion so it happens in LSN order even
    /// though the log mutex is released during commit page handling.
    pub(crate) flush_order_mutex: Mutex<()>,
    write_lock: GroupCommitLock,
    flush_lock: GroupCommitLock,
    pub(crate) files: LogFiles,
    pub(crate) pool: Arc<dyn BufferPool>,
    observer: Box<dyn CommitObserver>,
    cipher: Option<Box<dyn LogCipher>>,
    pub(crate) capacity: Capacity,
    write_ahead_size: u64,
    /// Sticky "the log buffer needs a flush, or pages need preflushing,
    /// or a checkpoint is due" flag, peeked without the log mutex.
    check_flush_or_checkpoint: AtomicBool,
    /// Encoded [`ShutdownPhase`](crate::shutdown::ShutdownPhase).
    pub(crate) shutdown_phase: std::sync::atomic::AtomicU8,
    flushed_to_disk_lsn: AtomicU64,
    pub(crate) metrics: LogMetrics,
    printout: Mutex<PrintoutState>,
}

impl LogSystem {
    /// Materialize fresh log files and start the subsystem.
    ///
    /// `file_ops` names the non-predefined tablespace files recorded in
    /// the new main file.
    pub fn create(
        cfg: &RedoConfig,
        pool: Arc<dyn BufferPool>,
        file_ops: &[FileIdRecord],
    ) -> Result<Self> {
        Self::create_with(cfg, pool, LogSystemOptions::default(), file_ops)
    }

    /// [`LogSystem::create`] with explicit collaborators.
    pub fn create_with(
        cfg: &RedoConfig,
        pool: Arc<dyn BufferPool>,
        options: LogSystemOptions,
        file_ops: &[FileIdRecord],
    ) -> Result<Self> {
        cfg.validate()?;
        LogFiles::create(cfg)?;

        let key_version = match (&options.cipher, cfg.encrypt_log) {
            (Some(cipher), true) => cipher.key_version(),
            (None, true) => return Err(FerroError::CipherMissing),
            _ => 0,
        };

        let mut main = LogFile::new(cfg.main_file_path());
        main.open(false, cfg.flush_method)?;
        let mut data = LogFile::new(cfg.data_file_path());
        data.open(false, cfg.flush_method)?;
        let files = LogFiles::from_parts(main, data, cfg.log_file_size, key_version);

        Self::start_on(cfg, files, pool, options, 1, Some(file_ops))
    }

    /// Start the subsystem over pre-opened files.
    ///
    /// `start_lsn` is where the log stream begins (1 for a fresh log; a
    /// recovery layer would pass its recovered LSN). When `materialize`
    /// is given, the main file's initial contents are written first.
    pub fn start_on(
        cfg: &RedoConfig,
        files: LogFiles,
        pool: Arc<dyn BufferPool>,
        options: LogSystemOptions,
        start_lsn: Lsn,
        materialize: Option<&[FileIdRecord]>,
    ) -> Result<Self> {
        cfg.validate()?;
        if cfg.encrypt_log && options.cipher.is_none() {
            return Err(FerroError::CipherMissing);
        }
        let capacity = capacity_for(cfg.log_file_size, cfg.thread_concurrency, cfg.page_size)?;

        let format = BlockFormat::new(cfg.encrypt_log);
        let mut buffer = LogBuffer::new(cfg.log_buffer_size, cfg.page_size, format);
        let lsn = buffer.start_at(start_lsn);

        if let Some(file_ops) = materialize {
            files.initialize(lsn, file_ops)?;
        }

        Ok(Self {
            inner: Mutex::new(LogInner {
                lsn,
                buffer,
                write_lsn: lsn,
                high_water_lsn: lsn & !(BLOCK_SIZE as u64 - 1),
                ckpt: CheckpointState {
                    last_checkpoint_lsn: lsn,
                    next_checkpoint_lsn: 0,
                    next_checkpoint_no: 0,
                    n_pending_checkpoint_writes: 0,
                },
                age_warning: WarnThrottle::new(),
                margin_warning: WarnThrottle::new(),
            }),
            flush_order_mutex: Mutex::new(()),
            write_lock: GroupCommitLock::new(),
            flush_lock: GroupCommitLock::new(),
            files,
            pool,
            observer: options.observer,
            cipher: options.cipher,
            capacity,
            write_ahead_size: cfg.log_write_ahead_size as u64,
            check_flush_or_checkpoint: AtomicBool::new(true),
            shutdown_phase: std::sync::atomic::AtomicU8::new(0),
            flushed_to_disk_lsn: AtomicU64::new(lsn),
            metrics: LogMetrics::new(),
            printout: Mutex::new(PrintoutState {
                last_time: Instant::now(),
                last_log_ios: 0,
            }),
        })
    }

    /// Shut the file pair down. The caller is responsible for having
    /// quiesced the log first (see [`shutdown`](crate::shutdown)).
    pub fn close(mut self) -> Result<()> {
        self.files.close()
    }

    // --- Cursor and state queries ---

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().expect("log mutex poisoned")
    }

    /// Current LSN.
    pub fn lsn(&self) -> Lsn {
        self.lock_inner().lsn
    }

    /// Current LSN, or `None` if the log mutex is contended.
    pub fn peek_lsn(&self) -> Option<Lsn> {
        self.inner.try_lock().ok().map(|inner| inner.lsn)
    }

    /// Last byte handed to the writer.
    pub fn write_lsn(&self) -> Lsn {
        self.lock_inner().write_lsn
    }

    /// Last byte durable on disk.
    pub fn flushed_to_disk_lsn(&self) -> Lsn {
        self.flushed_to_disk_lsn.load(Ordering::Acquire)
    }

    /// LSN of the latest completed checkpoint.
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.lock_inner().ckpt.last_checkpoint_lsn
    }

    /// Capacity thresholds (constant after construction).
    pub fn capacity(&self) -> &Capacity {
        &self.capacity
    }

    /// Observability counters.
    pub fn metrics(&self) -> &LogMetrics {
        &self.metrics
    }

    /// The log file pair (inspection and checkpoint plumbing).
    pub fn files(&self) -> &LogFiles {
        &self.files
    }

    /// Whether a flush, preflush, or checkpoint may be needed.
    pub fn check_flush_or_checkpoint(&self) -> bool {
        self.check_flush_or_checkpoint.load(Ordering::Relaxed)
    }

    pub(crate) fn set_check_flush_or_checkpoint(&self, value: bool) {
        self.check_flush_or_checkpoint
            .store(value, Ordering::Relaxed);
    }

    /// Oldest modification in the pool, or `fallback` with no dirty
    /// pages (the log may contain records for which no page is dirty).
    pub(crate) fn oldest_modification_or(&self, fallback: Lsn) -> Lsn {
        match self.pool.oldest_modification() {
            Some(lsn) if lsn != 0 => lsn,
            _ => fallback,
        }
    }

    // --- Append path (called by `MiniTransaction::commit`) ---

    /// Wait for room for an append of `len` payload bytes, then return
    /// the guard under which the append happens.
    ///
    /// The estimate leaves the write margin, the write-ahead unit, and
    /// 25% framing slack; when it does not fit, the guard is released,
    /// a background write started, and the reservation retried.
    pub(crate) fn reserve_and_open<'a>(
        &'a self,
        mut inner: MutexGuard<'a, LogInner>,
        len: usize,
    ) -> MutexGuard<'a, LogInner> {
        let mut tries = 0_u32;
        loop {
            let upper_limit = BUF_WRITE_MARGIN + self.write_ahead_size as usize + 5 * len / 4;
            if inner.buffer.buf_free + upper_limit <= inner.buffer.size() {
                return inner;
            }
            drop(inner);

            self.sync_in_background(false);
            LogMetrics::inc(&self.metrics.waits);
            tries += 1;
            debug_assert!(tries < 50, "log buffer reservation livelock");

            inner = self.lock_inner();
        }
    }

    /// Copy `bytes` into the log buffer. The caller holds the guard
    /// from [`reserve_and_open`](Self::reserve_and_open).
    pub(crate) fn write_low(&self, inner: &mut LogInner, bytes: &[u8]) {
        let checkpoint_no = inner.ckpt.next_checkpoint_no;
        inner.buffer.append(&mut inner.lsn, checkpoint_no, bytes);
        LogMetrics::inc(&self.metrics.write_requests);
    }

    /// Close the append: update the first-record-group hint and raise
    /// the flush/checkpoint flag when thresholds are crossed.
    /// Returns the commit LSN.
    pub(crate) fn close_append(&self, inner: &mut LogInner) -> Lsn {
        let lsn = inner.lsn;
        inner.buffer.close();

        if inner.buffer.buf_free > inner.buffer.max_buf_free {
            self.set_check_flush_or_checkpoint(true);
        }

        let checkpoint_age = lsn - inner.ckpt.last_checkpoint_lsn;
        if checkpoint_age >= self.capacity.log_capacity && inner.age_warning.should_fire() {
            error!(
                checkpoint_age,
                log_capacity = self.capacity.log_capacity,
                "the age of the last checkpoint exceeds the log capacity"
            );
        }

        if checkpoint_age <= self.capacity.max_modified_age_sync {
            return lsn;
        }

        match self.pool.oldest_modification() {
            Some(oldest) if oldest != 0 => {
                if lsn - oldest > self.capacity.max_modified_age_sync
                    || checkpoint_age > self.capacity.max_checkpoint_age_async
                {
                    self.set_check_flush_or_checkpoint(true);
                }
            }
            _ => self.set_check_flush_or_checkpoint(true),
        }
        lsn
    }

    /// Check that an append of `margin` bytes cannot overwrite log the
    /// last checkpoint still needs; checkpoints once if it would.
    ///
    /// When the payload alone exceeds the capacity, warns (throttled)
    /// and proceeds rather than deadlocking.
    pub(crate) fn margin_checkpoint_age<'a>(
        &'a self,
        mut inner: MutexGuard<'a, LogInner>,
        margin: usize,
    ) -> MutexGuard<'a, LogInner> {
        let margin = margin as u64;
        if margin > self.capacity.log_capacity {
            if inner.margin_warning.should_fire() {
                error!(
                    payload = margin,
                    log_capacity = self.capacity.log_capacity,
                    "the log file is too small for this mini-transaction; the last \
                     checkpoint age might exceed the log capacity"
                );
            }
            return inner;
        }

        if inner.lsn - inner.ckpt.last_checkpoint_lsn + margin > self.capacity.log_capacity {
            // The write might overwrite log after the last checkpoint;
            // make one. Do not wait under the mutex: the current mtr
            // may hold a latch on the page with the oldest LSN.
            let flushed_enough = inner.lsn - self.oldest_modification_or(inner.lsn) + margin
                <= self.capacity.log_capacity;
            self.set_check_flush_or_checkpoint(true);
            drop(inner);

            if !flushed_enough {
                std::thread::sleep(Duration::from_millis(100));
            }
            self.checkpoint();

            inner = self.lock_inner();
        }
        inner
    }

    /// Grow the log buffer so a mini-transaction of `len` bytes fits.
    pub fn buffer_extend(&self, len: usize) {
        let mut inner = self.lock_inner();
        if len <= inner.buffer.size() {
            // Already extended enough by the others.
            return;
        }
        warn!(
            requested = len,
            log_buffer_size = inner.buffer.size(),
            "mini-transaction log exceeds half the log buffer; extending"
        );
        let new_size = inner.buffer.extend(len);
        drop(inner);
        info!(new_size, "log_buffer_size was extended");
    }

    // --- Writer path ---

    /// The "write" half of [`write_up_to`](Self::write_up_to): swap
    /// buffer halves and write the completed region to the data file.
    ///
    /// Caller holds the write lock. The log mutex guard is consumed and
    /// released before any I/O.
    fn write_buffer(&self, mut guard: MutexGuard<'_, LogInner>) {
        if !guard.buffer.has_unwritten() {
            return;
        }
        debug!(
            write_lsn = guard.write_lsn,
            lsn = guard.lsn,
            "writing log buffer"
        );

        let inner = &mut *guard;
        inner.buffer.stamp_for_write(inner.ckpt.next_checkpoint_no);

        let target_lsn = inner.lsn;
        let area_start_lsn = inner.write_lsn & !(BLOCK_SIZE as u64 - 1);
        let mut region = inner.buffer.switch();
        let area_len = (region.area_end - region.area_start) as u64;
        let area_end_lsn = area_start_lsn + area_len;
        let rewritten = inner.high_water_lsn - area_start_lsn;
        inner.high_water_lsn = area_end_lsn;
        drop(guard);

        // Erase the last block's tail beyond real data.
        region.buf[region.end_offset..region.area_end].fill(0);

        // Pad so the next write starts on a write-ahead boundary and
        // needs no read-modify-write on the device.
        let mut pad = 0_usize;
        if self.write_ahead_size > BLOCK_SIZE as u64 {
            let end_offset_in_unit =
                (area_end_lsn % self.files.data().size()) % self.write_ahead_size;
            if end_offset_in_unit > 0 && area_len > end_offset_in_unit {
                pad = ((self.write_ahead_size - end_offset_in_unit) as usize)
                    .min(region.buf.len() - region.area_end);
                region.buf[region.area_end..region.area_end + pad].fill(0);
            }
        }

        if let Some(cipher) = &self.cipher {
            cipher.encrypt_blocks(
                area_start_lsn,
                &mut region.buf[region.area_start..region.area_end],
            );
        }

        // Checksum every block of the I/O, padding blocks included.
        let io_end = region.area_end + pad;
        for block_start in (region.area_start..io_end).step_by(BLOCK_SIZE) {
            crate::block::store_block_checksum(
                &mut region.buf[block_start..block_start + BLOCK_SIZE],
            );
        }

        let physical_writes = self.files.data_write(
            rewritten,
            pad as u64,
            &region.buf[region.area_start..io_end],
        );
        LogMetrics::add(&self.metrics.log_ios, physical_writes as u64);
        LogMetrics::inc(&self.metrics.writes);
        LogMetrics::add(&self.metrics.padded_bytes, pad as u64);

        let mut guard = self.lock_inner();
        guard.write_lsn = target_lsn;
        guard.buffer.reinstall(region);
        drop(guard);

        if self.files.data_writes_are_durable() {
            self.flushed_to_disk_lsn
                .fetch_max(target_lsn, Ordering::AcqRel);
        }
    }

    /// Ensure the log is written (and optionally durable) up to `lsn`.
    ///
    /// Starts a new write, or waits until an already-running write
    /// covers the request. With `flush_to_disk`, does not return before
    /// `flushed_to_disk_lsn >= lsn`.
    pub fn write_up_to(&self, lsn: Lsn, flush_to_disk: bool) {
        if flush_to_disk && self.flush_lock.acquire(lsn) == Acquire::NotAcquired {
            return;
        }

        if self.write_lock.acquire(lsn) == Acquire::Acquired {
            let guard = self.lock_inner();
            let write_lsn = guard.lsn;
            self.write_lock.set_pending(write_lsn);
            self.write_buffer(guard);
            self.write_lock.release(write_lsn);
        }

        if !flush_to_disk {
            return;
        }

        // Flush the highest written LSN.
        let flush_lsn = self.write_lock.value();
        self.flush_lock.set_pending(flush_lsn);
        if !self.files.data_writes_are_durable() {
            self.files.data_flush(&self.metrics);
        }
        self.flushed_to_disk_lsn
            .fetch_max(flush_lsn, Ordering::AcqRel);
        self.flush_lock.release(flush_lsn);

        self.observer.on_flushed(flush_lsn);
    }

    /// Write (and optionally flush) everything appended so far.
    pub fn buffer_flush_to_disk(&self, sync: bool) {
        let lsn = self.lsn();
        self.write_up_to(lsn, sync);
    }

    /// Background write of the log buffer; does not wait for more work
    /// than the write (+ possible flush) itself.
    pub fn sync_in_background(&self, flush: bool) {
        let lsn = {
            let inner = self.lock_inner();
            if flush && self.flushed_to_disk_lsn() >= inner.lsn {
                // The write + flush already covers everything.
                return;
            }
            inner.lsn
        };
        self.write_up_to(lsn, flush);
    }

    // --- Statistics ---

    /// Print the log status block: cursors, pending counts, and the
    /// I/O rate since the previous printout.
    pub fn print_status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let (lsn, last_checkpoint, pending_checkpoints) = {
            let inner = self.lock_inner();
            (
                inner.lsn,
                inner.ckpt.last_checkpoint_lsn,
                inner.ckpt.n_pending_checkpoint_writes,
            )
        };
        let oldest = self.oldest_modification_or(lsn);
        let snap = self.metrics.snapshot();

        writeln!(out, "Log sequence number {lsn}")?;
        writeln!(out, "Log flushed up to   {}", self.flushed_to_disk_lsn())?;
        writeln!(out, "Pages flushed up to {oldest}")?;
        writeln!(out, "Last checkpoint at  {last_checkpoint}")?;

        let mut state = self.printout.lock().expect("printout state poisoned");
        let elapsed = state.last_time.elapsed().as_secs_f64().max(1.0);
        let ios_per_sec = (snap.log_ios - state.last_log_ios) as f64 / elapsed;
        writeln!(
            out,
            "{} pending log flushes, {} pending chkp writes",
            snap.pending_flushes, pending_checkpoints
        )?;
        writeln!(
            out,
            "{} log i/o's done, {:.2} log i/o's/second",
            snap.log_ios, ios_per_sec
        )?;
        state.last_log_ios = snap.log_ios;
        state.last_time = Instant::now();
        Ok(())
    }

    /// Reset the per-second averaging window.
    pub fn refresh_stats(&self) {
        let mut state = self.printout.lock().expect("printout state poisoned");
        state.last_log_ios = self.metrics.log_ios.load(Ordering::Relaxed);
        state.last_time = Instant::now();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
