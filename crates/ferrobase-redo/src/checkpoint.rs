//! Checkpoint engine.
//!
//! Watches two ages: `lsn - oldest_modification` (how far dirty pages
//! trail the log) and `lsn - last_checkpoint_lsn` (how much of the
//! circular file is live). Crossing the async thresholds requests
//! preflushes or a checkpoint; crossing the sync threshold preflushes
//! synchronously; reaching the capacity is an error the margin check
//! exists to prevent.
//!
//! A checkpoint itself is cheap: ensure the log is durable up to the
//! oldest modification, then durably append one 19-byte record to the
//! main file. At most one checkpoint write is in flight; racers back
//! off.

use std::path::Path;

use tracing::debug;

use crate::files;
use crate::metrics::LogMetrics;
use crate::system::LogSystem;
use crate::{Lsn, LSN_MAX};

impl LogSystem {
    /// Flush dirty pages until the oldest modification reaches
    /// `new_oldest`. Returns false when a same-type batch was already
    /// running.
    fn preflush_pool_modified_pages(&self, new_oldest: Lsn) -> bool {
        self.pool.preflush(new_oldest)
    }

    /// Make a checkpoint at the oldest modification in the pool (the
    /// current LSN when the pool is clean). Does not flush dirty pages
    /// itself; use [`make_checkpoint`](Self::make_checkpoint) for that.
    ///
    /// Returns false if a checkpoint write was already running.
    pub fn checkpoint(&self) -> bool {
        let inner = self.lock_inner();
        // With no dirty pages the oldest modification reads as the
        // current LSN; write-ahead logging guarantees everything below
        // a dirty page's oldest LSN is already in the log.
        let flush_lsn = self.oldest_modification_or(inner.lsn);
        debug_assert!(flush_lsn >= inner.ckpt.last_checkpoint_lsn);

        if flush_lsn == inner.ckpt.last_checkpoint_lsn {
            // Nothing was logged since the previous checkpoint.
            return true;
        }
        drop(inner);

        self.write_up_to(flush_lsn, true);

        let mut inner = self.lock_inner();
        debug_assert!(self.flushed_to_disk_lsn() >= flush_lsn);
        if inner.ckpt.last_checkpoint_lsn == flush_lsn {
            return true;
        }
        if inner.ckpt.n_pending_checkpoint_writes > 0 {
            return false;
        }

        inner.ckpt.next_checkpoint_lsn = flush_lsn;
        inner.ckpt.n_pending_checkpoint_writes += 1;
        debug!(flush_lsn, "writing checkpoint");
        drop(inner);

        if let Err(err) = self.files.append_checkpoint_durable(flush_lsn) {
            files::fatal_io(Path::new(files::LOG_FILE_NAME), "checkpoint append", &err);
        }

        let mut inner = self.lock_inner();
        inner.ckpt.n_pending_checkpoint_writes -= 1;
        debug_assert_eq!(inner.ckpt.n_pending_checkpoint_writes, 0);
        LogMetrics::inc(&self.metrics.log_ios);
        inner.ckpt.last_checkpoint_lsn = inner.ckpt.next_checkpoint_lsn;
        inner.ckpt.next_checkpoint_no += 1;
        debug!(
            last_checkpoint_lsn = inner.ckpt.last_checkpoint_lsn,
            flushed_to_disk_lsn = self.flushed_to_disk_lsn(),
            "checkpoint ended"
        );
        true
    }

    /// Preflush everything and checkpoint until one succeeds. Used at
    /// shutdown and by administrative flushes.
    pub fn make_checkpoint(&self) {
        while !self.preflush_pool_modified_pages(LSN_MAX) {
            // Another batch was running; flush as much as we can.
        }
        while !self.checkpoint() {
            // A racing checkpoint write was in flight; force our own.
        }
    }

    /// Background margin logic: preflush synchronously when the
    /// modified age demands it, checkpoint when the checkpoint age
    /// does. Clears the sticky flag only once the ages are back under
    /// their limits.
    fn checkpoint_margin(&self) {
        loop {
            let inner = self.lock_inner();
            if !self.check_flush_or_checkpoint() {
                return;
            }

            let oldest = self.oldest_modification_or(inner.lsn);
            let age = inner.lsn - oldest;
            let advance = age.saturating_sub(self.capacity.max_modified_age_sync);

            let checkpoint_age = inner.lsn - inner.ckpt.last_checkpoint_lsn;
            debug_assert!(self.capacity.max_checkpoint_age >= self.capacity.max_checkpoint_age_async);
            let do_checkpoint = checkpoint_age > self.capacity.max_checkpoint_age_async;

            if checkpoint_age <= self.capacity.max_checkpoint_age {
                self.set_check_flush_or_checkpoint(false);
            }
            drop(inner);

            if advance > 0 {
                // A flush is urgent: preflush synchronously.
                let new_oldest = oldest + advance;
                if !self.preflush_pool_modified_pages(new_oldest) {
                    // Another thread was flushing; re-arm and retry.
                    self.set_check_flush_or_checkpoint(true);
                    continue;
                }
            }

            if do_checkpoint {
                self.checkpoint();
            }
            return;
        }
    }

    /// Write the log buffer out in the background when it is past its
    /// recommended fill level.
    fn flush_margin(&self) {
        let lsn = {
            let inner = self.lock_inner();
            if inner.buffer.buf_free > inner.buffer.max_buf_free {
                inner.lsn
            } else {
                return;
            }
        };
        // We can write during the flush.
        self.write_up_to(lsn, false);
    }

    /// Establish free space in the log buffer and the checkpoint
    /// margin. Call only while owning no page latches.
    pub fn check_margins(&self) {
        loop {
            self.flush_margin();
            self.checkpoint_margin();
            if !self.check_flush_or_checkpoint() {
                return;
            }
        }
    }

    /// Cheap entry point for query steps: runs the margin logic only
    /// when the sticky flag says something may need doing.
    pub fn free_check(&self) {
        if self.check_flush_or_checkpoint() {
            self.check_margins();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
