//! Mini-transactions.
//!
//! A mini-transaction accumulates the redo records of one atomic page
//! modification plus the set of pages it dirtied. Commit copies the
//! record group into the log buffer under the log mutex, then inserts
//! the dirtied pages into the buffer pool's flush list under the
//! flush-order mutex, so flush-list order matches LSN order even though
//! the log mutex is released in between.

use tracing::trace;

use crate::system::LogSystem;
use crate::{Lsn, PageId};

/// One atomic unit of page modification and its redo record group.
#[derive(Debug, Default)]
pub struct MiniTransaction {
    log: Vec<u8>,
    dirtied: Vec<PageId>,
}

impl MiniTransaction {
    /// Start an empty mini-transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one redo record to the group.
    pub fn append_record(&mut self, record: &[u8]) {
        self.log.extend_from_slice(record);
    }

    /// Record that `page` was modified by this mini-transaction.
    pub fn mark_dirty(&mut self, page: PageId) {
        self.dirtied.push(page);
    }

    /// Bytes accumulated so far (without the end-of-group marker).
    #[must_use]
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Whether nothing was logged or dirtied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty() && self.dirtied.is_empty()
    }

    /// Commit: append the record group to the log and register the
    /// dirtied pages. Returns the commit LSN (0 if nothing happened).
    ///
    /// Runs to completion; there is no cancellation once commit starts.
    pub fn commit(mut self, log: &LogSystem) -> Lsn {
        if self.is_empty() {
            return 0;
        }

        if self.log.is_empty() {
            // Pages dirtied without redo records still enter the flush
            // list, anchored at the current LSN.
            let inner = log.lock_inner();
            let lsn = inner.lsn;
            let order = log
                .flush_order_mutex
                .lock()
                .expect("flush order mutex poisoned");
            drop(inner);
            for &page in &self.dirtied {
                log.pool.insert_flush_list(page, lsn, lsn);
            }
            drop(order);
            return lsn;
        }

        // Terminate the record group.
        self.log.push(0);
        let len = self.log.len();

        {
            let inner = log.lock_inner();
            let half = inner.buffer.size();
            drop(inner);
            if len > half / 2 {
                log.buffer_extend((len + 1) * 2);
            }
        }

        let inner = log.lock_inner();
        let inner = log.margin_checkpoint_age(inner, len);
        let mut inner = log.reserve_and_open(inner, len);

        let start_lsn = inner.lsn;
        log.write_low(&mut inner, &self.log);
        let commit_lsn = log.close_append(&mut inner);
        trace!(start_lsn, commit_lsn, bytes = len, "mtr committed");

        // Take the flush-order mutex before releasing the log mutex so
        // flush-list insertions happen in LSN order.
        let order = if self.dirtied.is_empty() {
            None
        } else {
            Some(
                log.flush_order_mutex
                    .lock()
                    .expect("flush order mutex poisoned"),
            )
        };
        drop(inner);

        for &page in &self.dirtied {
            log.pool.insert_flush_list(page, start_lsn, commit_lsn);
        }
        drop(order);

        commit_lsn
    }
}

// ===========================================================================
// Tests
// ===========================================================================
