//! Clean-shutdown sequencer.
//!
//! Quiesces the external actors in a fixed order, then forces a final
//! checkpoint at the current LSN so the next startup needs no redo.
//! Between conditions the sequencer polls every 100 ms and logs
//! progress every 60 s.
//!
//! The "very fast" mode skips the final checkpoint entirely: it flushes
//! the log and leaves crash recovery to run at the next startup.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use ferrobase_error::Result;
use tracing::{info, warn};

use crate::system::LogSystem;
use crate::Lsn;

/// Poll interval between quiescence checks.
const CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Progress is logged every this many polls (60 s at 100 ms).
const PROGRESS_EVERY: u32 = 600;

/// How thorough the shutdown is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Full quiescence and a final checkpoint at the current LSN.
    Normal,
    /// Flush the log and stop; recovery runs at next startup.
    VeryFast,
}

/// Shutdown progress, advanced by [`LogSystem::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownPhase {
    None = 0,
    Cleanup = 1,
    FlushPhase = 2,
    LastPhase = 3,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Cleanup,
            2 => Self::FlushPhase,
            3 => Self::LastPhase,
            _ => Self::None,
        }
    }
}

/// External actors the sequencer must quiesce; all owned outside the
/// log subsystem.
pub trait ShutdownActors: Send + Sync {
    /// Cancel all background timers.
    fn cancel_timers(&self);

    /// Number of active (non-prepared) transactions.
    fn active_transactions(&self) -> usize;

    /// Whether the rollback-of-recovered-transactions thread is alive.
    fn rollback_thread_active(&self) -> bool;

    /// Whether encryption background threads are alive.
    fn encryption_threads_active(&self) -> bool;

    /// Stamp the shutdown LSN into the first page of every data file,
    /// marking the shutdown clean.
    fn stamp_shutdown_lsn(&self, lsn: Lsn) -> Result<()>;
}

impl LogSystem {
    /// Current shutdown phase.
    pub fn shutdown_phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.shutdown_phase.load(Ordering::Relaxed))
    }

    fn enter_phase(&self, phase: ShutdownPhase) {
        self.shutdown_phase.store(phase as u8, Ordering::Relaxed);
        info!(?phase, "shutdown phase");
    }

    /// Run the shutdown sequence. Returns the shutdown LSN.
    ///
    /// In [`ShutdownMode::Normal`] the returned LSN equals
    /// `last_checkpoint_lsn` and has been stamped into the data files;
    /// the log files stay open for the caller to
    /// [`close`](LogSystem::close).
    pub fn shutdown(&self, actors: &dyn ShutdownActors, mode: ShutdownMode) -> Result<Lsn> {
        info!("starting shutdown");
        actors.cancel_timers();
        self.enter_phase(ShutdownPhase::Cleanup);

        // Even the very fast mode waits out transactions: committed or
        // prepared work must not be lost.
        wait_until("active transactions to finish", || {
            actors.active_transactions() == 0
        });
        wait_until("rollback of recovered transactions to exit", || {
            !actors.rollback_thread_active()
        });
        wait_until("encryption threads to exit", || {
            !actors.encryption_threads_active()
        });

        self.enter_phase(ShutdownPhase::FlushPhase);
        wait_until("page cleaner to finish flushing", || {
            !self.pool.cleaner_is_active()
        });
        wait_until("pending checkpoint and log flush writes", || {
            self.lock_inner().ckpt.n_pending_checkpoint_writes == 0
                && self.metrics.pending_flushes.load(Ordering::Relaxed) == 0
        });
        wait_until("buffer page I/Os to complete", || {
            self.pool.pending_io() == 0
        });

        if mode == ShutdownMode::VeryFast {
            warn!(
                "very fast shutdown without flushing the buffer pool; \
                 crash recovery will run at the next startup"
            );
            // No LSN stamps: the next startup must deduce the shutdown
            // was not clean.
            self.buffer_flush_to_disk(true);
            self.enter_phase(ShutdownPhase::LastPhase);
            return Ok(self.flushed_to_disk_lsn());
        }

        // Checkpoint until the LSN stops moving under us.
        let lsn = loop {
            self.make_checkpoint();
            let inner = self.lock_inner();
            debug_assert!(inner.lsn >= inner.ckpt.last_checkpoint_lsn);
            if inner.lsn == inner.ckpt.last_checkpoint_lsn {
                break inner.lsn;
            }
        };

        // All buffered changes reach the data file before the stamps.
        self.files.data_flush(&self.metrics);

        self.enter_phase(ShutdownPhase::LastPhase);
        actors.stamp_shutdown_lsn(lsn)?;
        info!(lsn, "shutdown checkpoint complete");
        Ok(lsn)
    }
}

fn wait_until(what: &'static str, mut done: impl FnMut() -> bool) {
    let mut polls = 0_u32;
    loop {
        if done() {
            return;
        }
        thread::sleep(CHECK_INTERVAL);
        polls += 1;
        if polls % PROGRESS_EVERY == 0 {
            info!(what, "still waiting");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::system::tests::mem_system;
    use crate::MiniTransaction;

    use super::*;

    #[derive(Default)]
    struct QuiescedActors {
        timers_cancelled: AtomicUsize,
        /// Transactions left; decremented once per poll.
        draining_transactions: AtomicUsize,
        stamped: Mutex<Vec<Lsn>>,
        stamp_count: AtomicU64,
    }

    impl ShutdownActors for QuiescedActors {
        fn cancel_timers(&self) {
            self.timers_cancelled.fetch_add(1, Ordering::Relaxed);
        }

        fn active_transactions(&self) -> usize {
            self.draining_transactions
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(n.saturating_sub(1))
                })
                .expect("fetch_update never fails")
        }

        fn rollback_thread_active(&self) -> bool {
            false
        }

        fn encryption_threads_active(&self) -> bool {
            false
        }

        fn stamp_shutdown_lsn(&self, lsn: Lsn) -> Result<()> {
            self.stamped.lock().expect("actors poisoned").push(lsn);
            self.stamp_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn normal_shutdown_checkpoints_at_current_lsn() {
        let log = mem_system(1 << 20);
        for i in 0..4 {
            let mut mtr = MiniTransaction::new();
            mtr.append_record(&vec![i as u8; 123]);
            mtr.commit(&log);
        }
        let lsn_before = log.lsn();

        let actors = QuiescedActors::default();
        let shutdown_lsn = log.shutdown(&actors, ShutdownMode::Normal).expect("shutdown");

        assert_eq!(shutdown_lsn, lsn_before);
        assert_eq!(log.last_checkpoint_lsn(), shutdown_lsn);
        assert_eq!(log.shutdown_phase(), ShutdownPhase::LastPhase);
        assert_eq!(actors.timers_cancelled.load(Ordering::Relaxed), 1);
        assert_eq!(*actors.stamped.lock().expect("actors"), vec![shutdown_lsn]);

        // The main file's final record is the shutdown checkpoint.
        let record = log.files().last_checkpoint_record().expect("record");
        assert_eq!(record.lsn, shutdown_lsn);
    }

    #[test]
    fn shutdown_waits_out_active_transactions() {
        let log = mem_system(1 << 20);
        let actors = QuiescedActors {
            draining_transactions: AtomicUsize::new(3),
            ..QuiescedActors::default()
        };
        log.shutdown(&actors, ShutdownMode::Normal).expect("shutdown");
        // The transaction gauge was polled down to zero.
        assert_eq!(actors.draining_transactions.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn very_fast_shutdown_skips_checkpoint_and_stamps() {
        let log = mem_system(1 << 20);
        let mut mtr = MiniTransaction::new();
        mtr.append_record(&[9_u8; 256]);
        let commit_lsn = mtr.commit(&log);
        let checkpoint_before = log.last_checkpoint_lsn();

        let actors = QuiescedActors::default();
        let lsn = log
            .shutdown(&actors, ShutdownMode::VeryFast)
            .expect("shutdown");

        // The log is durable, but no checkpoint moved and nothing was
        // stamped: recovery must run at next startup.
        assert!(lsn >= commit_lsn);
        assert_eq!(log.flushed_to_disk_lsn(), log.lsn());
        assert_eq!(log.last_checkpoint_lsn(), checkpoint_before);
        assert!(actors.stamped.lock().expect("actors").is_empty());
        assert_eq!(log.shutdown_phase(), ShutdownPhase::LastPhase);
    }
}
