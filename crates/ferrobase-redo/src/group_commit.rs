//! Group-commit locks for the write and flush stages.
//!
//! Each lock coalesces concurrent durability requests: the first
//! arriver for an uncovered LSN becomes the owner and performs the
//! stage for everyone; later arrivers park on a condvar and wake either
//! covered (their target LSN completed while they slept) or as the next
//! owner.
//!
//! The write lock serializes the dual-buffer swap and the block I/O;
//! the flush lock serializes the durability barrier. Both are leaf
//! locks: never acquired while holding the log mutex.

use std::sync::{Condvar, Mutex};

use crate::Lsn;

/// Outcome of [`GroupCommitLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The caller owns the lock and must perform the stage, then
    /// [`release`](GroupCommitLock::release).
    Acquired,
    /// Another owner already completed the stage past the requested
    /// LSN; nothing left to do.
    NotAcquired,
}

#[derive(Debug)]
struct State {
    held: bool,
    /// Target LSN the current owner is working toward.
    pending_lsn: Lsn,
    /// Highest LSN for which the stage has completed.
    value: Lsn,
}

/// An LSN-valued group-commit lock.
#[derive(Debug)]
pub struct GroupCommitLock {
    state: Mutex<State>,
    completed: Condvar,
}

impl GroupCommitLock {
    /// New lock with completed value 0.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                held: false,
                pending_lsn: 0,
                value: 0,
            }),
            completed: Condvar::new(),
        }
    }

    /// Block until the stage is either complete past `lsn`
    /// ([`Acquire::NotAcquired`]) or owned by the caller
    /// ([`Acquire::Acquired`]).
    pub fn acquire(&self, lsn: Lsn) -> Acquire {
        let mut state = self.state.lock().expect("group commit lock poisoned");
        loop {
            if state.value >= lsn {
                return Acquire::NotAcquired;
            }
            if !state.held {
                state.held = true;
                state.pending_lsn = state.pending_lsn.max(lsn);
                return Acquire::Acquired;
            }
            state = self
                .completed
                .wait(state)
                .expect("group commit lock poisoned");
        }
    }

    /// Raise the owner's target (the owner covers everything up to the
    /// current log end, which may exceed the LSN it acquired for).
    pub fn set_pending(&self, lsn: Lsn) {
        let mut state = self.state.lock().expect("group commit lock poisoned");
        debug_assert!(state.held);
        state.pending_lsn = state.pending_lsn.max(lsn);
    }

    /// Complete the stage up to `lsn` and wake all waiters.
    pub fn release(&self, lsn: Lsn) {
        let mut state = self.state.lock().expect("group commit lock poisoned");
        debug_assert!(state.held);
        state.held = false;
        state.value = state.value.max(lsn);
        drop(state);
        self.completed.notify_all();
    }

    /// Highest LSN for which the stage has completed.
    pub fn value(&self) -> Lsn {
        self.state
            .lock()
            .expect("group commit lock poisoned")
            .value
    }
}

impl Default for GroupCommitLock {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
