//! Redo log observability counters.
//!
//! Lock-free `AtomicU64` counters recorded on the append, write, and
//! flush paths. The per-second averaging printout lives on
//! [`LogSystem`](crate::system::LogSystem), which owns the cursor state
//! the printout also reports.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Metric counters
// ---------------------------------------------------------------------------

/// Atomic counters tracking redo log activity.
pub struct LogMetrics {
    /// Append requests into the log buffer (one per `write_low`).
    pub write_requests: AtomicU64,
    /// Block write batches issued to the data file.
    pub writes: AtomicU64,
    /// Times an appender had to wait for buffer space.
    pub waits: AtomicU64,
    /// Write-ahead padding bytes written.
    pub padded_bytes: AtomicU64,
    /// Log I/O operations initiated (block writes + checkpoint writes).
    pub log_ios: AtomicU64,
    /// Durability barriers currently in flight.
    pub pending_flushes: AtomicU64,
    /// Durability barriers completed.
    pub flushes: AtomicU64,
}

impl LogMetrics {
    /// Create a zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            write_requests: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            padded_bytes: AtomicU64::new(0),
            log_ios: AtomicU64::new(0),
            pending_flushes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Bump a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Enter a flush: raise the pending gauge.
    pub fn flush_started(&self) {
        self.pending_flushes.fetch_add(1, Ordering::Acquire);
    }

    /// Leave a flush: drop the pending gauge, count the completion.
    pub fn flush_completed(&self) {
        self.pending_flushes.fetch_sub(1, Ordering::Release);
        self.flushes.fetch_add(1, Ordering::Release);
    }

    /// Take a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> LogMetricsSnapshot {
        LogMetricsSnapshot {
            write_requests: self.write_requests.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            padded_bytes: self.padded_bytes.load(Ordering::Relaxed),
            log_ios: self.log_ios.load(Ordering::Relaxed),
            pending_flushes: self.pending_flushes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl Default for LogMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of [`LogMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMetricsSnapshot {
    pub write_requests: u64,
    pub writes: u64,
    pub waits: u64,
    pub padded_bytes: u64,
    pub log_ios: u64,
    pub pending_flushes: u64,
    pub flushes: u64,
}

impl fmt::Display for LogMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "log_write_requests={} log_writes={} log_waits={} log_padded={} \
             n_log_ios={} pending_flushes={} flushes={}",
            self.write_requests,
            self.writes,
            self.waits,
            self.padded_bytes,
            self.log_ios,
            self.pending_flushes,
            self.flushes,
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================
