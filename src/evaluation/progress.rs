//! In-memory progress counters for a running job.
//!
//! Counters only ever increase, and `processed` is bumped exactly once per
//! settled image, so any two polls see a monotonic sequence regardless of
//! how dispatch interleaves. "Failed" here means the adapter ended the
//! image's chain; parse failures still count as succeeded dispatch and are
//! broken out later by scoring.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug)]
pub struct JobProgress {
    total: u64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl JobProgress {
    pub fn new(total: u64) -> Self {
        JobProgress {
            total,
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Records a chain that settled with a final raw output. Returns the
    /// updated processed count.
    pub fn record_success(&self) -> u64 {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records a chain ended by an adapter failure. Returns the updated
    /// processed count.
    pub fn record_failure(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            processed: self.processed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_at_zero() {
        let p = JobProgress::new(5);
        let s = p.snapshot();
        assert_eq!(s.total, 5);
        assert_eq!(s.processed, 0);
        assert_eq!(s.succeeded, 0);
        assert_eq!(s.failed, 0);
    }

    #[test]
    fn record_returns_strictly_increasing_processed_counts() {
        let p = JobProgress::new(4);
        assert_eq!(p.record_success(), 1);
        assert_eq!(p.record_failure(), 2);
        assert_eq!(p.record_success(), 3);
        assert_eq!(p.record_success(), 4);

        let s = p.snapshot();
        assert_eq!(s.processed, 4);
        assert_eq!(s.succeeded, 3);
        assert_eq!(s.failed, 1);
    }

    #[test]
    fn concurrent_records_never_lose_counts() {
        let p = Arc::new(JobProgress::new(800));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let p = Arc::clone(&p);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    if (worker + i) % 3 == 0 {
                        p.record_failure();
                    } else {
                        p.record_success();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let s = p.snapshot();
        assert_eq!(s.processed, 800);
        assert_eq!(s.succeeded + s.failed, s.processed);
    }
}
