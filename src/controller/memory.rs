//! Query-wide memory watermarks.
//!
//! Producers (the memory manager, task status updates) race to report
//! reservation deltas; readers poll for snapshots. Current counters are
//! plain atomic adds, peaks are raised with `fetch_max` so they are
//! monotonically non-decreasing no matter how updates interleave. Readers
//! see each field atomically but no consistent multi-field view.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// Thread-safe current/peak memory accounting for one query.
#[derive(Default)]
pub struct MemoryTracker {
    current_user: AtomicI64,
    current_revocable: AtomicI64,
    current_total: AtomicI64,

    peak_user: AtomicI64,
    peak_revocable: AtomicI64,
    peak_total: AtomicI64,

    peak_task_user: AtomicI64,
    peak_task_revocable: AtomicI64,
    peak_task_total: AtomicI64,
}

/// Point-in-time view of the watermarks, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub current_user: i64,
    pub current_revocable: i64,
    pub current_total: i64,
    pub peak_user: i64,
    pub peak_revocable: i64,
    pub peak_total: i64,
    pub peak_task_user: i64,
    pub peak_task_revocable: i64,
    pub peak_task_total: i64,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies reservation deltas and raises the peaks.
    ///
    /// `delta_*` adjust the query-wide current counters; `task_*` are the
    /// absolute reservations of the reporting task and only feed the
    /// per-task peaks. Each peak is raised independently; no cross-field
    /// ordering is guaranteed.
    pub fn update(
        &self,
        delta_user: i64,
        delta_revocable: i64,
        delta_total: i64,
        task_user: i64,
        task_revocable: i64,
        task_total: i64,
    ) {
        let user = self.current_user.fetch_add(delta_user, Ordering::AcqRel) + delta_user;
        let revocable =
            self.current_revocable.fetch_add(delta_revocable, Ordering::AcqRel) + delta_revocable;
        let total = self.current_total.fetch_add(delta_total, Ordering::AcqRel) + delta_total;

        self.peak_user.fetch_max(user, Ordering::AcqRel);
        self.peak_revocable.fetch_max(revocable, Ordering::AcqRel);
        self.peak_total.fetch_max(total, Ordering::AcqRel);

        self.peak_task_user.fetch_max(task_user, Ordering::AcqRel);
        self.peak_task_revocable.fetch_max(task_revocable, Ordering::AcqRel);
        self.peak_task_total.fetch_max(task_total, Ordering::AcqRel);
    }

    pub fn peak_user(&self) -> i64 {
        self.peak_user.load(Ordering::Acquire)
    }

    pub fn peak_revocable(&self) -> i64 {
        self.peak_revocable.load(Ordering::Acquire)
    }

    pub fn peak_total(&self) -> i64 {
        self.peak_total.load(Ordering::Acquire)
    }

    pub fn peak_task_user(&self) -> i64 {
        self.peak_task_user.load(Ordering::Acquire)
    }

    pub fn peak_task_revocable(&self) -> i64 {
        self.peak_task_revocable.load(Ordering::Acquire)
    }

    pub fn peak_task_total(&self) -> i64 {
        self.peak_task_total.load(Ordering::Acquire)
    }

    /// Reads all watermarks. Fields are read independently, so a racing
    /// update may be partially visible across fields.
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            current_user: self.current_user.load(Ordering::Acquire),
            current_revocable: self.current_revocable.load(Ordering::Acquire),
            current_total: self.current_total.load(Ordering::Acquire),
            peak_user: self.peak_user(),
            peak_revocable: self.peak_revocable(),
            peak_total: self.peak_total(),
            peak_task_user: self.peak_task_user(),
            peak_task_revocable: self.peak_task_revocable(),
            peak_task_total: self.peak_task_total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_tracker_is_zero() {
        let snapshot = MemoryTracker::new().snapshot();
        assert_eq!(snapshot, MemorySnapshot::default());
    }

    #[test]
    fn test_peak_survives_release() {
        let tracker = MemoryTracker::new();
        tracker.update(100, 0, 100, 0, 0, 0);
        tracker.update(-100, 0, -100, 0, 0, 0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.current_user, 0);
        assert_eq!(snapshot.current_total, 0);
        assert_eq!(snapshot.peak_user, 100);
        assert_eq!(snapshot.peak_total, 100);
    }

    #[test]
    fn test_task_peaks_track_maximum_report() {
        let tracker = MemoryTracker::new();
        tracker.update(0, 0, 0, 64, 16, 80);
        tracker.update(0, 0, 0, 32, 48, 80);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.peak_task_user, 64);
        assert_eq!(snapshot.peak_task_revocable, 48);
        assert_eq!(snapshot.peak_task_total, 80);
    }

    #[test]
    fn test_peaks_are_monotonic_under_racing_producers() {
        let tracker = Arc::new(MemoryTracker::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    tracker.update(10, 0, 10, 10, 0, 10);
                    tracker.update(-10, 0, -10, 0, 0, 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.current_user, 0);
        // At least one update committed a positive balance.
        assert!(snapshot.peak_user >= 10);
        assert!(snapshot.peak_user <= 80);
        assert_eq!(snapshot.peak_task_user, 10);
    }
}
