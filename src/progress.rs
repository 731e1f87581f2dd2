use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of a running build.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Progress {
    pub files_so_far: u64,
    pub total_files: u64,
    pub bytes_so_far: u64,
    pub total_bytes: u64,
}

/// Additive counters shared between build workers and whatever renders
/// progress. Workers bump the counters per materialized rom; readers take
/// snapshots on their own schedule.
#[derive(Default)]
pub struct ProgressTracker {
    files_so_far: AtomicU64,
    total_files: AtomicU64,
    bytes_so_far: AtomicU64,
    total_bytes: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        ProgressTracker::default()
    }

    /// Zero the counters and set the expected totals for the next job.
    pub fn reset(&self, total_files: u64, total_bytes: u64) {
        self.files_so_far.store(0, Ordering::Relaxed);
        self.bytes_so_far.store(0, Ordering::Relaxed);
        self.total_files.store(total_files, Ordering::Relaxed);
        self.total_bytes.store(total_bytes, Ordering::Relaxed);
    }

    pub fn add_files(&self, n: u64) {
        self.files_so_far.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_so_far.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            files_so_far: self.files_so_far.load(Ordering::Relaxed),
            total_files: self.total_files.load(Ordering::Relaxed),
            bytes_so_far: self.bytes_so_far.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}
