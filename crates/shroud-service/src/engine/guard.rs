//! Per-handler in-flight path set.
//!
//! Real watchers deliver bursts of duplicate notifications for one write; the
//! guard lets exactly one handling cycle own a path at a time. Leases release
//! on drop, so every exit path of a cycle gives the path back.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct ProcessingGuard {
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl ProcessingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path`, or returns `None` if another cycle already holds it.
    pub fn try_acquire(&self, path: &Path) -> Option<PathLease<'_>> {
        if self.in_flight.lock().insert(path.to_path_buf()) {
            Some(PathLease {
                guard: self,
                path: path.to_path_buf(),
            })
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn release(&self, path: &Path) {
        self.in_flight.lock().remove(path);
    }
}

/// Ownership of one path inside a [`ProcessingGuard`].
#[derive(Debug)]
pub struct PathLease<'a> {
    guard: &'a ProcessingGuard,
    path: PathBuf,
}

impl Drop for PathLease<'_> {
    fn drop(&mut self) {
        self.guard.release(&self.path);
    }
}
