//! The transformation engine: one [`TransformHandler`] per watched directory
//! and direction.
//!
//! Every notification goes through the same cycle:
//!
//! ```text
//! classify → guard → resolve → transform → audit + status → release
//! ```
//!
//! Nothing escapes [`TransformHandler::handle`]: skips and failures become
//! audit events and log lines, and the caller gets a [`CycleOutcome`].

pub mod classifier;
pub mod guard;
pub mod resolver;
pub mod transform;

use parking_lot::Mutex;
use serde_json::json;
use shroud_core::audit::AuditSink;
use shroud_core::policy::{Direction, FsEvent, Mode, WatchPolicy};
use shroud_core::token::TransformKey;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use classifier::Action;
use guard::ProcessingGuard;
use resolver::Resolution;
use transform::TransformEngine;

pub use resolver::SkipReason;
pub use transform::{Committed, TransformError};

/// Presentation hook, invoked once per successfully transformed file.
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Wrong trigger, wrong suffix, directory, or outside the root.
    Ignored,
    /// Another cycle of this handler owns the path.
    DuplicateInFlight,
    /// An `All`-mode rescan was already running; it will run once more.
    Coalesced,
    /// The path was gone by the time it was examined.
    Vanished,
    Completed(CycleReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub transformed: Vec<Committed>,
    pub skipped: Vec<(PathBuf, SkipReason)>,
    pub failed: Vec<(PathBuf, String)>,
}

impl CycleReport {
    fn merge(&mut self, other: CycleReport) {
        self.transformed.extend(other.transformed);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

pub struct TransformHandler {
    policy: WatchPolicy,
    direction: Direction,
    engine: TransformEngine,
    guard: ProcessingGuard,
    rescan: RescanGate,
    audit: Arc<dyn AuditSink>,
    status: Option<StatusCallback>,
    processed: AtomicU64,
    failures: AtomicU64,
}

impl TransformHandler {
    pub fn new(
        policy: WatchPolicy,
        direction: Direction,
        key: TransformKey,
        audit: Arc<dyn AuditSink>,
        status: Option<StatusCallback>,
    ) -> Self {
        Self {
            policy,
            direction,
            engine: TransformEngine::new(key),
            guard: ProcessingGuard::new(),
            rescan: RescanGate::default(),
            audit,
            status,
            processed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &WatchPolicy {
        &self.policy
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn guard(&self) -> &ProcessingGuard {
        &self.guard
    }

    /// Files successfully transformed over the handler's lifetime.
    pub fn files_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Runs one full handling cycle for a notification. Safe to call from
    /// many threads at once.
    pub fn handle(&self, event: &FsEvent) -> CycleOutcome {
        let path = match classifier::classify(event, &self.policy, self.direction) {
            Action::Process(path) => path,
            Action::Ignore => {
                trace!(path = %event.path.display(), kind = ?event.kind, "ignored");
                return CycleOutcome::Ignored;
            }
        };
        let Some(lease) = self.guard.try_acquire(&path) else {
            debug!(path = %path.display(), "already in flight");
            return CycleOutcome::DuplicateInFlight;
        };

        if self.policy.mode == Mode::All {
            // the scan takes its own per-file leases, including for this path
            drop(lease);
            return self.rescan();
        }

        let resolution = resolver::resolve(&path, &self.policy, self.direction);
        if resolution.vanished {
            return CycleOutcome::Vanished;
        }
        CycleOutcome::Completed(self.run(resolution, false))
    }

    /// One `All`-style pass over the root regardless of the configured mode.
    pub fn sweep(&self) -> CycleReport {
        self.cleanup_staging();
        self.run(resolver::scan(&self.policy, self.direction), true)
    }

    /// Removes staging files left by an interrupted transform.
    pub fn cleanup_staging(&self) -> Vec<PathBuf> {
        let removed = transform::cleanup_staging(&self.policy.root);
        if !removed.is_empty() {
            self.audit.record(
                "staging_cleaned",
                json!({
                    "root": self.policy.root.display().to_string(),
                    "removed": removed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                }),
            );
        }
        removed
    }

    fn rescan(&self) -> CycleOutcome {
        let Some(mut pass) = self.rescan.enter() else {
            debug!(root = %self.policy.root.display(), "rescan already running; coalesced");
            return CycleOutcome::Coalesced;
        };
        let mut report = CycleReport::default();
        loop {
            report.merge(self.run(resolver::scan(&self.policy, self.direction), true));
            if !pass.again() {
                break;
            }
            debug!(root = %self.policy.root.display(), "running coalesced rescan");
        }
        CycleOutcome::Completed(report)
    }

    /// Transforms every included file of a resolution. With `lease_each`,
    /// files held by another cycle are left to that cycle.
    fn run(&self, resolution: Resolution, lease_each: bool) -> CycleReport {
        let mut report = CycleReport::default();

        for (path, reason) in resolution.skipped {
            if let SkipReason::SizeExceeded { size, limit } = reason {
                warn!(path = %path.display(), size, limit, "file exceeds size limit; skipped");
                self.audit.record(
                    "size_exceeded",
                    json!({
                        "file_path": path.display().to_string(),
                        "size_bytes": size,
                        "limit_bytes": limit,
                    }),
                );
            }
            report.skipped.push((path, reason));
        }

        for (path, e) in resolution.failed {
            self.fail(&path, &e.to_string(), &mut report);
        }

        for record in resolution.include {
            let _lease = if lease_each {
                match self.guard.try_acquire(&record.path) {
                    Some(lease) => Some(lease),
                    None => {
                        trace!(path = %record.path.display(), "held by another cycle");
                        continue;
                    }
                }
            } else {
                None
            };
            match self.engine.apply(self.direction, &record.path) {
                Ok(done) => {
                    self.commit(&done);
                    report.transformed.push(done);
                }
                Err(e) => self.fail(&record.path, &e.to_string(), &mut report),
            }
        }
        report
    }

    fn commit(&self, done: &Committed) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let (event_type, details, status_line) = match self.direction {
            Direction::Encrypt => (
                "file_encrypted",
                json!({
                    "original_path": done.source.display().to_string(),
                    "encrypted_path": done.target.display().to_string(),
                    "size_bytes": done.size_bytes,
                }),
                format!("Encrypted: {}", display_name(&done.source)),
            ),
            Direction::Decrypt => (
                "file_decrypted",
                json!({
                    "encrypted_path": done.source.display().to_string(),
                    "original_path": done.target.display().to_string(),
                    "size_bytes": done.size_bytes,
                }),
                format!("Decrypted: {}", display_name(&done.target)),
            ),
        };
        self.audit.record(event_type, details);
        if let Some(status) = &self.status {
            status(&status_line);
        }
    }

    fn fail(&self, path: &Path, cause: &str, report: &mut CycleReport) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        error!(path = %path.display(), direction = %self.direction, error = cause, "transform failed");
        self.audit.record(
            self.direction.error_event(),
            json!({
                "file_path": path.display().to_string(),
                "error": cause,
            }),
        );
        report.failed.push((path.to_path_buf(), cause.to_string()));
    }
}

impl Drop for TransformHandler {
    fn drop(&mut self) {
        if self.guard.in_flight() > 0 {
            warn!(root = %self.policy.root.display(), "handler dropped with cycles in flight");
        } else {
            info!(
                root = %self.policy.root.display(),
                processed = self.files_processed(),
                "handler torn down"
            );
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Collapses bursts of `All`-mode events into at most one running scan plus
/// one pending rerun.
#[derive(Debug, Default)]
struct RescanGate {
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    running: bool,
    pending: bool,
}

impl RescanGate {
    fn enter(&self) -> Option<RescanPass<'_>> {
        let mut state = self.state.lock();
        if state.running {
            state.pending = true;
            None
        } else {
            state.running = true;
            Some(RescanPass {
                gate: self,
                finished: false,
            })
        }
    }
}

struct RescanPass<'a> {
    gate: &'a RescanGate,
    finished: bool,
}

impl RescanPass<'_> {
    /// Consumes a pending rerun request. When none is pending the gate is
    /// released under the same lock, so no request can slip in between.
    fn again(&mut self) -> bool {
        let mut state = self.gate.state.lock();
        if state.pending {
            state.pending = false;
            true
        } else {
            state.running = false;
            self.finished = true;
            false
        }
    }
}

impl Drop for RescanPass<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.gate.state.lock();
            state.running = false;
            state.pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_coalesces_into_one_rerun() {
        let gate = RescanGate::default();
        let mut pass = gate.enter().unwrap();
        assert!(gate.enter().is_none());
        assert!(gate.enter().is_none());
        assert!(pass.again());
        assert!(!pass.again());
        drop(pass);
        assert!(gate.enter().is_some());
    }

    #[test]
    fn gate_reopens_after_unwind() {
        let gate = RescanGate::default();
        {
            let _pass = gate.enter().unwrap();
            assert!(gate.enter().is_none());
        }
        let mut pass = gate.enter().unwrap();
        assert!(!pass.again());
    }

    #[test]
    fn display_name_prefers_file_name() {
        assert_eq!(display_name(Path::new("/data/a/report.pdf")), "report.pdf");
        assert_eq!(display_name(Path::new("/")), "/");
    }
}
