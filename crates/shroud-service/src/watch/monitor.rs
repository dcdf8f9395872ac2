//! Watch sessions: one handler, one OS watch and one dispatch task per
//! monitored directory and direction.
//!
//! Notifications flow `FsWatcher → mpsc → dispatch task → spawn_blocking`, so
//! transforms of different paths run concurrently on tokio's blocking pool
//! while the dispatch task stays responsive. Stopping a session removes the
//! OS watch first, then waits for every transform it already started.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use shroud_core::audit::AuditSink;
use shroud_core::policy::{Direction, FsEvent, WatchPolicy};
use shroud_core::token::TransformKey;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::watcher::FsWatcher;
use crate::engine::{CycleOutcome, StatusCallback, TransformHandler};

/// Snapshot of one running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub root: PathBuf,
    pub direction: Direction,
    pub files_processed: u64,
}

struct Session {
    handler: Arc<TransformHandler>,
    watcher: FsWatcher,
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
}

pub struct Monitor {
    audit: Arc<dyn AuditSink>,
    status: Option<StatusCallback>,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl Monitor {
    pub fn new(audit: Arc<dyn AuditSink>, status: Option<StatusCallback>) -> Self {
        Self {
            audit,
            status,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts monitoring `policy.root`. Must be called from within a tokio
    /// runtime. Errors here are fatal for the session and nothing is left
    /// running.
    pub fn start(
        &self,
        policy: WatchPolicy,
        direction: Direction,
        key: TransformKey,
    ) -> Result<Uuid> {
        let runtime = Handle::try_current().context("monitoring requires a tokio runtime")?;
        let meta = fs::metadata(&policy.root)
            .with_context(|| format!("watch root {} is not accessible", policy.root.display()))?;
        if !meta.is_dir() {
            bail!("watch root {} is not a directory", policy.root.display());
        }
        // notify reports canonical paths on most backends
        let root = policy
            .root
            .canonicalize()
            .with_context(|| format!("resolve {}", policy.root.display()))?;
        let policy = WatchPolicy { root, ..policy };

        let handler = Arc::new(TransformHandler::new(
            policy,
            direction,
            key,
            self.audit.clone(),
            self.status.clone(),
        ));
        handler.cleanup_staging();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watcher = FsWatcher::start(&handler.policy().root, events_tx)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch = runtime.spawn(dispatch(handler.clone(), events_rx, shutdown_rx));

        let id = Uuid::new_v4();
        let policy = handler.policy();
        self.audit.record(
            "monitoring_started",
            json!({
                "session_id": id.to_string(),
                "root": policy.root.display().to_string(),
                "direction": direction.to_string(),
                "trigger": policy.trigger.to_string(),
                "mode": policy.mode.to_string(),
            }),
        );
        info!(
            %id,
            root = %policy.root.display(),
            %direction,
            trigger = %policy.trigger,
            mode = %policy.mode,
            "monitoring started"
        );

        self.sessions.lock().insert(
            id,
            Session {
                handler,
                watcher,
                shutdown: shutdown_tx,
                dispatch,
            },
        );
        Ok(id)
    }

    /// Stops one session and waits for its in-flight transforms.
    pub async fn stop(&self, id: Uuid) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .remove(&id)
            .with_context(|| format!("no watch session {id}"))?;
        let Session {
            handler,
            watcher,
            shutdown,
            dispatch,
        } = session;

        if let Err(e) = watcher.stop() {
            warn!(%id, error = %e, "unwatch failed; continuing shutdown");
        }
        let _ = shutdown.send(true);
        if let Err(e) = dispatch.await {
            error!(%id, error = %e, "dispatch task ended abnormally");
        }

        let root = handler.policy().root.display().to_string();
        self.audit.record(
            "monitoring_stopped",
            json!({
                "session_id": id.to_string(),
                "root": root,
                "files_processed": handler.files_processed(),
                "failures": handler.failures(),
            }),
        );
        info!(%id, root = %root, processed = handler.files_processed(), "monitoring stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.sessions.lock().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.stop(id).await {
                warn!(%id, error = %e, "stop failed");
            }
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| SessionInfo {
                id: *id,
                root: s.handler.policy().root.clone(),
                direction: s.handler.direction(),
                files_processed: s.handler.files_processed(),
            })
            .collect();
        out.sort_by(|a, b| a.root.cmp(&b.root).then(a.id.cmp(&b.id)));
        out
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let live = self.sessions.get_mut().len();
        if live > 0 {
            warn!(sessions = live, "monitor dropped without stop_all");
        }
    }
}

async fn dispatch(
    handler: Arc<TransformHandler>,
    mut events: mpsc::UnboundedReceiver<FsEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => {
                    let handler = handler.clone();
                    in_flight.spawn_blocking(move || handler.handle(&event));
                }
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_outcome(joined),
            _ = shutdown.changed() => break,
        }
    }
    if !in_flight.is_empty() {
        debug!(count = in_flight.len(), "waiting for in-flight transforms");
    }
    while let Some(joined) = in_flight.join_next().await {
        log_outcome(joined);
    }
}

fn log_outcome(joined: Result<CycleOutcome, JoinError>) {
    match joined {
        Ok(CycleOutcome::Completed(report)) => trace!(
            transformed = report.transformed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "cycle completed"
        ),
        Ok(outcome) => trace!(?outcome, "cycle finished"),
        Err(e) => error!(error = %e, "transform task panicked"),
    }
}
