//! Recursive filesystem watcher built on the `notify` crate.
//!
//! Raw notify events are flattened into [`FsEvent`]s and pushed onto a tokio
//! channel for the session's dispatch task.

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use shroud_core::policy::{FsEvent, FsEventKind};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub struct FsWatcher {
    watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FsWatcher {
    /// Registers a recursive watch on `root`. Failing to register is fatal
    /// for the caller; errors reported later by the backend are only logged.
    pub fn start(root: &Path, events: mpsc::UnboundedSender<FsEvent>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for fs_event in translate_event(&event) {
                        if events.send(fs_event).is_err() {
                            trace!("dispatch gone; dropping notification");
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            },
            Config::default(),
        )
        .context("create file watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;
        info!(root = %root.display(), "watching");
        Ok(Self {
            watcher,
            root: root.to_path_buf(),
        })
    }

    /// Unregisters the watch. Dropping the watcher afterwards closes the
    /// event channel.
    pub fn stop(mut self) -> Result<()> {
        self.watcher
            .unwatch(&self.root)
            .with_context(|| format!("unwatch {}", self.root.display()))?;
        debug!(root = %self.root.display(), "watch removed");
        Ok(())
    }
}

/// Maps one notify event onto zero or more engine events.
///
/// Renames are split: the old name behaves like a deletion and the new name
/// like a creation. Access and other events are dropped.
pub fn translate_event(event: &Event) -> Vec<FsEvent> {
    let folder = matches!(
        event.kind,
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder)
    );
    let make = |kind: FsEventKind, path: &PathBuf| FsEvent {
        kind,
        path: path.clone(),
        is_dir: folder || path.is_dir(),
    };
    let all = |kind: FsEventKind| -> Vec<FsEvent> {
        event.paths.iter().map(|p| make(kind, p)).collect()
    };

    match &event.kind {
        EventKind::Create(_) => all(FsEventKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(FsEventKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(FsEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => vec![
            make(FsEventKind::Deleted, &event.paths[0]),
            make(FsEventKind::Created, &event.paths[1]),
        ],
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    FsEventKind::Created
                } else {
                    FsEventKind::Deleted
                };
                make(kind, p)
            })
            .collect(),
        EventKind::Modify(_) => all(FsEventKind::Modified),
        EventKind::Remove(_) => all(FsEventKind::Deleted),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange, MetadataKind};
    use std::fs;
    use tempfile::tempdir;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |ev, p| ev.add_path(p.to_path_buf()))
    }

    fn kinds(events: &[FsEvent]) -> Vec<FsEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn basic_kinds_translate() {
        let p = Path::new("/nowhere/a.txt");
        let created = translate_event(&event(EventKind::Create(CreateKind::File), &[p]));
        assert_eq!(created, vec![FsEvent::created(p)]);

        let modified = translate_event(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &[p],
        ));
        assert_eq!(kinds(&modified), vec![FsEventKind::Modified]);

        let meta = translate_event(&event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &[p],
        ));
        assert_eq!(kinds(&meta), vec![FsEventKind::Modified]);

        let removed = translate_event(&event(EventKind::Remove(RemoveKind::Any), &[p]));
        assert_eq!(kinds(&removed), vec![FsEventKind::Deleted]);

        let access = translate_event(&event(EventKind::Access(AccessKind::Read), &[p]));
        assert!(access.is_empty());
    }

    #[test]
    fn renames_split_into_delete_and_create() {
        let from = Path::new("/nowhere/old.txt");
        let to = Path::new("/nowhere/new.txt");
        let both = translate_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[from, to],
        ));
        assert_eq!(both, vec![FsEvent::deleted(from), FsEvent::created(to)]);

        let half = translate_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &[to],
        ));
        assert_eq!(half, vec![FsEvent::created(to)]);
    }

    #[test]
    fn ambiguous_rename_checks_existence() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("here.txt");
        fs::write(&present, b"x").unwrap();
        let absent = dir.path().join("gone.txt");
        let out = translate_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
            &[&present, &absent],
        ));
        assert_eq!(kinds(&out), vec![FsEventKind::Created, FsEventKind::Deleted]);
    }

    #[test]
    fn folders_are_flagged() {
        let dir = tempdir().unwrap();
        let out = translate_event(&event(EventKind::Create(CreateKind::Any), &[dir.path()]));
        assert!(out[0].is_dir);
        let gone = translate_event(&event(
            EventKind::Remove(RemoveKind::Folder),
            &[Path::new("/nowhere/sub")],
        ));
        assert!(gone[0].is_dir);
    }
}
