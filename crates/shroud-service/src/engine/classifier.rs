//! Maps a raw filesystem notification onto process/ignore for one handler.

use shroud_core::policy::{has_ciphertext_suffix, Direction, FsEvent, FsEventKind, WatchPolicy};
use std::path::{Path, PathBuf};

use super::transform::is_staging_artifact;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Process(PathBuf),
    Ignore,
}

pub fn classify(event: &FsEvent, policy: &WatchPolicy, direction: Direction) -> Action {
    if event.is_dir || event.kind.trigger() != policy.trigger {
        return Action::Ignore;
    }
    if !event.path.starts_with(&policy.root) || is_staging_artifact(&event.path) {
        return Action::Ignore;
    }
    if suffix_rule(event.kind, direction, &event.path) {
        Action::Process(event.path.clone())
    } else {
        Action::Ignore
    }
}

/// Create/Modify act on the direction's source files; Delete reacts to the
/// removal of the *other* kind of file (encrypt handlers to a vanished
/// ciphertext, decrypt handlers to a vanished plaintext).
fn suffix_rule(kind: FsEventKind, direction: Direction, path: &Path) -> bool {
    let suffixed = has_ciphertext_suffix(path);
    match (kind, direction) {
        (FsEventKind::Created | FsEventKind::Modified, Direction::Encrypt) => !suffixed,
        (FsEventKind::Created | FsEventKind::Modified, Direction::Decrypt) => suffixed,
        (FsEventKind::Deleted, Direction::Encrypt) => suffixed,
        (FsEventKind::Deleted, Direction::Decrypt) => !suffixed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_core::policy::Trigger;

    fn policy(trigger: Trigger) -> WatchPolicy {
        WatchPolicy::new("/data").with_trigger(trigger)
    }

    fn processes(event: FsEvent, trigger: Trigger, direction: Direction) -> bool {
        matches!(
            classify(&event, &policy(trigger), direction),
            Action::Process(_)
        )
    }

    #[test]
    fn encrypt_direction_matrix() {
        use Direction::Encrypt;
        assert!(processes(FsEvent::created("/data/a.txt"), Trigger::Create, Encrypt));
        assert!(!processes(FsEvent::created("/data/a.txt.encrypted"), Trigger::Create, Encrypt));
        assert!(processes(FsEvent::modified("/data/a.txt"), Trigger::Modify, Encrypt));
        assert!(!processes(FsEvent::modified("/data/a.txt.encrypted"), Trigger::Modify, Encrypt));
        assert!(processes(FsEvent::deleted("/data/a.txt.encrypted"), Trigger::Delete, Encrypt));
        assert!(!processes(FsEvent::deleted("/data/a.txt"), Trigger::Delete, Encrypt));
    }

    #[test]
    fn decrypt_direction_matrix() {
        use Direction::Decrypt;
        assert!(processes(FsEvent::created("/data/a.txt.encrypted"), Trigger::Create, Decrypt));
        assert!(!processes(FsEvent::created("/data/a.txt"), Trigger::Create, Decrypt));
        assert!(processes(FsEvent::modified("/data/a.txt.encrypted"), Trigger::Modify, Decrypt));
        assert!(!processes(FsEvent::modified("/data/a.txt"), Trigger::Modify, Decrypt));
        assert!(processes(FsEvent::deleted("/data/a.txt"), Trigger::Delete, Decrypt));
        assert!(!processes(FsEvent::deleted("/data/a.txt.encrypted"), Trigger::Delete, Decrypt));
    }

    #[test]
    fn only_configured_trigger_is_actionable() {
        for trigger in [Trigger::Modify, Trigger::Delete] {
            assert!(!processes(FsEvent::created("/data/a.txt"), trigger, Direction::Encrypt));
        }
        assert!(!processes(FsEvent::modified("/data/a.txt"), Trigger::Create, Direction::Encrypt));
    }

    #[test]
    fn directories_foreign_paths_and_staging_files_are_ignored() {
        let p = policy(Trigger::Create);
        let dir_event = FsEvent::created("/data/sub").directory();
        assert_eq!(classify(&dir_event, &p, Direction::Encrypt), Action::Ignore);
        assert_eq!(
            classify(&FsEvent::created("/elsewhere/a.txt"), &p, Direction::Encrypt),
            Action::Ignore
        );
        assert_eq!(
            classify(
                &FsEvent::created("/data/.shroud-staging-1a2b.partial"),
                &p,
                Direction::Encrypt
            ),
            Action::Ignore
        );
        assert_eq!(
            classify(&FsEvent::created("/data/sub/a.txt"), &p, Direction::Encrypt),
            Action::Process(PathBuf::from("/data/sub/a.txt"))
        );
    }
}
