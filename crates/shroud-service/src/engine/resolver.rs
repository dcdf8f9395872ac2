//! Decides which files one accepted notification should transform.

use serde::Serialize;
use shroud_core::policy::{plaintext_path, Direction, Mode, WatchPolicy};
use shroud_core::token;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::transform::is_staging_artifact;

/// Stat snapshot of a candidate, valid for one handling cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    SizeExceeded { size: u64, limit: u64 },
    ExtensionRejected,
    NotInGroup,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub include: Vec<FileRecord>,
    pub skipped: Vec<(PathBuf, SkipReason)>,
    pub failed: Vec<(PathBuf, io::Error)>,
    /// The classified path was already gone when it was stat'ed.
    pub vanished: bool,
}

/// Resolves a classified path under `Individual` or `Group` mode. `All` mode
/// goes through [`scan`] instead.
pub fn resolve(path: &Path, policy: &WatchPolicy, direction: Direction) -> Resolution {
    let mut resolution = Resolution::default();
    if policy.mode == Mode::Group && !policy.matches_group(path) {
        trace!(path = %path.display(), "not in any group");
        resolution
            .skipped
            .push((path.to_path_buf(), SkipReason::NotInGroup));
        return resolution;
    }
    match stat(path) {
        Ok(record) => admit_into(record, policy, direction, &mut resolution),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "path vanished before processing");
            resolution.vanished = true;
        }
        Err(e) => resolution.failed.push((path.to_path_buf(), e)),
    }
    resolution
}

/// Full recursive pass over `policy.root`, ignoring any triggering path.
/// Cost is proportional to the size of the tree.
pub fn scan(policy: &WatchPolicy, direction: Direction) -> Resolution {
    let mut resolution = Resolution::default();
    for entry in WalkDir::new(&policy.root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| policy.root.clone());
                let err = e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(ErrorKind::Other, "filesystem loop"));
                resolution.failed.push((path, err));
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file()
            || is_staging_artifact(path)
            || !direction.accepts_source(path)
        {
            continue;
        }
        match stat(path) {
            Ok(record) => admit_into(record, policy, direction, &mut resolution),
            // raced with a transform or a user delete
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => resolution.failed.push((path.to_path_buf(), e)),
        }
    }
    debug!(
        root = %policy.root.display(),
        candidates = resolution.include.len(),
        skipped = resolution.skipped.len(),
        "tree scan finished"
    );
    resolution
}

fn stat(path: &Path) -> io::Result<FileRecord> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(io::Error::new(ErrorKind::Other, "not a regular file"));
    }
    Ok(FileRecord {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
    })
}

/// Size cap for files of this direction. Ciphertext is measured against the
/// token size a maximum-size plaintext produces.
pub fn size_limit(policy: &WatchPolicy, direction: Direction) -> u64 {
    match direction {
        Direction::Encrypt => policy.max_file_size_bytes,
        Direction::Decrypt => token::encoded_len(policy.max_file_size_bytes),
    }
}

pub fn admit(
    record: &FileRecord,
    policy: &WatchPolicy,
    direction: Direction,
) -> Result<(), SkipReason> {
    let limit = size_limit(policy, direction);
    if record.size_bytes > limit {
        return Err(SkipReason::SizeExceeded {
            size: record.size_bytes,
            limit,
        });
    }
    if !policy.allows_extension(&logical_name(&record.path, direction)) {
        return Err(SkipReason::ExtensionRejected);
    }
    Ok(())
}

fn admit_into(
    record: FileRecord,
    policy: &WatchPolicy,
    direction: Direction,
    resolution: &mut Resolution,
) {
    match admit(&record, policy, direction) {
        Ok(()) => resolution.include.push(record),
        Err(reason) => {
            trace!(path = %record.path.display(), ?reason, "filtered out");
            resolution.skipped.push((record.path, reason));
        }
    }
}

/// The name whose extension the filter applies to: ciphertext files are
/// judged by the plaintext they carry.
fn logical_name(path: &Path, direction: Direction) -> PathBuf {
    match direction {
        Direction::Encrypt => path.to_path_buf(),
        Direction::Decrypt => plaintext_path(path).unwrap_or_else(|| path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, len: usize) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, vec![b'x'; len]).unwrap();
    }

    #[test]
    fn size_boundary_is_inclusive() {
        let dir = tempdir().unwrap();
        let policy = WatchPolicy::new(dir.path()).with_max_file_size(64);
        let exact = dir.path().join("exact.bin");
        let over = dir.path().join("over.bin");
        write(&exact, 64);
        write(&over, 65);

        let r = resolve(&exact, &policy, Direction::Encrypt);
        assert_eq!(r.include.len(), 1);

        let r = resolve(&over, &policy, Direction::Encrypt);
        assert!(r.include.is_empty());
        assert_eq!(
            r.skipped,
            vec![(over.clone(), SkipReason::SizeExceeded { size: 65, limit: 64 })]
        );
    }

    #[test]
    fn group_mode_uses_substring_match() {
        let dir = tempdir().unwrap();
        let policy = WatchPolicy::new(dir.path())
            .with_mode(Mode::Group)
            .with_groups(["Finance", "Human"]);
        let finance = dir.path().join("Finance/q1.csv");
        let marketing = dir.path().join("Marketing/q1.csv");
        write(&finance, 10);
        write(&marketing, 10);

        assert_eq!(resolve(&finance, &policy, Direction::Encrypt).include.len(), 1);
        let r = resolve(&marketing, &policy, Direction::Encrypt);
        assert!(r.include.is_empty());
        assert_eq!(r.skipped[0].1, SkipReason::NotInGroup);
    }

    #[test]
    fn extension_filter_uses_plaintext_name_for_ciphertext() {
        let dir = tempdir().unwrap();
        let policy = WatchPolicy::new(dir.path()).with_allowed_extensions(["pdf"]);
        let doc = dir.path().join("a.PDF");
        let sheet = dir.path().join("b.xlsx");
        let sealed = dir.path().join("c.pdf.encrypted");
        write(&doc, 1);
        write(&sheet, 1);
        write(&sealed, 1);

        assert_eq!(resolve(&doc, &policy, Direction::Encrypt).include.len(), 1);
        assert_eq!(
            resolve(&sheet, &policy, Direction::Encrypt).skipped[0].1,
            SkipReason::ExtensionRejected
        );
        assert_eq!(resolve(&sealed, &policy, Direction::Decrypt).include.len(), 1);
    }

    #[test]
    fn decrypt_limit_admits_token_of_max_plaintext() {
        let policy = WatchPolicy::new("/data").with_max_file_size(1000);
        let limit = size_limit(&policy, Direction::Decrypt);
        assert_eq!(limit, token::encoded_len(1000));
        let at_limit = FileRecord {
            path: "/data/a.encrypted".into(),
            size_bytes: limit,
        };
        assert!(admit(&at_limit, &policy, Direction::Decrypt).is_ok());
    }

    #[test]
    fn vanished_path_is_flagged() {
        let dir = tempdir().unwrap();
        let policy = WatchPolicy::new(dir.path());
        let r = resolve(&dir.path().join("gone.txt"), &policy, Direction::Encrypt);
        assert!(r.vanished);
        assert!(r.include.is_empty() && r.failed.is_empty());
    }

    #[test]
    fn scan_collects_direction_sources_only() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("a.txt"), 3);
        write(&root.join("deep/b.txt"), 3);
        write(&root.join("deep/c.txt.encrypted"), 3);
        write(&root.join("deep/.shroud-staging-x.partial"), 3);
        write(&root.join("big.bin"), 100);
        let policy = WatchPolicy::new(root).with_max_file_size(50);

        let r = scan(&policy, Direction::Encrypt);
        let mut names: Vec<_> = r
            .include
            .iter()
            .map(|f| f.path.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        names.sort();
        assert_eq!(names, vec![PathBuf::from("a.txt"), PathBuf::from("deep/b.txt")]);
        assert_eq!(r.skipped.len(), 1);

        let r = scan(&policy, Direction::Decrypt);
        assert_eq!(r.include.len(), 1);
        assert!(r.include[0].path.ends_with("deep/c.txt.encrypted"));
    }
}
