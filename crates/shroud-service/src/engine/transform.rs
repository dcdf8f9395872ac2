//! Single-file encrypt/decrypt with crash-safe on-disk replacement.
//!
//! 1. Read the whole source into memory
//! 2. Produce the output (token, or verified plaintext)
//! 3. Write a staging file in the SAME directory as the target
//! 4. fsync the staging file, copy the source's permission bits
//! 5. Link it into place without replacing anything (`persist_noclobber`)
//! 6. fsync the parent directory (Unix)
//! 7. Remove the source; if that fails, withdraw the new file again
//!
//! A crash before step 5 leaves only the source plus an orphaned staging file
//! (removed by [`cleanup_staging`]); a crash between 5 and 7 leaves both
//! complete files.

use shroud_core::policy::{ciphertext_path, plaintext_path, Direction};
use shroud_core::token::{self, TokenError, TransformKey};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Prefix of in-flight output files; the classifier and scans skip these.
pub const STAGING_PREFIX: &str = ".shroud-staging-";
const STAGING_SUFFIX: &str = ".partial";

/// Staging files younger than this are presumed to belong to a running
/// transform.
pub const ORPHAN_MIN_AGE: Duration = Duration::from_secs(120);

/// Free space required on top of the output size before writing.
const MIN_FREE_SPACE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot authenticate {}: {source}", .path.display())]
    Authentication {
        path: PathBuf,
        #[source]
        source: TokenError,
    },
    #[error("target {} already exists", .path.display())]
    Conflict { path: PathBuf },
    #[error("{} does not carry the ciphertext suffix", .path.display())]
    NotApplicable { path: PathBuf },
}

impl TransformError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> TransformError + '_ {
        move |source| TransformError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A transform that fully committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Plaintext size in bytes.
    pub size_bytes: u64,
}

pub struct TransformEngine {
    key: TransformKey,
}

impl TransformEngine {
    pub fn new(key: TransformKey) -> Self {
        Self { key }
    }

    pub fn apply(&self, direction: Direction, path: &Path) -> Result<Committed, TransformError> {
        match direction {
            Direction::Encrypt => self.encrypt(path),
            Direction::Decrypt => self.decrypt(path),
        }
    }

    pub fn encrypt(&self, path: &Path) -> Result<Committed, TransformError> {
        let target = ciphertext_path(path);
        ensure_absent(&target)?;
        let data = fs::read(path).map_err(TransformError::io(path))?;
        let token = token::encrypt(&self.key, &data);
        write_new(&target, &token, path)?;
        remove_source(path, &target)?;
        info!(path = %path.display(), target = %target.display(), "encrypted");
        Ok(Committed {
            source: path.to_path_buf(),
            target,
            size_bytes: data.len() as u64,
        })
    }

    pub fn decrypt(&self, path: &Path) -> Result<Committed, TransformError> {
        let target = plaintext_path(path).ok_or_else(|| TransformError::NotApplicable {
            path: path.to_path_buf(),
        })?;
        ensure_absent(&target)?;
        let token = fs::read(path).map_err(TransformError::io(path))?;
        let plaintext = token::decrypt(&self.key, &token).map_err(|source| {
            if let Ok(header) = token::inspect(&token) {
                debug!(
                    path = %path.display(),
                    version = header.version,
                    created = header.timestamp,
                    "rejected token header"
                );
            }
            TransformError::Authentication {
                path: path.to_path_buf(),
                source,
            }
        })?;
        write_new(&target, &plaintext, path)?;
        remove_source(path, &target)?;
        info!(path = %path.display(), target = %target.display(), "decrypted");
        Ok(Committed {
            source: path.to_path_buf(),
            target,
            size_bytes: plaintext.len() as u64,
        })
    }
}

pub fn is_staging_artifact(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with(STAGING_PREFIX))
        .unwrap_or(false)
}

/// Removes staging files orphaned by an interrupted transform. Returns the
/// paths that were removed.
///
/// Files modified within [`ORPHAN_MIN_AGE`] are left alone: they may belong
/// to a live transform of another session watching an overlapping tree.
pub fn cleanup_staging(root: &Path) -> Vec<PathBuf> {
    let now = SystemTime::now();
    let mut removed = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_file() || !is_staging_artifact(entry.path()) {
            continue;
        }
        let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
        if let Some(age) = modified.map(|m| now.duration_since(m).unwrap_or(Duration::ZERO)) {
            if age < ORPHAN_MIN_AGE {
                debug!(path = %entry.path().display(), ?age, "staging file too recent; kept");
                continue;
            }
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                warn!(path = %entry.path().display(), "removed orphaned staging file");
                removed.push(entry.path().to_path_buf());
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot remove staging file")
            }
        }
    }
    removed
}

fn ensure_absent(target: &Path) -> Result<(), TransformError> {
    match fs::symlink_metadata(target) {
        Ok(_) => Err(TransformError::Conflict {
            path: target.to_path_buf(),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransformError::io(target)(e)),
    }
}

fn write_new(target: &Path, contents: &[u8], like: &Path) -> Result<(), TransformError> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    check_disk_space(parent, contents.len() as u64)?;

    let mut staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(STAGING_SUFFIX)
        .tempfile_in(parent)
        .map_err(TransformError::io(parent))?;
    staging
        .write_all(contents)
        .and_then(|_| staging.as_file().sync_all())
        .map_err(TransformError::io(staging.path()))?;
    copy_permissions(like, staging.path());

    // dropping the PersistError drops the staging file with it
    staging.persist_noclobber(target).map_err(|e| {
        if e.error.kind() == ErrorKind::AlreadyExists {
            TransformError::Conflict {
                path: target.to_path_buf(),
            }
        } else {
            TransformError::io(target)(e.error)
        }
    })?;

    #[cfg(unix)]
    {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn remove_source(source: &Path, target: &Path) -> Result<(), TransformError> {
    if let Err(e) = fs::remove_file(source) {
        if e.kind() == ErrorKind::NotFound {
            // removed underneath us; the output is now the only copy
            warn!(path = %source.display(), "source vanished before removal; keeping output");
            return Ok(());
        }
        // put things back the way they were: source only
        if let Err(undo) = fs::remove_file(target) {
            warn!(
                target = %target.display(),
                error = %undo,
                "could not withdraw output after failed source removal; both files remain"
            );
        }
        return Err(TransformError::io(source)(e));
    }
    Ok(())
}

fn copy_permissions(from: &Path, to: &Path) {
    #[cfg(unix)]
    {
        match fs::metadata(from) {
            Ok(meta) => {
                if let Err(e) = fs::set_permissions(to, meta.permissions()) {
                    debug!(path = %to.display(), error = %e, "cannot copy permissions");
                }
            }
            Err(e) => debug!(path = %from.display(), error = %e, "cannot read permissions"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (from, to);
    }
}

fn check_disk_space(dir: &Path, needed: u64) -> Result<(), TransformError> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;
        let c_path = match std::ffi::CString::new(dir.as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret == 0 {
            let stat = unsafe { stat.assume_init() };
            let available = stat.f_bavail as u64 * stat.f_frsize as u64;
            let required = needed + MIN_FREE_SPACE_BYTES;
            if available < required {
                return Err(TransformError::Io {
                    path: dir.to_path_buf(),
                    source: io::Error::new(
                        ErrorKind::Other,
                        format!(
                            "insufficient disk space: need {required} bytes, {available} available"
                        ),
                    ),
                });
            }
        } else {
            warn!(dir = %dir.display(), "statvfs failed; skipping space check");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (dir, needed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> TransformEngine {
        TransformEngine::new(TransformKey::generate())
    }

    #[test]
    fn encrypt_then_decrypt_restores_bytes() {
        let dir = tempdir().unwrap();
        let engine = engine();
        let plain = dir.path().join("notes.txt");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        fs::write(&plain, &data).unwrap();

        let done = engine.encrypt(&plain).unwrap();
        assert_eq!(done.target, dir.path().join("notes.txt.encrypted"));
        assert_eq!(done.size_bytes, data.len() as u64);
        assert!(!plain.exists());
        assert!(done.target.exists());

        let back = engine.decrypt(&done.target).unwrap();
        assert_eq!(back.target, plain);
        assert!(!done.target.exists());
        assert_eq!(fs::read(&plain).unwrap(), data);
    }

    #[test]
    fn existing_target_is_a_conflict() {
        let dir = tempdir().unwrap();
        let engine = engine();
        let plain = dir.path().join("a.txt");
        fs::write(&plain, b"new").unwrap();
        fs::write(dir.path().join("a.txt.encrypted"), b"old token").unwrap();

        let err = engine.encrypt(&plain).unwrap_err();
        assert!(matches!(err, TransformError::Conflict { .. }));
        assert_eq!(fs::read(&plain).unwrap(), b"new");
        assert_eq!(
            fs::read(dir.path().join("a.txt.encrypted")).unwrap(),
            b"old token"
        );
    }

    #[test]
    fn tampered_token_leaves_ciphertext_untouched() {
        let dir = tempdir().unwrap();
        let engine = engine();
        let plain = dir.path().join("a.txt");
        fs::write(&plain, b"secret").unwrap();
        let done = engine.encrypt(&plain).unwrap();

        let mut token = fs::read(&done.target).unwrap();
        let mid = token.len() / 2;
        token[mid] = if token[mid] == b'A' { b'B' } else { b'A' };
        fs::write(&done.target, &token).unwrap();

        let err = engine.decrypt(&done.target).unwrap_err();
        assert!(matches!(err, TransformError::Authentication { .. }));
        assert_eq!(fs::read(&done.target).unwrap(), token);
        assert!(!plain.exists());
        assert!(fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .all(|e| !is_staging_artifact(&e.path())));
    }

    #[test]
    fn missing_source_is_io_error() {
        let dir = tempdir().unwrap();
        let err = engine().encrypt(&dir.path().join("gone.txt")).unwrap_err();
        assert!(matches!(err, TransformError::Io { .. }));
        assert!(!dir.path().join("gone.txt.encrypted").exists());
    }

    #[test]
    fn decrypt_requires_suffix() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("plain.txt");
        fs::write(&p, b"x").unwrap();
        assert!(matches!(
            engine().decrypt(&p).unwrap_err(),
            TransformError::NotApplicable { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn output_keeps_source_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let plain = dir.path().join("a.txt");
        fs::write(&plain, b"x").unwrap();
        fs::set_permissions(&plain, fs::Permissions::from_mode(0o640)).unwrap();
        let done = engine().encrypt(&plain).unwrap();
        let mode = fs::metadata(&done.target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    fn backdate(path: &Path) {
        let then = SystemTime::now() - ORPHAN_MIN_AGE * 2;
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(then)
            .unwrap();
    }

    #[test]
    fn orphaned_staging_files_are_cleaned() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("sub");
        fs::create_dir_all(&nested).unwrap();
        let orphan = nested.join(".shroud-staging-abc123.partial");
        fs::write(&orphan, b"half").unwrap();
        backdate(&orphan);
        fs::write(nested.join("keep.txt"), b"k").unwrap();

        let removed = cleanup_staging(dir.path());
        assert_eq!(removed, vec![orphan.clone()]);
        assert!(!orphan.exists());
        assert!(nested.join("keep.txt").exists());
    }

    #[test]
    fn fresh_staging_files_are_left_for_their_writer() {
        let dir = tempdir().unwrap();
        let live = dir.path().join(".shroud-staging-live01.partial");
        let stale = dir.path().join(".shroud-staging-old01.partial");
        fs::write(&live, b"being written").unwrap();
        fs::write(&stale, b"torn").unwrap();
        backdate(&stale);

        assert_eq!(cleanup_staging(dir.path()), vec![stale.clone()]);
        assert!(live.exists());
        assert!(!stale.exists());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_name_round_trips() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let dir = tempdir().unwrap();
        let engine = engine();
        let plain = dir.path().join(OsStr::from_bytes(b"caf\xe9.txt"));
        fs::write(&plain, b"au lait").unwrap();

        let done = engine.encrypt(&plain).unwrap();
        let back = engine.decrypt(&done.target).unwrap();
        assert_eq!(back.target, plain);
        assert_eq!(fs::read(&plain).unwrap(), b"au lait");
        assert!(!done.target.exists());
    }
}
