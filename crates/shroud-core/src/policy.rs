//! Watch policy value types shared by the engine, the config layer and the CLI.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Suffix appended (never substituted) to the file name of every ciphertext file.
pub const CIPHERTEXT_SUFFIX: &str = ".encrypted";

/// Default per-file size cap (100 MiB).
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    /// Whether `path` is a candidate *source* for this direction.
    pub fn accepts_source(self, path: &Path) -> bool {
        match self {
            Direction::Encrypt => !has_ciphertext_suffix(path),
            Direction::Decrypt => has_ciphertext_suffix(path),
        }
    }

    /// Audit event kind for a failed transform in this direction.
    pub fn error_event(self) -> &'static str {
        match self {
            Direction::Encrypt => "encryption_error",
            Direction::Decrypt => "decryption_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Individual,
    Group,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! case_insensitive_enum {
    ($ty:ident, $kind:literal, { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(ParseEnumError { kind: $kind, value: s.to_string() }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($ty::$variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

case_insensitive_enum!(Direction, "direction", { "encrypt" => Encrypt, "decrypt" => Decrypt });
case_insensitive_enum!(Trigger, "trigger", { "create" => Create, "modify" => Modify, "delete" => Delete });
case_insensitive_enum!(Mode, "mode", { "individual" => Individual, "group" => Group, "all" => All });

/// Immutable description of one monitored subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchPolicy {
    pub root: PathBuf,
    pub trigger: Trigger,
    pub mode: Mode,
    pub group_substrings: Vec<String>,
    pub max_file_size_bytes: u64,
    pub allowed_extensions: BTreeSet<String>,
}

impl WatchPolicy {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            trigger: Trigger::Create,
            mode: Mode::Individual,
            group_substrings: Vec::new(),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            allowed_extensions: BTreeSet::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Group entries keep their order; surrounding whitespace is dropped and
    /// blank entries are discarded.
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.group_substrings = groups
            .into_iter()
            .map(|g| g.as_ref().trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size_bytes = bytes;
        self
    }

    pub fn with_allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_extensions = extensions
            .into_iter()
            .filter_map(|e| normalize_extension(e.as_ref()))
            .collect();
        self
    }

    /// Case-sensitive substring match of the full path string against every
    /// group entry.
    pub fn matches_group(&self, path: &Path) -> bool {
        let haystack = path.to_string_lossy();
        self.group_substrings
            .iter()
            .any(|needle| haystack.contains(needle.as_str()))
    }

    /// True when the extension filter is empty or `path`'s extension is listed.
    pub fn allows_extension(&self, path: &Path) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| normalize_extension(&e.to_string_lossy()))
            .map(|e| self.allowed_extensions.contains(&e))
            .unwrap_or(false)
    }
}

/// Lowercased extension without its leading dot; `None` for blank input.
pub fn normalize_extension(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Compares raw encoded bytes, so names that are not valid UTF-8 are matched
/// exactly.
pub fn has_ciphertext_suffix(path: &Path) -> bool {
    path.as_os_str()
        .as_encoded_bytes()
        .ends_with(CIPHERTEXT_SUFFIX.as_bytes())
}

/// `path` with the ciphertext suffix appended to its file name.
pub fn ciphertext_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(CIPHERTEXT_SUFFIX);
    PathBuf::from(raw)
}

/// `path` with the ciphertext suffix removed, or `None` if it does not carry one
/// or nothing would be left of the file name. The remaining bytes are kept
/// as they are, including non-UTF-8 names.
pub fn plaintext_path(path: &Path) -> Option<PathBuf> {
    let raw = path.as_os_str().as_encoded_bytes();
    let stripped = raw.strip_suffix(CIPHERTEXT_SUFFIX.as_bytes())?;
    if stripped.is_empty() || stripped.ends_with(b"/") || stripped.ends_with(b"\\") {
        return None;
    }
    // SAFETY: `stripped` comes from an `OsStr` and is cut directly before an
    // ASCII suffix, which is a valid split point for the encoded form.
    let name = unsafe { OsStr::from_encoded_bytes_unchecked(stripped) };
    Some(PathBuf::from(name))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FsEventKind {
    Created,
    Modified,
    Deleted,
}

impl FsEventKind {
    pub fn trigger(self) -> Trigger {
        match self {
            FsEventKind::Created => Trigger::Create,
            FsEventKind::Modified => Trigger::Modify,
            FsEventKind::Deleted => Trigger::Delete,
        }
    }
}

/// One notification from the filesystem watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
    pub is_dir: bool,
}

impl FsEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Created,
            path: path.into(),
            is_dir: false,
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Modified,
            path: path.into(),
            is_dir: false,
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Deleted,
            path: path.into(),
            is_dir: false,
        }
    }

    pub fn directory(mut self) -> Self {
        self.is_dir = true;
        self
    }
}
