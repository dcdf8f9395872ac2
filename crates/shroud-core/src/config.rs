use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;
use crate::policy::{Direction, Mode, Trigger, WatchPolicy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreKind {
    File,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    pub path: PathBuf,
    pub direction: Direction,
    pub trigger: Trigger,
    pub mode: Mode,
    pub groups: Vec<String>,
    pub key: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            direction: Direction::Encrypt,
            trigger: Trigger::Create,
            mode: Mode::Individual,
            groups: vec![],
            key: "master_key".into(),
        }
    }
}

impl WatchConfig {
    /// Per-watch policy; size cap and extension filter come from the global config.
    pub fn to_policy(&self, config: &ShroudConfig) -> WatchPolicy {
        WatchPolicy::new(&self.path)
            .with_trigger(self.trigger)
            .with_mode(self.mode)
            .with_groups(&self.groups)
            .with_max_file_size(config.max_file_size_bytes())
            .with_allowed_extensions(&config.allowed_extensions)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShroudConfig {
    pub log_level: String,
    pub audit_log_file: String,
    pub audit_max_bytes: u64,
    pub key_store: KeyStoreKind,
    pub key_dir: Option<PathBuf>,
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,
    pub watches: Vec<WatchConfig>,
}

impl Default for ShroudConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            audit_log_file: "audit.log".into(),
            audit_max_bytes: 5 * 1024 * 1024,
            key_store: KeyStoreKind::File,
            key_dir: None,
            max_file_size_mb: 100,
            allowed_extensions: vec![],
            watches: vec![],
        }
    }
}

impl ShroudConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_file_size_mb == 0 {
            bail!("max_file_size_mb must be at least 1");
        }
        for watch in &self.watches {
            if watch.path.as_os_str().is_empty() {
                bail!("watch entry without a path");
            }
            if watch.key.trim().is_empty() {
                bail!("watch {} has a blank key id", watch.path.display());
            }
        }
        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn key_dir(&self) -> Result<PathBuf> {
        match &self.key_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::key_dir(),
        }
    }

    pub fn audit_log_path(&self) -> Result<PathBuf> {
        Ok(paths::log_dir()?.join(&self.audit_log_file))
    }
}
