//! Key storage backends.
//!
//! Keys are kept in their 44-character url-safe base64 text form, either as
//! `{id}.key` files or as OS credential-store entries.

use anyhow::{anyhow, bail, Context, Result};
use keyring::Entry;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::token::TransformKey;

const SERVICE_NAME: &str = "Shroud";
const KEY_ENTRY: &str = "transform_key";

pub trait KeyStore: Send + Sync {
    fn load_key(&self, id: &str) -> Result<TransformKey>;

    /// Creates and persists a fresh key. Never replaces an existing one.
    fn generate_key(&self, id: &str) -> Result<TransformKey>;

    fn contains(&self, id: &str) -> Result<bool>;
}

/// Load `id`, or generate it when missing and `create` is set.
/// Returns the key and whether it was freshly generated.
pub fn open_key(store: &dyn KeyStore, id: &str, create: bool) -> Result<(TransformKey, bool)> {
    if store.contains(id)? {
        return Ok((store.load_key(id)?, false));
    }
    if !create {
        bail!("key '{id}' not found");
    }
    Ok((store.generate_key(id)?, true))
}

pub fn validate_key_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !ok {
        bail!("invalid key id '{id}': use letters, digits, '_', '-' or '.'");
    }
    Ok(())
}

pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.key"))
    }
}

impl KeyStore for FileKeyStore {
    fn load_key(&self, id: &str) -> Result<TransformKey> {
        validate_key_id(id)?;
        let path = self.key_path(id);
        let text = zeroize::Zeroizing::new(
            fs::read_to_string(&path).with_context(|| format!("read key {}", path.display()))?,
        );
        TransformKey::from_base64(&text).with_context(|| format!("parse key {}", path.display()))
    }

    fn generate_key(&self, id: &str) -> Result<TransformKey> {
        validate_key_id(id)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create key dir {}", self.dir.display()))?;
        let path = self.key_path(id);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = match options.open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!("key '{id}' already exists at {}", path.display())
            }
            Err(e) => return Err(e).with_context(|| format!("create key {}", path.display())),
        };

        let key = TransformKey::generate();
        file.write_all(key.to_base64().as_bytes())?;
        file.sync_all()?;
        info!(key = id, path = %path.display(), "key generated");
        Ok(key)
    }

    fn contains(&self, id: &str) -> Result<bool> {
        validate_key_id(id)?;
        Ok(self.key_path(id).is_file())
    }
}

/// OS credential store (Keychain, Credential Manager, Secret Service).
#[derive(Default)]
pub struct KeyringKeyStore;

impl KeyringKeyStore {
    fn entry(id: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &format!("{}:{}", KEY_ENTRY, id))
            .map_err(|e| anyhow!("keyring init: {e}"))
    }
}

impl KeyStore for KeyringKeyStore {
    fn load_key(&self, id: &str) -> Result<TransformKey> {
        validate_key_id(id)?;
        let encoded = zeroize::Zeroizing::new(
            Self::entry(id)?
                .get_password()
                .map_err(|e| anyhow!("load key '{id}': {e}"))?,
        );
        TransformKey::from_base64(&encoded).with_context(|| format!("parse key '{id}'"))
    }

    fn generate_key(&self, id: &str) -> Result<TransformKey> {
        if self.contains(id)? {
            bail!("key '{id}' already exists in the credential store");
        }
        let key = TransformKey::generate();
        Self::entry(id)?
            .set_password(&key.to_base64())
            .map_err(|e| anyhow!("store key '{id}': {e}"))?;
        info!(key = id, "key generated in credential store");
        Ok(key)
    }

    fn contains(&self, id: &str) -> Result<bool> {
        validate_key_id(id)?;
        match Self::entry(id)?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(anyhow!("query key '{id}': {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token;
    use tempfile::tempdir;

    #[test]
    fn generate_then_load() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys"));
        assert!(!store.contains("master_key").unwrap());
        let key = store.generate_key("master_key").unwrap();
        assert!(store.contains("master_key").unwrap());

        let loaded = store.load_key("master_key").unwrap();
        let tok = token::encrypt(&key, b"data");
        assert_eq!(token::decrypt(&loaded, &tok).unwrap(), b"data");

        let text = fs::read_to_string(store.key_path("master_key")).unwrap();
        assert_eq!(text.len(), 44);
    }

    #[test]
    fn generate_never_overwrites() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        store.generate_key("k1").unwrap();
        let before = fs::read(store.key_path("k1")).unwrap();
        let err = store.generate_key("k1").unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fs::read(store.key_path("k1")).unwrap(), before);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        store.generate_key("k").unwrap();
        let mode = fs::metadata(store.key_path("k")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn open_key_creates_only_when_asked() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        assert!(open_key(&store, "m", false).is_err());
        let (_, created) = open_key(&store, "m", true).unwrap();
        assert!(created);
        let (_, created) = open_key(&store, "m", true).unwrap();
        assert!(!created);
    }

    #[test]
    fn rejects_path_like_ids() {
        for bad in ["", "../evil", ".hidden", "a/b", "a b"] {
            assert!(validate_key_id(bad).is_err(), "{bad:?}");
        }
        validate_key_id("key_20240101-1.v2").unwrap();
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        fs::write(store.key_path("bad"), "not-a-key").unwrap();
        assert!(store.load_key("bad").is_err());
    }
}
