use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use super::credential::Credential;

/// Storage for the single process-wide credential pair.
///
/// Implementations must make `set` atomic from the caller's point of view:
/// a concurrent `get` sees either the old pair or the new one, never a mix.
pub trait TokenStore: Send + Sync {
    fn get(&self) -> Option<Credential>;
    fn set(&self, credential: Credential) -> io::Result<()>;
    fn clear(&self) -> io::Result<()>;
}

/// In-memory store, used in tests and for short-lived processes.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    current: RwLock<Option<Credential>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            current: RwLock::new(Some(credential)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, credential: Credential) -> io::Result<()> {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(credential);
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

/// Durable store backed by a JSON file.
///
/// The file is read once in [`FileTokenStore::open`]; afterwards reads are
/// served from memory and every write replaces the file through a rename.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    current: RwLock<Option<Credential>>,
}

impl FileTokenStore {
    /// Opens the store, loading any credential persisted by a previous run.
    ///
    /// A corrupt file is treated as "logged out" rather than an error.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Credential>(&contents) {
                Ok(cred) => Some(cred),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable credential file");
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        debug!(path = %path.display(), logged_in = current.is_some(), "token store opened");
        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, credential: &Credential) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(credential)?;
        let mut file = owner_only(fs::OpenOptions::new().write(true).create(true).truncate(true))
            .open(&tmp)?;
        restrict(&file)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)
    }
}

/// The credential file holds a refresh token: readable by its owner only.
#[cfg(unix)]
fn owner_only(opts: &mut fs::OpenOptions) -> &mut fs::OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    opts.mode(0o600)
}

#[cfg(not(unix))]
fn owner_only(opts: &mut fs::OpenOptions) -> &mut fs::OpenOptions {
    opts
}

/// `mode` only applies on creation; a leftover temp file keeps its own.
#[cfg(unix)]
fn restrict(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, credential: Credential) -> io::Result<()> {
        // Hold the write lock across the file replace so readers never see
        // memory and disk disagree.
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.write_file(&credential)?;
        *guard = Some(credential);
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cred(access: &str) -> Credential {
        Credential::new(access.into(), format!("{access}-refresh"), Utc::now())
    }

    #[test]
    fn memory_store_set_get_clear() {
        let store = MemoryTokenStore::new();
        assert!(store.get().is_none());

        store.set(cred("a1")).unwrap();
        assert_eq!(store.get().unwrap().access_token, "a1");

        store.set(cred("a2")).unwrap();
        let current = store.get().unwrap();
        assert_eq!(current.access_token, "a2");
        assert_eq!(current.refresh_token, "a2-refresh");

        store.clear().unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let store = FileTokenStore::open(&path).unwrap();
        assert!(store.get().is_none());
        store.set(cred("persisted")).unwrap();
        drop(store);

        let reopened = FileTokenStore::open(&path).unwrap();
        assert_eq!(reopened.get().unwrap().access_token, "persisted");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn file_store_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileTokenStore::open(&path).unwrap();
        store.set(cred("x")).unwrap();
        assert!(path.exists());

        store.clear().unwrap();
        assert!(!path.exists());
        assert!(store.get().is_none());
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_file_means_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{not json").unwrap();

        let store = FileTokenStore::open(&path).unwrap();
        assert!(store.get().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn credential_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        // A stale temp file with loose permissions must not leak them.
        fs::write(path.with_extension("json.tmp"), "{}").unwrap();
        fs::set_permissions(
            path.with_extension("json.tmp"),
            fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let store = FileTokenStore::open(&path).unwrap();
        store.set(cred("secret")).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
