//! Directory-wide locking for bulk cache mutation.
//!
//! Exactly one bulk operation may mutate the cache tree at a time. The lock
//! token derives from the cache root's inode, so it is stable across process
//! restarts and shared by every engine instance pointed at the same tree.
//!
//! Two backends: an in-process semaphore table keyed by the token (the
//! default), and an advisory exclusive file lock for deployments where
//! several processes share one cache directory. Acquisition blocks without a
//! timeout; bulk operations are assumed infrequent relative to page views.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::settings::LockSettings;
use crate::sync::mutex_lock;

const SOURCE: &str = "lock";
const LOCK_FILE_PREFIX: &str = "scorta-";

/// Process-wide semaphore table, keyed by lock token.
static SEMAPHORES: Lazy<Mutex<HashMap<u64, Arc<Semaphore>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Which locking mechanism guards bulk mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackendKind {
    /// In-process semaphore keyed by the cache root's inode.
    Semaphore,
    /// Advisory exclusive file lock in a writable lock directory.
    FileLock,
}

/// Binary semaphore with blocking acquisition.
struct Semaphore {
    held: Mutex<bool>,
    released: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut held = mutex_lock(&self.held, SOURCE, "semaphore.acquire");
        while *held {
            held = match self.released.wait(held) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *held = true;
    }

    fn release(&self) {
        let mut held = mutex_lock(&self.held, SOURCE, "semaphore.release");
        *held = false;
        drop(held);
        self.released.notify_one();
    }
}

fn semaphore_for(token: u64) -> Arc<Semaphore> {
    let mut table = mutex_lock(&SEMAPHORES, SOURCE, "semaphore_for");
    Arc::clone(
        table
            .entry(token)
            .or_insert_with(|| Arc::new(Semaphore::new())),
    )
}

/// The directory lock guarding bulk mutation of one cache tree.
pub struct CacheLock {
    token: u64,
    backend: LockBackendKind,
    enabled: bool,
    lock_dir: PathBuf,
}

impl CacheLock {
    /// Set up the lock for a cache root, creating the root if necessary so
    /// its inode is available as the token.
    pub fn new(settings: &LockSettings, cache_root: &Path) -> Result<Self, CacheError> {
        let token = stable_token(cache_root)?;
        if !settings.enabled {
            warn!(
                cache_root = %cache_root.display(),
                "cache locking disabled; bulk operations are unsafe against concurrent writers"
            );
        }

        Ok(Self {
            token,
            backend: settings.backend,
            enabled: settings.enabled,
            lock_dir: settings
                .lock_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        })
    }

    /// Block until the lock is held. No timeout.
    pub fn acquire(&self) -> Result<LockGuard, CacheError> {
        if !self.enabled {
            return Ok(LockGuard { inner: None });
        }

        match self.backend {
            LockBackendKind::Semaphore => {
                let semaphore = semaphore_for(self.token);
                semaphore.acquire();
                debug!(token = self.token, backend = "semaphore", "directory lock acquired");
                Ok(LockGuard {
                    inner: Some(Backend::Semaphore(semaphore)),
                })
            }
            LockBackendKind::FileLock => {
                let path = self
                    .lock_dir
                    .join(format!("{LOCK_FILE_PREFIX}{:016x}.lock", self.token));
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&path)
                    .map_err(|err| {
                        CacheError::lock(format!(
                            "cannot open lock file {}: {err}",
                            path.display()
                        ))
                    })?;
                file.lock().map_err(|err| {
                    CacheError::lock(format!("cannot lock {}: {err}", path.display()))
                })?;
                debug!(token = self.token, backend = "file_lock", "directory lock acquired");
                Ok(LockGuard {
                    inner: Some(Backend::File(file)),
                })
            }
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

enum Backend {
    Semaphore(Arc<Semaphore>),
    File(std::fs::File),
}

/// Held directory lock. Released on drop, so the lock can never stay held
/// past a failure in the protected section.
pub struct LockGuard {
    inner: Option<Backend>,
}

impl LockGuard {
    /// Release explicitly. Idempotent; dropping the guard has the same
    /// effect.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        match self.inner.take() {
            Some(Backend::Semaphore(semaphore)) => semaphore.release(),
            Some(Backend::File(file)) => {
                if let Err(err) = file.unlock() {
                    warn!(error = %err, "failed to unlock cache lock file");
                }
            }
            None => {}
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Derive the lock token from a stable on-disk identity of the cache root.
fn stable_token(cache_root: &Path) -> Result<u64, CacheError> {
    std::fs::create_dir_all(cache_root).map_err(|err| {
        CacheError::lock(format!(
            "cannot create cache root {}: {err}",
            cache_root.display()
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let metadata = std::fs::metadata(cache_root).map_err(|err| {
            CacheError::lock(format!(
                "cannot stat cache root {}: {err}",
                cache_root.display()
            ))
        })?;
        Ok(metadata.ino())
    }

    #[cfg(not(unix))]
    {
        use sha2::{Digest, Sha256};
        let canonical = std::fs::canonicalize(cache_root).map_err(|err| {
            CacheError::lock(format!(
                "cannot canonicalize cache root {}: {err}",
                cache_root.display()
            ))
        })?;
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let mut token = [0u8; 8];
        token.copy_from_slice(&digest[..8]);
        Ok(u64::from_be_bytes(token))
    }
}
