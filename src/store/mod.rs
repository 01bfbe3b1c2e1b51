//! Disk-backed cache entry storage.
//!
//! An entry lives at `cache_root/<cache_path>` as
//! `json({status, headers}) + "<!--headers-->" + body`. Writes are staged in
//! a sibling temp file and renamed into place; the rename is the atomicity
//! boundary, so a reader never observes a partially written entry. The
//! directory lock taken around a write serializes it against bulk
//! invalidation, not against other single-entry writes.
//!
//! 404 responses share one canonical blob: other not-found paths are
//! symlinks to it, or rows in an indirection index on filesystems without
//! symlink support.

pub mod memory;

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::lock::CacheLock;
use crate::settings::CacheSettings;
use crate::sync::{rw_read, rw_write};

use memory::MemoryTier;

const SOURCE: &str = "store";
/// Separator between the serialized header block and the body.
pub const HEADER_SEPARATOR: &[u8] = b"<!--headers-->";
pub(crate) const ACCESS_FILE: &str = ".htaccess";
const ACCESS_FILE_BODY: &str = "Order allow,deny\nDeny from all\n";
const NOT_FOUND_CANONICAL: &str = "not-found.html";
pub(crate) const NOT_FOUND_INDEX: &str = ".404-index";
const NOT_FOUND_STATUS: u16 = 404;

/// How 404 responses are de-duplicated against the canonical blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundMode {
    /// Symlink every 404 path to the canonical entry.
    Symlink,
    /// Record 404 paths in an on-disk indirection index; for filesystems
    /// without symlink support.
    Index,
    /// Store every 404 as an ordinary entry.
    Off,
}

/// A rendered response handed to the engine for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct PageContent {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A cached response ready for replay. Headers are de-duplicated and
/// `Last-Modified` is dropped; the caller must terminate the request with
/// exactly this body.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPage {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHead {
    status: u16,
    headers: Vec<(String, String)>,
}

/// Hook invoked on the body before it is serialized to disk, e.g. an HTML
/// compressor. The processed body is what gets stored, mirrored, and
/// returned to the caller for delivery.
pub type PostProcessHook = dyn Fn(&Bytes) -> Bytes + Send + Sync;

/// Filesystem-backed entry store with an optional in-memory tier in front.
pub struct DiskStore {
    root: PathBuf,
    max_age: Duration,
    nonce_max_age: Duration,
    nonce_markers: Vec<String>,
    check_freshness: bool,
    not_found_mode: NotFoundMode,
    not_found_index: RwLock<HashSet<String>>,
    memory: MemoryTier,
    lock: Arc<CacheLock>,
    post_process: Option<Box<PostProcessHook>>,
}

impl DiskStore {
    pub fn new(settings: &CacheSettings, lock: Arc<CacheLock>) -> Result<Self, CacheError> {
        let root = settings.cache_root.clone();
        let not_found_index = match settings.not_found.mode {
            NotFoundMode::Index => load_not_found_index(&root)?,
            _ => HashSet::new(),
        };

        Ok(Self {
            root,
            max_age: settings.max_age()?,
            nonce_max_age: settings.nonce_max_age()?,
            nonce_markers: settings.nonce_markers.clone(),
            check_freshness: settings.check_freshness,
            not_found_mode: settings.not_found.mode,
            not_found_index: RwLock::new(not_found_index),
            memory: MemoryTier::new(&settings.memory),
            lock,
            post_process: None,
        })
    }

    /// Register the body post-processing hook invoked before each write.
    pub fn set_post_process<F>(&mut self, hook: F)
    where
        F: Fn(&Bytes) -> Bytes + Send + Sync + 'static,
    {
        self.post_process = Some(Box::new(hook));
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    /// Look up a fresh entry: memory tier first, then disk.
    pub fn read(&self, cache_path: &str) -> Result<Option<CachedPage>, CacheError> {
        let absolute = self.resolve(cache_path)?;

        if let Some(entry) = self.memory.get(&MemoryTier::key_for(&absolute)) {
            counter!("scorta_cache_memory_hit_total").increment(1);
            debug!(cache_path, tier = "memory", outcome = "hit", "serving cached entry");
            return Ok(Some(CachedPage {
                status: entry.status,
                headers: replay_headers(&entry.headers),
                body: entry.body,
            }));
        }

        let indexed_not_found = self.not_found_mode == NotFoundMode::Index
            && rw_read(&self.not_found_index, SOURCE, "read").contains(cache_path);
        let target = if indexed_not_found {
            self.root.join(NOT_FOUND_CANONICAL)
        } else {
            absolute
        };

        let metadata = match fs::metadata(&target) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                counter!("scorta_cache_disk_miss_total").increment(1);
                debug!(cache_path, outcome = "miss", "no cache entry on disk");
                return Ok(None);
            }
            Err(err) => {
                return Err(CacheError::storage_io(
                    format!("cannot stat cache entry {cache_path}"),
                    err,
                ));
            }
        };

        let age = entry_age(&metadata, cache_path)?;
        if self.check_freshness && age > self.max_age {
            counter!("scorta_cache_disk_miss_total").increment(1);
            debug!(cache_path, outcome = "miss", age_secs = age.as_secs(), "entry is stale");
            return Ok(None);
        }

        let blob = fs::read(&target).map_err(|err| {
            CacheError::storage_io(format!("cannot read cache entry {cache_path}"), err)
        })?;
        let Some((head, body)) = split_entry(&blob) else {
            warn!(cache_path, "corrupt cache entry; treating as miss");
            counter!("scorta_cache_disk_miss_total").increment(1);
            return Ok(None);
        };

        // Nonce-bearing bodies expire on the stricter window regardless of
        // the configured max-age and of the freshness switch.
        if self.is_nonce_sensitive(&body) && age > self.nonce_max_age {
            counter!("scorta_cache_disk_miss_total").increment(1);
            debug!(cache_path, outcome = "miss", "nonce-sensitive entry is stale");
            return Ok(None);
        }

        counter!("scorta_cache_disk_hit_total").increment(1);
        debug!(cache_path, tier = "disk", outcome = "hit", "serving cached entry");
        Ok(Some(CachedPage {
            status: head.status,
            headers: replay_headers(&head.headers),
            body: Bytes::from(body),
        }))
    }

    /// Persist an entry atomically and mirror it into the memory tier.
    ///
    /// Returns the (possibly post-processed) body. A storage failure here
    /// must never block delivery of the freshly rendered response: the
    /// caller still holds the body it passed in, and the error exists for
    /// operator visibility.
    pub fn write(&self, cache_path: &str, page: &PageContent) -> Result<Bytes, CacheError> {
        let guard = self.lock.acquire()?;
        let result = self.write_locked(cache_path, page);
        guard.release();
        result
    }

    fn write_locked(&self, cache_path: &str, page: &PageContent) -> Result<Bytes, CacheError> {
        let absolute = self.resolve(cache_path)?;
        self.ensure_directories(&absolute)?;

        if page.status == NOT_FOUND_STATUS && self.not_found_mode != NotFoundMode::Off {
            return self.write_not_found(cache_path, &absolute, page);
        }

        let processed = match &self.post_process {
            Some(hook) => hook(&page.body),
            None => page.body.clone(),
        };
        let blob = encode_entry(page.status, &page.headers, &processed)?;
        self.persist_atomically(&absolute, &blob)?;

        let ttl = if self.is_nonce_sensitive(&processed) {
            self.nonce_max_age
        } else {
            self.max_age
        };
        self.memory.put(
            MemoryTier::key_for(&absolute),
            page.status,
            page.headers.clone(),
            processed.clone(),
            ttl,
        );

        counter!("scorta_cache_write_total").increment(1);
        debug!(cache_path, bytes = processed.len(), "cache entry written");
        Ok(processed)
    }

    fn write_not_found(
        &self,
        cache_path: &str,
        absolute: &Path,
        page: &PageContent,
    ) -> Result<Bytes, CacheError> {
        let canonical = self.root.join(NOT_FOUND_CANONICAL);
        if !canonical.exists() {
            let blob = encode_entry(page.status, &page.headers, &page.body)?;
            self.persist_atomically(&canonical, &blob)?;
        }

        match self.not_found_mode {
            NotFoundMode::Symlink => {
                match fs::remove_file(absolute) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(CacheError::storage_io(
                            format!("cannot replace cache entry {cache_path} with 404 link"),
                            err,
                        ));
                    }
                }
                let target = relative_canonical_target(&self.root, absolute)?;
                make_symlink(&target, absolute).map_err(|err| {
                    CacheError::storage_io(
                        format!("cannot link {cache_path} to canonical 404 entry"),
                        err,
                    )
                })?;
            }
            NotFoundMode::Index => {
                let inserted = rw_write(&self.not_found_index, SOURCE, "write_not_found")
                    .insert(cache_path.to_string());
                if inserted {
                    append_not_found_index(&self.root, cache_path)?;
                }
            }
            NotFoundMode::Off => {}
        }

        counter!("scorta_cache_not_found_dedup_total").increment(1);
        debug!(cache_path, "404 entry de-duplicated against canonical blob");
        Ok(page.body.clone())
    }

    fn persist_atomically(&self, target: &Path, blob: &[u8]) -> Result<(), CacheError> {
        let parent = target
            .parent()
            .ok_or_else(|| CacheError::storage("cache path has no parent directory"))?;

        let mut staged = tempfile::Builder::new()
            .suffix("-tmp")
            .tempfile_in(parent)
            .map_err(|err| CacheError::storage_io("cannot stage cache entry", err))?;
        staged
            .write_all(blob)
            .and_then(|()| staged.flush())
            .map_err(|err| CacheError::storage_io("cannot write staged cache entry", err))?;
        staged.persist(target).map_err(|err| {
            CacheError::storage_io(
                format!("cannot publish cache entry {}", target.display()),
                err.error,
            )
        })?;
        Ok(())
    }

    fn ensure_directories(&self, absolute: &Path) -> Result<(), CacheError> {
        let parent = absolute
            .parent()
            .ok_or_else(|| CacheError::storage("cache path has no parent directory"))?;
        fs::create_dir_all(parent).map_err(|err| {
            CacheError::storage_io(
                format!("cannot create cache directory {}", parent.display()),
                err,
            )
        })?;

        // Deny-all access file at the root and every directory down to the
        // entry's parent.
        let mut dir = self.root.clone();
        self.ensure_access_file(&dir)?;
        if let Ok(relative) = parent.strip_prefix(&self.root) {
            for component in relative.components() {
                dir.push(component);
                self.ensure_access_file(&dir)?;
            }
        }
        Ok(())
    }

    fn ensure_access_file(&self, dir: &Path) -> Result<(), CacheError> {
        let path = dir.join(ACCESS_FILE);
        if path.exists() {
            return Ok(());
        }
        fs::write(&path, ACCESS_FILE_BODY).map_err(|err| {
            CacheError::storage_io(format!("cannot write access file {}", path.display()), err)
        })
    }

    fn is_nonce_sensitive(&self, body: &[u8]) -> bool {
        self.nonce_markers
            .iter()
            .any(|marker| !marker.is_empty() && contains_subslice(body, marker.as_bytes()))
    }

    /// Re-read bulk-managed state after an invalidation may have removed it
    /// out from under us: the memory tier is keyed by hashed disk paths, and
    /// the 404 index file may be gone.
    pub(crate) fn refresh_after_bulk(&self) {
        self.memory.clear();
        let reloaded = load_not_found_index(&self.root).unwrap_or_default();
        *rw_write(&self.not_found_index, SOURCE, "refresh_after_bulk") = reloaded;
    }

    /// Resolve a cache path below the root, rejecting traversal.
    fn resolve(&self, cache_path: &str) -> Result<PathBuf, CacheError> {
        let relative = Path::new(cache_path);
        if cache_path.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(CacheError::storage(format!(
                "invalid cache path: {cache_path:?}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn entry_age(metadata: &fs::Metadata, cache_path: &str) -> Result<Duration, CacheError> {
    let modified = metadata.modified().map_err(|err| {
        CacheError::storage_io(format!("cannot read mtime of cache entry {cache_path}"), err)
    })?;
    // A clock step backwards reads as a fresh entry rather than an error.
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default())
}

fn encode_entry(
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<Vec<u8>, CacheError> {
    let head = serde_json::to_vec(&EntryHead {
        status,
        headers: headers.to_vec(),
    })
    .map_err(|err| CacheError::storage(format!("cannot serialize cache headers: {err}")))?;

    let mut blob = Vec::with_capacity(head.len() + HEADER_SEPARATOR.len() + body.len());
    blob.extend_from_slice(&head);
    blob.extend_from_slice(HEADER_SEPARATOR);
    blob.extend_from_slice(body);
    Ok(blob)
}

fn split_entry(blob: &[u8]) -> Option<(EntryHead, Vec<u8>)> {
    let at = blob
        .windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)?;
    let head: EntryHead = serde_json::from_slice(&blob[..at]).ok()?;
    Some((head, blob[at + HEADER_SEPARATOR.len()..].to_vec()))
}

/// De-duplicate headers by name (first occurrence wins) and drop
/// `Last-Modified`, which would fight the origin's revalidation.
fn replay_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut seen: HashSet<String> = HashSet::new();
    headers
        .iter()
        .filter(|(name, _)| {
            let lowered = name.to_ascii_lowercase();
            lowered != "last-modified" && seen.insert(lowered)
        })
        .cloned()
        .collect()
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack
            .windows(needle.len())
            .any(|window| window == needle)
}

fn load_not_found_index(root: &Path) -> Result<HashSet<String>, CacheError> {
    match fs::read_to_string(root.join(NOT_FOUND_INDEX)) {
        Ok(contents) => Ok(contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(err) => Err(CacheError::storage_io("cannot load 404 index", err)),
    }
}

fn append_not_found_index(root: &Path, cache_path: &str) -> Result<(), CacheError> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join(NOT_FOUND_INDEX))
        .map_err(|err| CacheError::storage_io("cannot open 404 index", err))?;
    writeln!(file, "{cache_path}")
        .map_err(|err| CacheError::storage_io("cannot append to 404 index", err))
}

/// Target for a 404 link, relative to the link's parent directory. Bulk
/// invalidation detaches the tree to a sibling name before sweeping it, so
/// an absolute target would dangle mid-sweep; a relative one stays valid.
fn relative_canonical_target(root: &Path, link: &Path) -> Result<PathBuf, CacheError> {
    let parent = link
        .parent()
        .ok_or_else(|| CacheError::storage("cache path has no parent directory"))?;
    let depth = parent
        .strip_prefix(root)
        .map(|relative| relative.components().count())
        .map_err(|_| {
            CacheError::storage(format!(
                "cache entry {} is outside the cache root",
                link.display()
            ))
        })?;

    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }
    target.push(NOT_FOUND_CANONICAL);
    Ok(target)
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
