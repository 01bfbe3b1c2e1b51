//! Regex-driven bulk invalidation of the cache tree.
//!
//! A bulk operation takes the directory lock, renames the target directory to
//! a uniquely named sibling, walks the renamed tree children-first deleting
//! whatever matches, and renames it back. The rename is the atomicity
//! boundary: concurrent readers miss (and fall through to live generation)
//! rather than observing a half-deleted tree. If a writer re-created the
//! original path during the walk, the rename back degrades to a merge.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::CacheError;
use crate::lock::CacheLock;
use crate::settings::CacheSettings;
use crate::store::{ACCESS_FILE, NOT_FOUND_INDEX};

/// Pattern matching every cache-root-relative path. Directory entries are
/// only ever removed under this pattern.
pub const MATCH_ALL_PATTERN: &str = "(?i)^.*$";

static MATCH_ALL: Lazy<Regex> = Lazy::new(|| {
    // The pattern is a crate constant; it always compiles.
    Regex::new(MATCH_ALL_PATTERN).expect("match-all pattern")
});

pub fn match_all() -> &'static Regex {
    &MATCH_ALL
}

/// Which slice of the tree a bulk operation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    /// The whole cache root.
    WholeTree,
    /// Both scheme directories of one host.
    HostSubtree(String),
}

/// Bulk deletion over the on-disk cache tree.
pub struct Invalidator {
    root: PathBuf,
    max_age: Duration,
    lock: Arc<CacheLock>,
}

impl Invalidator {
    pub fn new(settings: &CacheSettings, lock: Arc<CacheLock>) -> Result<Self, CacheError> {
        Ok(Self {
            root: settings.cache_root.clone(),
            max_age: settings.max_age()?,
            lock,
        })
    }

    /// Delete every entry whose cache-root-relative path matches `pattern`.
    ///
    /// With `check_max_age_only` set, matching entries survive while still
    /// fresh; this is the "purge expired" mode. Returns the number of entries
    /// removed.
    pub fn delete_matching(
        &self,
        pattern: &Regex,
        scope: &InvalidationScope,
        check_max_age_only: bool,
    ) -> Result<usize, CacheError> {
        let guard = self.lock.acquire()?;
        let result = self.delete_matching_locked(pattern, scope, check_max_age_only);
        guard.release();

        if let Ok(removed) = &result {
            counter!("scorta_cache_invalidated_total").increment(*removed as u64);
            info!(
                pattern = pattern.as_str(),
                scope = ?scope,
                check_max_age_only,
                removed,
                "bulk invalidation finished"
            );
        }
        result
    }

    /// Sweep the whole tree of expired entries.
    pub fn purge(&self) -> Result<usize, CacheError> {
        self.delete_matching(match_all(), &InvalidationScope::WholeTree, true)
    }

    /// Drop every entry below one host, fresh or not.
    pub fn clear_host(&self, host: &str) -> Result<usize, CacheError> {
        self.delete_matching(
            match_all(),
            &InvalidationScope::HostSubtree(host.to_string()),
            false,
        )
    }

    /// Drop the entire tree, fresh or not.
    pub fn wipe(&self) -> Result<usize, CacheError> {
        self.delete_matching(match_all(), &InvalidationScope::WholeTree, false)
    }

    fn delete_matching_locked(
        &self,
        pattern: &Regex,
        scope: &InvalidationScope,
        check_max_age_only: bool,
    ) -> Result<usize, CacheError> {
        let targets: Vec<(PathBuf, String)> = match scope {
            InvalidationScope::WholeTree => vec![(self.root.clone(), String::new())],
            InvalidationScope::HostSubtree(host) => ["http", "https"]
                .iter()
                .map(|scheme| {
                    (
                        self.root.join(scheme).join(host),
                        format!("{scheme}/{host}/"),
                    )
                })
                .collect(),
        };

        let mut removed = 0;
        for (original, prefix) in targets {
            if !original.exists() {
                continue;
            }
            removed += self.sweep_directory(&original, &prefix, pattern, check_max_age_only)?;
        }
        Ok(removed)
    }

    /// Detach one directory, delete matching entries inside it, reattach.
    fn sweep_directory(
        &self,
        original: &Path,
        prefix: &str,
        pattern: &Regex,
        check_max_age_only: bool,
    ) -> Result<usize, CacheError> {
        let detached = sibling_tmp_name(original)?;
        fs::rename(original, &detached).map_err(|err| {
            CacheError::storage_io(
                format!("cannot detach {} for invalidation", original.display()),
                err,
            )
        })?;

        let outcome = self.sweep_detached(&detached, prefix, pattern, check_max_age_only);
        // Reattach even when the sweep failed partway; whatever survived
        // must come back under the original path.
        restore_tree(&detached, original)?;
        outcome
    }

    fn sweep_detached(
        &self,
        detached: &Path,
        prefix: &str,
        pattern: &Regex,
        check_max_age_only: bool,
    ) -> Result<usize, CacheError> {
        let delete_directories = !check_max_age_only && pattern.as_str() == MATCH_ALL_PATTERN;
        let mut removed = 0;

        for entry in WalkDir::new(detached)
            .min_depth(1)
            .follow_links(false)
            .contents_first(true)
        {
            let entry = entry.map_err(|err| {
                CacheError::storage(format!("cannot walk cache tree: {err}"))
            })?;
            let relative = relative_key(entry.path(), detached, prefix);
            if !pattern.is_match(&relative) {
                continue;
            }

            let file_type = entry.file_type();
            if file_type.is_symlink() || file_type.is_file() {
                if check_max_age_only && self.is_fresh(entry.path()) {
                    continue;
                }
                fs::remove_file(entry.path()).map_err(|err| {
                    CacheError::storage_io(
                        format!("cannot remove cache entry {relative}"),
                        err,
                    )
                })?;
                // Access files and the 404 index are bookkeeping, not cache
                // entries; they are swept but never counted.
                let name = entry.file_name();
                if name != ACCESS_FILE && name != NOT_FOUND_INDEX {
                    debug!(cache_path = %relative, "cache entry invalidated");
                    removed += 1;
                }
            } else if file_type.is_dir() {
                if delete_directories {
                    fs::remove_dir(entry.path()).map_err(|err| {
                        CacheError::storage_io(
                            format!("cannot remove cache directory {relative}"),
                            err,
                        )
                    })?;
                }
            } else {
                return Err(CacheError::storage(format!(
                    "unexpected entry type in cache tree: {relative}"
                )));
            }
        }
        Ok(removed)
    }

    /// Freshness by mtime; unreadable entries count as stale. Follows
    /// symlinks, so a link is as fresh as its target.
    fn is_fresh(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| std::time::SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age <= self.max_age)
    }
}

fn relative_key(path: &Path, base: &Path, prefix: &str) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let mut key = String::from(prefix);
    for (index, component) in relative.components().enumerate() {
        if index > 0 {
            key.push('/');
        }
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}

fn sibling_tmp_name(original: &Path) -> Result<PathBuf, CacheError> {
    let parent = original
        .parent()
        .ok_or_else(|| CacheError::storage("invalidation target has no parent directory"))?;
    let name = original
        .file_name()
        .ok_or_else(|| CacheError::storage("invalidation target has no file name"))?
        .to_string_lossy();
    Ok(parent.join(format!("{name}-{}-tmp", Uuid::new_v4())))
}

/// Rename the detached tree back into place. When the original path was
/// re-created during the sweep, merge the survivors underneath it; entries
/// written concurrently win over detached ones.
fn restore_tree(detached: &Path, original: &Path) -> Result<(), CacheError> {
    if fs::rename(detached, original).is_ok() {
        return Ok(());
    }
    if !original.exists() {
        return Err(CacheError::storage(format!(
            "cannot reattach invalidated tree at {}",
            original.display()
        )));
    }

    warn!(
        target = %original.display(),
        "cache directory re-created during invalidation; merging survivors"
    );
    merge_children(detached, original)?;
    if let Err(err) = fs::remove_dir_all(detached) {
        warn!(error = %err, "could not remove leftover invalidation directory");
    }
    Ok(())
}

fn merge_children(from: &Path, into: &Path) -> Result<(), CacheError> {
    let entries = fs::read_dir(from).map_err(|err| {
        CacheError::storage_io(format!("cannot read {}", from.display()), err)
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| {
            CacheError::storage_io(format!("cannot read {}", from.display()), err)
        })?;
        let source = entry.path();
        let target = into.join(entry.file_name());
        if !target.exists() {
            fs::rename(&source, &target).map_err(|err| {
                CacheError::storage_io(
                    format!("cannot merge {} into {}", source.display(), target.display()),
                    err,
                )
            })?;
        } else if source.is_dir() && target.is_dir() {
            merge_children(&source, &target)?;
        }
        // A concurrently re-created file shadows the detached one.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::SystemTime;

    use super::*;
    use crate::settings::LockSettings;

    fn invalidator(root: &Path, max_age: &str) -> Invalidator {
        let settings = CacheSettings {
            cache_root: root.to_path_buf(),
            max_age: max_age.to_string(),
            ..Default::default()
        };
        let lock = Arc::new(
            CacheLock::new(&LockSettings::default(), root).expect("lock setup"),
        );
        Invalidator::new(&settings, lock).expect("invalidator setup")
    }

    fn seed(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, b"entry").expect("seed entry");
    }

    fn backdate(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).expect("open entry");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    #[test]
    fn wipe_empties_the_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(dir.path(), "http/example-com/index.html");
        seed(dir.path(), "http/example-com/blog/post.html");
        seed(dir.path(), "https/example-com/index.html");

        let invalidator = invalidator(dir.path(), "1h");
        assert_eq!(invalidator.wipe().expect("wipe"), 3);

        assert!(dir.path().exists());
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn pattern_only_removes_matching_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(dir.path(), "http/example-com/blog/hello.html");
        seed(dir.path(), "http/example-com/blog/hello/page/2.html");
        seed(dir.path(), "http/example-com/about.html");

        let pattern = Regex::new("(?i)^http/example-com/blog/hello(?:/.*)?(?:\\.html)?$")
            .expect("pattern");
        let invalidator = invalidator(dir.path(), "1h");
        let removed = invalidator
            .delete_matching(&pattern, &InvalidationScope::WholeTree, false)
            .expect("delete");

        assert_eq!(removed, 2);
        assert!(!dir.path().join("http/example-com/blog/hello.html").exists());
        assert!(!dir.path().join("http/example-com/blog/hello/page/2.html").exists());
        assert!(dir.path().join("http/example-com/about.html").exists());
    }

    #[test]
    fn host_scope_spans_both_schemes_and_spares_other_hosts() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(dir.path(), "http/one-com/index.html");
        seed(dir.path(), "https/one-com/index.html");
        seed(dir.path(), "http/two-com/index.html");

        let invalidator = invalidator(dir.path(), "1h");
        assert_eq!(invalidator.clear_host("one-com").expect("clear"), 2);

        assert!(!dir.path().join("http/one-com/index.html").exists());
        assert!(!dir.path().join("https/one-com/index.html").exists());
        assert!(dir.path().join("http/two-com/index.html").exists());
    }

    #[test]
    fn purge_spares_fresh_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(dir.path(), "http/example-com/fresh.html");
        seed(dir.path(), "http/example-com/stale.html");
        backdate(
            &dir.path().join("http/example-com/stale.html"),
            Duration::from_secs(7200),
        );

        let invalidator = invalidator(dir.path(), "1h");
        assert_eq!(invalidator.purge().expect("purge"), 1);

        assert!(dir.path().join("http/example-com/fresh.html").exists());
        assert!(!dir.path().join("http/example-com/stale.html").exists());
        // Directories survive a purge.
        assert!(dir.path().join("http/example-com").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn purge_follows_symlinks_to_judge_freshness() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(dir.path(), "not-found.html");
        seed(dir.path(), "http/example-com/a.html");
        // Links carry relative targets, matching how the store writes them;
        // they must stay resolvable while the tree is detached.
        std::os::unix::fs::symlink(
            "../../not-found.html",
            dir.path().join("http/example-com/missing.html"),
        )
        .expect("symlink");
        std::os::unix::fs::symlink(
            "../../does-not-exist.html",
            dir.path().join("http/example-com/broken.html"),
        )
        .expect("broken symlink");

        let invalidator = invalidator(dir.path(), "1h");
        let removed = invalidator.purge().expect("purge");

        // Only the broken symlink goes; its target reads as stale.
        assert_eq!(removed, 1);
        assert!(
            dir.path()
                .join("http/example-com/missing.html")
                .symlink_metadata()
                .is_ok()
        );
        assert!(
            dir.path()
                .join("http/example-com/broken.html")
                .symlink_metadata()
                .is_err()
        );
    }

    #[cfg(unix)]
    #[test]
    fn unexpected_entry_type_is_a_storage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(dir.path(), "http/example-com/index.html");
        std::os::unix::net::UnixListener::bind(dir.path().join("http/example-com/stray.sock"))
            .expect("socket");

        let invalidator = invalidator(dir.path(), "1h");
        assert!(matches!(
            invalidator.wipe(),
            Err(CacheError::Storage { .. })
        ));
    }

    #[test]
    fn bookkeeping_files_are_swept_but_not_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(dir.path(), "http/example-com/index.html");
        fs::write(dir.path().join(ACCESS_FILE), b"deny").expect("access file");
        fs::write(dir.path().join("http").join(ACCESS_FILE), b"deny").expect("access file");
        fs::write(dir.path().join(NOT_FOUND_INDEX), b"").expect("index file");

        let invalidator = invalidator(dir.path(), "1h");
        assert_eq!(invalidator.wipe().expect("wipe"), 1);
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn restore_merges_into_a_recreated_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let detached = dir.path().join("tree-detached-tmp");
        let original = dir.path().join("tree");

        fs::create_dir_all(detached.join("sub")).expect("mkdir");
        fs::write(detached.join("survivor.html"), b"old").expect("seed");
        fs::write(detached.join("sub/nested.html"), b"old").expect("seed");
        fs::write(detached.join("contested.html"), b"old").expect("seed");

        fs::create_dir_all(&original).expect("recreate");
        fs::write(original.join("contested.html"), b"new").expect("seed");

        restore_tree(&detached, &original).expect("restore");

        assert!(!detached.exists());
        assert_eq!(fs::read(original.join("survivor.html")).expect("read"), b"old");
        assert_eq!(fs::read(original.join("sub/nested.html")).expect("read"), b"old");
        assert_eq!(fs::read(original.join("contested.html")).expect("read"), b"new");
    }
}
