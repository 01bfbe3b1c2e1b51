//! In-memory tier in front of the disk store.
//!
//! Entries are keyed by a digest of the absolute disk path and carry a TTL
//! mirroring the applicable disk freshness window. The memory tier is never
//! authoritative; disk remains the source of truth and the tier is simply
//! repopulated on the next write after a miss.

use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::settings::MemorySettings;
use crate::sync::rw_write;

const SOURCE: &str = "store::memory";

/// Ephemeral copy of a cache entry.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    stored_at: Instant,
    ttl: Duration,
}

impl MemoryEntry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() <= self.ttl
    }
}

/// LRU cache of recently written entries, shared within one process.
pub struct MemoryTier {
    enabled: bool,
    max_body_bytes: usize,
    entries: RwLock<LruCache<String, MemoryEntry>>,
}

impl MemoryTier {
    pub fn new(settings: &MemorySettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_body_bytes: settings.max_body_bytes,
            entries: RwLock::new(LruCache::new(settings.entry_limit_non_zero())),
        }
    }

    /// Key derivation: digest of the absolute disk path.
    pub fn key_for(absolute_path: &Path) -> String {
        hex::encode(Sha256::digest(
            absolute_path.as_os_str().as_encoded_bytes(),
        ))
    }

    /// Fetch a fresh entry; expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<MemoryEntry> {
        if !self.enabled {
            return None;
        }
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        match entries.get(key) {
            Some(entry) if entry.is_fresh() => Some(entry.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Mirror a written entry. Oversized bodies are skipped rather than
    /// evicting many smaller entries.
    pub fn put(
        &self,
        key: String,
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
        ttl: Duration,
    ) {
        if !self.enabled {
            return;
        }
        if body.len() > self.max_body_bytes {
            debug!(
                body_bytes = body.len(),
                limit = self.max_body_bytes,
                "skipping memory mirror for oversized body"
            );
            return;
        }
        let entry = MemoryEntry {
            status,
            headers,
            body,
            stored_at: Instant::now(),
            ttl,
        };
        rw_write(&self.entries, SOURCE, "put").put(key, entry);
    }

    pub fn invalidate(&self, key: &str) {
        rw_write(&self.entries, SOURCE, "invalidate").pop(key);
    }

    /// Drop every mirrored entry. Bulk invalidation calls this since its
    /// regex operates on disk paths, not memory keys.
    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        rw_write(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
