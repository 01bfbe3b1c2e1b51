//! The engine facade tying the components together.
//!
//! `PageCache` owns the key builder, the disk store with its memory tier,
//! the directory lock, and the invalidator, and exposes the handful of
//! operations the platform-integration layer consumes. Bulk mutation is
//! also reachable through `CacheAction`, a closed set of named actions for
//! wiring up admin surfaces without handing them arbitrary code to run.

use std::sync::Arc;

use bytes::Bytes;
use regex::Regex;
use tracing::info;

use crate::error::CacheError;
use crate::invalidate::{InvalidationScope, Invalidator};
use crate::key::{CacheKeyBuilder, KeyFlags, sanitize_host};
use crate::lock::{CacheLock, LockGuard};
use crate::memo::MemoTable;
use crate::postload::{PostloadGate, UserTokenResolver};
use crate::settings::CacheSettings;
use crate::store::{CachedPage, DiskStore, PageContent};

/// Callback invoked after a bulk deletion with the number of entries
/// removed. The narrowly scoped replacement for running arbitrary code on
/// cache clears.
pub type OnClearHook = dyn Fn(usize) + Send + Sync;

/// Bulk cache operations as a closed, named set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
    /// Sweep expired entries from the whole tree.
    Purge,
    /// Drop one site's entries, fresh or not.
    ClearSite { host: String },
    /// Drop the whole tree, fresh or not.
    Wipe,
    /// Drop one URL's entry and its paginated/query/user variants.
    InvalidateUrl { url: String },
}

impl CacheAction {
    /// Parse an action by name. Unknown names are rejected, never probed
    /// for.
    pub fn parse(name: &str, argument: Option<&str>) -> Result<Self, CacheError> {
        match name {
            "purge" => Ok(Self::Purge),
            "wipe" => Ok(Self::Wipe),
            "clear_site" => argument
                .map(|host| Self::ClearSite {
                    host: host.to_string(),
                })
                .ok_or_else(|| CacheError::configuration("clear_site requires a host argument")),
            "invalidate_url" => argument
                .map(|url| Self::InvalidateUrl {
                    url: url.to_string(),
                })
                .ok_or_else(|| {
                    CacheError::configuration("invalidate_url requires a url argument")
                }),
            other => Err(CacheError::configuration(format!(
                "unknown cache action: {other:?}"
            ))),
        }
    }
}

/// Full-page cache engine.
pub struct PageCache {
    settings: CacheSettings,
    keys: CacheKeyBuilder,
    store: DiskStore,
    invalidator: Invalidator,
    lock: Arc<CacheLock>,
    memo: MemoTable,
    on_clear: Option<Box<OnClearHook>>,
}

impl PageCache {
    /// Build the engine from validated settings, creating the cache root.
    pub fn new(settings: CacheSettings) -> Result<Self, CacheError> {
        settings.validate()?;
        let lock = Arc::new(CacheLock::new(&settings.locking, &settings.cache_root)?);
        let store = DiskStore::new(&settings, Arc::clone(&lock))?;
        let invalidator = Invalidator::new(&settings, Arc::clone(&lock))?;
        let keys = CacheKeyBuilder::new(settings.base_path.clone());

        info!(
            cache_root = %settings.cache_root.display(),
            enabled = settings.enabled,
            "page cache engine ready"
        );
        Ok(Self {
            settings,
            keys,
            store,
            invalidator,
            lock,
            memo: MemoTable::new(),
            on_clear: None,
        })
    }

    /// Register the domain-mapping collaborator consulted during key
    /// derivation.
    pub fn with_domain_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.keys = self.keys.with_domain_resolver(resolver);
        self
    }

    /// Register the body post-processing hook run before each write.
    pub fn with_post_process<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Bytes) -> Bytes + Send + Sync + 'static,
    {
        self.store.set_post_process(hook);
        self
    }

    /// Register the callback fired after bulk deletions.
    pub fn with_on_clear<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_clear = Some(Box::new(hook));
        self
    }

    /// Reset request-scoped memoization. Call at the start of each request.
    pub fn begin_request(&self) {
        self.memo.reset();
    }

    /// Derive (and memoize) the storage path for a request identity.
    pub fn build_cache_path(&self, url: &str, user_token: &str) -> String {
        self.memo.get_or_insert_with("build_cache_path", &[url, user_token], || {
            self.keys
                .build_cache_path(url, user_token, &self.settings.version_salt, &KeyFlags::DEFAULT)
        })
    }

    /// Build an invalidation regex from a key fragment.
    pub fn build_cache_path_regex(
        &self,
        fragment: &str,
        suffix: Option<&str>,
    ) -> Result<Regex, CacheError> {
        self.keys.build_cache_path_regex(fragment, suffix)
    }

    /// Look up a fresh cached page for a request identity.
    pub fn lookup(&self, url: &str, user_token: &str) -> Result<Option<CachedPage>, CacheError> {
        if !self.settings.enabled {
            return Ok(None);
        }
        let cache_path = self.build_cache_path(url, user_token);
        if cache_path.is_empty() {
            return Ok(None);
        }
        self.store.read(&cache_path)
    }

    /// Persist a rendered page for a request identity. Returns the stored
    /// (possibly post-processed) body, or `None` when the identity is not
    /// cacheable or the engine is disabled.
    pub fn store_page(
        &self,
        url: &str,
        user_token: &str,
        page: &PageContent,
    ) -> Result<Option<Bytes>, CacheError> {
        if !self.settings.enabled {
            return Ok(None);
        }
        let cache_path = self.build_cache_path(url, user_token);
        if cache_path.is_empty() {
            return Ok(None);
        }
        self.store.write(&cache_path, page).map(Some)
    }

    /// Read an entry by its storage path.
    pub fn read(&self, cache_path: &str) -> Result<Option<CachedPage>, CacheError> {
        self.store.read(cache_path)
    }

    /// Write an entry by its storage path.
    pub fn write(&self, cache_path: &str, page: &PageContent) -> Result<Bytes, CacheError> {
        self.store.write(cache_path, page)
    }

    /// Take the directory lock, for callers composing multi-step bulk
    /// mutations of their own.
    pub fn lock(&self) -> Result<LockGuard, CacheError> {
        self.lock.acquire()
    }

    /// Delete every entry matching a derived pattern.
    pub fn delete_matching(
        &self,
        pattern: &Regex,
        scope: &InvalidationScope,
        check_max_age_only: bool,
    ) -> Result<usize, CacheError> {
        let removed = self
            .invalidator
            .delete_matching(pattern, scope, check_max_age_only)?;
        self.after_bulk(removed);
        Ok(removed)
    }

    /// Sweep expired entries from the whole tree.
    pub fn purge(&self) -> Result<usize, CacheError> {
        let removed = self.invalidator.purge()?;
        self.after_bulk(removed);
        Ok(removed)
    }

    /// Drop one host's entries under both schemes.
    pub fn clear_host(&self, host: &str) -> Result<usize, CacheError> {
        let removed = self.invalidator.clear_host(&sanitize_host(host))?;
        self.after_bulk(removed);
        Ok(removed)
    }

    /// Drop the whole tree.
    pub fn wipe(&self) -> Result<usize, CacheError> {
        let removed = self.invalidator.wipe()?;
        self.after_bulk(removed);
        Ok(removed)
    }

    /// Drop one URL's entry together with its `/index`, paginated,
    /// comment-page, query, user, and version variants, under both schemes.
    pub fn invalidate_url(&self, url: &str) -> Result<usize, CacheError> {
        let flags = KeyFlags {
            include_scheme: false,
            ..KeyFlags::FRAGMENT
        };
        let fragment = self
            .keys
            .build_cache_path(url, "", "", &flags);
        if fragment.is_empty() {
            return Ok(0);
        }
        let pattern = self.keys.build_cache_path_regex(&format!("*/{fragment}"), None)?;
        self.delete_matching(&pattern, &InvalidationScope::WholeTree, false)
    }

    /// Run a named bulk action.
    pub fn apply(&self, action: &CacheAction) -> Result<usize, CacheError> {
        match action {
            CacheAction::Purge => self.purge(),
            CacheAction::ClearSite { host } => self.clear_host(host),
            CacheAction::Wipe => self.wipe(),
            CacheAction::InvalidateUrl { url } => self.invalidate_url(url),
        }
    }

    /// Start a deferred visitor-variant evaluation for one request.
    pub fn postload_gate<'a>(&'a self, resolver: &'a dyn UserTokenResolver) -> PostloadGate<'a> {
        PostloadGate::new(
            &self.keys,
            &self.store,
            &self.invalidator,
            &self.settings.postload,
            &self.settings.version_salt,
            resolver,
        )
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn after_bulk(&self, removed: usize) {
        // A sweep may have taken bookkeeping files the count does not
        // reflect, so the store state is refreshed unconditionally.
        self.store.refresh_after_bulk();
        if let Some(hook) = &self.on_clear {
            hook(removed);
        }
    }
}
